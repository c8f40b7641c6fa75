//! Process Runner: executes external commands with no shell interpolation,
//! captures stderr on failure, and renders a human-readable error carrying
//! `(argv, exit_code, stderr_tail)`.
//!
//! Every invocation is logged at debug level before it runs, and failures
//! come back as a typed [`DarchError`] rather than an untyped report.

use std::path::Path;
use std::process::{Command, Output, Stdio};

use tracing::debug;

use crate::error::{DarchError, Result};

const STDERR_TAIL_LINES: usize = 40;

/// Options controlling a single command invocation.
#[derive(Debug, Clone, Copy)]
pub struct RunOpts {
	/// Fail with `ExternalCommandFailed` on non-zero exit.
	pub check: bool,
	/// Capture stdout and return it (otherwise it is inherited to the
	/// parent's stdout so the user sees interleaved build output live).
	pub capture: bool,
}

impl RunOpts {
	#[must_use]
	pub const fn checked() -> Self {
		Self { check: true, capture: false }
	}

	#[must_use]
	pub const fn checked_capture() -> Self {
		Self { check: true, capture: true }
	}
}

/// Runs `argv[0]` with the remaining elements as arguments. Never invokes a
/// shell. Stdin is always `/dev/null`-equivalent so an interactive prompt
/// from a misbehaving tool cannot hang the build.
pub fn run(argv: &[&str], opts: RunOpts) -> Result<Output> {
	assert!(!argv.is_empty(), "run() requires a non-empty argv");
	debug!(argv = ?argv, "running command");

	let mut cmd = Command::new(argv[0]);
	cmd.args(&argv[1..]);
	cmd.stdin(Stdio::null());
	if opts.capture {
		cmd.stdout(Stdio::piped());
	}
	cmd.stderr(Stdio::piped());

	let output = cmd.output()?;
	check_output(argv, &output, opts.check)?;
	Ok(output)
}

/// Runs a command inside a chroot at `root`, via `tiffin::Container`, which
/// performs the `chroot(2)`/`chdir("/")` dance for us.
pub fn chroot_run(root: &Path, argv: &[&str], opts: RunOpts) -> Result<Output> {
	assert!(!argv.is_empty(), "chroot_run() requires a non-empty argv");
	debug!(?root, argv = ?argv, "running command in chroot");

	let root = root.to_path_buf();
	let argv_owned: Vec<String> = argv.iter().map(|s| (*s).to_string()).collect();
	let result = tiffin::Container::new(root).run(move || -> Result<Output> {
		let argv: Vec<&str> = argv_owned.iter().map(String::as_str).collect();
		run(&argv, opts)
	});

	// tiffin::run returns io::Result<R>; R here is our own Result<Output>.
	result.map_err(DarchError::Io)?
}

fn check_output(argv: &[&str], output: &Output, check: bool) -> Result<()> {
	if output.status.success() || !check {
		return Ok(());
	}
	let stderr = String::from_utf8_lossy(&output.stderr);
	let stderr_tail: String =
		stderr.lines().rev().take(STDERR_TAIL_LINES).collect::<Vec<_>>().into_iter().rev().collect::<Vec<_>>().join("\n");
	Err(DarchError::ExternalCommandFailed {
		argv: argv.iter().map(|s| (*s).to_string()).collect(),
		code: output.status.code(),
		stderr_tail,
	})
}
