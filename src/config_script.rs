//! Collaborator interface: invokes the external `configure()` script and
//! parses its stdout as a Configuration.
//!
//! The declarative-config DSL that produces the script itself is out of
//! scope; this module only knows how to run *some* external program and
//! expects it to emit JSON on stdout matching the Manifest schema, the
//! same argv-only invocation discipline as every other external tool this
//! crate shells out to.

use std::path::Path;

use crate::error::Result;
use crate::manifest::{Configuration, Manifest};
use crate::process::{self, RunOpts};

/// Runs `script` (with `args` appended) and parses its stdout as a
/// Configuration. The script's stderr is inherited so collaborator
/// diagnostics reach the operator's terminal live; only stdout is
/// captured and treated as data.
pub fn evaluate(script: &Path, args: &[&str]) -> Result<Configuration> {
	let script_str =
		script.to_str().ok_or_else(|| crate::error::DarchError::InvariantViolation(format!("path is not valid UTF-8: {}", script.display())))?;
	let mut argv = vec![script_str];
	argv.extend(args);
	let output = process::run(&argv, RunOpts::checked_capture())?;
	Manifest::parse(&output.stdout, script)
}

/// Loads a Configuration from `--config <path>`: if the path is itself
/// executable, it is treated as a collaborator script and run via
/// [`evaluate`]; otherwise it is read directly as a persisted Manifest
/// (the common case when a Configuration was produced once and saved).
pub fn load(path: &Path) -> Result<Configuration> {
	let is_executable = std::fs::metadata(path).map(|m| {
		use std::os::unix::fs::PermissionsExt;
		m.permissions().mode() & 0o111 != 0
	})?;
	if is_executable {
		evaluate(path, &[])
	} else {
		Manifest::load(path)
	}
}
