//! The error taxonomy of the build engine.
//!
//! Every fallible operation in this crate eventually produces a
//! [`DarchError`]. The top-level CLI driver maps each variant to a process
//! exit code: 1 user error, 2 lock contention, 3 external-tool failure, 4
//! internal invariant violation.

use std::path::PathBuf;

/// The closed set of failure kinds the build engine can produce.
///
/// A typed taxonomy (rather than an ad hoc `color_eyre::eyre!(...)` report
/// at every call site) lets the CLI compute an exit code without
/// string-matching error messages.
#[derive(thiserror::Error, Debug)]
pub enum DarchError {
	/// Another process already holds the build lock.
	#[error("another darch build is already running (lock held at {lockfile})")]
	AlreadyRunning { lockfile: PathBuf },

	/// A required external tool or filesystem path is missing.
	#[error("missing prerequisite: {what}")]
	MissingPrerequisite { what: String },

	/// A child process exited non-zero.
	#[error("command failed: {} (exit {})\n--- stderr (tail) ---\n{stderr_tail}", render_argv(argv), code.map_or_else(|| "signal".to_owned(), |c| c.to_string()))]
	ExternalCommandFailed { argv: Vec<String>, code: Option<i32>, stderr_tail: String },

	/// `config.json` exists but failed to parse under the strict schema.
	#[error("manifest at {path} is invalid: {reason}")]
	ManifestInvalid { path: PathBuf, reason: String },

	/// An internal bookkeeping invariant was violated (generation numbering,
	/// completion-marker protocol, etc). This should never happen in
	/// correctly-functioning code; seeing it means a bug, not user error.
	#[error("internal invariant violated: {0}")]
	InvariantViolation(String),

	/// A scoped resource failed to release during teardown. Never the
	/// primary error: always attached as a warning alongside whatever error
	/// (if any) triggered the unwind.
	#[error("failed to release {resource}: {source}")]
	PartialReleaseWarning { resource: String, #[source] source: Box<dyn std::error::Error + Send + Sync> },

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

fn render_argv(argv: &[String]) -> String {
	argv.iter().map(|a| format!("{a:?}")).collect::<Vec<_>>().join(" ")
}

impl DarchError {
	/// Maps a failure to its process exit code.
	#[must_use]
	pub const fn exit_code(&self) -> i32 {
		match self {
			Self::AlreadyRunning { .. } => 2,
			Self::MissingPrerequisite { .. } | Self::ManifestInvalid { .. } | Self::Io(_) => 1,
			Self::ExternalCommandFailed { .. } => 3,
			Self::InvariantViolation(_) => 4,
			// A partial-release warning is logged, never the top-level error;
			// if one somehow does escape to the top we treat it as an
			// internal bug rather than silently succeeding.
			Self::PartialReleaseWarning { .. } => 4,
		}
	}
}

pub type Result<T> = std::result::Result<T, DarchError>;
