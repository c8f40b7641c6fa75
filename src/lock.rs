//! Lock Manager: a non-blocking, advisory, whole-process exclusive lock
//! guarding one build at a time.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info};

use crate::error::{DarchError, Result};

/// Default lock path. Overridable for testing or for a non-default
/// `<images>` root.
pub const DEFAULT_LOCK_PATH: &str = "/var/lock/darch.lock";

/// RAII guard over the advisory lock. Dropping it releases the lock; this
/// also happens implicitly if the holding process dies (the OS releases
/// `flock`-style advisory locks on process exit), which is what makes the
/// lock survive SIGKILL without our own cleanup code.
#[derive(Debug)]
pub struct LockGuard {
	path: PathBuf,
	file: File,
}

impl LockGuard {
	/// Attempts to acquire the lock at `path`, creating the lock file if it
	/// does not exist. Never blocks: if another process holds it, returns
	/// `AlreadyRunning` naming the lock path so the operator knows what to
	/// inspect (`lsof`, `fuser`, etc).
	pub fn acquire(path: &Path) -> Result<Self> {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let file = OpenOptions::new().create(true).write(true).open(path)?;
		debug!(?path, "attempting to acquire build lock");
		file.try_lock_exclusive().map_err(|_| DarchError::AlreadyRunning { lockfile: path.to_path_buf() })?;
		info!(?path, "build lock acquired");
		Ok(Self { path: path.to_path_buf(), file })
	}

	#[must_use]
	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl Drop for LockGuard {
	fn drop(&mut self) {
		if let Err(e) = FileExt::unlock(&self.file) {
			// Losing the unlock here is harmless: the OS drops the advisory
			// lock when the fd closes a moment later regardless.
			debug!(?e, path = ?self.path, "explicit unlock failed (fd close will release it anyway)");
		} else {
			debug!(path = ?self.path, "build lock released");
		}
	}
}
