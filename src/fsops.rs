//! Filesystem Orchestrator: scoped acquisition of mounts, bind mounts, and
//! chroot-preparation contexts with guaranteed LIFO teardown.
//!
//! A build layers several mounts independently of chroot entry (host cache
//! bind, `@var` mount, `/dev` `/proc` `/sys` `/run` binds), and they must be
//! torn down in the exact reverse order regardless of which step failed.
//! Relying on destructor order of local bindings breaks down once guards
//! are pushed conditionally across `?`-early-return branches, so acquired
//! resources go onto an explicit [`ScopeStack`] of trait objects instead.

use std::fmt;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use tracing::{debug, warn};

use crate::error::{DarchError, Result};

/// A resource acquired within a build that must be released, in LIFO order,
/// on every exit path.
pub trait Scoped: fmt::Debug {
	/// Releases the resource. Called at most once. A failure here is
	/// reported to the caller of [`ScopeStack::unwind`] as a
	/// `PartialReleaseWarning`, never substituted for whatever real error
	/// triggered the unwind.
	fn release(&mut self) -> Result<()>;

	/// Human-readable name for logging / error messages.
	fn describe(&self) -> String;
}

/// Stack of scoped resources, released in reverse acquisition order.
///
/// The Builder pushes onto this stack as it acquires mounts/chroot binds and
/// calls [`ScopeStack::unwind`] exactly once, on every exit path (it is also
/// released on `Drop` as a backstop for early returns via `?` that forgot
/// to call `unwind` explicitly; every call site in this crate does
/// call it, so the `Drop` path only fires on a genuine bug or panic).
#[derive(Default)]
pub struct ScopeStack {
	resources: Vec<Box<dyn Scoped>>,
}

impl ScopeStack {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, resource: Box<dyn Scoped>) {
		debug!(resource = %resource.describe(), "acquired scoped resource");
		self.resources.push(resource);
	}

	/// Releases every resource, most-recently-acquired first. A release
	/// failure is logged and collected, not propagated; the remaining
	/// releases still run. Returns the collected failures so the caller can
	/// decide whether to surface them (the top-level driver logs them as
	/// `PartialReleaseWarning`s alongside the primary error, if any).
	pub fn unwind(&mut self) -> Vec<DarchError> {
		let mut warnings = Vec::new();
		while let Some(mut resource) = self.resources.pop() {
			let name = resource.describe();
			if let Err(e) = resource.release() {
				warn!(resource = %name, error = %e, "failed to release scoped resource");
				warnings.push(DarchError::PartialReleaseWarning {
					resource: name,
					source: Box::new(std::io::Error::other(e.to_string())),
				});
			} else {
				debug!(resource = %name, "released scoped resource");
			}
		}
		warnings
	}
}

impl fmt::Debug for ScopeStack {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ScopeStack").field("depth", &self.resources.len()).finish()
	}
}

impl Drop for ScopeStack {
	fn drop(&mut self) {
		if !self.resources.is_empty() {
			let _ = self.unwind();
		}
	}
}

/// A single mount, released by unmounting on scope exit.
#[derive(Debug)]
pub struct MountGuard {
	target: PathBuf,
	label: String,
}

impl MountGuard {
	/// Mounts `source` at `target` with an optional filesystem type and
	/// options string (e.g. `"subvol=@var"`). `target` must already exist.
	pub fn mount(source: &Path, target: &Path, fstype: Option<&str>, options: Option<&str>) -> Result<Self> {
		std::fs::create_dir_all(target)?;
		debug!(?source, ?target, ?fstype, ?options, "mounting");
		mount(Some(source), target, fstype, MsFlags::empty(), options)
			.map_err(|errno| io_err(format!("mount {} -> {}", source.display(), target.display()), errno))?;
		Ok(Self { target: target.to_path_buf(), label: format!("mount {}", target.display()) })
	}

	/// Bind-mounts `source` onto `target` (`mount --bind`).
	pub fn bind_mount(source: &Path, target: &Path) -> Result<Self> {
		std::fs::create_dir_all(target)?;
		debug!(?source, ?target, "bind-mounting");
		mount(Some(source), target, None::<&str>, MsFlags::MS_BIND, None::<&str>)
			.map_err(|errno| io_err(format!("bind-mount {} -> {}", source.display(), target.display()), errno))?;
		Ok(Self { target: target.to_path_buf(), label: format!("bind-mount {}", target.display()) })
	}
}

impl Scoped for MountGuard {
	fn release(&mut self) -> Result<()> {
		umount2(&self.target, MntFlags::MNT_DETACH)
			.map_err(|errno| io_err(format!("unmount {}", self.target.display()), errno))
	}

	fn describe(&self) -> String {
		self.label.clone()
	}
}

/// Binds `/dev`, `/proc`, `/sys`, `/run` from the host into `root`, plus the
/// host package-cache directory into `<root>/var/cache/pacman/pkg`, so
/// package-manager invocations inside the chroot can see devices and share
/// the download cache across builds. All four-or-five binds are released
/// LIFO as a unit when this guard is torn down.
#[derive(Debug)]
pub struct ChrootPrep {
	binds: Vec<MountGuard>,
	root: PathBuf,
}

const CHROOT_BIND_DIRS: &[&str] = &["dev", "proc", "sys", "run"];

impl ChrootPrep {
	pub fn prepare(root: &Path, host_pkg_cache: &Path) -> Result<Self> {
		let mut binds = Vec::with_capacity(CHROOT_BIND_DIRS.len() + 1);
		for dir in CHROOT_BIND_DIRS {
			let source = PathBuf::from("/").join(dir);
			let target = root.join(dir);
			binds.push(MountGuard::bind_mount(&source, &target)?);
		}
		let pkg_cache_target = root.join("var/cache/pacman/pkg");
		binds.push(MountGuard::bind_mount(host_pkg_cache, &pkg_cache_target)?);
		Ok(Self { binds, root: root.to_path_buf() })
	}
}

impl Scoped for ChrootPrep {
	fn release(&mut self) -> Result<()> {
		// LIFO within the composite: unmount pkg-cache first, then run/sys/proc/dev.
		let mut first_err = None;
		while let Some(mut bind) = self.binds.pop() {
			if let Err(e) = bind.release() {
				warn!(bind = %bind.describe(), error = %e, "failed to release chroot bind mount");
				first_err.get_or_insert(e);
			}
		}
		first_err.map_or(Ok(()), Err)
	}

	fn describe(&self) -> String {
		format!("chroot-prep {}", self.root.display())
	}
}

fn io_err(context: String, errno: nix::Error) -> DarchError {
	DarchError::Io(std::io::Error::other(format!("{context}: {errno}")))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Debug)]
	struct FakeResource {
		name: &'static str,
		fail: bool,
		log: std::rc::Rc<std::cell::RefCell<Vec<&'static str>>>,
	}

	impl Scoped for FakeResource {
		fn release(&mut self) -> Result<()> {
			self.log.borrow_mut().push(self.name);
			if self.fail {
				return Err(DarchError::InvariantViolation(format!("{} refused to release", self.name)));
			}
			Ok(())
		}

		fn describe(&self) -> String {
			self.name.to_owned()
		}
	}

	#[test]
	fn unwind_releases_lifo() {
		let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
		let mut stack = ScopeStack::new();
		stack.push(Box::new(FakeResource { name: "a", fail: false, log: log.clone() }));
		stack.push(Box::new(FakeResource { name: "b", fail: false, log: log.clone() }));
		stack.push(Box::new(FakeResource { name: "c", fail: false, log: log.clone() }));

		let warnings = stack.unwind();
		assert!(warnings.is_empty());
		assert_eq!(*log.borrow(), vec!["c", "b", "a"]);
	}

	#[test]
	fn unwind_continues_past_failure() {
		let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
		let mut stack = ScopeStack::new();
		stack.push(Box::new(FakeResource { name: "a", fail: false, log: log.clone() }));
		stack.push(Box::new(FakeResource { name: "b", fail: true, log: log.clone() }));
		stack.push(Box::new(FakeResource { name: "c", fail: false, log: log.clone() }));

		let warnings = stack.unwind();
		assert_eq!(warnings.len(), 1);
		// all three still ran despite b's failure
		assert_eq!(*log.borrow(), vec!["c", "b", "a"]);
	}
}
