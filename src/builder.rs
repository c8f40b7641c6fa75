//! Builder: the two build modes (fresh, incremental) that turn a
//! Configuration into a new, complete generation.
//!
//! A small trait ([`PackageManager`]) abstracts the one truly external
//! collaborator (the package manager) behind an interface the Builder
//! drives, so a test double can stand in without shelling out to a real
//! `pacman`. Mount/chroot acquisition goes through
//! [`crate::fsops::ScopeStack`] rather than a single scoped closure,
//! because a build interleaves several independently-torn-down mounts.

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::diff::Diff;
use crate::error::{DarchError, Result};
use crate::fsops::{ChrootPrep, MountGuard, ScopeStack};
use crate::manifest::{FileContent, FileEntry, Manifest};
use crate::process::{self, RunOpts};
use crate::subvolume;

/// The one genuinely external collaborator the Builder drives: a package
/// manager capable of bootstrapping a root tree, then installing/removing/
/// upgrading packages within it. It is treated as an opaque tool invoked
/// with deterministic argument ordering; this trait is the seam that lets
/// tests supply a fake instead of shelling out to a real `pacman`.
pub trait PackageManager {
	fn bootstrap(&self, root: &Path, packages: &BTreeSet<String>) -> Result<()>;
	fn install(&self, root: &Path, packages: &[String]) -> Result<()>;
	/// Removes `packages` with cascading-orphan semantics. If the package
	/// manager refuses because of remaining dependents, this returns
	/// `ExternalCommandFailed` and the build fails: no safelist, no silent
	/// partial removal.
	fn remove(&self, root: &Path, packages: &[String]) -> Result<()>;
	fn upgrade_all(&self, root: &Path) -> Result<()>;
}

/// The real `pacman`/`pacstrap` backed implementation.
#[derive(Debug, Default)]
pub struct Pacman;

impl PackageManager for Pacman {
	fn bootstrap(&self, root: &Path, packages: &BTreeSet<String>) -> Result<()> {
		let root_str = path_to_str(root)?;
		let mut argv = vec!["pacstrap", "-c", root_str];
		argv.extend(packages.iter().map(String::as_str));
		process::run(&argv, RunOpts::checked())?;
		Ok(())
	}

	fn install(&self, root: &Path, packages: &[String]) -> Result<()> {
		if packages.is_empty() {
			return Ok(());
		}
		let root_str = path_to_str(root)?;
		let mut argv = vec!["pacman", "--root", root_str, "--noconfirm", "-S"];
		argv.extend(packages.iter().map(String::as_str));
		process::run(&argv, RunOpts::checked())?;
		Ok(())
	}

	fn remove(&self, root: &Path, packages: &[String]) -> Result<()> {
		if packages.is_empty() {
			return Ok(());
		}
		let root_str = path_to_str(root)?;
		// -Rns: recursive, no-save (drop now-unneeded config), remove
		// unused dependencies (cascading-orphan semantics).
		let mut argv = vec!["pacman", "--root", root_str, "--noconfirm", "-Rns"];
		argv.extend(packages.iter().map(String::as_str));
		process::run(&argv, RunOpts::checked())?;
		Ok(())
	}

	fn upgrade_all(&self, root: &Path) -> Result<()> {
		let root_str = path_to_str(root)?;
		process::run(&["pacman", "--root", root_str, "--noconfirm", "-Syu"], RunOpts::checked())?;
		Ok(())
	}
}

fn path_to_str(path: &Path) -> Result<&str> {
	path.to_str().ok_or_else(|| DarchError::InvariantViolation(format!("path is not valid UTF-8: {}", path.display())))
}

/// Options carried through from the CLI (`apply --rebuild --upgrade`).
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
	pub force_fresh: bool,
	pub full_upgrade: bool,
}

/// Packages the bootstrap tool installs unconditionally, before any
/// user-declared package is considered. Excluded from `packages_to_add` on
/// a fresh build.
fn bootstrap_base_packages() -> BTreeSet<String> {
	["base", "linux", "btrfs-progs"].iter().map(|s| (*s).to_string()).collect()
}

/// Runs a fresh or incremental build depending on whether a complete
/// predecessor generation exists (or `options.force_fresh`). Returns the
/// number of the newly-built, now-complete generation.
pub fn build(
	images: &Path, pkg_mgr: &dyn PackageManager, host_pkg_cache: &Path, var_subvol: &Path, config: &Manifest, options: BuildOptions,
) -> Result<u32> {
	let predecessor = if options.force_fresh { None } else { current_complete_generation(images)? };
	match predecessor {
		Some(p) => incremental_build(images, pkg_mgr, host_pkg_cache, var_subvol, p, config, options),
		None => fresh_build(images, pkg_mgr, host_pkg_cache, var_subvol, config, options),
	}
}

/// The highest-numbered complete generation, if any: the predecessor an
/// incremental build snapshots from.
pub fn current_complete_generation(images: &Path) -> Result<Option<u32>> {
	let generations = subvolume::list_generations(images)?;
	Ok(generations.into_iter().filter(|g| g.complete).map(|g| g.number).max())
}

fn fresh_build(
	images: &Path, pkg_mgr: &dyn PackageManager, host_pkg_cache: &Path, var_subvol: &Path, config: &Manifest, options: BuildOptions,
) -> Result<u32> {
	let number = subvolume::next_number(images)?;
	info!(number, "starting fresh build");
	let gen_root = subvolume::create(images, number)?;

	let mut scope = ScopeStack::new();
	let result = (|| -> Result<()> {
		scope.push(Box::new(MountGuard::bind_mount(host_pkg_cache, &gen_root.join("var/cache/pacman/pkg"))?));

		let base = bootstrap_base_packages();
		pkg_mgr.bootstrap(&gen_root, &base)?;

		relocate_pacman_state(&gen_root)?;
		create_self_symlink(&gen_root)?;
		mount_persistent_var(&gen_root, var_subvol, &mut scope)?;

		let chroot_prep = ChrootPrep::prepare(&gen_root, host_pkg_cache)?;
		scope.push(Box::new(chroot_prep));

		configure_identity(&gen_root, config)?;

		let diff = Diff::for_fresh_build(config, &base);
		if !diff.packages_to_add.is_empty() {
			pkg_mgr.install(&gen_root, &diff.packages_to_add)?;
		}
		if options.full_upgrade {
			pkg_mgr.upgrade_all(&gen_root)?;
		}
		apply_files(&gen_root, &diff.files_to_write, &[])?;
		apply_symlinks(&gen_root, &diff.symlinks_to_create, &[])?;
		apply_services(&gen_root, &diff.services_to_enable, &diff.services_to_disable)?;
		regenerate_initramfs(&gen_root)?;
		install_bootloader(&gen_root)?;
		apply_user(&gen_root, config)?;
		Ok(())
	})();

	let warnings = scope.unwind();
	for w in warnings {
		warn!(error = %w, "non-fatal teardown issue during fresh build");
	}
	result?;

	config.write_atomic(&gen_root.join("config.json"))?;
	info!(number, "fresh build complete");
	Ok(number)
}

fn incremental_build(
	images: &Path, pkg_mgr: &dyn PackageManager, host_pkg_cache: &Path, var_subvol: &Path, predecessor: u32, config: &Manifest,
	options: BuildOptions,
) -> Result<u32> {
	let number = subvolume::next_number(images)?;
	info!(number, predecessor, "starting incremental build");
	let gen_root = subvolume::snapshot(images, predecessor, number)?;

	let old_config_path = gen_root.join("config.json");
	let old_manifest = Manifest::load(&old_config_path)?;
	let prev_marker = gen_root.join("config.json.prev");
	fs::rename(&old_config_path, &prev_marker)?;

	let mut scope = ScopeStack::new();
	let result = (|| -> Result<()> {
		scope.push(Box::new(MountGuard::bind_mount(host_pkg_cache, &gen_root.join("var/cache/pacman/pkg"))?));
		mount_persistent_var(&gen_root, var_subvol, &mut scope)?;

		let chroot_prep = ChrootPrep::prepare(&gen_root, host_pkg_cache)?;
		scope.push(Box::new(chroot_prep));

		let diff = Diff::compute(&old_manifest, config);

		apply_symlinks(&gen_root, &[], &diff.symlinks_to_delete)?;
		apply_files(&gen_root, &[], &diff.files_to_delete)?;

		if !diff.packages_to_remove.is_empty() {
			pkg_mgr.remove(&gen_root, &diff.packages_to_remove)?;
		}
		if !diff.packages_to_add.is_empty() {
			pkg_mgr.install(&gen_root, &diff.packages_to_add)?;
		}
		if options.full_upgrade {
			pkg_mgr.upgrade_all(&gen_root)?;
		}

		if diff.identity_changed {
			configure_identity(&gen_root, config)?;
		}

		apply_files(&gen_root, &diff.files_to_write, &[])?;
		apply_symlinks(&gen_root, &diff.symlinks_to_create, &[])?;
		apply_services(&gen_root, &diff.services_to_enable, &diff.services_to_disable)?;

		if diff.needs_initramfs {
			regenerate_initramfs(&gen_root)?;
		}
		Ok(())
	})();

	let warnings = scope.unwind();
	for w in warnings {
		warn!(error = %w, "non-fatal teardown issue during incremental build");
	}
	result?;

	fs::remove_file(&prev_marker)?;
	config.write_atomic(&gen_root.join("config.json"))?;
	info!(number, "incremental build complete");
	Ok(number)
}

/// Moves the bootstrap tool's pacman state directory out of `/var` (which
/// will shortly be replaced by the `@var` mount) into the generation root
/// itself, so package-database state travels with the immutable
/// generation rather than the shared persistent `/var`.
fn relocate_pacman_state(gen_root: &Path) -> Result<()> {
	let from = gen_root.join("var/lib/pacman");
	let to = gen_root.join("pacman");
	if from.exists() {
		fs::rename(&from, &to)?;
	}
	Ok(())
}

/// `<root>/current -> .`: the self-reference every generation carries so
/// the fragile `../../../current/pacman` relative symlink can exit `@var`,
/// cross back into whichever generation is currently mounted, and reach
/// `/pacman`, regardless of that generation's number.
fn create_self_symlink(gen_root: &Path) -> Result<()> {
	let link = gen_root.join("current");
	if fs::symlink_metadata(&link).is_ok() {
		fs::remove_file(&link)?;
	}
	symlink(".", &link)?;
	Ok(())
}

/// Removes `<root>/var` (persistent `@var` will be mounted here at
/// runtime), mounts the persistent `@var` subvolume, and relinks
/// `var/lib/pacman` to the relocated, generation-local pacman state via a
/// fixed relative path. This path depends on `/var` being exactly three
/// directory levels below `/`, which FHS guarantees; it must be preserved
/// exactly or the symlink resolves to nothing.
fn mount_persistent_var(gen_root: &Path, var_subvol: &Path, scope: &mut ScopeStack) -> Result<()> {
	let var_dir = gen_root.join("var");
	if var_dir.exists() {
		fs::remove_dir_all(&var_dir)?;
	}
	let guard = MountGuard::bind_mount(var_subvol, &var_dir)?;
	scope.push(Box::new(guard));

	let pacman_link = var_dir.join("lib/pacman");
	fs::create_dir_all(var_dir.join("lib"))?;
	if fs::symlink_metadata(&pacman_link).is_ok() {
		fs::remove_file(&pacman_link)?;
	}
	symlink("../../../current/pacman", &pacman_link)?;
	Ok(())
}

/// Identity configuration (hostname, timezone/hwclock, locale), run inside
/// the chroot via the Process Runner's `chroot_run`.
fn configure_identity(gen_root: &Path, config: &Manifest) -> Result<()> {
	if let Some(hostname) = &config.hostname {
		fs::write(gen_root.join("etc/hostname"), format!("{hostname}\n"))?;
	}
	if let Some(timezone) = &config.timezone {
		let zoneinfo = PathBuf::from("/usr/share/zoneinfo").join(timezone);
		let link = gen_root.join("etc/localtime");
		if fs::symlink_metadata(&link).is_ok() {
			fs::remove_file(&link)?;
		}
		symlink(zoneinfo, &link)?;
		process::chroot_run(gen_root, &["hwclock", "--systohc"], RunOpts::checked())?;
	}
	if let Some(locale) = &config.locale {
		fs::write(gen_root.join("etc/locale.conf"), format!("LANG={locale}\n"))?;
		process::chroot_run(gen_root, &["locale-gen"], RunOpts::checked())?;
	}
	Ok(())
}

fn regenerate_initramfs(gen_root: &Path) -> Result<()> {
	process::chroot_run(gen_root, &["mkinitcpio", "-P"], RunOpts::checked())?;
	Ok(())
}

fn install_bootloader(gen_root: &Path) -> Result<()> {
	process::chroot_run(gen_root, &["grub-install", "--target=x86_64-efi", "--efi-directory=/efi", "--bootloader-id=darch"], RunOpts::checked())?;
	Ok(())
}

/// Writes/deletes declared files relative to the generation root. Deletes
/// run before writes at each call site so a removed symlink can never
/// shadow a newly-written regular file at the same path.
fn apply_files(gen_root: &Path, to_write: &[(PathBuf, FileEntry)], to_delete: &[PathBuf]) -> Result<()> {
	for path in to_delete {
		let target = join_declared_path(gen_root, path);
		if fs::symlink_metadata(&target).is_ok() {
			fs::remove_file(&target)?;
		}
	}
	for (path, entry) in to_write {
		let target = join_declared_path(gen_root, path);
		if let Some(parent) = target.parent() {
			fs::create_dir_all(parent)?;
		}
		write_file_atomic(&target, entry)?;
	}
	Ok(())
}

fn write_file_atomic(target: &Path, entry: &FileEntry) -> Result<()> {
	let tmp = {
		let mut os = target.as_os_str().to_owned();
		os.push(".darch-tmp");
		PathBuf::from(os)
	};
	let bytes: Vec<u8> = match &entry.content {
		FileContent::Text(s) => s.as_bytes().to_vec(),
		FileContent::Bytes(b) => b.clone(),
	};
	fs::write(&tmp, bytes)?;
	fs::set_permissions(&tmp, std::os::unix::fs::PermissionsExt::from_mode(entry.mode))?;
	fs::rename(&tmp, target)?;
	Ok(())
}

fn apply_symlinks(gen_root: &Path, to_create: &[(PathBuf, PathBuf)], to_delete: &[PathBuf]) -> Result<()> {
	for path in to_delete {
		let target = join_declared_path(gen_root, path);
		if fs::symlink_metadata(&target).is_ok() {
			fs::remove_file(&target)?;
		}
	}
	for (path, link_target) in to_create {
		let target = join_declared_path(gen_root, path);
		if let Some(parent) = target.parent() {
			fs::create_dir_all(parent)?;
		}
		if fs::symlink_metadata(&target).is_ok() {
			fs::remove_file(&target)?;
		}
		symlink(link_target, &target)?;
	}
	Ok(())
}

fn apply_services(gen_root: &Path, to_enable: &[String], to_disable: &[String]) -> Result<()> {
	for service in to_disable {
		process::chroot_run(gen_root, &["systemctl", "disable", service.as_str()], RunOpts { check: false, capture: false })?;
	}
	for service in to_enable {
		process::chroot_run(gen_root, &["systemctl", "enable", service.as_str()], RunOpts::checked())?;
	}
	Ok(())
}

fn apply_user(gen_root: &Path, config: &Manifest) -> Result<()> {
	let Some(user) = &config.user else { return Ok(()) };
	let mut argv: Vec<String> = vec!["useradd".to_owned(), "-m".to_owned()];
	if let Some(shell) = &user.shell {
		argv.push("-s".to_owned());
		argv.push(shell.clone());
	}
	if let Some(uid) = user.uid {
		argv.push("-u".to_owned());
		argv.push(uid.to_string());
	}
	if !user.groups.is_empty() {
		argv.push("-G".to_owned());
		argv.push(user.groups.iter().cloned().collect::<Vec<_>>().join(","));
	}
	argv.push(user.name.clone());
	let argv_ref: Vec<&str> = argv.iter().map(String::as_str).collect();
	process::chroot_run(gen_root, &argv_ref, RunOpts::checked())?;
	Ok(())
}

/// Declared paths are absolute (`/etc/motd`); joined onto the generation
/// root they must have the leading slash stripped or `Path::join` would
/// discard the root entirely.
fn join_declared_path(gen_root: &Path, declared: &Path) -> PathBuf {
	match declared.strip_prefix("/") {
		Ok(relative) => gen_root.join(relative),
		Err(_) => gen_root.join(declared),
	}
}
