//! Diff Engine: the structural delta between two manifests that drives an
//! incremental build.
//!
//! Expressed with `BTreeSet`/`BTreeMap` throughout so the resulting vectors
//! are sorted by construction rather than by an explicit sort step:
//! determinism falls out of the type rather than being a separate pass.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::manifest::{FileEntry, Manifest};

/// Files whose path or content identifies them as kernel/initramfs-related
/// beyond the explicitly-declared `initramfs_modules`/`initramfs_hooks`
/// lists. Kernel package upgrades themselves are handled by the package
/// manager's own post-install hooks; this only covers darch-owned inputs
/// to `mkinitcpio`.
fn is_initramfs_related(path: &Path) -> bool {
	path == Path::new("/etc/mkinitcpio.conf") || path.starts_with("/etc/mkinitcpio.d")
}

/// The structural delta between an optional previous manifest and a new
/// one. Every field is sorted (via `BTreeSet`/`Vec` built from sorted
/// iteration) so it can be handed directly to a package-manager argv or
/// serialized without a further sort pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
	pub packages_to_add: Vec<String>,
	pub packages_to_remove: Vec<String>,
	pub files_to_write: Vec<(PathBuf, FileEntry)>,
	pub files_to_delete: Vec<PathBuf>,
	pub symlinks_to_create: Vec<(PathBuf, PathBuf)>,
	pub symlinks_to_delete: Vec<PathBuf>,
	pub services_to_enable: Vec<String>,
	pub services_to_disable: Vec<String>,
	pub needs_initramfs: bool,
	pub identity_changed: bool,
}

impl Diff {
	/// Computes the diff driving a fresh build: there is no predecessor, so
	/// every file/symlink/service is new. `bootstrap_preinstalled` is the
	/// package set the bootstrap tool (pacstrap-equivalent) already
	/// installed, so it is excluded from `packages_to_add`.
	#[must_use]
	pub fn for_fresh_build(new: &Manifest, bootstrap_preinstalled: &BTreeSet<String>) -> Self {
		Self {
			packages_to_add: new.packages.difference(bootstrap_preinstalled).cloned().collect(),
			packages_to_remove: Vec::new(),
			files_to_write: new.files.iter().map(|(p, e)| (p.clone(), e.clone())).collect(),
			files_to_delete: Vec::new(),
			symlinks_to_create: new.symlinks.iter().map(|(p, t)| (p.clone(), t.clone())).collect(),
			symlinks_to_delete: Vec::new(),
			services_to_enable: new.services.iter().cloned().collect(),
			services_to_disable: Vec::new(),
			needs_initramfs: true,
			identity_changed: true,
		}
	}

	/// Computes the diff driving an incremental build from `old` to `new`.
	#[must_use]
	pub fn compute(old: &Manifest, new: &Manifest) -> Self {
		let packages_to_add = new.packages.difference(&old.packages).cloned().collect();
		let packages_to_remove = old.packages.difference(&new.packages).cloned().collect();

		let files_to_write = new
			.files
			.iter()
			.filter(|(p, e)| old.files.get(*p) != Some(*e))
			.map(|(p, e)| (p.clone(), e.clone()))
			.collect();
		let files_to_delete = old.files.keys().filter(|p| !new.files.contains_key(*p)).cloned().collect();

		let symlinks_to_create = new
			.symlinks
			.iter()
			.filter(|(p, t)| old.symlinks.get(*p) != Some(*t))
			.map(|(p, t)| (p.clone(), t.clone()))
			.collect();
		let symlinks_to_delete = old.symlinks.keys().filter(|p| !new.symlinks.contains_key(*p)).cloned().collect();

		let services_to_enable = new.services.difference(&old.services).cloned().collect();
		let services_to_disable = old.services.difference(&new.services).cloned().collect();

		let initramfs_inputs_changed = old.initramfs_modules != new.initramfs_modules
			|| old.initramfs_hooks != new.initramfs_hooks
			|| new.files.iter().any(|(p, e)| is_initramfs_related(p) && old.files.get(p) != Some(e))
			|| old.files.keys().any(|p| is_initramfs_related(p) && !new.files.contains_key(p));

		let identity_changed =
			old.hostname != new.hostname || old.timezone != new.timezone || old.locale != new.locale || old.user != new.user;

		Self {
			packages_to_add,
			packages_to_remove,
			files_to_write,
			files_to_delete,
			symlinks_to_create,
			symlinks_to_delete,
			services_to_enable,
			services_to_disable,
			needs_initramfs: initramfs_inputs_changed,
			identity_changed,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::manifest::FileContent;
	use std::collections::BTreeMap;

	fn manifest(packages: &[&str]) -> Manifest {
		Manifest {
			schema_version: crate::manifest::SCHEMA_VERSION,
			name: "vm".to_owned(),
			packages: packages.iter().map(|s| (*s).to_owned()).collect(),
			files: BTreeMap::new(),
			symlinks: BTreeMap::new(),
			services: BTreeSet::new(),
			hostname: None,
			timezone: None,
			locale: None,
			user: None,
			initramfs_modules: vec![],
			initramfs_hooks: vec![],
		}
	}

	#[test]
	fn fresh_build_excludes_bootstrap_preinstalled() {
		let new = manifest(&["base", "linux", "vim"]);
		let preinstalled: BTreeSet<String> = ["base", "linux"].iter().map(|s| (*s).to_string()).collect();
		let diff = Diff::for_fresh_build(&new, &preinstalled);
		assert_eq!(diff.packages_to_add, vec!["vim".to_owned()]);
		assert!(diff.packages_to_remove.is_empty());
		assert!(diff.needs_initramfs);
		assert!(diff.identity_changed);
	}

	#[test]
	fn incremental_add_and_remove() {
		let old = manifest(&["base", "linux", "btrfs-progs", "vim"]);
		let new = manifest(&["base", "linux", "btrfs-progs", "htop"]);
		let diff = Diff::compute(&old, &new);
		assert_eq!(diff.packages_to_add, vec!["htop".to_owned()]);
		assert_eq!(diff.packages_to_remove, vec!["vim".to_owned()]);
		assert!(!diff.needs_initramfs);
		assert!(!diff.identity_changed);
	}

	#[test]
	fn file_content_change_is_detected() {
		let mut old = manifest(&["base"]);
		let mut new = manifest(&["base"]);
		old.files.insert(PathBuf::from("/etc/motd"), FileEntry { content: FileContent::Text("old".into()), mode: 0o644 });
		new.files.insert(PathBuf::from("/etc/motd"), FileEntry { content: FileContent::Text("new".into()), mode: 0o644 });
		let diff = Diff::compute(&old, &new);
		assert_eq!(diff.files_to_write.len(), 1);
		assert!(diff.files_to_delete.is_empty());
	}

	#[test]
	fn removed_file_is_deleted_not_rewritten() {
		let mut old = manifest(&["base"]);
		let new = manifest(&["base"]);
		old.files.insert(PathBuf::from("/etc/old.conf"), FileEntry { content: FileContent::Text("x".into()), mode: 0o644 });
		let diff = Diff::compute(&old, &new);
		assert_eq!(diff.files_to_delete, vec![PathBuf::from("/etc/old.conf")]);
		assert!(diff.files_to_write.is_empty());
	}

	#[test]
	fn mkinitcpio_conf_change_sets_needs_initramfs() {
		let mut old = manifest(&["base"]);
		let mut new = manifest(&["base"]);
		old.files.insert(PathBuf::from("/etc/mkinitcpio.conf"), FileEntry { content: FileContent::Text("a".into()), mode: 0o644 });
		new.files.insert(PathBuf::from("/etc/mkinitcpio.conf"), FileEntry { content: FileContent::Text("b".into()), mode: 0o644 });
		let diff = Diff::compute(&old, &new);
		assert!(diff.needs_initramfs);
	}

	#[test]
	fn identity_change_detects_hostname() {
		let mut old = manifest(&["base"]);
		let mut new = manifest(&["base"]);
		old.hostname = Some("a".into());
		new.hostname = Some("b".into());
		assert!(Diff::compute(&old, &new).identity_changed);
	}
}
