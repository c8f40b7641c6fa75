//! Subvolume Manager: create, snapshot, delete, and enumerate btrfs
//! subvolumes under `<images>`, by shelling out to `btrfs subvolume *`
//! rather than linking against libbtrfs.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{DarchError, Result};
use crate::manifest::Manifest;
use crate::process::{self, RunOpts};

/// A single generation on disk: `<images>/gen-N`.
#[derive(Debug, Clone)]
pub struct Generation {
	pub number: u32,
	pub complete: bool,
	pub manifest: Option<Manifest>,
	pub created_at: DateTime<Utc>,
}

impl Generation {
	#[must_use]
	pub fn path(&self, images: &Path) -> PathBuf {
		gen_path(images, self.number)
	}

	/// Age since creation, used by the Garbage Collector.
	#[must_use]
	pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
		now.signed_duration_since(self.created_at)
	}
}

#[must_use]
pub fn gen_path(images: &Path, number: u32) -> PathBuf {
	images.join(format!("gen-{number}"))
}

const GEN_PREFIX: &str = "gen-";

fn parse_gen_number(file_name: &str) -> Option<u32> {
	file_name.strip_prefix(GEN_PREFIX)?.parse().ok()
}

/// Enumerates every `gen-N` entry under `<images>`, sorted ascending by
/// number. Reads `config.json` for each complete generation.
pub fn list_generations(images: &Path) -> Result<Vec<Generation>> {
	let mut generations = Vec::new();
	if !images.exists() {
		return Ok(generations);
	}
	for entry in std::fs::read_dir(images)? {
		let entry = entry?;
		let file_name = entry.file_name();
		let Some(file_name) = file_name.to_str() else { continue };
		let Some(number) = parse_gen_number(file_name) else { continue };
		let path = entry.path();
		let created_at = entry.metadata()?.created().map_or_else(|_| Utc::now(), DateTime::<Utc>::from);

		let config_path = path.join("config.json");
		let (complete, manifest) = if config_path.exists() {
			match Manifest::load(&config_path) {
				Ok(m) => (true, Some(m)),
				Err(e) => {
					// Present but unparseable is not "complete" either; a
					// corrupt file cannot serve as a completion marker, so
					// treat it as incomplete and let the next GC reap it.
					tracing::warn!(?config_path, error = %e, "config.json present but unparseable; treating generation as incomplete");
					(false, None)
				},
			}
		} else {
			(false, None)
		};

		generations.push(Generation { number, complete, manifest, created_at });
	}
	generations.sort_by_key(|g| g.number);
	Ok(generations)
}

/// `1 + max(existing numbers)`, or `1` if none exist.
pub fn next_number(images: &Path) -> Result<u32> {
	let generations = list_generations(images)?;
	Ok(generations.iter().map(|g| g.number).max().map_or(1, |n| n + 1))
}

/// Creates a fresh, empty subvolume at `<images>/gen-N`.
pub fn create(images: &Path, number: u32) -> Result<PathBuf> {
	let path = gen_path(images, number);
	if path.exists() {
		// Leftover from a crashed build; permitted to delete because an
		// incomplete generation has no stable contract.
		info!(?path, "removing leftover subvolume before create");
		delete(images, number)?;
	}
	info!(?path, "creating subvolume");
	process::run(&["btrfs", "subvolume", "create", path.to_str().ok_or_else(|| non_utf8_path(&path))?], RunOpts::checked())?;
	Ok(path)
}

/// Creates a writable snapshot `gen-N` of `gen-P`.
pub fn snapshot(images: &Path, src_number: u32, dst_number: u32) -> Result<PathBuf> {
	let src = gen_path(images, src_number);
	let dst = gen_path(images, dst_number);
	if dst.exists() {
		info!(?dst, "removing leftover subvolume before snapshot");
		delete(images, dst_number)?;
	}
	info!(?src, ?dst, "snapshotting subvolume");
	process::run(
		&[
			"btrfs",
			"subvolume",
			"snapshot",
			src.to_str().ok_or_else(|| non_utf8_path(&src))?,
			dst.to_str().ok_or_else(|| non_utf8_path(&dst))?,
		],
		RunOpts::checked(),
	)?;
	Ok(dst)
}

/// Deletes `gen-N`. Idempotent: a missing subvolume is treated as success.
pub fn delete(images: &Path, number: u32) -> Result<()> {
	let path = gen_path(images, number);
	if !path.exists() {
		debug!(?path, "subvolume already absent, delete is a no-op");
		return Ok(());
	}
	info!(?path, "deleting subvolume");
	process::run(&["btrfs", "subvolume", "delete", path.to_str().ok_or_else(|| non_utf8_path(&path))?], RunOpts::checked())?;
	Ok(())
}

fn non_utf8_path(path: &Path) -> DarchError {
	DarchError::InvariantViolation(format!("path is not valid UTF-8: {}", path.display()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_gen_number_accepts_only_well_formed_names() {
		assert_eq!(parse_gen_number("gen-1"), Some(1));
		assert_eq!(parse_gen_number("gen-42"), Some(42));
		assert_eq!(parse_gen_number("gen-"), None);
		assert_eq!(parse_gen_number("gen-abc"), None);
		assert_eq!(parse_gen_number("not-a-gen"), None);
	}

	#[test]
	fn next_number_is_one_when_empty() {
		let dir = tempfile::tempdir().unwrap();
		assert_eq!(next_number(dir.path()).unwrap(), 1);
	}

	#[test]
	fn next_number_is_max_plus_one() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::create_dir(dir.path().join("gen-1")).unwrap();
		std::fs::create_dir(dir.path().join("gen-3")).unwrap();
		std::fs::create_dir(dir.path().join("gen-2")).unwrap();
		assert_eq!(next_number(dir.path()).unwrap(), 4);
	}

	#[test]
	fn list_generations_sorted_ascending_and_flags_completeness() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::create_dir(dir.path().join("gen-2")).unwrap();
		std::fs::create_dir(dir.path().join("gen-1")).unwrap();
		std::fs::write(dir.path().join("gen-1/config.json"), br#"{"schema_version":1,"name":"vm","packages":[],"files":{},"symlinks":{},"services":[],"hostname":null,"timezone":null,"locale":null,"user":null,"initramfs_modules":[],"initramfs_hooks":[]}"#).unwrap();

		let gens = list_generations(dir.path()).unwrap();
		assert_eq!(gens.iter().map(|g| g.number).collect::<Vec<_>>(), vec![1, 2]);
		assert!(gens[0].complete);
		assert!(!gens[1].complete);
	}
}
