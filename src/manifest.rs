//! Manifest Codec and the Configuration/Manifest data model.
//!
//! The Manifest is the JSON projection of a Configuration, written to
//! `config.json` at a generation's root; its mere presence is the
//! completion marker. Sets and maps use `BTreeSet`/`BTreeMap` so
//! "serialized sorted" is a structural property of the type rather than a
//! post-processing step on a `serde_json::Value`, and unknown keys are
//! rejected (`deny_unknown_fields`) to catch schema drift early.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DarchError, Result};

/// Bumped whenever a breaking change is made to the persisted schema.
/// `parse` rejects any manifest whose version it does not understand;
/// the alternative (silently coercing) would let a future incompatible
/// generation's `config.json` be misread as valid.
pub const SCHEMA_VERSION: u32 = 1;

/// The content of a declared file. Text content round-trips as UTF-8;
/// arbitrary binary content is kept byte-exact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum FileContent {
	Text(String),
	Bytes(Vec<u8>),
}

/// A single declared file: content plus its Unix permission bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileEntry {
	pub content: FileContent,
	pub mode: u32,
}

/// The optional single declared user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserSpec {
	pub name: String,
	#[serde(default)]
	pub shell: Option<String>,
	#[serde(default)]
	pub groups: BTreeSet<String>,
	#[serde(default)]
	pub uid: Option<u32>,
}

/// The declarative Configuration, and (with the same shape) the
/// persisted Manifest (`config.json`). Equality is structural over the
/// sorted/normalized representation, which falls out of using `BTreeSet`/
/// `BTreeMap` rather than `Vec`/`HashMap` for the set- and map-valued
/// fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
	pub schema_version: u32,
	pub name: String,
	#[serde(default)]
	pub packages: BTreeSet<String>,
	#[serde(default)]
	pub files: BTreeMap<PathBuf, FileEntry>,
	#[serde(default)]
	pub symlinks: BTreeMap<PathBuf, PathBuf>,
	#[serde(default)]
	pub services: BTreeSet<String>,
	#[serde(default)]
	pub hostname: Option<String>,
	#[serde(default)]
	pub timezone: Option<String>,
	#[serde(default)]
	pub locale: Option<String>,
	#[serde(default)]
	pub user: Option<UserSpec>,
	#[serde(default)]
	pub initramfs_modules: Vec<String>,
	#[serde(default)]
	pub initramfs_hooks: Vec<String>,
}

/// `Configuration` is the in-memory value produced by the external
/// `configure()` script; it has exactly the Manifest's shape before being
/// persisted, so the two are the same Rust type.
pub type Configuration = Manifest;

impl Manifest {
	/// Parses strict JSON into a Manifest. Unknown keys, a missing/
	/// unsupported `schema_version`, or malformed JSON all produce
	/// `ManifestInvalid`.
	pub fn parse(bytes: &[u8], source: &Path) -> Result<Self> {
		let manifest: Self = serde_json::from_slice(bytes)
			.map_err(|e| DarchError::ManifestInvalid { path: source.to_path_buf(), reason: e.to_string() })?;
		if manifest.schema_version != SCHEMA_VERSION {
			return Err(DarchError::ManifestInvalid {
				path: source.to_path_buf(),
				reason: format!(
					"unsupported schema_version {} (this build of darch understands {SCHEMA_VERSION})",
					manifest.schema_version
				),
			});
		}
		Ok(manifest)
	}

	/// Loads and parses `config.json` (or any manifest file) from disk.
	pub fn load(path: &Path) -> Result<Self> {
		let bytes = fs::read(path)?;
		Self::parse(&bytes, path)
	}

	/// Stable JSON: sorted keys (structural, via `BTreeMap`/`BTreeSet`),
	/// fixed two-space indentation, trailing newline.
	pub fn serialize(&self) -> Result<Vec<u8>> {
		let mut buf = serde_json::to_vec_pretty(self).map_err(|e| DarchError::InvariantViolation(format!("manifest failed to serialize: {e}")))?;
		buf.push(b'\n');
		Ok(buf)
	}

	/// Atomically writes this manifest to `path`: write to `<path>.tmp`,
	/// `fsync`, then `rename` over `path`. This is what turns "a generation
	/// exists" into "a generation is complete": the rename is the one
	/// filesystem operation in the whole engine that must never be partially
	/// observed, which is exactly what `rename(2)` on the same filesystem
	/// guarantees.
	pub fn write_atomic(&self, path: &Path) -> Result<()> {
		let bytes = self.serialize()?;
		let tmp_path = tmp_sibling(path);
		{
			let mut tmp = File::create(&tmp_path)?;
			tmp.write_all(&bytes)?;
			tmp.sync_all()?;
		}
		fs::rename(&tmp_path, path)?;
		Ok(())
	}
}

fn tmp_sibling(path: &Path) -> PathBuf {
	let mut os = path.as_os_str().to_owned();
	os.push(".tmp");
	PathBuf::from(os)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample() -> Manifest {
		let mut packages = BTreeSet::new();
		packages.insert("vim".to_owned());
		packages.insert("base".to_owned());
		let mut files = BTreeMap::new();
		files.insert(
			PathBuf::from("/etc/motd"),
			FileEntry { content: FileContent::Text("welcome\n".to_owned()), mode: 0o644 },
		);
		Manifest {
			schema_version: SCHEMA_VERSION,
			name: "vm".to_owned(),
			packages,
			files,
			symlinks: BTreeMap::new(),
			services: BTreeSet::new(),
			hostname: Some("vm".to_owned()),
			timezone: None,
			locale: None,
			user: None,
			initramfs_modules: vec![],
			initramfs_hooks: vec![],
		}
	}

	#[test]
	fn round_trip_law() {
		let m = sample();
		let bytes = m.serialize().unwrap();
		let parsed = Manifest::parse(&bytes, Path::new("<test>")).unwrap();
		assert_eq!(m, parsed);
	}

	#[test]
	fn serialized_packages_are_sorted() {
		let m = sample();
		let bytes = m.serialize().unwrap();
		let text = String::from_utf8(bytes).unwrap();
		let base_pos = text.find("base").unwrap();
		let vim_pos = text.find("vim").unwrap();
		assert!(base_pos < vim_pos, "packages must serialize in sorted order");
	}

	#[test]
	fn unknown_fields_are_rejected() {
		let bad = br#"{"schema_version":1,"name":"vm","bogus_field":true}"#;
		let err = Manifest::parse(bad, Path::new("<test>")).unwrap_err();
		assert!(matches!(err, DarchError::ManifestInvalid { .. }));
	}

	#[test]
	fn unsupported_schema_version_is_rejected() {
		let bad = br#"{"schema_version":99,"name":"vm"}"#;
		let err = Manifest::parse(bad, Path::new("<test>")).unwrap_err();
		assert!(matches!(err, DarchError::ManifestInvalid { .. }));
	}

	#[test]
	fn write_atomic_leaves_no_tmp_file_behind() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.json");
		sample().write_atomic(&path).unwrap();
		assert!(path.exists());
		assert!(!tmp_sibling(&path).exists());
		let reloaded = Manifest::load(&path).unwrap();
		assert_eq!(reloaded, sample());
	}
}
