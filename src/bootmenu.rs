//! Boot-Menu Generator: emits a boot-loader configuration file that
//! references only complete generations.
//!
//! Rendered via `tera` rather than hand-built string formatting, so the
//! on-disk menu format is reviewable independent of the Rust code that
//! fills it in.

use std::fs;
use std::path::Path;

use serde::Serialize;
use tera::{Context, Tera};
use tracing::info;

use crate::error::{DarchError, Result};
use crate::subvolume::Generation;

const TEMPLATE: &str = include_str!("../templates/grub.cfg.tera");
const TEMPLATE_NAME: &str = "grub.cfg.tera";

/// Filesystem identity the rendered menu needs to locate the btrfs volume
/// at boot.
#[derive(Debug, Clone)]
pub struct VolumeIds {
	pub btrfs_uuid: String,
	pub esp_uuid: String,
}

#[derive(Debug, Serialize)]
struct MenuEntry {
	number: u32,
	kernel_path: String,
	initramfs_path: String,
	is_default: bool,
}

/// Renders the boot menu text for `generations` (any completeness mix;
/// only complete ones are included in the output) without touching disk.
/// Pure and therefore directly testable against the invariant "the boot
/// menu references exactly the complete generations" invariant.
///
/// `default_override`, when `Some`, marks that generation as the default
/// entry regardless of numbering: this is what `darch rollback` uses to
/// boot an older generation by default without deleting anything newer.
/// `None` falls back to the highest-numbered complete generation.
pub fn render(
	generations: &[Generation], volumes: &VolumeIds, distro_name: &str, kernel_cmdline: &str, default_override: Option<u32>,
) -> Result<String> {
	let mut complete: Vec<&Generation> = generations.iter().filter(|g| g.complete).collect();
	complete.sort_by(|a, b| b.number.cmp(&a.number));

	let default_number = default_override.unwrap_or_else(|| complete.first().map_or(0, |g| g.number));

	// GRUB's `set default` takes the 0-based position of a menuentry, not a
	// generation number, so the index of the default entry within this
	// descending list has to travel alongside the per-entry "(default)"
	// label, or rollback only relabels an entry without actually changing
	// what boots.
	let default_index = complete.iter().position(|g| g.number == default_number).unwrap_or(0);

	let entries: Vec<MenuEntry> = complete
		.iter()
		.map(|g| MenuEntry {
			number: g.number,
			kernel_path: format!("/gen-{}/boot/vmlinuz-linux", g.number),
			initramfs_path: format!("/gen-{}/boot/initramfs-linux.img", g.number),
			is_default: g.number == default_number,
		})
		.collect();

	let mut tera = Tera::default();
	tera.add_raw_template(TEMPLATE_NAME, TEMPLATE)
		.map_err(|e| DarchError::InvariantViolation(format!("boot menu template is malformed: {e}")))?;

	let mut ctx = Context::new();
	ctx.insert("btrfs_uuid", &volumes.btrfs_uuid);
	ctx.insert("esp_uuid", &volumes.esp_uuid);
	ctx.insert("distro_name", distro_name);
	ctx.insert("kernel_cmdline", kernel_cmdline);
	ctx.insert("entries", &entries);
	ctx.insert("default_index", &default_index);

	tera.render(TEMPLATE_NAME, &ctx).map_err(|e| DarchError::InvariantViolation(format!("failed to render boot menu: {e}")))
}

/// Renders and atomically writes the boot menu to `cfg_path`
/// (conventionally `/efi/grub/grub.cfg`), via `<cfg_path>.new` → rename.
pub fn regenerate(
	generations: &[Generation], volumes: &VolumeIds, distro_name: &str, kernel_cmdline: &str, default_override: Option<u32>, cfg_path: &Path,
) -> Result<()> {
	let rendered = render(generations, volumes, distro_name, kernel_cmdline, default_override)?;
	let new_path = {
		let mut os = cfg_path.as_os_str().to_owned();
		os.push(".new");
		std::path::PathBuf::from(os)
	};
	if let Some(parent) = cfg_path.parent() {
		fs::create_dir_all(parent)?;
	}
	fs::write(&new_path, rendered)?;
	fs::rename(&new_path, cfg_path)?;
	info!(?cfg_path, "boot menu regenerated");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Utc;

	fn gen(number: u32, complete: bool) -> Generation {
		Generation { number, complete, manifest: None, created_at: Utc::now() }
	}

	fn volumes() -> VolumeIds {
		VolumeIds { btrfs_uuid: "1111-2222".to_owned(), esp_uuid: "3333-4444".to_owned() }
	}

	#[test]
	fn only_complete_generations_are_referenced() {
		let gens = vec![gen(1, true), gen(2, false), gen(3, true)];
		let text = render(&gens, &volumes(), "darch", "", None).unwrap();
		assert!(text.contains("generation 1"));
		assert!(text.contains("generation 3"));
		assert!(!text.contains("generation 2"));
	}

	#[test]
	fn highest_numbered_is_default() {
		let gens = vec![gen(1, true), gen(2, true), gen(3, true)];
		let text = render(&gens, &volumes(), "darch", "", None).unwrap();
		let gen3_entry = text.split("generation 3").nth(1).unwrap();
		assert!(gen3_entry.starts_with(" (default)"));
		// entries are listed descending, so the highest-numbered generation
		// is entry index 0.
		assert!(text.contains("set default=\"0\""));
	}

	#[test]
	fn default_override_picks_an_older_generation() {
		let gens = vec![gen(1, true), gen(2, true), gen(3, true)];
		let text = render(&gens, &volumes(), "darch", "", Some(1)).unwrap();
		let gen1_entry = text.split("generation 1").nth(1).unwrap();
		assert!(gen1_entry.starts_with(" (default)"));
		let gen3_entry = text.split("generation 3").nth(1).unwrap();
		assert!(gen3_entry.starts_with(" (rollback)"));
		// descending order is [3, 2, 1], so generation 1 sits at index 2;
		// `set default` must follow the override, not just the label.
		assert!(text.contains("set default=\"2\""));
	}

	#[test]
	fn default_override_middle_generation_sets_matching_index() {
		let gens = vec![gen(1, true), gen(2, true), gen(3, true)];
		let text = render(&gens, &volumes(), "darch", "", Some(2)).unwrap();
		let gen2_entry = text.split("generation 2").nth(1).unwrap();
		assert!(gen2_entry.starts_with(" (default)"));
		// descending order is [3, 2, 1], so generation 2 sits at index 1.
		assert!(text.contains("set default=\"1\""));
	}

	#[test]
	fn regenerate_is_atomic_and_leaves_no_new_file() {
		let dir = tempfile::tempdir().unwrap();
		let cfg_path = dir.path().join("grub.cfg");
		let gens = vec![gen(1, true)];
		regenerate(&gens, &volumes(), "darch", "quiet", None, &cfg_path).unwrap();
		assert!(cfg_path.exists());
		assert!(!dir.path().join("grub.cfg.new").exists());
	}
}
