//! CLI surface: `darch apply|list|rollback|gc|test`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::bootmenu::VolumeIds;
use crate::driver::ImageLayout;
use crate::gc::GcParams;

#[derive(Parser, Debug)]
#[command(author, version, about = "Transactional btrfs-generation build engine for Arch Linux images")]
pub struct DarchCli {
	#[command(subcommand)]
	pub command: Command,

	/// Root directory containing the `gen-N` subvolumes.
	#[arg(long, global = true, env = "DARCH_IMAGES", default_value = "/images")]
	pub images: PathBuf,

	/// Host directory bind-mounted into every generation's pacman cache.
	#[arg(long, global = true, env = "DARCH_PKG_CACHE", default_value = "/var/cache/pacman/pkg")]
	pub pkg_cache: PathBuf,

	/// The persistent `@var` subvolume bind-mounted as `<gen>/var`.
	#[arg(long, global = true, env = "DARCH_VAR_SUBVOL", default_value = "/images/@var")]
	pub var_subvol: PathBuf,

	/// Where the rendered boot-loader configuration is written.
	#[arg(long, global = true, env = "DARCH_BOOT_CFG", default_value = "/efi/grub/grub.cfg")]
	pub boot_cfg: PathBuf,

	/// Filesystem UUID of the btrfs volume hosting `<images>`.
	#[arg(long, global = true, env = "DARCH_BTRFS_UUID")]
	pub btrfs_uuid: String,

	/// Filesystem UUID of the EFI system partition.
	#[arg(long, global = true, env = "DARCH_ESP_UUID")]
	pub esp_uuid: String,

	/// Distribution name shown in boot menu entries.
	#[arg(long, global = true, env = "DARCH_DISTRO_NAME", default_value = "darch")]
	pub distro_name: String,

	/// Extra kernel command-line parameters appended to every entry.
	#[arg(long, global = true, env = "DARCH_KERNEL_CMDLINE", default_value = "")]
	pub kernel_cmdline: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
	/// Build a new generation from a Configuration (fresh if none exists
	/// yet, incremental against the current complete generation otherwise).
	Apply {
		/// Path to a Configuration: either a persisted Manifest JSON file,
		/// or an executable collaborator script that emits one on stdout.
		#[arg(long)]
		config: PathBuf,

		/// Force a fresh build even if a complete predecessor exists.
		#[arg(long)]
		rebuild: bool,

		/// Run a full package-manager upgrade after applying the diff.
		#[arg(long)]
		upgrade: bool,

		/// Minimum number of complete generations the GC must always keep.
		#[arg(long)]
		keep_min: Option<usize>,

		/// Maximum number of complete generations before the GC starts
		/// pruning purely on count.
		#[arg(long)]
		keep_max: Option<usize>,
	},

	/// List every generation under `<images>`, ascending by number.
	List,

	/// Make `generation` the default boot entry without building or
	/// deleting anything.
	Rollback { generation: u32 },

	/// Prune generations by the age/count policy (or force a specific
	/// `--keep` count).
	Gc {
		#[arg(long)]
		keep: Option<usize>,
	},

	/// Boot `image` under the external QEMU test harness. This crate only
	/// implements the invocation, not the harness itself.
	Test { image: PathBuf },
}

impl DarchCli {
	#[must_use]
	pub fn layout(&self) -> ImageLayout {
		ImageLayout {
			images: self.images.clone(),
			host_pkg_cache: self.pkg_cache.clone(),
			var_subvol: self.var_subvol.clone(),
			boot_cfg_path: self.boot_cfg.clone(),
			volumes: VolumeIds { btrfs_uuid: self.btrfs_uuid.clone(), esp_uuid: self.esp_uuid.clone() },
			distro_name: self.distro_name.clone(),
			kernel_cmdline: self.kernel_cmdline.clone(),
		}
	}
}

impl Command {
	#[must_use]
	pub fn gc_params(keep_min: Option<usize>, keep_max: Option<usize>) -> GcParams {
		let defaults = GcParams::default();
		GcParams { keep_min: keep_min.unwrap_or(defaults.keep_min), keep_max: keep_max.unwrap_or(defaults.keep_max), ..defaults }
	}
}
