#![warn(clippy::complexity)]
#![warn(clippy::correctness)]
#![warn(clippy::nursery)]
#![warn(clippy::pedantic)]
#![warn(clippy::perf)]
#![warn(clippy::style)]
#![warn(clippy::suspicious)]
#![allow(clippy::missing_inline_in_public_items)]
#![allow(clippy::implicit_return)]

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use darch::builder::{BuildOptions, Pacman};
use darch::cli::{Command, DarchCli};
use darch::config_script;
use darch::driver;
use darch::error::DarchError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

fn main() {
	if let Err(e) = dotenvy::dotenv() {
		if !e.not_found() {
			eprintln!("failed to load .env: {e}");
		}
	}

	if let Err(report) = run() {
		tracing::error!("{report:?}");
		let code = exit_code_for(&report);
		std::process::exit(code);
	}
}

fn run() -> Result<()> {
	color_eyre::install()?;

	let filter = EnvFilter::try_from_env("DARCH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
	let fmt_layer = fmt::layer().pretty().with_filter(filter);
	let subscriber = Registry::default().with(tracing_error::ErrorLayer::default()).with(fmt_layer);
	tracing::subscriber::set_global_default(subscriber).expect("setting default tracing subscriber failed");

	sudo::escalate_if_needed().map_err(|e| eyre!("failed to escalate privileges: {e}"))?;

	let cli = DarchCli::parse();
	let layout = cli.layout();
	let pkg_mgr = Pacman;

	match cli.command {
		Command::Apply { config, rebuild, upgrade, keep_min, keep_max } => {
			let configuration = config_script::load(&config)?;
			let options = BuildOptions { force_fresh: rebuild, full_upgrade: upgrade };
			let gc_params = Command::gc_params(keep_min, keep_max);
			let number = driver::apply(&layout, &pkg_mgr, &configuration, options, gc_params)?;
			println!("built generation {number}");
		},
		Command::List => {
			let generations = driver::list(&layout)?;
			for g in generations {
				let status = if g.complete { "complete" } else { "incomplete" };
				println!("gen-{} {status}", g.number);
			}
		},
		Command::Rollback { generation } => {
			driver::rollback(&layout, generation)?;
			println!("default boot entry set to gen-{generation}");
		},
		Command::Gc { keep } => {
			let gc_params = Command::gc_params(None, keep);
			let plan = driver::run_gc(&layout, gc_params)?;
			println!("pruned {} generation(s)", plan.incomplete_to_delete.len() + plan.complete_to_delete.len());
		},
		Command::Test { image } => {
			darch::process::run(&["darch-test-harness", image.to_str().unwrap_or_default()], darch::process::RunOpts::checked())?;
		},
	}

	Ok(())
}

/// Maps the top-level error to a process exit code: `DarchError` variants
/// carry their own `exit_code()`; anything else (CLI parse failure,
/// `color_eyre` context wrapping an opaque error) is treated as a
/// user-facing configuration problem.
fn exit_code_for(report: &color_eyre::Report) -> i32 {
	report.downcast_ref::<DarchError>().map_or(1, DarchError::exit_code)
}
