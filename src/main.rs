// Copyright 2026 HybridMount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

mod cli;
mod config;
mod core;
mod defs;
mod error;
mod mount;
mod nuke;
mod sys;
mod utils;

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use mimalloc::MiMalloc;

use cli::{Cli, Commands};
use config::Config;
use crate::core::{Pipeline, executor::KernelEngine};
use sys::Kernel;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn load_config(cli: &Cli) -> Result<Config> {
    if let Some(config_path) = &cli.config {
        return Config::from_file(config_path);
    }
    if Path::new(defs::CONFIG_FILE_DEFAULT).exists() {
        Config::load_default()
    } else {
        Ok(Config::default())
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Some(command) = &cli.command {
        match command {
            Commands::GenConfig { output } => {
                Config::default().save_to_file(output)?;
                return Ok(());
            }
            Commands::ShowConfig => {
                // any load failure exits non-zero with empty stdout; the UI
                // falls back to defaults
                let config = load_config(&cli)?;
                println!("{}", serde_json::to_string(&config)?);
                return Ok(());
            }
            Commands::SaveConfig { payload } => {
                let path = cli
                    .config
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(defs::CONFIG_FILE_DEFAULT));
                config::save_payload(payload, &path)?;
                return Ok(());
            }
            Commands::Storage => {
                crate::core::storage::print_status()?;
                return Ok(());
            }
            Commands::Modules => {
                let config = load_config(&cli)?;
                crate::core::inventory::print_list(&config)?;
                return Ok(());
            }
        }
    }

    // daemon path
    let mut config = load_config(&cli)?;
    config.merge_with_cli(
        cli.moduledir.clone(),
        cli.tempdir.clone(),
        cli.mountsource.clone(),
        cli.verbose,
        cli.partitions.clone(),
        cli.dry_run,
    );
    config.validate()?;

    utils::init_logging(config.verbose)?;

    if let Err(e) = utils::camouflage_process(&utils::random_kworker_name()) {
        log::warn!("failed to camouflage process name: {e:#}");
    }

    log::info!("hybridmountd starting");

    match crate::core::bootguard::register_attempt() {
        Ok(count) if count > 1 => log::warn!("previous boot did not complete (attempt {count})"),
        Ok(_) => {}
        Err(e) => log::warn!("boot guard unavailable: {e:#}"),
    }

    utils::ensure_dir_exists(defs::RUN_DIR)?;
    let _lock = utils::RunLock::acquire(Path::new(defs::LOCK_FILE))?;

    let mnt_base = PathBuf::from(defs::DEFAULT_CONTENT_DIR);
    let img_path = Path::new(defs::BASE_DIR).join(defs::IMAGE_FILE_NAME);

    let pipeline = Pipeline::new(config.clone())
        .provision_storage(&Kernel, &mnt_base, &img_path)?
        .scan_and_sync()
        .generate_plan();

    if config.dry_run {
        log::info!(
            "dry run requested, stopping before execution ({} tasks planned)",
            pipeline.plan().tasks.len()
        );
        return Ok(());
    }

    let workspace = match &config.tempdir {
        Some(dir) if !dir.as_os_str().is_empty() => dir.clone(),
        _ => utils::select_temp_dir()?,
    };
    utils::ensure_temp_dir(&workspace)?;

    let engine = KernelEngine {
        config: &config,
        staging_root: pipeline.backend().mount_point.clone(),
        workspace: workspace.clone(),
    };
    let pipeline = pipeline.execute(&engine);
    utils::cleanup_temp_dir(&workspace);

    let nuke_active = nuke::run(&config, pipeline.backend());
    pipeline.finalize(nuke_active);

    Ok(())
}

fn main() {
    if let Err(e) = run() {
        log::error!("fatal: {e:#}");
        eprintln!("fatal: {e:#}");
        std::process::exit(1);
    }
}
