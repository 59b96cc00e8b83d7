// Copyright 2026 HybridMount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

//! Persisted run state. Written once at the end of a run for external readers
//! (the management UI shells out to `storage`/`modules` and reads this file
//! directly); the daemon never reads it back for its own decisions.

use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{defs, utils};

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct RunState {
    pub timestamp: u64,
    pub updated_at: String,
    pub pid: u32,
    pub storage_mode: String,
    pub mount_base: PathBuf,
    pub active_mounts: Vec<String>,
    pub overlay_modules: Vec<String>,
    pub magic_modules: Vec<String>,
    pub storage_total: u64,
    pub storage_used: u64,
    pub storage_percent: u8,
    pub nuke_active: bool,
}

impl RunState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage_mode: String,
        mount_base: PathBuf,
        active_mounts: Vec<String>,
        overlay_modules: Vec<String>,
        magic_modules: Vec<String>,
        storage_usage: (u64, u64, u8),
        nuke_active: bool,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            timestamp,
            updated_at: chrono::Local::now().to_rfc3339(),
            pid: std::process::id(),
            storage_mode,
            mount_base,
            active_mounts,
            overlay_modules,
            magic_modules,
            storage_total: storage_usage.0,
            storage_used: storage_usage.1,
            storage_percent: storage_usage.2,
            nuke_active,
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(Path::new(defs::STATE_FILE))
    }

    /// Atomic (temp + rename): a concurrent reader sees the previous snapshot
    /// or this one, never a torn write.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            utils::ensure_dir_exists(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        utils::atomic_write(path, json)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(defs::STATE_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Rewrites the description line of the daemon's own module.prop so the
/// manager app shows live status without invoking us.
pub fn update_module_description(storage_mode: &str, nuke_active: bool, overlay: usize, magic: usize) {
    update_description_at(
        Path::new(defs::MODULE_PROP_FILE),
        storage_mode,
        nuke_active,
        overlay,
        magic,
    );
}

fn update_description_at(
    path: &Path,
    storage_mode: &str,
    nuke_active: bool,
    overlay: usize,
    magic: usize,
) {
    if !path.exists() {
        log::warn!("{} not found, skipping description update", path.display());
        return;
    }

    let nuke = if nuke_active { " | nuke: on" } else { "" };
    let new_desc =
        format!("description=Active ({storage_mode}) | overlay: {overlay} | magic: {magic}{nuke}");

    match fs::read_to_string(path) {
        Ok(content) => {
            let updated: Vec<String> = content
                .lines()
                .map(|line| {
                    if line.starts_with("description=") {
                        new_desc.clone()
                    } else {
                        line.to_string()
                    }
                })
                .collect();
            if let Err(e) = utils::atomic_write(path, updated.join("\n")) {
                log::error!("failed to update module.prop: {e:#}");
            }
        }
        Err(e) => log::error!("failed to read module.prop: {e:#}"),
    }
}
