// Copyright 2026 HybridMount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{defs, error::Fault, utils};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_moduledir")]
    pub moduledir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempdir: Option<PathBuf>,
    #[serde(default = "default_mountsource")]
    pub mountsource: String,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default, deserialize_with = "deserialize_partitions_flexible")]
    pub partitions: Vec<String>,
    #[serde(default)]
    pub force_ext4: bool,
    #[serde(default)]
    pub enable_nuke: bool,
    #[serde(default)]
    pub disable_umount: bool,
    #[serde(default)]
    pub allow_umount_coexistence: bool,
    #[serde(default)]
    pub dry_run: bool,
}

fn default_moduledir() -> PathBuf {
    PathBuf::from(defs::MODULES_DIR)
}

fn default_mountsource() -> String {
    String::from("KSU")
}

// The WebUI sends partitions either as a comma string or as a JSON array.
fn deserialize_partitions_flexible<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }
    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::Vec(v) => Ok(v),
        StringOrVec::String(s) => Ok(s
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            moduledir: default_moduledir(),
            tempdir: None,
            mountsource: default_mountsource(),
            verbose: false,
            partitions: Vec::new(),
            force_ext4: false,
            enable_nuke: false,
            disable_umount: false,
            allow_umount_coexistence: false,
            dry_run: false,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).context("failed to read config file")?;
        let config: Config = toml::from_str(&content).context("failed to parse config file")?;
        Ok(config)
    }

    pub fn load_default() -> Result<Self> {
        Self::from_file(defs::CONFIG_FILE_DEFAULT)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("failed to create config directory")?;
        }
        utils::atomic_write(path.as_ref(), content).context("failed to write config file")
    }

    /// Rejects values the engine cannot act on. Called before every persist
    /// and after CLI merging, so a bad document never reaches the mount path.
    pub fn validate(&self) -> Result<(), Fault> {
        if !self.moduledir.is_absolute() {
            return Err(Fault::Config(format!(
                "moduledir must be an absolute path, got '{}'",
                self.moduledir.display()
            )));
        }
        if let Some(tempdir) = &self.tempdir
            && !tempdir.as_os_str().is_empty()
            && !tempdir.is_absolute()
        {
            return Err(Fault::Config(format!(
                "tempdir must be absolute or empty, got '{}'",
                tempdir.display()
            )));
        }
        if self.mountsource.trim().is_empty() {
            return Err(Fault::Config("mountsource must not be empty".into()));
        }
        for part in &self.partitions {
            if part.is_empty() || part.contains('/') || part.starts_with('.') {
                return Err(Fault::Config(format!(
                    "invalid extra partition name '{part}'"
                )));
            }
        }
        Ok(())
    }

    pub fn merge_with_cli(
        &mut self,
        moduledir: Option<PathBuf>,
        tempdir: Option<PathBuf>,
        mountsource: Option<String>,
        verbose: bool,
        partitions: Vec<String>,
        dry_run: bool,
    ) {
        if let Some(dir) = moduledir {
            self.moduledir = dir;
        }
        if tempdir.is_some() {
            self.tempdir = tempdir;
        }
        if let Some(source) = mountsource {
            self.mountsource = source;
        }
        if verbose {
            self.verbose = true;
        }
        if !partitions.is_empty() {
            self.partitions = partitions;
        }
        if dry_run {
            self.dry_run = true;
        }
    }

    /// Built-in partition set plus configured extras, deduplicated, in a
    /// stable order. This is the planner's target universe.
    pub fn target_partitions(&self) -> Vec<String> {
        let mut parts: Vec<String> = defs::BUILTIN_PARTITIONS
            .iter()
            .map(|s| s.to_string())
            .collect();
        for extra in &self.partitions {
            if !parts.iter().any(|p| p == extra) {
                parts.push(extra.clone());
            }
        }
        parts
    }
}

/// `save-config` entry point: payload is a hex-encoded UTF-8 JSON document
/// produced by the management UI. Nothing is written unless the whole
/// decode/parse/validate chain succeeds.
pub fn save_payload(payload: &str, path: &Path) -> Result<()> {
    let bytes = hex::decode(payload.trim())
        .map_err(|e| Fault::Config(format!("payload is not valid hex: {e}")))?;
    let text = String::from_utf8(bytes)
        .map_err(|e| Fault::Config(format!("payload is not valid UTF-8: {e}")))?;
    let config: Config = serde_json::from_str(&text)
        .map_err(|e| Fault::Config(format!("payload is not a valid config document: {e}")))?;
    config.validate()?;
    config.save_to_file(path)
}

/// Per-module mode overrides, one `id=mode` line each, owned jointly with the
/// management UI. Unknown modes fall back to auto with a warning.
pub fn load_module_modes() -> HashMap<String, String> {
    load_module_modes_from(Path::new(defs::MODULE_MODES_FILE))
}

pub fn load_module_modes_from(path: &Path) -> HashMap<String, String> {
    let mut modes = HashMap::new();
    let Ok(content) = fs::read_to_string(path) else {
        return modes;
    };
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((id, mode)) = line.split_once('=') {
            modes.insert(id.trim().to_string(), mode.trim().to_string());
        }
    }
    modes
}
