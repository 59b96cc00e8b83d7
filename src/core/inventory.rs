// Copyright 2026 HybridMount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

//! Module inventory scanner. Each run starts from a fresh enumeration of the
//! module directory; nothing is carried between runs except the fingerprint
//! records the sync engine persists in the staging area.

use std::{
    collections::{HashMap, HashSet},
    fs,
    io::{BufRead, BufReader},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use anyhow::Result;
use serde::Serialize;

use crate::{config, config::Config, core::state::RunState, defs, error::Fault, utils};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MountMode {
    #[default]
    Auto,
    ForceOverlay,
    ForceMagic,
}

impl MountMode {
    pub fn parse(value: &str) -> Self {
        match value {
            "auto" => Self::Auto,
            "overlay" => Self::ForceOverlay,
            "magic" => Self::ForceMagic,
            other => {
                log::warn!("unknown mount mode '{other}', treating as auto");
                Self::Auto
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::ForceOverlay => "overlay",
            Self::ForceMagic => "magic",
        }
    }
}

/// Cheap change signal derived from module.prop metadata (size + mtime), not
/// from file content. An edit that leaves the prop file untouched is invisible
/// here; that staleness window is accepted in exchange for scan cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    size: u64,
    mtime: i64,
    mtime_nsec: i64,
}

impl Fingerprint {
    pub fn of(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path)?;
        Ok(Self {
            size: meta.size(),
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
        })
    }

    pub fn encode(&self) -> String {
        format!("{}:{}:{}", self.size, self.mtime, self.mtime_nsec)
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().splitn(3, ':');
        Some(Self {
            size: parts.next()?.parse().ok()?,
            mtime: parts.next()?.parse().ok()?,
            mtime_nsec: parts.next()?.parse().ok()?,
        })
    }
}

/// One discovered module. Never mutated in place: a changed module shows up
/// as a new record with a different fingerprint on the next scan.
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    pub enabled: bool,
    pub mode: MountMode,
    pub fingerprint: Fingerprint,
    pub source_path: PathBuf,
}

/// Enumerates `module_dir` in ascending directory order. Directories without
/// a readable module.prop are skipped, not errors; two directories claiming
/// the same id resolve first-seen-wins with a warning.
pub fn scan(module_dir: &Path, modes: &HashMap<String, String>) -> Result<Vec<ModuleRecord>> {
    let mut records = Vec::new();
    if !module_dir.exists() {
        return Ok(records);
    }

    let mut entries: Vec<_> = fs::read_dir(module_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .collect();
    entries.sort_by_key(|e| e.file_name());

    let mut seen_ids: HashSet<String> = HashSet::new();

    for entry in entries {
        let path = entry.path();
        let dir_name = entry.file_name().to_string_lossy().to_string();
        if dir_name == defs::SELF_MODULE_ID || dir_name == "lost+found" || dir_name == ".git" {
            continue;
        }

        let prop_path = path.join("module.prop");
        let Some(props) = read_props(&prop_path) else {
            log::debug!("{}: no readable module.prop, skipping", path.display());
            continue;
        };

        let id = props
            .get("id")
            .cloned()
            .unwrap_or_else(|| dir_name.clone());
        if let Err(e) = utils::validate_module_id(&id) {
            log::warn!("{}", Fault::Scan(format!("{}: {e:#}", path.display())));
            continue;
        }
        if !seen_ids.insert(id.clone()) {
            log::warn!(
                "{}",
                Fault::Scan(format!(
                    "duplicate module id '{id}' at {}, keeping the first occurrence",
                    path.display()
                ))
            );
            continue;
        }

        let fingerprint = match Fingerprint::of(&prop_path) {
            Ok(fp) => fp,
            Err(e) => {
                log::warn!("{}", Fault::Scan(format!("{}: {e:#}", prop_path.display())));
                continue;
            }
        };

        let enabled = !path.join(defs::DISABLE_FILE_NAME).exists()
            && !path.join(defs::REMOVE_FILE_NAME).exists()
            && !path.join(defs::SKIP_MOUNT_FILE_NAME).exists();

        let mode = modes
            .get(&id)
            .map(|m| MountMode::parse(m))
            .unwrap_or_default();

        records.push(ModuleRecord {
            id,
            name: props.get("name").cloned().unwrap_or_else(|| dir_name.clone()),
            version: props.get("version").cloned().unwrap_or_default(),
            author: props.get("author").cloned().unwrap_or_default(),
            description: props.get("description").cloned().unwrap_or_default(),
            enabled,
            mode,
            fingerprint,
            source_path: path,
        });
    }

    Ok(records)
}

fn read_props(path: &Path) -> Option<HashMap<String, String>> {
    let file = fs::File::open(path).ok()?;
    let mut props = HashMap::new();
    for line in BufReader::new(file).lines().map_while(|l| l.ok()) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            props.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    if props.is_empty() { None } else { Some(props) }
}

#[derive(Serialize)]
struct ModuleInfo {
    id: String,
    name: String,
    version: String,
    author: String,
    description: String,
    mode: String,
}

/// `modules` CLI verb: JSON array of the enabled modules that contribute
/// content to at least one target partition, in either their source tree or
/// the staged copy from the last run.
pub fn print_list(config: &Config) -> Result<()> {
    let modes = config::load_module_modes();
    let records = scan(&config.moduledir, &modes)?;
    let staged_base = RunState::load().map(|s| s.mount_base).unwrap_or_default();
    let partitions = config.target_partitions();

    let mut list: Vec<ModuleInfo> = records
        .into_iter()
        .filter(|r| r.enabled)
        .filter(|r| {
            partitions.iter().any(|p| {
                r.source_path.join(p).exists() || staged_base.join(&r.id).join(p).exists()
            })
        })
        .map(|r| ModuleInfo {
            mode: r.mode.as_str().to_string(),
            id: r.id,
            name: r.name,
            version: r.version,
            author: r.author,
            description: r.description,
        })
        .collect();
    list.sort_by(|a, b| a.name.cmp(&b.name));

    println!("{}", serde_json::to_string(&list)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_module(root: &Path, dir: &str, id: &str) -> PathBuf {
        let path = root.join(dir);
        fs::create_dir_all(&path).unwrap();
        fs::write(
            path.join("module.prop"),
            format!("id={id}\nname=Module {id}\nversion=1.0\nauthor=tester\n"),
        )
        .unwrap();
        path
    }

    #[test]
    fn scan_orders_by_directory_and_parses_props() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_module(dir.path(), "zeta", "zeta");
        write_module(dir.path(), "alpha", "alpha");

        let records = scan(dir.path(), &HashMap::new())?;
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
        assert_eq!(records[0].name, "Module alpha");
        assert_eq!(records[0].version, "1.0");
        assert!(records[0].enabled);
        Ok(())
    }

    #[test]
    fn directories_without_prop_are_skipped_not_errors() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("no_prop"))?;
        write_module(dir.path(), "real", "real");

        let records = scan(dir.path(), &HashMap::new())?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "real");
        Ok(())
    }

    #[test]
    fn disable_marker_clears_enabled() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_module(dir.path(), "sleepy", "sleepy");
        fs::write(path.join(defs::DISABLE_FILE_NAME), b"")?;

        let records = scan(dir.path(), &HashMap::new())?;
        assert_eq!(records.len(), 1);
        assert!(!records[0].enabled);
        Ok(())
    }

    #[test]
    fn duplicate_id_keeps_first_occurrence() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_module(dir.path(), "aaa_dir", "twin");
        write_module(dir.path(), "bbb_dir", "twin");

        let records = scan(dir.path(), &HashMap::new())?;
        assert_eq!(records.len(), 1);
        assert!(records[0].source_path.ends_with("aaa_dir"));
        Ok(())
    }

    #[test]
    fn mode_override_applies() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_module(dir.path(), "forced", "forced");

        let mut modes = HashMap::new();
        modes.insert("forced".to_string(), "magic".to_string());
        let records = scan(dir.path(), &modes)?;
        assert_eq!(records[0].mode, MountMode::ForceMagic);
        Ok(())
    }

    #[test]
    fn fingerprint_is_stable_across_scans() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_module(dir.path(), "steady", "steady");

        let first = scan(dir.path(), &HashMap::new())?;
        let second = scan(dir.path(), &HashMap::new())?;
        assert_eq!(first[0].fingerprint, second[0].fingerprint);
        Ok(())
    }

    #[test]
    fn fingerprint_round_trips_through_encoding() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let prop = dir.path().join("module.prop");
        fs::write(&prop, b"id=x\n")?;

        let fp = Fingerprint::of(&prop)?;
        assert_eq!(Fingerprint::decode(&fp.encode()), Some(fp));
        assert_eq!(Fingerprint::decode("garbage"), None);
        Ok(())
    }
}
