// Copyright 2026 HybridMount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

//! Incremental sync engine. Stages module content into the storage backend,
//! gated per module by the fingerprint recorded next to the staged copy. No
//! file-level deltas: a changed module is re-copied wholesale, which trades
//! some I/O for a staging area that is always a faithful snapshot.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::Path,
};

use anyhow::{Context, Result};
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::{
    core::inventory::{Fingerprint, ModuleRecord},
    defs,
    error::Fault,
    utils,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Skip,
    CreateFull,
    UpdateDelta,
    Remove,
}

#[derive(Debug, Clone)]
pub struct SyncPlanEntry {
    pub id: String,
    pub action: SyncAction,
}

/// Decides one action per module by comparing the scanned fingerprint against
/// the record persisted in the staged copy. Staged directories whose module
/// vanished from the inventory (or was disabled) become `Remove`.
pub fn plan(
    records: &[ModuleRecord],
    storage_root: &Path,
    partitions: &[String],
) -> Vec<SyncPlanEntry> {
    let mut entries = Vec::new();
    let mut active: HashSet<&str> = HashSet::new();

    for record in records.iter().filter(|r| r.enabled) {
        active.insert(record.id.as_str());

        if !has_partition_content(record, partitions) {
            log::debug!("module '{}' has no partition content", record.id);
            entries.push(SyncPlanEntry {
                id: record.id.clone(),
                action: SyncAction::Skip,
            });
            continue;
        }

        let staged = storage_root.join(&record.id);
        let action = match read_fingerprint(&staged) {
            None => SyncAction::CreateFull,
            Some(prev) if prev == record.fingerprint => SyncAction::Skip,
            Some(_) => SyncAction::UpdateDelta,
        };
        entries.push(SyncPlanEntry {
            id: record.id.clone(),
            action,
        });
    }

    if let Ok(staged_entries) = fs::read_dir(storage_root) {
        for entry in staged_entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || name == "lost+found" {
                continue;
            }
            if !active.contains(name.as_str()) {
                entries.push(SyncPlanEntry {
                    id: name,
                    action: SyncAction::Remove,
                });
            }
        }
    }

    entries
}

/// Applies the plan. Copies run in parallel across modules (independent
/// staging directories, no shared mutable state). A failed copy degrades that
/// module to absent for the run; it never unwinds the other modules.
pub fn apply(records: &[ModuleRecord], entries: &[SyncPlanEntry], storage_root: &Path) {
    let by_id: HashMap<&str, &ModuleRecord> =
        records.iter().map(|r| (r.id.as_str(), r)).collect();

    entries.par_iter().for_each(|entry| match entry.action {
        SyncAction::Skip => log::debug!("module '{}' unchanged", entry.id),
        SyncAction::Remove => {
            let staged = storage_root.join(&entry.id);
            log::info!("removing staged copy of vanished module '{}'", entry.id);
            let _ = if staged.is_dir() {
                fs::remove_dir_all(&staged)
            } else {
                fs::remove_file(&staged)
            };
        }
        SyncAction::CreateFull | SyncAction::UpdateDelta => {
            let Some(record) = by_id.get(entry.id.as_str()) else {
                return;
            };
            log::info!(
                "staging module '{}' ({})",
                entry.id,
                if entry.action == SyncAction::CreateFull {
                    "full"
                } else {
                    "changed"
                }
            );
            if let Err(e) = stage_module(record, storage_root) {
                log::error!(
                    "{}",
                    Fault::Sync {
                        module: entry.id.clone(),
                        reason: format!("{e:#}"),
                    }
                );
                // absent for this run
                let _ = fs::remove_dir_all(storage_root.join(&entry.id));
                let _ = fs::remove_dir_all(tmp_path(storage_root, &entry.id));
            }
        }
    });
}

fn tmp_path(storage_root: &Path, id: &str) -> std::path::PathBuf {
    storage_root.join(format!(".tmp_{id}"))
}

/// Copies into a temp directory first and renames into place, so the staged
/// copy is either the old snapshot or the new one, never a mix.
fn stage_module(record: &ModuleRecord, storage_root: &Path) -> Result<()> {
    let dst = storage_root.join(&record.id);
    let tmp = tmp_path(storage_root, &record.id);
    if tmp.exists() {
        fs::remove_dir_all(&tmp).context("failed to clear stale temp dir")?;
    }

    utils::sync_dir(&record.source_path, &tmp, true)?;
    utils::prune_empty_dirs(&tmp)?;
    if let Err(e) = apply_overlay_opaque_flags(&tmp) {
        log::warn!("opaque xattrs for '{}': {e:#}", record.id);
    }
    fs::write(
        tmp.join(defs::FINGERPRINT_FILE_NAME),
        record.fingerprint.encode(),
    )
    .context("failed to record fingerprint")?;

    if dst.exists() {
        fs::remove_dir_all(&dst).context("failed to clear previous staged copy")?;
    }
    fs::rename(&tmp, &dst).context("failed to commit staged copy")?;
    Ok(())
}

/// `.replace` marker files become `trusted.overlay.opaque` on their directory
/// so OverlayFS hides the stock content below. The marker itself stays: the
/// magic mount path reads either form.
fn apply_overlay_opaque_flags(root: &Path) -> Result<()> {
    for entry in WalkDir::new(root).min_depth(1).into_iter().flatten() {
        if entry.file_type().is_file()
            && entry.file_name() == defs::REPLACE_DIR_FILE_NAME
            && let Some(parent) = entry.path().parent()
        {
            utils::set_overlay_opaque(parent)?;
            log::debug!("marked {} opaque", parent.display());
        }
    }
    Ok(())
}

fn read_fingerprint(staged: &Path) -> Option<Fingerprint> {
    let raw = fs::read_to_string(staged.join(defs::FINGERPRINT_FILE_NAME)).ok()?;
    Fingerprint::decode(&raw)
}

fn has_partition_content(record: &ModuleRecord, partitions: &[String]) -> bool {
    partitions.iter().any(|p| {
        let path = record.source_path.join(p);
        path.is_dir()
            && fs::read_dir(&path)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::inventory::scan;
    use std::path::PathBuf;

    fn partitions() -> Vec<String> {
        vec!["system".to_string(), "vendor".to_string()]
    }

    fn write_module(root: &Path, id: &str) -> PathBuf {
        let path = root.join(id);
        fs::create_dir_all(path.join("system/bin")).unwrap();
        fs::write(path.join("system/bin/tool"), b"payload").unwrap();
        fs::write(
            path.join("module.prop"),
            format!("id={id}\nname={id}\nversion=1\n"),
        )
        .unwrap();
        path
    }

    fn scan_all(module_dir: &Path) -> Vec<ModuleRecord> {
        scan(module_dir, &HashMap::new()).unwrap()
    }

    fn action_of(entries: &[SyncPlanEntry], id: &str) -> SyncAction {
        entries.iter().find(|e| e.id == id).unwrap().action
    }

    #[test]
    fn new_module_is_created_then_skipped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let modules = dir.path().join("modules");
        let storage = dir.path().join("storage");
        fs::create_dir_all(&storage)?;
        write_module(&modules, "fresh");

        let records = scan_all(&modules);
        let entries = plan(&records, &storage, &partitions());
        assert_eq!(action_of(&entries, "fresh"), SyncAction::CreateFull);

        apply(&records, &entries, &storage);
        assert_eq!(fs::read(storage.join("fresh/system/bin/tool"))?, b"payload");
        assert!(storage.join("fresh").join(defs::FINGERPRINT_FILE_NAME).exists());

        let entries = plan(&records, &storage, &partitions());
        assert_eq!(action_of(&entries, "fresh"), SyncAction::Skip);
        Ok(())
    }

    #[test]
    fn changed_metadata_triggers_update() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let modules = dir.path().join("modules");
        let storage = dir.path().join("storage");
        fs::create_dir_all(&storage)?;
        let path = write_module(&modules, "mutable");

        let records = scan_all(&modules);
        apply(&records, &plan(&records, &storage, &partitions()), &storage);

        // a longer prop file changes the fingerprint regardless of mtime
        fs::write(
            path.join("module.prop"),
            "id=mutable\nname=mutable\nversion=2.0.0-rebuilt\n",
        )?;
        fs::write(path.join("system/bin/tool"), b"updated")?;

        let records = scan_all(&modules);
        let entries = plan(&records, &storage, &partitions());
        assert_eq!(action_of(&entries, "mutable"), SyncAction::UpdateDelta);

        apply(&records, &entries, &storage);
        assert_eq!(fs::read(storage.join("mutable/system/bin/tool"))?, b"updated");
        Ok(())
    }

    #[test]
    fn vanished_module_is_removed_from_storage() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let modules = dir.path().join("modules");
        let storage = dir.path().join("storage");
        fs::create_dir_all(&storage)?;
        write_module(&modules, "ghost");

        let records = scan_all(&modules);
        apply(&records, &plan(&records, &storage, &partitions()), &storage);
        assert!(storage.join("ghost").exists());

        fs::remove_dir_all(modules.join("ghost"))?;
        let records = scan_all(&modules);
        let entries = plan(&records, &storage, &partitions());
        assert_eq!(action_of(&entries, "ghost"), SyncAction::Remove);

        apply(&records, &entries, &storage);
        assert!(!storage.join("ghost").exists());
        Ok(())
    }

    #[test]
    fn disabled_module_staged_copy_is_removed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let modules = dir.path().join("modules");
        let storage = dir.path().join("storage");
        fs::create_dir_all(&storage)?;
        let path = write_module(&modules, "dormant");

        let records = scan_all(&modules);
        apply(&records, &plan(&records, &storage, &partitions()), &storage);

        fs::write(path.join(defs::DISABLE_FILE_NAME), b"")?;
        let records = scan_all(&modules);
        let entries = plan(&records, &storage, &partitions());
        assert_eq!(action_of(&entries, "dormant"), SyncAction::Remove);

        apply(&records, &entries, &storage);
        assert!(!storage.join("dormant").exists());
        Ok(())
    }

    #[test]
    fn contentless_module_is_not_staged() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let modules = dir.path().join("modules");
        let storage = dir.path().join("storage");
        fs::create_dir_all(&storage)?;
        let path = modules.join("hollow");
        fs::create_dir_all(&path)?;
        fs::write(path.join("module.prop"), "id=hollow\nname=hollow\n")?;

        let records = scan_all(&modules);
        let entries = plan(&records, &storage, &partitions());
        assert_eq!(action_of(&entries, "hollow"), SyncAction::Skip);

        apply(&records, &entries, &storage);
        assert!(!storage.join("hollow").exists());
        Ok(())
    }

    #[test]
    fn rw_support_dir_is_never_pruned_as_orphan() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = dir.path().join("storage");
        fs::create_dir_all(storage.join(defs::RW_DIR_NAME).join("system"))?;
        fs::create_dir_all(storage.join("lost+found"))?;

        let entries = plan(&[], &storage, &partitions());
        assert!(entries.is_empty());
        Ok(())
    }
}
