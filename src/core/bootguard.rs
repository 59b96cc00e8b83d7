// Copyright 2026 HybridMount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

//! Bootloop protection. A counter is bumped before the mount sequence starts
//! and cleared after it completes; reaching the threshold means the previous
//! boots died mid-sequence, and every module gets a disable marker as a last
//! resort so the next boot comes up clean.

use std::{fs, path::Path};

use anyhow::Result;

use crate::{defs, utils};

const MAX_FAILED_BOOTS: u8 = 3;

pub fn register_attempt() -> Result<u8> {
    register_attempt_at(
        Path::new(defs::BOOT_COUNT_FILE),
        Path::new(defs::MODULES_DIR),
    )
}

pub fn register_attempt_at(counter: &Path, modules_dir: &Path) -> Result<u8> {
    let count: u8 = fs::read_to_string(counter)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
        .saturating_add(1);

    if let Some(parent) = counter.parent() {
        utils::ensure_dir_exists(parent)?;
    }
    utils::atomic_write(counter, count.to_string())?;
    log::debug!("boot attempt counter at {count}");

    if count >= MAX_FAILED_BOOTS {
        log::error!(
            "{count} consecutive incomplete boots, disabling all modules as a last resort"
        );
        disable_all_modules(modules_dir)?;
        let _ = fs::remove_file(counter);
    }
    Ok(count)
}

pub fn clear() {
    clear_at(Path::new(defs::BOOT_COUNT_FILE));
}

pub fn clear_at(counter: &Path) {
    if counter.exists() {
        if let Err(e) = fs::remove_file(counter) {
            log::warn!("failed to reset boot counter: {e:#}");
        }
    }
}

fn disable_all_modules(modules_dir: &Path) -> Result<()> {
    if !modules_dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(modules_dir)?.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if !path.is_dir() || name == defs::SELF_MODULE_ID || name == "lost+found" {
            continue;
        }
        let marker = path.join(defs::DISABLE_FILE_NAME);
        if !marker.exists() {
            fs::File::create(&marker)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modules_survive_below_the_threshold() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let counter = dir.path().join("boot_count");
        let modules = dir.path().join("modules");
        fs::create_dir_all(modules.join("innocent"))?;

        assert_eq!(register_attempt_at(&counter, &modules)?, 1);
        assert_eq!(register_attempt_at(&counter, &modules)?, 2);
        assert!(!modules.join("innocent").join(defs::DISABLE_FILE_NAME).exists());
        Ok(())
    }

    #[test]
    fn third_attempt_disables_everything_and_resets() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let counter = dir.path().join("boot_count");
        let modules = dir.path().join("modules");
        fs::create_dir_all(modules.join("one"))?;
        fs::create_dir_all(modules.join("two"))?;
        fs::create_dir_all(modules.join(defs::SELF_MODULE_ID))?;

        for _ in 0..3 {
            register_attempt_at(&counter, &modules)?;
        }

        assert!(modules.join("one").join(defs::DISABLE_FILE_NAME).exists());
        assert!(modules.join("two").join(defs::DISABLE_FILE_NAME).exists());
        // never disables the daemon's own module
        assert!(
            !modules
                .join(defs::SELF_MODULE_ID)
                .join(defs::DISABLE_FILE_NAME)
                .exists()
        );
        assert!(!counter.exists());
        Ok(())
    }

    #[test]
    fn clear_resets_the_counter() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let counter = dir.path().join("boot_count");
        let modules = dir.path().join("modules");
        fs::create_dir_all(&modules)?;

        register_attempt_at(&counter, &modules)?;
        clear_at(&counter);
        assert!(!counter.exists());
        assert_eq!(register_attempt_at(&counter, &modules)?, 1);
        Ok(())
    }
}
