// Copyright 2026 HybridMount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::{core::state::RunState, defs, error::Fault, sys::SysOps, utils};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Tmpfs,
    LoopImage,
}

/// The writable, xattr-capable staging area backing one daemon run. Created
/// once during initialization; it backs live mounts afterwards and is only
/// torn down on a fatal early failure.
#[derive(Debug)]
pub struct StorageBackend {
    pub kind: BackendKind,
    pub mount_point: PathBuf,
    pub image_path: Option<PathBuf>,
    pub loop_device: Option<PathBuf>,
}

impl StorageBackend {
    pub fn mode_str(&self) -> &'static str {
        match self.kind {
            BackendKind::Tmpfs => "tmpfs",
            BackendKind::LoopImage => "ext4",
        }
    }

    /// (total, used, percent) of the staging filesystem.
    pub fn usage(&self) -> (u64, u64, u8) {
        usage_of(&self.mount_point)
    }
}

pub fn usage_of(path: &Path) -> (u64, u64, u8) {
    if let Ok(stat) = rustix::fs::statvfs(path) {
        let total = stat.f_blocks * stat.f_frsize;
        let free = stat.f_bfree * stat.f_frsize;
        let used = total.saturating_sub(free);
        let percent = if total > 0 {
            (used * 100 / total) as u8
        } else {
            0
        };
        (total, used, percent)
    } else {
        (0, 0, 0)
    }
}

/// Provisions the staging backend: tmpfs when the kernel supports trusted
/// xattrs on it, otherwise a 2 GiB ext4 loop image that is checked, repaired
/// or recreated as needed. Failure here is the one fault the run cannot
/// absorb.
pub fn provision(
    sys: &dyn SysOps,
    mnt_base: &Path,
    img_path: &Path,
    force_image: bool,
    mount_source: &str,
) -> Result<StorageBackend, Fault> {
    if utils::is_mounted(mnt_base) {
        let _ = sys.unmount(mnt_base);
    }
    utils::ensure_dir_exists(mnt_base)
        .map_err(|e| Fault::Storage(format!("cannot create {}: {e:#}", mnt_base.display())))?;

    if force_image {
        log::info!("force_ext4 set, skipping tmpfs attempt");
    } else if try_tmpfs(sys, mnt_base, mount_source) {
        return Ok(StorageBackend {
            kind: BackendKind::Tmpfs,
            mount_point: mnt_base.to_path_buf(),
            image_path: None,
            loop_device: None,
        });
    }

    setup_loop_image(sys, mnt_base, img_path).map_err(|e| Fault::Storage(format!("{e:#}")))
}

fn try_tmpfs(sys: &dyn SysOps, target: &Path, mount_source: &str) -> bool {
    if let Err(e) = sys.mount_tmpfs(target, mount_source) {
        log::warn!("tmpfs mount failed: {e:#}, falling back to image mode");
        return false;
    }
    if sys.supports_trusted_xattr(target) {
        log::info!("tmpfs mounted and supports trusted xattrs");
        return true;
    }
    // A tmpfs without CONFIG_TMPFS_XATTR cannot carry SELinux labels; it is
    // torn down and not reconsidered for this run.
    log::warn!("tmpfs does not support trusted xattrs, falling back to image mode");
    if let Err(e) = sys.unmount(target) {
        log::warn!("failed to unmount rejected tmpfs: {e:#}");
    }
    false
}

fn setup_loop_image(
    sys: &dyn SysOps,
    target: &Path,
    img_path: &Path,
) -> Result<StorageBackend> {
    if !img_path.exists() {
        create_image(sys, img_path)?;
    }

    let device = match attach_and_mount(sys, img_path, target) {
        Ok(device) => device,
        Err(e) => {
            log::warn!(
                "failed to mount {}: {e:#}, attempting repair",
                img_path.display()
            );
            recover_image(sys, img_path, target)?
        }
    };

    log::info!("mounted {} via {}", img_path.display(), device.display());
    Ok(StorageBackend {
        kind: BackendKind::LoopImage,
        mount_point: target.to_path_buf(),
        image_path: Some(img_path.to_path_buf()),
        loop_device: Some(device),
    })
}

fn recover_image(sys: &dyn SysOps, img_path: &Path, target: &Path) -> Result<PathBuf> {
    if sys.fsck_ext4(img_path).is_ok()
        && let Ok(device) = attach_and_mount(sys, img_path, target)
    {
        log::info!("image repaired successfully");
        return Ok(device);
    }

    log::warn!("repair failed, recreating {}", img_path.display());
    fs::remove_file(img_path)
        .with_context(|| format!("failed to remove corrupt image {}", img_path.display()))?;
    create_image(sys, img_path)?;
    attach_and_mount(sys, img_path, target).context("failed to mount recreated image")
}

fn create_image(sys: &dyn SysOps, img_path: &Path) -> Result<()> {
    if let Some(parent) = img_path.parent() {
        fs::create_dir_all(parent)?;
    }
    log::info!(
        "creating {} ({} bytes)",
        img_path.display(),
        defs::IMAGE_SIZE_BYTES
    );
    fs::File::create(img_path)
        .context("failed to create image file")?
        .set_len(defs::IMAGE_SIZE_BYTES)
        .context("failed to extend image file")?;
    sys.mkfs_ext4(img_path)
}

/// Attach-then-mount with the guarantee that a device attached here is
/// detached again on the mount failure path.
fn attach_and_mount(sys: &dyn SysOps, image: &Path, target: &Path) -> Result<PathBuf> {
    let device = sys.attach_loop(image)?;
    if let Err(e) = sys.mount_ext4(&device, target) {
        if let Err(de) = sys.detach_loop(&device) {
            log::error!("failed to detach {} after mount error: {de:#}", device.display());
        }
        return Err(e);
    }
    Ok(device)
}

#[derive(Serialize)]
struct StorageStatus {
    size: String,
    used: String,
    percent: String,
    #[serde(rename = "type")]
    mode: String,
}

/// `storage` CLI verb: reports the live staging filesystem as seen through
/// the persisted run state.
pub fn print_status() -> Result<()> {
    let state = RunState::load().unwrap_or_default();
    let mnt_base = if state.mount_base.as_os_str().is_empty() {
        PathBuf::from(defs::DEFAULT_CONTENT_DIR)
    } else {
        state.mount_base.clone()
    };

    if !utils::is_mounted(&mnt_base) {
        println!("{{ \"error\": \"not mounted\" }}");
        return Ok(());
    }

    let (total, used, percent) = usage_of(&mnt_base);
    let mode = if state.storage_mode.is_empty() {
        "unknown".to_string()
    } else {
        state.storage_mode
    };

    let status = StorageStatus {
        size: utils::format_size(total),
        used: utils::format_size(used),
        percent: format!("{percent}%"),
        mode,
    };
    println!("{}", serde_json::to_string(&status)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Scripted kernel surface. Records every call so tests can assert the
    /// attach/detach balance and the exact fallback sequence.
    struct FakeSys {
        xattr_ok: bool,
        tmpfs_fails: bool,
        mount_failures: RefCell<u32>,
        fsck_ok: bool,
        calls: RefCell<Vec<String>>,
        attached: RefCell<i32>,
    }

    impl FakeSys {
        fn new() -> Self {
            Self {
                xattr_ok: true,
                tmpfs_fails: false,
                mount_failures: RefCell::new(0),
                fsck_ok: true,
                calls: RefCell::new(Vec::new()),
                attached: RefCell::new(0),
            }
        }

        fn log(&self, call: &str) {
            self.calls.borrow_mut().push(call.to_string());
        }
    }

    impl SysOps for FakeSys {
        fn mount_tmpfs(&self, _target: &Path, _source: &str) -> Result<()> {
            self.log("mount_tmpfs");
            if self.tmpfs_fails {
                anyhow::bail!("tmpfs unavailable");
            }
            Ok(())
        }

        fn unmount(&self, _target: &Path) -> Result<()> {
            self.log("unmount");
            Ok(())
        }

        fn supports_trusted_xattr(&self, _dir: &Path) -> bool {
            self.log("xattr_probe");
            self.xattr_ok
        }

        fn attach_loop(&self, _image: &Path) -> Result<PathBuf> {
            self.log("attach_loop");
            *self.attached.borrow_mut() += 1;
            Ok(PathBuf::from("/dev/loop7"))
        }

        fn detach_loop(&self, _device: &Path) -> Result<()> {
            self.log("detach_loop");
            *self.attached.borrow_mut() -= 1;
            Ok(())
        }

        fn mount_ext4(&self, _device: &Path, _target: &Path) -> Result<()> {
            self.log("mount_ext4");
            let mut failures = self.mount_failures.borrow_mut();
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("bad superblock");
            }
            Ok(())
        }

        fn mkfs_ext4(&self, _image: &Path) -> Result<()> {
            self.log("mkfs");
            Ok(())
        }

        fn fsck_ext4(&self, _image: &Path) -> Result<()> {
            self.log("fsck");
            if self.fsck_ok {
                Ok(())
            } else {
                anyhow::bail!("unfixable corruption")
            }
        }
    }

    fn scratch() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let mnt = dir.path().join("mnt");
        let img = dir.path().join("modules.img");
        (dir, mnt, img)
    }

    #[test]
    fn tmpfs_preferred_when_xattr_capable() {
        let (_dir, mnt, img) = scratch();
        let sys = FakeSys::new();
        let backend = provision(&sys, &mnt, &img, false, "KSU").unwrap();
        assert_eq!(backend.kind, BackendKind::Tmpfs);
        assert!(backend.loop_device.is_none());
        assert!(!img.exists());
    }

    #[test]
    fn xattr_probe_failure_falls_back_to_image_not_tmpfs() {
        let (_dir, mnt, img) = scratch();
        let mut sys = FakeSys::new();
        sys.xattr_ok = false;
        let backend = provision(&sys, &mnt, &img, false, "KSU").unwrap();
        assert_eq!(backend.kind, BackendKind::LoopImage);
        // rejected tmpfs was unmounted before the image path started
        let calls = sys.calls.borrow();
        let unmount_pos = calls.iter().position(|c| c == "unmount").unwrap();
        let attach_pos = calls.iter().position(|c| c == "attach_loop").unwrap();
        assert!(unmount_pos < attach_pos);
    }

    #[test]
    fn force_image_skips_tmpfs_entirely() {
        let (_dir, mnt, img) = scratch();
        let sys = FakeSys::new();
        let backend = provision(&sys, &mnt, &img, true, "KSU").unwrap();
        assert_eq!(backend.kind, BackendKind::LoopImage);
        assert!(!sys.calls.borrow().iter().any(|c| c == "mount_tmpfs"));
    }

    #[test]
    fn corrupt_image_is_repaired() {
        let (_dir, mnt, img) = scratch();
        std::fs::write(&img, b"preexisting").unwrap();
        let sys = FakeSys::new();
        *sys.mount_failures.borrow_mut() = 1;
        let backend = provision(&sys, &mnt, &img, true, "KSU").unwrap();
        assert_eq!(backend.kind, BackendKind::LoopImage);
        assert!(sys.calls.borrow().iter().any(|c| c == "fsck"));
        // the image was not recreated
        assert!(!sys.calls.borrow().iter().any(|c| c == "mkfs"));
        assert_eq!(*sys.attached.borrow(), 1);
    }

    #[test]
    fn failed_repair_recreates_image_with_no_dangling_loop() {
        let (_dir, mnt, img) = scratch();
        std::fs::write(&img, b"preexisting").unwrap();
        let mut sys = FakeSys::new();
        sys.fsck_ok = false;
        *sys.mount_failures.borrow_mut() = 1;
        let backend = provision(&sys, &mnt, &img, true, "KSU").unwrap();
        assert_eq!(backend.kind, BackendKind::LoopImage);
        assert!(sys.calls.borrow().iter().any(|c| c == "mkfs"));
        // exactly the final device is attached; the failed attempt detached
        assert_eq!(*sys.attached.borrow(), 1);
        assert!(img.exists());
    }

    #[test]
    fn unmountable_recreated_image_is_fatal_and_detached() {
        let (_dir, mnt, img) = scratch();
        std::fs::write(&img, b"preexisting").unwrap();
        let mut sys = FakeSys::new();
        sys.fsck_ok = false;
        *sys.mount_failures.borrow_mut() = 3;
        let err = provision(&sys, &mnt, &img, true, "KSU");
        assert!(matches!(err, Err(Fault::Storage(_))));
        assert_eq!(*sys.attached.borrow(), 0);
    }
}
