// Copyright 2026 HybridMount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

//! Narrow kernel surface used by the storage manager. Everything that talks
//! to loop devices, mkfs/fsck or the mount syscalls for the staging area goes
//! through [`SysOps`] so the provisioning state machine can run against a
//! fake in tests.

use std::{
    fs::{self, File, OpenOptions},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result, bail};
use extattr::{Flags as XattrFlags, lgetxattr, lsetxattr};
use rustix::mount::{MountFlags, UnmountFlags, mount, unmount};

use crate::defs;

const LOOP_SET_FD: i32 = 0x4C00;
const LOOP_CLR_FD: i32 = 0x4C01;
const LOOP_CTL_GET_FREE: i32 = 0x4C82;

nix::ioctl_write_int_bad!(loop_set_fd, LOOP_SET_FD);
nix::ioctl_none_bad!(loop_clr_fd, LOOP_CLR_FD);
nix::ioctl_none_bad!(loop_ctl_get_free, LOOP_CTL_GET_FREE);

pub trait SysOps {
    fn mount_tmpfs(&self, target: &Path, source: &str) -> Result<()>;
    fn unmount(&self, target: &Path) -> Result<()>;
    /// Probe whether `dir` accepts trusted-class xattrs by writing one to a
    /// scratch file and reading it back.
    fn supports_trusted_xattr(&self, dir: &Path) -> bool;
    fn attach_loop(&self, image: &Path) -> Result<PathBuf>;
    fn detach_loop(&self, device: &Path) -> Result<()>;
    fn mount_ext4(&self, device: &Path, target: &Path) -> Result<()>;
    fn mkfs_ext4(&self, image: &Path) -> Result<()>;
    fn fsck_ext4(&self, image: &Path) -> Result<()>;
}

pub struct Kernel;

impl SysOps for Kernel {
    fn mount_tmpfs(&self, target: &Path, source: &str) -> Result<()> {
        crate::utils::ensure_dir_exists(target)?;
        mount(source, target, "tmpfs", MountFlags::empty(), "mode=0755")
            .context("failed to mount tmpfs")?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        unmount(target, UnmountFlags::DETACH)
            .with_context(|| format!("failed to unmount {}", target.display()))?;
        Ok(())
    }

    fn supports_trusted_xattr(&self, dir: &Path) -> bool {
        let probe = dir.join(".xattr_probe");
        if fs::write(&probe, b"probe").is_err() {
            return false;
        }
        let supported = lsetxattr(
            &probe,
            defs::REPLACE_DIR_XATTR,
            b"y",
            XattrFlags::empty(),
        )
        .is_ok()
            && lgetxattr(&probe, defs::REPLACE_DIR_XATTR)
                .map(|v| v == b"y")
                .unwrap_or(false);
        let _ = fs::remove_file(&probe);
        supported
    }

    fn attach_loop(&self, image: &Path) -> Result<PathBuf> {
        let control = File::open("/dev/loop-control")
            .context("failed to open /dev/loop-control")?;
        let index = unsafe { loop_ctl_get_free(control.as_raw_fd()) }
            .context("LOOP_CTL_GET_FREE failed")?;

        let device = loop_device_path(index);
        let dev_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device)
            .with_context(|| format!("failed to open loop device {}", device.display()))?;
        let img_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(image)
            .with_context(|| format!("failed to open image {}", image.display()))?;

        unsafe { loop_set_fd(dev_file.as_raw_fd(), img_file.as_raw_fd()) }
            .with_context(|| format!("LOOP_SET_FD failed for {}", device.display()))?;

        log::debug!("attached {} to {}", image.display(), device.display());
        Ok(device)
    }

    fn detach_loop(&self, device: &Path) -> Result<()> {
        let dev_file = OpenOptions::new()
            .read(true)
            .open(device)
            .with_context(|| format!("failed to open loop device {}", device.display()))?;
        unsafe { loop_clr_fd(dev_file.as_raw_fd()) }
            .with_context(|| format!("LOOP_CLR_FD failed for {}", device.display()))?;
        Ok(())
    }

    fn mount_ext4(&self, device: &Path, target: &Path) -> Result<()> {
        crate::utils::ensure_dir_exists(target)?;
        mount(device, target, "ext4", MountFlags::NOATIME, "")
            .with_context(|| format!("failed to mount {} as ext4", device.display()))?;
        Ok(())
    }

    fn mkfs_ext4(&self, image: &Path) -> Result<()> {
        let status = Command::new("mkfs.ext4")
            .arg("-b")
            .arg("4096")
            .arg(image)
            .status()
            .context("failed to execute mkfs.ext4")?;
        if !status.success() {
            bail!("mkfs.ext4 failed with status {status}");
        }
        Ok(())
    }

    fn fsck_ext4(&self, image: &Path) -> Result<()> {
        let status = Command::new("e2fsck")
            .args(["-y", "-f"])
            .arg(image)
            .status()
            .context("failed to execute e2fsck")?;

        // e2fsck exits 1/2 when it repaired something; that still counts.
        if let Some(code) = status.code()
            && code > 2
        {
            bail!("e2fsck failed with exit code: {code}");
        }
        Ok(())
    }
}

fn loop_device_path(index: i32) -> PathBuf {
    let android = PathBuf::from(format!("/dev/block/loop{index}"));
    if android.exists() {
        android
    } else {
        PathBuf::from(format!("/dev/loop{index}"))
    }
}
