// Copyright 2026 HybridMount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

//! Best-effort stealth cleanup. A loop-image backend leaves an ext4 entry in
//! sysfs that names our backing mount; when enabled, we ask the KernelSU
//! driver to strip it. Failure only costs stealth, never functionality.

use std::{ffi::CString, os::fd::RawFd, path::Path, sync::OnceLock};

use anyhow::{Context, Result, bail};

use crate::{
    config::Config,
    core::storage::{BackendKind, StorageBackend},
    error::Fault,
};

const KSU_INSTALL_MAGIC1: u32 = 0xDEADBEEF;
const KSU_INSTALL_MAGIC2: u32 = 0xCAFEBABE;
const KSU_IOCTL_NUKE_EXT4_SYSFS: u32 = 0x4000_4B11;

static DRIVER_FD: OnceLock<RawFd> = OnceLock::new();

#[repr(C)]
struct NukeExt4SysfsCmd {
    arg: u64,
}

nix::ioctl_write_ptr_bad!(
    ksu_nuke_ext4_sysfs,
    KSU_IOCTL_NUKE_EXT4_SYSFS,
    NukeExt4SysfsCmd
);

// The driver hands out its fd through the reboot-syscall handshake; the
// magic pair keeps the call inert on a stock kernel.
fn grab_fd() -> RawFd {
    let mut fd: RawFd = -1;
    unsafe {
        libc::syscall(
            libc::SYS_reboot,
            KSU_INSTALL_MAGIC1,
            KSU_INSTALL_MAGIC2,
            0,
            &mut fd,
        );
    }
    fd
}

pub fn strip_sysfs_traces(target: &Path) -> Result<()> {
    let c_path = CString::new(target.as_os_str().as_encoded_bytes())?;
    let cmd = NukeExt4SysfsCmd {
        arg: c_path.as_ptr() as u64,
    };

    let fd = *DRIVER_FD.get_or_init(grab_fd);
    if fd < 0 {
        bail!("kernel driver not available");
    }

    unsafe {
        ksu_nuke_ext4_sysfs(fd, &cmd).context("nuke sysfs ioctl failed")?;
    }
    Ok(())
}

/// Returns whether the cleanup actually ran, for the run-state snapshot.
pub fn run(config: &Config, backend: &StorageBackend) -> bool {
    if !config.enable_nuke {
        return false;
    }
    if backend.kind != BackendKind::LoopImage {
        log::debug!("tmpfs backend leaves no ext4 sysfs trace, nothing to strip");
        return false;
    }

    match strip_sysfs_traces(&backend.mount_point) {
        Ok(()) => {
            log::info!("stripped sysfs traces for {}", backend.mount_point.display());
            true
        }
        Err(e) => {
            log::warn!("{}", Fault::Stealth(format!("{e:#}")));
            false
        }
    }
}
