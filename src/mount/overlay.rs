// Copyright 2026 HybridMount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    ffi::CString,
    os::fd::{AsFd, AsRawFd},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use procfs::process::Process;
use rustix::{
    fs::CWD,
    mount::{
        FsMountFlags, FsOpenFlags, MountAttrFlags, MountFlags, MoveMountFlags, OpenTreeFlags,
        UnmountFlags, fsconfig_create, fsconfig_set_string, fsmount, fsopen, mount, move_mount,
        open_tree, unmount,
    },
};

/// Mounts an overlay at `dest`. `lower_dirs` are ordered top-most first;
/// `lowest` is the stock content and always forms the bottom layer. Tries the
/// new mount API first and falls back to classic mount(2) on kernels without
/// fsopen support.
pub fn mount_overlayfs(
    lower_dirs: &[String],
    lowest: &str,
    upperdir: Option<PathBuf>,
    workdir: Option<PathBuf>,
    dest: impl AsRef<Path>,
    mount_source: &str,
) -> Result<()> {
    let lowerdir_config = lower_dirs
        .iter()
        .map(|s| s.as_ref())
        .chain(std::iter::once(lowest))
        .collect::<Vec<_>>()
        .join(":");
    log::info!(
        "mount overlayfs on {}, lowerdir={}, upperdir={:?}, workdir={:?}",
        dest.as_ref().display(),
        lowerdir_config,
        upperdir,
        workdir
    );

    let upperdir_s = upperdir
        .filter(|up| up.exists())
        .map(|e| e.display().to_string());
    let workdir_s = workdir
        .filter(|wd| wd.exists())
        .map(|e| e.display().to_string());

    let result = (|| {
        let fs = fsopen("overlay", FsOpenFlags::FSOPEN_CLOEXEC)?;
        let fs = fs.as_fd();
        fsconfig_set_string(fs, "lowerdir", &lowerdir_config)?;
        if let (Some(upper), Some(work)) = (&upperdir_s, &workdir_s) {
            fsconfig_set_string(fs, "upperdir", upper)?;
            fsconfig_set_string(fs, "workdir", work)?;
        }
        fsconfig_set_string(fs, "source", mount_source)?;
        fsconfig_create(fs)?;
        let mnt = fsmount(fs, FsMountFlags::FSMOUNT_CLOEXEC, MountAttrFlags::empty())?;
        move_mount(
            mnt.as_fd(),
            "",
            CWD,
            dest.as_ref(),
            MoveMountFlags::MOVE_MOUNT_F_EMPTY_PATH,
        )
    })();

    if let Err(e) = result {
        log::warn!("fsopen mount failed: {e:#}, fallback to mount(2)");
        let mut data = format!("lowerdir={lowerdir_config}");
        if let (Some(upper), Some(work)) = (upperdir_s, workdir_s) {
            data = format!("{data},upperdir={upper},workdir={work}");
        }
        let data_c = CString::new(data)?;
        mount(
            mount_source,
            dest.as_ref(),
            "overlay",
            MountFlags::empty(),
            data_c.as_c_str(),
        )?;
    }

    Ok(())
}

/// Clones the mount tree at `from` onto `to`. Prefers open_tree + move_mount;
/// degrades to a recursive bind mount.
pub fn bind_mount(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
    let result = (|| {
        let tree = open_tree(
            CWD,
            from.as_ref(),
            OpenTreeFlags::OPEN_TREE_CLOEXEC
                | OpenTreeFlags::OPEN_TREE_CLONE
                | OpenTreeFlags::AT_RECURSIVE,
        )?;
        move_mount(
            tree.as_fd(),
            "",
            CWD,
            to.as_ref(),
            MoveMountFlags::MOVE_MOUNT_F_EMPTY_PATH,
        )
    })();

    if result.is_err() {
        log::debug!("open_tree failed, falling back to classic bind mount");
        mount(
            from.as_ref(),
            to.as_ref(),
            "",
            MountFlags::BIND | MountFlags::REC,
            "",
        )
        .context("bind mount failed")?;
    }
    Ok(())
}

fn mount_overlay_child(
    mount_point: &str,
    relative: &str,
    module_roots: &[String],
    stock_root: &str,
    mount_source: &str,
) -> Result<()> {
    if !module_roots
        .iter()
        .any(|lower| Path::new(lower).join(relative).exists())
    {
        return bind_mount(stock_root, mount_point);
    }

    if !Path::new(stock_root).is_dir() {
        return Ok(());
    }

    let mut lower_dirs: Vec<String> = vec![];
    for lower in module_roots {
        let lower_path = Path::new(lower).join(relative);
        if lower_path.is_dir() {
            lower_dirs.push(lower_path.display().to_string());
        } else if lower_path.exists() {
            // module replaces the child mount point with a file; leave it be
            return Ok(());
        }
    }

    if lower_dirs.is_empty() {
        return Ok(());
    }

    if let Err(e) = mount_overlayfs(
        &lower_dirs,
        stock_root,
        None,
        None,
        mount_point,
        mount_source,
    ) {
        log::warn!("failed to overlay child {mount_point}: {e:#}, fallback to bind mount");
        bind_mount(stock_root, mount_point)?;
    }
    Ok(())
}

/// Overlays one partition root. Child mounts that live below the root are
/// re-covered afterwards so an existing nested mount (e.g. an APEX) survives;
/// if any child fails the whole root is reverted so the partition is never
/// left half-covered.
pub fn mount_overlay(
    root: &str,
    module_roots: &[String],
    upperdir: Option<PathBuf>,
    workdir: Option<PathBuf>,
    mount_source: &str,
) -> Result<()> {
    log::info!("mount overlay for {root}");

    // Keep a handle on the stock content so nested mounts can still reach it
    // after the root is covered.
    let root_file = std::fs::File::open(root)
        .with_context(|| format!("failed to open target root {root}"))?;
    let stock_root_base = format!("/proc/self/fd/{}", root_file.as_raw_fd());

    let mounts = Process::myself()?.mountinfo().context("get mountinfo")?;
    let mut mount_seq = mounts
        .0
        .iter()
        .filter(|m| {
            let mp = m.mount_point.to_string_lossy();
            mp.starts_with(root) && mp != root
        })
        .map(|m| m.mount_point.to_string_lossy().to_string())
        .collect::<Vec<_>>();
    mount_seq.sort();
    mount_seq.dedup();

    mount_overlayfs(module_roots, root, upperdir, workdir, root, mount_source)
        .context("mount overlayfs for root failed")?;

    for mount_point in mount_seq {
        let relative = mount_point.replacen(root, "", 1);
        let relative_clean = relative.trim_start_matches('/');
        let stock_root = format!("{stock_root_base}/{relative_clean}");

        if !Path::new(&stock_root).exists() {
            continue;
        }

        if let Err(e) = mount_overlay_child(
            &mount_point,
            relative_clean,
            module_roots,
            &stock_root,
            mount_source,
        ) {
            log::warn!("failed to mount overlay for child {mount_point}: {e:#}, revert");
            umount_dir(root).with_context(|| format!("failed to revert {root}"))?;
            bail!(e);
        }
    }
    Ok(())
}

pub fn umount_dir(src: impl AsRef<Path>) -> Result<()> {
    unmount(src.as_ref(), UnmountFlags::DETACH)
        .with_context(|| format!("failed to umount {}", src.as_ref().display()))?;
    Ok(())
}
