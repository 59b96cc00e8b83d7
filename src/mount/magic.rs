// Copyright 2026 HybridMount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

//! Magic Mount: builds the illusion of a modified partition by bind-mounting
//! individual files and directories over the stock paths, without a union
//! filesystem. Directories whose children cannot be expressed as plain binds
//! (symlinks, whiteouts, type changes) get a tmpfs stand-in that mirrors the
//! untouched siblings and is then moved over the original directory.

use std::{
    fs::{self, DirEntry, create_dir, create_dir_all, read_link},
    os::unix::fs::{MetadataExt, symlink},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use rustix::{
    fs::{Gid, Mode, Uid, chmod, chown},
    mount::{
        MountFlags, MountPropagationFlags, UnmountFlags, mount, mount_bind, mount_change,
        mount_move, mount_remount, unmount,
    },
};

use crate::{
    mount::node::{Node, NodeFileType},
    utils::{ensure_dir_exists, lgetfilecon, lsetfilecon},
};

/// Applies the bind tree for one partition. `layers` are (module id, staged
/// partition subtree) pairs in plan order; later layers shadow earlier ones.
/// A module whose subtree cannot be read degrades to absent, it does not
/// abort the partition.
pub fn mount_partition(
    workspace: &Path,
    target: &Path,
    layers: &[(String, PathBuf)],
    mount_source: &str,
) -> Result<()> {
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("invalid partition target {}", target.display()))?
        .to_string();

    let mut root = Node::new_root(name.clone());
    let mut has_file = false;
    for (id, content) in layers {
        match root.collect(content) {
            Ok(found) => has_file |= found,
            Err(e) => log::warn!("skipping module '{id}' for {}: {e:#}", target.display()),
        }
    }
    if !has_file {
        log::debug!("no magic mount content for {}", target.display());
        return Ok(());
    }

    log::info!("[magic mount tree for {}]", target.display());
    for line in format!("{root:?}").lines() {
        log::info!("   {line}");
    }

    let work_dir = workspace.join(format!("workdir_{name}"));
    ensure_dir_exists(&work_dir)?;
    mount(mount_source, &work_dir, "tmpfs", MountFlags::empty(), "")
        .context("mount workspace tmpfs")?;
    mount_change(&work_dir, MountPropagationFlags::PRIVATE).context("make workspace private")?;

    let parent = target
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));
    let result = mount_node(&parent, &work_dir, root, false);

    if let Err(e) = unmount(&work_dir, UnmountFlags::DETACH) {
        log::error!("failed to unmount workspace: {e:#}");
    }
    fs::remove_dir(&work_dir).ok();

    result
}

fn clone_symlink<S: AsRef<Path>>(src: S, dst: S) -> Result<()> {
    let src_symlink = read_link(src.as_ref())?;
    symlink(&src_symlink, dst.as_ref())?;
    if let Ok(ctx) = lgetfilecon(src.as_ref()) {
        let _ = lsetfilecon(dst.as_ref(), ctx.as_str());
    }
    Ok(())
}

/// Recreates one untouched sibling inside a tmpfs stand-in: files become
/// binds to the stock content, directories recurse, symlinks are cloned.
fn mount_mirror<P: AsRef<Path>>(path: P, work_dir_path: P, entry: &DirEntry) -> Result<()> {
    let path = path.as_ref().join(entry.file_name());
    let work_dir_path = work_dir_path.as_ref().join(entry.file_name());
    let file_type = entry.file_type()?;

    if file_type.is_file() {
        fs::File::create(&work_dir_path)?;
        mount_bind(&path, &work_dir_path)?;
    } else if file_type.is_dir() {
        create_dir(&work_dir_path)?;
        let metadata = entry.metadata()?;
        chmod(&work_dir_path, Mode::from_raw_mode(metadata.mode()))?;
        chown(
            &work_dir_path,
            Some(Uid::from_raw(metadata.uid())),
            Some(Gid::from_raw(metadata.gid())),
        )?;
        if let Ok(ctx) = lgetfilecon(&path) {
            let _ = lsetfilecon(&work_dir_path, ctx.as_str());
        }
        for entry in path.read_dir()?.flatten() {
            mount_mirror(&path, &work_dir_path, &entry)?;
        }
    } else if file_type.is_symlink() {
        clone_symlink(&path, &work_dir_path)?;
    }

    Ok(())
}

fn mount_node(real_parent: &Path, work_parent: &Path, mut node: Node, has_tmpfs: bool) -> Result<()> {
    let real_path = real_parent.join(&node.name);
    let work_path = work_parent.join(&node.name);

    match node.file_type {
        NodeFileType::RegularFile => {
            let target = if has_tmpfs {
                fs::File::create(&work_path)?;
                &work_path
            } else {
                &real_path
            };
            let Some(module_path) = &node.module_path else {
                bail!("no module source for file {}", real_path.display());
            };
            mount_bind(module_path, target).with_context(|| {
                format!("bind {} -> {}", module_path.display(), target.display())
            })?;
            if let Err(e) = mount_remount(target, MountFlags::RDONLY | MountFlags::BIND, "") {
                log::warn!("make file {} ro: {e:#}", target.display());
            }
        }
        NodeFileType::Symlink => {
            let Some(module_path) = &node.module_path else {
                bail!("no module source for symlink {}", real_path.display());
            };
            clone_symlink(module_path.as_path(), work_path.as_path()).with_context(|| {
                format!(
                    "clone module symlink {} -> {}",
                    module_path.display(),
                    work_path.display()
                )
            })?;
        }
        NodeFileType::Whiteout => {
            log::debug!("hiding {}", real_path.display());
        }
        NodeFileType::Directory => {
            let mut create_tmpfs = !has_tmpfs && node.replace && node.module_path.is_some();

            // A plain bind cannot express symlinks, whiteouts or type
            // changes; those force a tmpfs stand-in for this directory.
            if !has_tmpfs && !create_tmpfs {
                for (name, child) in &mut node.children {
                    let child_real = real_path.join(name);
                    let need = match child.file_type {
                        NodeFileType::Symlink => true,
                        NodeFileType::Whiteout => child_real.exists(),
                        _ => {
                            if let Ok(metadata) = child_real.symlink_metadata() {
                                let ft = NodeFileType::from_file_type(metadata.file_type())
                                    .unwrap_or(NodeFileType::Whiteout);
                                ft != child.file_type || ft == NodeFileType::Symlink
                            } else {
                                true
                            }
                        }
                    };
                    if need {
                        if node.module_path.is_none() && !real_path.exists() {
                            log::error!(
                                "cannot create stand-in below missing {}, skipping {name}",
                                real_path.display()
                            );
                            child.skip = true;
                            continue;
                        }
                        create_tmpfs = true;
                        break;
                    }
                }
            }

            let has_tmpfs = has_tmpfs || create_tmpfs;

            if has_tmpfs {
                create_dir_all(&work_path)?;
                let (metadata, reference) = if real_path.exists() {
                    (real_path.metadata()?, real_path.clone())
                } else if let Some(module_path) = &node.module_path {
                    (module_path.metadata()?, module_path.clone())
                } else {
                    bail!("no reference metadata for {}", real_path.display());
                };
                chmod(&work_path, Mode::from_raw_mode(metadata.mode()))?;
                chown(
                    &work_path,
                    Some(Uid::from_raw(metadata.uid())),
                    Some(Gid::from_raw(metadata.gid())),
                )?;
                lsetfilecon(&work_path, lgetfilecon(&reference)?.as_str())?;
            }

            if create_tmpfs {
                mount_bind(&work_path, &work_path).with_context(|| {
                    format!("preparing stand-in for {}", real_path.display())
                })?;
            }

            if real_path.exists() && !node.replace {
                for entry in real_path.read_dir()?.flatten() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    let result = if let Some(child) = node.children.remove(&name) {
                        if child.skip {
                            continue;
                        }
                        mount_node(&real_path, &work_path, child, has_tmpfs)
                            .with_context(|| format!("magic mount {}/{name}", real_path.display()))
                    } else if has_tmpfs {
                        mount_mirror(&real_path, &work_path, &entry)
                            .with_context(|| format!("mirror {}/{name}", real_path.display()))
                    } else {
                        Ok(())
                    };

                    if let Err(e) = result {
                        if has_tmpfs {
                            return Err(e);
                        }
                        log::error!("mount child {}/{name} failed: {e:#}", real_path.display());
                    }
                }
            }

            if node.replace && node.module_path.is_none() {
                bail!(
                    "dir {} is declared replaced but has no module source",
                    real_path.display()
                );
            }

            let children = std::mem::take(&mut node.children);
            for (name, child) in children {
                if child.skip {
                    continue;
                }
                if let Err(e) = mount_node(&real_path, &work_path, child, has_tmpfs)
                    .with_context(|| format!("magic mount {}/{name}", real_path.display()))
                {
                    if has_tmpfs {
                        return Err(e);
                    }
                    log::error!("mount child {}/{name} failed: {e:#}", real_path.display());
                }
            }

            if create_tmpfs {
                if let Err(e) = mount_remount(&work_path, MountFlags::RDONLY | MountFlags::BIND, "")
                {
                    log::warn!("make dir {} ro: {e:#}", real_path.display());
                }
                mount_move(&work_path, &real_path).with_context(|| {
                    format!(
                        "moving stand-in {} -> {}",
                        work_path.display(),
                        real_path.display()
                    )
                })?;
                if let Err(e) = mount_change(&real_path, MountPropagationFlags::PRIVATE) {
                    log::warn!("make dir {} private: {e:#}", real_path.display());
                }
            }
        }
    }

    Ok(())
}
