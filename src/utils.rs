// Copyright 2026 HybridMount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    ffi::CString,
    fs::{self, File, OpenOptions, create_dir_all, remove_dir_all, remove_file},
    io::Write,
    os::unix::{
        ffi::OsStrExt,
        fs::{FileTypeExt, MetadataExt, PermissionsExt, symlink},
    },
    path::{Path, PathBuf},
    sync::OnceLock,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result, bail};
use extattr::{Flags as XattrFlags, lgetxattr, llistxattr, lsetxattr};
use procfs::process::Process;
use regex_lite::Regex;
use rustix::fs::{FlockOperation, flock, ioctl_ficlone};
use walkdir::WalkDir;

use crate::defs;

const SELINUX_XATTR: &str = "security.selinux";
const OVERLAY_OPAQUE_XATTR: &str = "trusted.overlay.opaque";
const CONTEXT_SYSTEM: &str = "u:object_r:system_file:s0";
const CONTEXT_VENDOR: &str = "u:object_r:vendor_file:s0";
const CONTEXT_HAL: &str = "u:object_r:same_process_hal_file:s0";
const CONTEXT_ROOTFS: &str = "u:object_r:rootfs:s0";

static MODULE_ID_REGEX: OnceLock<Regex> = OnceLock::new();

pub fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    #[cfg(target_os = "android")]
    {
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(level)
                .with_tag("hybridmountd"),
        );
    }

    #[cfg(not(target_os = "android"))]
    {
        let mut builder = env_logger::Builder::new();
        builder.format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        });
        builder.filter_level(level).try_init().ok();
    }
    Ok(())
}

/// Write-temp-then-rename. A reader never observes a partial file, and the
/// temp file is cleaned up if anything fails before the rename.
pub fn atomic_write<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, content: C) -> Result<()> {
    let path = path.as_ref();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let temp_name = format!(
        ".hm_tmp_{}_{}.tmp",
        std::process::id(),
        SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos()
    );
    let temp_file = dir.join(temp_name);

    struct CleanupGuard<'a>(&'a Path);
    impl Drop for CleanupGuard<'_> {
        fn drop(&mut self) {
            let _ = fs::remove_file(self.0);
        }
    }
    let guard = CleanupGuard(&temp_file);

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_file)
            .context("failed to create temporary file for atomic write")?;
        file.write_all(content.as_ref())?;
        file.sync_all()?;
    }

    fs::rename(&temp_file, path).context("failed to commit atomic write")?;
    std::mem::forget(guard);
    Ok(())
}

pub fn validate_module_id(module_id: &str) -> Result<()> {
    let re = MODULE_ID_REGEX
        .get_or_init(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9._-]+$").expect("invalid regex pattern"));
    if re.is_match(module_id) {
        Ok(())
    } else {
        bail!("invalid module id: '{module_id}'. Must match /^[a-zA-Z][a-zA-Z0-9._-]+$/")
    }
}

pub fn ensure_dir_exists<T: AsRef<Path>>(dir: T) -> Result<()> {
    if !dir.as_ref().exists() {
        create_dir_all(&dir)?;
    }
    Ok(())
}

pub fn camouflage_process(name: &str) -> Result<()> {
    let c_name = CString::new(name)?;
    unsafe {
        libc::prctl(libc::PR_SET_NAME, c_name.as_ptr() as u64, 0, 0, 0);
    }
    Ok(())
}

pub fn random_kworker_name() -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    let hash = hasher.finish();

    format!("kworker/u{}:{}", hash % 16, (hash >> 4) % 10)
}

/// Advisory run lock. The kernel drops a flock when its holder dies, so a
/// crashed run never wedges the next boot.
pub struct RunLock {
    _file: File,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            ensure_dir_exists(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;
        flock(&file, FlockOperation::NonBlockingLockExclusive)
            .context("another hybridmountd run is already active")?;
        Ok(Self { _file: file })
    }
}

pub fn lsetfilecon<P: AsRef<Path>>(path: P, con: &str) -> Result<()> {
    if let Err(e) = lsetxattr(
        path.as_ref(),
        SELINUX_XATTR,
        con.as_bytes(),
        XattrFlags::empty(),
    ) {
        log::debug!(
            "lsetfilecon: {} -> {} failed: {}",
            path.as_ref().display(),
            con,
            std::io::Error::from(e)
        );
    }
    Ok(())
}

pub fn lgetfilecon<P: AsRef<Path>>(path: P) -> Result<String> {
    let con = lgetxattr(path.as_ref(), SELINUX_XATTR).with_context(|| {
        format!(
            "failed to get SELinux context for {}",
            path.as_ref().display()
        )
    })?;
    Ok(String::from_utf8_lossy(&con).trim_matches('\0').to_string())
}

pub fn set_overlay_opaque<P: AsRef<Path>>(path: P) -> Result<()> {
    lsetxattr(
        path.as_ref(),
        OVERLAY_OPAQUE_XATTR,
        b"y",
        XattrFlags::empty(),
    )?;
    Ok(())
}

fn copy_extended_attributes(src: &Path, dst: &Path) -> Result<()> {
    if let Ok(mut ctx) = lgetfilecon(src) {
        if ctx.contains(CONTEXT_ROOTFS) {
            ctx = CONTEXT_SYSTEM.to_string();
        }
        let _ = lsetfilecon(dst, &ctx);
    }

    if let Ok(opaque) = lgetxattr(src, OVERLAY_OPAQUE_XATTR) {
        lsetxattr(dst, OVERLAY_OPAQUE_XATTR, &opaque, XattrFlags::empty())
            .context("failed to set opaque xattr")?;
    }

    if let Ok(xattrs) = llistxattr(src) {
        for xattr_name in xattrs {
            let name_str = String::from_utf8_lossy(xattr_name.as_bytes());
            if name_str.starts_with("trusted.overlay.") && name_str != OVERLAY_OPAQUE_XATTR {
                if let Ok(val) = lgetxattr(src, &xattr_name) {
                    lsetxattr(dst, &xattr_name, &val, XattrFlags::empty()).ok();
                }
            }
        }
    }
    Ok(())
}

fn guess_context_by_path(path: &Path) -> &'static str {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/vendor") || path_str.starts_with("/odm") {
        if path_str.contains("/lib/") || path_str.contains("/lib64/") || path_str.ends_with(".so") {
            return CONTEXT_HAL;
        }
        return CONTEXT_VENDOR;
    }

    CONTEXT_SYSTEM
}

/// Re-labels a staged file whose copied context is missing or useless. The
/// real partition path is the reference; its parent is the fallback.
fn restore_system_context(staged: &Path, relative: &Path) -> Result<()> {
    let current = lgetfilecon(staged).ok();
    if let Some(ctx) = &current
        && !ctx.is_empty()
        && ctx != CONTEXT_ROOTFS
        && ctx != "u:object_r:unlabeled:s0"
    {
        return Ok(());
    }

    let system_path = Path::new("/").join(relative);
    if system_path.exists()
        && let Ok(sys_ctx) = lgetfilecon(&system_path)
    {
        let target_ctx = if sys_ctx == CONTEXT_ROOTFS {
            CONTEXT_SYSTEM
        } else {
            &sys_ctx
        };
        let _ = lsetfilecon(staged, target_ctx);
        return Ok(());
    }

    if let Some(parent) = system_path.parent()
        && parent.exists()
        && let Ok(parent_ctx) = lgetfilecon(parent)
        && parent_ctx != CONTEXT_ROOTFS
    {
        let _ = lsetfilecon(staged, &parent_ctx);
        return Ok(());
    }

    let _ = lsetfilecon(staged, guess_context_by_path(&system_path));
    Ok(())
}

pub fn reflink_or_copy(src: &Path, dest: &Path) -> Result<u64> {
    let src_file = File::open(src)?;
    let dest_file = File::create(dest)?;

    if ioctl_ficlone(&dest_file, &src_file).is_ok() {
        let metadata = src_file.metadata()?;
        let len = metadata.len();
        dest_file.set_permissions(metadata.permissions())?;
        return Ok(len);
    }
    drop(dest_file);
    drop(src_file);
    fs::copy(src, dest).map_err(|e| e.into())
}

fn make_device_node(path: &Path, mode: u32, rdev: u64) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes())?;
    let dev = rdev as libc::dev_t;
    unsafe {
        if libc::mknod(c_path.as_ptr(), mode as libc::mode_t, dev) != 0 {
            let err = std::io::Error::last_os_error();
            bail!("mknod failed for {}: {}", path.display(), err);
        }
    }
    Ok(())
}

fn iterative_sync(src: &Path, dst: &Path, repair: bool) -> Result<()> {
    let mut stack: Vec<(PathBuf, PathBuf, PathBuf)> =
        vec![(src.to_path_buf(), dst.to_path_buf(), PathBuf::new())];

    while let Some((curr_src, curr_dst, rel_path)) = stack.pop() {
        if !curr_dst.exists() {
            if curr_src.is_dir() {
                create_dir_all(&curr_dst)?;
            }
            if let Ok(src_meta) = curr_src.metadata() {
                let _ = fs::set_permissions(&curr_dst, src_meta.permissions());
            }
            let _ = copy_extended_attributes(&curr_src, &curr_dst);
            if repair {
                let _ = restore_system_context(&curr_dst, &rel_path);
            }
        }

        if curr_src.is_dir() {
            for entry in fs::read_dir(&curr_src)? {
                let entry = entry?;
                let s = entry.path();
                let name = entry.file_name();
                let d = curr_dst.join(&name);
                let next_rel = rel_path.join(&name);

                let metadata = fs::symlink_metadata(&s)?;
                let ft = metadata.file_type();

                if ft.is_dir() {
                    stack.push((s, d, next_rel));
                } else {
                    if ft.is_symlink() {
                        if d.exists() {
                            remove_file(&d)?;
                        }
                        symlink(fs::read_link(&s)?, &d)?;
                    } else if ft.is_char_device() || ft.is_block_device() || ft.is_fifo() {
                        if d.exists() {
                            remove_file(&d)?;
                        }
                        make_device_node(&d, metadata.permissions().mode(), metadata.rdev())?;
                    } else {
                        reflink_or_copy(&s, &d)?;
                    }

                    let _ = copy_extended_attributes(&s, &d);
                    if repair {
                        let _ = restore_system_context(&d, &next_rel);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Copies a module tree wholesale, preserving permissions, symlinks, device
/// nodes and the extended attributes the mount phase depends on.
pub fn sync_dir(src: &Path, dst: &Path, repair_context: bool) -> Result<()> {
    if !src.exists() {
        return Ok(());
    }
    ensure_dir_exists(dst)?;
    iterative_sync(src, dst, repair_context)
        .with_context(|| format!("failed to sync {} to {}", src.display(), dst.display()))
}

pub fn prune_empty_dirs<P: AsRef<Path>>(root: P) -> Result<()> {
    let root = root.as_ref();
    if !root.exists() {
        return Ok(());
    }

    for entry in WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_dir() {
            let path = entry.path();
            if fs::remove_dir(path).is_ok() {
                log::debug!("pruned empty dir: {}", path.display());
            }
        }
    }
    Ok(())
}

pub fn is_mounted<P: AsRef<Path>>(path: P) -> bool {
    let path_str = path.as_ref().to_string_lossy();
    let search = path_str.trim_end_matches('/');

    if let Ok(process) = Process::myself()
        && let Ok(mountinfo) = process.mountinfo()
    {
        return mountinfo
            .into_iter()
            .any(|m| m.mount_point.to_string_lossy() == search);
    }

    if let Ok(content) = fs::read_to_string("/proc/mounts") {
        for line in content.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() > 1 && parts[1] == search {
                return true;
            }
        }
    }
    false
}

/// True when a mount at or below `target` carries our source label, meaning a
/// previous run already serviced this target.
pub fn mounted_with_source(target: &Path, source: &str) -> bool {
    let prefix = target.to_path_buf();
    if let Ok(process) = Process::myself()
        && let Ok(mountinfo) = process.mountinfo()
    {
        return mountinfo.into_iter().any(|m| {
            m.mount_point.starts_with(&prefix)
                && m.mount_source.as_deref() == Some(source)
        });
    }
    false
}

pub fn select_temp_dir() -> Result<PathBuf> {
    for cand in defs::TEMP_DIR_CANDIDATES {
        let p = Path::new(cand);
        if p.is_dir() && is_mounted(p) {
            return Ok(p.join(".hm_workspace"));
        }
    }
    Ok(Path::new(defs::RUN_DIR).join("workspace"))
}

pub fn ensure_temp_dir(temp_dir: &Path) -> Result<()> {
    if temp_dir.exists() {
        remove_dir_all(temp_dir).ok();
    }
    create_dir_all(temp_dir)?;
    Ok(())
}

pub fn cleanup_temp_dir(temp_dir: &Path) {
    if let Err(e) = remove_dir_all(temp_dir) {
        log::warn!("failed to clean up temp dir {}: {:#}", temp_dir.display(), e);
    }
}

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1}G", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.0}M", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.0}K", bytes as f64 / KB as f64)
    } else {
        format!("{bytes}B")
    }
}
