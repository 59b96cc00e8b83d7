// Copyright 2026 HybridMount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

pub const BASE_DIR: &str = "/data/adb/hybridmount";
pub const CONFIG_FILE_DEFAULT: &str = "/data/adb/hybridmount/config.toml";
pub const MODULE_MODES_FILE: &str = "/data/adb/hybridmount/module_modes";
pub const BOOT_COUNT_FILE: &str = "/data/adb/hybridmount/boot_count";

pub const MODULES_DIR: &str = "/data/adb/modules";
pub const SELF_MODULE_ID: &str = "hybridmount";
pub const MODULE_PROP_FILE: &str = "/data/adb/modules/hybridmount/module.prop";

pub const RUN_DIR: &str = "/dev/hybridmount/run";
pub const STATE_FILE: &str = "/dev/hybridmount/run/state.json";
pub const LOCK_FILE: &str = "/dev/hybridmount/run/daemon.lock";

pub const DEFAULT_CONTENT_DIR: &str = "/mnt/vendor/hybridmount";
pub const IMAGE_FILE_NAME: &str = "modules.img";
pub const IMAGE_SIZE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

// RW support area for OverlayFS upperdir/workdir pairs. Lives on the staging
// backend so the writable side of the union shares a filesystem with the
// staged layers.
pub const RW_DIR_NAME: &str = ".rw";
pub const FINGERPRINT_FILE_NAME: &str = ".fingerprint";

pub const DISABLE_FILE_NAME: &str = "disable";
pub const REMOVE_FILE_NAME: &str = "remove";
pub const SKIP_MOUNT_FILE_NAME: &str = "skip_mount";

pub const REPLACE_DIR_FILE_NAME: &str = ".replace";
pub const REPLACE_DIR_XATTR: &str = "trusted.overlay.opaque";

pub const BUILTIN_PARTITIONS: &[&str] = &[
    "system",
    "vendor",
    "product",
    "system_ext",
    "odm",
    "oem",
];

pub const TEMP_DIR_CANDIDATES: &[&str] = &["/debug_ramdisk", "/sbin"];
