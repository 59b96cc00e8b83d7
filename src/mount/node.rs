// Copyright 2026 HybridMount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    collections::{HashMap, hash_map::Entry},
    fmt,
    fs::{DirEntry, FileType},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use anyhow::Result;
use extattr::lgetxattr;

use crate::defs::{REPLACE_DIR_FILE_NAME, REPLACE_DIR_XATTR};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFileType {
    RegularFile,
    Directory,
    Symlink,
    /// A 0:0 character device in a module tree hides the original path.
    Whiteout,
}

impl NodeFileType {
    pub fn from_file_type(file_type: FileType) -> Option<Self> {
        if file_type.is_file() {
            Some(Self::RegularFile)
        } else if file_type.is_dir() {
            Some(Self::Directory)
        } else if file_type.is_symlink() {
            Some(Self::Symlink)
        } else {
            None
        }
    }
}

/// One entry in the synthetic bind tree built for a Magic task. The tree is
/// merged from every contributing module's staged subtree before any mount
/// syscall is issued.
pub struct Node {
    pub name: String,
    pub file_type: NodeFileType,
    pub children: HashMap<String, Node>,
    pub module_path: Option<PathBuf>,
    pub replace: bool,
    pub skip: bool,
}

impl Node {
    pub fn new_root<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            file_type: NodeFileType::Directory,
            children: HashMap::new(),
            module_path: None,
            replace: false,
            skip: false,
        }
    }

    fn from_entry(name: &str, entry: &DirEntry) -> Option<Self> {
        let metadata = entry.metadata().ok()?;
        let path = entry.path();
        let file_type = if metadata.file_type().is_char_device() && metadata.rdev() == 0 {
            Some(NodeFileType::Whiteout)
        } else {
            NodeFileType::from_file_type(metadata.file_type())
        }?;
        let replace = file_type == NodeFileType::Directory && dir_is_replace(&path);
        Some(Self {
            name: name.to_string(),
            file_type,
            children: HashMap::new(),
            module_path: Some(path),
            replace,
            skip: false,
        })
    }

    /// Merges one staged module subtree into this node. Modules are merged in
    /// plan order, so a later module's entry wins on a path conflict.
    pub fn collect(&mut self, module_dir: &Path) -> Result<bool> {
        let mut has_file = false;
        for entry in module_dir.read_dir()?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == REPLACE_DIR_FILE_NAME {
                continue;
            }
            let Some(fresh) = Node::from_entry(&name, &entry) else {
                continue;
            };
            let fresh_is_dir = fresh.file_type == NodeFileType::Directory;

            let node = match self.children.entry(name) {
                Entry::Vacant(v) => v.insert(fresh),
                Entry::Occupied(o) => {
                    let slot = o.into_mut();
                    if fresh_is_dir && slot.file_type == NodeFileType::Directory {
                        if fresh.replace {
                            slot.replace = true;
                            slot.module_path = fresh.module_path;
                        }
                    } else {
                        *slot = fresh;
                    }
                    slot
                }
            };

            has_file |= if node.file_type == NodeFileType::Directory {
                node.collect(&entry.path())? || node.replace
            } else {
                true
            };
        }
        Ok(has_file)
    }

    fn render(&self, f: &mut fmt::Formatter<'_>, prefix: &str, last: bool) -> fmt::Result {
        let branch = if last { "╰── " } else { "├── " };
        let tag = match self.file_type {
            NodeFileType::RegularFile => "file",
            NodeFileType::Directory => {
                if self.replace {
                    "dir!"
                } else {
                    "dir"
                }
            }
            NodeFileType::Symlink => "link",
            NodeFileType::Whiteout => "wht",
        };
        writeln!(f, "{prefix}{branch}[{tag}] {}", self.name)?;

        let child_prefix = format!("{prefix}{}", if last { "    " } else { "│   " });
        let mut names: Vec<&String> = self.children.keys().collect();
        names.sort();
        for (i, name) in names.iter().enumerate() {
            self.children[*name].render(f, &child_prefix, i == names.len() - 1)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", if self.name.is_empty() { "/" } else { &self.name })?;
        let mut names: Vec<&String> = self.children.keys().collect();
        names.sort();
        for (i, name) in names.iter().enumerate() {
            self.children[*name].render(f, "", i == names.len() - 1)?;
        }
        Ok(())
    }
}

fn dir_is_replace<P: AsRef<Path>>(path: P) -> bool {
    if let Ok(v) = lgetxattr(&path, REPLACE_DIR_XATTR)
        && String::from_utf8_lossy(&v) == "y"
    {
        return true;
    }
    path.as_ref().join(REPLACE_DIR_FILE_NAME).exists()
}
