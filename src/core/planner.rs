// Copyright 2026 HybridMount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

//! Mount planner. Two passes per target partition: force-magic modules are
//! extracted into a Magic task first, everything else is grouped into one
//! Overlay task. The separation lets a single partition be served by both
//! strategies at once without either stepping on the other.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::core::inventory::{ModuleRecord, MountMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Overlay,
    Magic,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overlay => "overlay",
            Self::Magic => "magic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Mounted,
    FailedRetrying,
    FailedFinal,
}

/// One module's staged subtree for one partition. Layer order is scan order;
/// on conflicting paths the later layer shadows the earlier one.
#[derive(Debug, Clone)]
pub struct ModuleLayer {
    pub id: String,
    pub content: PathBuf,
}

#[derive(Debug, Clone)]
pub struct MountTask {
    pub partition: String,
    pub target: PathBuf,
    pub strategy: Strategy,
    pub layers: Vec<ModuleLayer>,
    pub status: TaskStatus,
}

impl MountTask {
    pub fn module_ids(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.id.clone()).collect()
    }
}

#[derive(Debug, Default)]
pub struct MountPlan {
    pub tasks: Vec<MountTask>,
}

impl MountPlan {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn print_visuals(&self) {
        if self.tasks.is_empty() {
            log::info!("mount plan is empty, standby");
            return;
        }
        for (i, task) in self.tasks.iter().enumerate() {
            let last_task = i == self.tasks.len() - 1;
            let branch = if last_task { "╰──" } else { "├──" };
            log::info!(
                "{branch} [{}] {} ({} layers)",
                task.strategy.as_str(),
                task.target.display(),
                task.layers.len()
            );
            let prefix = if last_task { "    " } else { "│   " };
            for (j, layer) in task.layers.iter().enumerate() {
                let sub = if j == task.layers.len() - 1 {
                    "╰──"
                } else {
                    "├──"
                };
                log::info!("{prefix}{sub} {}", layer.id);
            }
        }
    }
}

/// Builds the plan from staged content. `fs_root` is the filesystem the
/// partitions live under, `/` in production. Partitions nobody contributes
/// to, and targets that do not resolve to a real directory, produce no task.
pub fn generate(
    records: &[ModuleRecord],
    storage_root: &Path,
    partitions: &[String],
    fs_root: &Path,
) -> MountPlan {
    let mut overlay_tasks = Vec::new();
    let mut magic_tasks = Vec::new();

    for partition in partitions {
        let target = fs_root.join(partition);
        let target = match target.canonicalize() {
            Ok(t) => t,
            Err(_) => {
                log::debug!("target /{partition} does not resolve, skipping");
                continue;
            }
        };
        if !target.is_dir() {
            continue;
        }

        let mut overlay_layers = Vec::new();
        let mut magic_layers = Vec::new();

        for record in records.iter().filter(|r| r.enabled) {
            let content = storage_root.join(&record.id).join(partition);
            if !content.is_dir() || !has_files(&content) {
                continue;
            }
            let layer = ModuleLayer {
                id: record.id.clone(),
                content,
            };
            match record.mode {
                MountMode::ForceMagic => magic_layers.push(layer),
                MountMode::Auto | MountMode::ForceOverlay => overlay_layers.push(layer),
            }
        }

        if !overlay_layers.is_empty() {
            overlay_tasks.push(MountTask {
                partition: partition.clone(),
                target: target.clone(),
                strategy: Strategy::Overlay,
                layers: overlay_layers,
                status: TaskStatus::Pending,
            });
        }
        if !magic_layers.is_empty() {
            magic_tasks.push(MountTask {
                partition: partition.clone(),
                target,
                strategy: Strategy::Magic,
                layers: magic_layers,
                status: TaskStatus::Pending,
            });
        }
    }

    // Overlay tasks run first so magic binds for the same partition land on
    // top of the already-mounted union.
    overlay_tasks.extend(magic_tasks);
    MountPlan {
        tasks: overlay_tasks,
    }
}

fn has_files(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.flatten().next().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::inventory::scan;
    use std::collections::HashMap;

    struct Scratch {
        _dir: tempfile::TempDir,
        modules: PathBuf,
        storage: PathBuf,
        fs_root: PathBuf,
    }

    fn scratch() -> Scratch {
        let dir = tempfile::tempdir().unwrap();
        let modules = dir.path().join("modules");
        let storage = dir.path().join("storage");
        let fs_root = dir.path().join("root");
        fs::create_dir_all(fs_root.join("system")).unwrap();
        fs::create_dir_all(fs_root.join("vendor")).unwrap();
        fs::create_dir_all(&storage).unwrap();
        Scratch {
            _dir: dir,
            modules,
            storage,
            fs_root,
        }
    }

    fn add_module(s: &Scratch, id: &str, partition: &str) {
        let src = s.modules.join(id);
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("module.prop"), format!("id={id}\nname={id}\n")).unwrap();

        let staged = s.storage.join(id).join(partition);
        fs::create_dir_all(&staged).unwrap();
        fs::write(staged.join("payload"), id).unwrap();
    }

    fn plan_with_modes(s: &Scratch, modes: &[(&str, &str)]) -> MountPlan {
        let modes: HashMap<String, String> = modes
            .iter()
            .map(|(id, mode)| (id.to_string(), mode.to_string()))
            .collect();
        let records = scan(&s.modules, &modes).unwrap();
        generate(
            &records,
            &s.storage,
            &["system".to_string(), "vendor".to_string()],
            &s.fs_root,
        )
    }

    #[test]
    fn mixed_modes_split_into_overlay_and_magic_tasks() {
        let s = scratch();
        add_module(&s, "aa", "system");
        add_module(&s, "bb", "system");

        let plan = plan_with_modes(&s, &[("bb", "magic")]);
        assert_eq!(plan.tasks.len(), 2);

        let overlay = plan
            .tasks
            .iter()
            .find(|t| t.strategy == Strategy::Overlay)
            .unwrap();
        let magic = plan
            .tasks
            .iter()
            .find(|t| t.strategy == Strategy::Magic)
            .unwrap();
        assert_eq!(overlay.module_ids(), vec!["aa"]);
        assert_eq!(magic.module_ids(), vec!["bb"]);
        assert_eq!(overlay.partition, "system");
        assert_eq!(magic.partition, "system");
    }

    #[test]
    fn force_magic_never_contributes_to_overlay_tasks() {
        let s = scratch();
        add_module(&s, "m1", "system");
        add_module(&s, "m2", "vendor");

        let plan = plan_with_modes(&s, &[("m1", "magic"), ("m2", "magic")]);
        for task in &plan.tasks {
            assert_eq!(task.strategy, Strategy::Magic);
        }
    }

    #[test]
    fn layers_follow_scan_order() {
        let s = scratch();
        add_module(&s, "alpha", "system");
        add_module(&s, "beta", "system");
        add_module(&s, "gamma", "system");

        let plan = plan_with_modes(&s, &[]);
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].module_ids(), vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn empty_partitions_and_missing_targets_produce_no_tasks() {
        let s = scratch();
        // staged content for a partition that has no real target
        add_module(&s, "odd", "product");

        let records = scan(&s.modules, &HashMap::new()).unwrap();
        let plan = generate(
            &records,
            &s.storage,
            &["system".to_string(), "product".to_string()],
            &s.fs_root,
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn empty_staged_subtree_is_not_a_layer() {
        let s = scratch();
        let src = s.modules.join("bare");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("module.prop"), "id=bare\nname=bare\n").unwrap();
        fs::create_dir_all(s.storage.join("bare/system")).unwrap();

        let plan = plan_with_modes(&s, &[]);
        assert!(plan.is_empty());
    }

    #[test]
    fn overlay_tasks_precede_magic_tasks() {
        let s = scratch();
        add_module(&s, "uu", "system");
        add_module(&s, "vv", "system");

        let plan = plan_with_modes(&s, &[("uu", "magic")]);
        assert_eq!(plan.tasks[0].strategy, Strategy::Overlay);
        assert_eq!(plan.tasks[1].strategy, Strategy::Magic);
    }
}
