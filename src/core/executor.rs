// Copyright 2026 HybridMount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

//! Mount executor. Drives the per-task state machine over a [`MountEngine`]:
//! `Pending → Mounted`, or `Pending → FailedRetrying → {Mounted, FailedFinal}`
//! when an overlay attempt degrades to magic mount. A task never returns to
//! the overlay strategy once it has left it.
//!
//! Tasks run on one thread in plan order. Mount namespace membership is
//! per-thread, so every mount must happen on the thread that unshared; this
//! also serializes tasks per target partition, which the magic bind tree
//! requires (parents before children).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rustix::{
    mount::{MountPropagationFlags, mount_change},
    thread::{UnshareFlags, unshare},
};

use crate::{
    config::Config,
    core::planner::{MountPlan, MountTask, Strategy, TaskStatus},
    defs,
    error::Fault,
    mount, utils,
};

/// The executor's kernel surface. Narrow on purpose: the state machine above
/// it is exercised in tests against a scripted fake.
pub trait MountEngine {
    fn already_mounted(&self, target: &Path) -> bool;
    fn isolate_namespace(&self) -> Result<()>;
    fn overlay(&self, task: &MountTask) -> Result<()>;
    fn magic(&self, task: &MountTask) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub partition: String,
    pub target: PathBuf,
    pub strategy: Strategy,
    pub status: TaskStatus,
    pub module_ids: Vec<String>,
}

impl TaskOutcome {
    fn of(task: &MountTask) -> Self {
        Self {
            partition: task.partition.clone(),
            target: task.target.clone(),
            strategy: task.strategy,
            status: task.status,
            module_ids: task.module_ids(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ExecutionResult {
    pub outcomes: Vec<TaskOutcome>,
}

impl ExecutionResult {
    fn mounted_ids(&self, strategy: Strategy) -> Vec<String> {
        let mut ids: Vec<String> = self
            .outcomes
            .iter()
            .filter(|o| o.strategy == strategy && o.status == TaskStatus::Mounted)
            .flat_map(|o| o.module_ids.iter().cloned())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn overlay_module_ids(&self) -> Vec<String> {
        self.mounted_ids(Strategy::Overlay)
    }

    pub fn magic_module_ids(&self) -> Vec<String> {
        self.mounted_ids(Strategy::Magic)
    }

    pub fn active_partitions(&self) -> Vec<String> {
        let mut parts: Vec<String> = self
            .outcomes
            .iter()
            .filter(|o| o.status == TaskStatus::Mounted)
            .map(|o| o.partition.clone())
            .collect();
        parts.sort();
        parts.dedup();
        parts
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == TaskStatus::FailedFinal)
            .count()
    }
}

pub fn execute(engine: &dyn MountEngine, plan: MountPlan, config: &Config) -> ExecutionResult {
    apply_isolation(engine, config);

    let mut result = ExecutionResult::default();

    for mut task in plan.tasks {
        if engine.already_mounted(&task.target) {
            log::info!(
                "{} already carries our mounts, skipping",
                task.target.display()
            );
            task.status = TaskStatus::Mounted;
            result.outcomes.push(TaskOutcome::of(&task));
            continue;
        }

        match task.strategy {
            Strategy::Overlay => match engine.overlay(&task) {
                Ok(()) => {
                    task.status = TaskStatus::Mounted;
                    result.outcomes.push(TaskOutcome::of(&task));
                }
                Err(e) => {
                    log::warn!(
                        "{}, requeueing as magic mount",
                        Fault::Mount {
                            target: task.target.display().to_string(),
                            reason: format!("{e:#}"),
                        }
                    );
                    task.status = TaskStatus::FailedRetrying;
                    result.outcomes.push(TaskOutcome::of(&task));

                    // One retry with the same contributing modules. A failed
                    // retry is final; it never cycles back to overlay.
                    let mut retry = MountTask {
                        strategy: Strategy::Magic,
                        status: TaskStatus::Pending,
                        ..task
                    };
                    retry.status = match engine.magic(&retry) {
                        Ok(()) => TaskStatus::Mounted,
                        Err(e) => {
                            log::error!(
                                "{}",
                                Fault::Mount {
                                    target: retry.target.display().to_string(),
                                    reason: format!("magic fallback failed: {e:#}"),
                                }
                            );
                            TaskStatus::FailedFinal
                        }
                    };
                    result.outcomes.push(TaskOutcome::of(&retry));
                }
            },
            Strategy::Magic => {
                task.status = match engine.magic(&task) {
                    Ok(()) => TaskStatus::Mounted,
                    Err(e) => {
                        log::error!(
                            "{}",
                            Fault::Mount {
                                target: task.target.display().to_string(),
                                reason: format!("{e:#}"),
                            }
                        );
                        TaskStatus::FailedFinal
                    }
                };
                result.outcomes.push(TaskOutcome::of(&task));
            }
        }
    }

    result
}

/// The one sanctioned way to skip isolation is disable_umount plus the
/// explicit coexistence opt-in; the operator is then vouching that a separate
/// mechanism keeps these mounts out of the global namespace. Requesting
/// disable_umount alone keeps isolation on, loudly.
fn apply_isolation(engine: &dyn MountEngine, config: &Config) {
    if config.disable_umount {
        if config.allow_umount_coexistence {
            log::warn!("namespace isolation disabled by operator, mounts stay in the shared namespace");
            return;
        }
        log::warn!("disable_umount is set without allow_umount_coexistence, keeping isolation");
    }
    if let Err(e) = engine.isolate_namespace() {
        log::error!("failed to enter a private mount namespace: {e:#}");
    }
}

/// Real kernel engine, built per run from the provisioned storage backend.
pub struct KernelEngine<'a> {
    pub config: &'a Config,
    pub staging_root: PathBuf,
    pub workspace: PathBuf,
}

impl MountEngine for KernelEngine<'_> {
    fn already_mounted(&self, target: &Path) -> bool {
        utils::mounted_with_source(target, &self.config.mountsource)
    }

    fn isolate_namespace(&self) -> Result<()> {
        unshare(UnshareFlags::NEWNS).context("unshare mount namespace")?;
        mount_change(
            "/",
            MountPropagationFlags::PRIVATE | MountPropagationFlags::REC,
        )
        .context("make / recursively private")?;
        Ok(())
    }

    fn overlay(&self, task: &MountTask) -> Result<()> {
        // OverlayFS treats the first lowerdir as the top-most layer, so the
        // scan-ordered list (later shadows earlier) goes in reversed.
        let lower: Vec<String> = task
            .layers
            .iter()
            .rev()
            .map(|l| l.content.display().to_string())
            .collect();

        let rw = self
            .staging_root
            .join(defs::RW_DIR_NAME)
            .join(&task.partition);
        let upper = rw.join("upperdir");
        let work = rw.join("workdir");
        utils::ensure_dir_exists(&upper)?;
        utils::ensure_dir_exists(&work)?;

        mount::overlay::mount_overlay(
            &task.target.to_string_lossy(),
            &lower,
            Some(upper),
            Some(work),
            &self.config.mountsource,
        )
    }

    fn magic(&self, task: &MountTask) -> Result<()> {
        let layers: Vec<(String, PathBuf)> = task
            .layers
            .iter()
            .map(|l| (l.id.clone(), l.content.clone()))
            .collect();
        mount::magic::mount_partition(
            &self.workspace,
            &task.target,
            &layers,
            &self.config.mountsource,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::planner::ModuleLayer;
    use std::{cell::RefCell, collections::HashSet};

    #[derive(Default)]
    struct FakeEngine {
        overlay_fail: HashSet<PathBuf>,
        magic_fail: HashSet<PathBuf>,
        isolate_calls: RefCell<u32>,
        calls: RefCell<Vec<String>>,
        mounted: RefCell<HashSet<PathBuf>>,
    }

    impl FakeEngine {
        fn call(&self, what: &str, task: &MountTask) {
            self.calls
                .borrow_mut()
                .push(format!("{what}:{}", task.target.display()));
        }
    }

    impl MountEngine for FakeEngine {
        fn already_mounted(&self, target: &Path) -> bool {
            self.mounted.borrow().contains(target)
        }

        fn isolate_namespace(&self) -> Result<()> {
            *self.isolate_calls.borrow_mut() += 1;
            Ok(())
        }

        fn overlay(&self, task: &MountTask) -> Result<()> {
            self.call("overlay", task);
            if self.overlay_fail.contains(&task.target) {
                anyhow::bail!("overlay unsupported here");
            }
            self.mounted.borrow_mut().insert(task.target.clone());
            Ok(())
        }

        fn magic(&self, task: &MountTask) -> Result<()> {
            self.call("magic", task);
            if self.magic_fail.contains(&task.target) {
                anyhow::bail!("bind tree construction failed");
            }
            self.mounted.borrow_mut().insert(task.target.clone());
            Ok(())
        }
    }

    fn task(partition: &str, strategy: Strategy, ids: &[&str]) -> MountTask {
        MountTask {
            partition: partition.to_string(),
            target: PathBuf::from(format!("/{partition}")),
            strategy,
            layers: ids
                .iter()
                .map(|id| ModuleLayer {
                    id: id.to_string(),
                    content: PathBuf::from(format!("/storage/{id}/{partition}")),
                })
                .collect(),
            status: TaskStatus::Pending,
        }
    }

    fn plan(tasks: Vec<MountTask>) -> MountPlan {
        MountPlan { tasks }
    }

    #[test]
    fn successful_overlay_stays_overlay() {
        let engine = FakeEngine::default();
        let result = execute(
            &engine,
            plan(vec![task("system", Strategy::Overlay, &["a"])]),
            &Config::default(),
        );
        assert_eq!(result.overlay_module_ids(), vec!["a"]);
        assert!(result.magic_module_ids().is_empty());
        assert_eq!(result.active_partitions(), vec!["system"]);
    }

    #[test]
    fn overlay_failure_requeues_same_modules_exactly_once_as_magic() {
        let mut engine = FakeEngine::default();
        engine.overlay_fail.insert(PathBuf::from("/system"));

        let result = execute(
            &engine,
            plan(vec![task("system", Strategy::Overlay, &["a", "b"])]),
            &Config::default(),
        );

        // the retried task carries the same modules, and only the magic
        // attempt mounted anything
        assert!(result.overlay_module_ids().is_empty());
        assert_eq!(result.magic_module_ids(), vec!["a", "b"]);
        let calls = engine.calls.borrow();
        assert_eq!(*calls, vec!["overlay:/system", "magic:/system"]);

        let retrying: Vec<_> = result
            .outcomes
            .iter()
            .filter(|o| o.status == TaskStatus::FailedRetrying)
            .collect();
        assert_eq!(retrying.len(), 1);
        assert_eq!(retrying[0].strategy, Strategy::Overlay);
    }

    #[test]
    fn failed_magic_fallback_is_final_and_run_continues() {
        let mut engine = FakeEngine::default();
        engine.overlay_fail.insert(PathBuf::from("/system"));
        engine.magic_fail.insert(PathBuf::from("/system"));

        let result = execute(
            &engine,
            plan(vec![
                task("system", Strategy::Overlay, &["a"]),
                task("vendor", Strategy::Overlay, &["b"]),
            ]),
            &Config::default(),
        );

        assert_eq!(result.failed_count(), 1);
        assert_eq!(result.overlay_module_ids(), vec!["b"]);
        assert_eq!(result.active_partitions(), vec!["vendor"]);
        // no third attempt for the failed target
        let system_calls = engine
            .calls
            .borrow()
            .iter()
            .filter(|c| c.ends_with("/system"))
            .count();
        assert_eq!(system_calls, 2);
    }

    #[test]
    fn native_magic_task_failure_is_final() {
        let mut engine = FakeEngine::default();
        engine.magic_fail.insert(PathBuf::from("/vendor"));

        let result = execute(
            &engine,
            plan(vec![task("vendor", Strategy::Magic, &["m"])]),
            &Config::default(),
        );
        assert_eq!(result.outcomes[0].status, TaskStatus::FailedFinal);
        assert!(result.magic_module_ids().is_empty());
    }

    #[test]
    fn already_mounted_target_is_left_untouched() {
        let engine = FakeEngine::default();
        engine.mounted.borrow_mut().insert(PathBuf::from("/system"));

        let result = execute(
            &engine,
            plan(vec![task("system", Strategy::Overlay, &["a"])]),
            &Config::default(),
        );
        assert_eq!(result.outcomes[0].status, TaskStatus::Mounted);
        assert!(engine.calls.borrow().is_empty());
    }

    #[test]
    fn second_identical_run_is_a_no_op_with_identical_result() {
        let engine = FakeEngine::default();
        let make_plan = || {
            plan(vec![
                task("system", Strategy::Overlay, &["a"]),
                task("vendor", Strategy::Magic, &["b"]),
            ])
        };

        let first = execute(&engine, make_plan(), &Config::default());
        let calls_after_first = engine.calls.borrow().len();
        let second = execute(&engine, make_plan(), &Config::default());

        assert_eq!(engine.calls.borrow().len(), calls_after_first);
        assert_eq!(first.overlay_module_ids(), second.overlay_module_ids());
        assert_eq!(first.magic_module_ids(), second.magic_module_ids());
        assert_eq!(first.active_partitions(), second.active_partitions());
    }

    #[test]
    fn isolation_runs_unless_explicitly_opted_out() {
        let engine = FakeEngine::default();
        execute(&engine, plan(vec![]), &Config::default());
        assert_eq!(*engine.isolate_calls.borrow(), 1);

        // disable without the coexistence opt-in still isolates
        let engine = FakeEngine::default();
        let config = Config {
            disable_umount: true,
            ..Config::default()
        };
        execute(&engine, plan(vec![]), &config);
        assert_eq!(*engine.isolate_calls.borrow(), 1);

        let engine = FakeEngine::default();
        let config = Config {
            disable_umount: true,
            allow_umount_coexistence: true,
            ..Config::default()
        };
        execute(&engine, plan(vec![]), &config);
        assert_eq!(*engine.isolate_calls.borrow(), 0);
    }
}
