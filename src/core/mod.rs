// Copyright 2026 HybridMount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

//! One daemon run as a typestate pipeline: each stage consumes the previous
//! stage's proof of completion, so a plan cannot be executed before storage
//! is provisioned and synced, and nothing relies on process-wide globals.
//!
//! Only storage provisioning can abort the run. Every later stage absorbs
//! its failures at the component boundary (logged per module or per target)
//! and carries on with whatever is left.

pub mod bootguard;
pub mod executor;
pub mod inventory;
pub mod planner;
pub mod state;
pub mod storage;
pub mod sync;

use std::path::Path;

use crate::{config, config::Config, error::Fault, sys::SysOps};

use self::executor::{ExecutionResult, MountEngine};
use self::inventory::ModuleRecord;
use self::planner::MountPlan;
use self::storage::StorageBackend;

pub struct Init;

pub struct StorageReady {
    backend: StorageBackend,
}

pub struct Synced {
    backend: StorageBackend,
    records: Vec<ModuleRecord>,
}

pub struct Planned {
    backend: StorageBackend,
    plan: MountPlan,
}

pub struct Executed {
    backend: StorageBackend,
    result: ExecutionResult,
}

pub struct Pipeline<S> {
    config: Config,
    state: S,
}

impl Pipeline<Init> {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: Init,
        }
    }

    pub fn provision_storage(
        self,
        sys: &dyn SysOps,
        mnt_base: &Path,
        img_path: &Path,
    ) -> Result<Pipeline<StorageReady>, Fault> {
        let backend = storage::provision(
            sys,
            mnt_base,
            img_path,
            self.config.force_ext4,
            &self.config.mountsource,
        )?;
        log::info!("storage backend ready [{}]", backend.mode_str());
        Ok(Pipeline {
            config: self.config,
            state: StorageReady { backend },
        })
    }
}

impl Pipeline<StorageReady> {
    pub fn scan_and_sync(self) -> Pipeline<Synced> {
        let modes = config::load_module_modes();
        let records = inventory::scan(&self.config.moduledir, &modes).unwrap_or_else(|e| {
            log::error!("module scan failed: {e:#}");
            Vec::new()
        });
        log::info!(
            "inventory: {} modules, {} enabled",
            records.len(),
            records.iter().filter(|r| r.enabled).count()
        );

        let partitions = self.config.target_partitions();
        let storage_root = &self.state.backend.mount_point;
        let entries = sync::plan(&records, storage_root, &partitions);
        sync::apply(&records, &entries, storage_root);

        Pipeline {
            config: self.config,
            state: Synced {
                backend: self.state.backend,
                records,
            },
        }
    }
}

impl Pipeline<Synced> {
    pub fn generate_plan(self) -> Pipeline<Planned> {
        let partitions = self.config.target_partitions();
        let plan = planner::generate(
            &self.state.records,
            &self.state.backend.mount_point,
            &partitions,
            Path::new("/"),
        );
        plan.print_visuals();

        Pipeline {
            config: self.config,
            state: Planned {
                backend: self.state.backend,
                plan,
            },
        }
    }
}

impl Pipeline<Planned> {
    pub fn plan(&self) -> &MountPlan {
        &self.state.plan
    }

    pub fn backend(&self) -> &StorageBackend {
        &self.state.backend
    }

    pub fn execute(self, engine: &dyn MountEngine) -> Pipeline<Executed> {
        let result = executor::execute(engine, self.state.plan, &self.config);
        if result.failed_count() > 0 {
            log::warn!(
                "{} mount task(s) failed permanently, see log for detail",
                result.failed_count()
            );
        }
        Pipeline {
            config: self.config,
            state: Executed {
                backend: self.state.backend,
                result,
            },
        }
    }
}

impl Pipeline<Executed> {
    pub fn backend(&self) -> &StorageBackend {
        &self.state.backend
    }

    /// State emission and bookkeeping. Errors here cost observability, not
    /// mounts, so they are logged and swallowed.
    pub fn finalize(self, nuke_active: bool) {
        let backend = &self.state.backend;
        let result = &self.state.result;

        let overlay_ids = result.overlay_module_ids();
        let magic_ids = result.magic_module_ids();
        state::update_module_description(
            backend.mode_str(),
            nuke_active,
            overlay_ids.len(),
            magic_ids.len(),
        );

        let run_state = state::RunState::new(
            backend.mode_str().to_string(),
            backend.mount_point.clone(),
            result.active_partitions(),
            overlay_ids,
            magic_ids,
            backend.usage(),
            nuke_active,
        );
        if let Err(e) = run_state.save() {
            log::error!("failed to save run state: {e:#}");
        }

        bootguard::clear();
        log::info!("mount sequence complete");
    }
}
