//! Application state - Wiring of settings, store, lifecycle manager and guard

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::guard::{CpuGuard, GuardHandle};
use super::lifecycle::VpsManager;
use super::monitor::CpuSampler;
use super::runtime::ContainerRuntime;
use super::settings::Settings;
use crate::persistence::Store;

/// Central application state
pub struct AppState {
    /// Service settings, fixed for the life of the process
    pub settings: Settings,
    /// The three persisted tables
    pub store: Arc<Store>,
    /// Lifecycle manager shared by the command surface and the guard
    pub manager: Arc<VpsManager>,
    /// Switch of the CPU guard
    pub guard: GuardHandle,
}

impl AppState {
    /// Open the store in the configured data directory
    pub fn new(settings: Settings, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let data_dir = settings.get_data_directory();
        let store = Store::open(&data_dir)
            .with_context(|| format!("Failed to open data directory {:?}", data_dir))?;
        Self::assemble(settings, store, runtime)
    }

    /// State backed by an in-memory store
    pub fn in_memory(settings: Settings, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        Self::assemble(settings, Store::in_memory(), runtime)
    }

    fn assemble(settings: Settings, store: Store, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        // The primary admin is implicit and never part of the stored roster
        if store
            .forget_admin(&settings.primary_admin_id)
            .context("Failed to rewrite the admin roster")?
        {
            warn!(
                "Removed primary admin {} from the stored roster",
                settings.primary_admin_id
            );
        }

        let store = Arc::new(store);
        let manager = VpsManager::new(store.clone(), runtime, settings.provisioning())
            .with_primary_admin(settings.primary_admin_id.clone());
        let guard = GuardHandle::from_settings(&settings);

        info!(
            "Application state initialized ({} roster admins, guard {})",
            store.admins().len(),
            guard.state().label()
        );

        Ok(Self {
            settings,
            store,
            manager: Arc::new(manager),
            guard,
        })
    }

    /// Build the guard loop around the shared manager and switch
    pub fn cpu_guard(&self, sampler: Box<dyn CpuSampler>) -> CpuGuard {
        CpuGuard::new(self.manager.clone(), sampler, self.guard.clone())
    }

    /// Rewrite every table; used on shutdown
    pub fn flush(&self) -> Result<()> {
        self.store.flush_all().context("Failed to flush data files")
    }
}
