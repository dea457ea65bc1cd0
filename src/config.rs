//! Configuration and the process-wide runtime.
//!
//! Everything in this crate is directly constructible for test
//! isolation; the global slot is a convenience for applications that
//! want one federation per process. `init` installs it, `runtime`
//! accesses it, and `shutdown` syncs with `UMOUNT` and clears the slot,
//! after which `init` may be called again.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::addr::MountPoint;
use crate::controller::SharedController;
use crate::driver::DriverRegistry;
use crate::drivers::{default_registry, KeyProvider, NoKeyProvider};
use crate::error::{FsError, FsResult};
use crate::manager::FsManager;
use crate::option::SyncOptions;
use crate::pacemaker::{PaceManager, DEFAULT_MAXIMUM};
use crate::pool::{IoPool, MemoryPool, TempFilePool};
use crate::sync::FsSyncError;

/// Which provider backs the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoPoolKind {
    /// Heap buffers; the default.
    #[default]
    Memory,
    /// Unlinked temporary files.
    TempFile,
}

/// Everything a federation needs, with usable defaults.
pub struct FsConfig {
    /// The driver registry; `None` builds the default table around
    /// `key_provider`.
    pub registry: Option<Arc<DriverRegistry>>,
    /// Passphrases for encrypted archives.
    pub key_provider: Arc<dyn KeyProvider>,
    pub io_pool: IoPoolKind,
    /// Bound for sync's wait-idle phase and the lock-retry back-off.
    pub wait_timeout: Duration,
    /// LRU bound for the pacemaker; `None` disables pacing.
    pub pacemaker_maximum: Option<usize>,
}

impl Default for FsConfig {
    fn default() -> Self {
        FsConfig {
            registry: None,
            key_provider: Arc::new(NoKeyProvider),
            io_pool: IoPoolKind::Memory,
            wait_timeout: Duration::from_millis(100),
            pacemaker_maximum: Some(DEFAULT_MAXIMUM),
        }
    }
}

/// One federation: manager, registry, pool and optional pacemaker.
pub struct FsRuntime {
    manager: FsManager,
    pacemaker: Option<PaceManager>,
    registry: Arc<DriverRegistry>,
    pool: Arc<dyn IoPool>,
}

impl FsRuntime {
    pub fn new(config: FsConfig) -> Self {
        let registry = config
            .registry
            .unwrap_or_else(|| Arc::new(default_registry(config.key_provider.clone())));
        let pool: Arc<dyn IoPool> = match config.io_pool {
            IoPoolKind::Memory => Arc::new(MemoryPool),
            IoPoolKind::TempFile => Arc::new(TempFilePool),
        };
        let manager = FsManager::new(registry.clone(), pool.clone(), config.wait_timeout);
        let pacemaker = config
            .pacemaker_maximum
            .map(|maximum| PaceManager::new(manager.clone(), maximum));
        FsRuntime {
            manager,
            pacemaker,
            registry,
            pool,
        }
    }

    pub fn manager(&self) -> &FsManager {
        &self.manager
    }

    pub fn pacemaker(&self) -> Option<&PaceManager> {
        self.pacemaker.as_ref()
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<dyn IoPool> {
        &self.pool
    }

    /// Parses a mount point URI and returns its controller, paced when a
    /// pacemaker is configured.
    pub fn controller(&self, uri: &str) -> FsResult<SharedController> {
        let mount_point = MountPoint::parse(uri)?;
        match &self.pacemaker {
            Some(pacemaker) => pacemaker.controller(&mount_point),
            None => self.manager.controller(&mount_point),
        }
    }

    /// Flushes and unmounts the whole federation.
    pub fn sync_umount(&self) -> Result<(), FsSyncError> {
        self.manager.sync(SyncOptions::umount())
    }
}

static RUNTIME: Lazy<RwLock<Option<Arc<FsRuntime>>>> = Lazy::new(|| RwLock::new(None));

/// Installs the process-wide runtime. Fails if one is already
/// installed; `shutdown` first.
pub fn init(config: FsConfig) -> FsResult<Arc<FsRuntime>> {
    let mut slot = RUNTIME.write().expect("runtime slot poisoned");
    if slot.is_some() {
        return Err(FsError::Unsupported("the runtime is already initialized"));
    }
    let runtime = Arc::new(FsRuntime::new(config));
    *slot = Some(runtime.clone());
    Ok(runtime)
}

/// The process-wide runtime installed by [`init`].
pub fn runtime() -> FsResult<Arc<FsRuntime>> {
    RUNTIME
        .read()
        .expect("runtime slot poisoned")
        .clone()
        .ok_or(FsError::Unsupported("the runtime is not initialized"))
}

/// Syncs the process-wide federation with `UMOUNT` and clears the slot.
pub fn shutdown() -> Result<(), FsSyncError> {
    let runtime = RUNTIME
        .write()
        .expect("runtime slot poisoned")
        .take();
    match runtime {
        Some(runtime) => runtime.sync_umount(),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_lifecycle() {
        // The global slot is process-wide; keep the whole lifecycle in
        // one test to stay independent of test ordering.
        assert!(runtime().is_err());
        let rt = init(FsConfig::default()).unwrap();
        assert!(init(FsConfig::default()).is_err());
        assert!(Arc::ptr_eq(&runtime().unwrap(), &rt));
        assert!(rt.pacemaker().is_some());

        let c = rt.controller("zip:file:/tmp/a.zip!/").unwrap();
        assert_eq!(c.model().mount_point().canonical(), "zip:file:/tmp/a.zip!/");

        shutdown().unwrap();
        assert!(runtime().is_err());
        // A second shutdown is a no-op.
        shutdown().unwrap();
        // And the slot is reusable.
        let rt = init(FsConfig::default()).unwrap();
        assert!(rt.manager().is_empty());
        shutdown().unwrap();
    }

    #[test]
    fn test_standalone_runtime_without_pacemaker() {
        let rt = FsRuntime::new(FsConfig {
            pacemaker_maximum: None,
            ..FsConfig::default()
        });
        assert!(rt.pacemaker().is_none());
        let c = rt.controller("tar:file:/tmp/x.tar!/").unwrap();
        assert!(c.model().mount_point().is_federated());
    }
}
