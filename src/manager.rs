//! The file system manager: controller interning and federation-wide
//! sync.
//!
//! Controllers are interned per mount point. The manager keeps a weak
//! link so idle file systems can be dropped, but promotes it to a strong
//! link while the model is touched — an archive with uncommitted changes
//! must survive until a sync writes it out. Sweeps run in topological
//! order, deepest file system first, because committing a nested archive
//! writes into its parent and marks the parent touched.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::debug;

use crate::addr::MountPoint;
use crate::controller::{self, SharedController};
use crate::driver::DriverRegistry;
use crate::error::{FsError, FsResult};
use crate::model::FsModel;
use crate::option::SyncOptions;
use crate::pool::IoPool;
use crate::stats::{FsManagerStats, IoStatistics};
use crate::sync::{FsSyncError, SyncExceptionBuilder};

enum Link {
    Weak(Weak<dyn controller::FsController>),
    Strong(SharedController),
}

impl Link {
    fn get(&self) -> Option<SharedController> {
        match self {
            Link::Weak(weak) => weak.upgrade(),
            Link::Strong(strong) => Some(strong.clone()),
        }
    }
}

struct ManagerInner {
    registry: Arc<DriverRegistry>,
    pool: Arc<dyn IoPool>,
    stats: Arc<IoStatistics>,
    wait_timeout: Duration,
    map: Mutex<BTreeMap<MountPoint, Link>>,
}

impl ManagerInner {
    /// Promotes or demotes the interned link when a model's touched flag
    /// flips.
    fn schedule(&self, mount_point: &MountPoint, touched: bool) {
        let mut map = self.map.lock().expect("manager map poisoned");
        let Some(link) = map.get_mut(mount_point) else {
            return;
        };
        match (touched, link.get()) {
            (true, Some(strong)) => *link = Link::Strong(strong),
            (false, Some(strong)) => *link = Link::Weak(Arc::downgrade(&strong)),
            (_, None) => {
                map.remove(mount_point);
            }
        }
    }
}

/// See the module documentation.
#[derive(Clone)]
pub struct FsManager {
    inner: Arc<ManagerInner>,
}

impl FsManager {
    pub fn new(
        registry: Arc<DriverRegistry>,
        pool: Arc<dyn IoPool>,
        wait_timeout: Duration,
    ) -> Self {
        FsManager {
            inner: Arc::new(ManagerInner {
                registry,
                pool,
                stats: Arc::new(IoStatistics::new()),
                wait_timeout,
                map: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Returns the controller for a mount point, creating it — and its
    /// whole parent chain, bottom-up — on first use. For any mount point
    /// there is at most one live controller at a time.
    pub fn controller(&self, mount_point: &MountPoint) -> FsResult<SharedController> {
        if let Some(existing) = self.lookup(mount_point) {
            return Ok(existing);
        }

        let (created, model) = match mount_point.parent() {
            Some(parent_mp) => {
                let parent = self.controller(parent_mp)?;
                let driver = self.inner.registry.driver(mount_point.scheme())?;
                let model = FsModel::new(mount_point.clone(), Some(parent.model().clone()));
                let stack = controller::federate(
                    driver,
                    model.clone(),
                    parent,
                    self.inner.pool.clone(),
                    self.inner.stats.clone(),
                    self.inner.wait_timeout,
                );
                (stack, model)
            }
            None => {
                let model = FsModel::new(mount_point.clone(), None);
                let root = host_root(mount_point)?;
                let stack = controller::host(
                    model.clone(),
                    root,
                    self.inner.stats.clone(),
                    self.inner.wait_timeout,
                );
                (stack, model)
            }
        };

        let weak_inner = Arc::downgrade(&self.inner);
        let hook_mount_point = mount_point.clone();
        model.set_touch_hook(Box::new(move |touched| {
            if let Some(inner) = weak_inner.upgrade() {
                inner.schedule(&hook_mount_point, touched);
            }
        }));

        let mut map = self.inner.map.lock().expect("manager map poisoned");
        if let Some(existing) = map.get(mount_point).and_then(Link::get) {
            // Another thread won the race; its controller is the one.
            return Ok(existing);
        }
        debug!(mount_point = %mount_point, "interned new controller");
        map.insert(mount_point.clone(), Link::Weak(Arc::downgrade(&created)));
        Ok(created)
    }

    fn lookup(&self, mount_point: &MountPoint) -> Option<SharedController> {
        self.inner
            .map
            .lock()
            .expect("manager map poisoned")
            .get(mount_point)
            .and_then(Link::get)
    }

    /// Live controllers in topological order, deepest first.
    pub fn controllers(&self) -> Vec<SharedController> {
        let mut live: Vec<SharedController> = {
            let mut map = self.inner.map.lock().expect("manager map poisoned");
            map.retain(|_, link| match link {
                Link::Weak(weak) => weak.strong_count() > 0,
                Link::Strong(_) => true,
            });
            map.values().filter_map(Link::get).collect()
        };
        live.sort_by(|a, b| {
            b.model()
                .mount_point()
                .hierarchical()
                .cmp(a.model().mount_point().hierarchical())
        });
        live
    }

    /// The number of live controllers.
    pub fn len(&self) -> usize {
        self.controllers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The live controllers at or beneath `prefix`, deepest first.
    pub fn filter(&self, prefix: &MountPoint) -> Vec<SharedController> {
        self.controllers()
            .into_iter()
            .filter(|c| prefix.contains(c.model().mount_point()))
            .collect()
    }

    /// Syncs every live controller; see [`FsManager::sync_all`] for the
    /// scoped variant's semantics.
    pub fn sync(&self, options: SyncOptions) -> Result<(), FsSyncError> {
        self.sync_controllers(self.controllers(), options)
    }

    /// Syncs the controllers at or beneath `prefix`, deepest first.
    pub fn sync_all(
        &self,
        prefix: &MountPoint,
        options: SyncOptions,
    ) -> Result<(), FsSyncError> {
        self.sync_controllers(self.filter(prefix), options)
    }

    fn sync_controllers(
        &self,
        controllers: Vec<SharedController>,
        options: SyncOptions,
    ) -> Result<(), FsSyncError> {
        let mut builder = SyncExceptionBuilder::new();
        for controller in &controllers {
            if let Err(cause) = controller.sync(options, &mut builder) {
                debug_assert!(!matches!(cause, FsError::NeedsLockRetry | FsError::NeedsWriteLock));
                builder.fatal(controller.model().mount_point().clone(), cause);
            }
        }
        if options.contains(SyncOptions::UMOUNT) {
            let mut map = self.inner.map.lock().expect("manager map poisoned");
            for controller in &controllers {
                let mount_point = controller.model().mount_point();
                // Anything still touched failed its commit and must stay
                // interned for a retry.
                if !controller.model().is_touched() {
                    map.remove(mount_point);
                }
            }
        }
        builder.check()
    }

    /// A point-in-time view of the federation.
    pub fn stats(&self) -> FsManagerStats {
        let controllers = self.controllers();
        FsManagerStats {
            file_systems_total: controllers.len(),
            file_systems_mounted: controllers
                .iter()
                .filter(|c| c.model().is_mounted())
                .count(),
            file_systems_touched: controllers
                .iter()
                .filter(|c| c.model().is_touched())
                .count(),
            top_level_archives: controllers
                .iter()
                .filter(|c| {
                    let mp = c.model().mount_point();
                    mp.is_federated() && mp.parent().is_some_and(|p| !p.is_federated())
                })
                .count(),
        }
    }

    /// The byte counters shared by every accounted stream.
    pub fn io_stats(&self) -> &Arc<IoStatistics> {
        &self.inner.stats
    }
}

fn host_root(mount_point: &MountPoint) -> FsResult<PathBuf> {
    if mount_point.scheme().as_str() != "file" {
        return Err(FsError::Unsupported(
            "only the file scheme backs host file systems",
        ));
    }
    let path = mount_point
        .opaque_path()
        .ok_or_else(|| FsError::InvalidUri(mount_point.canonical().to_string()))?;
    Ok(PathBuf::from(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{default_registry, NoKeyProvider};
    use crate::pool::MemoryPool;

    fn manager() -> FsManager {
        FsManager::new(
            Arc::new(default_registry(Arc::new(NoKeyProvider))),
            Arc::new(MemoryPool),
            Duration::from_millis(100),
        )
    }

    fn mp(uri: &str) -> MountPoint {
        MountPoint::parse(uri).unwrap()
    }

    #[test]
    fn test_interning_returns_the_same_controller() {
        let manager = manager();
        let a = manager.controller(&mp("zip:file:/tmp/a.zip!/")).unwrap();
        let b = manager.controller(&mp("zip:file:/tmp/a.zip!/")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_concurrent_interning_yields_one_controller() {
        let manager = manager();
        let barrier = Arc::new(std::sync::Barrier::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            let barrier = barrier.clone();
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                manager.controller(&mp("zip:file:/tmp/a.zip!/")).unwrap()
            }));
        }
        let controllers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for pair in controllers.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
    }

    #[test]
    fn test_parent_chain_is_created_bottom_up() {
        let manager = manager();
        let inner = manager
            .controller(&mp("tar:zip:file:/tmp/a.zip!/b.tar!/"))
            .unwrap();
        // All three file systems are interned now.
        assert_eq!(manager.len(), 3);
        let parent = inner.parent().unwrap();
        assert_eq!(parent.model().mount_point().canonical(), "zip:file:/tmp/a.zip!/");
    }

    #[test]
    fn test_controllers_deepest_first() {
        let manager = manager();
        let _inner = manager
            .controller(&mp("tar:zip:file:/tmp/a.zip!/b.tar!/"))
            .unwrap();
        let order: Vec<String> = manager
            .controllers()
            .iter()
            .map(|c| c.model().mount_point().canonical().to_string())
            .collect();
        assert_eq!(
            order,
            vec![
                "tar:zip:file:/tmp/a.zip!/b.tar!/",
                "zip:file:/tmp/a.zip!/",
                "file:/tmp/",
            ]
        );
    }

    #[test]
    fn test_dropped_controllers_are_pruned() {
        let manager = manager();
        let c = manager.controller(&mp("zip:file:/tmp/a.zip!/")).unwrap();
        assert_eq!(manager.len(), 2);
        drop(c);
        // The federated controller is weakly held; its host parent is
        // referenced by nothing else either once it goes.
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn test_filtering_by_prefix() {
        let manager = manager();
        let keep = manager.controller(&mp("zip:file:/foo!/")).unwrap();
        let other = manager.controller(&mp("zip:file:/other/b.zip!/")).unwrap();

        let by_root: Vec<_> = manager
            .filter(&mp("file:/"))
            .iter()
            .map(|c| c.model().mount_point().canonical().to_string())
            .collect();
        assert!(by_root.contains(&"zip:file:/foo!/".to_string()));
        assert!(by_root.contains(&"zip:file:/other/b.zip!/".to_string()));

        // A different scheme chain at the same location still matches.
        let same_spot = manager.filter(&mp("tar:file:/foo!/"));
        assert_eq!(same_spot.len(), 1);
        assert_eq!(
            same_spot[0].model().mount_point().canonical(),
            "zip:file:/foo!/"
        );

        // The directory foo/ does not contain the archive foo.
        assert!(manager.filter(&mp("file:/foo/")).is_empty());

        drop(keep);
        drop(other);
    }

    #[test]
    fn test_sync_of_clean_tree_is_clean() {
        let manager = manager();
        let _c = manager.controller(&mp("zip:file:/tmp/a.zip!/")).unwrap();
        manager.sync(SyncOptions::umount()).unwrap();
        assert_eq!(manager.len(), 0);
        // Idempotent: nothing left to sync.
        manager.sync(SyncOptions::umount()).unwrap();
        assert_eq!(manager.len(), 0);
    }
}
