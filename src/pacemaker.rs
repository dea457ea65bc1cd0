//! The pacemaker: a bounded LRU over mounted archive file systems.
//!
//! Every archive access through the pacemaker records its mount point as
//! most recently used. When the count exceeds the configured maximum,
//! the eldest mount point — skipping ancestors of the one just used,
//! which are pinned by the access in flight — gets a partial sync: flush
//! and unmount, no forced close. A busy victim is left alone and simply
//! re-marked as recently used.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::addr::MountPoint;
use crate::controller::SharedController;
use crate::error::FsResult;
use crate::manager::FsManager;
use crate::option::SyncOptions;

/// The default maximum number of tracked mounted file systems.
pub const DEFAULT_MAXIMUM: usize = 5;

/// See the module documentation.
pub struct PaceManager {
    manager: FsManager,
    maximum: AtomicUsize,
    lru: Mutex<VecDeque<MountPoint>>,
}

impl PaceManager {
    pub fn new(manager: FsManager, maximum: usize) -> Self {
        PaceManager {
            manager,
            maximum: AtomicUsize::new(maximum.max(1)),
            lru: Mutex::new(VecDeque::new()),
        }
    }

    /// The configurable bound; readable and writable at runtime.
    pub fn maximum(&self) -> usize {
        self.maximum.load(Ordering::Relaxed)
    }

    pub fn set_maximum(&self, maximum: usize) {
        self.maximum.store(maximum.max(1), Ordering::Relaxed);
    }

    pub fn manager(&self) -> &FsManager {
        &self.manager
    }

    /// Obtains a controller and paces the federation: using one archive
    /// may flush-and-unmount the least recently used other one.
    pub fn controller(&self, mount_point: &MountPoint) -> FsResult<SharedController> {
        let controller = self.manager.controller(mount_point)?;
        if mount_point.is_federated() {
            self.accessed(mount_point);
        }
        Ok(controller)
    }

    fn accessed(&self, mount_point: &MountPoint) {
        let victim = {
            let mut lru = self.lru.lock().expect("pacemaker poisoned");
            lru.retain(|mp| mp != mount_point);
            lru.push_back(mount_point.clone());
            if lru.len() <= self.maximum() {
                None
            } else {
                // The eldest entry that is not an ancestor of the mount
                // point in use.
                lru.iter()
                    .position(|mp| !mp.contains(mount_point))
                    .and_then(|pos| lru.remove(pos))
            }
        };
        let Some(victim) = victim else {
            return;
        };

        let options = SyncOptions::CLEAR_CACHE | SyncOptions::UMOUNT;
        match self.manager.sync_all(&victim, options) {
            Ok(()) => {
                debug!(mount_point = %victim, "paced out least recently used file system");
            }
            Err(error) => {
                debug!(mount_point = %victim, %error, "victim is busy, keeping it mounted");
                let mut lru = self.lru.lock().expect("pacemaker poisoned");
                lru.retain(|mp| mp != &victim);
                lru.push_back(victim);
            }
        }
    }
}
