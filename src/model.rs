//! Mutable per-mount state shared by a controller stack.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::addr::MountPoint;
use crate::rwlock::ReentrantRwLock;

type TouchHook = Box<dyn Fn(bool) + Send + Sync>;

/// The state every layer of one controller stack shares: the mount
/// point, the parent link, the touched flag and the file system's lock.
pub struct FsModel {
    mount_point: MountPoint,
    parent: Option<Arc<FsModel>>,
    touched: AtomicBool,
    mounted: AtomicBool,
    lock: ReentrantRwLock,
    /// Installed by the manager to promote/demote its interned link when
    /// the touched flag flips.
    touch_hook: OnceLock<TouchHook>,
}

impl FsModel {
    pub fn new(mount_point: MountPoint, parent: Option<Arc<FsModel>>) -> Arc<Self> {
        debug_assert_eq!(
            mount_point.parent().is_some(),
            parent.is_some(),
            "parent model must mirror the mount point hierarchy"
        );
        Arc::new(FsModel {
            mount_point,
            parent,
            touched: AtomicBool::new(false),
            mounted: AtomicBool::new(false),
            lock: ReentrantRwLock::new(),
            touch_hook: OnceLock::new(),
        })
    }

    pub fn mount_point(&self) -> &MountPoint {
        &self.mount_point
    }

    pub fn parent(&self) -> Option<&Arc<FsModel>> {
        self.parent.as_ref()
    }

    pub fn lock(&self) -> &ReentrantRwLock {
        &self.lock
    }

    /// True when writes occurred since the last successful sync.
    pub fn is_touched(&self) -> bool {
        self.touched.load(Ordering::Acquire)
    }

    pub fn set_touched(&self, touched: bool) {
        let before = self.touched.swap(touched, Ordering::AcqRel);
        if before != touched {
            if let Some(hook) = self.touch_hook.get() {
                hook(touched);
            }
        }
    }

    /// True while the archive's directory is held in memory.
    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    pub fn set_mounted(&self, mounted: bool) {
        self.mounted.store(mounted, Ordering::Release);
    }

    /// Installs the manager's promotion hook. Later calls are ignored.
    pub fn set_touch_hook(&self, hook: TouchHook) {
        let _ = self.touch_hook.set(hook);
    }
}

impl std::fmt::Debug for FsModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsModel")
            .field("mount_point", &self.mount_point.canonical())
            .field("touched", &self.is_touched())
            .field("mounted", &self.is_mounted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_touch_hook_fires_on_change_only() {
        let mp = MountPoint::parse("file:/").unwrap();
        let model = FsModel::new(mp, None);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        model.set_touch_hook(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        model.set_touched(true);
        model.set_touched(true);
        model.set_touched(false);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_parent_link() {
        let host = FsModel::new(MountPoint::parse("file:/").unwrap(), None);
        let child = FsModel::new(
            MountPoint::parse("zip:file:/a.zip!/").unwrap(),
            Some(host.clone()),
        );
        assert_eq!(
            child.parent().unwrap().mount_point().canonical(),
            "file:/"
        );
    }
}
