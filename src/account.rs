//! The resource accountant: per-controller bookkeeping of live streams.
//!
//! Every stream handed to user code is registered here on creation and
//! deregistered on close. The accountant distinguishes resources owned by
//! the calling thread ("local") from those of other threads ("foreign"):
//! a sync that finds local resources open can never wait for them —
//! waiting for yourself deadlocks — so it must either force-close or
//! fail. Foreign resources are waited for on the file system lock's
//! condition, which releases the caller's write hold so the owning
//! threads can actually get in to close.
//!
//! Registration keeps only a weak handle. A stream leaked without close
//! therefore unaccounts itself when it is dropped; the force-close sweep
//! is the safety net for streams still reachable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::error::FsError;
use crate::model::FsModel;

/// Implemented by accountable streams so the sweep in
/// [`ResourceAccountant::close_all`] can close them from another thread.
pub trait ForceClose: Send + Sync {
    fn force_close(&self) -> Result<(), FsError>;
}

struct Account {
    thread: ThreadId,
    closer: Weak<dyn ForceClose>,
}

/// Tracks the live I/O resources of one controller.
pub struct ResourceAccountant {
    model: Arc<FsModel>,
    resources: Mutex<HashMap<u64, Account>>,
    next_id: AtomicU64,
}

impl ResourceAccountant {
    pub fn new(model: Arc<FsModel>) -> Self {
        ResourceAccountant {
            model,
            resources: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a resource owned by the current thread. Returns the
    /// account id to pass to [`ResourceAccountant::stop`].
    pub fn start(&self, closer: Weak<dyn ForceClose>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.resources
            .lock()
            .expect("accountant poisoned")
            .insert(
                id,
                Account {
                    thread: thread::current().id(),
                    closer,
                },
            );
        id
    }

    /// Deregisters a resource and wakes any sync parked in wait-idle.
    pub fn stop(&self, id: u64) {
        self.resources
            .lock()
            .expect("accountant poisoned")
            .remove(&id);
        self.model.lock().signal_all();
    }

    /// `(total, local)` live resource counts. Dead weak handles (streams
    /// dropped without close) are pruned as a side effect.
    pub fn counts(&self) -> (usize, usize) {
        let me = thread::current().id();
        let mut resources = self.resources.lock().expect("accountant poisoned");
        resources.retain(|_, account| account.closer.strong_count() > 0);
        let total = resources.len();
        let local = resources.values().filter(|a| a.thread == me).count();
        (total, local)
    }

    /// Resources owned by the current thread.
    pub fn local_count(&self) -> usize {
        self.counts().1
    }

    /// Waits for foreign-thread resources to close, up to `timeout`
    /// (`None` waits without bound). Returns the total count left.
    ///
    /// The caller must hold the write lock of the accountant's model; the
    /// wait itself releases it.
    pub fn wait_foreign(&self, timeout: Option<Duration>) -> usize {
        let started = Instant::now();
        loop {
            let (total, local) = self.counts();
            if total - local == 0 {
                return total;
            }
            let remaining = match timeout {
                None => None,
                Some(t) => match t.checked_sub(started.elapsed()) {
                    Some(r) if !r.is_zero() => Some(r),
                    _ => return total,
                },
            };
            self.model.lock().await_signal(remaining);
        }
    }

    /// Forcibly closes every live resource, any thread's. Close errors
    /// are reported through `on_error`; the sweep always completes.
    pub fn close_all(&self, mut on_error: impl FnMut(FsError)) {
        let drained: Vec<Account> = {
            let mut resources = self.resources.lock().expect("accountant poisoned");
            resources.drain().map(|(_, a)| a).collect()
        };
        for account in drained {
            if let Some(closer) = account.closer.upgrade() {
                if let Err(e) = closer.force_close() {
                    on_error(e);
                }
            }
        }
        self.model.lock().signal_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::MountPoint;
    use std::sync::atomic::AtomicBool;

    struct Flag(AtomicBool);

    impl ForceClose for Flag {
        fn force_close(&self) -> Result<(), FsError> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn accountant() -> ResourceAccountant {
        let model = FsModel::new(MountPoint::parse("file:/").unwrap(), None);
        ResourceAccountant::new(model)
    }

    #[test]
    fn test_start_stop_counts() {
        let acc = accountant();
        let r1: Arc<dyn ForceClose> = Arc::new(Flag(AtomicBool::new(false)));
        let id = acc.start(Arc::downgrade(&r1));
        assert_eq!(acc.counts(), (1, 1));
        acc.stop(id);
        assert_eq!(acc.counts(), (0, 0));
    }

    #[test]
    fn test_dropped_resource_unaccounts_itself() {
        let acc = accountant();
        let r1: Arc<dyn ForceClose> = Arc::new(Flag(AtomicBool::new(false)));
        let _id = acc.start(Arc::downgrade(&r1));
        drop(r1);
        assert_eq!(acc.counts(), (0, 0));
    }

    #[test]
    fn test_foreign_resources_are_not_local() {
        let acc = Arc::new(accountant());
        let resource: Arc<dyn ForceClose> = Arc::new(Flag(AtomicBool::new(false)));
        let weak = Arc::downgrade(&resource);
        let acc2 = Arc::clone(&acc);
        thread::spawn(move || {
            acc2.start(weak);
        })
        .join()
        .unwrap();
        // One resource total, none owned by this thread.
        assert_eq!(acc.counts(), (1, 0));
        drop(resource);
    }

    #[test]
    fn test_close_all_forces_and_clears() {
        let acc = accountant();
        let flag = Arc::new(Flag(AtomicBool::new(false)));
        let as_closer: Arc<dyn ForceClose> = flag.clone();
        acc.start(Arc::downgrade(&as_closer));
        let mut errors = 0;
        acc.close_all(|_| errors += 1);
        assert_eq!(errors, 0);
        assert!(flag.0.load(Ordering::SeqCst));
        assert_eq!(acc.counts(), (0, 0));
    }

    #[test]
    fn test_wait_foreign_returns_when_peer_closes() {
        let acc = Arc::new(accountant());
        let resource: Arc<dyn ForceClose> = Arc::new(Flag(AtomicBool::new(false)));
        let weak = Arc::downgrade(&resource);

        let acc2 = Arc::clone(&acc);
        let id = thread::spawn(move || acc2.start(weak)).join().unwrap();

        let acc3 = Arc::clone(&acc);
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            acc3.stop(id);
        });

        let _write = acc.model.lock().write();
        let total = acc.wait_foreign(Some(Duration::from_secs(5)));
        assert_eq!(total, 0);
        closer.join().unwrap();
        drop(resource);
    }
}
