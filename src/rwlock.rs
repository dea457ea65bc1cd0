//! A reentrant read-write lock with owner introspection.
//!
//! Every federated file system is guarded by one of these. The semantics
//! the controller stack relies on:
//!
//! - The write lock is reentrant for its owning thread.
//! - A thread holding the write lock may also take the read lock.
//! - Upgrading a read lock to a write lock is a programming error and
//!   panics; the locking controller re-issues the operation under the
//!   write lock instead (see `NeedsWriteLock`).
//! - [`ReentrantRwLock::await_signal`] releases the caller's entire write
//!   hold while parked so that other threads can acquire the lock, close
//!   their I/O resources and call [`ReentrantRwLock::signal_all`]. This is
//!   what lets `sync` wait for foreign streams without deadlocking.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

#[derive(Debug, Default)]
struct LockState {
    writer: Option<ThreadId>,
    write_holds: usize,
    readers: HashMap<ThreadId, usize>,
}

/// See the module documentation.
#[derive(Debug, Default)]
pub struct ReentrantRwLock {
    state: Mutex<LockState>,
    /// Signalled when the lock may have become available.
    available: Condvar,
    /// Signalled by [`ReentrantRwLock::signal_all`], used by the resource
    /// accountant's wait-idle step.
    resource: Condvar,
}

impl ReentrantRwLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquires the read lock, blocking while another thread holds the
    /// write lock.
    pub fn read(&self) -> ReadGuard<'_> {
        let me = thread::current().id();
        let mut s = self.state();
        while matches!(s.writer, Some(w) if w != me) {
            s = self.available.wait(s).unwrap_or_else(|e| e.into_inner());
        }
        *s.readers.entry(me).or_insert(0) += 1;
        ReadGuard { lock: self }
    }

    /// Acquires the read lock only if it is free right now.
    pub fn try_read(&self) -> Option<ReadGuard<'_>> {
        let me = thread::current().id();
        let mut s = self.state();
        if matches!(s.writer, Some(w) if w != me) {
            return None;
        }
        *s.readers.entry(me).or_insert(0) += 1;
        Some(ReadGuard { lock: self })
    }

    /// Acquires the write lock, blocking until all readers and any other
    /// writer are gone. Reentrant for the owning thread.
    ///
    /// # Panics
    ///
    /// If the current thread holds the read lock but not the write lock:
    /// upgrading would deadlock.
    pub fn write(&self) -> WriteGuard<'_> {
        let me = thread::current().id();
        let mut s = self.state();
        loop {
            if s.writer == Some(me) {
                s.write_holds += 1;
                return WriteGuard { lock: self };
            }
            if s.writer.is_none() && s.readers.is_empty() {
                s.writer = Some(me);
                s.write_holds = 1;
                return WriteGuard { lock: self };
            }
            assert!(
                !s.readers.contains_key(&me),
                "attempt to upgrade a read lock to a write lock"
            );
            s = self.available.wait(s).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Acquires the write lock only if it is available right now.
    pub fn try_write(&self) -> Option<WriteGuard<'_>> {
        let me = thread::current().id();
        let mut s = self.state();
        if s.writer == Some(me) {
            s.write_holds += 1;
            return Some(WriteGuard { lock: self });
        }
        if s.writer.is_none() && s.readers.is_empty() {
            s.writer = Some(me);
            s.write_holds = 1;
            return Some(WriteGuard { lock: self });
        }
        None
    }

    /// True if the current thread holds the write lock.
    pub fn is_write_locked_by_current(&self) -> bool {
        self.state().writer == Some(thread::current().id())
    }

    /// True if the current thread holds the read lock (and not the write
    /// lock).
    pub fn is_read_locked_by_current(&self) -> bool {
        let s = self.state();
        s.writer != Some(thread::current().id())
            && s.readers.contains_key(&thread::current().id())
    }

    /// Releases the caller's entire write hold, parks until
    /// [`ReentrantRwLock::signal_all`] or the timeout, then reacquires the
    /// write hold before returning.
    ///
    /// # Panics
    ///
    /// If the current thread does not hold the write lock.
    pub fn await_signal(&self, timeout: Option<Duration>) {
        let me = thread::current().id();
        let mut s = self.state();
        assert_eq!(s.writer, Some(me), "await_signal requires the write lock");
        let saved_holds = s.write_holds;
        s.writer = None;
        s.write_holds = 0;
        self.available.notify_all();

        s = match timeout {
            Some(t) => {
                self.resource
                    .wait_timeout(s, t)
                    .unwrap_or_else(|e| e.into_inner())
                    .0
            }
            None => self.resource.wait(s).unwrap_or_else(|e| e.into_inner()),
        };

        while s.writer.is_some() || !s.readers.is_empty() {
            s = self.available.wait(s).unwrap_or_else(|e| e.into_inner());
        }
        s.writer = Some(me);
        s.write_holds = saved_holds;
    }

    /// Wakes every thread parked in [`ReentrantRwLock::await_signal`].
    pub fn signal_all(&self) {
        self.resource.notify_all();
    }
}

/// RAII guard for the read lock.
#[derive(Debug)]
pub struct ReadGuard<'a> {
    lock: &'a ReentrantRwLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let me = thread::current().id();
        let mut s = self.lock.state();
        let holds = s.readers.get_mut(&me).expect("read guard without hold");
        *holds -= 1;
        if *holds == 0 {
            s.readers.remove(&me);
        }
        if s.readers.is_empty() {
            self.lock.available.notify_all();
        }
    }
}

/// RAII guard for the write lock.
#[derive(Debug)]
pub struct WriteGuard<'a> {
    lock: &'a ReentrantRwLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let mut s = self.lock.state();
        s.write_holds -= 1;
        if s.write_holds == 0 {
            s.writer = None;
            self.lock.available.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;

    #[test]
    fn test_write_is_reentrant() {
        let lock = ReentrantRwLock::new();
        let _a = lock.write();
        let _b = lock.write();
        assert!(lock.is_write_locked_by_current());
    }

    #[test]
    fn test_read_under_write_is_allowed() {
        let lock = ReentrantRwLock::new();
        let _w = lock.write();
        let _r = lock.read();
        assert!(lock.is_write_locked_by_current());
    }

    #[test]
    fn test_readers_are_shared() {
        let lock = Arc::new(ReentrantRwLock::new());
        let _r1 = lock.read();
        let lock2 = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            let _r2 = lock2.read();
        });
        handle.join().unwrap();
    }

    #[test]
    fn test_try_write_fails_under_foreign_read() {
        let lock = Arc::new(ReentrantRwLock::new());
        let lock2 = Arc::clone(&lock);
        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let _r = lock2.read();
            tx.send(()).unwrap();
            done_rx.recv().unwrap();
        });
        rx.recv().unwrap();
        assert!(lock.try_write().is_none());
        done_tx.send(()).unwrap();
        handle.join().unwrap();
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn test_write_excludes_foreign_read() {
        let lock = Arc::new(ReentrantRwLock::new());
        let guard = lock.write();
        let lock2 = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            // Blocks until the writer is gone.
            let _r = lock2.read();
        });
        thread::sleep(Duration::from_millis(20));
        drop(guard);
        handle.join().unwrap();
    }

    #[test]
    fn test_await_signal_releases_the_write_lock() {
        let lock = Arc::new(ReentrantRwLock::new());
        let lock2 = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            // Waits for the main thread's write hold to be parked.
            let _w = lock2.write();
            lock2.signal_all();
        });
        let _w = lock.write();
        lock.await_signal(Some(Duration::from_millis(500)));
        assert!(lock.is_write_locked_by_current());
        handle.join().unwrap();
    }

    #[test]
    fn test_await_signal_times_out() {
        let lock = ReentrantRwLock::new();
        let _w = lock.write();
        lock.await_signal(Some(Duration::from_millis(10)));
        assert!(lock.is_write_locked_by_current());
    }

    #[test]
    #[should_panic(expected = "upgrade")]
    fn test_upgrade_panics() {
        let lock = ReentrantRwLock::new();
        let _r = lock.read();
        let _w = lock.write();
    }
}
