//! The locking decorator and the lock-retry protocol.
//!
//! Reads run under the read lock; anything that may mount or mutate runs
//! under the write lock. An inner layer that discovers mid-read that it
//! needs the write lock raises `NeedsWriteLock`, and the operation is
//! re-issued under the write lock — never upgraded in place.
//!
//! The first `locked` frame on a thread's call stack acquires locks by
//! blocking. Every nested frame (a parent file system reached from
//! inside a child operation, or a sibling) only *tries* the lock and
//! raises `NeedsLockRetry` on failure. The outermost frame catches that,
//! drops every lock it holds by unwinding, sleeps for a small random
//! interval and starts over. Deadlock between nested archives becomes
//! statistically bounded retry instead — provided operations leave no
//! observable state behind when they fail, which is the standing
//! contract for controllers.

use std::cell::Cell;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::addr::EntryName;
use crate::cio::{
    InputEndpoint, InputSocket, InputStream, OutputEndpoint, OutputSocket, OutputStream,
};
use crate::entry::{AccessSet, Entry, EntryType};
use crate::error::{FsError, FsResult};
use crate::model::FsModel;
use crate::option::{AccessOptions, SyncOptions};
use crate::sync::SyncExceptionBuilder;

use super::{FsController, SharedController};

thread_local! {
    /// True while this thread is inside a `locked` frame of any file
    /// system; shared across controllers by design, since it is the
    /// *first* lock on the stack that may block.
    static LOCKING: Cell<bool> = const { Cell::new(false) };
}

struct LockingScope;

impl LockingScope {
    fn enter() -> Self {
        LOCKING.with(|flag| flag.set(true));
        LockingScope
    }
}

impl Drop for LockingScope {
    fn drop(&mut self) {
        LOCKING.with(|flag| flag.set(false));
    }
}

fn in_locked_frame() -> bool {
    LOCKING.with(|flag| flag.get())
}

/// Sleeps for a uniformly random interval in `1..=timeout` milliseconds.
fn pause(timeout: Duration) {
    let max = timeout.as_millis().max(1) as u64;
    let millis = rand::thread_rng().gen_range(1..=max);
    std::thread::sleep(Duration::from_millis(millis));
}

/// Runs `op` while holding the model's read or write lock, applying the
/// lock-retry protocol described in the module docs. `op` may run more
/// than once and must be repeatable.
fn locked<T>(
    model: &FsModel,
    timeout: Duration,
    write: bool,
    mut op: impl FnMut() -> FsResult<T>,
) -> FsResult<T> {
    let lock = model.lock();
    if in_locked_frame() {
        if write {
            match lock.try_write() {
                Some(_guard) => op(),
                None => Err(FsError::NeedsLockRetry),
            }
        } else {
            match lock.try_read() {
                Some(_guard) => op(),
                None => Err(FsError::NeedsLockRetry),
            }
        }
    } else {
        loop {
            let result = if write {
                let _guard = lock.write();
                let _frame = LockingScope::enter();
                op()
            } else {
                let _guard = lock.read();
                let _frame = LockingScope::enter();
                op()
            };
            match result {
                Err(FsError::NeedsLockRetry) => {
                    tracing::trace!(
                        mount_point = %model.mount_point(),
                        "lock retry, backing off"
                    );
                    pause(timeout);
                }
                other => return other,
            }
        }
    }
}

fn read_or_write<T>(
    model: &FsModel,
    timeout: Duration,
    mut op: impl FnMut() -> FsResult<T>,
) -> FsResult<T> {
    match locked(model, timeout, false, &mut op) {
        Err(FsError::NeedsWriteLock) => locked(model, timeout, true, &mut op),
        other => other,
    }
}

/// Decorator serializing access to the inner controller.
pub struct LockController<C> {
    inner: C,
    timeout: Duration,
}

impl<C: FsController> LockController<C> {
    pub fn new(inner: C, timeout: Duration) -> Self {
        LockController { inner, timeout }
    }
}

impl<C: FsController + 'static> FsController for LockController<C> {
    fn model(&self) -> &Arc<FsModel> {
        self.inner.model()
    }

    fn parent(&self) -> Option<&SharedController> {
        self.inner.parent()
    }

    fn stat(&self, options: AccessOptions, name: &EntryName) -> FsResult<Option<Entry>> {
        read_or_write(self.model(), self.timeout, || self.inner.stat(options, name))
    }

    fn check_access(
        &self,
        options: AccessOptions,
        name: &EntryName,
        kinds: AccessSet,
    ) -> FsResult<()> {
        read_or_write(self.model(), self.timeout, || {
            self.inner.check_access(options, name, kinds)
        })
    }

    fn set_read_only(&self, name: &EntryName) -> FsResult<()> {
        locked(self.model(), self.timeout, true, || {
            self.inner.set_read_only(name)
        })
    }

    fn set_time(
        &self,
        options: AccessOptions,
        name: &EntryName,
        kinds: AccessSet,
        millis: i64,
    ) -> FsResult<bool> {
        locked(self.model(), self.timeout, true, || {
            self.inner.set_time(options, name, kinds, millis)
        })
    }

    fn input(&self, options: AccessOptions, name: &EntryName) -> FsResult<InputSocket> {
        Ok(InputSocket::new(LockInput {
            inner: self.inner.input(options, name)?,
            model: self.model().clone(),
            timeout: self.timeout,
        }))
    }

    fn output(
        &self,
        options: AccessOptions,
        name: &EntryName,
        template: Option<Entry>,
    ) -> FsResult<OutputSocket> {
        Ok(OutputSocket::new(LockOutput {
            inner: self.inner.output(options, name, template)?,
            model: self.model().clone(),
            timeout: self.timeout,
        }))
    }

    fn mknod(
        &self,
        options: AccessOptions,
        name: &EntryName,
        ty: EntryType,
        template: Option<Entry>,
    ) -> FsResult<()> {
        locked(self.model(), self.timeout, true, || {
            self.inner.mknod(options, name, ty, template.clone())
        })
    }

    fn unlink(&self, options: AccessOptions, name: &EntryName) -> FsResult<()> {
        locked(self.model(), self.timeout, true, || {
            self.inner.unlink(options, name)
        })
    }

    fn sync(&self, options: SyncOptions, builder: &mut SyncExceptionBuilder) -> FsResult<()> {
        // In a nested frame an unbounded wait for open resources would
        // block while we hold outer locks; bound the wait and convert the
        // resulting busy failure into a lock retry instead.
        let nested = in_locked_frame();
        let options = if nested {
            options.without_waiting()
        } else {
            options
        };
        locked(self.model(), self.timeout, true, || {
            match self.inner.sync(options, builder) {
                Err(FsError::ThreadsBusy { .. }) if nested => Err(FsError::NeedsLockRetry),
                other => other,
            }
        })
    }
}

struct LockInput {
    inner: InputSocket,
    model: Arc<FsModel>,
    timeout: Duration,
}

impl InputEndpoint for LockInput {
    fn local_target(&mut self) -> FsResult<Entry> {
        locked(&self.model, self.timeout, true, || self.inner.local_target())
    }

    fn open_stream(&mut self, peer: Option<&Entry>) -> FsResult<Box<dyn InputStream>> {
        let stream = locked(&self.model, self.timeout, true, || {
            self.inner.open_stream_with(peer)
        })?;
        Ok(Box::new(LockInputStream {
            inner: stream,
            model: self.model.clone(),
            timeout: self.timeout,
        }))
    }
}

struct LockOutput {
    inner: OutputSocket,
    model: Arc<FsModel>,
    timeout: Duration,
}

impl OutputEndpoint for LockOutput {
    fn local_target(&mut self) -> FsResult<Entry> {
        locked(&self.model, self.timeout, true, || self.inner.local_target())
    }

    fn open_stream(&mut self, peer: Option<&Entry>) -> FsResult<Box<dyn OutputStream>> {
        let stream = locked(&self.model, self.timeout, true, || {
            self.inner.open_stream_with(peer)
        })?;
        Ok(Box::new(LockOutputStream {
            inner: stream,
            model: self.model.clone(),
            timeout: self.timeout,
        }))
    }
}

/// Stream data paths stay lock-free; only close mutates archive state
/// and therefore runs under the write lock.
struct LockInputStream {
    inner: Box<dyn InputStream>,
    model: Arc<FsModel>,
    timeout: Duration,
}

impl Read for LockInputStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl InputStream for LockInputStream {
    fn close(&mut self) -> FsResult<()> {
        let inner = &mut self.inner;
        locked(&self.model, self.timeout, true, || inner.close())
    }
}

struct LockOutputStream {
    inner: Box<dyn OutputStream>,
    model: Arc<FsModel>,
    timeout: Duration,
}

impl Write for LockOutputStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl OutputStream for LockOutputStream {
    fn close(&mut self) -> FsResult<()> {
        let inner = &mut self.inner;
        locked(&self.model, self.timeout, true, || inner.close())
    }
}
