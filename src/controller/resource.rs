//! The resource-accounting decorator.
//!
//! Wraps every stream produced by the inner layer so that it is
//! registered with the accountant while open, counted into the I/O
//! statistics, and force-closeable from a syncing thread. A force-closed
//! stream keeps its handle; later reads and writes on it fail instead of
//! touching freed archive state.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::account::{ForceClose, ResourceAccountant};
use crate::addr::EntryName;
use crate::cio::{
    InputEndpoint, InputSocket, InputStream, OutputEndpoint, OutputSocket, OutputStream,
};
use crate::entry::{AccessSet, Entry, EntryType};
use crate::error::{FsError, FsResult};
use crate::model::FsModel;
use crate::option::{AccessOptions, SyncOptions};
use crate::stats::IoStatistics;
use crate::sync::SyncExceptionBuilder;

use super::{FsController, SharedController};

/// Decorator accounting all streams of the inner controller.
pub struct ResourceController<C> {
    inner: C,
    accountant: Arc<ResourceAccountant>,
    stats: Arc<IoStatistics>,
    wait_timeout: Duration,
}

impl<C: FsController> ResourceController<C> {
    pub fn new(inner: C, stats: Arc<IoStatistics>, wait_timeout: Duration) -> Self {
        let accountant = Arc::new(ResourceAccountant::new(inner.model().clone()));
        ResourceController {
            inner,
            accountant,
            stats,
            wait_timeout,
        }
    }

    /// The wait/force-close phase of sync. Local resources can never be
    /// waited for: the owning thread is the one running this sync.
    fn wait_idle(
        &self,
        options: SyncOptions,
        builder: &mut SyncExceptionBuilder,
    ) -> FsResult<()> {
        let force = options.force_close();
        let (mut total, local) = self.accountant.counts();
        if local > 0 && !force {
            return Err(FsError::CurrentThreadBusy(local));
        }
        if local == 0 && total > 0 {
            let timeout = if options.wait_close() {
                None
            } else {
                Some(self.wait_timeout)
            };
            total = self.accountant.wait_foreign(timeout);
        }
        if total > 0 {
            if !force {
                return Err(FsError::ThreadsBusy { total, local });
            }
            let mount_point = self.inner.model().mount_point().clone();
            builder.warn(mount_point.clone(), FsError::ThreadsBusy { total, local });
            debug!(%mount_point, total, local, "force-closing open resources");
            self.accountant
                .close_all(|e| builder.warn(mount_point.clone(), e));
        }
        Ok(())
    }
}

impl<C: FsController + 'static> FsController for ResourceController<C> {
    fn model(&self) -> &Arc<FsModel> {
        self.inner.model()
    }

    fn parent(&self) -> Option<&SharedController> {
        self.inner.parent()
    }

    fn stat(&self, options: AccessOptions, name: &EntryName) -> FsResult<Option<Entry>> {
        self.inner.stat(options, name)
    }

    fn check_access(
        &self,
        options: AccessOptions,
        name: &EntryName,
        kinds: AccessSet,
    ) -> FsResult<()> {
        self.inner.check_access(options, name, kinds)
    }

    fn set_read_only(&self, name: &EntryName) -> FsResult<()> {
        self.inner.set_read_only(name)
    }

    fn set_time(
        &self,
        options: AccessOptions,
        name: &EntryName,
        kinds: AccessSet,
        millis: i64,
    ) -> FsResult<bool> {
        self.inner.set_time(options, name, kinds, millis)
    }

    fn input(&self, options: AccessOptions, name: &EntryName) -> FsResult<InputSocket> {
        Ok(InputSocket::new(ResourceInput {
            inner: self.inner.input(options, name)?,
            accountant: self.accountant.clone(),
            stats: self.stats.clone(),
        }))
    }

    fn output(
        &self,
        options: AccessOptions,
        name: &EntryName,
        template: Option<Entry>,
    ) -> FsResult<OutputSocket> {
        Ok(OutputSocket::new(ResourceOutput {
            inner: self.inner.output(options, name, template)?,
            accountant: self.accountant.clone(),
            stats: self.stats.clone(),
        }))
    }

    fn mknod(
        &self,
        options: AccessOptions,
        name: &EntryName,
        ty: EntryType,
        template: Option<Entry>,
    ) -> FsResult<()> {
        self.inner.mknod(options, name, ty, template)
    }

    fn unlink(&self, options: AccessOptions, name: &EntryName) -> FsResult<()> {
        self.inner.unlink(options, name)
    }

    fn sync(&self, options: SyncOptions, builder: &mut SyncExceptionBuilder) -> FsResult<()> {
        debug_assert!(self.model().lock().is_write_locked_by_current());
        self.wait_idle(options, builder)?;
        self.inner.sync(options, builder)
    }
}

struct ResourceInput {
    inner: InputSocket,
    accountant: Arc<ResourceAccountant>,
    stats: Arc<IoStatistics>,
}

impl InputEndpoint for ResourceInput {
    fn local_target(&mut self) -> FsResult<Entry> {
        self.inner.local_target()
    }

    fn open_stream(&mut self, peer: Option<&Entry>) -> FsResult<Box<dyn InputStream>> {
        let stream = self.inner.open_stream_with(peer)?;
        Ok(Box::new(AccountedInputStream::new(
            stream,
            self.accountant.clone(),
            self.stats.clone(),
        )))
    }
}

struct ResourceOutput {
    inner: OutputSocket,
    accountant: Arc<ResourceAccountant>,
    stats: Arc<IoStatistics>,
}

impl OutputEndpoint for ResourceOutput {
    fn local_target(&mut self) -> FsResult<Entry> {
        self.inner.local_target()
    }

    fn open_stream(&mut self, peer: Option<&Entry>) -> FsResult<Box<dyn OutputStream>> {
        let stream = self.inner.open_stream_with(peer)?;
        Ok(Box::new(AccountedOutputStream::new(
            stream,
            self.accountant.clone(),
            self.stats.clone(),
        )))
    }
}

/// Shared core so the accountant can close the stream from any thread.
struct InputCore {
    inner: Mutex<Option<Box<dyn InputStream>>>,
    forced: AtomicBool,
}

impl ForceClose for InputCore {
    fn force_close(&self) -> FsResult<()> {
        self.forced.store(true, Ordering::Release);
        match self.inner.lock().expect("stream core poisoned").take() {
            Some(mut stream) => stream.close(),
            None => Ok(()),
        }
    }
}

fn closed_error(forced: bool) -> std::io::Error {
    if forced {
        std::io::Error::other("stream was forcibly closed by sync")
    } else {
        std::io::Error::other("stream is closed")
    }
}

struct AccountedInputStream {
    core: Arc<InputCore>,
    accountant: Arc<ResourceAccountant>,
    stats: Arc<IoStatistics>,
    id: u64,
    closed: bool,
}

impl AccountedInputStream {
    fn new(
        stream: Box<dyn InputStream>,
        accountant: Arc<ResourceAccountant>,
        stats: Arc<IoStatistics>,
    ) -> Self {
        let core = Arc::new(InputCore {
            inner: Mutex::new(Some(stream)),
            forced: AtomicBool::new(false),
        });
        let core_dyn: Arc<dyn ForceClose> = core.clone();
        let weak: std::sync::Weak<dyn ForceClose> = Arc::downgrade(&core_dyn);
        let id = accountant.start(weak);
        AccountedInputStream {
            core,
            accountant,
            stats,
            id,
            closed: false,
        }
    }
}

impl Read for AccountedInputStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut guard = self.core.inner.lock().expect("stream core poisoned");
        match guard.as_mut() {
            Some(stream) => {
                let n = stream.read(buf)?;
                self.stats.add_bytes_read(n as u64);
                Ok(n)
            }
            None => Err(closed_error(self.core.forced.load(Ordering::Acquire))),
        }
    }
}

impl InputStream for AccountedInputStream {
    fn close(&mut self) -> FsResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let stream = self.core.inner.lock().expect("stream core poisoned").take();
        self.accountant.stop(self.id);
        match stream {
            Some(mut stream) => stream.close(),
            None => Ok(()),
        }
    }
}

impl Drop for AccountedInputStream {
    fn drop(&mut self) {
        if !self.closed {
            self.accountant.stop(self.id);
        }
    }
}

struct OutputCore {
    inner: Mutex<Option<Box<dyn OutputStream>>>,
    forced: AtomicBool,
}

impl ForceClose for OutputCore {
    fn force_close(&self) -> FsResult<()> {
        self.forced.store(true, Ordering::Release);
        match self.inner.lock().expect("stream core poisoned").take() {
            Some(mut stream) => stream.close(),
            None => Ok(()),
        }
    }
}

struct AccountedOutputStream {
    core: Arc<OutputCore>,
    accountant: Arc<ResourceAccountant>,
    stats: Arc<IoStatistics>,
    id: u64,
    closed: bool,
}

impl AccountedOutputStream {
    fn new(
        stream: Box<dyn OutputStream>,
        accountant: Arc<ResourceAccountant>,
        stats: Arc<IoStatistics>,
    ) -> Self {
        let core = Arc::new(OutputCore {
            inner: Mutex::new(Some(stream)),
            forced: AtomicBool::new(false),
        });
        let core_dyn: Arc<dyn ForceClose> = core.clone();
        let weak: std::sync::Weak<dyn ForceClose> = Arc::downgrade(&core_dyn);
        let id = accountant.start(weak);
        AccountedOutputStream {
            core,
            accountant,
            stats,
            id,
            closed: false,
        }
    }
}

impl Write for AccountedOutputStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.core.inner.lock().expect("stream core poisoned");
        match guard.as_mut() {
            Some(stream) => {
                let n = stream.write(buf)?;
                self.stats.add_bytes_written(n as u64);
                Ok(n)
            }
            None => Err(closed_error(self.core.forced.load(Ordering::Acquire))),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut guard = self.core.inner.lock().expect("stream core poisoned");
        match guard.as_mut() {
            Some(stream) => stream.flush(),
            None => Err(closed_error(self.core.forced.load(Ordering::Acquire))),
        }
    }
}

impl OutputStream for AccountedOutputStream {
    fn close(&mut self) -> FsResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let stream = self.core.inner.lock().expect("stream core poisoned").take();
        self.accountant.stop(self.id);
        match stream {
            Some(mut stream) => stream.close(),
            None => Ok(()),
        }
    }
}

impl Drop for AccountedOutputStream {
    fn drop(&mut self) {
        if !self.closed {
            self.accountant.stop(self.id);
        }
    }
}
