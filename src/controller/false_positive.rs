//! The outermost decorator of a federated stack: false-positive
//! rerouting.
//!
//! A path like `data.zip/x` commits the kernel to treating `data.zip` as
//! an archive before anyone has looked at its bytes. When mounting later
//! discovers a plain file (or nothing at all), the inner layers raise a
//! false-positive error and this controller re-addresses the operation
//! to the parent file system: `data.zip/x` becomes the parent entry
//! `data.zip/x`, and the archive root becomes the plain file `data.zip`
//! itself. `stat` on the root is the one exception — a plain file has no
//! root directory, so it answers `None` rather than rerouting.
//!
//! A persistent false positive (the file exists but is not this format)
//! is additionally cached here so that repeated operations skip the
//! inner stack entirely until the next sync.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

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

struct FpState<C> {
    inner: C,
    parent: SharedController,
    /// Cached "this is not an archive" verdict, valid until sync.
    persistent: AtomicBool,
}

impl<C: FsController> FpState<C> {
    /// The parent-side name for an entry of this (would-be) archive.
    fn resolve(&self, name: &EntryName) -> EntryName {
        self.inner
            .model()
            .mount_point()
            .parent_entry()
            .expect("federated mount point has a parent entry")
            .join(name)
    }

    fn is_cached(&self) -> bool {
        self.persistent.load(Ordering::Acquire)
    }

    /// Inspects a failure: false positives return `Ok(())`, telling the
    /// caller to reroute; everything else passes through as the error.
    fn classify(&self, error: FsError) -> FsResult<()> {
        match error {
            FsError::FalsePositive(cause) => {
                debug!(
                    mount_point = %self.inner.model().mount_point(),
                    %cause,
                    "rerouting to parent file system"
                );
                Ok(())
            }
            FsError::PersistentFalsePositive(cause) => {
                debug!(
                    mount_point = %self.inner.model().mount_point(),
                    %cause,
                    "rerouting to parent file system (cached until sync)"
                );
                self.persistent.store(true, Ordering::Release);
                Ok(())
            }
            other => Err(other),
        }
    }
}

/// See the module documentation.
pub struct FalsePositiveController<C> {
    state: Arc<FpState<C>>,
}

impl<C: FsController> FalsePositiveController<C> {
    pub fn new(inner: C, parent: SharedController) -> Self {
        FalsePositiveController {
            state: Arc::new(FpState {
                inner,
                parent,
                persistent: AtomicBool::new(false),
            }),
        }
    }

    /// Tries the inner (archive) interpretation first, falling back to
    /// the parent file system on a false positive.
    fn route<T>(
        &self,
        inner_op: impl FnOnce(&C) -> FsResult<T>,
        parent_op: impl FnOnce(&SharedController) -> FsResult<T>,
    ) -> FsResult<T> {
        let st = &self.state;
        if st.is_cached() {
            return parent_op(&st.parent);
        }
        match inner_op(&st.inner) {
            Err(e) if e.is_false_positive() => {
                st.classify(e)?;
                parent_op(&st.parent)
            }
            other => other,
        }
    }
}

impl<C: FsController + 'static> FsController for FalsePositiveController<C> {
    fn model(&self) -> &Arc<FsModel> {
        self.state.inner.model()
    }

    fn parent(&self) -> Option<&SharedController> {
        Some(&self.state.parent)
    }

    fn stat(&self, options: AccessOptions, name: &EntryName) -> FsResult<Option<Entry>> {
        self.route(
            |inner| inner.stat(options, name),
            |parent| {
                if name.is_root() {
                    // A plain file is not a directory; the archive root
                    // does not exist.
                    Ok(None)
                } else {
                    parent.stat(options, &self.state.resolve(name))
                }
            },
        )
    }

    fn check_access(
        &self,
        options: AccessOptions,
        name: &EntryName,
        kinds: AccessSet,
    ) -> FsResult<()> {
        self.route(
            |inner| inner.check_access(options, name, kinds),
            |parent| parent.check_access(options, &self.state.resolve(name), kinds),
        )
    }

    fn set_read_only(&self, name: &EntryName) -> FsResult<()> {
        self.route(
            |inner| inner.set_read_only(name),
            |parent| parent.set_read_only(&self.state.resolve(name)),
        )
    }

    fn set_time(
        &self,
        options: AccessOptions,
        name: &EntryName,
        kinds: AccessSet,
        millis: i64,
    ) -> FsResult<bool> {
        self.route(
            |inner| inner.set_time(options, name, kinds, millis),
            |parent| parent.set_time(options, &self.state.resolve(name), kinds, millis),
        )
    }

    fn input(&self, options: AccessOptions, name: &EntryName) -> FsResult<InputSocket> {
        Ok(InputSocket::new(FpInput {
            state: self.state.clone(),
            inner: self.state.inner.input(options, name)?,
            name: name.clone(),
            options,
        }))
    }

    fn output(
        &self,
        options: AccessOptions,
        name: &EntryName,
        template: Option<Entry>,
    ) -> FsResult<OutputSocket> {
        Ok(OutputSocket::new(FpOutput {
            state: self.state.clone(),
            inner: self.state.inner.output(options, name, template.clone())?,
            name: name.clone(),
            options,
            template,
        }))
    }

    fn mknod(
        &self,
        options: AccessOptions,
        name: &EntryName,
        ty: EntryType,
        template: Option<Entry>,
    ) -> FsResult<()> {
        self.route(
            |inner| inner.mknod(options, name, ty, template.clone()),
            |parent| parent.mknod(options, &self.state.resolve(name), ty, template.clone()),
        )
    }

    fn unlink(&self, options: AccessOptions, name: &EntryName) -> FsResult<()> {
        self.route(
            |inner| inner.unlink(options, name),
            |parent| parent.unlink(options, &self.state.resolve(name)),
        )
    }

    fn sync(&self, options: SyncOptions, builder: &mut SyncExceptionBuilder) -> FsResult<()> {
        let result = self.state.inner.sync(options, builder);
        // The cached probe verdict expires with every sync attempt.
        self.state.persistent.store(false, Ordering::Release);
        result
    }
}

struct FpInput<C> {
    state: Arc<FpState<C>>,
    inner: InputSocket,
    name: EntryName,
    options: AccessOptions,
}

impl<C: FsController + 'static> FpInput<C> {
    fn parent_socket(&self) -> FsResult<InputSocket> {
        self.state
            .parent
            .input(self.options, &self.state.resolve(&self.name))
    }
}

impl<C: FsController + 'static> InputEndpoint for FpInput<C> {
    fn local_target(&mut self) -> FsResult<Entry> {
        if self.state.is_cached() {
            return self.parent_socket()?.local_target();
        }
        match self.inner.local_target() {
            Err(e) if e.is_false_positive() => {
                self.state.classify(e)?;
                self.parent_socket()?.local_target()
            }
            other => other,
        }
    }

    fn open_stream(&mut self, peer: Option<&Entry>) -> FsResult<Box<dyn InputStream>> {
        if self.state.is_cached() {
            return self.parent_socket()?.open_stream_with(peer);
        }
        match self.inner.open_stream_with(peer) {
            Err(e) if e.is_false_positive() => {
                self.state.classify(e)?;
                self.parent_socket()?.open_stream_with(peer)
            }
            other => other,
        }
    }
}

struct FpOutput<C> {
    state: Arc<FpState<C>>,
    inner: OutputSocket,
    name: EntryName,
    options: AccessOptions,
    template: Option<Entry>,
}

impl<C: FsController + 'static> FpOutput<C> {
    fn parent_socket(&self) -> FsResult<OutputSocket> {
        self.state.parent.output(
            self.options,
            &self.state.resolve(&self.name),
            self.template.clone(),
        )
    }
}

impl<C: FsController + 'static> OutputEndpoint for FpOutput<C> {
    fn local_target(&mut self) -> FsResult<Entry> {
        if self.state.is_cached() {
            return self.parent_socket()?.local_target();
        }
        match self.inner.local_target() {
            Err(e) if e.is_false_positive() => {
                self.state.classify(e)?;
                self.parent_socket()?.local_target()
            }
            other => other,
        }
    }

    fn open_stream(&mut self, peer: Option<&Entry>) -> FsResult<Box<dyn OutputStream>> {
        if self.state.is_cached() {
            return self.parent_socket()?.open_stream_with(peer);
        }
        match self.inner.open_stream_with(peer) {
            Err(e) if e.is_false_positive() => {
                self.state.classify(e)?;
                self.parent_socket()?.open_stream_with(peer)
            }
            other => other,
        }
    }
}
