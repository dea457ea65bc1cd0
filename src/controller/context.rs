//! The operation-context decorator.
//!
//! Snapshots the access options of the running operation onto a
//! thread-local stack so that deep helpers — archive drivers choosing a
//! compression method, timestamp converters — can see the caller's
//! intent without threading the options through every signature.

use std::cell::RefCell;
use std::sync::Arc;

use crate::addr::EntryName;
use crate::cio::{
    InputEndpoint, InputSocket, InputStream, OutputEndpoint, OutputSocket, OutputStream,
};
use crate::entry::{AccessSet, Entry, EntryType};
use crate::error::FsResult;
use crate::model::FsModel;
use crate::option::{AccessOptions, SyncOptions};
use crate::sync::SyncExceptionBuilder;

use super::{FsController, SharedController};

thread_local! {
    static CONTEXT: RefCell<Vec<AccessOptions>> = const { RefCell::new(Vec::new()) };
}

/// Read access to the per-thread operation context.
pub struct OperationContext;

impl OperationContext {
    /// The access options of the innermost running operation on this
    /// thread, if any.
    pub fn current() -> Option<AccessOptions> {
        CONTEXT.with(|stack| stack.borrow().last().copied())
    }

    fn push(options: AccessOptions) -> ContextGuard {
        CONTEXT.with(|stack| stack.borrow_mut().push(options));
        ContextGuard
    }
}

struct ContextGuard;

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Decorator installing the operation context around every call.
pub struct ContextController<C> {
    inner: C,
}

impl<C: FsController> ContextController<C> {
    pub fn new(inner: C) -> Self {
        ContextController { inner }
    }
}

impl<C: FsController + 'static> FsController for ContextController<C> {
    fn model(&self) -> &Arc<FsModel> {
        self.inner.model()
    }

    fn parent(&self) -> Option<&SharedController> {
        self.inner.parent()
    }

    fn stat(&self, options: AccessOptions, name: &EntryName) -> FsResult<Option<Entry>> {
        let _ctx = OperationContext::push(options);
        self.inner.stat(options, name)
    }

    fn check_access(
        &self,
        options: AccessOptions,
        name: &EntryName,
        kinds: AccessSet,
    ) -> FsResult<()> {
        let _ctx = OperationContext::push(options);
        self.inner.check_access(options, name, kinds)
    }

    fn set_read_only(&self, name: &EntryName) -> FsResult<()> {
        let _ctx = OperationContext::push(AccessOptions::empty());
        self.inner.set_read_only(name)
    }

    fn set_time(
        &self,
        options: AccessOptions,
        name: &EntryName,
        kinds: AccessSet,
        millis: i64,
    ) -> FsResult<bool> {
        let _ctx = OperationContext::push(options);
        self.inner.set_time(options, name, kinds, millis)
    }

    fn input(&self, options: AccessOptions, name: &EntryName) -> FsResult<InputSocket> {
        let _ctx = OperationContext::push(options);
        let inner = self.inner.input(options, name)?;
        Ok(InputSocket::new(ContextInput { inner, options }))
    }

    fn output(
        &self,
        options: AccessOptions,
        name: &EntryName,
        template: Option<Entry>,
    ) -> FsResult<OutputSocket> {
        let _ctx = OperationContext::push(options);
        let inner = self.inner.output(options, name, template)?;
        Ok(OutputSocket::new(ContextOutput { inner, options }))
    }

    fn mknod(
        &self,
        options: AccessOptions,
        name: &EntryName,
        ty: EntryType,
        template: Option<Entry>,
    ) -> FsResult<()> {
        let _ctx = OperationContext::push(options);
        self.inner.mknod(options, name, ty, template)
    }

    fn unlink(&self, options: AccessOptions, name: &EntryName) -> FsResult<()> {
        let _ctx = OperationContext::push(options);
        self.inner.unlink(options, name)
    }

    fn sync(&self, options: SyncOptions, builder: &mut SyncExceptionBuilder) -> FsResult<()> {
        let _ctx = OperationContext::push(AccessOptions::empty());
        self.inner.sync(options, builder)
    }
}

struct ContextInput {
    inner: InputSocket,
    options: AccessOptions,
}

impl InputEndpoint for ContextInput {
    fn local_target(&mut self) -> FsResult<Entry> {
        let _ctx = OperationContext::push(self.options);
        self.inner.local_target()
    }

    fn open_stream(&mut self, peer: Option<&Entry>) -> FsResult<Box<dyn InputStream>> {
        let _ctx = OperationContext::push(self.options);
        self.inner.open_stream_with(peer)
    }
}

struct ContextOutput {
    inner: OutputSocket,
    options: AccessOptions,
}

impl OutputEndpoint for ContextOutput {
    fn local_target(&mut self) -> FsResult<Entry> {
        let _ctx = OperationContext::push(self.options);
        self.inner.local_target()
    }

    fn open_stream(&mut self, peer: Option<&Entry>) -> FsResult<Box<dyn OutputStream>> {
        let _ctx = OperationContext::push(self.options);
        self.inner.open_stream_with(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_is_scoped() {
        assert_eq!(OperationContext::current(), None);
        {
            let _outer = OperationContext::push(AccessOptions::STORE);
            assert_eq!(OperationContext::current(), Some(AccessOptions::STORE));
            {
                let _inner = OperationContext::push(AccessOptions::COMPRESS);
                assert_eq!(OperationContext::current(), Some(AccessOptions::COMPRESS));
            }
            assert_eq!(OperationContext::current(), Some(AccessOptions::STORE));
        }
        assert_eq!(OperationContext::current(), None);
    }

    #[test]
    fn test_context_is_thread_local() {
        let _ctx = OperationContext::push(AccessOptions::STORE);
        std::thread::spawn(|| {
            assert_eq!(OperationContext::current(), None);
        })
        .join()
        .unwrap();
    }
}
