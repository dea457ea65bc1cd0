//! Controllers: the live objects implementing one file system each.
//!
//! A federated (archive) controller is a stack of decorators around the
//! target controller, outermost first:
//!
//! 1. [`FalsePositiveController`] — reroutes operations on files that are
//!    not really archives to the parent file system.
//! 2. [`LockController`] — per-file-system read/write locking plus the
//!    deadlock-free lock-retry protocol.
//! 3. [`ResourceController`] — registers every stream with the resource
//!    accountant and runs the wait/force-close phase of sync.
//! 4. [`CacheController`] — read-through/write-back buffers for
//!    operations carrying the `CACHE` option.
//! 5. [`ContextController`] — snapshots the operation's access options
//!    onto a thread-local for deep driver helpers.
//! 6. [`ArchiveController`] — owns the mounted directory tree and talks
//!    to the parent controller through the archive driver.
//!
//! Host (non-federated) controllers keep only the locking and resource
//! layers around the platform file system.

use std::sync::Arc;
use std::time::Duration;

use crate::addr::EntryName;
use crate::cio::{InputSocket, OutputSocket};
use crate::driver::ArchiveDriver;
use crate::entry::{AccessSet, Entry, EntryType};
use crate::error::FsResult;
use crate::model::FsModel;
use crate::option::{AccessOptions, SyncOptions};
use crate::pool::IoPool;
use crate::stats::IoStatistics;
use crate::sync::SyncExceptionBuilder;

mod archive;
mod cache;
mod context;
mod false_positive;
mod file;
mod lock;
mod resource;

pub use archive::ArchiveController;
pub use cache::CacheController;
pub use context::{ContextController, OperationContext};
pub use false_positive::FalsePositiveController;
pub use file::FileController;
pub use lock::LockController;
pub use resource::ResourceController;

/// A controller shared across threads and sockets.
pub type SharedController = Arc<dyn FsController>;

/// The operations of one file system.
///
/// Implementations must be consistent under partial execution: an
/// operation that fails must leave observable state unchanged, because
/// the lock-retry protocol may re-issue it.
pub trait FsController: Send + Sync {
    /// The state shared by this controller's stack.
    fn model(&self) -> &Arc<FsModel>;

    /// The parent controller, absent for host file systems.
    fn parent(&self) -> Option<&SharedController>;

    /// Entry metadata, or `None` when absent.
    fn stat(&self, options: AccessOptions, name: &EntryName) -> FsResult<Option<Entry>>;

    /// Fails unless the entry exists and permits all the given kinds of
    /// access.
    fn check_access(
        &self,
        options: AccessOptions,
        name: &EntryName,
        kinds: AccessSet,
    ) -> FsResult<()>;

    fn set_read_only(&self, name: &EntryName) -> FsResult<()>;

    /// Sets the timestamps of the given kinds. Returns false when the
    /// file system cannot represent one of them.
    fn set_time(
        &self,
        options: AccessOptions,
        name: &EntryName,
        kinds: AccessSet,
        millis: i64,
    ) -> FsResult<bool>;

    /// A lazy socket for reading the entry. Opening it may mount.
    fn input(&self, options: AccessOptions, name: &EntryName) -> FsResult<InputSocket>;

    /// A lazy socket for writing the entry. `template` presets metadata,
    /// e.g. when copying.
    fn output(
        &self,
        options: AccessOptions,
        name: &EntryName,
        template: Option<Entry>,
    ) -> FsResult<OutputSocket>;

    /// Creates a file or directory entry.
    fn mknod(
        &self,
        options: AccessOptions,
        name: &EntryName,
        ty: EntryType,
        template: Option<Entry>,
    ) -> FsResult<()>;

    /// Removes an entry. Directories must be empty.
    fn unlink(&self, options: AccessOptions, name: &EntryName) -> FsResult<()>;

    /// Commits pending changes; see the sync options for the exact
    /// phases. Recoverable problems go into `builder`; control-flow
    /// errors propagate as `Err`.
    fn sync(&self, options: SyncOptions, builder: &mut SyncExceptionBuilder) -> FsResult<()>;
}

/// Assembles the full decorator stack for a federated file system.
pub fn federate(
    driver: Arc<dyn ArchiveDriver>,
    model: Arc<FsModel>,
    parent: SharedController,
    pool: Arc<dyn IoPool>,
    stats: Arc<IoStatistics>,
    wait_timeout: Duration,
) -> SharedController {
    let target = ArchiveController::new(driver, model.clone(), parent.clone(), pool.clone());
    let context = ContextController::new(target);
    let cache = CacheController::new(context, pool);
    let resource = ResourceController::new(cache, stats, wait_timeout);
    let lock = LockController::new(resource, wait_timeout);
    Arc::new(FalsePositiveController::new(lock, parent))
}

/// Assembles the stack for a host (platform) file system.
pub fn host(
    model: Arc<FsModel>,
    root: std::path::PathBuf,
    stats: Arc<IoStatistics>,
    wait_timeout: Duration,
) -> SharedController {
    let target = FileController::new(model, root);
    let resource = ResourceController::new(target, stats, wait_timeout);
    Arc::new(LockController::new(resource, wait_timeout))
}
