#![forbid(unsafe_code)]
//! A virtual file system kernel that presents archive files as
//! transparent, nestable directories.
//!
//! A path such as `tar:zip:file:/data/a.zip!/b.tar!/c.txt` addresses a
//! chain of *federated* file systems: the host directory tree, a ZIP
//! archive inside it, and a TAR archive inside that. Each file system
//! gets its own controller; reads and writes cross archive boundaries
//! transparently, with lazy mounting, per-entry caching and explicit
//! synchronization back to the parent storage.
//!
//! # Overview
//!
//! - [`addr`] — mount points, entry names and paths.
//! - [`manager`] — interns one controller per mount point and drives
//!   federation-wide sync, deepest file system first.
//! - [`controller`] — the decorator stack around each archive:
//!   false-positive rerouting, locking with deadlock-free retry,
//!   resource accounting, caching, operation context, and the target
//!   controller owning the mounted directory tree.
//! - [`driver`] / [`drivers`] — the archive format contract and the
//!   built-in ZIP, TAR and RAES families.
//! - [`cio`] — lazy input/output sockets with peer binding and the copy
//!   pipeline.
//! - [`config`] — the configuration struct and the optional
//!   process-wide runtime.
//!
//! # Example
//!
//! ```no_run
//! use std::io::Write;
//!
//! use arcfs::{AccessOptions, EntryName, FsConfig, FsController, OutputStream, SyncOptions};
//!
//! let runtime = arcfs::init(FsConfig::default())?;
//!
//! // Write an entry into a (possibly not yet existing) ZIP archive.
//! let archive = runtime.controller("zip:file:/tmp/demo.zip!/")?;
//! let name = EntryName::new("greeting.txt")?;
//! let mut stream = archive
//!     .output(AccessOptions::CREATE_PARENTS, &name, None)?
//!     .open_stream()?;
//! stream.write_all(b"hello")?;
//! stream.close()?;
//!
//! // Nothing reaches the disk until the federation is synced.
//! runtime.manager().sync(SyncOptions::umount())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Concurrency
//!
//! Every federated file system is guarded by a reentrant read/write
//! lock. Cross-file-system operations acquire locks parent-last and
//! convert contention into a randomized retry instead of deadlocking;
//! see [`controller`] for the protocol. `sync` waits for streams held
//! by other threads on the lock's condition and can force-close them,
//! reporting what it did as warnings in the composite
//! [`sync::FsSyncError`].

pub mod account;
pub mod addr;
pub mod cio;
pub mod config;
pub mod controller;
pub mod driver;
pub mod drivers;
pub mod entry;
pub mod error;
pub mod manager;
pub mod model;
pub mod option;
pub mod pacemaker;
pub mod pool;
pub mod rwlock;
pub mod stats;
pub mod sync;
pub mod tree;

pub use addr::{EntryName, FsPath, MountPoint, Scheme};
pub use cio::{
    copy, InputEndpoint, InputSocket, InputStream, OutputEndpoint, OutputSocket, OutputStream,
};
pub use config::{init, runtime, shutdown, FsConfig, FsRuntime, IoPoolKind};
pub use controller::{FsController, SharedController};
pub use driver::{ArchiveDriver, DriverRegistry, InputService, OutputService};
pub use entry::{Access, AccessSet, Entry, EntryType, Size};
pub use error::{FsError, FsResult};
pub use manager::FsManager;
pub use model::FsModel;
pub use option::{AccessOptions, SyncOptions};
pub use pacemaker::PaceManager;
pub use pool::{IoBuffer, IoPool, MemoryPool, TempFilePool};
pub use stats::{FsManagerStats, IoStatistics};
pub use sync::{FsSyncError, SyncExceptionBuilder};
