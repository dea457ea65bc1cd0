//! The target controller of a federated file system.
//!
//! Owns the mounted directory tree, performs lazy (un)mounting through
//! the archive driver, stages written entries in pool buffers and
//! commits the whole archive to the parent file system on sync.
//!
//! Mounting discipline: a read-locked operation that finds the archive
//! unmounted raises `NeedsWriteLock` instead of mounting; probing and
//! every mutation happen under the write lock only. A probe that finds
//! the parent entry missing raises a transient false positive (the
//! archive may be created later); a parent entry that exists but cannot
//! be read as this format raises a persistent one, which is cached here
//! until the next sync.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::addr::EntryName;
use crate::cio::{
    InputEndpoint, InputSocket, InputStream, OutputEndpoint, OutputSocket, OutputStream,
};
use crate::driver::{ArchiveDriver, InputService};
use crate::entry::{AccessSet, Entry, EntryType, Size};
use crate::error::{FsError, FsResult};
use crate::model::FsModel;
use crate::option::{AccessOptions, SyncOptions};
use crate::pool::{IoBuffer, IoPool};
use crate::sync::SyncExceptionBuilder;
use crate::tree::ArchiveFs;

use super::{FsController, SharedController};

/// The mounted state of one archive.
struct MountedFs {
    fs: ArchiveFs,
    /// The open input service, absent for newly created archives.
    input: Option<Box<dyn InputService>>,
    /// Payloads written since mounting, keyed by canonical entry name.
    staged: BTreeMap<String, IoBuffer>,
    /// Access options snapshotted when each staged entry was written;
    /// consulted at commit time, e.g. for the compression method.
    staged_options: BTreeMap<String, AccessOptions>,
    /// Entries with an output stream currently open.
    writing: HashSet<String>,
}

enum MountState {
    Unmounted,
    Mounted(MountedFs),
    /// A cached persistent false positive; cleared by sync.
    FalsePositive { reason: String },
}

pub(crate) struct ArchiveState {
    model: Arc<FsModel>,
    parent: SharedController,
    driver: Arc<dyn ArchiveDriver>,
    pool: Arc<dyn IoPool>,
    mount: Mutex<MountState>,
}

impl ArchiveState {
    /// The archive's own entry name inside the parent file system.
    fn name_in_parent(&self) -> &EntryName {
        self.model
            .mount_point()
            .parent_entry()
            .expect("federated mount point has a parent entry")
    }

    fn mount_guard(&self) -> MutexGuard<'_, MountState> {
        self.mount.lock().expect("mount state poisoned")
    }

    /// Mounts if necessary. `auto_create` permits treating a missing or
    /// empty parent entry as a new, empty archive.
    fn ensure_mounted(&self, auto_create: bool) -> FsResult<()> {
        {
            let state = self.mount_guard();
            match &*state {
                MountState::Mounted(_) => return Ok(()),
                MountState::FalsePositive { reason } => {
                    return Err(FsError::CorruptArchive(reason.clone())
                        .into_persistent_false_positive());
                }
                MountState::Unmounted => {}
            }
        }
        if !self.model.lock().is_write_locked_by_current() {
            return Err(FsError::NeedsWriteLock);
        }

        let mounted = self.probe(auto_create)?;
        debug!(
            mount_point = %self.model.mount_point(),
            entries = mounted.fs.len(),
            "mounted archive file system"
        );
        *self.mount_guard() = MountState::Mounted(mounted);
        self.model.set_mounted(true);
        Ok(())
    }

    fn probe(&self, auto_create: bool) -> FsResult<MountedFs> {
        let name = self.name_in_parent().clone();
        let parent_entry = self.parent.stat(AccessOptions::empty(), &name)?;

        let empty = || MountedFs {
            fs: ArchiveFs::new(),
            input: None,
            staged: BTreeMap::new(),
            staged_options: BTreeMap::new(),
            writing: HashSet::new(),
        };

        let entry = match parent_entry {
            None if auto_create => return Ok(empty()),
            None => {
                return Err(
                    FsError::NoSuchEntry(name.as_str().to_string()).into_false_positive()
                );
            }
            Some(entry) => entry,
        };
        if entry.is_directory() {
            // A directory by this name can never become an archive file;
            // cache the outcome until sync.
            let reason = format!("{name} is a directory");
            *self.mount_guard() = MountState::FalsePositive {
                reason: reason.clone(),
            };
            return Err(FsError::IsDirectory(name.as_str().to_string())
                .into_persistent_false_positive());
        }
        if entry.size(Size::Data) == Some(0) {
            return if auto_create {
                Ok(empty())
            } else {
                Err(FsError::NoSuchEntry(name.as_str().to_string()).into_false_positive())
            };
        }

        let source = self.parent.input(AccessOptions::empty(), &name)?;
        match self.driver.new_input_service(&self.model, &source) {
            Ok(service) => {
                let fs = ArchiveFs::populate(service.entries())?;
                Ok(MountedFs {
                    fs,
                    input: Some(service),
                    staged: BTreeMap::new(),
                    staged_options: BTreeMap::new(),
                    writing: HashSet::new(),
                })
            }
            Err(e) if e.is_control_flow() => Err(e),
            Err(cause) => {
                let reason = cause.to_string();
                debug!(
                    mount_point = %self.model.mount_point(),
                    %cause,
                    "archive probe failed, caching persistent false positive"
                );
                *self.mount_guard() = MountState::FalsePositive { reason };
                Err(cause.into_persistent_false_positive())
            }
        }
    }

    /// Runs `op` against the mounted file system.
    fn with_mounted<T>(
        &self,
        auto_create: bool,
        op: impl FnOnce(&mut MountedFs) -> FsResult<T>,
    ) -> FsResult<T> {
        self.ensure_mounted(auto_create)?;
        let mut state = self.mount_guard();
        match &mut *state {
            MountState::Mounted(m) => op(m),
            _ => Err(FsError::NeedsLockRetry),
        }
    }

    fn touch(&self) {
        self.model.set_touched(true);
    }

    /// Serializes the mounted tree through a fresh output service into
    /// the parent file system, in lexicographic entry order.
    fn commit(&self, m: &MountedFs) -> FsResult<()> {
        let name = self.name_in_parent().clone();
        debug!(
            mount_point = %self.model.mount_point(),
            entries = m.fs.len(),
            "committing archive"
        );
        let sink = self
            .parent
            .output(AccessOptions::CREATE_PARENTS, &name, None)?;
        let mut output = self.driver.new_output_service(&self.model, &sink, m.input.as_deref())?;
        for entry in m.fs.entries() {
            let options = m
                .staged_options
                .get(entry.name())
                .copied()
                .unwrap_or_default();
            let archive_entry =
                self.driver
                    .new_entry(entry.name(), entry.ty(), options, Some(&entry))?;
            match entry.ty() {
                EntryType::Directory => output.put(&archive_entry, options, None)?,
                EntryType::File => {
                    if let Some(buffer) = m.staged.get(entry.name()) {
                        output.put(&archive_entry, options, Some(&mut buffer.input_stream()))?;
                    } else if let Some(input) = &m.input {
                        output.put(
                            &archive_entry,
                            options,
                            Some(&mut input.open_entry(entry.name())?),
                        )?;
                    } else {
                        output.put(&archive_entry, options, Some(&mut std::io::empty()))?;
                    }
                }
                EntryType::Symlink | EntryType::Special => {
                    output.put(&archive_entry, options, None)?
                }
            }
        }
        output.finish()
    }
}

/// The innermost controller of a federated stack; see the module docs.
pub struct ArchiveController {
    state: Arc<ArchiveState>,
}

impl ArchiveController {
    pub fn new(
        driver: Arc<dyn ArchiveDriver>,
        model: Arc<FsModel>,
        parent: SharedController,
        pool: Arc<dyn IoPool>,
    ) -> Self {
        ArchiveController {
            state: Arc::new(ArchiveState {
                model,
                parent,
                driver,
                pool,
                mount: Mutex::new(MountState::Unmounted),
            }),
        }
    }
}

impl FsController for ArchiveController {
    fn model(&self) -> &Arc<FsModel> {
        &self.state.model
    }

    fn parent(&self) -> Option<&SharedController> {
        Some(&self.state.parent)
    }

    fn stat(&self, _options: AccessOptions, name: &EntryName) -> FsResult<Option<Entry>> {
        self.state.with_mounted(false, |m| Ok(m.fs.stat(name)))
    }

    fn check_access(
        &self,
        _options: AccessOptions,
        name: &EntryName,
        kinds: AccessSet,
    ) -> FsResult<()> {
        self.state.with_mounted(false, |m| {
            let entry = m
                .fs
                .stat(name)
                .ok_or_else(|| FsError::NoSuchEntry(name.as_str().to_string()))?;
            if kinds.contains(AccessSet::EXECUTE) {
                return Err(FsError::AccessDenied(name.as_str().to_string()));
            }
            if kinds.contains(AccessSet::WRITE) && entry.is_read_only() {
                return Err(FsError::ReadOnly(name.as_str().to_string()));
            }
            Ok(())
        })
    }

    fn set_read_only(&self, name: &EntryName) -> FsResult<()> {
        self.state.with_mounted(false, |m| m.fs.set_read_only(name))?;
        self.state.touch();
        Ok(())
    }

    fn set_time(
        &self,
        _options: AccessOptions,
        name: &EntryName,
        kinds: AccessSet,
        millis: i64,
    ) -> FsResult<bool> {
        let changed = self
            .state
            .with_mounted(false, |m| m.fs.set_time(name, kinds, millis))?;
        self.state.touch();
        Ok(changed)
    }

    fn input(&self, _options: AccessOptions, name: &EntryName) -> FsResult<InputSocket> {
        Ok(InputSocket::new(ArchiveInput {
            state: self.state.clone(),
            name: name.clone(),
        }))
    }

    fn output(
        &self,
        options: AccessOptions,
        name: &EntryName,
        template: Option<Entry>,
    ) -> FsResult<OutputSocket> {
        Ok(OutputSocket::new(ArchiveOutput {
            state: self.state.clone(),
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
        if !self.state.driver.encodable(name.as_str()) {
            return Err(FsError::AccessDenied(name.as_str().to_string()));
        }
        self.state
            .with_mounted(true, |m| m.fs.mknod(name, ty, options, template.as_ref()))?;
        self.state.touch();
        Ok(())
    }

    fn unlink(&self, _options: AccessOptions, name: &EntryName) -> FsResult<()> {
        self.state.with_mounted(false, |m| {
            if m.writing.contains(name.as_str()) {
                return Err(FsError::BusyResource(name.as_str().to_string()));
            }
            m.fs.unlink(name)?;
            m.staged.remove(name.as_str());
            m.staged_options.remove(name.as_str());
            Ok(())
        })?;
        self.state.touch();
        Ok(())
    }

    fn sync(&self, options: SyncOptions, builder: &mut SyncExceptionBuilder) -> FsResult<()> {
        debug_assert!(self.state.model.lock().is_write_locked_by_current());
        let mut state = self.state.mount_guard();
        match &mut *state {
            MountState::Unmounted => Ok(()),
            MountState::FalsePositive { .. } => {
                // The cached probe outcome expires with every sync.
                *state = MountState::Unmounted;
                Ok(())
            }
            MountState::Mounted(m) => {
                if options.contains(SyncOptions::ABORT_CHANGES) {
                    *state = MountState::Unmounted;
                    self.state.model.set_mounted(false);
                    self.state.model.set_touched(false);
                    return Ok(());
                }
                let mut committed = false;
                if self.state.model.is_touched() {
                    match self.state.commit(m) {
                        Ok(()) => {
                            self.state.model.set_touched(false);
                            committed = true;
                        }
                        Err(e) if e.is_control_flow() => return Err(e),
                        Err(e) => {
                            // Data may be lost; keep the mounted state so
                            // a later sync can retry the commit.
                            builder.fatal(self.state.model.mount_point().clone(), e);
                            return Ok(());
                        }
                    }
                }
                // A commit invalidates the open input service, so the
                // next access must remount from the fresh bytes.
                if committed || options.contains(SyncOptions::UMOUNT) {
                    *state = MountState::Unmounted;
                    self.state.model.set_mounted(false);
                }
                Ok(())
            }
        }
    }
}

struct ArchiveInput {
    state: Arc<ArchiveState>,
    name: EntryName,
}

impl InputEndpoint for ArchiveInput {
    fn local_target(&mut self) -> FsResult<Entry> {
        self.state.with_mounted(false, |m| {
            m.fs.stat(&self.name)
                .ok_or_else(|| FsError::NoSuchEntry(self.name.as_str().to_string()))
        })
    }

    fn open_stream(&mut self, _peer: Option<&Entry>) -> FsResult<Box<dyn InputStream>> {
        self.state.with_mounted(false, |m| {
            let entry = m
                .fs
                .stat(&self.name)
                .ok_or_else(|| FsError::NoSuchEntry(self.name.as_str().to_string()))?;
            if entry.is_directory() {
                return Err(FsError::IsDirectory(self.name.as_str().to_string()));
            }
            if let Some(buffer) = m.staged.get(self.name.as_str()) {
                return Ok(Box::new(buffer.input_stream()) as Box<dyn InputStream>);
            }
            match &m.input {
                Some(input) => input.open_entry(self.name.as_str()),
                None => Err(FsError::NoSuchEntry(self.name.as_str().to_string())),
            }
        })
    }
}

struct ArchiveOutput {
    state: Arc<ArchiveState>,
    name: EntryName,
    options: AccessOptions,
    template: Option<Entry>,
}

impl OutputEndpoint for ArchiveOutput {
    fn local_target(&mut self) -> FsResult<Entry> {
        let planned = self.state.with_mounted(true, |m| Ok(m.fs.stat(&self.name)))?;
        match planned {
            Some(entry) => Ok(entry),
            None => self.state.driver.new_entry(
                self.name.as_str(),
                EntryType::File,
                self.options,
                self.template.as_ref(),
            ),
        }
    }

    fn open_stream(&mut self, peer: Option<&Entry>) -> FsResult<Box<dyn OutputStream>> {
        if !self.state.driver.encodable(self.name.as_str()) {
            return Err(FsError::AccessDenied(self.name.as_str().to_string()));
        }
        let state = self.state.clone();
        let name = self.name.clone();
        let options = self.options;
        let template = self.template.clone().or_else(|| peer.cloned());

        // Validate the planned entry while the driver can still see the
        // operation context.
        self.state.driver.new_entry(
            name.as_str(),
            EntryType::File,
            options,
            template.as_ref(),
        )?;

        let buffer = self.state.pool.allocate()?;
        self.state.with_mounted(true, |m| {
            if let Some(existing) = m.fs.stat(&name) {
                if existing.is_directory() {
                    return Err(FsError::IsDirectory(name.as_str().to_string()));
                }
                if existing.is_read_only() {
                    return Err(FsError::ReadOnly(name.as_str().to_string()));
                }
            }
            if m.writing.contains(name.as_str()) {
                return Err(FsError::BusyResource(name.as_str().to_string()));
            }
            // Makes the entry visible to stat before the stream closes.
            m.fs.mknod(&name, EntryType::File, options, template.as_ref())?;
            if options.contains(AccessOptions::APPEND) {
                if let Some(previous) = m.staged.get(name.as_str()) {
                    buffer.write_all_bytes(&previous.read_all()?)?;
                } else if let Some(input) = &m.input {
                    if let Ok(mut stream) = input.open_entry(name.as_str()) {
                        let mut data = Vec::new();
                        std::io::Read::read_to_end(&mut stream, &mut data)?;
                        buffer.write_all_bytes(&data)?;
                    }
                }
            }
            m.writing.insert(name.as_str().to_string());
            Ok(())
        })?;
        self.state.touch();

        let writer = buffer.output_stream(options.contains(AccessOptions::APPEND))?;
        Ok(Box::new(ArchiveEntryOutputStream {
            state,
            name,
            options,
            buffer,
            writer: Some(writer),
        }))
    }
}

/// Buffers one entry's payload; closing stages it for the next commit.
struct ArchiveEntryOutputStream {
    state: Arc<ArchiveState>,
    name: EntryName,
    options: AccessOptions,
    buffer: IoBuffer,
    writer: Option<crate::pool::BufferOutputStream>,
}

impl Write for ArchiveEntryOutputStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.writer {
            Some(w) => w.write(buf),
            None => Err(std::io::Error::other("stream is closed")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.writer {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl OutputStream for ArchiveEntryOutputStream {
    fn close(&mut self) -> FsResult<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer.flush()?;
        drop(writer);
        let size = self.buffer.len()?;
        let mut state = self.state.mount_guard();
        if let MountState::Mounted(m) = &mut *state {
            m.writing.remove(self.name.as_str());
            m.staged
                .insert(self.name.as_str().to_string(), self.buffer.clone());
            m.staged_options
                .insert(self.name.as_str().to_string(), self.options);
            // The entry may have been unlinked while the stream was open.
            match m.fs.mknod(&self.name, EntryType::File, self.options, None) {
                Ok(()) | Err(FsError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
            m.fs.commit_write(&self.name, size)?;
        }
        drop(state);
        self.state.touch();
        Ok(())
    }
}

impl Drop for ArchiveEntryOutputStream {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            // Leaked without close: the write is discarded, but the busy
            // marker must not stick around.
            if let MountState::Mounted(m) = &mut *self.state.mount_guard() {
                m.writing.remove(self.name.as_str());
            }
        }
    }
}
