//! The caching decorator.
//!
//! Operations carrying the `CACHE` option route entry payloads through
//! pool buffers: the first read materializes the entry once and later
//! reads are served from memory; writes accumulate in a write-back
//! buffer that stays dirty until sync flushes it through the inner
//! controller. Closing a cached output stream registers the entry with
//! the inner file system immediately so `stat` sees it, but the payload
//! moves only on flush. Operations without the option pass straight
//! through.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::addr::EntryName;
use crate::cio::{
    copy as socket_copy, InputEndpoint, InputSocket, InputStream, OutputEndpoint, OutputSocket,
    OutputStream,
};
use crate::entry::{AccessSet, Entry, EntryType, Size};
use crate::error::{FsError, FsResult};
use crate::model::FsModel;
use crate::option::{AccessOptions, SyncOptions};
use crate::pool::{IoBuffer, IoPool};
use crate::sync::SyncExceptionBuilder;

use super::{FsController, SharedController};

#[derive(Default)]
struct CacheEntry {
    /// Read-through buffer of the committed payload.
    input: Option<IoBuffer>,
    /// Write-back buffer of a pending payload.
    output: Option<IoBuffer>,
    /// The options the pending payload was written with, minus `CACHE`.
    options: AccessOptions,
}

impl CacheEntry {
    fn is_dirty(&self) -> bool {
        self.output.is_some()
    }
}

struct CacheState {
    pool: Arc<dyn IoPool>,
    entries: Mutex<BTreeMap<String, CacheEntry>>,
}

/// Decorator adding per-entry read/write caching to the inner
/// controller.
pub struct CacheController<C> {
    inner: Arc<C>,
    state: Arc<CacheState>,
}

impl<C: FsController + 'static> CacheController<C> {
    pub fn new(inner: C, pool: Arc<dyn IoPool>) -> Self {
        CacheController {
            inner: Arc::new(inner),
            state: Arc::new(CacheState {
                pool,
                entries: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Writes all dirty buffers through the inner controller in
    /// lexicographic entry order. A failed flush is recorded as fatal
    /// (the data cannot be committed) but later flushes still run.
    fn flush(&self, builder: &mut SyncExceptionBuilder) -> FsResult<()> {
        let dirty: Vec<(String, IoBuffer, AccessOptions)> = {
            let entries = self.state.entries.lock().expect("cache poisoned");
            entries
                .iter()
                .filter_map(|(name, e)| {
                    e.output
                        .as_ref()
                        .map(|b| (name.clone(), b.clone(), e.options))
                })
                .collect()
        };
        for (name, buffer, options) in dirty {
            let entry_name = EntryName::new(&name)?;
            let result = self.flush_one(&entry_name, &buffer, options);
            match result {
                Ok(()) => {
                    let mut entries = self.state.entries.lock().expect("cache poisoned");
                    if let Some(e) = entries.get_mut(&name) {
                        // The flushed payload becomes the read-through
                        // buffer.
                        e.input = e.output.take();
                    }
                }
                Err(e) if e.is_control_flow() => return Err(e),
                Err(e) => {
                    builder.fatal(self.model().mount_point().clone(), e);
                }
            }
        }
        Ok(())
    }

    fn flush_one(
        &self,
        name: &EntryName,
        buffer: &IoBuffer,
        options: AccessOptions,
    ) -> FsResult<()> {
        debug!(
            mount_point = %self.model().mount_point(),
            entry = %name,
            "flushing cached entry"
        );
        let mut template = Entry::file(name.as_str());
        template.set_size(Size::Data, buffer.len()?);
        let mut source = InputSocket::new(BufferSource {
            entry: template.clone(),
            buffer: buffer.clone(),
        });
        let mut sink = self.inner.output(options, name, Some(template))?;
        socket_copy(&mut source, &mut sink)?;
        Ok(())
    }
}

impl<C: FsController + 'static> FsController for CacheController<C> {
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
        if !options.contains(AccessOptions::CACHE) {
            return self.inner.input(options, name);
        }
        Ok(InputSocket::new(CacheInput {
            inner: self.inner.clone(),
            state: self.state.clone(),
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
        if !options.contains(AccessOptions::CACHE) {
            return self.inner.output(options, name, template);
        }
        Ok(OutputSocket::new(CacheOutput {
            inner: self.inner.clone(),
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
        self.inner.mknod(options, name, ty, template)
    }

    fn unlink(&self, options: AccessOptions, name: &EntryName) -> FsResult<()> {
        self.inner.unlink(options, name)?;
        self.state
            .entries
            .lock()
            .expect("cache poisoned")
            .remove(name.as_str());
        Ok(())
    }

    fn sync(&self, options: SyncOptions, builder: &mut SyncExceptionBuilder) -> FsResult<()> {
        if options.contains(SyncOptions::ABORT_CHANGES) {
            self.state.entries.lock().expect("cache poisoned").clear();
        } else {
            self.flush(builder)?;
        }
        if options.contains(SyncOptions::CLEAR_CACHE) {
            self.state.entries.lock().expect("cache poisoned").clear();
        }
        self.inner.sync(options, builder)
    }
}

/// Input socket endpoint serving a buffer, used as the flush source and
/// for read-through hits.
struct BufferSource {
    entry: Entry,
    buffer: IoBuffer,
}

impl InputEndpoint for BufferSource {
    fn local_target(&mut self) -> FsResult<Entry> {
        Ok(self.entry.clone())
    }

    fn open_stream(&mut self, _peer: Option<&Entry>) -> FsResult<Box<dyn InputStream>> {
        Ok(Box::new(self.buffer.input_stream()))
    }
}

struct CacheInput<C> {
    inner: Arc<C>,
    state: Arc<CacheState>,
    name: EntryName,
    options: AccessOptions,
}

impl<C: FsController> CacheInput<C> {
    /// The buffer currently answering reads for this entry, fetching
    /// through the inner controller on a miss.
    fn buffer(&self) -> FsResult<IoBuffer> {
        {
            let entries = self.state.entries.lock().expect("cache poisoned");
            if let Some(e) = entries.get(self.name.as_str()) {
                if let Some(b) = e.output.as_ref().or(e.input.as_ref()) {
                    return Ok(b.clone());
                }
            }
        }
        // Miss: materialize outside the cache lock.
        let buffer = self.state.pool.allocate()?;
        let source = self
            .inner
            .input(self.options & !AccessOptions::CACHE, &self.name)?;
        let mut stream = source.open_stream()?;
        let mut data = Vec::new();
        std::io::Read::read_to_end(&mut stream, &mut data)?;
        stream.close()?;
        buffer.write_all_bytes(&data)?;

        let mut entries = self.state.entries.lock().expect("cache poisoned");
        let e = entries.entry(self.name.as_str().to_string()).or_default();
        if e.input.is_none() {
            e.input = Some(buffer.clone());
        }
        Ok(buffer)
    }
}

impl<C: FsController + 'static> InputEndpoint for CacheInput<C> {
    fn local_target(&mut self) -> FsResult<Entry> {
        self.inner
            .stat(self.options, &self.name)?
            .ok_or_else(|| FsError::NoSuchEntry(self.name.as_str().to_string()))
    }

    fn open_stream(&mut self, _peer: Option<&Entry>) -> FsResult<Box<dyn InputStream>> {
        Ok(Box::new(self.buffer()?.input_stream()))
    }
}

struct CacheOutput<C> {
    inner: Arc<C>,
    state: Arc<CacheState>,
    name: EntryName,
    options: AccessOptions,
    template: Option<Entry>,
}

impl<C: FsController + 'static> OutputEndpoint for CacheOutput<C> {
    fn local_target(&mut self) -> FsResult<Entry> {
        match self.inner.stat(self.options, &self.name)? {
            Some(entry) => Ok(entry),
            None => Ok(Entry::file(self.name.as_str())),
        }
    }

    fn open_stream(&mut self, peer: Option<&Entry>) -> FsResult<Box<dyn OutputStream>> {
        let buffer = self.state.pool.allocate()?;
        let writer = buffer.output_stream(false)?;
        Ok(Box::new(CacheOutputStream {
            inner: self.inner.clone(),
            state: self.state.clone(),
            name: self.name.clone(),
            options: self.options,
            template: self.template.clone().or_else(|| peer.cloned()),
            buffer,
            writer: Some(writer),
        }))
    }
}

struct CacheOutputStream<C> {
    inner: Arc<C>,
    state: Arc<CacheState>,
    name: EntryName,
    options: AccessOptions,
    template: Option<Entry>,
    buffer: IoBuffer,
    writer: Option<crate::pool::BufferOutputStream>,
}

impl<C: FsController> Write for CacheOutputStream<C> {
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

impl<C: FsController + 'static> OutputStream for CacheOutputStream<C> {
    fn close(&mut self) -> FsResult<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer.flush()?;
        drop(writer);

        // Register the entry so stat sees it; the payload stays here
        // until sync flushes it.
        let mut template = self
            .template
            .clone()
            .unwrap_or_else(|| Entry::file(self.name.as_str()));
        template.set_size(Size::Data, self.buffer.len()?);
        let flush_options = self.options & !AccessOptions::CACHE;
        self.inner
            .mknod(flush_options, &self.name, EntryType::File, Some(template))?;

        let mut entries = self.state.entries.lock().expect("cache poisoned");
        let e = entries.entry(self.name.as_str().to_string()).or_default();
        e.output = Some(self.buffer.clone());
        e.options = flush_options;
        // Whatever read-through copy existed is stale now.
        e.input = None;
        Ok(())
    }
}
