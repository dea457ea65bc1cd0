//! The TAR driver family: `tar`, `targz`, `tarbz2`, `tarxz`.
//!
//! TAR has no central directory and no random access, so an input
//! service drains the whole (decompressed) stream up front, keeping each
//! payload in memory; nested mounting makes the source a staging buffer
//! of the enclosing archive anyway. Output streams entries through the
//! selected compressor in commit order. Individual-entry options like
//! `COMPRESS`/`STORE` do not apply to this family and are ignored.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{EntryType as TarEntryType, Header};
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use crate::cio::{InputSocket, InputStream, OutputSocket, OutputStream};
use crate::driver::{ArchiveDriver, InputService, OutputService};
use crate::entry::{now_millis, Access, Entry, EntryType, Size};
use crate::error::{FsError, FsResult};
use crate::model::FsModel;
use crate::option::AccessOptions;

/// The stream codec wrapped around the TAR container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarCompression {
    None,
    Gzip,
    Bzip2,
    Xz,
}

struct SharedBytes {
    data: Arc<Vec<u8>>,
    pos: usize,
}

impl Read for SharedBytes {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = (self.data.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl InputStream for SharedBytes {}

/// A fully drained TAR archive.
pub struct TarInputService {
    entries: Vec<Entry>,
    payloads: HashMap<String, Arc<Vec<u8>>>,
}

impl TarInputService {
    pub fn parse(reader: impl Read) -> FsResult<Self> {
        let mut archive = tar::Archive::new(reader);
        let mut entries = Vec::new();
        let mut payloads = HashMap::new();
        let iter = archive
            .entries()
            .map_err(|e| FsError::CorruptArchive(e.to_string()))?;
        for item in iter {
            let mut item = item.map_err(|e| FsError::CorruptArchive(e.to_string()))?;
            let raw_name = String::from_utf8_lossy(&item.path_bytes()).into_owned();
            let header = item.header();
            let ty = match header.entry_type() {
                TarEntryType::Directory => EntryType::Directory,
                TarEntryType::Symlink | TarEntryType::Link => EntryType::Symlink,
                TarEntryType::Regular | TarEntryType::Continuous | TarEntryType::GNUSparse => {
                    EntryType::File
                }
                _ => EntryType::Special,
            };
            let mut entry = Entry::new(raw_name.clone(), ty);
            if let Ok(mtime) = header.mtime() {
                entry.set_time(Access::Write, mtime as i64 * 1000);
            }
            if ty == EntryType::Symlink {
                if let Ok(Some(target)) = item.link_name() {
                    entry.set_link_target(target.to_string_lossy().into_owned());
                }
            }
            if ty == EntryType::File {
                let mut data = Vec::new();
                item.read_to_end(&mut data)
                    .map_err(|e| FsError::CorruptArchive(e.to_string()))?;
                entry.set_size(Size::Data, data.len() as u64);
                entry.set_size(Size::Storage, data.len() as u64);
                payloads.insert(
                    raw_name.trim_matches('/').to_string(),
                    Arc::new(data),
                );
            }
            entries.push(entry);
        }
        Ok(TarInputService { entries, payloads })
    }
}

impl InputService for TarInputService {
    fn entries(&self) -> Vec<Entry> {
        self.entries.clone()
    }

    fn open_entry(&self, name: &str) -> FsResult<Box<dyn InputStream>> {
        let data = self
            .payloads
            .get(name)
            .ok_or_else(|| FsError::NoSuchEntry(name.to_string()))?;
        Ok(Box::new(SharedBytes {
            data: data.clone(),
            pos: 0,
        }))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

enum TarSink {
    Plain(Box<dyn OutputStream>),
    Gzip(GzEncoder<Box<dyn OutputStream>>),
    Bzip2(BzEncoder<Box<dyn OutputStream>>),
    Xz(XzEncoder<Box<dyn OutputStream>>),
}

impl Write for TarSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            TarSink::Plain(w) => w.write(buf),
            TarSink::Gzip(w) => w.write(buf),
            TarSink::Bzip2(w) => w.write(buf),
            TarSink::Xz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            TarSink::Plain(w) => w.flush(),
            TarSink::Gzip(w) => w.flush(),
            TarSink::Bzip2(w) => w.flush(),
            TarSink::Xz(w) => w.flush(),
        }
    }
}

impl TarSink {
    fn finish(self) -> FsResult<Box<dyn OutputStream>> {
        Ok(match self {
            TarSink::Plain(w) => w,
            TarSink::Gzip(w) => w.finish()?,
            TarSink::Bzip2(w) => w.finish()?,
            TarSink::Xz(w) => w.finish()?,
        })
    }
}

/// An archive being written through the selected compressor.
pub struct TarOutputService {
    builder: Option<tar::Builder<TarSink>>,
}

impl OutputService for TarOutputService {
    fn put(
        &mut self,
        entry: &Entry,
        _options: AccessOptions,
        data: Option<&mut dyn Read>,
    ) -> FsResult<()> {
        let builder = self
            .builder
            .as_mut()
            .ok_or(FsError::Unsupported("output service is finished"))?;
        let name = entry.name();
        let mtime = entry.time(Access::Write).unwrap_or_else(now_millis) / 1000;

        let mut header = Header::new_gnu();
        header.set_mtime(mtime.max(0) as u64);
        match entry.ty() {
            EntryType::Directory => {
                header.set_entry_type(TarEntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder.append_data(&mut header, name, std::io::empty())?;
            }
            EntryType::Symlink => {
                header.set_entry_type(TarEntryType::Symlink);
                header.set_mode(0o777);
                header.set_size(0);
                let target = entry.link_target().unwrap_or_default().to_string();
                builder.append_link(&mut header, name, target)?;
            }
            EntryType::File | EntryType::Special => {
                header.set_entry_type(TarEntryType::Regular);
                header.set_mode(if entry.is_read_only() { 0o444 } else { 0o644 });
                let mut payload = Vec::new();
                if let Some(reader) = data {
                    reader.read_to_end(&mut payload)?;
                }
                header.set_size(payload.len() as u64);
                builder.append_data(&mut header, name, payload.as_slice())?;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> FsResult<()> {
        let builder = self
            .builder
            .take()
            .ok_or(FsError::Unsupported("output service is finished"))?;
        let sink = builder.into_inner()?;
        sink.finish()?.close()
    }
}

/// The TAR driver; construct one per compression scheme.
pub struct TarDriver {
    compression: TarCompression,
}

impl TarDriver {
    pub fn new() -> Self {
        TarDriver {
            compression: TarCompression::None,
        }
    }

    pub fn gzip() -> Self {
        TarDriver {
            compression: TarCompression::Gzip,
        }
    }

    pub fn bzip2() -> Self {
        TarDriver {
            compression: TarCompression::Bzip2,
        }
    }

    pub fn xz() -> Self {
        TarDriver {
            compression: TarCompression::Xz,
        }
    }
}

impl Default for TarDriver {
    fn default() -> Self {
        TarDriver::new()
    }
}

impl ArchiveDriver for TarDriver {
    fn new_input_service(
        &self,
        _model: &Arc<FsModel>,
        source: &InputSocket,
    ) -> FsResult<Box<dyn InputService>> {
        let raw = source.open_stream()?;
        let service = match self.compression {
            TarCompression::None => TarInputService::parse(raw)?,
            TarCompression::Gzip => TarInputService::parse(GzDecoder::new(raw))?,
            TarCompression::Bzip2 => TarInputService::parse(BzDecoder::new(raw))?,
            TarCompression::Xz => TarInputService::parse(XzDecoder::new(raw))?,
        };
        Ok(Box::new(service))
    }

    fn new_output_service(
        &self,
        _model: &Arc<FsModel>,
        sink: &OutputSocket,
        _input: Option<&dyn InputService>,
    ) -> FsResult<Box<dyn OutputService>> {
        let stream = sink.open_stream()?;
        let sink = match self.compression {
            TarCompression::None => TarSink::Plain(stream),
            TarCompression::Gzip => {
                TarSink::Gzip(GzEncoder::new(stream, flate2::Compression::default()))
            }
            TarCompression::Bzip2 => {
                TarSink::Bzip2(BzEncoder::new(stream, bzip2::Compression::default()))
            }
            TarCompression::Xz => TarSink::Xz(XzEncoder::new(stream, 6)),
        };
        Ok(Box::new(TarOutputService {
            builder: Some(tar::Builder::new(sink)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct VecSink(Arc<Mutex<Vec<u8>>>);

    impl Write for VecSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl OutputStream for VecSink {}

    fn sink_for(compression: TarCompression, buf: Arc<Mutex<Vec<u8>>>) -> TarSink {
        let stream: Box<dyn OutputStream> = Box::new(VecSink(buf));
        match compression {
            TarCompression::None => TarSink::Plain(stream),
            TarCompression::Gzip => {
                TarSink::Gzip(GzEncoder::new(stream, flate2::Compression::default()))
            }
            TarCompression::Bzip2 => {
                TarSink::Bzip2(BzEncoder::new(stream, bzip2::Compression::default()))
            }
            TarCompression::Xz => TarSink::Xz(XzEncoder::new(stream, 6)),
        }
    }

    fn parse_back(compression: TarCompression, bytes: &[u8]) -> TarInputService {
        match compression {
            TarCompression::None => TarInputService::parse(bytes).unwrap(),
            TarCompression::Gzip => TarInputService::parse(GzDecoder::new(bytes)).unwrap(),
            TarCompression::Bzip2 => TarInputService::parse(BzDecoder::new(bytes)).unwrap(),
            TarCompression::Xz => TarInputService::parse(XzDecoder::new(bytes)).unwrap(),
        }
    }

    #[test]
    fn test_round_trip_all_codecs() {
        for compression in [
            TarCompression::None,
            TarCompression::Gzip,
            TarCompression::Bzip2,
            TarCompression::Xz,
        ] {
            let buf = Arc::new(Mutex::new(Vec::new()));
            let mut out = TarOutputService {
                builder: Some(tar::Builder::new(sink_for(compression, buf.clone()))),
            };

            let mut dir = Entry::new("d/", EntryType::Directory);
            dir.set_time(Access::Write, 1_400_000_000_000);
            out.put(&dir, AccessOptions::empty(), None).unwrap();

            let mut file = Entry::new("d/f.txt", EntryType::File);
            file.set_time(Access::Write, 1_400_000_000_000);
            out.put(
                &file,
                AccessOptions::empty(),
                Some(&mut &b"tar payload"[..]),
            )
            .unwrap();
            out.finish().unwrap();

            let bytes = buf.lock().unwrap().clone();
            let service = parse_back(compression, &bytes);
            assert_eq!(service.len(), 2, "codec {compression:?}");
            let mut stream = service.open_entry("d/f.txt").unwrap();
            let mut data = Vec::new();
            stream.read_to_end(&mut data).unwrap();
            assert_eq!(data, b"tar payload");

            let dir = &service.entries()[0];
            assert!(dir.is_directory());
            assert_eq!(dir.time(Access::Write), Some(1_400_000_000_000));
        }
    }

    #[test]
    fn test_symlink_round_trip() {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let mut out = TarOutputService {
            builder: Some(tar::Builder::new(sink_for(TarCompression::None, buf.clone()))),
        };
        let mut link = Entry::new("ln", EntryType::Symlink);
        link.set_link_target("d/f.txt");
        link.set_time(Access::Write, 1_400_000_000_000);
        out.put(&link, AccessOptions::empty(), None).unwrap();
        out.finish().unwrap();

        let bytes = buf.lock().unwrap().clone();
        let service = parse_back(TarCompression::None, &bytes);
        let entry = &service.entries()[0];
        assert_eq!(entry.ty(), EntryType::Symlink);
        assert_eq!(entry.link_target(), Some("d/f.txt"));
    }

    #[test]
    fn test_garbage_is_not_an_archive() {
        let garbage = b"definitely not a tar archive".repeat(40);
        assert!(matches!(
            TarInputService::parse(&garbage[..]),
            Err(FsError::CorruptArchive(_))
        ));
    }

    #[test]
    fn test_long_names_survive() {
        let long = format!("{}/{}", "deep".repeat(40), "leaf.txt");
        let buf = Arc::new(Mutex::new(Vec::new()));
        let mut out = TarOutputService {
            builder: Some(tar::Builder::new(sink_for(TarCompression::None, buf.clone()))),
        };
        let mut file = Entry::new(long.clone(), EntryType::File);
        file.set_time(Access::Write, 1_400_000_000_000);
        out.put(&file, AccessOptions::empty(), Some(&mut &b"x"[..]))
            .unwrap();
        out.finish().unwrap();

        let bytes = buf.lock().unwrap().clone();
        let service = parse_back(TarCompression::None, &bytes);
        assert_eq!(service.entries()[0].name(), long);
    }
}
