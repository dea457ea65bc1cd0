//! A self-contained ZIP32 codec and the ZIP driver family.
//!
//! Reading parses the end-of-central-directory record (scanning past an
//! optional archive comment and a self-extracting preamble) and serves
//! entry payloads lazily from the slurped archive bytes, validating the
//! CRC-32 as each stream drains. ZIP64 end-of-central-directory records
//! are tolerated on read. Writing produces local headers, DEFLATE or
//! STORED payloads, the central directory and a ZIP32 end record; names
//! are written as UTF-8 with the corresponding general-purpose flag.
//!
//! Driver variants: `zip`/`jar` (plain), `odf` (forces a stored
//! `mimetype` entry to the front of the container), `exe` (reads
//! archives with a self-extracting preamble, refuses updates so the
//! preamble is never lost).

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::cio::{InputSocket, InputStream, OutputSocket, OutputStream};
use crate::controller::OperationContext;
use crate::driver::{ArchiveDriver, InputService, OutputService};
use crate::entry::{now_millis, Access, Entry, EntryType, Size};
use crate::error::{FsError, FsResult};
use crate::model::FsModel;
use crate::option::AccessOptions;

static CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

const LOCAL_SIG: u32 = 0x0403_4b50;
const CENTRAL_SIG: u32 = 0x0201_4b50;
const EOCD_SIG: u32 = 0x0605_4b50;
const ZIP64_EOCD_SIG: u32 = 0x0606_4b50;
const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;

/// General-purpose flag bit 11: entry names are UTF-8.
const FLAG_UTF8: u16 = 1 << 11;

fn read_u16(data: &[u8], pos: usize) -> FsResult<u16> {
    data.get(pos..pos + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| FsError::CorruptArchive("truncated ZIP record".into()))
}

fn read_u32(data: &[u8], pos: usize) -> FsResult<u32> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| FsError::CorruptArchive("truncated ZIP record".into()))
}

fn read_u64(data: &[u8], pos: usize) -> FsResult<u64> {
    data.get(pos..pos + 8)
        .map(|b| u64::from_le_bytes(b.try_into().expect("slice of 8")))
        .ok_or_else(|| FsError::CorruptArchive("truncated ZIP record".into()))
}

// Civil-date conversions (days since 1970-01-01, proleptic Gregorian).

fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = if m > 2 { m - 3 } else { m + 9 } as i64;
    let doy = (153 * mp + 2) / 5 + d as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (yoe + era * 400 + if m <= 2 { 1 } else { 0 }, m, d)
}

/// Converts epoch milliseconds to MS-DOS date/time (2 s resolution,
/// clamped to the representable 1980..=2107 range).
fn millis_to_dos(millis: i64) -> u32 {
    let secs = millis.div_euclid(1000);
    let days = secs.div_euclid(86_400);
    let tod = secs.rem_euclid(86_400);
    let (mut year, month, day) = civil_from_days(days);
    year = year.clamp(1980, 2107);
    let date = (((year - 1980) as u32) << 9) | (month << 5) | day;
    let time =
        ((tod / 3600) as u32) << 11 | (((tod % 3600) / 60) as u32) << 5 | ((tod % 60) / 2) as u32;
    (date << 16) | time
}

fn dos_to_millis(dos: u32) -> i64 {
    let date = dos >> 16;
    let time = dos & 0xFFFF;
    let year = 1980 + ((date >> 9) & 0x7F) as i64;
    let month = ((date >> 5) & 0x0F).clamp(1, 12);
    let day = (date & 0x1F).clamp(1, 31);
    let days = days_from_civil(year, month, day);
    let secs = ((time >> 11) & 0x1F) as i64 * 3600
        + ((time >> 5) & 0x3F) as i64 * 60
        + (time & 0x1F) as i64 * 2;
    (days * 86_400 + secs) * 1000
}

/// One parsed central-directory record.
#[derive(Debug, Clone)]
struct ZipRecord {
    method: u16,
    crc: u32,
    compressed_size: u64,
    local_offset: u64,
}

/// A reader over a range of the slurped archive.
struct ByteRange {
    data: Arc<Vec<u8>>,
    pos: usize,
    end: usize,
}

impl Read for ByteRange {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = (self.end - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Validates the CRC-32 of a payload as it drains.
struct CrcValidatingReader {
    inner: Box<dyn Read + Send>,
    digest: Option<crc::Digest<'static, u32>>,
    expected: u32,
}

impl CrcValidatingReader {
    fn new(inner: Box<dyn Read + Send>, expected: u32) -> Self {
        CrcValidatingReader {
            inner,
            digest: Some(CRC32.digest()),
            expected,
        }
    }
}

impl Read for CrcValidatingReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            if let Some(digest) = self.digest.take() {
                if digest.finalize() != self.expected {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "ZIP entry failed its CRC-32 check",
                    ));
                }
            }
        } else if let Some(digest) = &mut self.digest {
            digest.update(&buf[..n]);
        }
        Ok(n)
    }
}

impl InputStream for CrcValidatingReader {}

/// An archive opened for reading; see the module docs.
pub struct ZipInputService {
    data: Arc<Vec<u8>>,
    entries: Vec<Entry>,
    records: BTreeMap<String, ZipRecord>,
}

impl ZipInputService {
    pub fn parse(data: Vec<u8>) -> FsResult<Self> {
        let data = Arc::new(data);
        let eocd = Self::find_eocd(&data)?;
        let (count, cd_offset) = Self::read_eocd(&data, eocd)?;

        let mut entries = Vec::with_capacity(count);
        let mut records = BTreeMap::new();
        let mut pos = cd_offset;
        for _ in 0..count {
            if read_u32(&data, pos)? != CENTRAL_SIG {
                return Err(FsError::CorruptArchive(
                    "bad central directory signature".into(),
                ));
            }
            let method = read_u16(&data, pos + 10)?;
            let dos_time = read_u32(&data, pos + 12)?;
            let crc = read_u32(&data, pos + 16)?;
            let compressed_size = read_u32(&data, pos + 20)? as u64;
            let size = read_u32(&data, pos + 24)? as u64;
            let name_len = read_u16(&data, pos + 28)? as usize;
            let extra_len = read_u16(&data, pos + 30)? as usize;
            let comment_len = read_u16(&data, pos + 32)? as usize;
            let local_offset = read_u32(&data, pos + 42)? as u64;
            let name_bytes = data
                .get(pos + 46..pos + 46 + name_len)
                .ok_or_else(|| FsError::CorruptArchive("truncated entry name".into()))?;
            let raw_name = String::from_utf8_lossy(name_bytes).into_owned();

            let ty = if raw_name.ends_with('/') {
                EntryType::Directory
            } else {
                EntryType::File
            };
            let mut entry = Entry::new(raw_name.clone(), ty);
            if ty == EntryType::File {
                entry.set_size(Size::Data, size);
                entry.set_size(Size::Storage, compressed_size);
            }
            entry.set_time(Access::Write, dos_to_millis(dos_time));
            entries.push(entry);

            let canonical = raw_name.trim_matches('/').to_string();
            records.insert(
                canonical,
                ZipRecord {
                    method,
                    crc,
                    compressed_size,
                    local_offset,
                },
            );

            pos += 46 + name_len + extra_len + comment_len;
        }

        Ok(ZipInputService {
            data,
            entries,
            records,
        })
    }

    /// Scans backwards over the (optional) archive comment for the end
    /// record.
    fn find_eocd(data: &[u8]) -> FsResult<usize> {
        if data.len() < 22 {
            return Err(FsError::CorruptArchive("too short for a ZIP archive".into()));
        }
        let floor = data.len().saturating_sub(22 + u16::MAX as usize);
        let mut pos = data.len() - 22;
        loop {
            if read_u32(data, pos)? == EOCD_SIG {
                return Ok(pos);
            }
            if pos == floor {
                return Err(FsError::CorruptArchive(
                    "missing end of central directory".into(),
                ));
            }
            pos -= 1;
        }
    }

    fn read_eocd(data: &[u8], eocd: usize) -> FsResult<(usize, usize)> {
        let count = read_u16(data, eocd + 10)? as u64;
        let cd_offset = read_u32(data, eocd + 16)? as u64;
        if count != u16::MAX as u64 && cd_offset != u32::MAX as u64 {
            return Ok((count as usize, cd_offset as usize));
        }
        // ZIP64: the locator precedes the end record.
        let locator = eocd
            .checked_sub(20)
            .ok_or_else(|| FsError::CorruptArchive("missing ZIP64 locator".into()))?;
        if read_u32(data, locator)? != ZIP64_LOCATOR_SIG {
            return Err(FsError::CorruptArchive("missing ZIP64 locator".into()));
        }
        let zip64_eocd = read_u64(data, locator + 8)? as usize;
        if read_u32(data, zip64_eocd)? != ZIP64_EOCD_SIG {
            return Err(FsError::CorruptArchive(
                "bad ZIP64 end of central directory".into(),
            ));
        }
        let count = read_u64(data, zip64_eocd + 32)? as usize;
        let cd_offset = read_u64(data, zip64_eocd + 48)? as usize;
        Ok((count, cd_offset))
    }
}

impl InputService for ZipInputService {
    fn entries(&self) -> Vec<Entry> {
        self.entries.clone()
    }

    fn open_entry(&self, name: &str) -> FsResult<Box<dyn InputStream>> {
        let record = self
            .records
            .get(name)
            .ok_or_else(|| FsError::NoSuchEntry(name.to_string()))?;
        // The local header's name/extra lengths may differ from the
        // central directory's.
        let local = record.local_offset as usize;
        if read_u32(&self.data, local)? != LOCAL_SIG {
            return Err(FsError::CorruptArchive("bad local header signature".into()));
        }
        let name_len = read_u16(&self.data, local + 26)? as usize;
        let extra_len = read_u16(&self.data, local + 28)? as usize;
        let start = local + 30 + name_len + extra_len;
        let end = start + record.compressed_size as usize;
        if end > self.data.len() {
            return Err(FsError::CorruptArchive("entry data out of bounds".into()));
        }
        let range = ByteRange {
            data: self.data.clone(),
            pos: start,
            end,
        };
        let raw: Box<dyn Read + Send> = match record.method {
            METHOD_STORED => Box::new(range),
            METHOD_DEFLATED => Box::new(DeflateDecoder::new(range)),
            _ => {
                return Err(FsError::Unsupported(
                    "unsupported ZIP compression method",
                ))
            }
        };
        Ok(Box::new(CrcValidatingReader::new(raw, record.crc)))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct PendingCentral {
    name: Vec<u8>,
    method: u16,
    dos_time: u32,
    crc: u32,
    compressed_size: u32,
    size: u32,
    local_offset: u32,
    is_dir: bool,
}

/// An archive being written.
pub struct ZipOutputService {
    sink: Option<Box<dyn OutputStream>>,
    offset: u64,
    central: Vec<PendingCentral>,
    default_compress: bool,
    /// ODF containers buffer entries so `mimetype` can go first.
    reorder_mimetype: Option<Vec<(Entry, AccessOptions, Option<Vec<u8>>)>>,
}

impl ZipOutputService {
    fn new(sink: Box<dyn OutputStream>, default_compress: bool, reorder_mimetype: bool) -> Self {
        ZipOutputService {
            sink: Some(sink),
            offset: 0,
            central: Vec::new(),
            default_compress,
            reorder_mimetype: reorder_mimetype.then(Vec::new),
        }
    }

    fn method_for(&self, options: AccessOptions, raw_len: usize) -> u16 {
        if raw_len == 0 || options.contains(AccessOptions::STORE) {
            METHOD_STORED
        } else if options.contains(AccessOptions::COMPRESS) || self.default_compress {
            METHOD_DEFLATED
        } else {
            METHOD_STORED
        }
    }

    fn write_entry(
        &mut self,
        entry: &Entry,
        options: AccessOptions,
        raw: Option<Vec<u8>>,
    ) -> FsResult<()> {
        let is_dir = entry.is_directory();
        let name = entry.name().as_bytes().to_vec();
        let raw = raw.unwrap_or_default();
        if raw.len() > u32::MAX as usize || self.offset > u32::MAX as u64 {
            return Err(FsError::Unsupported("archive exceeds the ZIP32 limits"));
        }
        let crc = CRC32.checksum(&raw);
        let mut method = self.method_for(options, raw.len());
        let mut payload = if method == METHOD_DEFLATED {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&raw)?;
            encoder.finish()?
        } else {
            raw.clone()
        };
        // Incompressible data: fall back to storing it.
        if method == METHOD_DEFLATED && payload.len() >= raw.len() {
            method = METHOD_STORED;
            payload = raw.clone();
        }
        let dos_time = millis_to_dos(entry.time(Access::Write).unwrap_or_else(now_millis));

        let mut header = Vec::with_capacity(30 + name.len());
        header.extend_from_slice(&LOCAL_SIG.to_le_bytes());
        header.extend_from_slice(&20u16.to_le_bytes()); // version needed
        header.extend_from_slice(&FLAG_UTF8.to_le_bytes());
        header.extend_from_slice(&method.to_le_bytes());
        header.extend_from_slice(&dos_time.to_le_bytes());
        header.extend_from_slice(&crc.to_le_bytes());
        header.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        header.extend_from_slice(&(raw.len() as u32).to_le_bytes());
        header.extend_from_slice(&(name.len() as u16).to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes()); // extra length
        header.extend_from_slice(&name);

        let sink = self
            .sink
            .as_mut()
            .ok_or(FsError::Unsupported("output service is finished"))?;
        sink.write_all(&header)?;
        sink.write_all(&payload)?;

        self.central.push(PendingCentral {
            name,
            method,
            dos_time,
            crc,
            compressed_size: payload.len() as u32,
            size: raw.len() as u32,
            local_offset: self.offset as u32,
            is_dir,
        });
        self.offset += (header.len() + payload.len()) as u64;
        Ok(())
    }

    fn write_trailer(&mut self) -> FsResult<()> {
        if self.central.len() > u16::MAX as usize {
            return Err(FsError::Unsupported("archive exceeds the ZIP32 limits"));
        }
        let cd_offset = self.offset;
        let mut cd = Vec::new();
        for record in &self.central {
            cd.extend_from_slice(&CENTRAL_SIG.to_le_bytes());
            cd.extend_from_slice(&20u16.to_le_bytes()); // version made by
            cd.extend_from_slice(&20u16.to_le_bytes()); // version needed
            cd.extend_from_slice(&FLAG_UTF8.to_le_bytes());
            cd.extend_from_slice(&record.method.to_le_bytes());
            cd.extend_from_slice(&record.dos_time.to_le_bytes());
            cd.extend_from_slice(&record.crc.to_le_bytes());
            cd.extend_from_slice(&record.compressed_size.to_le_bytes());
            cd.extend_from_slice(&record.size.to_le_bytes());
            cd.extend_from_slice(&(record.name.len() as u16).to_le_bytes());
            cd.extend_from_slice(&[0u8; 2 + 2 + 2 + 2]); // extra, comment, disk, internal attrs
            let external = if record.is_dir { 0x10u32 } else { 0 };
            cd.extend_from_slice(&external.to_le_bytes());
            cd.extend_from_slice(&record.local_offset.to_le_bytes());
            cd.extend_from_slice(&record.name);
        }
        let mut eocd = Vec::with_capacity(22);
        eocd.extend_from_slice(&EOCD_SIG.to_le_bytes());
        eocd.extend_from_slice(&[0u8; 4]); // disk numbers
        eocd.extend_from_slice(&(self.central.len() as u16).to_le_bytes());
        eocd.extend_from_slice(&(self.central.len() as u16).to_le_bytes());
        eocd.extend_from_slice(&(cd.len() as u32).to_le_bytes());
        eocd.extend_from_slice(&(cd_offset as u32).to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes()); // comment length

        let mut sink = self
            .sink
            .take()
            .ok_or(FsError::Unsupported("output service is finished"))?;
        sink.write_all(&cd)?;
        sink.write_all(&eocd)?;
        sink.close()
    }
}

impl OutputService for ZipOutputService {
    fn put(
        &mut self,
        entry: &Entry,
        options: AccessOptions,
        data: Option<&mut dyn Read>,
    ) -> FsResult<()> {
        let raw = match data {
            Some(reader) => {
                let mut raw = Vec::new();
                reader.read_to_end(&mut raw)?;
                Some(raw)
            }
            None => None,
        };
        if let Some(buffered) = &mut self.reorder_mimetype {
            buffered.push((entry.clone(), options, raw));
            return Ok(());
        }
        self.write_entry(entry, options, raw)
    }

    fn finish(&mut self) -> FsResult<()> {
        if let Some(mut buffered) = self.reorder_mimetype.take() {
            // The container magic requires a stored `mimetype` as the
            // very first entry.
            if let Some(pos) = buffered.iter().position(|(e, _, _)| e.name() == "mimetype") {
                let (entry, _, raw) = buffered.remove(pos);
                self.write_entry(&entry, AccessOptions::STORE, raw)?;
            }
            for (entry, options, raw) in buffered {
                self.write_entry(&entry, options, raw)?;
            }
        }
        self.write_trailer()
    }
}

/// The ZIP driver family; see the module docs for the variants.
pub struct ZipDriver {
    default_compress: bool,
    reorder_mimetype: bool,
    read_only_update: bool,
}

impl ZipDriver {
    /// Plain `zip` archives, DEFLATE by default.
    pub fn new() -> Self {
        ZipDriver {
            default_compress: true,
            reorder_mimetype: false,
            read_only_update: false,
        }
    }

    /// `jar`, `war`, `ear` containers.
    pub fn jar() -> Self {
        ZipDriver::new()
    }

    /// OpenDocument containers: the stored `mimetype` entry goes first.
    pub fn odf() -> Self {
        ZipDriver {
            default_compress: true,
            reorder_mimetype: true,
            read_only_update: false,
        }
    }

    /// Self-extracting archives: readable, but never rewritten, so the
    /// executable preamble cannot be destroyed.
    pub fn exe() -> Self {
        ZipDriver {
            default_compress: true,
            reorder_mimetype: false,
            read_only_update: true,
        }
    }
}

impl Default for ZipDriver {
    fn default() -> Self {
        ZipDriver::new()
    }
}

impl ArchiveDriver for ZipDriver {
    fn charset(&self) -> &'static str {
        "UTF-8"
    }

    fn encodable(&self, name: &str) -> bool {
        !name.contains('\u{0}') && name.len() <= u16::MAX as usize
    }

    fn new_entry(
        &self,
        name: &str,
        ty: EntryType,
        options: AccessOptions,
        template: Option<&Entry>,
    ) -> FsResult<Entry> {
        if !self.encodable(name) {
            return Err(FsError::AccessDenied(name.to_string()));
        }
        let shaped = match ty {
            EntryType::Directory if !name.ends_with('/') => format!("{name}/"),
            _ => name.to_string(),
        };
        let mut entry = Entry::new(shaped, ty);
        if let Some(template) = template {
            entry = entry.with_template(template);
        }
        // An operation context may carry the method choice even when the
        // immediate options do not.
        let effective = if options.is_empty() {
            OperationContext::current().unwrap_or(options)
        } else {
            options
        };
        if effective.contains(AccessOptions::STORE) {
            if let Some(size) = entry.size(Size::Data) {
                entry.set_size(Size::Storage, size);
            }
        }
        Ok(entry)
    }

    fn new_input_service(
        &self,
        _model: &Arc<FsModel>,
        source: &InputSocket,
    ) -> FsResult<Box<dyn InputService>> {
        let mut stream = source.open_stream()?;
        let mut data = Vec::new();
        stream.read_to_end(&mut data)?;
        stream.close()?;
        Ok(Box::new(ZipInputService::parse(data)?))
    }

    fn new_output_service(
        &self,
        model: &Arc<FsModel>,
        sink: &OutputSocket,
        _input: Option<&dyn InputService>,
    ) -> FsResult<Box<dyn OutputService>> {
        if self.read_only_update {
            return Err(FsError::ReadOnly(
                model.mount_point().canonical().to_string(),
            ));
        }
        let stream = sink.open_stream()?;
        Ok(Box::new(ZipOutputService::new(
            stream,
            self.default_compress,
            self.reorder_mimetype,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cio::OutputEndpoint;
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

    fn write_archive(entries: &[(&str, AccessOptions, Option<&[u8]>)]) -> Vec<u8> {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut out = ZipOutputService::new(Box::new(VecSink(sink.clone())), true, false);
        for (name, options, data) in entries {
            let ty = if name.ends_with('/') {
                EntryType::Directory
            } else {
                EntryType::File
            };
            let mut entry = Entry::new(*name, ty);
            entry.set_time(Access::Write, 1_400_000_000_000);
            match data {
                Some(bytes) => {
                    let mut reader = &bytes[..];
                    out.put(&entry, *options, Some(&mut reader)).unwrap();
                }
                None => out.put(&entry, *options, None).unwrap(),
            }
        }
        out.finish().unwrap();
        let bytes = sink.lock().unwrap().clone();
        bytes
    }

    fn read_entry(service: &ZipInputService, name: &str) -> Vec<u8> {
        let mut stream = service.open_entry(name).unwrap();
        let mut data = Vec::new();
        stream.read_to_end(&mut data).unwrap();
        data
    }

    #[test]
    fn test_round_trip() {
        let bytes = write_archive(&[
            ("dir/", AccessOptions::empty(), None),
            ("dir/hello.txt", AccessOptions::empty(), Some(b"hello zip")),
            ("stored.bin", AccessOptions::STORE, Some(b"as-is")),
        ]);
        let service = ZipInputService::parse(bytes).unwrap();
        assert_eq!(service.len(), 3);
        assert_eq!(read_entry(&service, "dir/hello.txt"), b"hello zip");
        assert_eq!(read_entry(&service, "stored.bin"), b"as-is");

        let dir = &service.entries()[0];
        assert!(dir.is_directory());
        assert_eq!(dir.name(), "dir/");
    }

    #[test]
    fn test_store_option_sets_method() {
        let bytes = write_archive(&[("x", AccessOptions::STORE, Some(b"abcdefabcdefabcdef"))]);
        let service = ZipInputService::parse(bytes).unwrap();
        assert_eq!(service.records.get("x").unwrap().method, METHOD_STORED);

        let bytes = write_archive(&[(
            "x",
            AccessOptions::COMPRESS,
            Some(b"abcdefabcdefabcdefabcdefabcdefabcdef"),
        )]);
        let service = ZipInputService::parse(bytes).unwrap();
        assert_eq!(service.records.get("x").unwrap().method, METHOD_DEFLATED);
    }

    #[test]
    fn test_garbage_is_not_an_archive() {
        assert!(matches!(
            ZipInputService::parse(b"notazip".to_vec()),
            Err(FsError::CorruptArchive(_))
        ));
        assert!(matches!(
            ZipInputService::parse(vec![0u8; 4096]),
            Err(FsError::CorruptArchive(_))
        ));
    }

    #[test]
    fn test_crc_mismatch_is_detected() {
        let mut bytes = write_archive(&[("x", AccessOptions::STORE, Some(b"sensitive data"))]);
        // Flip one payload byte (local header is 30 + 1 name byte).
        bytes[31] ^= 0xFF;
        let service = ZipInputService::parse(bytes).unwrap();
        let mut stream = service.open_entry("x").unwrap();
        let mut sunk = Vec::new();
        let err = stream.read_to_end(&mut sunk).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_empty_archive_round_trips() {
        let bytes = write_archive(&[]);
        let service = ZipInputService::parse(bytes).unwrap();
        assert_eq!(service.len(), 0);
    }

    #[test]
    fn test_archive_comment_is_tolerated() {
        let mut bytes = write_archive(&[("a", AccessOptions::empty(), Some(b"x"))]);
        // A trailing comment shifts the end record away from the end;
        // patch the recorded comment length accordingly.
        let eocd = bytes.len() - 22;
        bytes[eocd + 20] = 9;
        bytes.extend_from_slice(b"a comment");
        let service = ZipInputService::parse(bytes).unwrap();
        assert_eq!(read_entry(&service, "a"), b"x");
    }

    #[test]
    fn test_sfx_preamble_is_tolerated() {
        let zip = write_archive(&[("payload", AccessOptions::empty(), Some(b"data"))]);
        let mut bytes = b"#!/bin/sh fake stub\n".to_vec();
        let preamble = bytes.len() as u32;
        bytes.extend_from_slice(&zip);
        // Shift the recorded offsets past the preamble.
        let eocd = bytes.len() - 22;
        let cd_offset = u32::from_le_bytes(bytes[eocd + 16..eocd + 20].try_into().unwrap());
        let shifted = cd_offset + preamble;
        bytes[eocd + 16..eocd + 20].copy_from_slice(&shifted.to_le_bytes());
        let local_field = shifted as usize + 42;
        let local = u32::from_le_bytes(bytes[local_field..local_field + 4].try_into().unwrap());
        bytes[local_field..local_field + 4].copy_from_slice(&(local + preamble).to_le_bytes());

        let service = ZipInputService::parse(bytes).unwrap();
        assert_eq!(read_entry(&service, "payload"), b"data");
    }

    #[test]
    fn test_mimetype_goes_first() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut out = ZipOutputService::new(Box::new(VecSink(sink.clone())), true, true);
        let mut content = Entry::new("content.xml", EntryType::File);
        content.set_time(Access::Write, 1_400_000_000_000);
        let mut mimetype = Entry::new("mimetype", EntryType::File);
        mimetype.set_time(Access::Write, 1_400_000_000_000);
        out.put(
            &content,
            AccessOptions::empty(),
            Some(&mut &b"<doc/>"[..]),
        )
        .unwrap();
        out.put(
            &mimetype,
            AccessOptions::empty(),
            Some(&mut &b"application/vnd.oasis.opendocument.text"[..]),
        )
        .unwrap();
        out.finish().unwrap();

        let bytes = sink.lock().unwrap().clone();
        // First local header names `mimetype` and stores it.
        let name_len = u16::from_le_bytes(bytes[26..28].try_into().unwrap()) as usize;
        assert_eq!(&bytes[30..30 + name_len], b"mimetype");
        let method = u16::from_le_bytes(bytes[8..10].try_into().unwrap());
        assert_eq!(method, METHOD_STORED);
    }

    #[test]
    fn test_dos_time_round_trip() {
        // 2014-05-13 16:53:20 UTC, even seconds.
        let millis = 1_400_000_000_000;
        let dos = millis_to_dos(millis);
        assert_eq!(dos_to_millis(dos), millis);
        // Pre-1980 clamps instead of corrupting.
        let clamped = dos_to_millis(millis_to_dos(0));
        assert!(clamped >= days_from_civil(1980, 1, 1) * 86_400_000);
    }

    #[test]
    fn test_exe_driver_refuses_updates() {
        struct NullOutput;
        impl OutputEndpoint for NullOutput {
            fn local_target(&mut self) -> FsResult<Entry> {
                Ok(Entry::new("a.exe", EntryType::File))
            }
            fn open_stream(
                &mut self,
                _peer: Option<&Entry>,
            ) -> FsResult<Box<dyn OutputStream>> {
                unreachable!("the driver must refuse before opening");
            }
        }
        let driver = ZipDriver::exe();
        let model = FsModel::new(
            crate::addr::MountPoint::parse("exe:file:/a.exe!/").unwrap(),
            Some(FsModel::new(
                crate::addr::MountPoint::parse("file:/").unwrap(),
                None,
            )),
        );
        let sink = OutputSocket::new(NullOutput);
        assert!(matches!(
            driver.new_output_service(&model, &sink, None),
            Err(FsError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_context_store_hint_in_new_entry() {
        let driver = ZipDriver::new();
        let mut template = Entry::new("x", EntryType::File);
        template.set_size(Size::Data, 11);
        // Without context or options, no storage size is predicted.
        let plain = driver
            .new_entry("x", EntryType::File, AccessOptions::empty(), Some(&template))
            .unwrap();
        assert_eq!(plain.size(Size::Storage), None);
        // STORE as an explicit option predicts size-preserving storage.
        let stored = driver
            .new_entry("x", EntryType::File, AccessOptions::STORE, Some(&template))
            .unwrap();
        assert_eq!(stored.size(Size::Storage), Some(11));
    }
}
