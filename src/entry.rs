//! Entry metadata: types, sizes, access times and directory listings.

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;

/// Sentinel for unknown sizes and times.
pub const UNKNOWN: i64 = -1;

/// The shape of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Directory,
    Symlink,
    Special,
}

/// The size kinds tracked per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    /// Uncompressed payload size.
    Data,
    /// Size as stored in the container (compressed, padded, ...).
    Storage,
}

/// The access kinds tracked per entry. `Read`, `Write` and `Create` also
/// key the per-entry timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Create,
    Execute,
}

bitflags! {
    /// A set of [`Access`] kinds, for `check_access` and `set_time`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AccessSet: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CREATE = 1 << 2;
        const EXECUTE = 1 << 3;
    }
}

impl From<Access> for AccessSet {
    fn from(access: Access) -> Self {
        match access {
            Access::Read => AccessSet::READ,
            Access::Write => AccessSet::WRITE,
            Access::Create => AccessSet::CREATE,
            Access::Execute => AccessSet::EXECUTE,
        }
    }
}

/// Milliseconds since the Unix epoch, or [`UNKNOWN`].
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(UNKNOWN)
}

/// Metadata for one entry of a file system or archive.
///
/// Sizes and times use [`UNKNOWN`] when the container does not record
/// them. Directory entries may carry the sorted set of their child names.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    name: String,
    ty: EntryType,
    sizes: [i64; 2],
    times: [i64; 3],
    read_only: bool,
    children: Option<BTreeSet<String>>,
    link_target: Option<String>,
}

impl Entry {
    pub fn new(name: impl Into<String>, ty: EntryType) -> Self {
        Entry {
            name: name.into(),
            ty,
            sizes: [UNKNOWN; 2],
            times: [UNKNOWN; 3],
            read_only: false,
            children: match ty {
                EntryType::Directory => Some(BTreeSet::new()),
                _ => None,
            },
            link_target: None,
        }
    }

    /// A file entry stamped with the current time.
    pub fn file(name: impl Into<String>) -> Self {
        let mut e = Entry::new(name, EntryType::File);
        e.set_time(Access::Write, now_millis());
        e
    }

    /// A directory entry stamped with the current time.
    pub fn directory(name: impl Into<String>) -> Self {
        let mut e = Entry::new(name, EntryType::Directory);
        e.set_time(Access::Write, now_millis());
        e
    }

    /// Copies sizes, times and the link target from `template`, as used
    /// by `mknod` and the copy pipeline to preserve metadata across file
    /// systems.
    pub fn with_template(mut self, template: &Entry) -> Self {
        self.sizes = template.sizes;
        self.times = template.times;
        self.link_target = template.link_target.clone();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn ty(&self) -> EntryType {
        self.ty
    }

    pub fn is_directory(&self) -> bool {
        self.ty == EntryType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.ty == EntryType::File
    }

    /// The size of the given kind, or `None` if unknown.
    pub fn size(&self, kind: Size) -> Option<u64> {
        let raw = self.sizes[kind as usize];
        (raw >= 0).then_some(raw as u64)
    }

    pub fn set_size(&mut self, kind: Size, size: u64) {
        self.sizes[kind as usize] = size as i64;
    }

    /// The timestamp of the given kind in milliseconds, or `None`.
    /// `Access::Execute` carries no timestamp.
    pub fn time(&self, kind: Access) -> Option<i64> {
        match kind {
            Access::Execute => None,
            other => {
                let raw = self.times[other as usize];
                (raw >= 0).then_some(raw)
            }
        }
    }

    pub fn set_time(&mut self, kind: Access, millis: i64) {
        if !matches!(kind, Access::Execute) {
            self.times[kind as usize] = millis;
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// Child names for directories, `None` otherwise.
    pub fn children(&self) -> Option<&BTreeSet<String>> {
        self.children.as_ref()
    }

    pub fn set_children(&mut self, children: BTreeSet<String>) {
        self.children = Some(children);
    }

    /// The target of a symlink entry, `None` otherwise.
    pub fn link_target(&self) -> Option<&str> {
        self.link_target.as_deref()
    }

    pub fn set_link_target(&mut self, target: impl Into<String>) {
        self.link_target = Some(target.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_sizes_and_times() {
        let e = Entry::new("x", EntryType::File);
        assert_eq!(e.size(Size::Data), None);
        assert_eq!(e.size(Size::Storage), None);
        assert_eq!(e.time(Access::Write), None);
    }

    #[test]
    fn test_size_and_time_round_trip() {
        let mut e = Entry::new("x", EntryType::File);
        e.set_size(Size::Data, 42);
        e.set_time(Access::Write, 1_000_000);
        assert_eq!(e.size(Size::Data), Some(42));
        assert_eq!(e.size(Size::Storage), None);
        assert_eq!(e.time(Access::Write), Some(1_000_000));
        assert_eq!(e.time(Access::Read), None);
    }

    #[test]
    fn test_execute_has_no_timestamp() {
        let mut e = Entry::new("x", EntryType::File);
        e.set_time(Access::Execute, 5);
        assert_eq!(e.time(Access::Execute), None);
    }

    #[test]
    fn test_directory_has_children() {
        let e = Entry::new("d", EntryType::Directory);
        assert!(e.children().is_some());
        assert!(Entry::new("f", EntryType::File).children().is_none());
    }

    #[test]
    fn test_template_copies_metadata() {
        let mut tpl = Entry::new("src", EntryType::File);
        tpl.set_size(Size::Data, 7);
        tpl.set_time(Access::Write, 99);
        let e = Entry::new("dst", EntryType::File).with_template(&tpl);
        assert_eq!(e.size(Size::Data), Some(7));
        assert_eq!(e.time(Access::Write), Some(99));
        assert_eq!(e.name(), "dst");
    }
}
