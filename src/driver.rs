//! The archive driver contract and the scheme/extension registry.
//!
//! A driver owns the byte layout of one archive family. The kernel talks
//! to it through three factories: entries, input services (an archive
//! opened for enumeration and reading) and output services (an archive
//! being written). Drivers never see mount points or locks; they read
//! from and write to the sockets the kernel hands them, which is what
//! makes nesting work — the "file" an inner archive parses may well be a
//! staging buffer of the enclosing archive.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::addr::Scheme;
use crate::cio::{InputSocket, InputStream, OutputSocket};
use crate::entry::{Entry, EntryType};
use crate::error::{FsError, FsResult};
use crate::model::FsModel;
use crate::option::AccessOptions;

/// An archive opened for reading.
pub trait InputService: Send {
    /// All entries, in archive order. Names are archive-level (directory
    /// names may carry a trailing `/`).
    fn entries(&self) -> Vec<Entry>;

    /// Opens the payload of one entry by its canonical name.
    fn open_entry(&self, name: &str) -> FsResult<Box<dyn InputStream>>;

    fn len(&self) -> usize {
        self.entries().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An archive being written. Entries must be put in the caller's order;
/// [`OutputService::finish`] writes the container trailer (e.g. the ZIP
/// central directory) and closes the sink.
pub trait OutputService: Send {
    /// Appends one entry. `options` are the access options snapshotted
    /// when the entry was written (e.g. `STORE` vs `COMPRESS`); `data`
    /// is `None` for directories and other payload-free entries.
    fn put(
        &mut self,
        entry: &Entry,
        options: AccessOptions,
        data: Option<&mut dyn std::io::Read>,
    ) -> FsResult<()>;

    /// Commits the container. Must be called exactly once.
    fn finish(&mut self) -> FsResult<()>;
}

/// The format-specific factory behind one scheme.
pub trait ArchiveDriver: Send + Sync {
    /// The entry-name encoding advertised by this driver.
    fn charset(&self) -> &'static str {
        "UTF-8"
    }

    /// Whether this driver can store the given entry name.
    fn encodable(&self, name: &str) -> bool {
        let _ = name;
        true
    }

    /// Builds an archive-level entry, shaping the name to the format's
    /// conventions (directory names end in `/`).
    fn new_entry(
        &self,
        name: &str,
        ty: EntryType,
        options: AccessOptions,
        template: Option<&Entry>,
    ) -> FsResult<Entry> {
        let shaped = match ty {
            EntryType::Directory if !name.ends_with('/') => format!("{name}/"),
            _ => name.to_string(),
        };
        let _ = options;
        let mut entry = Entry::new(shaped, ty);
        if let Some(template) = template {
            entry = entry.with_template(template);
        }
        Ok(entry)
    }

    /// Opens an archive for reading. Fails with a probe error (e.g.
    /// [`FsError::CorruptArchive`]) when the bytes do not match the
    /// format — the kernel turns that into a false positive.
    fn new_input_service(
        &self,
        model: &Arc<FsModel>,
        source: &InputSocket,
    ) -> FsResult<Box<dyn InputService>>;

    /// Opens an archive for writing. `input` is the previously mounted
    /// input service, for drivers that can reuse stored entry data when
    /// updating in place.
    fn new_output_service(
        &self,
        model: &Arc<FsModel>,
        sink: &OutputSocket,
        input: Option<&dyn InputService>,
    ) -> FsResult<Box<dyn OutputService>>;
}

/// Maps schemes to drivers and file-name extensions to schemes.
pub struct DriverRegistry {
    by_scheme: BTreeMap<Scheme, Arc<dyn ArchiveDriver>>,
    /// `(lowercase extension, scheme)`, matched as the longest `.ext`
    /// suffix so that `tar.gz` wins over `gz`.
    extensions: Vec<(String, Scheme)>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        DriverRegistry {
            by_scheme: BTreeMap::new(),
            extensions: Vec::new(),
        }
    }

    /// Registers a driver under a scheme and its canonical extensions.
    pub fn register(
        &mut self,
        scheme: Scheme,
        extensions: &[&str],
        driver: Arc<dyn ArchiveDriver>,
    ) {
        for ext in extensions {
            self.extensions.push((ext.to_lowercase(), scheme.clone()));
        }
        self.extensions
            .sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        self.by_scheme.insert(scheme, driver);
    }

    /// The driver for a scheme.
    pub fn driver(&self, scheme: &Scheme) -> FsResult<Arc<dyn ArchiveDriver>> {
        self.by_scheme
            .get(scheme)
            .cloned()
            .ok_or_else(|| FsError::Unsupported("no driver registered for scheme"))
    }

    /// The scheme whose extension matches the file name, longest suffix
    /// first, or `None` when the name does not look like an archive.
    pub fn scheme_for(&self, name: &str) -> Option<&Scheme> {
        let lower = name.to_lowercase();
        self.extensions
            .iter()
            .find(|(ext, _)| {
                lower
                    .strip_suffix(ext.as_str())
                    .is_some_and(|rest| rest.ends_with('.'))
            })
            .map(|(_, scheme)| scheme)
    }

    pub fn schemes(&self) -> impl Iterator<Item = &Scheme> {
        self.by_scheme.keys()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Size;

    struct NullDriver;

    impl ArchiveDriver for NullDriver {
        fn new_input_service(
            &self,
            _model: &Arc<FsModel>,
            _source: &InputSocket,
        ) -> FsResult<Box<dyn InputService>> {
            Err(FsError::Unsupported("null driver"))
        }

        fn new_output_service(
            &self,
            _model: &Arc<FsModel>,
            _sink: &OutputSocket,
            _input: Option<&dyn InputService>,
        ) -> FsResult<Box<dyn OutputService>> {
            Err(FsError::Unsupported("null driver"))
        }
    }

    fn registry() -> DriverRegistry {
        let mut r = DriverRegistry::new();
        r.register(
            Scheme::new("zip").unwrap(),
            &["zip"],
            Arc::new(NullDriver),
        );
        r.register(
            Scheme::new("targz").unwrap(),
            &["tgz", "tar.gz"],
            Arc::new(NullDriver),
        );
        r.register(Scheme::new("gz").unwrap(), &["gz"], Arc::new(NullDriver));
        r
    }

    #[test]
    fn test_longest_extension_wins() {
        let r = registry();
        assert_eq!(r.scheme_for("a.tar.gz").unwrap().as_str(), "targz");
        assert_eq!(r.scheme_for("a.gz").unwrap().as_str(), "gz");
        assert_eq!(r.scheme_for("ARCHIVE.ZIP").unwrap().as_str(), "zip");
        assert_eq!(r.scheme_for("plain.txt"), None);
        // The extension must be a full dot-delimited suffix.
        assert_eq!(r.scheme_for("notazip"), None);
    }

    #[test]
    fn test_driver_lookup() {
        let r = registry();
        assert!(r.driver(&Scheme::new("zip").unwrap()).is_ok());
        assert!(r.driver(&Scheme::new("rar").unwrap()).is_err());
    }

    #[test]
    fn test_default_entry_shaping() {
        let d = NullDriver;
        let e = d
            .new_entry("dir", EntryType::Directory, AccessOptions::empty(), None)
            .unwrap();
        assert_eq!(e.name(), "dir/");
        let mut tpl = Entry::new("src", EntryType::File);
        tpl.set_size(Size::Data, 3);
        let f = d
            .new_entry("f", EntryType::File, AccessOptions::empty(), Some(&tpl))
            .unwrap();
        assert_eq!(f.name(), "f");
        assert_eq!(f.size(Size::Data), Some(3));
    }
}
