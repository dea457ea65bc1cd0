//! Addressing model: schemes, entry names, mount points and paths.
//!
//! A mount point identifies one (possibly federated) file system. It is
//! either *opaque* — an absolute host URI such as `file:/tmp/` — or
//! *nested*, written `scheme:` + parent path + `!/`, e.g.
//! `zip:file:/tmp/archive.zip!/` or `tar:zip:file:/foo!/bar!/`.
//!
//! An entry name is a normalized relative path inside one file system:
//! no leading `/`, `/` as separator, `""` for the root entry, and no
//! `.`/`..` segments after canonicalization.
//!
//! A [`FsPath`] combines both and uniquely addresses an entity. Parsing
//! decodes percent-escapes; rendering re-escapes `%`, `!` and space so
//! that the canonical form round-trips.

use std::fmt;
use std::sync::Arc;

use crate::error::{FsError, FsResult};

/// Characters escaped when rendering entry names into URIs. `!` would
/// otherwise collide with the archive separator.
const ESCAPED: &[char] = &['%', '!', ' '];

fn escape(name: &str) -> String {
    if !name.contains(ESCAPED) {
        return name.to_string();
    }
    let mut out = String::with_capacity(name.len() + 8);
    for c in name.chars() {
        match c {
            '%' => out.push_str("%25"),
            '!' => out.push_str("%21"),
            ' ' => out.push_str("%20"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> FsResult<String> {
    if !s.contains('%') {
        return Ok(s.to_string());
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| FsError::InvalidUri(format!("bad percent escape in {s:?}")))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| FsError::InvalidUri(format!("non-UTF-8 escape in {s:?}")))
}

/// Canonicalizes a `/`-separated path: drops empty and `.` segments and
/// resolves `..`. Fails if `..` would escape the root.
fn canonicalize(path: &str) -> FsResult<Vec<String>> {
    let mut segments: Vec<String> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(FsError::InvalidUri(format!(
                        "path escapes its root: {path:?}"
                    )));
                }
            }
            other => segments.push(other.to_string()),
        }
    }
    Ok(segments)
}

/// Symbolic identifier for a driver, e.g. `file`, `zip`, `targz`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scheme(String);

impl Scheme {
    /// Validates and wraps a scheme name. Schemes are lowercase ASCII
    /// starting with a letter, as in RFC 2396.
    pub fn new(s: &str) -> FsResult<Self> {
        let mut chars = s.chars();
        let valid = match chars.next() {
            Some(c) if c.is_ascii_lowercase() => {
                chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+-.".contains(c))
            }
            _ => false,
        };
        if !valid {
            return Err(FsError::InvalidUri(format!("invalid scheme: {s:?}")));
        }
        Ok(Scheme(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A normalized relative path inside one file system.
///
/// The empty name addresses the root entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EntryName(String);

impl EntryName {
    /// The root entry name.
    pub fn root() -> Self {
        EntryName(String::new())
    }

    /// Canonicalizes `path` into an entry name. Accepts an optional
    /// trailing `/` (directory queries) which is stripped.
    pub fn new(path: &str) -> FsResult<Self> {
        Ok(EntryName(canonicalize(path)?.join("/")))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Appends a relative name beneath this one.
    pub fn join(&self, rel: &EntryName) -> EntryName {
        if self.is_root() {
            rel.clone()
        } else if rel.is_root() {
            self.clone()
        } else {
            EntryName(format!("{}/{}", self.0, rel.0))
        }
    }

    /// The path segments, empty for the root.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Splits off the final segment, or `None` for the root.
    pub fn split_last(&self) -> Option<(EntryName, &str)> {
        if self.is_root() {
            return None;
        }
        match self.0.rsplit_once('/') {
            Some((parent, base)) => Some((EntryName(parent.to_string()), base)),
            None => Some((EntryName::root(), self.0.as_str())),
        }
    }
}

impl fmt::Display for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
struct MountPointInner {
    scheme: Scheme,
    /// `None` for opaque host mount points.
    parent: Option<(MountPoint, EntryName)>,
    canonical: String,
    hierarchical: String,
}

/// The URI of one file system in the federation tree.
#[derive(Debug, Clone)]
pub struct MountPoint(Arc<MountPointInner>);

impl MountPoint {
    /// Creates an opaque (host) mount point, e.g. `file:/tmp/`.
    ///
    /// The path part must be absolute and is canonicalized; a trailing
    /// `/` is implied.
    pub fn opaque(scheme: Scheme, path: &str) -> FsResult<Self> {
        if !path.starts_with('/') {
            return Err(FsError::InvalidUri(format!(
                "mount point path must be absolute: {path:?}"
            )));
        }
        let segments = canonicalize(path)?;
        let mut rendered = String::from("/");
        for seg in &segments {
            rendered.push_str(&escape(seg));
            rendered.push('/');
        }
        let canonical = format!("{scheme}:{rendered}");
        Ok(MountPoint(Arc::new(MountPointInner {
            scheme,
            parent: None,
            hierarchical: canonical.clone(),
            canonical,
        })))
    }

    /// Creates a federated mount point for an archive entry inside a
    /// parent file system.
    pub fn nested(scheme: Scheme, parent: MountPoint, entry: EntryName) -> FsResult<Self> {
        if entry.is_root() {
            return Err(FsError::InvalidUri(
                "nested mount point needs a non-root entry name".to_string(),
            ));
        }
        let escaped = escape(entry.as_str());
        let canonical = format!("{scheme}:{}{escaped}!/", parent.0.canonical);
        let mut hierarchical = parent.0.hierarchical.clone();
        if !hierarchical.ends_with('/') {
            hierarchical.push('/');
        }
        hierarchical.push_str(&escaped);
        Ok(MountPoint(Arc::new(MountPointInner {
            scheme,
            parent: Some((parent, entry)),
            canonical,
            hierarchical,
        })))
    }

    /// Parses a mount point URI, nested (`...!/`) or opaque (`scheme:/...`).
    pub fn parse(uri: &str) -> FsResult<Self> {
        if let Some(stripped) = uri.strip_suffix("!/") {
            let (scheme, rest) = stripped
                .split_once(':')
                .ok_or_else(|| FsError::InvalidUri(format!("missing scheme: {uri:?}")))?;
            let scheme = Scheme::new(scheme)?;
            let path = FsPath::parse(rest)?;
            if path.entry().is_root() {
                return Err(FsError::InvalidUri(format!(
                    "nested mount point names no entry: {uri:?}"
                )));
            }
            let (mount, entry) = path.into_parts();
            MountPoint::nested(scheme, mount, entry)
        } else {
            let (scheme, rest) = uri
                .split_once(':')
                .ok_or_else(|| FsError::InvalidUri(format!("missing scheme: {uri:?}")))?;
            let scheme = Scheme::new(scheme)?;
            let decoded = unescape(rest)?;
            MountPoint::opaque(scheme, &decoded)
        }
    }

    /// The outermost scheme, which selects the driver.
    pub fn scheme(&self) -> &Scheme {
        &self.0.scheme
    }

    /// The parent mount point, or `None` for host mount points.
    pub fn parent(&self) -> Option<&MountPoint> {
        self.0.parent.as_ref().map(|(m, _)| m)
    }

    /// The name of the archive entry inside the parent file system, or
    /// `None` for host mount points.
    pub fn parent_entry(&self) -> Option<&EntryName> {
        self.0.parent.as_ref().map(|(_, e)| e)
    }

    /// True for mount points nested inside another file system.
    pub fn is_federated(&self) -> bool {
        self.0.parent.is_some()
    }

    /// The canonical URI form; parsing it reproduces this mount point.
    pub fn canonical(&self) -> &str {
        &self.0.canonical
    }

    /// The plain hierarchical form with all archive separators resolved,
    /// e.g. `file:/foo/bar` for `tar:zip:file:/foo!/bar!/`. Used for
    /// deeper-first ordering and for filtering.
    pub fn hierarchical(&self) -> &str {
        &self.0.hierarchical
    }

    /// The decoded absolute path of an opaque (host) mount point, or
    /// `None` for federated ones.
    pub fn opaque_path(&self) -> Option<String> {
        if self.0.parent.is_some() {
            return None;
        }
        let rest = &self.0.canonical[self.0.scheme.as_str().len() + 1..];
        unescape(rest).ok()
    }

    /// Addresses an entry inside this file system.
    pub fn resolve(&self, entry: EntryName) -> FsPath {
        FsPath {
            mount: self.clone(),
            entry,
        }
    }

    /// True if `other` addresses this file system or one nested beneath
    /// it (by hierarchical URI).
    pub fn contains(&self, other: &MountPoint) -> bool {
        let f = self.hierarchical();
        let t = other.hierarchical();
        if t == f {
            return true;
        }
        if f.ends_with('/') {
            t.starts_with(f)
        } else {
            t.strip_prefix(f).is_some_and(|rest| rest.starts_with('/'))
        }
    }
}

impl PartialEq for MountPoint {
    fn eq(&self, other: &Self) -> bool {
        self.0.canonical == other.0.canonical
    }
}

impl Eq for MountPoint {}

impl std::hash::Hash for MountPoint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.canonical.hash(state);
    }
}

impl PartialOrd for MountPoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MountPoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.canonical.cmp(&other.0.canonical)
    }
}

impl fmt::Display for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.canonical)
    }
}

/// A mount point plus an entry name: the address of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FsPath {
    mount: MountPoint,
    entry: EntryName,
}

impl FsPath {
    pub fn new(mount: MountPoint, entry: EntryName) -> Self {
        FsPath { mount, entry }
    }

    /// Parses a path URI. Everything after the last `!/` is the entry
    /// name; a plain hierarchical URI splits at its final `/`.
    pub fn parse(uri: &str) -> FsResult<Self> {
        if let Some(pos) = uri.rfind("!/") {
            let mount = MountPoint::parse(&uri[..pos + 2])?;
            let entry = EntryName::new(&unescape(&uri[pos + 2..])?)?;
            Ok(FsPath { mount, entry })
        } else {
            let (scheme, rest) = uri
                .split_once(':')
                .ok_or_else(|| FsError::InvalidUri(format!("missing scheme: {uri:?}")))?;
            let scheme = Scheme::new(scheme)?;
            if !rest.starts_with('/') {
                return Err(FsError::InvalidUri(format!("not absolute: {uri:?}")));
            }
            let split = rest.rfind('/').unwrap_or(0);
            let mount = MountPoint::opaque(scheme, &unescape(&rest[..=split])?)?;
            let entry = EntryName::new(&unescape(&rest[split + 1..])?)?;
            Ok(FsPath { mount, entry })
        }
    }

    pub fn mount(&self) -> &MountPoint {
        &self.mount
    }

    pub fn entry(&self) -> &EntryName {
        &self.entry
    }

    pub fn into_parts(self) -> (MountPoint, EntryName) {
        (self.mount, self.entry)
    }

    /// Promotes this path to the mount point of an archive addressed by
    /// it, to be handled by the driver for `scheme`.
    pub fn into_mount_point(self, scheme: Scheme) -> FsResult<MountPoint> {
        MountPoint::nested(scheme, self.mount, self.entry)
    }

    /// The chain of `(mount point, entry name)` pairs from the outermost
    /// file system to this path.
    pub fn decompose(&self) -> Vec<(MountPoint, EntryName)> {
        let mut chain = vec![(self.mount.clone(), self.entry.clone())];
        let mut current = self.mount.clone();
        while let Some((parent, entry)) = current.0.parent.clone() {
            chain.push((parent.clone(), entry));
            current = parent;
        }
        chain.reverse();
        chain
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.mount.canonical();
        if self.entry.is_root() {
            return f.write_str(c);
        }
        write!(f, "{c}{}", escape(self.entry.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_validation() {
        assert!(Scheme::new("file").is_ok());
        assert!(Scheme::new("tar.gz").is_ok());
        assert!(Scheme::new("").is_err());
        assert!(Scheme::new("Zip").is_err());
        assert!(Scheme::new("9p").is_err());
    }

    #[test]
    fn test_entry_name_canonicalization() {
        assert_eq!(EntryName::new("a/b/c").unwrap().as_str(), "a/b/c");
        assert_eq!(EntryName::new("a/./b//c/").unwrap().as_str(), "a/b/c");
        assert_eq!(EntryName::new("a/x/../b").unwrap().as_str(), "a/b");
        assert_eq!(EntryName::new("").unwrap(), EntryName::root());
        assert!(EntryName::new("../up").is_err());
    }

    #[test]
    fn test_opaque_mount_point_round_trip() {
        for uri in ["file:/", "file:/tmp/", "file:/tmp/work/"] {
            let mp = MountPoint::parse(uri).unwrap();
            assert_eq!(mp.canonical(), uri);
            assert!(!mp.is_federated());
        }
    }

    #[test]
    fn test_nested_mount_point_round_trip() {
        for uri in [
            "zip:file:/tmp/a.zip!/",
            "tar:zip:file:/foo!/bar!/",
            "targz:tar:zip:file:/a!/b!/c.tar.gz!/",
        ] {
            let mp = MountPoint::parse(uri).unwrap();
            assert_eq!(mp.canonical(), uri, "round trip for {uri}");
            assert!(mp.is_federated());
        }
    }

    #[test]
    fn test_parent_chain() {
        let mp = MountPoint::parse("tar:zip:file:/foo!/bar!/").unwrap();
        assert_eq!(mp.scheme().as_str(), "tar");
        assert_eq!(mp.parent_entry().unwrap().as_str(), "bar");
        let parent = mp.parent().unwrap();
        assert_eq!(parent.canonical(), "zip:file:/foo!/");
        assert_eq!(parent.parent().unwrap().canonical(), "file:/");
        assert_eq!(parent.parent_entry().unwrap().as_str(), "foo");
    }

    #[test]
    fn test_hierarchical_uri() {
        let mp = MountPoint::parse("tar:zip:file:/foo!/bar!/").unwrap();
        assert_eq!(mp.hierarchical(), "file:/foo/bar");
        let host = MountPoint::parse("file:/foo/").unwrap();
        assert_eq!(host.hierarchical(), "file:/foo/");
    }

    #[test]
    fn test_containment() {
        let root = MountPoint::parse("file:/").unwrap();
        let zip = MountPoint::parse("zip:file:/foo!/").unwrap();
        let tar = MountPoint::parse("tar:file:/foo!/").unwrap();
        let foo_dir = MountPoint::parse("file:/foo/").unwrap();
        let inner = MountPoint::parse("tar:zip:file:/foo!/bar!/").unwrap();

        assert!(root.contains(&zip));
        // Same hierarchical location, different scheme chain.
        assert!(tar.contains(&zip));
        // The archive *is* foo, not beneath the directory foo/.
        assert!(!foo_dir.contains(&zip));
        assert!(zip.contains(&inner));
        assert!(!zip.contains(&MountPoint::parse("zip:file:/foobar!/").unwrap()));
    }

    #[test]
    fn test_path_parse_and_decompose() {
        let path = FsPath::parse("tar:zip:file:/tmp/a.zip!/b.tar!/dir/c.txt").unwrap();
        assert_eq!(path.entry().as_str(), "dir/c.txt");
        let chain = path.decompose();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].0.canonical(), "file:/tmp/");
        assert_eq!(chain[0].1.as_str(), "a.zip");
        assert_eq!(chain[1].0.canonical(), "zip:file:/tmp/a.zip!/");
        assert_eq!(chain[1].1.as_str(), "b.tar");
        assert_eq!(chain[2].1.as_str(), "dir/c.txt");
    }

    #[test]
    fn test_percent_escapes() {
        let path = FsPath::parse("zip:file:/tmp/my%20archive.zip!/with%21bang").unwrap();
        assert_eq!(path.mount().parent_entry().unwrap().as_str(), "my archive.zip");
        assert_eq!(path.entry().as_str(), "with!bang");
        assert_eq!(
            path.mount().canonical(),
            "zip:file:/tmp/my%20archive.zip!/"
        );
    }

    #[test]
    fn test_invalid_uris() {
        assert!(MountPoint::parse("no-scheme").is_err());
        assert!(MountPoint::parse("zip:file:/a!/").map(|m| m.canonical().to_string()).is_ok());
        assert!(MountPoint::parse("zip:!/").is_err());
        assert!(FsPath::parse("file:relative/path").is_err());
        assert!(MountPoint::parse("file:/a/%zz/").is_err());
    }

    #[test]
    fn test_mount_point_ordering_is_by_canonical_form() {
        let a = MountPoint::parse("file:/a/").unwrap();
        let b = MountPoint::parse("file:/b/").unwrap();
        assert!(a < b);
        assert_eq!(a, MountPoint::parse("file:/a/").unwrap());
    }
}
