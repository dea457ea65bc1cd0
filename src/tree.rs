//! The in-memory directory tree of a mounted archive.
//!
//! Entry names arrive canonicalized (see [`EntryName`]), so tree walks
//! split on `/` without re-validating segments. Directories are
//! `BTreeMap`s, which keeps listings sorted and makes the commit order
//! deterministic. Archives routinely lack directory entries for the
//! files they contain ("tar bombs"); [`ArchiveFs::populate`] creates the
//! missing parents on the fly, and every such synthesized directory is
//! committed back on sync.

use std::collections::BTreeMap;

use crate::addr::EntryName;
use crate::entry::{now_millis, Access, AccessSet, Entry, EntryType, Size};
use crate::error::{FsError, FsResult};
use crate::option::AccessOptions;

#[derive(Debug, Clone)]
struct Node {
    entry: Entry,
    children: BTreeMap<String, Node>,
}

impl Node {
    fn new(entry: Entry) -> Self {
        Node {
            entry,
            children: BTreeMap::new(),
        }
    }

    fn is_directory(&self) -> bool {
        self.entry.is_directory()
    }
}

/// The mounted file system of one archive.
#[derive(Debug, Clone)]
pub struct ArchiveFs {
    root: Node,
}

impl ArchiveFs {
    /// An empty file system whose root directory is stamped now.
    pub fn new() -> Self {
        ArchiveFs {
            root: Node::new(Entry::directory("")),
        }
    }

    /// Builds a file system from the entries enumerated by an input
    /// service. Missing parent directories are synthesized; a later
    /// directory entry refines an earlier synthesized one.
    pub fn populate(entries: Vec<Entry>) -> FsResult<Self> {
        let mut fs = ArchiveFs::new();
        for entry in entries {
            let name = EntryName::new(entry.name())?;
            if name.is_root() {
                // Some archives carry an explicit root entry; adopt its
                // metadata.
                let children = std::mem::take(&mut fs.root.children);
                let mut root_entry = entry.clone();
                root_entry.set_name("");
                fs.root = Node {
                    entry: root_entry,
                    children,
                };
                continue;
            }
            let node = fs.ensure(&name)?;
            let mut entry = entry;
            entry.set_name(name.as_str());
            // Keep children created before their directory entry showed up.
            if node.is_directory() && entry.is_directory() {
                node.entry = entry;
            } else if node.children.is_empty() {
                node.entry = entry;
            }
        }
        Ok(fs)
    }

    fn node(&self, name: &EntryName) -> Option<&Node> {
        let mut current = &self.root;
        for seg in name.segments() {
            current = current.children.get(seg)?;
        }
        Some(current)
    }

    fn node_mut(&mut self, name: &EntryName) -> Option<&mut Node> {
        let mut current = &mut self.root;
        for seg in name.segments() {
            current = current.children.get_mut(seg)?;
        }
        Some(current)
    }

    /// Walks to `name`, creating missing directories along the way.
    fn ensure(&mut self, name: &EntryName) -> FsResult<&mut Node> {
        let mut current = &mut self.root;
        let mut walked = String::new();
        for seg in name.segments() {
            if !walked.is_empty() {
                walked.push('/');
            }
            walked.push_str(seg);
            let next = current
                .children
                .entry(seg.to_string())
                .or_insert_with(|| Node::new(Entry::directory(walked.clone())));
            if !next.is_directory() && walked != name.as_str() {
                return Err(FsError::NotDirectory(walked));
            }
            current = next;
        }
        Ok(current)
    }

    /// Returns the entry metadata, with child names attached for
    /// directories.
    pub fn stat(&self, name: &EntryName) -> Option<Entry> {
        let node = self.node(name)?;
        let mut entry = node.entry.clone();
        if entry.is_directory() {
            entry.set_children(node.children.keys().cloned().collect());
        }
        Some(entry)
    }

    /// Creates a file or directory entry.
    pub fn mknod(
        &mut self,
        name: &EntryName,
        ty: EntryType,
        options: AccessOptions,
        template: Option<&Entry>,
    ) -> FsResult<()> {
        if name.is_root() {
            return Err(FsError::AlreadyExists(String::new()));
        }
        if !matches!(ty, EntryType::File | EntryType::Directory) {
            return Err(FsError::Unsupported("mknod creates only files and directories"));
        }
        let (parent_name, base) = name.split_last().expect("non-root name");

        let parent = if options.contains(AccessOptions::CREATE_PARENTS) {
            let node = self.ensure(&parent_name)?;
            if !node.is_directory() {
                return Err(FsError::NotDirectory(parent_name.as_str().to_string()));
            }
            node
        } else {
            let node = self
                .node_mut(&parent_name)
                .ok_or_else(|| FsError::NoSuchEntry(parent_name.as_str().to_string()))?;
            if !node.is_directory() {
                return Err(FsError::NotDirectory(parent_name.as_str().to_string()));
            }
            node
        };

        if let Some(existing) = parent.children.get_mut(base) {
            if options.contains(AccessOptions::EXCLUSIVE) {
                return Err(FsError::AlreadyExists(name.as_str().to_string()));
            }
            if existing.entry.ty() != ty {
                return Err(FsError::AlreadyExists(name.as_str().to_string()));
            }
            existing.entry.set_time(Access::Write, now_millis());
            return Ok(());
        }

        let mut entry = Entry::new(name.as_str(), ty);
        if let Some(template) = template {
            entry = entry.with_template(template);
        } else {
            entry.set_time(Access::Write, now_millis());
            entry.set_time(Access::Create, now_millis());
        }
        parent.children.insert(base.to_string(), Node::new(entry));
        Ok(())
    }

    /// Removes an entry. Directories must be empty.
    pub fn unlink(&mut self, name: &EntryName) -> FsResult<Entry> {
        if name.is_root() {
            return Err(FsError::Unsupported("cannot unlink the root entry"));
        }
        let (parent_name, base) = name.split_last().expect("non-root name");
        let parent = self
            .node_mut(&parent_name)
            .ok_or_else(|| FsError::NoSuchEntry(name.as_str().to_string()))?;
        let node = parent
            .children
            .get(base)
            .ok_or_else(|| FsError::NoSuchEntry(name.as_str().to_string()))?;
        if node.is_directory() && !node.children.is_empty() {
            return Err(FsError::DirectoryNotEmpty(name.as_str().to_string()));
        }
        let node = parent.children.remove(base).expect("checked above");
        Ok(node.entry)
    }

    /// Updates the timestamps of the given kinds.
    pub fn set_time(&mut self, name: &EntryName, kinds: AccessSet, millis: i64) -> FsResult<bool> {
        let node = self
            .node_mut(name)
            .ok_or_else(|| FsError::NoSuchEntry(name.as_str().to_string()))?;
        let mut changed = false;
        for (flag, access) in [
            (AccessSet::READ, Access::Read),
            (AccessSet::WRITE, Access::Write),
            (AccessSet::CREATE, Access::Create),
        ] {
            if kinds.contains(flag) {
                node.entry.set_time(access, millis);
                changed = true;
            }
        }
        Ok(changed)
    }

    pub fn set_read_only(&mut self, name: &EntryName) -> FsResult<()> {
        let node = self
            .node_mut(name)
            .ok_or_else(|| FsError::NoSuchEntry(name.as_str().to_string()))?;
        node.entry.set_read_only(true);
        Ok(())
    }

    /// Records the outcome of a completed entry write.
    pub fn commit_write(&mut self, name: &EntryName, size: u64) -> FsResult<()> {
        let node = self
            .node_mut(name)
            .ok_or_else(|| FsError::NoSuchEntry(name.as_str().to_string()))?;
        node.entry.set_size(Size::Data, size);
        node.entry.set_time(Access::Write, now_millis());
        Ok(())
    }

    /// All entries except the root in lexicographic byte order of their
    /// names. This is the commit order, chosen so that archive bytes are
    /// reproducible.
    pub fn entries(&self) -> Vec<Entry> {
        let mut out = Vec::new();
        let mut stack: Vec<&Node> = self.root.children.values().collect();
        while let Some(node) = stack.pop() {
            out.push(node.entry.clone());
            stack.extend(node.children.values());
        }
        out.sort_by(|a, b| a.name().as_bytes().cmp(b.name().as_bytes()));
        out
    }

    /// Number of entries excluding the root.
    pub fn len(&self) -> usize {
        fn count(node: &Node) -> usize {
            node.children.len() + node.children.values().map(count).sum::<usize>()
        }
        count(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }
}

impl Default for ArchiveFs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> EntryName {
        EntryName::new(s).unwrap()
    }

    #[test]
    fn test_root_always_exists() {
        let fs = ArchiveFs::new();
        let root = fs.stat(&EntryName::root()).unwrap();
        assert!(root.is_directory());
        assert!(root.children().unwrap().is_empty());
    }

    #[test]
    fn test_mknod_requires_parent() {
        let mut fs = ArchiveFs::new();
        let err = fs
            .mknod(&name("a/b"), EntryType::File, AccessOptions::empty(), None)
            .unwrap_err();
        assert!(matches!(err, FsError::NoSuchEntry(_)));
    }

    #[test]
    fn test_mknod_create_parents() {
        let mut fs = ArchiveFs::new();
        fs.mknod(
            &name("a/b/c"),
            EntryType::File,
            AccessOptions::CREATE_PARENTS,
            None,
        )
        .unwrap();
        assert!(fs.stat(&name("a")).unwrap().is_directory());
        assert!(fs.stat(&name("a/b")).unwrap().is_directory());
        assert!(fs.stat(&name("a/b/c")).unwrap().is_file());
    }

    #[test]
    fn test_mknod_exclusive() {
        let mut fs = ArchiveFs::new();
        fs.mknod(&name("x"), EntryType::File, AccessOptions::empty(), None)
            .unwrap();
        let err = fs
            .mknod(&name("x"), EntryType::File, AccessOptions::EXCLUSIVE, None)
            .unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists(_)));
        // Without EXCLUSIVE, re-creating the same type is allowed.
        fs.mknod(&name("x"), EntryType::File, AccessOptions::empty(), None)
            .unwrap();
    }

    #[test]
    fn test_mknod_through_file_fails() {
        let mut fs = ArchiveFs::new();
        fs.mknod(&name("f"), EntryType::File, AccessOptions::empty(), None)
            .unwrap();
        let err = fs
            .mknod(
                &name("f/child"),
                EntryType::File,
                AccessOptions::CREATE_PARENTS,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, FsError::NotDirectory(_)));
    }

    #[test]
    fn test_unlink() {
        let mut fs = ArchiveFs::new();
        fs.mknod(
            &name("d/f"),
            EntryType::File,
            AccessOptions::CREATE_PARENTS,
            None,
        )
        .unwrap();
        assert!(matches!(
            fs.unlink(&name("d")).unwrap_err(),
            FsError::DirectoryNotEmpty(_)
        ));
        fs.unlink(&name("d/f")).unwrap();
        fs.unlink(&name("d")).unwrap();
        assert!(fs.stat(&name("d")).is_none());
        assert!(matches!(
            fs.unlink(&name("d")).unwrap_err(),
            FsError::NoSuchEntry(_)
        ));
    }

    #[test]
    fn test_populate_synthesizes_parents() {
        let entries = vec![Entry::file("deep/nested/file.txt")];
        let fs = ArchiveFs::populate(entries).unwrap();
        assert!(fs.stat(&name("deep")).unwrap().is_directory());
        assert!(fs.stat(&name("deep/nested")).unwrap().is_directory());
        assert!(fs.stat(&name("deep/nested/file.txt")).unwrap().is_file());
    }

    #[test]
    fn test_populate_directory_entry_after_children() {
        let mut dir = Entry::new("d/", EntryType::Directory);
        dir.set_time(Access::Write, 12345);
        let entries = vec![Entry::file("d/x"), dir];
        let fs = ArchiveFs::populate(entries).unwrap();
        let d = fs.stat(&name("d")).unwrap();
        assert!(d.is_directory());
        assert_eq!(d.time(Access::Write), Some(12345));
        assert!(fs.stat(&name("d/x")).unwrap().is_file());
    }

    #[test]
    fn test_entries_in_lexicographic_order() {
        let mut fs = ArchiveFs::new();
        for n in ["b.txt", "a/x", "a.txt", "a/b/c"] {
            fs.mknod(
                &name(n),
                EntryType::File,
                AccessOptions::CREATE_PARENTS,
                None,
            )
            .unwrap();
        }
        let names: Vec<_> = fs.entries().iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, vec!["a", "a.txt", "a/b", "a/b/c", "a/x", "b.txt"]);
    }

    #[test]
    fn test_stat_lists_children() {
        let mut fs = ArchiveFs::new();
        fs.mknod(
            &name("d/a"),
            EntryType::File,
            AccessOptions::CREATE_PARENTS,
            None,
        )
        .unwrap();
        fs.mknod(&name("d/b"), EntryType::File, AccessOptions::empty(), None)
            .unwrap();
        let d = fs.stat(&name("d")).unwrap();
        let children: Vec<_> = d.children().unwrap().iter().cloned().collect();
        assert_eq!(children, vec!["a", "b"]);
    }
}
