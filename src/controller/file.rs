//! The host (platform) file system controller.
//!
//! Entry names resolve against the mount point's directory; since entry
//! names are canonicalized at the address layer, no `..` can escape it.
//! The host file system persists every operation immediately, so its
//! sync is a no-op.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::addr::EntryName;
use crate::cio::{
    InputEndpoint, InputSocket, InputStream, OutputEndpoint, OutputSocket, OutputStream,
};
use crate::entry::{Access, AccessSet, Entry, EntryType, Size};
use crate::error::{FsError, FsResult};
use crate::model::FsModel;
use crate::option::{AccessOptions, SyncOptions};
use crate::sync::SyncExceptionBuilder;

use super::{FsController, SharedController};

impl InputStream for fs::File {}

impl OutputStream for fs::File {
    fn close(&mut self) -> FsResult<()> {
        use std::io::Write;
        self.flush()?;
        self.sync_data()?;
        Ok(())
    }
}

fn map_io(name: &EntryName, e: std::io::Error) -> FsError {
    match e.kind() {
        std::io::ErrorKind::NotFound => FsError::NoSuchEntry(name.as_str().to_string()),
        std::io::ErrorKind::AlreadyExists => FsError::AlreadyExists(name.as_str().to_string()),
        std::io::ErrorKind::PermissionDenied => FsError::AccessDenied(name.as_str().to_string()),
        _ => FsError::Io(e),
    }
}

fn time_millis(time: std::io::Result<SystemTime>) -> Option<i64> {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
}

fn entry_from_metadata(name: &str, path: &Path, meta: &fs::Metadata) -> Entry {
    let ty = if meta.is_dir() {
        EntryType::Directory
    } else if meta.is_file() {
        EntryType::File
    } else if meta.file_type().is_symlink() {
        EntryType::Symlink
    } else {
        EntryType::Special
    };
    let mut entry = Entry::new(name, ty);
    if ty == EntryType::File {
        entry.set_size(Size::Data, meta.len());
        entry.set_size(Size::Storage, meta.len());
    }
    if let Some(millis) = time_millis(meta.modified()) {
        entry.set_time(Access::Write, millis);
    }
    if let Some(millis) = time_millis(meta.created()) {
        entry.set_time(Access::Create, millis);
    }
    if let Some(millis) = time_millis(meta.accessed()) {
        entry.set_time(Access::Read, millis);
    }
    entry.set_read_only(meta.permissions().readonly());
    if ty == EntryType::Directory {
        if let Ok(dir) = fs::read_dir(path) {
            entry.set_children(
                dir.flatten()
                    .map(|d| d.file_name().to_string_lossy().into_owned())
                    .collect(),
            );
        }
    }
    entry
}

struct FileState {
    model: Arc<FsModel>,
    root: PathBuf,
}

impl FileState {
    fn path(&self, name: &EntryName) -> PathBuf {
        if name.is_root() {
            self.root.clone()
        } else {
            self.root.join(name.as_str())
        }
    }

    fn stat(&self, name: &EntryName) -> FsResult<Option<Entry>> {
        match fs::metadata(self.path(name)) {
            Ok(meta) => Ok(Some(entry_from_metadata(
                name.as_str(),
                &self.path(name),
                &meta,
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_io(name, e)),
        }
    }
}

/// Controller for a directory tree of the platform file system.
pub struct FileController {
    state: Arc<FileState>,
}

impl FileController {
    pub fn new(model: Arc<FsModel>, root: PathBuf) -> Self {
        FileController {
            state: Arc::new(FileState { model, root }),
        }
    }
}

impl FsController for FileController {
    fn model(&self) -> &Arc<FsModel> {
        &self.state.model
    }

    fn parent(&self) -> Option<&SharedController> {
        None
    }

    fn stat(&self, _options: AccessOptions, name: &EntryName) -> FsResult<Option<Entry>> {
        self.state.stat(name)
    }

    fn check_access(
        &self,
        _options: AccessOptions,
        name: &EntryName,
        kinds: AccessSet,
    ) -> FsResult<()> {
        let entry = self
            .state
            .stat(name)?
            .ok_or_else(|| FsError::NoSuchEntry(name.as_str().to_string()))?;
        if kinds.contains(AccessSet::WRITE) && entry.is_read_only() {
            return Err(FsError::ReadOnly(name.as_str().to_string()));
        }
        if kinds.contains(AccessSet::EXECUTE) {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let meta = fs::metadata(self.state.path(name)).map_err(|e| map_io(name, e))?;
                if meta.permissions().mode() & 0o111 == 0 {
                    return Err(FsError::AccessDenied(name.as_str().to_string()));
                }
            }
        }
        Ok(())
    }

    fn set_read_only(&self, name: &EntryName) -> FsResult<()> {
        let path = self.state.path(name);
        let meta = fs::metadata(&path).map_err(|e| map_io(name, e))?;
        let mut perms = meta.permissions();
        perms.set_readonly(true);
        fs::set_permissions(&path, perms).map_err(|e| map_io(name, e))
    }

    fn set_time(
        &self,
        _options: AccessOptions,
        name: &EntryName,
        kinds: AccessSet,
        millis: i64,
    ) -> FsResult<bool> {
        if !kinds.contains(AccessSet::WRITE) {
            // Only the modification time is portable.
            return Ok(false);
        }
        let path = self.state.path(name);
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| map_io(name, e))?;
        let time = UNIX_EPOCH + Duration::from_millis(millis.max(0) as u64);
        file.set_modified(time).map_err(|e| map_io(name, e))?;
        Ok(kinds == AccessSet::WRITE)
    }

    fn input(&self, _options: AccessOptions, name: &EntryName) -> FsResult<InputSocket> {
        Ok(InputSocket::new(FileInput {
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
        Ok(OutputSocket::new(FileOutput {
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
        _template: Option<Entry>,
    ) -> FsResult<()> {
        let path = self.state.path(name);
        match ty {
            EntryType::Directory => {
                let result = if options.contains(AccessOptions::CREATE_PARENTS) {
                    fs::create_dir_all(&path)
                } else {
                    fs::create_dir(&path)
                };
                match result {
                    Ok(()) => Ok(()),
                    Err(e)
                        if e.kind() == std::io::ErrorKind::AlreadyExists
                            && !options.contains(AccessOptions::EXCLUSIVE)
                            && path.is_dir() =>
                    {
                        Ok(())
                    }
                    Err(e) => Err(map_io(name, e)),
                }
            }
            EntryType::File => {
                if options.contains(AccessOptions::CREATE_PARENTS) {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent).map_err(|e| map_io(name, e))?;
                    }
                }
                let mut open = OpenOptions::new();
                open.write(true);
                if options.contains(AccessOptions::EXCLUSIVE) {
                    open.create_new(true);
                } else {
                    open.create(true);
                }
                open.open(&path).map(|_| ()).map_err(|e| map_io(name, e))
            }
            _ => Err(FsError::Unsupported("mknod creates only files and directories")),
        }
    }

    fn unlink(&self, _options: AccessOptions, name: &EntryName) -> FsResult<()> {
        let path = self.state.path(name);
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) => return Err(map_io(name, e)),
        };
        if meta.is_dir() {
            let mut children = fs::read_dir(&path).map_err(|e| map_io(name, e))?;
            if children.next().is_some() {
                return Err(FsError::DirectoryNotEmpty(name.as_str().to_string()));
            }
            fs::remove_dir(&path).map_err(|e| map_io(name, e))
        } else {
            fs::remove_file(&path).map_err(|e| map_io(name, e))
        }
    }

    fn sync(&self, _options: SyncOptions, _builder: &mut SyncExceptionBuilder) -> FsResult<()> {
        // Host file systems persist immediately; nothing to commit.
        Ok(())
    }
}

struct FileInput {
    state: Arc<FileState>,
    name: EntryName,
}

impl InputEndpoint for FileInput {
    fn local_target(&mut self) -> FsResult<Entry> {
        self.state
            .stat(&self.name)?
            .ok_or_else(|| FsError::NoSuchEntry(self.name.as_str().to_string()))
    }

    fn open_stream(&mut self, _peer: Option<&Entry>) -> FsResult<Box<dyn InputStream>> {
        let path = self.state.path(&self.name);
        if path.is_dir() {
            return Err(FsError::IsDirectory(self.name.as_str().to_string()));
        }
        let file = fs::File::open(&path).map_err(|e| map_io(&self.name, e))?;
        Ok(Box::new(file))
    }
}

struct FileOutput {
    state: Arc<FileState>,
    name: EntryName,
    options: AccessOptions,
    template: Option<Entry>,
}

impl OutputEndpoint for FileOutput {
    fn local_target(&mut self) -> FsResult<Entry> {
        match self.state.stat(&self.name)? {
            Some(entry) => Ok(entry),
            None => {
                let mut entry = Entry::file(self.name.as_str());
                if let Some(template) = &self.template {
                    entry = entry.with_template(template);
                }
                Ok(entry)
            }
        }
    }

    fn open_stream(&mut self, _peer: Option<&Entry>) -> FsResult<Box<dyn OutputStream>> {
        let path = self.state.path(&self.name);
        if path.is_dir() {
            return Err(FsError::IsDirectory(self.name.as_str().to_string()));
        }
        if self.options.contains(AccessOptions::CREATE_PARENTS) {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| map_io(&self.name, e))?;
            }
        }
        let mut open = OpenOptions::new();
        open.write(true);
        if self.options.contains(AccessOptions::EXCLUSIVE) {
            open.create_new(true);
        } else if self.options.contains(AccessOptions::APPEND) {
            open.create(true).append(true);
        } else {
            open.create(true).truncate(true);
        }
        let file = open.open(&path).map_err(|e| map_io(&self.name, e))?;
        Ok(Box::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::MountPoint;
    use std::io::{Read, Write};

    fn controller(root: &Path) -> FileController {
        let model = FsModel::new(MountPoint::parse("file:/").unwrap(), None);
        FileController::new(model, root.to_path_buf())
    }

    fn name(s: &str) -> EntryName {
        EntryName::new(s).unwrap()
    }

    #[test]
    fn test_write_then_stat_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());

        let out = c
            .output(AccessOptions::empty(), &name("x.txt"), None)
            .unwrap();
        let mut stream = out.open_stream().unwrap();
        stream.write_all(b"payload").unwrap();
        stream.close().unwrap();

        let entry = c.stat(AccessOptions::empty(), &name("x.txt")).unwrap().unwrap();
        assert!(entry.is_file());
        assert_eq!(entry.size(Size::Data), Some(7));

        let input = c.input(AccessOptions::empty(), &name("x.txt")).unwrap();
        let mut data = Vec::new();
        input.open_stream().unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"payload");
    }

    #[test]
    fn test_stat_absent_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());
        assert!(c.stat(AccessOptions::empty(), &name("missing")).unwrap().is_none());
    }

    #[test]
    fn test_mknod_and_unlink_directory() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());

        c.mknod(
            AccessOptions::CREATE_PARENTS,
            &name("a/b"),
            EntryType::Directory,
            None,
        )
        .unwrap();
        assert!(c.stat(AccessOptions::empty(), &name("a/b")).unwrap().unwrap().is_directory());

        let err = c.unlink(AccessOptions::empty(), &name("a")).unwrap_err();
        assert!(matches!(err, FsError::DirectoryNotEmpty(_)));
        c.unlink(AccessOptions::empty(), &name("a/b")).unwrap();
        c.unlink(AccessOptions::empty(), &name("a")).unwrap();
    }

    #[test]
    fn test_exclusive_output_fails_on_existing() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());
        std::fs::write(dir.path().join("x"), b"old").unwrap();

        let out = c
            .output(AccessOptions::EXCLUSIVE, &name("x"), None)
            .unwrap();
        match out.open_stream() {
            Err(err) => assert!(matches!(err, FsError::AlreadyExists(_))),
            Ok(_) => panic!("expected AlreadyExists error"),
        }
    }

    #[test]
    fn test_append_output() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());
        std::fs::write(dir.path().join("log"), b"one,").unwrap();

        let out = c.output(AccessOptions::APPEND, &name("log"), None).unwrap();
        let mut stream = out.open_stream().unwrap();
        stream.write_all(b"two").unwrap();
        stream.close().unwrap();
        assert_eq!(std::fs::read(dir.path().join("log")).unwrap(), b"one,two");
    }

    #[test]
    fn test_directory_listing() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());
        std::fs::write(dir.path().join("b"), b"").unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();

        let root = c.stat(AccessOptions::empty(), &EntryName::root()).unwrap().unwrap();
        let children: Vec<_> = root.children().unwrap().iter().cloned().collect();
        assert_eq!(children, vec!["a", "b"]);
    }
}
