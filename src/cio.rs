//! Common I/O: lazy input/output sockets with peer binding, stream
//! traits with explicit close, and the copy pipeline.
//!
//! A socket is a cheap factory for one I/O resource. No bytes move until
//! [`InputSocket::open_stream`] / [`OutputSocket::open_stream`] is called,
//! and a socket may be opened any number of times. Sockets can be paired:
//! [`OutputSocket::connect`] wires an output socket and an input socket to
//! each other so that either side can query the other's target metadata
//! before any byte moves — this is how an archive output sizes itself from
//! a copy source. [`InputSocket::bind`] inherits another socket's peer
//! without touching that socket.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use crate::entry::Entry;
use crate::error::{FsError, FsResult};

/// A readable entry stream. `close` is the mandated termination; drop is
/// only a safety net.
pub trait InputStream: Read + Send {
    fn close(&mut self) -> FsResult<()> {
        Ok(())
    }
}

/// A writable entry stream. Closing commits the entry; dropping without
/// closing may lose the write.
pub trait OutputStream: Write + Send {
    fn close(&mut self) -> FsResult<()> {
        self.flush().map_err(FsError::from)
    }
}

/// The lazy producer behind an [`InputSocket`].
pub trait InputEndpoint: Send {
    /// Resolves the entry metadata. May mount an archive.
    fn local_target(&mut self) -> FsResult<Entry>;

    /// Opens a new stream. `peer` is the connected output socket's target,
    /// if any, passed down as a hint.
    fn open_stream(&mut self, peer: Option<&Entry>) -> FsResult<Box<dyn InputStream>>;
}

/// The lazy consumer behind an [`OutputSocket`].
pub trait OutputEndpoint: Send {
    /// Resolves the (planned) entry metadata. May mount an archive.
    fn local_target(&mut self) -> FsResult<Entry>;

    /// Opens a new stream. `peer` is the connected input socket's target,
    /// if any; drivers use it to preset sizes and times.
    fn open_stream(&mut self, peer: Option<&Entry>) -> FsResult<Box<dyn OutputStream>>;
}

pub type SharedInputEndpoint = Arc<Mutex<dyn InputEndpoint>>;
pub type SharedOutputEndpoint = Arc<Mutex<dyn OutputEndpoint>>;

/// A lazy factory for one readable resource.
pub struct InputSocket {
    endpoint: SharedInputEndpoint,
    peer: Option<SharedOutputEndpoint>,
}

impl InputSocket {
    pub fn new(endpoint: impl InputEndpoint + 'static) -> Self {
        InputSocket {
            endpoint: Arc::new(Mutex::new(endpoint)),
            peer: None,
        }
    }

    /// The entry this socket reads. May mount an archive.
    pub fn local_target(&self) -> FsResult<Entry> {
        self.endpoint
            .lock()
            .expect("socket endpoint poisoned")
            .local_target()
    }

    /// The connected peer's target, or `None` when unconnected.
    pub fn peer_target(&self) -> FsResult<Option<Entry>> {
        match &self.peer {
            Some(peer) => peer
                .lock()
                .expect("socket endpoint poisoned")
                .local_target()
                .map(Some),
            None => Ok(None),
        }
    }

    /// Opens a new stream, passing the connected peer's target down as a
    /// hint.
    pub fn open_stream(&self) -> FsResult<Box<dyn InputStream>> {
        let peer = self.peer_target()?;
        self.endpoint
            .lock()
            .expect("socket endpoint poisoned")
            .open_stream(peer.as_ref())
    }

    /// Like [`InputSocket::open_stream`], but with an externally supplied
    /// peer hint used when this socket has none of its own. Decorating
    /// endpoints use this to thread the hint inward.
    pub fn open_stream_with(&self, peer: Option<&Entry>) -> FsResult<Box<dyn InputStream>> {
        match self.peer_target()? {
            Some(own) => self
                .endpoint
                .lock()
                .expect("socket endpoint poisoned")
                .open_stream(Some(&own)),
            None => self
                .endpoint
                .lock()
                .expect("socket endpoint poisoned")
                .open_stream(peer),
        }
    }

    /// Inherits `other`'s peer without mutating `other`.
    pub fn bind(&mut self, other: &InputSocket) {
        self.peer = other.peer.clone();
    }

    /// Pairs this socket with an output socket in both directions,
    /// replacing any previous pairing of either socket.
    pub fn connect(&mut self, other: &mut OutputSocket) {
        self.peer = Some(other.endpoint.clone());
        other.peer = Some(self.endpoint.clone());
    }
}

/// A lazy factory for one writable resource.
pub struct OutputSocket {
    endpoint: SharedOutputEndpoint,
    peer: Option<SharedInputEndpoint>,
}

impl OutputSocket {
    pub fn new(endpoint: impl OutputEndpoint + 'static) -> Self {
        OutputSocket {
            endpoint: Arc::new(Mutex::new(endpoint)),
            peer: None,
        }
    }

    /// The (planned) entry this socket writes. May mount an archive.
    pub fn local_target(&self) -> FsResult<Entry> {
        self.endpoint
            .lock()
            .expect("socket endpoint poisoned")
            .local_target()
    }

    /// The connected peer's target, or `None` when unconnected.
    pub fn peer_target(&self) -> FsResult<Option<Entry>> {
        match &self.peer {
            Some(peer) => peer
                .lock()
                .expect("socket endpoint poisoned")
                .local_target()
                .map(Some),
            None => Ok(None),
        }
    }

    /// Opens a new stream, passing the connected peer's target down as a
    /// sizing hint.
    pub fn open_stream(&self) -> FsResult<Box<dyn OutputStream>> {
        let peer = self.peer_target()?;
        self.endpoint
            .lock()
            .expect("socket endpoint poisoned")
            .open_stream(peer.as_ref())
    }

    /// See [`InputSocket::open_stream_with`].
    pub fn open_stream_with(&self, peer: Option<&Entry>) -> FsResult<Box<dyn OutputStream>> {
        match self.peer_target()? {
            Some(own) => self
                .endpoint
                .lock()
                .expect("socket endpoint poisoned")
                .open_stream(Some(&own)),
            None => self
                .endpoint
                .lock()
                .expect("socket endpoint poisoned")
                .open_stream(peer),
        }
    }

    /// Inherits `other`'s peer without mutating `other`.
    pub fn bind(&mut self, other: &OutputSocket) {
        self.peer = other.peer.clone();
    }

    /// Pairs this socket with an input socket in both directions.
    pub fn connect(&mut self, other: &mut InputSocket) {
        other.connect(self);
    }
}

/// Copies all bytes from `input` to `output`.
///
/// The sockets are connected first so the output side can size itself
/// from the input's metadata. Both streams are closed before returning;
/// the output stream is closed first because closing commits the entry.
pub fn copy(input: &mut InputSocket, output: &mut OutputSocket) -> FsResult<u64> {
    output.connect(input);
    let mut reader = input.open_stream()?;
    let mut writer = match output.open_stream() {
        Ok(w) => w,
        Err(e) => {
            let _ = reader.close();
            return Err(e);
        }
    };
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let _ = reader.close();
                let _ = writer.close();
                return Err(e.into());
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]) {
            let _ = reader.close();
            let _ = writer.close();
            return Err(e.into());
        }
        total += n as u64;
    }
    writer.close()?;
    reader.close()?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{EntryType, Size};
    use std::io::Cursor;

    struct VecInput {
        entry: Entry,
        data: Vec<u8>,
    }

    impl VecInput {
        fn new(name: &str, data: &[u8]) -> Self {
            let mut entry = Entry::new(name, EntryType::File);
            entry.set_size(Size::Data, data.len() as u64);
            VecInput {
                entry,
                data: data.to_vec(),
            }
        }
    }

    impl InputStream for Cursor<Vec<u8>> {}

    impl InputEndpoint for VecInput {
        fn local_target(&mut self) -> FsResult<Entry> {
            Ok(self.entry.clone())
        }

        fn open_stream(&mut self, _peer: Option<&Entry>) -> FsResult<Box<dyn InputStream>> {
            Ok(Box::new(Cursor::new(self.data.clone())))
        }
    }

    struct VecOutput {
        entry: Entry,
        sink: Arc<Mutex<Vec<u8>>>,
        seen_peer_size: Arc<Mutex<Option<u64>>>,
    }

    struct VecOutputStream {
        sink: Arc<Mutex<Vec<u8>>>,
        pending: Vec<u8>,
    }

    impl Write for VecOutputStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.pending.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl OutputStream for VecOutputStream {
        fn close(&mut self) -> FsResult<()> {
            self.sink
                .lock()
                .unwrap()
                .extend_from_slice(&self.pending);
            Ok(())
        }
    }

    impl OutputEndpoint for VecOutput {
        fn local_target(&mut self) -> FsResult<Entry> {
            Ok(self.entry.clone())
        }

        fn open_stream(&mut self, peer: Option<&Entry>) -> FsResult<Box<dyn OutputStream>> {
            *self.seen_peer_size.lock().unwrap() = peer.and_then(|e| e.size(Size::Data));
            Ok(Box::new(VecOutputStream {
                sink: self.sink.clone(),
                pending: Vec::new(),
            }))
        }
    }

    #[test]
    fn test_copy_moves_bytes_and_passes_size_hint() {
        let mut input = InputSocket::new(VecInput::new("src", b"hello world"));
        let sink = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::new(Mutex::new(None));
        let mut output = OutputSocket::new(VecOutput {
            entry: Entry::new("dst", EntryType::File),
            sink: sink.clone(),
            seen_peer_size: seen.clone(),
        });

        let n = copy(&mut input, &mut output).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&*sink.lock().unwrap(), b"hello world");
        // The output endpoint saw the input's size before any byte moved.
        assert_eq!(*seen.lock().unwrap(), Some(11));
    }

    #[test]
    fn test_peer_target_is_none_when_unconnected() {
        let input = InputSocket::new(VecInput::new("src", b"x"));
        assert!(input.peer_target().unwrap().is_none());
    }

    #[test]
    fn test_connect_is_symmetric() {
        let mut input = InputSocket::new(VecInput::new("src", b"abc"));
        let mut output = OutputSocket::new(VecOutput {
            entry: Entry::new("dst", EntryType::File),
            sink: Arc::new(Mutex::new(Vec::new())),
            seen_peer_size: Arc::new(Mutex::new(None)),
        });
        output.connect(&mut input);
        assert_eq!(input.peer_target().unwrap().unwrap().name(), "dst");
        assert_eq!(output.peer_target().unwrap().unwrap().name(), "src");
    }

    #[test]
    fn test_bind_inherits_peer_without_connecting() {
        let mut a = InputSocket::new(VecInput::new("a", b""));
        let mut output = OutputSocket::new(VecOutput {
            entry: Entry::new("dst", EntryType::File),
            sink: Arc::new(Mutex::new(Vec::new())),
            seen_peer_size: Arc::new(Mutex::new(None)),
        });
        a.connect(&mut output);
        let mut b = InputSocket::new(VecInput::new("b", b""));
        b.bind(&a);
        assert_eq!(b.peer_target().unwrap().unwrap().name(), "dst");
        // `a` keeps its own pairing.
        assert_eq!(a.peer_target().unwrap().unwrap().name(), "dst");
    }

    #[test]
    fn test_socket_opens_repeatedly() {
        let input = InputSocket::new(VecInput::new("src", b"xy"));
        for _ in 0..3 {
            let mut s = input.open_stream().unwrap();
            let mut out = Vec::new();
            s.read_to_end(&mut out).unwrap();
            assert_eq!(out, b"xy");
            s.close().unwrap();
        }
    }
}
