//! The RAES envelope: authenticated encryption for ZIP archives (`tzp`).
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! offset  size  field
//! 0       4     magic "RAES"
//! 4       1     envelope type (0)
//! 5       1     key strength code (2 = AES-256)
//! 6       4     PBKDF2-HMAC-SHA256 iteration count
//! 10      16    salt
//! 26      16    key-verification tag:
//!               HMAC-SHA256(k_mac, "arcfs.raes.kv" || salt), truncated
//! 42      n     AES-256-CTR(k_enc, iv) of the plaintext, where
//!               iv = HMAC-SHA256(k_mac, "arcfs.raes.iv" || salt)[..16]
//! 42+n    32    HMAC-SHA256(k_mac, bytes[0..42+n])
//! ```
//!
//! Key derivation: `PBKDF2-HMAC-SHA256(passphrase, salt, iterations)`
//! yields 64 bytes; the first half keys the cipher, the second half the
//! MACs. A failed key-verification tag reports `BadKey` (wrong
//! passphrase); a failed trailing MAC reports `AuthenticationFailed`
//! (tampered or truncated payload). Sealing is deterministic for a given
//! salt, so the envelope round-trips bit-exactly.

use std::io::Read;
use std::sync::{Arc, Mutex};

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::addr::MountPoint;
use crate::cio::{InputSocket, OutputSocket, OutputStream};
use crate::driver::{ArchiveDriver, InputService, OutputService};
use crate::entry::{Entry, EntryType};
use crate::error::{FsError, FsResult};
use crate::model::FsModel;
use crate::option::AccessOptions;

use super::zip::{ZipDriver, ZipInputService};

type HmacSha256 = Hmac<Sha256>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

pub const RAES_MAGIC: &[u8; 4] = b"RAES";
const ENVELOPE_TYPE: u8 = 0;
const KEY_STRENGTH_256: u8 = 2;
const HEADER_LEN: usize = 42;
const MAC_LEN: usize = 32;
const KV_CONTEXT: &[u8] = b"arcfs.raes.kv";
const IV_CONTEXT: &[u8] = b"arcfs.raes.iv";

/// The default PBKDF2 iteration count for new envelopes.
pub const DEFAULT_ITERATIONS: u32 = 65_536;

fn derive_keys(passphrase: &[u8], salt: &[u8; 16], iterations: u32) -> ([u8; 32], [u8; 32]) {
    let mut derived = [0u8; 64];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase, salt, iterations, &mut derived);
    let mut k_enc = [0u8; 32];
    let mut k_mac = [0u8; 32];
    k_enc.copy_from_slice(&derived[..32]);
    k_mac.copy_from_slice(&derived[32..]);
    (k_enc, k_mac)
}

fn keyed_mac(k_mac: &[u8; 32], context: &[u8], salt: &[u8; 16]) -> HmacSha256 {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(k_mac).expect("HMAC accepts keys of any length");
    mac.update(context);
    mac.update(salt);
    mac
}

/// Seals `plaintext` into an envelope. Deterministic for a given salt.
pub fn seal(plaintext: &[u8], passphrase: &[u8], iterations: u32, salt: [u8; 16]) -> Vec<u8> {
    let (k_enc, k_mac) = derive_keys(passphrase, &salt, iterations);

    let mut out = Vec::with_capacity(HEADER_LEN + plaintext.len() + MAC_LEN);
    out.extend_from_slice(RAES_MAGIC);
    out.push(ENVELOPE_TYPE);
    out.push(KEY_STRENGTH_256);
    out.extend_from_slice(&iterations.to_le_bytes());
    out.extend_from_slice(&salt);
    let kv = keyed_mac(&k_mac, KV_CONTEXT, &salt).finalize().into_bytes();
    out.extend_from_slice(&kv[..16]);

    let iv_full = keyed_mac(&k_mac, IV_CONTEXT, &salt).finalize().into_bytes();
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&iv_full[..16]);

    let mut ciphertext = plaintext.to_vec();
    let mut cipher = Aes256Ctr::new(&k_enc.into(), &iv.into());
    cipher.apply_keystream(&mut ciphertext);
    out.extend_from_slice(&ciphertext);

    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(&k_mac).expect("HMAC accepts keys of any length");
    mac.update(&out);
    out.extend_from_slice(&mac.finalize().into_bytes());
    out
}

/// Opens an envelope. `label` names the archive in error messages.
pub fn unseal(data: &[u8], passphrase: &[u8], label: &str) -> FsResult<Vec<u8>> {
    if data.len() < HEADER_LEN + MAC_LEN || &data[..4] != RAES_MAGIC {
        return Err(FsError::CorruptArchive(format!(
            "{label} is not an RAES envelope"
        )));
    }
    if data[4] != ENVELOPE_TYPE || data[5] != KEY_STRENGTH_256 {
        return Err(FsError::CorruptArchive(format!(
            "{label} uses an unsupported RAES envelope type"
        )));
    }
    let iterations = u32::from_le_bytes(data[6..10].try_into().expect("slice of 4"));
    let mut salt = [0u8; 16];
    salt.copy_from_slice(&data[10..26]);
    let (k_enc, k_mac) = derive_keys(passphrase, &salt, iterations);

    keyed_mac(&k_mac, KV_CONTEXT, &salt)
        .verify_truncated_left(&data[26..42])
        .map_err(|_| FsError::BadKey(label.to_string()))?;

    let body_end = data.len() - MAC_LEN;
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(&k_mac).expect("HMAC accepts keys of any length");
    mac.update(&data[..body_end]);
    mac.verify_slice(&data[body_end..])
        .map_err(|_| FsError::AuthenticationFailed(label.to_string()))?;

    let iv_full = keyed_mac(&k_mac, IV_CONTEXT, &salt).finalize().into_bytes();
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&iv_full[..16]);
    let mut plaintext = data[HEADER_LEN..body_end].to_vec();
    let mut cipher = Aes256Ctr::new(&k_enc.into(), &iv.into());
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}

/// Supplies passphrases for encrypted archives, keyed by mount point.
pub trait KeyProvider: Send + Sync {
    /// The passphrase, or `Err(BadKey)` when none is available.
    fn key_for(&self, mount_point: &MountPoint) -> FsResult<Vec<u8>>;
}

/// Uses one passphrase for every archive; suitable for batch tools.
pub struct ConstantKeyProvider {
    key: Vec<u8>,
}

impl ConstantKeyProvider {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        ConstantKeyProvider { key: key.into() }
    }
}

impl KeyProvider for ConstantKeyProvider {
    fn key_for(&self, _mount_point: &MountPoint) -> FsResult<Vec<u8>> {
        Ok(self.key.clone())
    }
}

/// Refuses every request; the default when no key provider is
/// configured.
pub struct NoKeyProvider;

impl KeyProvider for NoKeyProvider {
    fn key_for(&self, mount_point: &MountPoint) -> FsResult<Vec<u8>> {
        Err(FsError::BadKey(mount_point.canonical().to_string()))
    }
}

/// ZIP inside an RAES envelope: the `tzp` driver.
pub struct RaesDriver {
    zip: ZipDriver,
    keys: Arc<dyn KeyProvider>,
    iterations: u32,
}

impl RaesDriver {
    pub fn new(keys: Arc<dyn KeyProvider>) -> Self {
        RaesDriver {
            zip: ZipDriver::new(),
            keys,
            iterations: DEFAULT_ITERATIONS,
        }
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations.max(1);
        self
    }
}

impl ArchiveDriver for RaesDriver {
    fn charset(&self) -> &'static str {
        self.zip.charset()
    }

    fn encodable(&self, name: &str) -> bool {
        self.zip.encodable(name)
    }

    fn new_entry(
        &self,
        name: &str,
        ty: EntryType,
        options: AccessOptions,
        template: Option<&Entry>,
    ) -> FsResult<Entry> {
        self.zip.new_entry(name, ty, options, template)
    }

    fn new_input_service(
        &self,
        model: &Arc<FsModel>,
        source: &InputSocket,
    ) -> FsResult<Box<dyn InputService>> {
        let label = model.mount_point().canonical().to_string();
        let key = self.keys.key_for(model.mount_point())?;
        let mut stream = source.open_stream()?;
        let mut sealed = Vec::new();
        stream.read_to_end(&mut sealed)?;
        stream.close()?;
        let plaintext = unseal(&sealed, &key, &label)?;
        Ok(Box::new(ZipInputService::parse(plaintext)?))
    }

    fn new_output_service(
        &self,
        model: &Arc<FsModel>,
        sink: &OutputSocket,
        input: Option<&dyn InputService>,
    ) -> FsResult<Box<dyn OutputService>> {
        let key = self.keys.key_for(model.mount_point())?;
        let staging = Arc::new(Mutex::new(Vec::new()));
        let staging_sink = OutputSocket::new(StagingOutput {
            buffer: staging.clone(),
        });
        let inner = self.zip.new_output_service(model, &staging_sink, input)?;
        Ok(Box::new(RaesOutputService {
            inner,
            staging,
            sink: Some(sink.open_stream()?),
            key,
            iterations: self.iterations,
        }))
    }
}

struct StagingOutput {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl crate::cio::OutputEndpoint for StagingOutput {
    fn local_target(&mut self) -> FsResult<Entry> {
        Ok(Entry::new("", EntryType::File))
    }

    fn open_stream(&mut self, _peer: Option<&Entry>) -> FsResult<Box<dyn OutputStream>> {
        Ok(Box::new(StagingStream {
            buffer: self.buffer.clone(),
        }))
    }
}

struct StagingStream {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl std::io::Write for StagingStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer
            .lock()
            .expect("staging buffer poisoned")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl OutputStream for StagingStream {}

/// Buffers the inner ZIP, then seals and writes it on finish.
struct RaesOutputService {
    inner: Box<dyn OutputService>,
    staging: Arc<Mutex<Vec<u8>>>,
    sink: Option<Box<dyn OutputStream>>,
    key: Vec<u8>,
    iterations: u32,
}

impl OutputService for RaesOutputService {
    fn put(
        &mut self,
        entry: &Entry,
        options: AccessOptions,
        data: Option<&mut dyn Read>,
    ) -> FsResult<()> {
        self.inner.put(entry, options, data)
    }

    fn finish(&mut self) -> FsResult<()> {
        self.inner.finish()?;
        let plaintext = self.staging.lock().expect("staging buffer poisoned").clone();
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let sealed = seal(&plaintext, &self.key, self.iterations, salt);
        let mut sink = self
            .sink
            .take()
            .ok_or(FsError::Unsupported("output service is finished"))?;
        std::io::Write::write_all(&mut sink, &sealed)?;
        sink.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: [u8; 16] = *b"0123456789abcdef";

    #[test]
    fn test_seal_unseal_round_trip() {
        let sealed = seal(b"attack at dawn", b"secret", 1_000, SALT);
        let plain = unseal(&sealed, b"secret", "test").unwrap();
        assert_eq!(plain, b"attack at dawn");
    }

    #[test]
    fn test_wrong_key_is_bad_key() {
        let sealed = seal(b"payload", b"secret", 1_000, SALT);
        assert!(matches!(
            unseal(&sealed, b"guess", "test"),
            Err(FsError::BadKey(_))
        ));
    }

    #[test]
    fn test_tampered_payload_fails_authentication() {
        let mut sealed = seal(b"payload", b"secret", 1_000, SALT);
        let flip = HEADER_LEN + 2;
        sealed[flip] ^= 0x01;
        assert!(matches!(
            unseal(&sealed, b"secret", "test"),
            Err(FsError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_truncated_envelope_is_corrupt() {
        let sealed = seal(b"payload", b"secret", 1_000, SALT);
        assert!(matches!(
            unseal(&sealed[..20], b"secret", "test"),
            Err(FsError::CorruptArchive(_))
        ));
        assert!(matches!(
            unseal(b"not raes at all, just bytes that are long enough to parse",
                b"secret", "test"),
            Err(FsError::CorruptArchive(_))
        ));
    }

    #[test]
    fn test_envelope_is_deterministic_and_bit_exact() {
        let a = seal(b"same content", b"secret", 1_000, SALT);
        let b = seal(b"same content", b"secret", 1_000, SALT);
        assert_eq!(a, b);

        // Header fields round-trip exactly.
        assert_eq!(&a[..4], RAES_MAGIC);
        assert_eq!(a[4], ENVELOPE_TYPE);
        assert_eq!(a[5], KEY_STRENGTH_256);
        assert_eq!(u32::from_le_bytes(a[6..10].try_into().unwrap()), 1_000);
        assert_eq!(&a[10..26], &SALT);
    }

    #[test]
    fn test_empty_plaintext() {
        let sealed = seal(b"", b"secret", 1_000, SALT);
        assert_eq!(sealed.len(), HEADER_LEN + MAC_LEN);
        assert_eq!(unseal(&sealed, b"secret", "test").unwrap(), b"");
    }
}
