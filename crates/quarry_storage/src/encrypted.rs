//! Encrypted storage backend wrapper.
//!
//! Every append is sealed as one or more AES-256-GCM frames on the inner
//! backend:
//!
//! ```text
//! | frame_len (4, LE) | nonce (12) | ciphertext || tag (16) |
//! ```
//!
//! `frame_len` counts the nonce, ciphertext and tag. Logical offsets seen by
//! callers address plaintext; a frame table maps them to physical frames so
//! `read_at` can decrypt only the frames it touches.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use parking_lot::RwLock;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of an AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of a GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of a GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;
/// Largest plaintext sealed in a single frame.
const MAX_FRAME_PLAINTEXT: usize = 64 * 1024;
/// Length prefix of each frame.
const FRAME_HEADER: usize = 4;

/// Symmetric key for the encrypted backend. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not exactly [`KEY_SIZE`] long.
    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(StorageError::encryption(format!(
                "invalid key size: expected {KEY_SIZE}, got {}",
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    logical_start: u64,
    physical_start: u64,
    plain_len: usize,
}

impl Frame {
    fn logical_end(&self) -> u64 {
        self.logical_start + self.plain_len as u64
    }
}

struct Layout {
    frames: Vec<Frame>,
    logical_size: u64,
}

/// A backend that encrypts everything written to an inner backend.
pub struct EncryptedBackend {
    inner: Box<dyn StorageBackend>,
    cipher: Aes256Gcm,
    layout: RwLock<Layout>,
}

impl EncryptedBackend {
    /// Wraps `inner`, indexing any frames it already holds.
    ///
    /// # Errors
    ///
    /// Fails if the existing content is not a valid frame sequence.
    pub fn new(inner: Box<dyn StorageBackend>, key: &EncryptionKey) -> StorageResult<Self> {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
        let layout = Self::scan(inner.as_ref())?;
        Ok(Self {
            inner,
            cipher,
            layout: RwLock::new(layout),
        })
    }

    fn scan(inner: &dyn StorageBackend) -> StorageResult<Layout> {
        let physical_size = inner.size()?;
        let mut frames = Vec::new();
        let mut physical = 0u64;
        let mut logical = 0u64;

        while physical < physical_size {
            if physical + FRAME_HEADER as u64 > physical_size {
                return Err(StorageError::corrupted("truncated frame header"));
            }
            let header = inner.read_at(physical, FRAME_HEADER)?;
            let frame_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            if frame_len < NONCE_SIZE + TAG_SIZE {
                return Err(StorageError::corrupted("frame shorter than nonce and tag"));
            }
            let end = physical + (FRAME_HEADER + frame_len) as u64;
            if end > physical_size {
                return Err(StorageError::corrupted("truncated frame body"));
            }
            let plain_len = frame_len - NONCE_SIZE - TAG_SIZE;
            frames.push(Frame {
                logical_start: logical,
                physical_start: physical,
                plain_len,
            });
            logical += plain_len as u64;
            physical = end;
        }

        Ok(Layout {
            frames,
            logical_size: logical,
        })
    }

    fn seal(&self, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| StorageError::encryption("encryption failed"))?;

        let frame_len = u32::try_from(NONCE_SIZE + ciphertext.len())
            .map_err(|_| StorageError::encryption("frame too large"))?;
        let mut out = Vec::with_capacity(FRAME_HEADER + frame_len as usize);
        out.extend_from_slice(&frame_len.to_le_bytes());
        out.extend_from_slice(&nonce_bytes);
        out.extend(ciphertext);
        Ok(out)
    }

    fn open_frame(&self, frame: &Frame) -> StorageResult<Vec<u8>> {
        let body_len = NONCE_SIZE + frame.plain_len + TAG_SIZE;
        let body = self
            .inner
            .read_at(frame.physical_start + FRAME_HEADER as u64, body_len)?;
        let (nonce, sealed) = body.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| StorageError::encryption("authentication failed"))
    }

    fn append_frames(&mut self, data: &[u8]) -> StorageResult<()> {
        for chunk in data.chunks(MAX_FRAME_PLAINTEXT) {
            let sealed = self.seal(chunk)?;
            let physical_start = self.inner.append(&sealed)?;
            let mut layout = self.layout.write();
            let logical_start = layout.logical_size;
            layout.frames.push(Frame {
                logical_start,
                physical_start,
                plain_len: chunk.len(),
            });
            layout.logical_size += chunk.len() as u64;
        }
        Ok(())
    }
}

impl StorageBackend for EncryptedBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let layout = self.layout.read();
        let end = offset.saturating_add(len as u64);
        if offset > layout.logical_size || end > layout.logical_size {
            return Err(StorageError::ReadPastEnd {
                offset,
                len,
                size: layout.logical_size,
            });
        }

        let mut out = Vec::with_capacity(len);
        for frame in layout
            .frames
            .iter()
            .filter(|f| f.logical_end() > offset && f.logical_start < end)
        {
            let plain = self.open_frame(frame)?;
            let from = offset.saturating_sub(frame.logical_start) as usize;
            let to = (end.min(frame.logical_end()) - frame.logical_start) as usize;
            out.extend_from_slice(&plain[from..to]);
        }
        Ok(out)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let offset = self.layout.read().logical_size;
        self.append_frames(data)?;
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.layout.read().logical_size)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let (cut, keep) = {
            let layout = self.layout.read();
            if new_size > layout.logical_size {
                return Err(StorageError::TruncatePastEnd {
                    requested: new_size,
                    size: layout.logical_size,
                });
            }
            match layout.frames.iter().position(|f| f.logical_end() > new_size) {
                None => return Ok(()),
                Some(idx) => {
                    let frame = layout.frames[idx];
                    let keep = if frame.logical_start < new_size {
                        let plain = self.open_frame(&frame)?;
                        plain[..(new_size - frame.logical_start) as usize].to_vec()
                    } else {
                        Vec::new()
                    };
                    (idx, keep)
                }
            }
        };

        let physical_cut = self.layout.read().frames[cut].physical_start;
        self.inner.truncate(physical_cut)?;
        {
            let mut layout = self.layout.write();
            let logical_start = layout.frames[cut].logical_start;
            layout.frames.truncate(cut);
            layout.logical_size = logical_start;
        }
        if !keep.is_empty() {
            self.append_frames(&keep)?;
        }
        Ok(())
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        let mut sealed = Vec::new();
        let mut frames = Vec::new();
        let mut logical = 0u64;
        for chunk in data.chunks(MAX_FRAME_PLAINTEXT) {
            frames.push(Frame {
                logical_start: logical,
                physical_start: sealed.len() as u64,
                plain_len: chunk.len(),
            });
            sealed.extend(self.seal(chunk)?);
            logical += chunk.len() as u64;
        }
        self.inner.replace(&sealed)?;
        *self.layout.write() = Layout {
            frames,
            logical_size: logical,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBackend;
    use proptest::prelude::*;

    fn key(byte: u8) -> EncryptionKey {
        EncryptionKey::from_bytes(&[byte; KEY_SIZE]).unwrap()
    }

    #[test]
    fn ciphertext_hides_plaintext() {
        let inner = InMemoryBackend::new();
        let observer = inner.clone();
        let mut backend = EncryptedBackend::new(Box::new(inner), &key(0x42)).unwrap();

        backend.append(b"customer ledger").unwrap();
        let raw = observer.data();
        assert!(!raw.windows(8).any(|w| w == b"customer"));
        assert_eq!(backend.read_all().unwrap(), b"customer ledger");
    }

    #[test]
    fn reopen_with_same_key_reads_back() {
        let inner = InMemoryBackend::new();
        let shared = inner.clone();
        {
            let mut backend = EncryptedBackend::new(Box::new(inner), &key(7)).unwrap();
            backend.append(b"abc").unwrap();
            backend.append(b"defgh").unwrap();
        }
        let backend = EncryptedBackend::new(Box::new(shared), &key(7)).unwrap();
        assert_eq!(backend.size().unwrap(), 8);
        assert_eq!(backend.read_at(2, 4).unwrap(), b"cdef");
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let inner = InMemoryBackend::new();
        let shared = inner.clone();
        let mut backend = EncryptedBackend::new(Box::new(inner), &key(1)).unwrap();
        backend.append(b"secret").unwrap();

        let other = EncryptedBackend::new(Box::new(shared), &key(2)).unwrap();
        assert!(matches!(
            other.read_all(),
            Err(StorageError::Encryption(_))
        ));
    }

    #[test]
    fn tampering_is_detected() {
        let inner = InMemoryBackend::new();
        let observer = inner.clone();
        let mut backend = EncryptedBackend::new(Box::new(inner), &key(3)).unwrap();
        backend.append(b"payload").unwrap();

        observer.corrupt_byte(FRAME_HEADER + NONCE_SIZE + 1);
        assert!(backend.read_all().is_err());
    }

    #[test]
    fn truncate_inside_a_frame_keeps_prefix() {
        let mut backend = EncryptedBackend::new(Box::new(InMemoryBackend::new()), &key(9)).unwrap();
        backend.append(b"abcdef").unwrap();
        backend.append(b"ghij").unwrap();

        backend.truncate(4).unwrap();
        assert_eq!(backend.read_all().unwrap(), b"abcd");
        backend.append(b"XY").unwrap();
        assert_eq!(backend.read_all().unwrap(), b"abcdXY");
    }

    proptest! {
        #[test]
        fn arbitrary_reads_match_plaintext(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..300), 1..8),
            start in 0usize..1000,
            len in 0usize..500,
        ) {
            let mut backend = EncryptedBackend::new(Box::new(InMemoryBackend::new()), &key(5)).unwrap();
            let mut plain = Vec::new();
            for chunk in &chunks {
                backend.append(chunk).unwrap();
                plain.extend_from_slice(chunk);
            }
            let start = start.min(plain.len());
            let len = len.min(plain.len() - start);
            prop_assert_eq!(backend.read_at(start as u64, len).unwrap(), plain[start..start + len].to_vec());
        }
    }
}
