//! Committed contents of one database.
//!
//! A tree is an ordered map from key to values behind an `Arc`. Readers clone
//! the `Arc` and keep a stable snapshot; commits mutate through
//! `Arc::make_mut`, copying only when a snapshot is still alive.
//!
//! On disk a tree is a single image written at checkpoint:
//!
//! ```text
//! | "QDB1" | version u16 | dup u8 | name | count u64 | entries... | crc32 |
//! ```

use crate::checksum::crc32;
use crate::config::Duplicates;
use crate::error::{EngineError, EngineResult};
use crate::log::Reader;
use crate::types::Values;
use parking_lot::{Mutex, RwLock};
use quarry_storage::StorageBackend;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const IMAGE_MAGIC: [u8; 4] = *b"QDB1";
const IMAGE_VERSION: u16 = 1;

/// Ordered key to values map.
pub(crate) type TreeMap = BTreeMap<Vec<u8>, Values>;

/// One database's committed data and its image file.
pub(crate) struct DbTree {
    name: String,
    duplicates: Duplicates,
    data: RwLock<Arc<TreeMap>>,
    dirty: AtomicBool,
    backend: Mutex<Box<dyn StorageBackend>>,
}

impl std::fmt::Debug for DbTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbTree")
            .field("name", &self.name)
            .field("duplicates", &self.duplicates)
            .finish_non_exhaustive()
    }
}

impl DbTree {
    /// An empty tree that has never been written.
    pub(crate) fn new(name: String, duplicates: Duplicates, backend: Box<dyn StorageBackend>) -> Self {
        Self {
            name,
            duplicates,
            data: RwLock::new(Arc::new(TreeMap::new())),
            dirty: AtomicBool::new(true),
            backend: Mutex::new(backend),
        }
    }

    /// Loads a tree from its image file.
    pub(crate) fn load(backend: Box<dyn StorageBackend>) -> EngineResult<Self> {
        let image = backend.read_all()?;
        let (name, duplicates, data) = decode_image(&image)?;
        Ok(Self {
            name,
            duplicates,
            data: RwLock::new(Arc::new(data)),
            dirty: AtomicBool::new(false),
            backend: Mutex::new(backend),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn duplicates(&self) -> Duplicates {
        self.duplicates
    }

    /// A point-in-time view of the committed data.
    pub(crate) fn snapshot(&self) -> Arc<TreeMap> {
        Arc::clone(&self.data.read())
    }

    /// Installs post-images. An empty value list removes the key.
    pub(crate) fn apply<'a>(&self, writes: impl IntoIterator<Item = (&'a Vec<u8>, &'a Values)>) {
        let mut guard = self.data.write();
        let map = Arc::make_mut(&mut guard);
        for (key, values) in writes {
            if values.is_empty() {
                map.remove(key);
            } else {
                map.insert(key.clone(), values.clone());
            }
        }
        self.dirty.store(true, Ordering::Release);
    }

    /// Approximate bytes held by the tree.
    pub(crate) fn resident_bytes(&self) -> u64 {
        self.data
            .read()
            .iter()
            .map(|(k, vs)| (k.len() + vs.iter().map(Vec::len).sum::<usize>()) as u64)
            .sum()
    }

    /// Writes the image if anything changed since the last write.
    pub(crate) fn persist(&self) -> EngineResult<bool> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let image = encode_image(&self.name, self.duplicates, &self.snapshot())?;
        let mut backend = self.backend.lock();
        let written = backend.replace(&image).and_then(|()| backend.sync());
        if let Err(e) = written {
            self.dirty.store(true, Ordering::Release);
            return Err(e.into());
        }
        Ok(true)
    }
}

/// Inserts `value` into `values` according to the duplicate policy.
///
/// Returns false when the pair was already present.
pub(crate) fn insert_value(values: &mut Values, value: Vec<u8>, duplicates: Duplicates) -> bool {
    match duplicates {
        Duplicates::None => {
            values.clear();
            values.push(value);
            true
        }
        Duplicates::Unsorted => {
            if values.contains(&value) {
                return false;
            }
            values.push(value);
            true
        }
        Duplicates::Sorted => match values.binary_search(&value) {
            Ok(_) => false,
            Err(pos) => {
                values.insert(pos, value);
                true
            }
        },
    }
}

pub(crate) fn encode_image(name: &str, duplicates: Duplicates, data: &TreeMap) -> EngineResult<Vec<u8>> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&IMAGE_MAGIC);
    buf.extend_from_slice(&IMAGE_VERSION.to_le_bytes());
    buf.push(duplicates.as_byte());
    let name_len =
        u32::try_from(name.len()).map_err(|_| EngineError::invalid_argument("database name too long"))?;
    buf.extend_from_slice(&name_len.to_le_bytes());
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(&(data.len() as u64).to_le_bytes());
    for (key, values) in data {
        push_bytes(&mut buf, key)?;
        let count =
            u32::try_from(values.len()).map_err(|_| EngineError::invalid_argument("too many duplicates"))?;
        buf.extend_from_slice(&count.to_le_bytes());
        for value in values {
            push_bytes(&mut buf, value)?;
        }
    }
    let crc = crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

pub(crate) fn decode_image(image: &[u8]) -> EngineResult<(String, Duplicates, TreeMap)> {
    if image.len() < IMAGE_MAGIC.len() + 4 {
        return Err(EngineError::corruption("database image", "image too short"));
    }
    let (body, tail) = image.split_at(image.len() - 4);
    let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    if crc32(body) != stored {
        return Err(EngineError::corruption("database image", "checksum mismatch"));
    }
    if body[..4] != IMAGE_MAGIC {
        return Err(EngineError::corruption("database image", "bad magic"));
    }

    let mut reader = Reader::for_structure(&body[4..], "database image");
    let version = reader.u16()?;
    if version != IMAGE_VERSION {
        return Err(EngineError::corruption(
            "database image",
            format!("unsupported image version {version}"),
        ));
    }
    let duplicates = Duplicates::from_byte(reader.u8()?)
        .ok_or_else(|| EngineError::corruption("database image", "unknown duplicate policy"))?;
    let name = reader.string()?;
    let count = reader.u64()?;
    let mut data = TreeMap::new();
    for _ in 0..count {
        let key = reader.bytes()?;
        let nvalues = reader.u32()? as usize;
        let mut values = Vec::with_capacity(nvalues.min(1024));
        for _ in 0..nvalues {
            values.push(reader.bytes()?);
        }
        data.insert(key, values);
    }
    if !reader.is_empty() {
        return Err(EngineError::corruption("database image", "trailing bytes"));
    }
    Ok((name, duplicates, data))
}

fn push_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> EngineResult<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| EngineError::invalid_argument("value too large"))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}
