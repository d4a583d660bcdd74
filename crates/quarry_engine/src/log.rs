//! Write-ahead log records, framing and the buffered log writer.
//!
//! Every record is framed as
//!
//! ```text
//! | magic "QLOG" | version u16 | type u8 | len u32 | payload | crc32 |
//! ```
//!
//! with the CRC covering everything before it. A commit record carries the
//! full post-image of every key the transaction touched, so replay is a plain
//! overwrite and is idempotent.

use crate::checksum::crc32;
use crate::config::Duplicates;
use crate::error::{EngineError, EngineResult};
use crate::types::{TxnId, Values};
use quarry_storage::StorageBackend;

/// Magic bytes identifying a log record.
pub(crate) const LOG_MAGIC: [u8; 4] = *b"QLOG";

/// Current log format version.
pub(crate) const LOG_VERSION: u16 = 1;

/// magic (4) + version (2) + type (1) + length (4)
const HEADER_SIZE: usize = 11;
const CRC_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum LogRecordType {
    CreateDb = 1,
    Commit = 2,
}

impl LogRecordType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::CreateDb),
            2 => Some(Self::Commit),
            _ => None,
        }
    }
}

/// The committed state of one key after a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LogOp {
    /// Database name.
    pub db: String,
    /// Record key.
    pub key: Vec<u8>,
    /// Values stored under the key; empty when the key was removed.
    pub values: Values,
}

/// A log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LogRecord {
    /// A database was created.
    CreateDb {
        /// Database name.
        name: String,
        /// Duplicate policy.
        duplicates: Duplicates,
    },
    /// A transaction committed.
    Commit {
        /// Committing transaction.
        txid: TxnId,
        /// Post-images of every touched key.
        ops: Vec<LogOp>,
    },
}

impl LogRecord {
    fn record_type(&self) -> LogRecordType {
        match self {
            Self::CreateDb { .. } => LogRecordType::CreateDb,
            Self::Commit { .. } => LogRecordType::Commit,
        }
    }

    fn encode_payload(&self) -> EngineResult<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Self::CreateDb { name, duplicates } => {
                put_str(&mut buf, name)?;
                buf.push(duplicates.as_byte());
            }
            Self::Commit { txid, ops } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
                put_len(&mut buf, ops.len())?;
                for op in ops {
                    put_str(&mut buf, &op.db)?;
                    put_bytes(&mut buf, &op.key)?;
                    put_len(&mut buf, op.values.len())?;
                    for value in &op.values {
                        put_bytes(&mut buf, value)?;
                    }
                }
            }
        }
        Ok(buf)
    }

    fn decode_payload(record_type: LogRecordType, payload: &[u8]) -> EngineResult<Self> {
        let mut reader = Reader::new(payload);
        let record = match record_type {
            LogRecordType::CreateDb => {
                let name = reader.string()?;
                let duplicates = Duplicates::from_byte(reader.u8()?)
                    .ok_or_else(|| EngineError::corruption("log", "unknown duplicate policy"))?;
                Self::CreateDb { name, duplicates }
            }
            LogRecordType::Commit => {
                let txid = TxnId::new(reader.u64()?);
                let count = reader.u32()? as usize;
                let mut ops = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let db = reader.string()?;
                    let key = reader.bytes()?;
                    let nvalues = reader.u32()? as usize;
                    let mut values = Vec::with_capacity(nvalues.min(1024));
                    for _ in 0..nvalues {
                        values.push(reader.bytes()?);
                    }
                    ops.push(LogOp { db, key, values });
                }
                Self::Commit { txid, ops }
            }
        };
        if !reader.is_empty() {
            return Err(EngineError::corruption("log", "trailing bytes in record"));
        }
        Ok(record)
    }

    /// Encodes the record with its envelope and checksum.
    pub(crate) fn encode(&self) -> EngineResult<Vec<u8>> {
        let payload = self.encode_payload()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| EngineError::invalid_argument("log record payload too large"))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&LOG_MAGIC);
        data.extend_from_slice(&LOG_VERSION.to_le_bytes());
        data.push(self.record_type() as u8);
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);
        let crc = crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }
}

/// Where a log scan stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LogDamage {
    /// The last record is incomplete, as left by a crash during a write.
    TornTail {
        /// Offset of the incomplete record.
        offset: u64,
    },
    /// A complete record failed validation.
    Corrupt {
        /// Offset of the damaged record.
        offset: u64,
        /// What failed.
        reason: String,
    },
}

impl LogDamage {
    pub(crate) fn offset(&self) -> u64 {
        match self {
            Self::TornTail { offset } | Self::Corrupt { offset, .. } => *offset,
        }
    }
}

/// Result of scanning a log image.
#[derive(Debug, Default)]
pub(crate) struct LogScan {
    /// Records read before any damage, in log order.
    pub records: Vec<LogRecord>,
    /// Damage that stopped the scan, if any.
    pub damage: Option<LogDamage>,
}

/// Parses records from the start of `data` until the end or the first damage.
pub(crate) fn scan(data: &[u8]) -> LogScan {
    let mut result = LogScan::default();
    let mut offset = 0usize;

    while offset < data.len() {
        let at = offset as u64;
        let rest = &data[offset..];
        if rest.len() < HEADER_SIZE {
            result.damage = Some(LogDamage::TornTail { offset: at });
            break;
        }
        if rest[..4] != LOG_MAGIC {
            result.damage = Some(LogDamage::Corrupt {
                offset: at,
                reason: "bad magic".into(),
            });
            break;
        }
        let version = u16::from_le_bytes([rest[4], rest[5]]);
        let type_byte = rest[6];
        let len = u32::from_le_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;
        let total = HEADER_SIZE + len + CRC_SIZE;
        if rest.len() < total {
            result.damage = Some(LogDamage::TornTail { offset: at });
            break;
        }
        let body = &rest[..HEADER_SIZE + len];
        let stored = u32::from_le_bytes([
            rest[HEADER_SIZE + len],
            rest[HEADER_SIZE + len + 1],
            rest[HEADER_SIZE + len + 2],
            rest[HEADER_SIZE + len + 3],
        ]);
        if crc32(body) != stored {
            result.damage = Some(LogDamage::Corrupt {
                offset: at,
                reason: "checksum mismatch".into(),
            });
            break;
        }
        if version != LOG_VERSION {
            result.damage = Some(LogDamage::Corrupt {
                offset: at,
                reason: format!("unsupported log version {version}"),
            });
            break;
        }
        let decoded = LogRecordType::from_byte(type_byte)
            .ok_or_else(|| EngineError::corruption("log", format!("unknown record type {type_byte}")))
            .and_then(|t| LogRecord::decode_payload(t, &body[HEADER_SIZE..]));
        match decoded {
            Ok(record) => result.records.push(record),
            Err(e) => {
                result.damage = Some(LogDamage::Corrupt {
                    offset: at,
                    reason: e.to_string(),
                });
                break;
            }
        }
        offset += total;
    }
    result
}

/// Buffered log writer.
///
/// Records accumulate in memory until `log_buffer_size` bytes are pending, a
/// commit is written with `sync_on_commit`, or [`LogManager::flush`] is called.
pub(crate) struct LogManager {
    backend: Box<dyn StorageBackend>,
    pending: Vec<u8>,
    buffer_size: usize,
    sync_on_commit: bool,
}

impl LogManager {
    pub(crate) fn new(backend: Box<dyn StorageBackend>, buffer_size: usize, sync_on_commit: bool) -> Self {
        Self {
            backend,
            pending: Vec::new(),
            buffer_size,
            sync_on_commit,
        }
    }

    /// Returns every durable byte of the log.
    pub(crate) fn read_all(&self) -> EngineResult<Vec<u8>> {
        Ok(self.backend.read_all()?)
    }

    /// Appends a record.
    pub(crate) fn append(&mut self, record: &LogRecord) -> EngineResult<()> {
        self.pending.extend_from_slice(&record.encode()?);
        if self.sync_on_commit && matches!(record, LogRecord::Commit { .. }) {
            self.flush(true)
        } else if self.pending.len() >= self.buffer_size {
            self.flush(false)
        } else {
            Ok(())
        }
    }

    /// Writes pending records to the backend, syncing when asked.
    pub(crate) fn flush(&mut self, sync: bool) -> EngineResult<()> {
        if !self.pending.is_empty() {
            self.backend.append(&self.pending)?;
            self.pending.clear();
            self.backend.flush()?;
        }
        if sync {
            self.backend.sync()?;
        }
        Ok(())
    }

    /// Drops everything from `offset` on. Pending records are discarded.
    pub(crate) fn truncate(&mut self, offset: u64) -> EngineResult<()> {
        self.pending.clear();
        self.backend.truncate(offset)?;
        Ok(())
    }

    /// Empties the log after a checkpoint.
    pub(crate) fn clear(&mut self) -> EngineResult<()> {
        self.truncate(0)?;
        self.backend.sync()?;
        Ok(())
    }

    /// Durable size in bytes, excluding pending records.
    pub(crate) fn size(&self) -> EngineResult<u64> {
        Ok(self.backend.size()?)
    }
}

fn put_len(buf: &mut Vec<u8>, len: usize) -> EngineResult<()> {
    let len = u32::try_from(len).map_err(|_| EngineError::invalid_argument("length exceeds u32"))?;
    buf.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> EngineResult<()> {
    put_len(buf, bytes.len())?;
    buf.extend_from_slice(bytes);
    Ok(())
}

fn put_str(buf: &mut Vec<u8>, s: &str) -> EngineResult<()> {
    put_bytes(buf, s.as_bytes())
}

/// Bounds-checked little-endian reader shared by log and image decoding.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self::for_structure(data, "log")
    }

    pub(crate) fn for_structure(data: &'a [u8], what: &'static str) -> Self {
        Self { data, pos: 0, what }
    }

    fn take(&mut self, n: usize) -> EngineResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| EngineError::corruption(self.what, "unexpected end of data"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> EngineResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> EngineResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> EngineResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> EngineResult<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    pub(crate) fn bytes(&mut self) -> EngineResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub(crate) fn string(&mut self) -> EngineResult<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes).map_err(|_| EngineError::corruption(self.what, "invalid UTF-8 name"))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }
}
