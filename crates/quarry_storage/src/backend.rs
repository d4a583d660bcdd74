//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level byte store.
///
/// The engine uses two access patterns on top of this trait: the write-ahead
/// log is appended to and read back sequentially, and database images are
/// rewritten wholesale through [`replace`](StorageBackend::replace) at
/// checkpoint time.
///
/// # Invariants
///
/// - `append` returns the logical offset where the data begins
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `sync` makes every appended or replaced byte durable
/// - after `replace(data)`, the store contains exactly `data`
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ReadPastEnd`](crate::StorageError::ReadPastEnd)
    /// when the range extends beyond the current size.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data and returns the offset where it was written.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current logical size in bytes.
    fn size(&self) -> StorageResult<u64>;

    /// Flushes data and metadata to durable storage.
    fn sync(&mut self) -> StorageResult<()>;

    /// Truncates the store to `new_size` bytes.
    ///
    /// # Errors
    ///
    /// Fails if `new_size` is greater than the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Atomically replaces the whole content of the store.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Reads the whole content of the store.
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        self.read_at(0, size as usize)
    }
}
