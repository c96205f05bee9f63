//! Log backend trait definitions.

use crate::error::StorageResult;
use std::io::Read;
use std::time::SystemTime;

/// A low-level append-only log store for ReefDB.
///
/// Backends are **opaque byte stores**. They provide simple operations for
/// appending, streaming reads, and durability. ReefDB owns all command
/// format interpretation - backends do not understand RESP records.
///
/// # Invariants
///
/// - `append` writes the whole buffer with a single underlying write
/// - `reader` streams exactly the bytes previously appended, in order
/// - `sync` ensures all appended data is durable
///
/// # Implementors
///
/// - [`super::MemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent storage
///
/// Backends live behind the database's reader/writer lock, which
/// requires them to be `Send + Sync`; all mutation goes through
/// `&mut self`.
pub trait LogBackend: Send + Sync {
    /// Appends data to the end of the log.
    ///
    /// The whole buffer is handed to the operating system in one write
    /// call, so a crash either keeps the previous tail or appends a
    /// (possibly partial) suffix - never interleaves.
    fn append(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Ensures all appended data is durable.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the current size of the log in bytes.
    fn size(&self) -> StorageResult<u64>;

    /// Returns the time the log was last modified.
    ///
    /// Used to re-anchor relative expiration times after a restart.
    fn modified(&self) -> StorageResult<SystemTime>;

    /// Returns a reader streaming the log contents from the beginning.
    ///
    /// The reader observes a snapshot taken at call time; concurrent
    /// appends may or may not be visible through it.
    fn reader(&self) -> StorageResult<Box<dyn Read + Send>>;

    /// Starts an atomic rewrite of the log.
    ///
    /// The returned [`LogRewrite`] accumulates replacement content in a
    /// sibling location. Nothing about the live log changes until
    /// [`LogRewrite::commit`] succeeds. Dropping the rewrite without
    /// committing discards it.
    fn begin_rewrite(&mut self) -> StorageResult<Box<dyn LogRewrite>>;

    /// Refreshes the backend after a committed rewrite.
    ///
    /// File-based backends must reopen their handle here because commit
    /// replaces the file behind it.
    fn reopen(&mut self) -> StorageResult<()>;
}

/// An in-progress atomic log rewrite.
///
/// Created by [`LogBackend::begin_rewrite`]. The caller streams the
/// replacement content with `write`, then calls `commit` with the offset
/// from which the *original* log's suffix should be preserved. Commit
/// appends that suffix to the replacement and atomically swaps the two.
pub trait LogRewrite: Send {
    /// Appends replacement content.
    fn write(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Atomically replaces the log with the accumulated content plus the
    /// original log's bytes from `keep_from` onward.
    ///
    /// # Panics
    ///
    /// Panics if the final swap fails after the replacement was fully
    /// written. At that point neither the old nor the new content can be
    /// trusted to be the live one, and the process cannot continue
    /// consistently.
    fn commit(self: Box<Self>, keep_from: u64) -> StorageResult<()>;
}
