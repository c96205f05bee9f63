//! In-memory log backend for testing.

use crate::backend::{LogBackend, LogRewrite};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::SystemTime;

/// An in-memory log backend.
///
/// Behaves like [`super::FileBackend`] minus durability. Suitable for:
/// - Unit tests
/// - Recovery and compaction simulations without touching disk
#[derive(Debug)]
pub struct MemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
    modified: Arc<RwLock<SystemTime>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            data: Arc::new(RwLock::new(Vec::new())),
            modified: Arc::new(RwLock::new(SystemTime::now())),
        }
    }
}

impl MemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend with pre-existing content.
    ///
    /// Useful for testing load and recovery scenarios.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
            modified: Arc::new(RwLock::new(SystemTime::now())),
        }
    }

    /// Returns a copy of the current content.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl LogBackend for MemoryBackend {
    fn append(&mut self, data: &[u8]) -> StorageResult<()> {
        self.data.write().extend_from_slice(data);
        *self.modified.write() = SystemTime::now();
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn modified(&self) -> StorageResult<SystemTime> {
        Ok(*self.modified.read())
    }

    fn reader(&self) -> StorageResult<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.data.read().clone())))
    }

    fn begin_rewrite(&mut self) -> StorageResult<Box<dyn LogRewrite>> {
        Ok(Box::new(MemoryRewrite {
            target: Arc::clone(&self.data),
            modified: Arc::clone(&self.modified),
            buf: Some(Vec::new()),
        }))
    }

    fn reopen(&mut self) -> StorageResult<()> {
        Ok(())
    }
}

struct MemoryRewrite {
    target: Arc<RwLock<Vec<u8>>>,
    modified: Arc<RwLock<SystemTime>>,
    buf: Option<Vec<u8>>,
}

impl LogRewrite for MemoryRewrite {
    fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        let buf = self
            .buf
            .as_mut()
            .ok_or_else(|| StorageError::invalid_rewrite("rewrite already committed"))?;
        buf.extend_from_slice(data);
        Ok(())
    }

    fn commit(mut self: Box<Self>, keep_from: u64) -> StorageResult<()> {
        let mut buf = self
            .buf
            .take()
            .ok_or_else(|| StorageError::invalid_rewrite("rewrite already committed"))?;

        let mut target = self.target.write();
        let keep_from = (keep_from as usize).min(target.len());
        buf.extend_from_slice(&target[keep_from..]);
        *target = buf;
        *self.modified.write() = SystemTime::now();
        Ok(())
    }
}
