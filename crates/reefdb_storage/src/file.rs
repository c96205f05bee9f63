//! File-based log backend for persistent storage.

use crate::backend::{LogBackend, LogRewrite};
use crate::error::{StorageError, StorageResult};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A file-based log backend.
///
/// The log is a single append-only file. Data survives process restarts.
///
/// # Durability
///
/// `sync()` calls `File::sync_all()` to ensure data and metadata are on
/// disk. Appends themselves only guarantee a single write call.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: File,
    size: u64,
}

impl FileBackend {
    /// Opens or creates a log file at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be opened for reading and
    /// writing - including when it names a directory.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl LogBackend for FileBackend {
    fn append(&mut self, data: &[u8]) -> StorageResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(data)?;
        self.size += data.len() as u64;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.size)
    }

    fn modified(&self) -> StorageResult<SystemTime> {
        Ok(self.file.metadata()?.modified()?)
    }

    fn reader(&self) -> StorageResult<Box<dyn Read + Send>> {
        // A fresh handle so the read cursor is independent of appends.
        let file = File::open(&self.path)?;
        Ok(Box::new(file))
    }

    fn begin_rewrite(&mut self) -> StorageResult<Box<dyn LogRewrite>> {
        let tmp_path = self.tmp_path();
        let tmp = File::create(&tmp_path)?;
        Ok(Box::new(FileRewrite {
            src_path: self.path.clone(),
            tmp_path,
            tmp: Some(tmp),
        }))
    }

    fn reopen(&mut self) -> StorageResult<()> {
        self.file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        self.size = self.file.metadata()?.len();
        Ok(())
    }
}

/// An in-progress rewrite of a [`FileBackend`] log.
///
/// Content accumulates in a sibling `.tmp` file. Commit copies the
/// original file's suffix into it and renames it over the original.
struct FileRewrite {
    src_path: PathBuf,
    tmp_path: PathBuf,
    /// `None` once committed; the drop guard uses this to know whether
    /// the temp file still needs removing.
    tmp: Option<File>,
}

impl LogRewrite for FileRewrite {
    fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        let tmp = self
            .tmp
            .as_mut()
            .ok_or_else(|| StorageError::invalid_rewrite("rewrite already committed"))?;
        tmp.write_all(data)?;
        Ok(())
    }

    fn commit(mut self: Box<Self>, keep_from: u64) -> StorageResult<()> {
        let mut tmp = self
            .tmp
            .take()
            .ok_or_else(|| StorageError::invalid_rewrite("rewrite already committed"))?;

        // Append every command written to the original since the rewrite
        // started. A fresh read handle keeps the live handle's cursor
        // untouched.
        let mut src = File::open(&self.src_path)?;
        src.seek(SeekFrom::Start(keep_from))?;
        io::copy(&mut src, &mut tmp)?;
        drop(src);
        drop(tmp);

        // The replacement is complete on disk. A rename failure here
        // leaves the database with no trustworthy log to reopen.
        if let Err(e) = std::fs::rename(&self.tmp_path, &self.src_path) {
            panic!(
                "failed to swap rewritten log {:?} over {:?}: {}",
                self.tmp_path, self.src_path, e
            );
        }
        Ok(())
    }
}

impl Drop for FileRewrite {
    fn drop(&mut self) {
        if self.tmp.take().is_some() {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}
