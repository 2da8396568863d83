//! Lock-guarded whole-file writes.
//!
//! Every write takes an exclusive advisory lock on the target file for its
//! whole duration. Truncating modes truncate only once the lock is held, so a
//! reader that takes the shared lock (see [`read_shared`]) never observes an
//! empty or half-written document.

use crate::error::{BindingError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// How the target file is opened, mirroring the classic `fopen` modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// `r`: read only, the file must exist. Writing with this mode fails.
    Read,
    /// `r+`: read and write from the start, the file must exist.
    ReadWrite,
    /// `w`: create if missing, truncate, write. Use this for full rewrites.
    Truncate,
    /// `w+`: like `Truncate`, also readable.
    TruncateRead,
    /// `a`: create if missing, append to the end.
    Append,
    /// `a+`: like `Append`, also readable.
    AppendRead,
}

impl OpenMode {
    fn options(self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        match self {
            OpenMode::Read => opts.read(true),
            OpenMode::ReadWrite => opts.read(true).write(true),
            // Truncation is deferred until the lock is held.
            OpenMode::Truncate => opts.write(true).create(true).truncate(false),
            OpenMode::TruncateRead => opts.read(true).write(true).create(true).truncate(false),
            OpenMode::Append => opts.append(true).create(true),
            OpenMode::AppendRead => opts.read(true).append(true).create(true),
        };
        opts
    }

    fn truncates(self) -> bool {
        matches!(self, OpenMode::Truncate | OpenMode::TruncateRead)
    }
}

/// Holds an advisory lock and releases it on drop.
struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    fn exclusive(file: &'a File, path: &Path) -> Result<Self> {
        FileExt::lock_exclusive(file).map_err(|source| BindingError::LockAcquisition {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(FileLock { file })
    }

    fn shared(file: &'a File, path: &Path) -> Result<Self> {
        FileExt::lock_shared(file).map_err(|source| BindingError::LockAcquisition {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(FileLock { file })
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(self.file) {
            log::warn!("Failed to release file lock: {e}");
        }
    }
}

/// Write `content` to `path` under an exclusive lock.
///
/// Blocks until the lock is available. The lock is released and the handle
/// closed before returning, on success and on failure alike.
pub fn write(path: &Path, content: &str, mode: OpenMode) -> Result<()> {
    let write_err = |source| BindingError::Write {
        path: path.to_path_buf(),
        source,
    };

    let file = mode.options().open(path).map_err(write_err)?;
    let lock = FileLock::exclusive(&file, path)?;

    let result = write_locked(&file, content.as_bytes(), mode).map_err(write_err);

    drop(lock);
    result
}

/// Write `content` only when the file is missing or empty, deciding under the
/// exclusive lock. Returns whether anything was written.
///
/// A concurrent [`write`] truncates before it rewrites, so a length check made
/// without the lock can mistake a document mid-rewrite for an empty file.
pub fn init_if_empty(path: &Path, content: &str) -> Result<bool> {
    let write_err = |source| BindingError::Write {
        path: path.to_path_buf(),
        source,
    };

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(write_err)?;
    let lock = FileLock::exclusive(&file, path)?;

    let result = match file.metadata() {
        Ok(meta) if meta.len() > 0 => Ok(false),
        Ok(_) => write_locked(&file, content.as_bytes(), OpenMode::Truncate).map(|()| true),
        Err(e) => Err(e),
    }
    .map_err(write_err);

    drop(lock);
    result
}

fn write_locked(mut file: &File, bytes: &[u8], mode: OpenMode) -> std::io::Result<()> {
    if mode.truncates() {
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
    }
    file.write_all(bytes)?;
    file.sync_data()
}

/// Read the whole file while holding a shared lock, so an in-flight
/// [`write`] from any process is never observed half-done.
pub fn read_shared(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let _lock = FileLock::shared(&file, path)?;
    let mut content = String::new();
    (&file).read_to_string(&mut content)?;
    Ok(content)
}
