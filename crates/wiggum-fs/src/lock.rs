//! Advisory file locking and atomic write-then-rename.
//!
//! The board, batch-coordination records, and sidecar counter files are all
//! mutated by the read-modify-write-under-lock pattern described in the
//! concurrency model: take an exclusive lock on a well-known `.lock` file,
//! read the target, mutate it, then publish the new contents via a
//! write-to-temp-then-rename so a reader never observes a partial file.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// An exclusive advisory lock held for the duration of a read-modify-write
/// sequence against some target file.
///
/// The lock file lives alongside the target with a `.lock` suffix so that
/// the target file itself is never opened in a mode that could race with a
/// concurrent atomic rename.
pub struct ExclusiveLock {
    _file: File,
    lock_path: PathBuf,
}

impl ExclusiveLock {
    /// Acquire an exclusive lock for `target`, blocking until it is available.
    pub fn acquire(target: &Path) -> std::io::Result<Self> {
        let lock_path = lock_path_for(target);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        file.lock_exclusive()?;
        Ok(Self {
            _file: file,
            lock_path,
        })
    }

    /// Try to acquire the lock without blocking.
    pub fn try_acquire(target: &Path) -> std::io::Result<Option<Self>> {
        let lock_path = lock_path_for(target);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                _file: file,
                lock_path,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for ExclusiveLock {
    fn drop(&mut self) {
        // The lock is released when `_file` is closed; we keep the lock
        // file itself on disk so the next acquirer does not race creating it.
        let _ = &self.lock_path;
    }
}

fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    match target.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Write `contents` to `path` atomically: write to a sibling temp file in
/// the same directory, then rename over the target. A reader opening `path`
/// at any point either sees the old contents in full or the new contents in
/// full, never a partial write.
pub fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let tmp_name = format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        std::process::id()
    );
    let tmp_path = dir.join(tmp_name);
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_creates_file_with_exact_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("board.md");
        atomic_write(&path, b"hello").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn atomic_write_overwrites_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("board.md");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn exclusive_lock_blocks_second_try_acquire() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("board.md");
        fs::write(&target, b"x").unwrap();

        let first = ExclusiveLock::acquire(&target).unwrap();
        let second = ExclusiveLock::try_acquire(&target).unwrap();
        assert!(second.is_none(), "second lock should not be acquired while first is held");

        drop(first);
        let third = ExclusiveLock::try_acquire(&target).unwrap();
        assert!(third.is_some(), "lock should be acquirable once released");
    }
}
