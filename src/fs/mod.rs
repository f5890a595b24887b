// src/fs/mod.rs

//! Physical filesystem access.
//!
//! Everything above this layer goes through [`crate::files::FileStore`]; this
//! trait only exists so tests can swap in [`mock::MockFileSystem`]. Calls are
//! blocking and are made from `spawn_blocking`.

use std::fmt::Debug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::types::Timestamp;

pub mod mock;

pub use mock::MockFileSystem;

/// One entry returned by [`FileSystem::read_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Abstract filesystem interface.
///
/// Errors are plain `io::Error`s so callers can branch on
/// [`io::ErrorKind::NotFound`] and [`io::ErrorKind::ResourceBusy`].
pub trait FileSystem: Send + Sync + Debug {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Write a file. Does not create missing parent directories.
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Modification time of a file.
    fn modified(&self, path: &Path) -> io::Result<Timestamp>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Remove an empty directory. Fails when the directory has entries.
    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;
}

/// Implementation that uses `std::fs`.
#[derive(Debug, Clone, Default)]
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        fs::write(path, contents)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn modified(&self, path: &Path) -> io::Result<Timestamp> {
        let meta = fs::metadata(path)?;
        if meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                format!("{} is a directory", path.display()),
            ));
        }
        Ok(Timestamp::from_system_time(meta.modified()?))
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let is_dir = entry.file_type()?.is_dir();
            entries.push(DirEntry {
                path: entry.path(),
                is_dir,
            });
        }
        Ok(entries)
    }
}

/// Write `contents`, creating the parent directory and retrying once if the
/// first attempt reports it missing.
pub fn write_with_mkdir(fs: &dyn FileSystem, path: &Path, contents: &[u8]) -> io::Result<()> {
    match fs.write(path, contents) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                // A concurrent writer may win the race; the retry decides.
                let _ = fs.create_dir_all(parent);
            }
            fs.write(path, contents)
        }
        other => other,
    }
}

/// Delete a file (already-missing is fine), then remove now-empty parent
/// directories up to but not including `stop_at`.
pub fn remove_file_with_rmdir(fs: &dyn FileSystem, path: &Path, stop_at: &Path) -> io::Result<()> {
    let result = match fs.remove_file(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    };

    let mut dir = path.parent();
    while let Some(d) = dir {
        if d == stop_at || !d.starts_with(stop_at) {
            break;
        }
        if fs.remove_dir(d).is_err() {
            // not empty
            break;
        }
        dir = d.parent();
    }

    result
}
