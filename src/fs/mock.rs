// src/fs/mock.rs

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{DirEntry, FileSystem};
use crate::types::Timestamp;

#[derive(Debug, Clone)]
enum MockEntry {
    File { contents: Vec<u8>, mtime: Timestamp },
    Dir,
}

#[derive(Debug, Default)]
struct MockState {
    entries: HashMap<PathBuf, MockEntry>,
    /// Remaining reads of a path that fail with `ResourceBusy`.
    busy: HashMap<PathBuf, u32>,
}

/// In-memory filesystem for tests.
///
/// Every write gets a fresh, strictly increasing mtime so tests never depend
/// on the resolution of the real clock. Reads of a path can be made to fail
/// with a "busy" error a fixed number of times to simulate a file still held
/// open by another process.
#[derive(Debug, Clone)]
pub struct MockFileSystem {
    state: Arc<Mutex<MockState>>,
    clock: Arc<AtomicI64>,
}

impl Default for MockFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFileSystem {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            clock: Arc::new(AtomicI64::new(1_000)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tick(&self) -> Timestamp {
        Timestamp(self.clock.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) -> Timestamp {
        let path = path.as_ref().to_path_buf();
        let mtime = self.tick();
        let mut state = self.lock();
        if let Some(parent) = path.parent() {
            ensure_dirs(&mut state.entries, parent);
        }
        state.entries.insert(
            path,
            MockEntry::File {
                contents: content.into(),
                mtime,
            },
        );
        mtime
    }

    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let mut state = self.lock();
        ensure_dirs(&mut state.entries, path.as_ref());
    }

    /// Make the next `count` reads of `path` fail with `ResourceBusy`.
    pub fn set_busy(&self, path: impl AsRef<Path>, count: u32) {
        self.lock().busy.insert(path.as_ref().to_path_buf(), count);
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.lock().entries.contains_key(path)
    }

    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        match self.lock().entries.get(path) {
            Some(MockEntry::File { contents, .. }) => Some(contents.clone()),
            _ => None,
        }
    }
}

fn ensure_dirs(entries: &mut HashMap<PathBuf, MockEntry>, dir: &Path) {
    let mut current = Some(dir);
    while let Some(d) = current {
        if d.as_os_str().is_empty() || entries.contains_key(d) {
            break;
        }
        entries.insert(d.to_path_buf(), MockEntry::Dir);
        current = d.parent();
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path.display()))
}

impl FileSystem for MockFileSystem {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let mut state = self.lock();
        if let Some(remaining) = state.busy.get_mut(path) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(io::Error::new(
                    io::ErrorKind::ResourceBusy,
                    format!("{} is busy", path.display()),
                ));
            }
        }
        match state.entries.get(path) {
            Some(MockEntry::File { contents, .. }) => Ok(contents.clone()),
            Some(MockEntry::Dir) => Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                format!("{} is a directory", path.display()),
            )),
            None => Err(not_found(path)),
        }
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mtime = self.tick();
        let mut state = self.lock();
        let parent_exists = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => {
                matches!(state.entries.get(p), Some(MockEntry::Dir))
            }
            _ => true,
        };
        if !parent_exists {
            return Err(not_found(path));
        }
        state.entries.insert(
            path.to_path_buf(),
            MockEntry::File {
                contents: contents.to_vec(),
                mtime,
            },
        );
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut state = self.lock();
        ensure_dirs(&mut state.entries, path);
        Ok(())
    }

    fn modified(&self, path: &Path) -> io::Result<Timestamp> {
        match self.lock().entries.get(path) {
            Some(MockEntry::File { mtime, .. }) => Ok(*mtime),
            Some(MockEntry::Dir) => Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                format!("{} is a directory", path.display()),
            )),
            None => Err(not_found(path)),
        }
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        let mut state = self.lock();
        match state.entries.get(path) {
            Some(MockEntry::File { .. }) => {
                state.entries.remove(path);
                Ok(())
            }
            Some(MockEntry::Dir) => Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                format!("{} is a directory", path.display()),
            )),
            None => Err(not_found(path)),
        }
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        let mut state = self.lock();
        if !matches!(state.entries.get(path), Some(MockEntry::Dir)) {
            return Err(not_found(path));
        }
        if state.entries.keys().any(|p| p.parent() == Some(path)) {
            return Err(io::Error::new(
                io::ErrorKind::DirectoryNotEmpty,
                format!("{} is not empty", path.display()),
            ));
        }
        state.entries.remove(path);
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let state = self.lock();
        if !matches!(state.entries.get(path), Some(MockEntry::Dir)) {
            return Err(not_found(path));
        }
        let mut entries: Vec<DirEntry> = state
            .entries
            .iter()
            .filter(|(p, _)| p.parent() == Some(path))
            .map(|(p, e)| DirEntry {
                path: p.clone(),
                is_dir: matches!(e, MockEntry::Dir),
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}
