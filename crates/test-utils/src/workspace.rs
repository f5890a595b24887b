//! A throwaway project layout: `src/` (the source bucket), `state/` and a
//! `dev/` target, either in memory or in a temp directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use watchbuild::config::BuildConfig;
use watchbuild::fs::{FileSystem, MockFileSystem, RealFileSystem, write_with_mkdir};
use watchbuild::state::STATE_FILE_NAME;
use watchbuild::{BuildSystem, FileKey, FsEvent};

pub const TARGET: &str = "dev";

pub struct Workspace {
    root: PathBuf,
    fs: Arc<dyn FileSystem>,
    mock: Option<MockFileSystem>,
    _dir: Option<TempDir>,
}

impl Workspace {
    /// In-memory workspace with a deterministic clock.
    pub fn mock() -> Self {
        let mock = MockFileSystem::new();
        let root = PathBuf::from("/ws");
        mock.add_dir(root.join("src"));
        Self {
            root,
            fs: Arc::new(mock.clone()),
            mock: Some(mock),
            _dir: None,
        }
    }

    /// Workspace on the real filesystem, removed on drop.
    pub fn disk() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let root = dir.path().to_path_buf();
        std::fs::create_dir_all(root.join("src")).expect("create src dir");
        Self {
            root,
            fs: Arc::new(RealFileSystem),
            mock: None,
            _dir: Some(dir),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_dir(&self) -> PathBuf {
        self.root.join("src")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn target_dir(&self) -> PathBuf {
        self.root.join(TARGET)
    }

    pub fn fs(&self) -> Arc<dyn FileSystem> {
        Arc::clone(&self.fs)
    }

    /// The in-memory backend, for busy-read injection.
    pub fn mock_fs(&self) -> &MockFileSystem {
        self.mock.as_ref().expect("not a mock workspace")
    }

    pub fn config(&self) -> BuildConfig {
        BuildConfig::new(self.source_dir(), self.state_dir())
            .with_target(TARGET, self.target_dir())
            .validated()
            .expect("valid test config")
    }

    pub fn build_system(&self) -> BuildSystem {
        BuildSystem::new(self.config()).with_fs(self.fs())
    }

    pub fn write(&self, relative: &str, contents: &str) {
        write_with_mkdir(self.fs.as_ref(), &self.source_dir().join(relative), contents.as_bytes())
            .expect("write source file");
    }

    /// Drop a file straight into the `dev` target, outside any task.
    pub fn write_target(&self, relative: &str, contents: &str) {
        write_with_mkdir(self.fs.as_ref(), &self.target_dir().join(relative), contents.as_bytes())
            .expect("write target file");
    }

    pub fn remove(&self, relative: &str) {
        self.fs
            .remove_file(&self.source_dir().join(relative))
            .expect("remove source file");
    }

    pub fn read_target(&self, relative: &str) -> Option<String> {
        self.read(&self.target_dir().join(relative))
    }

    /// Output of a task without a target.
    pub fn read_task_out(&self, task: &str, relative: &str) -> Option<String> {
        self.read(&self.state_dir().join("tasks").join(task).join("out").join(relative))
    }

    pub fn state_file(&self, task: &str) -> PathBuf {
        self.state_dir().join("tasks").join(task).join(STATE_FILE_NAME)
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.fs.modified(path).is_ok() || self.fs.read_dir(path).is_ok()
    }

    fn read(&self, path: &Path) -> Option<String> {
        self.fs
            .read(path)
            .ok()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Event for a source file as it is now on disk.
    pub fn source_event(&self, relative: &str) -> FsEvent {
        let key = FileKey::source(relative);
        match self.fs.modified(&self.source_dir().join(relative)) {
            Ok(ts) => FsEvent::change(key).with_stat(ts),
            Err(_) => FsEvent::unlink(key),
        }
    }
}
