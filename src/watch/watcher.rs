// src/watch/watcher.rs

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use notify::event::EventKind;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::engine::Engine;
use crate::errors::Result;
use crate::files::{FileKey, FileStore, FsEvent};
use crate::types::{FsEventKind, Timestamp};

/// Keeps the underlying `notify` watcher alive. Dropping it stops watching.
pub struct WatchHandle {
    _inner: RecommendedWatcher,
    dirs: Vec<PathBuf>,
}

impl WatchHandle {
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle").field("dirs", &self.dirs).finish()
    }
}

/// Watch every directory the store wants observed and post the resulting
/// events to `engine`.
pub(crate) fn start(engine: Engine, store: Arc<FileStore>) -> Result<WatchHandle> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if event_tx.send(event).is_err() {
                    trace!("watch loop gone, dropping notify event");
                }
            }
            Err(err) => warn!("file watch error: {err}"),
        },
        Config::default(),
    )?;

    let fs = store.filesystem();
    let mut dirs = Vec::new();
    for dir in store.watched_dirs() {
        fs.create_dir_all(&dir)?;
        watcher.watch(&dir, RecursiveMode::Recursive)?;
        dirs.push(dir);
    }
    info!(dirs = ?dirs, "file watcher started");

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if matches!(event.kind, EventKind::Access(_) | EventKind::Other) {
                continue;
            }
            for path in event.paths {
                let Some(key) = store.locate(&path) else {
                    continue;
                };
                for fs_event in describe(&store, &event.kind, path, key).await {
                    debug!(key = %fs_event.key, kind = ?fs_event.kind, "disk change");
                    if engine.post_fs_event(fs_event).is_err() {
                        debug!("engine stopped, ending watch loop");
                        return;
                    }
                }
            }
        }
        debug!("watch loop finished");
    });

    Ok(WatchHandle { _inner: watcher, dirs })
}

/// Stat the path so the event carries its new mtime. Directories are
/// dropped; a path that no longer exists is an unlink whatever notify said.
async fn describe(store: &FileStore, kind: &EventKind, path: PathBuf, key: FileKey) -> Vec<FsEvent> {
    let fs = store.filesystem();
    let Ok(stat) = tokio::task::spawn_blocking(move || fs.modified(&path)).await else {
        return Vec::new();
    };
    match stat {
        Ok(ts) => {
            let kind = match kind {
                EventKind::Create(_) => FsEventKind::Add,
                _ => FsEventKind::Change,
            };
            vec![FsEvent::new(kind, key, Some(ts))]
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => removed(store, key),
        Err(err) => {
            trace!(key = %key, "ignoring unstattable path: {err}");
            Vec::new()
        }
    }
}

/// Unlinks for a path that is gone. A removed directory arrives as a single
/// event, so it becomes one unlink per known file below it.
fn removed(store: &FileStore, key: FileKey) -> Vec<FsEvent> {
    let below = store.known_under(&key);
    let keys = if below.is_empty() { vec![key] } else { below };
    keys.into_iter()
        .map(|key| FsEvent::new(FsEventKind::Unlink, key, Some(Timestamp::DELETED)))
        .collect()
}
