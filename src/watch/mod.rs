// src/watch/mod.rs

//! Turning disk changes into [`crate::files::FsEvent`]s.
//!
//! The watcher knows nothing about tasks; it maps paths to keys through the
//! file store and hands every event to the engine, which decides whether it
//! matters.

pub mod path_utils;
pub mod watcher;

pub use watcher::WatchHandle;
