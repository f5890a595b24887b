// src/config/mod.rs

//! Engine configuration.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate basic invariants such as bucket naming and limits (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path};
pub use model::{BuildConfig, IoSection, LimitsSection, RawBuildConfig, SOURCE_BUCKET};
pub use validate::is_valid_bucket_name;
