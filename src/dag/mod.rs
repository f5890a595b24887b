// src/dag/mod.rs

//! The task graph.
//!
//! - [`task`] has the caller-facing [`TaskDef`] builder and the resolved
//!   [`TaskSpec`].
//! - [`graph`] validates registrations and answers dependency questions.

pub mod graph;
pub mod task;

pub use graph::TaskGraph;
pub use task::{InputGlob, TaskDef, TaskSpec};
