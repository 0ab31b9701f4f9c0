//! Core domain models for foundry builds.
//!
//! Tasks, the plans they come from, and the dependency graph that orders
//! them into waves.

pub mod graph;
pub mod plan;
pub mod task;

pub use graph::TaskGraph;
pub use plan::{Plan, PlannedTask};
pub use task::{Task, TaskId, TaskStatus};
