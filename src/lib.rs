//! foundry: turns a build plan into files with locally served models.
//!
//! A plan lists file-production tasks and their dependencies. The pipeline
//! orders them into waves, picks a model per role from the workload's
//! classification, and runs generate, review, verify and fix rounds through
//! an adaptive worker pool until every task is verified, failed or skipped.

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod models;
pub mod orchestration;
pub mod state;
pub mod util;

pub use config::Config;
pub use error::{Error, Result};
