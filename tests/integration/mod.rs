//! Integration test suite for foundry.
//!
//! These tests drive whole builds through the pipeline with scripted
//! collaborators, so no model server is needed.
//!
//! # Test Categories
//!
//! - `pipeline_e2e`: Full builds, failure propagation and the iteration cap
//! - `resume`: Interrupting a build and continuing from its snapshot
//! - `pool`: Worker pool ordering, admission bounds and the load monitor
//! - `resolution`: Role to model resolution and escalation

#![allow(dead_code)]

mod fixtures;

mod pipeline_e2e;
mod pool;
mod resolution;
mod resume;
