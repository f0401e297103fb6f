//! Build orchestration.
//!
//! - [`context`] - Work directory and per-architecture paths
//! - [`pipeline`] - Per-architecture state machine, sequential or parallel
//! - [`report`] - Build results and the JSON report

pub mod context;
pub mod pipeline;
pub mod report;
