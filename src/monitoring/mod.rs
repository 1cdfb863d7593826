//! Monitoring Module
//!
//! Observes engine events during a run.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Timestamped event trace and firing counts

pub mod timeline;

pub use timeline::{ExecutionTimeline, TraceEvent, TraceKind};
