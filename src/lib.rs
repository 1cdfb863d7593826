//! Workplan - Petri-Net Workflow Execution Engine
//!
//! Executes manufacturing workplans modeled as Petri nets: tokens flow
//! through places and are moved, split, joined or handed to nested
//! workplans by transitions. A running workplan can be paused into a
//! serializable snapshot, nested workplans included, and resumed later in
//! another process.
//!
//! # Architecture
//!
//! The library is organized into three main modules:
//!
//! - [`workflow`]: Workplan definitions, YAML parsing and validation
//! - [`execution`]: Tokens, places, transitions and the engine
//! - [`monitoring`]: Event trace of a run
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use workplan::execution::{Engine, EngineEvent};
//! use workplan::load_workplan;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a workplan from YAML
//!     let workplan = load_workplan("housing.yaml")?;
//!
//!     // Build the engine and listen to its events
//!     let engine = Engine::new(Arc::new(workplan))?;
//!     let events = engine.subscribe();
//!     engine.start()?;
//!
//!     // Report every external activity as done on its primary output
//!     while let Ok(event) = events.try_recv() {
//!         if let EngineEvent::ActivityStarted { transition, token, .. } = event {
//!             engine.complete(&transition, token.id(), 0)?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use error::{EngineError, Result};
pub use execution::engine::{Engine, EngineStatus};
pub use execution::snapshot::WorkplanSnapshot;
pub use workflow::model::{PlaceDef, StepDef, Workplan};
pub use workflow::parser::load_workplan;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Workplan";
