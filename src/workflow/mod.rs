//! Workplan Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! validating workplans: places, steps and their connectors.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (PlaceDef, StepDef, Workplan)
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Integrity rules checked before an engine is built

pub mod model;
pub mod parser;
pub mod validator;

pub use model::{PlaceDef, PlaceRole, StepDef, StepKind, Workplan};
pub use parser::{load_workplan, parse_workplan, save_workplan};
pub use validator::{validate_workplan, ValidationError};
