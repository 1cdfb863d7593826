//! Workplan Parser
//!
//! Loads workplan definitions from YAML files. Nested sub-workflows are
//! written inline under their step and are validated together with the
//! parent.

use std::fs;
use std::path::Path;

use log::{debug, error, info};

use super::model::Workplan;
use super::validator::validate_workplan;
use crate::error::Result;

/// Parses and validates a workplan from YAML text.
pub fn parse_workplan(yaml_content: &str) -> Result<Workplan> {
    let workplan: Workplan = serde_yaml::from_str(yaml_content).map_err(|e| {
        error!("Failed to parse workplan YAML: {}", e);
        e
    })?;

    info!(
        "Parsed workplan '{}' v{}: {} places, {} steps",
        workplan.id,
        workplan.version,
        workplan.places.len(),
        workplan.steps.len()
    );

    validate_workplan(&workplan)?;
    Ok(workplan)
}

/// Loads a workplan from a YAML file.
///
/// This function:
/// 1. Reads and parses the YAML file
/// 2. Validates graph integrity, nested workplans included
///
/// # Example
///
/// ```rust,no_run
/// use workplan::workflow::load_workplan;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workplan = load_workplan("assembly.yaml")?;
///     println!("Loaded {} steps", workplan.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_workplan(path: impl AsRef<Path>) -> Result<Workplan> {
    let path = path.as_ref();
    info!("Loading workplan from: {}", path.display());

    let yaml_content = fs::read_to_string(path).map_err(|e| {
        error!("Failed to read workplan file '{}': {}", path.display(), e);
        e
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());
    parse_workplan(&yaml_content)
}

/// Saves a workplan to a YAML file.
pub fn save_workplan(workplan: &Workplan, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let yaml_content = serde_yaml::to_string(workplan)?;
    fs::write(path, yaml_content)?;
    info!("Workplan saved to: {}", path.display());
    Ok(())
}
