//! Workplan Validation
//!
//! Graph-integrity checks performed before an engine is built:
//! - Place and step identity (non-empty, unique)
//! - Exactly one start place and at least one terminal place
//! - Every connector names an existing place
//! - Per-kind connector arity
//! - Nested workplans, recursively, including result mapping

use std::collections::HashSet;

use log::{debug, info};
use thiserror::Error;

use super::model::{PlaceRole, StepDef, StepKind, Workplan};
use crate::error::{EngineError, Result};
use crate::execution::subworkflow::IndexResolver;

/// A single integrity problem found in a workplan.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Workplan has no places")]
    EmptyWorkplan,

    #[error("Place has empty or whitespace-only ID")]
    EmptyPlaceId,

    #[error("Step has empty or whitespace-only ID")]
    EmptyStepId,

    #[error("Duplicate place ID: '{0}'")]
    DuplicatePlace(String),

    #[error("Duplicate step ID: '{0}'")]
    DuplicateStep(String),

    #[error("Workplan has no start place")]
    NoStartPlace,

    #[error("Workplan has {0} start places, expected exactly one")]
    MultipleStartPlaces(usize),

    #[error("Workplan has no terminal place")]
    NoTerminalPlace,

    #[error("Step '{step}' references unknown place '{place}'")]
    UnknownPlace { step: String, place: String },

    #[error("Step '{step}' ({kind}) {problem}")]
    BadArity {
        step: String,
        kind: &'static str,
        problem: String,
    },

    #[error("Sub-workflow '{step}' cannot map child terminal place '{place}' to an output")]
    UnresolvedTerminal { step: String, place: String },

    #[error("Sub-workflow '{step}' maps child terminal place '{place}' to missing output {index}")]
    ResultOutOfRange {
        step: String,
        place: String,
        index: usize,
    },

    #[error("Nested workplan of '{step}': {issue}")]
    Nested {
        step: String,
        issue: Box<ValidationError>,
    },
}

/// Validates the connector arity of one step.
fn validate_arity(step: &StepDef) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let kind = step.kind.name();
    let inputs = step.inputs.len();
    let outputs = step.outputs.len();

    let mut problem = |text: String| {
        errors.push(ValidationError::BadArity {
            step: step.id.clone(),
            kind,
            problem: text,
        })
    };

    match &step.kind {
        StepKind::Pass { output } => {
            if inputs != 1 {
                problem(format!("needs exactly 1 input, has {}", inputs));
            }
            if *output >= outputs {
                problem(format!("forwards to output {} but has {} outputs", output, outputs));
            }
        }
        StepKind::Split => {
            if inputs != 1 {
                problem(format!("needs exactly 1 input, has {}", inputs));
            }
            if outputs == 0 {
                problem("needs at least 1 output".to_string());
            }
        }
        StepKind::Join => {
            if inputs == 0 {
                problem("needs at least 1 input".to_string());
            }
            if outputs != 1 {
                problem(format!("needs exactly 1 output, has {}", outputs));
            }
        }
        StepKind::SubWorkflow { .. } | StepKind::Task { .. } => {
            if inputs != 1 {
                problem(format!("needs exactly 1 input, has {}", inputs));
            }
            if outputs == 0 {
                problem("needs at least 1 output".to_string());
            }
        }
    }

    errors
}

/// Validates a nested workplan and its mapping onto the parent step.
fn validate_nested(step: &StepDef) -> Vec<ValidationError> {
    let StepKind::SubWorkflow { workplan, results } = &step.kind else {
        return Vec::new();
    };

    let nested = collect_issues(workplan);
    if !nested.is_empty() {
        return nested
            .into_iter()
            .map(|issue| ValidationError::Nested {
                step: step.id.clone(),
                issue: Box::new(issue),
            })
            .collect();
    }

    let resolver = IndexResolver::new(workplan, results);
    let mut errors = Vec::new();
    for terminal in workplan.terminal_places() {
        match resolver.resolve(&terminal.id) {
            None => errors.push(ValidationError::UnresolvedTerminal {
                step: step.id.clone(),
                place: terminal.id.clone(),
            }),
            Some(index) if index >= step.outputs.len() => {
                errors.push(ValidationError::ResultOutOfRange {
                    step: step.id.clone(),
                    place: terminal.id.clone(),
                    index,
                })
            }
            Some(_) => {}
        }
    }
    errors
}

/// Collects every integrity issue in a workplan.
fn collect_issues(workplan: &Workplan) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if workplan.places.is_empty() {
        errors.push(ValidationError::EmptyWorkplan);
        return errors;
    }

    let mut place_ids: HashSet<&str> = HashSet::new();
    for place in &workplan.places {
        if place.id.trim().is_empty() {
            errors.push(ValidationError::EmptyPlaceId);
        } else if !place_ids.insert(place.id.as_str()) {
            errors.push(ValidationError::DuplicatePlace(place.id.clone()));
        }
    }

    let starts = workplan
        .places
        .iter()
        .filter(|p| p.role == PlaceRole::Start)
        .count();
    match starts {
        0 => errors.push(ValidationError::NoStartPlace),
        1 => {}
        n => errors.push(ValidationError::MultipleStartPlaces(n)),
    }

    if workplan.terminal_places().is_empty() {
        errors.push(ValidationError::NoTerminalPlace);
    }

    let mut step_ids: HashSet<&str> = HashSet::new();
    for step in &workplan.steps {
        if step.id.trim().is_empty() {
            errors.push(ValidationError::EmptyStepId);
            continue;
        }
        if !step_ids.insert(step.id.as_str()) {
            errors.push(ValidationError::DuplicateStep(step.id.clone()));
        }

        for place in step.inputs.iter().chain(step.outputs.iter()) {
            if !place_ids.contains(place.as_str()) {
                errors.push(ValidationError::UnknownPlace {
                    step: step.id.clone(),
                    place: place.clone(),
                });
            }
        }

        errors.extend(validate_arity(step));
        errors.extend(validate_nested(step));
    }

    for place in &workplan.places {
        if place.role != PlaceRole::End && workplan.consumers_of(&place.id).is_empty() {
            debug!("Place '{}' has no consuming step", place.id);
        }
    }

    errors
}

/// Validates a workplan's structure.
///
/// Returns `EngineError::InvalidWorkplan` listing every issue found, so
/// authors can fix a definition in one pass.
pub fn validate_workplan(workplan: &Workplan) -> Result<()> {
    info!(
        "Validating workplan '{}' v{} ({} places, {} steps)",
        workplan.id,
        workplan.version,
        workplan.places.len(),
        workplan.steps.len()
    );

    let issues = collect_issues(workplan);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(EngineError::InvalidWorkplan {
            workplan: workplan.id.clone(),
            issues,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::PlaceDef;
    use std::sync::Arc;

    fn issues_of(workplan: &Workplan) -> Vec<ValidationError> {
        match validate_workplan(workplan) {
            Err(EngineError::InvalidWorkplan { issues, .. }) => issues,
            Ok(()) => Vec::new(),
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    fn fork_join() -> Workplan {
        Workplan::new("fork_join")
            .with_place(PlaceDef::start("start"))
            .with_place(PlaceDef::new("a"))
            .with_place(PlaceDef::new("b"))
            .with_place(PlaceDef::end("done"))
            .with_step(
                StepDef::split("fan_out")
                    .with_input("start")
                    .with_output("a")
                    .with_output("b"),
            )
            .with_step(
                StepDef::join("fan_in")
                    .with_input("a")
                    .with_input("b")
                    .with_output("done"),
            )
    }

    #[test]
    fn test_valid_workplan() {
        assert!(validate_workplan(&fork_join()).is_ok());
    }

    #[test]
    fn test_empty_workplan() {
        assert_eq!(issues_of(&Workplan::new("empty")), vec![ValidationError::EmptyWorkplan]);
    }

    #[test]
    fn test_unknown_place_reference() {
        let plan = fork_join().with_step(StepDef::pass("stray").with_input("nowhere").with_output("done"));
        let issues = issues_of(&plan);
        assert!(issues.contains(&ValidationError::UnknownPlace {
            step: "stray".to_string(),
            place: "nowhere".to_string(),
        }));
    }

    #[test]
    fn test_start_and_terminal_rules() {
        let plan = Workplan::new("bad")
            .with_place(PlaceDef::start("s1"))
            .with_place(PlaceDef::start("s2"));
        let issues = issues_of(&plan);
        assert!(issues.contains(&ValidationError::MultipleStartPlaces(2)));
        assert!(issues.contains(&ValidationError::NoTerminalPlace));

        let plan = Workplan::new("bad").with_place(PlaceDef::end("e"));
        assert!(issues_of(&plan).contains(&ValidationError::NoStartPlace));
    }

    #[test]
    fn test_duplicates() {
        let plan = fork_join()
            .with_place(PlaceDef::new("a"))
            .with_step(StepDef::pass("fan_in").with_input("a").with_output("done"));
        let issues = issues_of(&plan);
        assert!(issues.contains(&ValidationError::DuplicatePlace("a".to_string())));
        assert!(issues.contains(&ValidationError::DuplicateStep("fan_in".to_string())));
    }

    #[test]
    fn test_arity_rules() {
        let plan = fork_join()
            .with_step(StepDef::pass_to("skip", 1).with_input("a").with_output("done"))
            .with_step(StepDef::join("wide").with_input("a").with_output("done").with_output("b"));
        let issues = issues_of(&plan);
        assert_eq!(issues.len(), 2);
        assert!(issues
            .iter()
            .all(|i| matches!(i, ValidationError::BadArity { .. })));
    }

    #[test]
    fn test_nested_issues_are_prefixed() {
        let child = Workplan::new("child").with_place(PlaceDef::start("s"));
        let plan = fork_join().with_step(
            StepDef::sub_workflow("nested", Arc::new(child))
                .with_input("a")
                .with_output("done"),
        );
        let issues = issues_of(&plan);
        assert!(issues.iter().any(|i| matches!(
            i,
            ValidationError::Nested { step, issue } if step == "nested" && **issue == ValidationError::NoTerminalPlace
        )));
    }

    #[test]
    fn test_nested_result_mapping() {
        let child = Workplan::new("child")
            .with_place(PlaceDef::start("s"))
            .with_place(PlaceDef::end("ok").with_classification("Success"))
            .with_place(PlaceDef::end("nok").with_classification("Failure"))
            .with_step(StepDef::task("check", "inspect").with_input("s").with_output("ok").with_output("nok"));
        let child = Arc::new(child);

        let single_output = fork_join().with_step(
            StepDef::sub_workflow("nested", Arc::clone(&child))
                .with_input("a")
                .with_output("done"),
        );
        let issues = issues_of(&single_output);
        assert!(issues.contains(&ValidationError::ResultOutOfRange {
            step: "nested".to_string(),
            place: "nok".to_string(),
            index: 1,
        }));

        let partial = fork_join().with_step(
            StepDef::sub_workflow("nested", child)
                .with_result("Success", 0)
                .with_input("a")
                .with_output("done"),
        );
        assert!(issues_of(&partial).contains(&ValidationError::UnresolvedTerminal {
            step: "nested".to_string(),
            place: "nok".to_string(),
        }));
    }
}
