//! Transition Factory
//!
//! Turns step descriptors into live transitions. The engine calls the
//! factory once per step when it is built; sub-workflow steps hand the same
//! factory to their child engines so custom transitions work at any depth.

use std::sync::Arc;

use super::subworkflow::{IndexResolver, SubWorkflowTransition};
use super::task::TaskTransition;
use super::transition::{JoinTransition, PassTransition, SplitTransition, Transition};
use crate::error::Result;
use crate::workflow::model::{StepDef, StepKind};

/// Creates the live transition for a step.
pub trait TransitionFactory: Send + Sync {
    /// `nested` is the factory child engines are built with; pass it on to
    /// [`builtin_transition`] when delegating.
    fn create(&self, step: &StepDef, nested: &Arc<dyn TransitionFactory>) -> Result<Transition>;
}

/// Builds the built-in transition for every step kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransitionFactory;

impl TransitionFactory for DefaultTransitionFactory {
    fn create(&self, step: &StepDef, nested: &Arc<dyn TransitionFactory>) -> Result<Transition> {
        builtin_transition(step, nested)
    }
}

/// The built-in transition for a step's kind.
pub fn builtin_transition(step: &StepDef, nested: &Arc<dyn TransitionFactory>) -> Result<Transition> {
    let transition = match &step.kind {
        StepKind::Pass { output } => Transition::Pass(PassTransition::new(*output)),
        StepKind::Split => Transition::Split(SplitTransition),
        StepKind::Join => Transition::Join(JoinTransition::new(step.inputs.len())),
        StepKind::Task { activity } => Transition::Task(TaskTransition::new(activity.clone())),
        StepKind::SubWorkflow { workplan, results } => Transition::SubWorkflow(SubWorkflowTransition::new(
            Arc::clone(workplan),
            IndexResolver::new(workplan, results),
            Arc::clone(nested),
        )),
    };
    Ok(transition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{PlaceDef, Workplan};

    #[test]
    fn test_builtin_kinds() {
        let factory: Arc<dyn TransitionFactory> = Arc::new(DefaultTransitionFactory);
        let child = Arc::new(
            Workplan::new("child")
                .with_place(PlaceDef::start("s"))
                .with_place(PlaceDef::end("e")),
        );

        let steps = [
            (StepDef::pass("a"), "pass"),
            (StepDef::split("b"), "split"),
            (StepDef::join("c").with_input("x").with_input("y"), "join"),
            (StepDef::task("d", "weld"), "task"),
            (StepDef::sub_workflow("e", child), "sub_workflow"),
        ];

        for (step, kind) in steps {
            let transition = factory.create(&step, &factory).unwrap();
            assert_eq!(transition.kind(), kind);
        }
    }
}
