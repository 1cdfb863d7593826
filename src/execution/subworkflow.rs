//! Sub-Workflow Transitions
//!
//! A sub-workflow step runs a nested workplan in a child engine it owns. The
//! parent token is consumed when the child starts and is forwarded to the
//! output mapped from the child's terminal place once the child completes.
//! Only one child runs at a time; further tokens wait in the input place.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};

use super::engine::Engine;
use super::event::{EngineEvent, TransitionRef};
use super::factory::TransitionFactory;
use super::snapshot::{TokenTable, TransitionStateSnapshot, WorkplanSnapshot};
use super::token::{Token, TokenId};
use super::transition::FiringContext;
use crate::error::{EngineError, Result};
use crate::workflow::model::Workplan;

/// Maps terminal places of a nested workplan to output indices.
///
/// Lookup order for a terminal place: an explicit entry for its id, then
/// an explicit entry for its classification. Without any explicit entries
/// the terminals map to outputs in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexResolver {
    by_place: BTreeMap<String, usize>,
}

impl IndexResolver {
    pub fn new(child: &Workplan, explicit: &BTreeMap<String, usize>) -> Self {
        let by_place = child
            .terminal_places()
            .into_iter()
            .enumerate()
            .filter_map(|(position, place)| {
                let index = if explicit.is_empty() {
                    Some(position)
                } else {
                    explicit.get(&place.id).or_else(|| {
                        place
                            .classification
                            .as_ref()
                            .and_then(|label| explicit.get(label))
                    })
                    .copied()
                };
                index.map(|index| (place.id.clone(), index))
            })
            .collect();

        Self { by_place }
    }

    /// Output index for a terminal place id.
    pub fn resolve(&self, place: &str) -> Option<usize> {
        self.by_place.get(place).copied()
    }
}

struct ChildRun {
    token: Token,
    engine: Engine,
}

/// Runs a nested workplan as one atomic step.
pub struct SubWorkflowTransition {
    workplan: Arc<Workplan>,
    resolver: IndexResolver,
    factory: Arc<dyn TransitionFactory>,
    running: Option<ChildRun>,
}

impl SubWorkflowTransition {
    pub fn new(workplan: Arc<Workplan>, resolver: IndexResolver, factory: Arc<dyn TransitionFactory>) -> Self {
        Self {
            workplan,
            resolver,
            factory,
            running: None,
        }
    }

    pub fn workplan(&self) -> &Arc<Workplan> {
        &self.workplan
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// The parent token the running child works on.
    pub fn current_token(&self) -> Option<&Token> {
        self.running.as_ref().map(|run| &run.token)
    }

    pub fn child(&self) -> Option<&Engine> {
        self.running.as_ref().map(|run| &run.engine)
    }

    pub(crate) fn on_input_token_added(&mut self, ctx: &mut FiringContext<'_>, input: usize, token: &Token) -> Result<()> {
        if self.running.is_some() {
            debug!(
                "Sub-workflow '{}' busy, token {} waits",
                ctx.step(),
                token.id()
            );
            return Ok(());
        }
        if !ctx.holds(input, token) {
            return Ok(());
        }
        self.launch(ctx, token.clone())
    }

    /// Starts a child for `token`, then for every token that is still
    /// waiting whenever a child completes synchronously.
    fn launch(&mut self, ctx: &mut FiringContext<'_>, token: Token) -> Result<()> {
        let mut next = Some(token);
        while let Some(token) = next.take() {
            if !ctx.fire(&[(0, token.clone())], Vec::new())? {
                return Ok(());
            }

            let engine = Engine::with_factory(Arc::clone(&self.workplan), Arc::clone(&self.factory))?;
            let start = match token.effective_payload() {
                Some(payload) => Token::with_payload(payload.clone()),
                None => Token::new(),
            };
            info!(
                "Sub-workflow '{}' starting '{}' for token {}",
                ctx.step(),
                self.workplan.id,
                token.id()
            );

            let mut events = Vec::new();
            let outcome = engine.start_into(start, &mut events);
            self.running = Some(ChildRun { token, engine });
            let completed = self.absorb(ctx, events)?;
            outcome?;

            if completed {
                next = ctx.waiting(0);
            }
        }
        Ok(())
    }

    /// Re-raises child events under this step and forwards the parent token
    /// when the child completed. Returns true on completion.
    fn absorb(&mut self, ctx: &mut FiringContext<'_>, events: Vec<EngineEvent>) -> Result<bool> {
        let mut completed = false;
        for event in events {
            match event {
                EngineEvent::Completed { place, .. } => {
                    let output = self.resolver.resolve(&place).ok_or_else(|| EngineError::UnresolvedTerminal {
                        step: ctx.step().to_string(),
                        place: place.clone(),
                    })?;
                    let Some(run) = self.running.take() else {
                        warn!("Sub-workflow '{}' completed without a parent token", ctx.step());
                        continue;
                    };

                    info!(
                        "Sub-workflow '{}' finished at '{}', forwarding token {} to output {}",
                        ctx.step(),
                        place,
                        run.token.id(),
                        output
                    );
                    ctx.produce(output, run.token)?;
                    completed = true;
                }
                other => {
                    if let Some(nested) = other.nested_in(ctx.step()) {
                        ctx.raise(nested);
                    }
                }
            }
        }
        Ok(completed)
    }

    /// Forwards an activity completion to the running child.
    pub(crate) fn forward(
        &mut self,
        ctx: &mut FiringContext<'_>,
        target: &TransitionRef,
        token: TokenId,
        output: usize,
    ) -> Result<()> {
        let run = self.running.as_ref().ok_or_else(|| EngineError::NotAwaiting {
            step: target.to_string(),
            token,
        })?;

        let mut events = Vec::new();
        let outcome = run.engine.complete_into(target, token, output, &mut events);
        let completed = self.absorb(ctx, events)?;
        outcome?;

        match ctx.waiting(0) {
            Some(next) if completed => self.launch(ctx, next),
            _ => Ok(()),
        }
    }

    pub(crate) fn resume(&mut self, ctx: &mut FiringContext<'_>) -> Result<()> {
        let Some(run) = &self.running else {
            return Ok(());
        };

        let mut events = Vec::new();
        let outcome = run.engine.resume_into(&mut events);
        let completed = self.absorb(ctx, events)?;
        outcome?;

        match ctx.waiting(0) {
            Some(next) if completed => self.launch(ctx, next),
            _ => Ok(()),
        }
    }

    pub(crate) fn capture(&mut self, table: &mut TokenTable) -> Result<Option<TransitionStateSnapshot>> {
        let Some(run) = &self.running else {
            return Ok(None);
        };

        let child = run.engine.pause()?;
        Ok(Some(TransitionStateSnapshot::SubWorkflow {
            token: table.register(&run.token),
            child: Box::new(child),
        }))
    }

    pub(crate) fn restore(&mut self, token: Token, child: &WorkplanSnapshot) -> Result<()> {
        let engine = Engine::with_factory(Arc::clone(&self.workplan), Arc::clone(&self.factory))?;
        engine.restore(child)?;
        self.running = Some(ChildRun { token, engine });
        Ok(())
    }

    pub(crate) fn dispose(&mut self) {
        if let Some(run) = self.running.take() {
            run.engine.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{PlaceDef, StepDef};

    fn inspection() -> Workplan {
        Workplan::new("inspection")
            .with_place(PlaceDef::start("in"))
            .with_place(PlaceDef::end("passed").with_classification("Success"))
            .with_place(PlaceDef::end("failed").with_classification("Failure"))
            .with_place(PlaceDef::end("rework").with_classification("Failure"))
            .with_step(
                StepDef::task("measure", "measure")
                    .with_input("in")
                    .with_output("passed")
                    .with_output("failed"),
            )
    }

    #[test]
    fn test_resolver_defaults_to_declaration_order() {
        let resolver = IndexResolver::new(&inspection(), &BTreeMap::new());
        assert_eq!(resolver.resolve("passed"), Some(0));
        assert_eq!(resolver.resolve("failed"), Some(1));
        assert_eq!(resolver.resolve("rework"), Some(2));
        assert_eq!(resolver.resolve("in"), None);
    }

    #[test]
    fn test_resolver_uses_classification() {
        let mut explicit = BTreeMap::new();
        explicit.insert("Success".to_string(), 0);
        explicit.insert("Failure".to_string(), 1);

        let resolver = IndexResolver::new(&inspection(), &explicit);
        assert_eq!(resolver.resolve("passed"), Some(0));
        assert_eq!(resolver.resolve("failed"), Some(1));
        assert_eq!(resolver.resolve("rework"), Some(1));
    }

    #[test]
    fn test_resolver_place_id_wins_over_classification() {
        let mut explicit = BTreeMap::new();
        explicit.insert("Failure".to_string(), 1);
        explicit.insert("rework".to_string(), 2);

        let resolver = IndexResolver::new(&inspection(), &explicit);
        assert_eq!(resolver.resolve("rework"), Some(2));
        assert_eq!(resolver.resolve("failed"), Some(1));
        assert_eq!(resolver.resolve("passed"), None);
    }
}
