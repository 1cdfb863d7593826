//! Task and Custom Transitions
//!
//! A task transition hands a token to an external activity and waits for
//! its result; the engine's caller reports completion together with the
//! chosen output. Custom transitions plug domain routing into the engine
//! through a [`TransitionFactory`](super::factory::TransitionFactory).

use log::{debug, info};

use super::event::{EngineEvent, TransitionRef};
use super::snapshot::{RestoredTokens, TokenTable, TransitionStateSnapshot};
use super::token::{Token, TokenId};
use super::transition::FiringContext;
use crate::error::{EngineError, Result};

/// Waits for an external activity per consumed token.
#[derive(Debug, Clone)]
pub struct TaskTransition {
    activity: String,
    held: Vec<Token>,
}

impl TaskTransition {
    pub fn new(activity: impl Into<String>) -> Self {
        Self {
            activity: activity.into(),
            held: Vec::new(),
        }
    }

    pub fn activity(&self) -> &str {
        &self.activity
    }

    /// Tokens whose activity is still running.
    pub fn held(&self) -> &[Token] {
        &self.held
    }

    pub(crate) fn on_input_token_added(&mut self, ctx: &mut FiringContext<'_>, input: usize, token: &Token) -> Result<()> {
        if !ctx.holds(input, token) {
            return Ok(());
        }
        if !ctx.fire(&[(input, token.clone())], Vec::new())? {
            return Ok(());
        }

        info!("Activity '{}' started for token {}", self.activity, token.id());
        self.held.push(token.clone());
        self.announce(ctx, token.clone());
        Ok(())
    }

    fn announce(&self, ctx: &mut FiringContext<'_>, token: Token) {
        ctx.raise(EngineEvent::ActivityStarted {
            transition: TransitionRef::local(ctx.step()),
            activity: self.activity.clone(),
            token,
        });
    }

    /// Releases a held token to `output` once its activity is done.
    ///
    /// Nothing changes when the output does not exist.
    pub(crate) fn complete(&mut self, ctx: &mut FiringContext<'_>, token: TokenId, output: usize) -> Result<()> {
        let position = self
            .held
            .iter()
            .position(|held| held.id() == token)
            .ok_or_else(|| EngineError::NotAwaiting {
                step: ctx.step().to_string(),
                token,
            })?;

        if output >= ctx.output_count() {
            return Err(EngineError::InvalidOutput {
                step: ctx.step().to_string(),
                index: output,
                available: ctx.output_count(),
            });
        }

        let released = self.held.remove(position);
        debug!(
            "Activity '{}' finished for token {}, releasing to output {}",
            self.activity, token, output
        );
        ctx.produce(output, released)
    }

    /// Announces every running activity again.
    pub(crate) fn resume(&self, ctx: &mut FiringContext<'_>) {
        for token in &self.held {
            self.announce(ctx, token.clone());
        }
    }

    pub(crate) fn capture(&self, table: &mut TokenTable) -> Option<TransitionStateSnapshot> {
        if self.held.is_empty() {
            return None;
        }
        Some(TransitionStateSnapshot::Task {
            held: self.held.iter().map(|t| table.register(t)).collect(),
        })
    }

    pub(crate) fn restore(&mut self, held: &[TokenId], tokens: &RestoredTokens) -> Result<()> {
        self.held = held
            .iter()
            .map(|id| tokens.resolve(*id))
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }
}

/// Domain routing for a single-input transition.
///
/// `route` picks the output the token is forwarded to. An `Err` aborts the
/// firing before anything is consumed.
pub trait CustomTransition: Send {
    fn route(&mut self, token: &Token) -> std::result::Result<usize, String>;
}

impl<F> CustomTransition for F
where
    F: FnMut(&Token) -> std::result::Result<usize, String> + Send,
{
    fn route(&mut self, token: &Token) -> std::result::Result<usize, String> {
        self(token)
    }
}

pub(crate) fn fire_custom(
    custom: &mut dyn CustomTransition,
    ctx: &mut FiringContext<'_>,
    input: usize,
    token: &Token,
) -> Result<()> {
    if !ctx.holds(input, token) {
        return Ok(());
    }

    let output = custom.route(token).map_err(|reason| EngineError::TransitionFailed {
        step: ctx.step().to_string(),
        reason,
    })?;
    if output >= ctx.output_count() {
        return Err(EngineError::TransitionFailed {
            step: ctx.step().to_string(),
            reason: format!("routed to output {} of {}", output, ctx.output_count()),
        });
    }

    ctx.fire(&[(input, token.clone())], vec![(output, token.clone())])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::place::Place;
    use crate::workflow::model::PlaceDef;
    use std::sync::Mutex;

    fn places() -> Vec<Place> {
        ["queue", "good", "bad"]
            .iter()
            .map(|id| Place::new(&PlaceDef::new(*id)))
            .collect()
    }

    #[test]
    fn test_task_holds_token_until_completed() {
        let places = places();
        let commit = Mutex::new(());
        let (inputs, outputs) = (vec![0], vec![1, 2]);
        let mut task = TaskTransition::new("inspect");
        let token = Token::new();
        places[0].add(token.clone());

        let mut ctx = FiringContext::new("check", &inputs, &outputs, &places, &commit);
        task.on_input_token_added(&mut ctx, 0, &token).unwrap();
        let (produced, events) = ctx.finish();

        assert!(produced.is_empty());
        assert!(places[0].is_empty());
        assert_eq!(task.held(), &[token.clone()]);
        assert!(matches!(events[0], EngineEvent::TransitionTriggered { .. }));
        match &events[1] {
            EngineEvent::ActivityStarted { transition, activity, token: started } => {
                assert_eq!(transition.to_string(), "check");
                assert_eq!(activity, "inspect");
                assert_eq!(started, &token);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let mut ctx = FiringContext::new("check", &inputs, &outputs, &places, &commit);
        let result = task.complete(&mut ctx, token.id(), 5);
        assert!(matches!(result, Err(EngineError::InvalidOutput { index: 5, available: 2, .. })));
        assert_eq!(task.held().len(), 1);

        task.complete(&mut ctx, token.id(), 1).unwrap();
        assert!(task.held().is_empty());
        assert!(places[2].contains(&token));
        assert_eq!(ctx.finish().0.len(), 1);
    }

    #[test]
    fn test_complete_unknown_token() {
        let places = places();
        let commit = Mutex::new(());
        let (inputs, outputs) = (vec![0], vec![1]);
        let mut task = TaskTransition::new("inspect");

        let mut ctx = FiringContext::new("check", &inputs, &outputs, &places, &commit);
        let result = task.complete(&mut ctx, TokenId::new(), 0);
        assert!(matches!(result, Err(EngineError::NotAwaiting { .. })));
    }

    #[test]
    fn test_resume_announces_running_activities() {
        let places = places();
        let commit = Mutex::new(());
        let (inputs, outputs) = (vec![0], vec![1]);
        let mut task = TaskTransition::new("inspect");
        task.held.push(Token::new());
        task.held.push(Token::new());

        let mut ctx = FiringContext::new("check", &inputs, &outputs, &places, &commit);
        task.resume(&mut ctx);
        let events = ctx.finish().1;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| matches!(e, EngineEvent::ActivityStarted { .. })));
    }

    #[test]
    fn test_custom_routing() {
        let places = places();
        let commit = Mutex::new(());
        let (inputs, outputs) = (vec![0], vec![1, 2]);
        let token = Token::new();
        places[0].add(token.clone());

        let mut router = |_: &Token| -> std::result::Result<usize, String> { Ok(1) };
        let mut ctx = FiringContext::new("route", &inputs, &outputs, &places, &commit);
        fire_custom(&mut router, &mut ctx, 0, &token).unwrap();
        assert!(places[2].contains(&token));
    }

    #[test]
    fn test_custom_failure_leaves_token_in_place() {
        let places = places();
        let commit = Mutex::new(());
        let (inputs, outputs) = (vec![0], vec![1]);
        let token = Token::new();
        places[0].add(token.clone());

        let mut failing = |_: &Token| -> std::result::Result<usize, String> { Err("scanner offline".to_string()) };
        let mut ctx = FiringContext::new("route", &inputs, &outputs, &places, &commit);
        let result = fire_custom(&mut failing, &mut ctx, 0, &token);
        assert!(matches!(result, Err(EngineError::TransitionFailed { .. })));
        assert!(places[0].contains(&token));

        let mut lost = |_: &Token| -> std::result::Result<usize, String> { Ok(3) };
        let result = fire_custom(&mut lost, &mut ctx, 0, &token);
        assert!(matches!(result, Err(EngineError::TransitionFailed { .. })));
        assert!(places[0].contains(&token));
    }
}
