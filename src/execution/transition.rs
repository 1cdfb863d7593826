//! Transitions
//!
//! The polymorphic unit of behavior, modeled as a closed enum. Every variant
//! reacts to a token arriving on one of its input places through
//! `on_input_token_added`, which runs under the transition's own mutex. A
//! firing is committed through [`FiringContext::fire`]: removal of every
//! consumed token and insertion of every produced token happen as one unit
//! under the engine's commit lock.
//!
//! Lifecycle of a transition instance:
//!
//! ```text
//! Created -> Initialized -> Active <-> Paused
//!                              \
//!                               -> Disposed
//! ```

use std::fmt;
use std::sync::Mutex;

use log::debug;

use super::event::{EngineEvent, TransitionRef};
use super::lock;
use super::place::Place;
use super::snapshot::{JoinGenerationSnapshot, RestoredTokens, TokenTable, TransitionStateSnapshot};
use super::subworkflow::SubWorkflowTransition;
use super::task::{fire_custom, CustomTransition, TaskTransition};
use super::token::Token;
use crate::error::{EngineError, Result};

/// Lifecycle state of a transition instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionState {
    Created,
    Initialized,
    Active,
    Paused,
    Disposed,
}

/// View of the net handed to a transition while it reacts to a token.
///
/// Input and output indices are connector positions of the transition, not
/// place indices of the engine.
pub struct FiringContext<'a> {
    step: &'a str,
    inputs: &'a [usize],
    outputs: &'a [usize],
    places: &'a [Place],
    commit: &'a Mutex<()>,
    produced: Vec<(usize, Token)>,
    events: Vec<EngineEvent>,
}

impl<'a> FiringContext<'a> {
    pub(crate) fn new(
        step: &'a str,
        inputs: &'a [usize],
        outputs: &'a [usize],
        places: &'a [Place],
        commit: &'a Mutex<()>,
    ) -> Self {
        Self {
            step,
            inputs,
            outputs,
            places,
            commit,
            produced: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Id of the step being fired.
    pub fn step(&self) -> &str {
        self.step
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// True if the place behind `input` currently holds `token`.
    pub fn holds(&self, input: usize, token: &Token) -> bool {
        self.inputs
            .get(input)
            .map(|&place| self.places[place].contains(token))
            .unwrap_or(false)
    }

    /// A token waiting on `input`, if any.
    pub fn waiting(&self, input: usize) -> Option<Token> {
        self.inputs
            .get(input)
            .and_then(|&place| self.places[place].first())
    }

    fn output_place(&self, output: usize) -> Result<usize> {
        self.outputs
            .get(output)
            .copied()
            .ok_or_else(|| EngineError::InvalidOutput {
                step: self.step.to_string(),
                index: output,
                available: self.outputs.len(),
            })
    }

    /// Atomically consumes `consume` from the inputs and adds `produce` to
    /// the outputs, then raises `TransitionTriggered`.
    ///
    /// Returns `Ok(false)` without mutating anything when a consumed token
    /// is no longer held, i.e. a competing consumer fired first.
    pub fn fire(&mut self, consume: &[(usize, Token)], produce: Vec<(usize, Token)>) -> Result<bool> {
        let targets = produce
            .iter()
            .map(|(output, _)| self.output_place(*output))
            .collect::<Result<Vec<_>>>()?;

        {
            let _commit = lock(self.commit);

            if let Some((input, token)) = consume.iter().find(|(input, token)| !self.holds(*input, token)) {
                debug!(
                    "Transition '{}' lost token {} on input {} to another consumer",
                    self.step,
                    token.id(),
                    input
                );
                return Ok(false);
            }

            for (input, token) in consume {
                self.places[self.inputs[*input]].remove(token)?;
            }
            for (place, (_, token)) in targets.into_iter().zip(produce) {
                self.places[place].add(token.clone());
                self.produced.push((place, token));
            }
        }

        self.events.push(EngineEvent::TransitionTriggered {
            transition: TransitionRef::local(self.step),
        });
        Ok(true)
    }

    /// Adds a previously consumed token to an output place.
    ///
    /// Used by transitions that finish asynchronously; raises no
    /// `TransitionTriggered` of its own.
    pub fn produce(&mut self, output: usize, token: Token) -> Result<()> {
        let place = self.output_place(output)?;
        let _commit = lock(self.commit);
        self.places[place].add(token.clone());
        self.produced.push((place, token));
        Ok(())
    }

    /// Queues an event for the engine's subscribers.
    pub fn raise(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    /// Tokens added to places (by place index) and events raised.
    pub(crate) fn finish(self) -> (Vec<(usize, Token)>, Vec<EngineEvent>) {
        (self.produced, self.events)
    }
}

/// Forwards the token unchanged to one output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassTransition {
    output: usize,
}

impl PassTransition {
    pub fn new(output: usize) -> Self {
        Self { output }
    }

    pub fn output(&self) -> usize {
        self.output
    }

    fn on_input_token_added(&mut self, ctx: &mut FiringContext<'_>, input: usize, token: &Token) -> Result<()> {
        if !ctx.holds(input, token) {
            return Ok(());
        }
        ctx.fire(&[(input, token.clone())], vec![(self.output, token.clone())])?;
        Ok(())
    }
}

/// Replaces one token with a split token per output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitTransition;

impl SplitTransition {
    fn on_input_token_added(&mut self, ctx: &mut FiringContext<'_>, input: usize, token: &Token) -> Result<()> {
        if !ctx.holds(input, token) {
            return Ok(());
        }

        let produce = (0..ctx.output_count())
            .map(|output| (output, Token::split_of(token)))
            .collect();
        if ctx.fire(&[(input, token.clone())], produce)? {
            debug!("Split token {} into {} branches", token.id(), ctx.output_count());
        }
        Ok(())
    }
}

/// Buffered siblings of one split event.
#[derive(Debug, Clone)]
struct JoinGeneration {
    original: Token,
    slots: Vec<Option<Token>>,
}

impl JoinGeneration {
    fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    fn buffers(&self, token: &Token) -> bool {
        self.slots.iter().flatten().any(|held| held == token)
    }
}

/// Recombines the siblings of one split into the original token.
///
/// The buffer is keyed by the originating split event, so siblings of
/// different splits arriving interleaved never mix.
#[derive(Debug, Clone)]
pub struct JoinTransition {
    inputs: usize,
    generations: Vec<JoinGeneration>,
}

impl JoinTransition {
    pub fn new(inputs: usize) -> Self {
        Self {
            inputs,
            generations: Vec::new(),
        }
    }

    /// Number of split events with partially filled slots.
    pub fn pending(&self) -> usize {
        self.generations.len()
    }

    fn on_input_token_added(&mut self, ctx: &mut FiringContext<'_>, input: usize, token: &Token) -> Result<()> {
        if !ctx.holds(input, token) {
            return Ok(());
        }

        let original = token.original().cloned().ok_or_else(|| EngineError::UnexpectedToken {
            step: ctx.step().to_string(),
            token: token.id(),
            reason: "join inputs only accept split tokens".to_string(),
        })?;

        let position = match self.generations.iter().position(|g| g.original == original) {
            Some(position) => position,
            None => {
                self.generations.push(JoinGeneration {
                    original,
                    slots: vec![None; ctx.input_count()],
                });
                self.generations.len() - 1
            }
        };

        let generation = &mut self.generations[position];
        let current = generation.slots.get(input).cloned().ok_or_else(|| EngineError::UnexpectedToken {
            step: ctx.step().to_string(),
            token: token.id(),
            reason: format!("join buffers {} inputs, not input {}", generation.slots.len(), input),
        })?;

        let slot = match current {
            Some(held) if held == *token => return Ok(()),
            _ if generation.buffers(token) => {
                debug!("Token {} is already buffered on another input", token.id());
                return Ok(());
            }
            None => input,
            // Inputs reading the same place share its siblings.
            Some(held) => generation
                .slots
                .iter()
                .enumerate()
                .find(|(slot, free)| free.is_none() && ctx.holds(*slot, token))
                .map(|(slot, _)| slot)
                .ok_or_else(|| EngineError::UnexpectedToken {
                    step: ctx.step().to_string(),
                    token: token.id(),
                    reason: format!(
                        "input {} already holds sibling {} of original {}",
                        input,
                        held.id(),
                        generation.original.id()
                    ),
                })?,
        };
        generation.slots[slot] = Some(token.clone());

        if !generation.is_complete() {
            debug!(
                "Join '{}' waiting: {}/{} siblings of {}",
                ctx.step(),
                generation.slots.iter().flatten().count(),
                generation.slots.len(),
                generation.original.id()
            );
            return Ok(());
        }

        let mut generation = self.generations.remove(position);
        let consume: Vec<(usize, Token)> = generation
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, held)| held.clone().map(|t| (slot, t)))
            .collect();

        if !ctx.fire(&consume, vec![(0, generation.original.clone())])? {
            for (slot, held) in generation.slots.iter_mut().enumerate() {
                if held.as_ref().is_some_and(|t| !ctx.holds(slot, t)) {
                    *held = None;
                }
            }
            self.generations.push(generation);
        }
        Ok(())
    }

    fn capture(&self, table: &mut TokenTable) -> Option<TransitionStateSnapshot> {
        if self.generations.is_empty() {
            return None;
        }

        let generations = self
            .generations
            .iter()
            .map(|g| JoinGenerationSnapshot {
                original: table.register(&g.original),
                slots: g
                    .slots
                    .iter()
                    .map(|slot| slot.as_ref().map(|t| table.register(t)))
                    .collect(),
            })
            .collect();
        Some(TransitionStateSnapshot::Join { generations })
    }

    fn restore(&mut self, step: &str, generations: &[JoinGenerationSnapshot], tokens: &RestoredTokens) -> Result<()> {
        let mut restored = Vec::with_capacity(generations.len());
        for generation in generations {
            if generation.slots.len() != self.inputs {
                return Err(tokens.mismatch(format!(
                    "join '{}' has {} inputs but the snapshot buffers {}",
                    step,
                    self.inputs,
                    generation.slots.len()
                )));
            }
            let slots = generation
                .slots
                .iter()
                .map(|slot| slot.map(|id| tokens.resolve(id)).transpose())
                .collect::<Result<Vec<_>>>()?;
            restored.push(JoinGeneration {
                original: tokens.resolve(generation.original)?,
                slots,
            });
        }
        self.generations = restored;
        Ok(())
    }
}

/// A live transition: one case per kind.
pub enum Transition {
    Pass(PassTransition),
    Split(SplitTransition),
    Join(JoinTransition),
    SubWorkflow(SubWorkflowTransition),
    Task(TaskTransition),
    /// Domain-specific routing supplied by a custom factory
    Custom(Box<dyn CustomTransition>),
}

impl Transition {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Pass(_) => "pass",
            Self::Split(_) => "split",
            Self::Join(_) => "join",
            Self::SubWorkflow(_) => "sub_workflow",
            Self::Task(_) => "task",
            Self::Custom(_) => "custom",
        }
    }

    /// Reacts to a token added to the place behind input `input`.
    pub(crate) fn on_input_token_added(
        &mut self,
        ctx: &mut FiringContext<'_>,
        input: usize,
        token: &Token,
    ) -> Result<()> {
        match self {
            Self::Pass(t) => t.on_input_token_added(ctx, input, token),
            Self::Split(t) => t.on_input_token_added(ctx, input, token),
            Self::Join(t) => t.on_input_token_added(ctx, input, token),
            Self::SubWorkflow(t) => t.on_input_token_added(ctx, input, token),
            Self::Task(t) => t.on_input_token_added(ctx, input, token),
            Self::Custom(t) => fire_custom(t.as_mut(), ctx, input, token),
        }
    }

    /// Continues buffered work after a pause.
    pub(crate) fn resume(&mut self, ctx: &mut FiringContext<'_>) -> Result<()> {
        match self {
            Self::SubWorkflow(t) => t.resume(ctx),
            Self::Task(t) => {
                t.resume(ctx);
                Ok(())
            }
            Self::Pass(_) | Self::Split(_) | Self::Join(_) | Self::Custom(_) => Ok(()),
        }
    }

    /// Buffered state for a snapshot; `None` when there is nothing buffered.
    pub(crate) fn capture(&mut self, table: &mut TokenTable) -> Result<Option<TransitionStateSnapshot>> {
        match self {
            Self::Join(t) => Ok(t.capture(table)),
            Self::SubWorkflow(t) => t.capture(table),
            Self::Task(t) => Ok(t.capture(table)),
            Self::Pass(_) | Self::Split(_) | Self::Custom(_) => Ok(None),
        }
    }

    pub(crate) fn restore(&mut self, step: &str, state: &TransitionStateSnapshot, tokens: &RestoredTokens) -> Result<()> {
        match (self, state) {
            (Self::Join(t), TransitionStateSnapshot::Join { generations }) => t.restore(step, generations, tokens),
            (Self::SubWorkflow(t), TransitionStateSnapshot::SubWorkflow { token, child }) => {
                t.restore(tokens.resolve(*token)?, child)
            }
            (Self::Task(t), TransitionStateSnapshot::Task { held }) => t.restore(held, tokens),
            (transition, _) => Err(tokens.mismatch(format!(
                "step '{}' is a {} transition and cannot take the captured state",
                step,
                transition.kind()
            ))),
        }
    }

    pub(crate) fn dispose(&mut self) {
        if let Self::SubWorkflow(t) = self {
            t.dispose();
        }
    }
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass(t) => f.debug_tuple("Pass").field(t).finish(),
            Self::Join(t) => f.debug_tuple("Join").field(&t.pending()).finish(),
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// A transition together with its lifecycle state.
pub(crate) struct TransitionCell {
    pub(crate) state: TransitionState,
    pub(crate) transition: Transition,
}

impl TransitionCell {
    pub(crate) fn new(transition: Transition) -> Self {
        Self {
            state: TransitionState::Created,
            transition,
        }
    }

    /// Idempotent; subscriptions live in the engine's registration table.
    pub(crate) fn initialize(&mut self) {
        if self.state == TransitionState::Created {
            self.state = TransitionState::Initialized;
        }
    }

    pub(crate) fn activate(&mut self) {
        if matches!(self.state, TransitionState::Initialized | TransitionState::Paused) {
            self.state = TransitionState::Active;
        }
    }

    pub(crate) fn suspend(&mut self) {
        if matches!(self.state, TransitionState::Initialized | TransitionState::Active) {
            self.state = TransitionState::Paused;
        }
    }

    pub(crate) fn dispose(&mut self) {
        self.transition.dispose();
        self.state = TransitionState::Disposed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::PlaceDef;

    struct Net {
        places: Vec<Place>,
        commit: Mutex<()>,
        inputs: Vec<usize>,
        outputs: Vec<usize>,
    }

    impl Net {
        /// `inputs` places followed by `outputs` places.
        fn new(inputs: usize, outputs: usize) -> Self {
            let places = (0..inputs + outputs)
                .map(|i| Place::new(&PlaceDef::new(format!("p{}", i))))
                .collect();
            Self {
                places,
                commit: Mutex::new(()),
                inputs: (0..inputs).collect(),
                outputs: (inputs..inputs + outputs).collect(),
            }
        }

        fn ctx(&self) -> FiringContext<'_> {
            FiringContext::new("under_test", &self.inputs, &self.outputs, &self.places, &self.commit)
        }

        fn input(&self, i: usize) -> &Place {
            &self.places[self.inputs[i]]
        }

        fn output(&self, i: usize) -> &Place {
            &self.places[self.outputs[i]]
        }

        /// Adds a token to an input and lets the transition react.
        fn deliver(&self, transition: &mut Transition, input: usize, token: &Token) -> Result<Vec<EngineEvent>> {
            self.input(input).add(token.clone());
            let mut ctx = self.ctx();
            transition.on_input_token_added(&mut ctx, input, token)?;
            Ok(ctx.finish().1)
        }
    }

    #[test]
    fn test_pass_forwards_same_token() {
        let net = Net::new(1, 2);
        let mut pass = Transition::Pass(PassTransition::new(1));
        let token = Token::new();

        let events = net.deliver(&mut pass, 0, &token).unwrap();

        assert!(net.input(0).is_empty());
        assert!(net.output(0).is_empty());
        let forwarded = net.output(1).tokens();
        assert!(forwarded[0].shares_allocation(&token));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_pass_ignores_stale_notification() {
        let net = Net::new(1, 1);
        let mut pass = Transition::Pass(PassTransition::new(0));
        let token = Token::new();

        let mut ctx = net.ctx();
        pass.on_input_token_added(&mut ctx, 0, &token).unwrap();
        let (produced, events) = ctx.finish();
        assert!(produced.is_empty());
        assert!(events.is_empty());
    }

    #[test]
    fn test_split_produces_one_split_token_per_output() {
        let net = Net::new(1, 3);
        let mut split = Transition::Split(SplitTransition);
        let token = Token::new();

        net.deliver(&mut split, 0, &token).unwrap();

        assert!(net.input(0).is_empty());
        for i in 0..3 {
            let held = net.output(i).tokens();
            assert_eq!(held.len(), 1);
            assert_ne!(held[0], token);
            assert!(held[0].original().unwrap().shares_allocation(&token));
        }
    }

    #[test]
    fn test_join_waits_for_all_siblings() {
        let net = Net::new(2, 1);
        let mut join = Transition::Join(JoinTransition::new(2));
        let original = Token::new();
        let left = Token::split_of(&original);
        let right = Token::split_of(&original);

        let events = net.deliver(&mut join, 1, &right).unwrap();
        assert!(events.is_empty());
        assert!(net.output(0).is_empty());

        let events = net.deliver(&mut join, 0, &left).unwrap();
        assert_eq!(events.len(), 1);
        assert!(net.input(0).is_empty());
        assert!(net.input(1).is_empty());
        assert_eq!(net.output(0).tokens(), vec![original]);
    }

    #[test]
    fn test_join_keeps_overlapping_generations_apart() {
        let net = Net::new(2, 1);
        let first = Token::new();
        let second = Token::new();
        let (a0, a1) = (Token::split_of(&first), Token::split_of(&first));
        let (b0, b1) = (Token::split_of(&second), Token::split_of(&second));

        let mut join = Transition::Join(JoinTransition::new(2));
        net.deliver(&mut join, 0, &a0).unwrap();
        net.deliver(&mut join, 1, &b1).unwrap();
        assert!(matches!(&join, Transition::Join(j) if j.pending() == 2));
        assert!(net.output(0).is_empty());

        net.deliver(&mut join, 0, &b0).unwrap();
        assert_eq!(net.output(0).tokens(), vec![second.clone()]);
        assert!(net.input(0).contains(&a0));

        net.deliver(&mut join, 1, &a1).unwrap();
        assert_eq!(net.output(0).len(), 2);
        assert!(net.output(0).contains(&first));
        assert!(matches!(&join, Transition::Join(j) if j.pending() == 0));
    }

    #[test]
    fn test_join_rejects_plain_tokens() {
        let net = Net::new(2, 1);
        let mut join = Transition::Join(JoinTransition::new(2));
        let result = net.deliver(&mut join, 0, &Token::new());

        assert!(matches!(result, Err(EngineError::UnexpectedToken { .. })));
        assert_eq!(net.input(0).len(), 1);
    }

    #[test]
    fn test_join_rejects_second_sibling_on_filled_slot() {
        let net = Net::new(2, 1);
        let mut join = Transition::Join(JoinTransition::new(2));
        let original = Token::new();

        net.deliver(&mut join, 0, &Token::split_of(&original)).unwrap();
        let result = net.deliver(&mut join, 0, &Token::split_of(&original));
        assert!(matches!(result, Err(EngineError::UnexpectedToken { .. })));
    }

    #[test]
    fn test_join_inputs_sharing_a_place() {
        let mut net = Net::new(1, 1);
        net.inputs = vec![0, 0];
        let mut join = Transition::Join(JoinTransition::new(2));
        let original = Token::new();
        let (first, second) = (Token::split_of(&original), Token::split_of(&original));

        // Each arrival is announced on both connectors of the place.
        net.input(0).add(first.clone());
        net.input(0).add(second.clone());
        for (input, token) in [(0, &first), (1, &first), (0, &second), (1, &second)] {
            let mut ctx = net.ctx();
            join.on_input_token_added(&mut ctx, input, token).unwrap();
        }

        assert!(net.input(0).is_empty());
        assert_eq!(net.output(0).tokens(), vec![original]);
        assert!(matches!(&join, Transition::Join(j) if j.pending() == 0));
    }

    #[test]
    fn test_join_sizes_slots_from_its_inputs() {
        let net = Net::new(2, 1);
        let mut join = Transition::Join(JoinTransition::new(1));
        let original = Token::new();

        let events = net.deliver(&mut join, 1, &Token::split_of(&original)).unwrap();
        assert!(events.is_empty());
        net.deliver(&mut join, 0, &Token::split_of(&original)).unwrap();
        assert_eq!(net.output(0).tokens(), vec![original]);
    }

    #[test]
    fn test_fire_is_all_or_nothing() {
        let net = Net::new(2, 1);
        let present = Token::new();
        let missing = Token::new();
        net.input(0).add(present.clone());

        let mut ctx = net.ctx();
        let fired = ctx
            .fire(&[(0, present.clone()), (1, missing)], vec![(0, present.clone())])
            .unwrap();

        assert!(!fired);
        assert!(net.input(0).contains(&present));
        assert!(net.output(0).is_empty());
        assert!(ctx.finish().1.is_empty());
    }

    #[test]
    fn test_fire_rejects_missing_output_before_mutating() {
        let net = Net::new(1, 1);
        let token = Token::new();
        net.input(0).add(token.clone());

        let mut ctx = net.ctx();
        let result = ctx.fire(&[(0, token.clone())], vec![(4, token.clone())]);

        assert!(matches!(result, Err(EngineError::InvalidOutput { index: 4, .. })));
        assert!(net.input(0).contains(&token));
    }

    #[test]
    fn test_lifecycle() {
        let mut cell = TransitionCell::new(Transition::Split(SplitTransition));
        assert_eq!(cell.state, TransitionState::Created);

        cell.initialize();
        cell.initialize();
        assert_eq!(cell.state, TransitionState::Initialized);

        cell.activate();
        assert_eq!(cell.state, TransitionState::Active);
        cell.suspend();
        assert_eq!(cell.state, TransitionState::Paused);
        cell.activate();
        assert_eq!(cell.state, TransitionState::Active);

        cell.dispose();
        cell.activate();
        assert_eq!(cell.state, TransitionState::Disposed);
    }

    #[test]
    fn test_join_capture_and_restore() {
        let original = Token::new();
        let left = Token::split_of(&original);

        let mut join = JoinTransition::new(2);
        join.generations.push(JoinGeneration {
            original: original.clone(),
            slots: vec![Some(left.clone()), None],
        });

        let mut table = TokenTable::default();
        let state = join.capture(&mut table).unwrap();
        let tokens = RestoredTokens::from_records("wp", &table.into_records()).unwrap();

        let mut restored = Transition::Join(JoinTransition::new(2));
        restored.restore("fan_in", &state, &tokens).unwrap();
        match restored {
            Transition::Join(j) => {
                assert_eq!(j.generations[0].original, original);
                assert_eq!(j.generations[0].slots[0], Some(left));
                assert!(j.generations[0].slots[1].is_none());
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut wrong = Transition::Join(JoinTransition::new(3));
        assert!(matches!(
            wrong.restore("fan_in", &state, &tokens),
            Err(EngineError::SnapshotMismatch { .. })
        ));

        let mut pass = Transition::Pass(PassTransition::new(0));
        assert!(pass.restore("fan_in", &state, &tokens).is_err());
    }
}
