//! Workplan Execution Engine
//!
//! The engine owns the places and transitions of one workplan and routes
//! tokens between them:
//! - A token added to a place notifies every transition consuming from it
//! - Notifications are processed from a FIFO queue on the calling thread,
//!   so a whole cascade completes before `start`/`complete` returns
//! - The first token to reach a terminal place completes the engine
//! - `pause` captures a [`WorkplanSnapshot`], recursively through nested
//!   sub-workflow engines; `restore` + `resume` continue it later
//!
//! Locking order: gate, then one transition, then commit. Every delivery
//! holds the gate for reading; pause, restore and status changes hold it for
//! writing, so a snapshot never observes a half-finished firing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use log::{debug, error, info, warn};

use super::event::{EngineEvent, TransitionRef};
use super::factory::{DefaultTransitionFactory, TransitionFactory};
use super::place::Place;
use super::snapshot::{
    PlaceSnapshot, RestoredTokens, TokenTable, TransitionSnapshot, TransitionStateSnapshot, WorkplanSnapshot,
};
use super::token::{Token, TokenId};
use super::transition::{FiringContext, Transition, TransitionCell, TransitionState};
use super::{lock, read, write};
use crate::error::{EngineError, Result};
use crate::workflow::model::Workplan;
use crate::workflow::validator::{validate_workplan, ValidationError};

/// Lifecycle of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Built, not started yet
    Created,
    Running,
    Paused,
    /// A token reached a terminal place
    Completed,
    /// A firing failed; see [`Engine::halt_reason`]
    Halted,
    Disposed,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Halted => "halted",
            Self::Disposed => "disposed",
        };
        write!(f, "{}", text)
    }
}

struct TransitionSlot {
    step: String,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
    cell: Mutex<TransitionCell>,
}

impl TransitionSlot {
    fn context<'a>(&'a self, places: &'a [Place], commit: &'a Mutex<()>) -> FiringContext<'a> {
        FiringContext::new(&self.step, &self.inputs, &self.outputs, places, commit)
    }
}

/// A token added to the place behind `input` of `transition`.
struct Notification {
    transition: usize,
    input: usize,
    token: Token,
}

/// Runs one workplan.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use workplan::execution::{Engine, EngineStatus};
/// use workplan::workflow::{PlaceDef, StepDef, Workplan};
///
/// let workplan = Workplan::new("press")
///     .with_place(PlaceDef::start("raw"))
///     .with_place(PlaceDef::end("pressed"))
///     .with_step(StepDef::pass("press").with_input("raw").with_output("pressed"));
///
/// let engine = Engine::new(Arc::new(workplan)).unwrap();
/// engine.start().unwrap();
/// assert_eq!(engine.status(), EngineStatus::Completed);
/// ```
pub struct Engine {
    workplan: Arc<Workplan>,
    fingerprint: String,
    places: Vec<Place>,
    place_index: HashMap<String, usize>,
    transitions: Vec<TransitionSlot>,
    step_index: HashMap<String, usize>,
    /// Place index -> (transition index, input position)
    consumers: Vec<Vec<(usize, usize)>>,
    start_place: usize,
    gate: RwLock<()>,
    commit: Mutex<()>,
    status: Mutex<EngineStatus>,
    completion: Mutex<Option<(String, Token)>>,
    halt_reason: Mutex<Option<String>>,
    subscribers: Mutex<Vec<Sender<EngineEvent>>>,
}

impl Engine {
    /// Builds an engine with the built-in transitions.
    pub fn new(workplan: Arc<Workplan>) -> Result<Self> {
        Self::with_factory(workplan, Arc::new(DefaultTransitionFactory))
    }

    /// Builds an engine, creating every transition through `factory`.
    ///
    /// The workplan is validated first; nothing is instantiated for an
    /// invalid definition.
    pub fn with_factory(workplan: Arc<Workplan>, factory: Arc<dyn TransitionFactory>) -> Result<Self> {
        validate_workplan(&workplan)?;
        let fingerprint = workplan.fingerprint()?;

        let places: Vec<Place> = workplan.places.iter().map(Place::new).collect();
        let place_index: HashMap<String, usize> = places
            .iter()
            .enumerate()
            .map(|(index, place)| (place.id().to_string(), index))
            .collect();

        let start_place = workplan
            .start_place()
            .and_then(|place| place_index.get(&place.id).copied())
            .ok_or_else(|| EngineError::InvalidWorkplan {
                workplan: workplan.id.clone(),
                issues: vec![ValidationError::NoStartPlace],
            })?;

        let resolve = |place: &String| {
            place_index
                .get(place)
                .copied()
                .ok_or_else(|| EngineError::UnknownPlace(place.clone()))
        };

        let mut consumers = vec![Vec::new(); places.len()];
        let mut transitions = Vec::with_capacity(workplan.steps.len());
        let mut step_index = HashMap::new();

        for step in &workplan.steps {
            let inputs = step.inputs.iter().map(|p| resolve(p)).collect::<Result<Vec<_>>>()?;
            let outputs = step.outputs.iter().map(|p| resolve(p)).collect::<Result<Vec<_>>>()?;
            let transition = factory.create(step, &factory)?;

            let index = transitions.len();
            for (input, &place) in inputs.iter().enumerate() {
                consumers[place].push((index, input));
            }
            step_index.insert(step.id.clone(), index);

            let mut cell = TransitionCell::new(transition);
            cell.initialize();
            transitions.push(TransitionSlot {
                step: step.id.clone(),
                inputs,
                outputs,
                cell: Mutex::new(cell),
            });
        }

        debug!(
            "Built engine for '{}' v{}: {} places, {} transitions",
            workplan.id,
            workplan.version,
            places.len(),
            transitions.len()
        );

        Ok(Self {
            workplan,
            fingerprint,
            places,
            place_index,
            transitions,
            step_index,
            consumers,
            start_place,
            gate: RwLock::new(()),
            commit: Mutex::new(()),
            status: Mutex::new(EngineStatus::Created),
            completion: Mutex::new(None),
            halt_reason: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Builds an engine and restores a snapshot into it, ready to resume.
    pub fn restored(
        workplan: Arc<Workplan>,
        factory: Arc<dyn TransitionFactory>,
        snapshot: &WorkplanSnapshot,
    ) -> Result<Self> {
        let engine = Self::with_factory(workplan, factory)?;
        engine.restore(snapshot)?;
        Ok(engine)
    }

    pub fn workplan(&self) -> &Arc<Workplan> {
        &self.workplan
    }

    /// Fingerprint of the workplan definition this engine runs.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn status(&self) -> EngineStatus {
        *lock(&self.status)
    }

    /// Terminal place and token that completed the engine.
    pub fn completion(&self) -> Option<(String, Token)> {
        lock(&self.completion).clone()
    }

    pub fn halt_reason(&self) -> Option<String> {
        lock(&self.halt_reason).clone()
    }

    /// Tokens currently held by a place.
    pub fn place_tokens(&self, place: &str) -> Result<Vec<Token>> {
        self.place_index
            .get(place)
            .map(|&index| self.places[index].tokens())
            .ok_or_else(|| EngineError::UnknownPlace(place.to_string()))
    }

    pub fn transition_state(&self, step: &str) -> Result<TransitionState> {
        self.step_index
            .get(step)
            .map(|&index| lock(&self.transitions[index].cell).state)
            .ok_or_else(|| EngineError::UnknownStep(step.to_string()))
    }

    /// Receives every event published from now on.
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    fn publish(&self, events: Vec<EngineEvent>) {
        if events.is_empty() {
            return;
        }
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| events.iter().all(|event| tx.send(event.clone()).is_ok()));
    }

    /// Starts the engine with a fresh token, or resumes it if paused.
    pub fn start(&self) -> Result<()> {
        if self.status() == EngineStatus::Paused {
            return self.resume();
        }
        self.start_with(Token::new())
    }

    /// Starts the engine by adding `token` to the start place.
    pub fn start_with(&self, token: Token) -> Result<()> {
        let mut events = Vec::new();
        let result = self.start_into(token, &mut events);
        self.publish(events);
        result
    }

    pub(crate) fn start_into(&self, token: Token, events: &mut Vec<EngineEvent>) -> Result<()> {
        {
            let _gate = write(&self.gate);
            self.transition_status("start", &[EngineStatus::Created], EngineStatus::Running)?;
            for slot in &self.transitions {
                lock(&slot.cell).activate();
            }
            let _commit = lock(&self.commit);
            self.places[self.start_place].add(token.clone());
        }

        info!(
            "Started workplan '{}' with token {}",
            self.workplan.id,
            token.id()
        );

        let mut queue = VecDeque::new();
        self.accept(self.start_place, token, &mut queue, events);
        self.drive(queue, events)
    }

    /// Reports that the activity of a task transition finished.
    ///
    /// `transition` addresses the task, through enclosing sub-workflow
    /// steps if nested. The held token is released to `output`.
    pub fn complete(&self, transition: &TransitionRef, token: TokenId, output: usize) -> Result<()> {
        let mut events = Vec::new();
        let result = self.complete_into(transition, token, output, &mut events);
        self.publish(events);
        result
    }

    pub(crate) fn complete_into(
        &self,
        target: &TransitionRef,
        token: TokenId,
        output: usize,
        events: &mut Vec<EngineEvent>,
    ) -> Result<()> {
        let produced = {
            let _gate = read(&self.gate);
            let status = self.status();
            if status != EngineStatus::Running {
                return Err(EngineError::InvalidState {
                    operation: "complete an activity on",
                    status,
                });
            }

            let (head, rest) = target.split_first();
            let index = *self
                .step_index
                .get(head)
                .ok_or_else(|| EngineError::UnknownStep(head.to_string()))?;
            let slot = &self.transitions[index];
            let mut cell = lock(&slot.cell);

            let mut ctx = slot.context(&self.places, &self.commit);
            let outcome = match (&mut cell.transition, rest) {
                (Transition::Task(task), None) => task.complete(&mut ctx, token, output),
                (Transition::SubWorkflow(sub), Some(rest)) => sub.forward(&mut ctx, &rest, token, output),
                _ => Err(EngineError::NotAwaiting {
                    step: target.to_string(),
                    token,
                }),
            };
            let (produced, raised) = ctx.finish();
            events.extend(raised);
            if let Err(e) = outcome {
                return Err(self.halt(e));
            }
            produced
        };

        let mut queue = VecDeque::new();
        for (place, token) in produced {
            self.accept(place, token, &mut queue, events);
        }
        self.drive(queue, events)
    }

    /// Pauses the engine and captures its state.
    ///
    /// A halted engine can still be captured; it stays halted.
    pub fn pause(&self) -> Result<WorkplanSnapshot> {
        let _gate = write(&self.gate);
        {
            let mut status = lock(&self.status);
            match *status {
                EngineStatus::Running => *status = EngineStatus::Paused,
                EngineStatus::Paused | EngineStatus::Halted => {}
                other => {
                    return Err(EngineError::InvalidState {
                        operation: "pause",
                        status: other,
                    })
                }
            }
        }

        let mut table = TokenTable::default();
        let mut places = Vec::new();
        for place in self.places.iter().filter(|p| !p.is_empty()) {
            let mut tokens = Vec::new();
            for token in place.tokens() {
                tokens.push(table.register(&token));
            }
            places.push(PlaceSnapshot {
                place: place.id().to_string(),
                tokens,
            });
        }

        let mut transitions = Vec::new();
        for slot in &self.transitions {
            let mut cell = lock(&slot.cell);
            cell.suspend();
            if let Some(state) = cell.transition.capture(&mut table)? {
                transitions.push(TransitionSnapshot {
                    step: slot.step.clone(),
                    state,
                });
            }
        }

        let snapshot = WorkplanSnapshot {
            workplan_id: self.workplan.id.clone(),
            version: self.workplan.version,
            fingerprint: self.fingerprint.clone(),
            captured_at: Utc::now(),
            tokens: table.into_records(),
            places,
            transitions,
        };

        info!(
            "Paused workplan '{}': {} tokens in {} places, {} nested engines",
            self.workplan.id,
            snapshot.tokens.len(),
            snapshot.places.len(),
            snapshot.nested_count()
        );
        Ok(snapshot)
    }

    /// Loads a snapshot into a freshly built engine, leaving it paused.
    ///
    /// The snapshot must come from the same workplan id, version and
    /// definition. A mismatch is reported before anything changes; any
    /// later failure halts the engine.
    pub fn restore(&self, snapshot: &WorkplanSnapshot) -> Result<()> {
        let _gate = write(&self.gate);
        let status = self.status();
        if status != EngineStatus::Created {
            return Err(EngineError::InvalidState {
                operation: "restore",
                status,
            });
        }
        self.check_pairing(snapshot)?;

        match self.restore_state(snapshot) {
            Ok(()) => {
                *lock(&self.status) = EngineStatus::Paused;
                info!(
                    "Restored workplan '{}' from snapshot captured at {}",
                    self.workplan.id, snapshot.captured_at
                );
                Ok(())
            }
            Err(e) => {
                *lock(&self.status) = EngineStatus::Halted;
                *lock(&self.halt_reason) = Some(e.to_string());
                error!("Failed to restore workplan '{}': {}", self.workplan.id, e);
                Err(e)
            }
        }
    }

    fn check_pairing(&self, snapshot: &WorkplanSnapshot) -> Result<()> {
        let reason = if snapshot.workplan_id != self.workplan.id {
            format!("captured from workplan '{}'", snapshot.workplan_id)
        } else if snapshot.version != self.workplan.version {
            format!(
                "captured from version {}, engine runs version {}",
                snapshot.version, self.workplan.version
            )
        } else if snapshot.fingerprint != self.fingerprint {
            "workplan definition changed since capture".to_string()
        } else {
            return Ok(());
        };

        warn!("Rejected snapshot for '{}': {}", self.workplan.id, reason);
        Err(EngineError::SnapshotMismatch {
            workplan: self.workplan.id.clone(),
            reason,
        })
    }

    fn restore_state(&self, snapshot: &WorkplanSnapshot) -> Result<()> {
        let tokens = RestoredTokens::from_records(&self.workplan.id, &snapshot.tokens)?;

        // Join buffers point at tokens still in their places; everything
        // else owns its tokens exclusively.
        let consumed = snapshot.transitions.iter().flat_map(|t| match &t.state {
            TransitionStateSnapshot::Task { held } => held.clone(),
            TransitionStateSnapshot::SubWorkflow { token, .. } => vec![*token],
            TransitionStateSnapshot::Join { .. } => Vec::new(),
        });
        let mut claimed = HashSet::new();
        for id in snapshot
            .places
            .iter()
            .flat_map(|p| p.tokens.iter().copied())
            .chain(consumed)
        {
            if !claimed.insert(id) {
                return Err(tokens.mismatch(format!("token {} is held more than once", id)));
            }
        }

        let mut contents = Vec::with_capacity(snapshot.places.len());
        for place in &snapshot.places {
            let index = *self
                .place_index
                .get(&place.place)
                .ok_or_else(|| tokens.mismatch(format!("unknown place '{}'", place.place)))?;
            let held = place
                .tokens
                .iter()
                .map(|id| tokens.resolve(*id))
                .collect::<Result<Vec<_>>>()?;
            contents.push((index, held));
        }

        for captured in &snapshot.transitions {
            let index = *self
                .step_index
                .get(&captured.step)
                .ok_or_else(|| tokens.mismatch(format!("unknown step '{}'", captured.step)))?;
            lock(&self.transitions[index].cell)
                .transition
                .restore(&captured.step, &captured.state, &tokens)?;
        }

        for (index, held) in contents {
            for token in held {
                self.places[index].add(token);
            }
        }
        for slot in &self.transitions {
            lock(&slot.cell).suspend();
        }
        Ok(())
    }

    /// Continues a paused engine.
    ///
    /// Buffered transitions continue first (running activities are
    /// announced again), then every held token is offered to its consumers
    /// once more.
    pub fn resume(&self) -> Result<()> {
        let mut events = Vec::new();
        let result = self.resume_into(&mut events);
        self.publish(events);
        result
    }

    pub(crate) fn resume_into(&self, events: &mut Vec<EngineEvent>) -> Result<()> {
        let held: Vec<(usize, Token)> = {
            let _gate = write(&self.gate);
            self.transition_status("resume", &[EngineStatus::Paused], EngineStatus::Running)?;
            for slot in &self.transitions {
                lock(&slot.cell).activate();
            }
            self.places
                .iter()
                .enumerate()
                .flat_map(|(index, place)| place.tokens().into_iter().map(move |token| (index, token)))
                .collect()
        };

        info!(
            "Resumed workplan '{}' with {} held tokens",
            self.workplan.id,
            held.len()
        );

        let mut queue = VecDeque::new();
        for slot in &self.transitions {
            let produced = {
                let _gate = read(&self.gate);
                if self.status() != EngineStatus::Running {
                    break;
                }
                let mut cell = lock(&slot.cell);
                let mut ctx = slot.context(&self.places, &self.commit);
                let outcome = cell.transition.resume(&mut ctx);
                let (produced, raised) = ctx.finish();
                events.extend(raised);
                if let Err(e) = outcome {
                    return Err(self.halt(e));
                }
                produced
            };
            for (place, token) in produced {
                self.accept(place, token, &mut queue, events);
            }
        }

        for (place, token) in held {
            self.accept(place, token, &mut queue, events);
        }
        self.drive(queue, events)
    }

    /// Tears the engine down, nested engines included.
    pub fn dispose(&self) {
        let _gate = write(&self.gate);
        for slot in &self.transitions {
            lock(&slot.cell).dispose();
        }
        *lock(&self.status) = EngineStatus::Disposed;
        lock(&self.subscribers).clear();
        debug!("Disposed engine for '{}'", self.workplan.id);
    }

    fn transition_status(
        &self,
        operation: &'static str,
        from: &[EngineStatus],
        to: EngineStatus,
    ) -> Result<()> {
        let mut status = lock(&self.status);
        if !from.contains(&*status) {
            return Err(EngineError::InvalidState {
                operation,
                status: *status,
            });
        }
        *status = to;
        Ok(())
    }

    /// Records a token that landed in `place` and queues its consumers.
    fn accept(
        &self,
        place: usize,
        token: Token,
        queue: &mut VecDeque<Notification>,
        events: &mut Vec<EngineEvent>,
    ) {
        let target = &self.places[place];
        if target.is_terminal() {
            let mut status = lock(&self.status);
            match *status {
                EngineStatus::Running => {
                    *status = EngineStatus::Completed;
                    *lock(&self.completion) = Some((target.id().to_string(), token.clone()));
                    info!(
                        "Workplan '{}' completed at '{}' with token {}",
                        self.workplan.id,
                        target.id(),
                        token.id()
                    );
                    events.push(EngineEvent::Completed {
                        place: target.id().to_string(),
                        token: token.clone(),
                    });
                }
                EngineStatus::Completed => warn!(
                    "Workplan '{}' already completed, token {} at '{}' is ignored",
                    self.workplan.id,
                    token.id(),
                    target.id()
                ),
                _ => {}
            }
        }

        for &(transition, input) in &self.consumers[place] {
            queue.push_back(Notification {
                transition,
                input,
                token: token.clone(),
            });
        }
    }

    /// Delivers queued notifications until the queue drains or the engine
    /// leaves the running state.
    fn drive(&self, mut queue: VecDeque<Notification>, events: &mut Vec<EngineEvent>) -> Result<()> {
        while let Some(notification) = queue.pop_front() {
            let produced = {
                let _gate = read(&self.gate);
                let status = self.status();
                if status != EngineStatus::Running {
                    debug!(
                        "Workplan '{}' is {}, dropping {} pending notifications",
                        self.workplan.id,
                        status,
                        queue.len() + 1
                    );
                    break;
                }

                let slot = &self.transitions[notification.transition];
                let mut cell = lock(&slot.cell);
                if cell.state != TransitionState::Active {
                    continue;
                }

                let mut ctx = slot.context(&self.places, &self.commit);
                let outcome =
                    cell.transition
                        .on_input_token_added(&mut ctx, notification.input, &notification.token);
                let (produced, raised) = ctx.finish();
                events.extend(raised);
                if let Err(e) = outcome {
                    return Err(self.halt(e));
                }
                produced
            };

            for (place, token) in produced {
                self.accept(place, token, &mut queue, events);
            }
        }
        Ok(())
    }

    fn halt(&self, error: EngineError) -> EngineError {
        if error.halts_engine() {
            {
                let mut status = lock(&self.status);
                if matches!(*status, EngineStatus::Running | EngineStatus::Paused) {
                    *status = EngineStatus::Halted;
                }
            }
            *lock(&self.halt_reason) = Some(error.to_string());
            error!("Workplan '{}' halted: {}", self.workplan.id, error);
        }
        error
    }
}
