//! Workplan Execution Module
//!
//! Runtime side of a workplan: tokens moving through places, transitions
//! reacting to them, and the engine that routes notifications and captures
//! snapshots for pause/resume.
//!
//! # Architecture
//!
//! - [`token`]: Identifiable units of work, split tokens keep their original
//! - [`place`]: Token containers
//! - [`transition`]: The closed set of transition kinds and their firing
//! - [`task`]: Transitions waiting on external activities, custom routing
//! - [`subworkflow`]: Nested workplans run as one atomic step
//! - [`factory`]: Step descriptor to transition mapping
//! - [`engine`]: Main engine driving one workplan
//! - [`snapshot`]: Serializable engine state

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub mod engine;
pub mod event;
pub mod factory;
pub mod place;
pub mod snapshot;
pub mod subworkflow;
pub mod task;
pub mod token;
pub mod transition;

pub use engine::{Engine, EngineStatus};
pub use event::{EngineEvent, TransitionRef};
pub use factory::{builtin_transition, DefaultTransitionFactory, TransitionFactory};
pub use snapshot::WorkplanSnapshot;
pub use task::CustomTransition;
pub use token::{Token, TokenId};
pub use transition::{Transition, TransitionState};

// A panic inside one firing must not wedge the whole net; the protected data
// is only ever mutated through complete operations.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
