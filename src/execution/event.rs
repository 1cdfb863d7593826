//! Engine Events
//!
//! Notifications published by an engine after each operation, in causal
//! order. Events raised inside nested sub-workflows are re-raised by the
//! enclosing step with its id prepended to the transition path, so
//! observers see one flattened trace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::token::Token;

/// Address of a transition, possibly inside nested sub-workflows.
///
/// The path lists enclosing sub-workflow step ids, outermost first, and ends
/// with the transition's own step id. Written as `outer/inner/step`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransitionRef {
    path: Vec<String>,
}

impl TransitionRef {
    /// Reference to a step of the engine itself.
    pub fn local(step: impl Into<String>) -> Self {
        Self {
            path: vec![step.into()],
        }
    }

    /// Prefixes this reference with an enclosing sub-workflow step.
    pub fn nested_in(mut self, outer: impl Into<String>) -> Self {
        self.path.insert(0, outer.into());
        self
    }

    /// The transition's own step id.
    pub fn step(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn depth(&self) -> usize {
        self.path.len()
    }

    /// Splits off the outermost step; the rest addresses the nested engine.
    pub fn split_first(&self) -> (&str, Option<TransitionRef>) {
        match self.path.split_first() {
            Some((head, rest)) if !rest.is_empty() => (
                head.as_str(),
                Some(Self {
                    path: rest.to_vec(),
                }),
            ),
            Some((head, _)) => (head.as_str(), None),
            None => ("", None),
        }
    }
}

impl fmt::Display for TransitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.join("/"))
    }
}

impl FromStr for TransitionRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let path: Vec<String> = s.split('/').map(|part| part.trim().to_string()).collect();
        if path.iter().any(String::is_empty) {
            return Err(format!("Invalid transition reference: '{}'", s));
        }
        Ok(Self { path })
    }
}

/// Something an engine reports to its subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A transition fired.
    TransitionTriggered { transition: TransitionRef },

    /// A task transition took a token and waits for the external result.
    ActivityStarted {
        transition: TransitionRef,
        activity: String,
        token: Token,
    },

    /// A token reached a terminal place; the engine is done.
    Completed { place: String, token: Token },
}

impl EngineEvent {
    /// Re-addresses an event raised by a nested engine.
    ///
    /// Completion of a nested engine is consumed by its sub-workflow step
    /// and never re-raised, so it yields `None`.
    pub fn nested_in(self, outer: &str) -> Option<Self> {
        match self {
            Self::TransitionTriggered { transition } => Some(Self::TransitionTriggered {
                transition: transition.nested_in(outer),
            }),
            Self::ActivityStarted {
                transition,
                activity,
                token,
            } => Some(Self::ActivityStarted {
                transition: transition.nested_in(outer),
                activity,
                token,
            }),
            Self::Completed { .. } => None,
        }
    }
}
