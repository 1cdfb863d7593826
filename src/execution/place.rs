//! Runtime Places
//!
//! A place holds an unordered multiset of tokens and is the only mutable
//! state container of the net. Consumers are notified through the engine's
//! registration table, not by the place itself.

use std::sync::Mutex;

use log::error;

use super::lock;
use super::token::Token;
use crate::error::{EngineError, Result};
use crate::workflow::model::{PlaceDef, PlaceRole};

/// Live instance of a [`PlaceDef`].
#[derive(Debug)]
pub struct Place {
    id: String,
    role: PlaceRole,
    classification: Option<String>,
    tokens: Mutex<Vec<Token>>,
}

impl Place {
    pub fn new(def: &PlaceDef) -> Self {
        Self {
            id: def.id.clone(),
            role: def.role,
            classification: def.classification.clone(),
            tokens: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> PlaceRole {
        self.role
    }

    pub fn classification(&self) -> Option<&str> {
        self.classification.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.role == PlaceRole::End
    }

    /// Inserts a token. There is no capacity limit.
    pub fn add(&self, token: Token) {
        lock(&self.tokens).push(token);
    }

    /// Removes one occurrence of `token`, matched by identity.
    ///
    /// Removing a token the place does not hold is a bookkeeping bug and is
    /// always reported.
    pub fn remove(&self, token: &Token) -> Result<()> {
        let mut tokens = lock(&self.tokens);
        match tokens.iter().position(|held| held == token) {
            Some(index) => {
                tokens.swap_remove(index);
                Ok(())
            }
            None => {
                error!("Place '{}' does not hold token {}", self.id, token.id());
                Err(EngineError::TokenNotPresent {
                    place: self.id.clone(),
                    token: token.id(),
                })
            }
        }
    }

    pub fn contains(&self, token: &Token) -> bool {
        lock(&self.tokens).iter().any(|held| held == token)
    }

    /// Snapshot of the currently held tokens.
    pub fn tokens(&self) -> Vec<Token> {
        lock(&self.tokens).clone()
    }

    /// First held token, if any.
    pub fn first(&self) -> Option<Token> {
        lock(&self.tokens).first().cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.tokens).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.tokens).is_empty()
    }
}
