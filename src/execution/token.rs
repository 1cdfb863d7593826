//! Tokens
//!
//! A token is the unit of in-flight work moved, split and joined by the
//! engine. Tokens are cheap shared handles; identity is the [`TokenId`].
//! A split token keeps a reference to the original it was derived from, and
//! every sibling of one split shares that same original.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Stable identity of a token, preserved across pause and restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(Uuid);

impl TokenId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TokenId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug)]
struct TokenData {
    id: TokenId,
    payload: Option<Value>,
    original: Option<Token>,
}

/// An identifiable unit of work.
///
/// Cloning a token clones the handle, not the work item: both clones have
/// the same identity.
#[derive(Clone)]
pub struct Token(Arc<TokenData>);

impl Token {
    /// Creates a token without payload.
    pub fn new() -> Self {
        Self::from_parts(TokenId::new(), None, None)
    }

    /// Creates a token carrying a payload reference (e.g. a product id).
    pub fn with_payload(payload: Value) -> Self {
        Self::from_parts(TokenId::new(), Some(payload), None)
    }

    /// Creates a split token derived from `original`.
    pub fn split_of(original: &Token) -> Self {
        Self::from_parts(TokenId::new(), None, Some(original.clone()))
    }

    pub(crate) fn from_parts(id: TokenId, payload: Option<Value>, original: Option<Token>) -> Self {
        Self(Arc::new(TokenData {
            id,
            payload,
            original,
        }))
    }

    pub fn id(&self) -> TokenId {
        self.0.id
    }

    /// The token's own payload, if any.
    pub fn payload(&self) -> Option<&Value> {
        self.0.payload.as_ref()
    }

    /// The payload of this token or, for split tokens, of its original.
    pub fn effective_payload(&self) -> Option<&Value> {
        match (&self.0.payload, &self.0.original) {
            (Some(payload), _) => Some(payload),
            (None, Some(original)) => original.effective_payload(),
            (None, None) => None,
        }
    }

    /// The original this split token was derived from.
    pub fn original(&self) -> Option<&Token> {
        self.0.original.as_ref()
    }

    pub fn is_split(&self) -> bool {
        self.0.original.is_some()
    }

    /// True if both handles refer to the very same allocation.
    pub fn shares_allocation(&self, other: &Token) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Token {}

impl std::hash::Hash for Token {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Token");
        debug.field("id", &self.0.id);
        if let Some(payload) = &self.0.payload {
            debug.field("payload", payload);
        }
        if let Some(original) = &self.0.original {
            debug.field("original", &original.id());
        }
        debug.finish()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.original {
            Some(original) => write!(f, "{} (split of {})", self.0.id, original.id()),
            None => write!(f, "{}", self.0.id),
        }
    }
}
