//! Workplan Snapshots
//!
//! Serializable capture of an engine's mutable state: the tokens each place
//! holds and the buffered state of every stateful transition, recursively
//! through nested sub-workflow engines. Tokens are stored once in a table
//! and referenced by id, so split siblings still share one original after a
//! round trip.
//!
//! Snapshots are saved to `.workplan/{workplan_stem}.snapshot.json` by
//! default.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::token::{Token, TokenId};
use crate::error::{EngineError, Result};

/// Directory used for snapshots when no explicit path is given.
pub const SNAPSHOT_DIR: &str = ".workplan";

/// One entry of the token table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TokenRecord {
    pub id: TokenId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    /// Set for split tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<TokenId>,
}

/// Tokens held by one place.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlaceSnapshot {
    pub place: String,
    pub tokens: Vec<TokenId>,
}

/// Partially filled join buffer for one split event.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JoinGenerationSnapshot {
    pub original: TokenId,
    pub slots: Vec<Option<TokenId>>,
}

/// Buffered, not yet committed state of a transition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionStateSnapshot {
    Join {
        generations: Vec<JoinGenerationSnapshot>,
    },
    SubWorkflow {
        token: TokenId,
        child: Box<WorkplanSnapshot>,
    },
    Task {
        held: Vec<TokenId>,
    },
}

/// Buffered state of one transition, addressed by step id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransitionSnapshot {
    pub step: String,
    pub state: TransitionStateSnapshot,
}

/// Everything needed to rebuild a paused engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkplanSnapshot {
    pub workplan_id: String,
    pub version: u32,

    /// Fingerprint of the definition the snapshot was captured from
    pub fingerprint: String,

    pub captured_at: DateTime<Utc>,

    pub tokens: Vec<TokenRecord>,

    pub places: Vec<PlaceSnapshot>,

    #[serde(default)]
    pub transitions: Vec<TransitionSnapshot>,
}

impl WorkplanSnapshot {
    /// Token ids held by a place, empty if the place holds nothing.
    pub fn place_tokens(&self, place: &str) -> Vec<TokenId> {
        self.places
            .iter()
            .find(|p| p.place == place)
            .map(|p| p.tokens.clone())
            .unwrap_or_default()
    }

    pub fn transition(&self, step: &str) -> Option<&TransitionStateSnapshot> {
        self.transitions
            .iter()
            .find(|t| t.step == step)
            .map(|t| &t.state)
    }

    /// Number of nested engines captured, at any depth.
    pub fn nested_count(&self) -> usize {
        self.transitions
            .iter()
            .map(|t| match &t.state {
                TransitionStateSnapshot::SubWorkflow { child, .. } => 1 + child.nested_count(),
                _ => 0,
            })
            .sum()
    }

    /// Saves the snapshot as pretty JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;

        info!("Saved snapshot of '{}' to {}", self.workplan_id, path.display());
        Ok(())
    }

    /// Loads a snapshot from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let snapshot: WorkplanSnapshot = serde_json::from_str(&content)?;

        info!(
            "Loaded snapshot of '{}' captured at {}",
            snapshot.workplan_id, snapshot.captured_at
        );
        Ok(snapshot)
    }

    /// Default snapshot location for a workplan file.
    pub fn default_path_for(workplan_path: impl AsRef<Path>) -> PathBuf {
        let stem = workplan_path
            .as_ref()
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("workplan");

        Path::new(SNAPSHOT_DIR).join(format!("{}.snapshot.json", stem))
    }
}

/// Collects tokens into a table while a snapshot is captured.
#[derive(Debug, Default)]
pub(crate) struct TokenTable {
    records: Vec<TokenRecord>,
    seen: HashSet<TokenId>,
}

impl TokenTable {
    /// Records a token (and its original first) and returns its id.
    pub(crate) fn register(&mut self, token: &Token) -> TokenId {
        if let Some(original) = token.original() {
            self.register(original);
        }
        if self.seen.insert(token.id()) {
            self.records.push(TokenRecord {
                id: token.id(),
                payload: token.payload().cloned(),
                original: token.original().map(Token::id),
            });
        }
        token.id()
    }

    pub(crate) fn into_records(self) -> Vec<TokenRecord> {
        self.records
    }
}

/// Tokens rebuilt from a snapshot's table, identities preserved.
#[derive(Debug)]
pub(crate) struct RestoredTokens {
    workplan: String,
    tokens: HashMap<TokenId, Token>,
}

impl RestoredTokens {
    pub(crate) fn from_records(workplan: &str, records: &[TokenRecord]) -> Result<Self> {
        let by_id: HashMap<TokenId, &TokenRecord> = records.iter().map(|r| (r.id, r)).collect();
        let mut restored = Self {
            workplan: workplan.to_string(),
            tokens: HashMap::new(),
        };

        for record in records {
            restored.build(record.id, &by_id, 0)?;
        }
        Ok(restored)
    }

    fn build(&mut self, id: TokenId, by_id: &HashMap<TokenId, &TokenRecord>, depth: usize) -> Result<Token> {
        if let Some(token) = self.tokens.get(&id) {
            return Ok(token.clone());
        }
        if depth > by_id.len() {
            return Err(self.mismatch(format!("token {} has a cyclic original chain", id)));
        }

        let record = by_id
            .get(&id)
            .copied()
            .ok_or_else(|| self.mismatch(format!("token {} is missing from the token table", id)))?;

        let original = match record.original {
            Some(original) => Some(self.build(original, by_id, depth + 1)?),
            None => None,
        };

        let token = Token::from_parts(id, record.payload.clone(), original);
        self.tokens.insert(id, token.clone());
        Ok(token)
    }

    /// Looks up a restored token.
    pub(crate) fn resolve(&self, id: TokenId) -> Result<Token> {
        self.tokens
            .get(&id)
            .cloned()
            .ok_or_else(|| self.mismatch(format!("token {} is missing from the token table", id)))
    }

    pub(crate) fn mismatch(&self, reason: String) -> EngineError {
        EngineError::SnapshotMismatch {
            workplan: self.workplan.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn sample() -> WorkplanSnapshot {
        WorkplanSnapshot {
            workplan_id: "assembly".to_string(),
            version: 1,
            fingerprint: "abc".to_string(),
            captured_at: Utc::now(),
            tokens: Vec::new(),
            places: Vec::new(),
            transitions: Vec::new(),
        }
    }

    #[test]
    fn test_token_table_preserves_shared_original() {
        let original = Token::with_payload(json!("A-100"));
        let left = Token::split_of(&original);
        let right = Token::split_of(&original);

        let mut table = TokenTable::default();
        table.register(&left);
        table.register(&right);
        let records = table.into_records();

        // original recorded once, before its splits
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].id, original.id());

        let restored = RestoredTokens::from_records("assembly", &records).unwrap();
        let left2 = restored.resolve(left.id()).unwrap();
        let right2 = restored.resolve(right.id()).unwrap();

        assert_eq!(left2, left);
        assert!(left2.original().unwrap().shares_allocation(right2.original().unwrap()));
        assert_eq!(left2.effective_payload(), Some(&json!("A-100")));
    }

    #[test]
    fn test_restore_rejects_dangling_original() {
        let records = vec![TokenRecord {
            id: TokenId::new(),
            payload: None,
            original: Some(TokenId::new()),
        }];
        let result = RestoredTokens::from_records("assembly", &records);
        assert!(matches!(result, Err(EngineError::SnapshotMismatch { .. })));
    }

    #[test]
    fn test_restore_rejects_cycles() {
        let a = TokenId::new();
        let b = TokenId::new();
        let records = vec![
            TokenRecord { id: a, payload: None, original: Some(b) },
            TokenRecord { id: b, payload: None, original: Some(a) },
        ];
        let result = RestoredTokens::from_records("assembly", &records);
        assert!(matches!(result, Err(EngineError::SnapshotMismatch { .. })));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("assembly.snapshot.json");

        let mut snapshot = sample();
        let held = TokenId::new();
        snapshot.tokens.push(TokenRecord { id: held, payload: None, original: None });
        snapshot.places.push(PlaceSnapshot {
            place: "buffer".to_string(),
            tokens: vec![held],
        });
        snapshot.transitions.push(TransitionSnapshot {
            step: "inspect".to_string(),
            state: TransitionStateSnapshot::SubWorkflow {
                token: held,
                child: Box::new(sample()),
            },
        });

        snapshot.save(&path).unwrap();
        let loaded = WorkplanSnapshot::load(&path).unwrap();

        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.place_tokens("buffer"), vec![held]);
        assert!(loaded.place_tokens("elsewhere").is_empty());
        assert_eq!(loaded.nested_count(), 1);
    }

    #[test]
    fn test_load_nonexistent() {
        let result = WorkplanSnapshot::load("/nonexistent/path/snapshot.json");
        assert!(matches!(result, Err(EngineError::Io(_))));
    }

    #[test]
    fn test_default_path_for() {
        let path = WorkplanSnapshot::default_path_for("recipes/housing.yaml");
        assert_eq!(path, Path::new(".workplan").join("housing.snapshot.json"));

        let path = WorkplanSnapshot::default_path_for("");
        assert_eq!(path, Path::new(".workplan").join("workplan.snapshot.json"));
    }
}
