//! Scoped key/value state shared by all steps.
//!
//! Values live under `(groupId, key)`. Groups are opaque ids chosen by the
//! steps, usually a trace id. Writes are last-writer-wins and there is no
//! implicit expiry.

mod file;
mod memory;

pub use file::FileStateAdapter;
pub use memory::MemoryStateAdapter;

use std::collections::BTreeMap;

use polystep_types::{ItemsQuery, StateEntry};
use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by state backends. Callers see them unchanged.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("{reason}")]
    Storage { reason: String },

    #[error("State serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StateError {
    pub fn storage(reason: impl Into<String>) -> Self {
        Self::Storage { reason: reason.into() }
    }
}

impl From<StateError> for polystep_rpc::RpcError {
    fn from(error: StateError) -> Self {
        polystep_rpc::RpcError::handler(error.to_string())
    }
}

/// Backend contract for step state.
#[async_trait::async_trait]
pub trait StateAdapter: Send + Sync {
    async fn get(&self, group_id: &str, key: &str) -> Result<Option<Value>, StateError>;

    /// Stores `value`, replacing any previous one, and returns it.
    async fn set(&self, group_id: &str, key: &str, value: Value) -> Result<Value, StateError>;

    /// Removes a key. Deleting a missing key is not an error.
    async fn delete(&self, group_id: &str, key: &str) -> Result<Option<Value>, StateError>;

    /// Values of every key in the group, in key order.
    async fn get_group(&self, group_id: &str) -> Result<Vec<Value>, StateError>;

    /// Drops the whole group.
    async fn clear(&self, group_id: &str) -> Result<(), StateError>;

    /// Entries matching the query's group and filters.
    async fn items(&self, query: &ItemsQuery) -> Result<Vec<StateEntry>, StateError>;
}

/// In-memory layout shared by the bundled backends: group -> key -> value.
pub(crate) type StateDocument = BTreeMap<String, BTreeMap<String, Value>>;

pub(crate) fn collect_items(document: &StateDocument, query: &ItemsQuery) -> Vec<StateEntry> {
    document
        .iter()
        .filter(|(group_id, _)| query.group_id.as_deref().is_none_or(|wanted| wanted == group_id.as_str()))
        .flat_map(|(group_id, values)| {
            values
                .iter()
                .map(move |(key, value)| StateEntry::new(group_id.clone(), key.clone(), value.clone()))
        })
        .filter(|entry| query.matches(entry))
        .collect()
}
