use std::path::{Path, PathBuf};

use polystep_types::{ItemsQuery, StateEntry};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use super::{StateAdapter, StateDocument, StateError, collect_items};

/// State persisted as one JSON document, rewritten on every mutation.
#[derive(Debug)]
pub struct FileStateAdapter {
    path: PathBuf,
    document: RwLock<StateDocument>,
}

impl FileStateAdapter {
    /// Opens the document at `path`, starting empty when it does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let document = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => StateDocument::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => StateDocument::new(),
            Err(error) => {
                return Err(StateError::storage(format!(
                    "failed to read state file {}: {error}",
                    path.display()
                )));
            }
        };
        debug!(path = %path.display(), groups = document.len(), "Opened state file");
        Ok(Self {
            path,
            document: RwLock::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, document: &StateDocument) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| StateError::storage(format!("failed to create {}: {error}", parent.display())))?;
        }
        let content = serde_json::to_string_pretty(document)?;
        let staging = self.path.with_extension("tmp");
        tokio::fs::write(&staging, content)
            .await
            .map_err(|error| StateError::storage(format!("failed to write {}: {error}", staging.display())))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|error| StateError::storage(format!("failed to replace {}: {error}", self.path.display())))
    }
}

#[async_trait::async_trait]
impl StateAdapter for FileStateAdapter {
    async fn get(&self, group_id: &str, key: &str) -> Result<Option<Value>, StateError> {
        let document = self.document.read().await;
        Ok(document.get(group_id).and_then(|group| group.get(key)).cloned())
    }

    async fn set(&self, group_id: &str, key: &str, value: Value) -> Result<Value, StateError> {
        let mut document = self.document.write().await;
        let mut next = document.clone();
        next.entry(group_id.to_string())
            .or_default()
            .insert(key.to_string(), value.clone());
        self.persist(&next).await?;
        *document = next;
        Ok(value)
    }

    async fn delete(&self, group_id: &str, key: &str) -> Result<Option<Value>, StateError> {
        let mut document = self.document.write().await;
        if !document.get(group_id).is_some_and(|group| group.contains_key(key)) {
            return Ok(None);
        }
        let mut next = document.clone();
        let removed = next.get_mut(group_id).and_then(|group| group.remove(key));
        if next.get(group_id).is_some_and(|group| group.is_empty()) {
            next.remove(group_id);
        }
        self.persist(&next).await?;
        *document = next;
        Ok(removed)
    }

    async fn get_group(&self, group_id: &str) -> Result<Vec<Value>, StateError> {
        let document = self.document.read().await;
        Ok(document
            .get(group_id)
            .map(|group| group.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear(&self, group_id: &str) -> Result<(), StateError> {
        let mut document = self.document.write().await;
        if !document.contains_key(group_id) {
            return Ok(());
        }
        let mut next = document.clone();
        next.remove(group_id);
        self.persist(&next).await?;
        *document = next;
        Ok(())
    }

    async fn items(&self, query: &ItemsQuery) -> Result<Vec<StateEntry>, StateError> {
        let document = self.document.read().await;
        Ok(collect_items(&document, query))
    }
}
