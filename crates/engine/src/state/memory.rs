use polystep_types::{ItemsQuery, StateEntry};
use serde_json::Value;
use tokio::sync::RwLock;

use super::{StateAdapter, StateDocument, StateError, collect_items};

/// Process-local state. Lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStateAdapter {
    document: RwLock<StateDocument>,
}

impl MemoryStateAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StateAdapter for MemoryStateAdapter {
    async fn get(&self, group_id: &str, key: &str) -> Result<Option<Value>, StateError> {
        let document = self.document.read().await;
        Ok(document.get(group_id).and_then(|group| group.get(key)).cloned())
    }

    async fn set(&self, group_id: &str, key: &str, value: Value) -> Result<Value, StateError> {
        let mut document = self.document.write().await;
        document
            .entry(group_id.to_string())
            .or_default()
            .insert(key.to_string(), value.clone());
        Ok(value)
    }

    async fn delete(&self, group_id: &str, key: &str) -> Result<Option<Value>, StateError> {
        let mut document = self.document.write().await;
        let Some(group) = document.get_mut(group_id) else {
            return Ok(None);
        };
        let removed = group.remove(key);
        if group.is_empty() {
            document.remove(group_id);
        }
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
        self.document.write().await.remove(group_id);
        Ok(())
    }

    async fn items(&self, query: &ItemsQuery) -> Result<Vec<StateEntry>, StateError> {
        let document = self.document.read().await;
        Ok(collect_items(&document, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_then_get_and_delete() {
        let state = MemoryStateAdapter::new();
        state.set("t1", "order", json!({"id": "o1"})).await.unwrap();
        assert_eq!(state.get("t1", "order").await.unwrap(), Some(json!({"id": "o1"})));

        state.set("t1", "order", json!({"id": "o2"})).await.unwrap();
        assert_eq!(state.get("t1", "order").await.unwrap(), Some(json!({"id": "o2"})));

        assert_eq!(state.delete("t1", "order").await.unwrap(), Some(json!({"id": "o2"})));
        assert_eq!(state.get("t1", "order").await.unwrap(), None);
        assert_eq!(state.delete("t1", "order").await.unwrap(), None);
        assert_eq!(state.delete("nope", "nothing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn groups_are_isolated_and_clearable() {
        let state = MemoryStateAdapter::new();
        state.set("t1", "a", json!(1)).await.unwrap();
        state.set("t1", "b", json!(2)).await.unwrap();
        state.set("t2", "a", json!("other")).await.unwrap();

        assert_eq!(state.get_group("t1").await.unwrap(), vec![json!(1), json!(2)]);
        state.clear("t1").await.unwrap();
        assert!(state.get_group("t1").await.unwrap().is_empty());
        assert_eq!(state.get("t2", "a").await.unwrap(), Some(json!("other")));
    }

    #[tokio::test]
    async fn items_list_entries_with_type_names() {
        let state = MemoryStateAdapter::new();
        state.set("g", "flag", json!(true)).await.unwrap();
        state.set("g", "name", json!("pet")).await.unwrap();

        let items = state.items(&ItemsQuery::group("g")).await.unwrap();
        let types: Vec<&str> = items.iter().map(|entry| entry.value_type.as_str()).collect();
        assert_eq!(types, vec!["boolean", "string"]);
    }
}
