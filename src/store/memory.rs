//! In-process `TaskStore`.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::DatabaseError;
use crate::store::traits::TaskStore;
use crate::sync::merge::prepare_for_storage;
use crate::task::Task;

/// `TaskStore` backed by hash maps. Used by tests and storage-less nodes.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<String, Task>>,
    active: RwLock<BTreeSet<String>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get(&self, instance_id: &str) -> Result<Option<Task>, DatabaseError> {
        Ok(self.tasks.read().await.get(instance_id).cloned())
    }

    async fn set(&self, instance_id: &str, task: &Task) -> Result<(), DatabaseError> {
        let stored = prepare_for_storage(task)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.tasks
            .write()
            .await
            .insert(instance_id.to_string(), stored);
        Ok(())
    }

    async fn has(&self, instance_id: &str) -> Result<bool, DatabaseError> {
        Ok(self.tasks.read().await.contains_key(instance_id))
    }

    async fn delete(&self, instance_id: &str) -> Result<(), DatabaseError> {
        self.tasks.write().await.remove(instance_id);
        self.active.write().await.remove(instance_id);
        Ok(())
    }

    async fn set_active(&self, instance_id: &str, active: bool) -> Result<(), DatabaseError> {
        let mut set = self.active.write().await;
        if active {
            set.insert(instance_id.to_string());
        } else {
            set.remove(instance_id);
        }
        Ok(())
    }

    async fn is_active(&self, instance_id: &str) -> Result<bool, DatabaseError> {
        Ok(self.active.read().await.contains(instance_id))
    }

    async fn active_ids(&self) -> Result<Vec<String>, DatabaseError> {
        Ok(self.active.read().await.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Command, NodeMeta};

    #[tokio::test]
    async fn set_strips_hop_metadata() {
        let store = MemoryTaskStore::new();
        let mut task = Task::new("root.ui.chat", "i1");
        task.command = Some(Command::Update);
        task.node = Some(NodeMeta {
            id: Some("n1".into()),
            ..Default::default()
        });

        store.set("i1", &task).await.unwrap();

        let stored = store.get("i1").await.unwrap().unwrap();
        assert!(stored.node.is_none());
        assert!(stored.command.is_none());
        assert_eq!(stored.id.as_deref(), Some("root.ui.chat"));
        assert!(store.has("i1").await.unwrap());
        assert!(!store.has("i2").await.unwrap());
    }

    #[tokio::test]
    async fn active_flag_toggles() {
        let store = MemoryTaskStore::new();
        store.set_active("b", true).await.unwrap();
        store.set_active("a", true).await.unwrap();
        assert_eq!(store.active_ids().await.unwrap(), vec!["a", "b"]);

        store.set_active("a", false).await.unwrap();
        assert!(!store.is_active("a").await.unwrap());
        assert!(store.is_active("b").await.unwrap());
    }

    #[tokio::test]
    async fn delete_clears_task_and_flag() {
        let store = MemoryTaskStore::new();
        store.set("i1", &Task::new("t", "i1")).await.unwrap();
        store.set_active("i1", true).await.unwrap();

        store.delete("i1").await.unwrap();
        assert!(store.get("i1").await.unwrap().is_none());
        assert!(!store.is_active("i1").await.unwrap());
        assert!(store.is_empty().await);
    }
}
