//! Namespaced key-value store
//!
//! Long-term memory shared across runs (agent memories, user preferences).
//! Namespaces are hierarchical segment lists; search matches by namespace
//! prefix.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// A stored item with its namespace and timestamps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreItem {
    pub namespace: Vec<String>,
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Errors from store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Persistent key-value storage scoped by namespace
#[async_trait]
pub trait Store: Send + Sync {
    async fn put(
        &self,
        namespace: &[String],
        key: &str,
        value: Value,
    ) -> Result<(), StoreError>;

    async fn get(&self, namespace: &[String], key: &str) -> Result<Option<StoreItem>, StoreError>;

    async fn delete(&self, namespace: &[String], key: &str) -> Result<(), StoreError>;

    /// List items under a namespace prefix, newest first
    async fn search(
        &self,
        namespace_prefix: &[String],
        limit: Option<usize>,
    ) -> Result<Vec<StoreItem>, StoreError>;
}

/// In-memory store implementation
#[derive(Default)]
pub struct InMemoryStore {
    items: RwLock<HashMap<(Vec<String>, String), StoreItem>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put(
        &self,
        namespace: &[String],
        key: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut items = self
            .items
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry_key = (namespace.to_vec(), key.to_string());
        match items.get_mut(&entry_key) {
            Some(item) => {
                item.value = value;
                item.updated_at = now;
            }
            None => {
                items.insert(
                    entry_key,
                    StoreItem {
                        namespace: namespace.to_vec(),
                        key: key.to_string(),
                        value,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
        Ok(())
    }

    async fn get(&self, namespace: &[String], key: &str) -> Result<Option<StoreItem>, StoreError> {
        let items = self
            .items
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(items.get(&(namespace.to_vec(), key.to_string())).cloned())
    }

    async fn delete(&self, namespace: &[String], key: &str) -> Result<(), StoreError> {
        let mut items = self
            .items
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        items.remove(&(namespace.to_vec(), key.to_string()));
        Ok(())
    }

    async fn search(
        &self,
        namespace_prefix: &[String],
        limit: Option<usize>,
    ) -> Result<Vec<StoreItem>, StoreError> {
        let items = self
            .items
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut found: Vec<_> = items
            .values()
            .filter(|item| {
                item.namespace.len() >= namespace_prefix.len()
                    && item.namespace[..namespace_prefix.len()] == namespace_prefix[..]
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = limit {
            found.truncate(limit);
        }
        Ok(found)
    }
}
