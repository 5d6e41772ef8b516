//! In-memory `Database`: backs the ephemeral session store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::DatabaseError;
use crate::store::traits::Database;

/// Process-lifetime settings map. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<(String, String), serde_json::Value>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Database for MemoryBackend {
    async fn get_setting(
        &self,
        scope: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError> {
        let entries = self.entries.read().await;
        Ok(entries.get(&(scope.to_string(), key.to_string())).cloned())
    }

    async fn set_setting(
        &self,
        scope: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let mut entries = self.entries.write().await;
        entries.insert((scope.to_string(), key.to_string()), value.clone());
        Ok(())
    }

    async fn delete_setting(&self, scope: &str, key: &str) -> Result<bool, DatabaseError> {
        let mut entries = self.entries.write().await;
        Ok(entries
            .remove(&(scope.to_string(), key.to_string()))
            .is_some())
    }

    async fn clear_scope(&self, scope: &str) -> Result<usize, DatabaseError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|(s, _), _| s != scope);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn roundtrip_and_clear() {
        let db = MemoryBackend::new();
        db.set_setting("kyc", "session_id", &json!("abc"))
            .await
            .unwrap();
        db.set_setting("other", "session_id", &json!("def"))
            .await
            .unwrap();

        assert_eq!(
            db.get_setting("kyc", "session_id").await.unwrap(),
            Some(json!("abc"))
        );
        assert_eq!(db.clear_scope("kyc").await.unwrap(), 1);
        assert!(db.get_setting("kyc", "session_id").await.unwrap().is_none());
        assert!(db.get_setting("other", "session_id").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_missing_key() {
        let db = MemoryBackend::new();
        assert!(!db.delete_setting("kyc", "missing").await.unwrap());
    }
}
