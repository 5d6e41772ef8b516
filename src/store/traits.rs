//! `Database` trait: the key/value settings interface behind both the
//! durable workflow store and the ephemeral session store.

use async_trait::async_trait;

use crate::error::DatabaseError;

/// Backend-agnostic settings storage.
///
/// Values are JSON documents addressed by `(scope, key)`. A scope groups
/// everything that belongs to one workflow instance so it can be erased in
/// a single call.
#[async_trait]
pub trait Database: Send + Sync {
    /// Read a value. `Ok(None)` when the key is absent.
    async fn get_setting(
        &self,
        scope: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError>;

    /// Insert or replace a value.
    async fn set_setting(
        &self,
        scope: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    /// Delete a value. Returns whether a row was removed.
    async fn delete_setting(&self, scope: &str, key: &str) -> Result<bool, DatabaseError>;

    /// Delete every value in a scope. Returns the number of keys removed.
    async fn clear_scope(&self, scope: &str) -> Result<usize, DatabaseError>;
}
