//! Session binder: the ephemeral id correlating one workflow instance
//! with provider and backend calls.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::store::Database;

const SESSION_KEY: &str = "session_id";

/// Reads and writes the session id in the ephemeral store.
#[derive(Clone)]
pub struct SessionBinder {
    store: Arc<dyn Database>,
    scope: String,
}

impl SessionBinder {
    pub fn new(store: Arc<dyn Database>, scope: impl Into<String>) -> Self {
        Self {
            store,
            scope: scope.into(),
        }
    }

    pub async fn session_id(&self) -> Option<String> {
        match self.store.get_setting(&self.scope, SESSION_KEY).await {
            Ok(value) => value.and_then(|v| v.as_str().map(String::from)),
            Err(e) => {
                warn!("Failed to read session id: {}", e);
                None
            }
        }
    }

    pub async fn set_session_id(&self, id: &str) {
        let value = serde_json::Value::String(id.to_string());
        if let Err(e) = self.store.set_setting(&self.scope, SESSION_KEY, &value).await {
            warn!("Failed to persist session id: {}", e);
        }
    }

    /// Return the bound session id, generating one if none exists.
    pub async fn ensure_session_id(&self) -> String {
        if let Some(id) = self.session_id().await {
            return id;
        }
        let id = Uuid::new_v4().to_string();
        self.set_session_id(&id).await;
        info!(session_id = %id, "Bound new workflow session");
        id
    }

    pub async fn clear_session(&self) {
        if let Err(e) = self.store.delete_setting(&self.scope, SESSION_KEY).await {
            warn!("Failed to clear session id: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;

    fn binder() -> SessionBinder {
        SessionBinder::new(Arc::new(MemoryBackend::new()), "kyc")
    }

    #[tokio::test]
    async fn set_get_clear() {
        let binder = binder();
        assert!(binder.session_id().await.is_none());

        binder.set_session_id("sess-1").await;
        assert_eq!(binder.session_id().await.as_deref(), Some("sess-1"));

        binder.clear_session().await;
        assert!(binder.session_id().await.is_none());
    }

    #[tokio::test]
    async fn ensure_is_stable() {
        let binder = binder();
        let first = binder.ensure_session_id().await;
        let second = binder.ensure_session_id().await;
        assert_eq!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());
    }
}
