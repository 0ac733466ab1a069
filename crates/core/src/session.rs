//! In-process session storage keyed by session id

use crate::domain::State;
use crate::error::{CoreError, CoreResult};
use crate::*;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Latest state recorded for a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub state: State,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, state: State) -> Self {
        Self {
            id: id.into(),
            state,
            updated_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, session_id: &str) -> CoreResult<Session>;

    async fn save_session(&self, session: Session) -> CoreResult<()>;

    async fn delete_session(&self, session_id: &str) -> CoreResult<()>;
}

/// Non-durable [`SessionStore`] backed by a map
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_session(&self, session_id: &str) -> CoreResult<Session> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| CoreError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    async fn save_session(&self, session: Session) -> CoreResult<()> {
        if session.id.is_empty() {
            return Err(CoreError::InvalidArgument {
                reason: "session id cannot be empty".to_string(),
            });
        }
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> CoreResult<()> {
        self.sessions.write().await.remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_save_get_delete() {
        let store = MemorySessionStore::new();
        let mut state = State::new();
        state.set("turns", 2);

        assert_ok!(store.save_session(Session::new("s-1", state)).await);
        let session = assert_ok!(store.get_session("s-1").await);
        assert_eq!(session.state.get("turns"), Some(&json!(2)));

        assert_ok!(store.delete_session("s-1").await);
        let missing = store.get_session("s-1").await;
        assert!(matches!(missing, Err(CoreError::SessionNotFound { .. })));
    }

    #[tokio::test]
    async fn test_rejects_empty_id() {
        let store = MemorySessionStore::new();
        let err = assert_err!(store.save_session(Session::new("", State::new())).await);
        assert!(matches!(err, CoreError::InvalidArgument { .. }));
        assert_eq!(store.len().await, 0);
    }
}
