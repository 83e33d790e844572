//! In-memory session store with per-entry expiry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clinscribe_core::error::SessionError;
use clinscribe_core::message::ConversationId;
use clinscribe_core::session::{SessionState, SessionStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

struct Entry {
    state: SessionState,
    expires_at: DateTime<Utc>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A session store that lives in process memory. Lost on restart.
pub struct InMemorySessionStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn expiry_after(ttl: Duration) -> Result<DateTime<Utc>, SessionError> {
    let delta = chrono::Duration::from_std(ttl)
        .map_err(|e| SessionError::Storage(format!("Invalid session TTL: {e}")))?;
    Ok(Utc::now()
        .checked_add_signed(delta)
        .unwrap_or(DateTime::<Utc>::MAX_UTC))
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn get(&self, id: &ConversationId) -> Result<Option<SessionState>, SessionError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(id.as_str())
            .filter(|e| !e.is_expired(Utc::now()))
            .map(|e| e.state.clone()))
    }

    async fn put(&self, state: SessionState, ttl: Duration) -> Result<(), SessionError> {
        let expires_at = expiry_after(ttl)?;
        let key = state.conversation_id.as_str().to_string();
        self.entries
            .write()
            .await
            .insert(key, Entry { state, expires_at });
        Ok(())
    }

    async fn merge_fields(
        &self,
        id: &ConversationId,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), SessionError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(id.as_str())
            .filter(|e| !e.is_expired(Utc::now()))
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        entry.state.context.extend(fields);
        entry.state.touch();
        Ok(())
    }

    async fn delete(&self, id: &ConversationId) -> Result<bool, SessionError> {
        Ok(self.entries.write().await.remove(id.as_str()).is_some())
    }

    async fn purge_expired(&self) -> Result<usize, SessionError> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Purged expired sessions");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn state(id: &str) -> SessionState {
        SessionState::new(ConversationId::from(id), "web_assistant")
    }

    #[tokio::test]
    async fn put_and_get() {
        let store = InMemorySessionStore::new();
        let mut s = state("c1");
        s.auth_token = Some("Bearer t".into());
        store.put(s, HOUR).await.unwrap();

        let loaded = store.get(&ConversationId::from("c1")).await.unwrap().unwrap();
        assert_eq!(loaded.persona, "web_assistant");
        assert_eq!(loaded.auth_token.as_deref(), Some("Bearer t"));
        assert!(store.get(&ConversationId::from("c2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_session_reads_as_absent() {
        let store = InMemorySessionStore::new();
        store.put(state("c1"), Duration::ZERO).await.unwrap();
        assert!(store.get(&ConversationId::from("c1")).await.unwrap().is_none());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn merge_fields_applies_all() {
        let store = InMemorySessionStore::new();
        store.put(state("c1"), HOUR).await.unwrap();
        let id = ConversationId::from("c1");

        let mut fields = serde_json::Map::new();
        fields.insert("last_client_id".into(), "a".into());
        fields.insert("last_client_name".into(), "Jane".into());
        store.merge_fields(&id, fields).await.unwrap();
        store
            .merge_field(&id, "last_client_name", "Janet".into())
            .await
            .unwrap();

        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.context["last_client_id"], "a");
        assert_eq!(loaded.context["last_client_name"], "Janet");
    }

    #[tokio::test]
    async fn merge_into_missing_session_fails() {
        let store = InMemorySessionStore::new();
        let err = store
            .merge_field(&ConversationId::from("nope"), "k", "v".into())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = InMemorySessionStore::new();
        store.put(state("c1"), HOUR).await.unwrap();
        assert!(store.delete(&ConversationId::from("c1")).await.unwrap());
        assert!(!store.delete(&ConversationId::from("c1")).await.unwrap());
    }
}
