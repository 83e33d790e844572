//! Session store trait and the per-conversation resolution cache.
//!
//! The session store is durable, TTL'd key-value state keyed by
//! conversation id. It holds the transcript, the caller's auth context and
//! a free-form context map. The resolution cache lives inside that context
//! map under fixed keys.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::SessionError;
use crate::message::{ConversationId, Message};

/// Context-map key for the last resolved client id.
pub const LAST_CLIENT_ID: &str = "last_client_id";
/// Context-map key for the display name that goes with `last_client_id`.
pub const LAST_CLIENT_NAME: &str = "last_client_name";
/// Context-map key for the last resolved conversation assignment id.
pub const LAST_ASSIGNMENT_ID: &str = "last_assignment_id";

/// Durable state of one conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub conversation_id: ConversationId,

    /// Persona the conversation was opened with
    pub persona: String,

    /// Stored transcript (user and final assistant messages)
    #[serde(default)]
    pub messages: Vec<Message>,

    /// Free-form per-conversation context (page state, resolution cache)
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionState {
    pub fn new(conversation_id: ConversationId, persona: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            conversation_id,
            persona: persona.into(),
            messages: Vec::new(),
            context: serde_json::Map::new(),
            auth_token: None,
            profile_id: None,
            created_at: now,
            last_activity: now,
        }
    }

    /// The last `limit` stored messages.
    pub fn recent_messages(&self, limit: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(limit);
        &self.messages[start..]
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// The session store.
///
/// Implementations: in-memory TTL map, JSON files on disk.
/// Writes are last-writer-wins per field.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The backend name (e.g., "in_memory", "file").
    fn name(&self) -> &str;

    /// Load a session. Expired sessions read as absent.
    async fn get(&self, id: &ConversationId) -> std::result::Result<Option<SessionState>, SessionError>;

    /// Store a whole session, resetting its time-to-live.
    async fn put(&self, state: SessionState, ttl: Duration) -> std::result::Result<(), SessionError>;

    /// Merge several context fields at once. Either every field is applied
    /// or none is.
    async fn merge_fields(
        &self,
        id: &ConversationId,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> std::result::Result<(), SessionError>;

    /// Merge one context field.
    async fn merge_field(
        &self,
        id: &ConversationId,
        key: &str,
        value: serde_json::Value,
    ) -> std::result::Result<(), SessionError> {
        let mut fields = serde_json::Map::new();
        fields.insert(key.to_string(), value);
        self.merge_fields(id, fields).await
    }

    /// Delete a session. Returns whether it existed.
    async fn delete(&self, id: &ConversationId) -> std::result::Result<bool, SessionError>;

    /// Drop every expired session. Returns how many were removed.
    async fn purge_expired(&self) -> std::result::Result<usize, SessionError>;
}

/// Whether a value is a fully resolved entity identifier.
///
/// Upstream ids are hyphenated UUIDs. Anything else (a display name, a
/// truncated id, a number the model made up) is not an identifier.
pub fn is_resolved_identifier(value: &str) -> bool {
    value.len() == 36 && uuid::Uuid::parse_str(value).is_ok()
}

/// Same as [`is_resolved_identifier`] for a JSON value.
pub fn is_resolved_identifier_value(value: Option<&serde_json::Value>) -> bool {
    value
        .and_then(|v| v.as_str())
        .is_some_and(is_resolved_identifier)
}

/// Best-effort memory of the last entities resolved in a conversation.
///
/// Never authoritative: it only fills gaps the model left.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionCache {
    pub client_id: Option<String>,
    pub client_name: Option<String>,
    pub assignment_id: Option<String>,
}

impl ResolutionCache {
    /// Seed from a session context map. Invalid stored ids are ignored.
    pub fn from_context(context: &serde_json::Map<String, serde_json::Value>) -> Self {
        let valid_id = |key: &str| {
            context
                .get(key)
                .and_then(|v| v.as_str())
                .filter(|s| is_resolved_identifier(s))
                .map(str::to_string)
        };
        Self {
            client_id: valid_id(LAST_CLIENT_ID),
            client_name: context
                .get(LAST_CLIENT_NAME)
                .and_then(|v| v.as_str())
                .map(str::to_string),
            assignment_id: valid_id(LAST_ASSIGNMENT_ID),
        }
    }

    /// Record a client. Returns the context fields that changed.
    ///
    /// Switching to another client drops the cached assignment, which
    /// belonged to the previous client; the change map then carries
    /// `null` for it.
    pub fn remember_client(
        &mut self,
        client_id: &str,
        client_name: Option<&str>,
    ) -> serde_json::Map<String, serde_json::Value> {
        let mut changed = serde_json::Map::new();
        if !is_resolved_identifier(client_id) {
            return changed;
        }
        if self.client_id.as_deref() != Some(client_id) {
            let switched = self.client_id.is_some();
            self.client_id = Some(client_id.to_string());
            changed.insert(LAST_CLIENT_ID.into(), client_id.into());
            if switched && self.assignment_id.take().is_some() {
                changed.insert(LAST_ASSIGNMENT_ID.into(), serde_json::Value::Null);
            }
        }
        if let Some(name) = client_name {
            if self.client_name.as_deref() != Some(name) {
                self.client_name = Some(name.to_string());
                changed.insert(LAST_CLIENT_NAME.into(), name.into());
            }
        }
        changed
    }

    /// Record an assignment id. Returns the context fields that changed.
    pub fn remember_assignment(&mut self, assignment_id: &str) -> serde_json::Map<String, serde_json::Value> {
        let mut changed = serde_json::Map::new();
        if is_resolved_identifier(assignment_id) && self.assignment_id.as_deref() != Some(assignment_id) {
            self.assignment_id = Some(assignment_id.to_string());
            changed.insert(LAST_ASSIGNMENT_ID.into(), assignment_id.into());
        }
        changed
    }

    /// The cached client id, if the cached name matches `name`
    /// (case-insensitive) or no name is given.
    pub fn client_id_for(&self, name: Option<&str>) -> Option<&str> {
        let id = self.client_id.as_deref()?;
        match (name, self.client_name.as_deref()) {
            (None, _) => Some(id),
            (Some(asked), Some(cached)) if asked.trim().eq_ignore_ascii_case(cached.trim()) => Some(id),
            _ => None,
        }
    }

    /// The cache as context-map fields, for writing back into a session.
    pub fn to_fields(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut fields = serde_json::Map::new();
        let entries = [
            (LAST_CLIENT_ID, &self.client_id),
            (LAST_CLIENT_NAME, &self.client_name),
            (LAST_ASSIGNMENT_ID, &self.assignment_id),
        ];
        for (key, value) in entries {
            if let Some(v) = value {
                fields.insert(key.into(), v.clone().into());
            }
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID_A: &str = "3f2b8c1e-5d4a-4e6f-9a7b-1c2d3e4f5a6b";
    const ID_B: &str = "9a8b7c6d-5e4f-4a3b-8c2d-1e0f9a8b7c6d";

    #[test]
    fn identifier_predicate_is_exact() {
        assert!(is_resolved_identifier(ID_A));
        assert!(!is_resolved_identifier("Jane Doe"));
        assert!(!is_resolved_identifier("3f2b8c1e"));
        assert!(!is_resolved_identifier(&ID_A.replace('-', "")));
        assert!(!is_resolved_identifier("zzzzzzzz-zzzz-zzzz-zzzz-zzzzzzzzzzzz"));
        assert!(!is_resolved_identifier_value(Some(&serde_json::json!(42))));
    }

    #[test]
    fn cache_seeds_from_context_and_drops_garbage() {
        let mut ctx = serde_json::Map::new();
        ctx.insert(LAST_CLIENT_ID.into(), ID_A.into());
        ctx.insert(LAST_CLIENT_NAME.into(), "Jane Doe".into());
        ctx.insert(LAST_ASSIGNMENT_ID.into(), "short".into());

        let cache = ResolutionCache::from_context(&ctx);
        assert_eq!(cache.client_id.as_deref(), Some(ID_A));
        assert_eq!(cache.client_name.as_deref(), Some("Jane Doe"));
        assert!(cache.assignment_id.is_none());
    }

    #[test]
    fn remember_reports_only_changes() {
        let mut cache = ResolutionCache::default();
        let changed = cache.remember_client(ID_A, Some("Jane Doe"));
        assert_eq!(changed.len(), 2);
        assert!(cache.remember_client(ID_A, Some("Jane Doe")).is_empty());
        assert!(cache.remember_client("not-an-id", Some("X")).is_empty());
        assert_eq!(cache.client_id.as_deref(), Some(ID_A));

        let changed = cache.remember_assignment(ID_B);
        assert_eq!(changed.get(LAST_ASSIGNMENT_ID).and_then(|v| v.as_str()), Some(ID_B));
    }

    #[test]
    fn switching_client_drops_its_assignment() {
        const ID_C: &str = "0b1c2d3e-4f5a-4b6c-8d7e-9f0a1b2c3d4e";
        let mut cache = ResolutionCache::default();
        cache.remember_client(ID_A, Some("Jane Doe"));
        cache.remember_assignment(ID_B);

        // Same client again keeps the assignment
        assert!(cache.remember_client(ID_A, None).is_empty());
        assert_eq!(cache.assignment_id.as_deref(), Some(ID_B));

        let changed = cache.remember_client(ID_C, Some("John Smith"));
        assert!(cache.assignment_id.is_none());
        assert_eq!(changed.get(LAST_ASSIGNMENT_ID), Some(&serde_json::Value::Null));
        assert_eq!(changed.get(LAST_CLIENT_ID).and_then(|v| v.as_str()), Some(ID_C));

        // A cleared field in a stored context seeds no assignment
        let mut ctx = cache.to_fields();
        ctx.extend(changed);
        assert!(ResolutionCache::from_context(&ctx).assignment_id.is_none());
    }

    #[test]
    fn client_id_for_requires_matching_name() {
        let mut cache = ResolutionCache::default();
        cache.remember_client(ID_A, Some("Jane Doe"));
        assert_eq!(cache.client_id_for(None), Some(ID_A));
        assert_eq!(cache.client_id_for(Some(" jane doe ")), Some(ID_A));
        assert_eq!(cache.client_id_for(Some("John Smith")), None);
    }

    #[test]
    fn fields_seed_an_equal_cache() {
        let mut cache = ResolutionCache::default();
        cache.remember_client(ID_A, Some("Jane Doe"));
        let fields = cache.to_fields();
        assert!(!fields.contains_key(LAST_ASSIGNMENT_ID));
        assert_eq!(ResolutionCache::from_context(&fields), cache);
    }

    #[test]
    fn recent_messages_tail() {
        let mut state = SessionState::new(ConversationId::from("c1"), "web_assistant");
        for i in 0..5 {
            state.messages.push(Message::user(format!("m{i}")));
        }
        let tail = state.recent_messages(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, "m3");
        assert_eq!(state.recent_messages(50).len(), 5);
    }
}
