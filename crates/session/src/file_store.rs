//! File-backed session store: one JSON document per conversation.
//!
//! Storage location: `~/.clinscribe/sessions/<encoded conversation_id>.json`.
//! Bytes outside `[A-Za-z0-9-]` are written as `_XX` hex, so distinct ids
//! never share a file.
//!
//! Every write goes to a temporary sibling file and is renamed into place,
//! so a reader never observes a half-written session and a multi-field
//! merge is all-or-nothing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clinscribe_core::error::SessionError;
use clinscribe_core::message::ConversationId;
use clinscribe_core::session::{SessionState, SessionStore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::in_memory::expiry_after;

#[derive(Serialize, Deserialize)]
struct StoredSession {
    expires_at: DateTime<Utc>,
    state: SessionState,
}

/// A session store writing JSON files under a directory.
pub struct FileSessionStore {
    dir: PathBuf,
    // Serialises read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl FileSessionStore {
    /// Create a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        debug!(path = %dir.display(), "File session store opened");
        Self {
            dir,
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, id: &ConversationId) -> PathBuf {
        let mut name = String::with_capacity(id.as_str().len() + 5);
        for byte in id.as_str().bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                name.push(byte as char);
            } else {
                name.push_str(&format!("_{byte:02x}"));
            }
        }
        name.push_str(".json");
        self.dir.join(name)
    }

    /// Read the session stored for `id`. A file holding another
    /// conversation reads as absent.
    async fn read_session(&self, id: &ConversationId) -> Result<Option<StoredSession>, SessionError> {
        let path = self.path_for(id);
        Ok(self.read(&path).await?.filter(|stored| {
            let matches = stored.state.conversation_id == *id;
            if !matches {
                warn!(path = %path.display(), "Session file belongs to another conversation");
            }
            matches
        }))
    }

    async fn read(&self, path: &Path) -> Result<Option<StoredSession>, SessionError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SessionError::Storage(format!(
                    "Failed to read session file {}: {e}",
                    path.display()
                )));
            }
        };

        match serde_json::from_slice::<StoredSession>(&bytes) {
            Ok(stored) if Utc::now() < stored.expires_at => Ok(Some(stored)),
            Ok(_) => Ok(None),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring corrupted session file");
                Ok(None)
            }
        }
    }

    async fn write(&self, path: &Path, stored: &StoredSession) -> Result<(), SessionError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SessionError::Storage(format!("Failed to create session directory: {e}")))?;

        let json = serde_json::to_vec_pretty(stored)
            .map_err(|e| SessionError::Serialization(e.to_string()))?;

        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| SessionError::Storage(format!("Failed to write session file: {e}")))?;

        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(SessionError::Storage(format!("Failed to replace session file: {e}")));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, id: &ConversationId) -> Result<Option<SessionState>, SessionError> {
        Ok(self.read_session(id).await?.map(|s| s.state))
    }

    async fn put(&self, state: SessionState, ttl: Duration) -> Result<(), SessionError> {
        let stored = StoredSession {
            expires_at: expiry_after(ttl)?,
            state,
        };
        let path = self.path_for(&stored.state.conversation_id);
        let _guard = self.write_lock.lock().await;
        self.write(&path, &stored).await
    }

    async fn merge_fields(
        &self,
        id: &ConversationId,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), SessionError> {
        let path = self.path_for(id);
        let _guard = self.write_lock.lock().await;
        let mut stored = self
            .read_session(id)
            .await?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        stored.state.context.extend(fields);
        stored.state.touch();
        self.write(&path, &stored).await
    }

    async fn delete(&self, id: &ConversationId) -> Result<bool, SessionError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SessionError::Storage(e.to_string())),
        }
    }

    /// Expired and unreadable files are removed.
    async fn purge_expired(&self) -> Result<usize, SessionError> {
        let _guard = self.write_lock.lock().await;
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(SessionError::Storage(e.to_string())),
        };

        let mut removed = 0;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| SessionError::Storage(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if self.read(&path).await?.is_none() && tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn put_get_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let id = ConversationId::from("conv-1");

        let store = FileSessionStore::new(dir.path());
        let mut state = SessionState::new(id.clone(), "web_assistant");
        state.messages.push(clinscribe_core::Message::user("hello"));
        store.put(state, HOUR).await.unwrap();

        let reopened = FileSessionStore::new(dir.path());
        let loaded = reopened.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.messages[0].content, "hello");
    }

    #[tokio::test]
    async fn merge_is_applied_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let id = ConversationId::from("conv-2");
        let store = FileSessionStore::new(dir.path());
        store.put(SessionState::new(id.clone(), "web_assistant"), HOUR).await.unwrap();

        let mut fields = serde_json::Map::new();
        fields.insert("last_client_id".into(), "x".into());
        fields.insert("last_client_name".into(), "Jane".into());
        store.merge_fields(&id, fields).await.unwrap();

        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.context.len(), 2);

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["conv-2.json".to_string()]);
    }

    #[tokio::test]
    async fn expired_and_corrupted_files_read_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        store
            .put(SessionState::new(ConversationId::from("old"), "web_assistant"), Duration::ZERO)
            .await
            .unwrap();
        std::fs::write(dir.path().join("broken.json"), "not json").unwrap();

        assert!(store.get(&ConversationId::from("old")).await.unwrap().is_none());
        assert!(store.get(&ConversationId::from("broken")).await.unwrap().is_none());
        assert_eq!(store.purge_expired().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn path_is_sanitised() {
        let store = FileSessionStore::new("/tmp/sessions");
        let path = store.path_for(&ConversationId::from("../../etc/passwd"));
        assert_eq!(path, PathBuf::from("/tmp/sessions/_2e_2e_2f_2e_2e_2fetc_2fpasswd.json"));
    }

    #[tokio::test]
    async fn similar_ids_do_not_share_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let mut state = SessionState::new(ConversationId::from("conv_1"), "web_assistant");
        state.auth_token = Some("secret-of-conv_1".into());
        store.put(state, HOUR).await.unwrap();

        let other = ConversationId::from("conv.1");
        assert_ne!(store.path_for(&other), store.path_for(&ConversationId::from("conv_1")));
        assert!(store.get(&other).await.unwrap().is_none());
        assert!(matches!(
            store.merge_field(&other, "k", "v".into()).await,
            Err(SessionError::NotFound(_))
        ));
        let own = store.get(&ConversationId::from("conv_1")).await.unwrap().unwrap();
        assert!(own.context.is_empty());
    }

    #[tokio::test]
    async fn file_holding_another_conversation_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        store
            .put(SessionState::new(ConversationId::from("a"), "web_assistant"), HOUR)
            .await
            .unwrap();
        std::fs::copy(dir.path().join("a.json"), dir.path().join("b.json")).unwrap();

        assert!(store.get(&ConversationId::from("b")).await.unwrap().is_none());
        assert!(store.get(&ConversationId::from("a")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_and_missing_merge() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let id = ConversationId::from("gone");
        assert!(!store.delete(&id).await.unwrap());
        assert!(matches!(
            store.merge_field(&id, "k", "v".into()).await,
            Err(SessionError::NotFound(_))
        ));
    }
}
