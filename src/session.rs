use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{Result, SayrError};
use crate::message::Message;

/// Key/value state shared by the agents of a session.
pub type StateMap = Map<String, Value>;

/// Identifies a session by application, user and session id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.app_name, self.user_id, self.session_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Agent,
    Tool,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Agent => "agent",
            TurnRole::Tool => "tool",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(TurnRole::User),
            "agent" => Some(TurnRole::Agent),
            "tool" => Some(TurnRole::Tool),
            _ => None,
        }
    }
}

/// One immutable entry of a session's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub author: String,
    pub content: String,
    pub timestamp: SystemTime,
}

impl Turn {
    pub fn new(role: TurnRole, author: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role,
            author: author.into(),
            content: content.into(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TurnRole::User, "user", content)
    }

    pub fn agent(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(TurnRole::Agent, author, content)
    }

    pub fn tool(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(TurnRole::Tool, author, content)
    }

    /// Model-facing rendering of this turn.
    pub fn to_message(&self) -> Message {
        match self.role {
            TurnRole::User => Message::user(&self.content),
            TurnRole::Agent => Message::assistant(&self.content),
            TurnRole::Tool => Message {
                role: crate::message::Role::Tool,
                content: self.content.clone(),
                tool_call: None,
                tool_result: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub key: SessionKey,
    pub turns: Vec<Turn>,
    #[serde(default)]
    pub state: StateMap,
}

impl Session {
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            turns: Vec::new(),
            state: StateMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.key.session_id
    }

    pub fn last_turn(&self) -> Option<&Turn> {
        self.turns.last()
    }
}

/// Ordered turn history per session key.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Return the session for `key`, creating an empty one when absent.
    async fn get_or_create(&self, key: &SessionKey) -> Result<Session>;

    async fn get(&self, key: &SessionKey) -> Result<Option<Session>>;

    async fn append_turn(&self, key: &SessionKey, turn: Turn) -> Result<()>;

    /// Append several turns as one unit. Backends that can do so atomically should override.
    async fn append_turns(&self, key: &SessionKey, turns: Vec<Turn>) -> Result<()> {
        for turn in turns {
            self.append_turn(key, turn).await?;
        }
        Ok(())
    }

    /// Insert every entry of `delta` into the session state, replacing existing keys.
    async fn merge_state(&self, key: &SessionKey, delta: StateMap) -> Result<()>;

    /// Write a completed turn: merge `delta` into the state and append `turns`.
    /// Either both land or neither does.
    async fn commit_turn(&self, key: &SessionKey, turns: Vec<Turn>, delta: StateMap)
        -> Result<()>;

    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<SessionKey>>;

    async fn delete(&self, key: &SessionKey) -> Result<bool>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionKey, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_or_create(&self, key: &SessionKey) -> Result<Session> {
        if let Some(existing) = self.sessions.read().await.get(key) {
            return Ok(existing.clone());
        }
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(key.clone())
            .or_insert_with(|| Session::new(key.clone()));
        Ok(session.clone())
    }

    async fn get(&self, key: &SessionKey) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(key).cloned())
    }

    async fn append_turn(&self, key: &SessionKey, turn: Turn) -> Result<()> {
        self.append_turns(key, vec![turn]).await
    }

    async fn append_turns(&self, key: &SessionKey, turns: Vec<Turn>) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(key)
            .ok_or_else(|| SayrError::SessionNotFound(key.to_string()))?;
        session.turns.extend(turns);
        Ok(())
    }

    async fn merge_state(&self, key: &SessionKey, delta: StateMap) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(key)
            .ok_or_else(|| SayrError::SessionNotFound(key.to_string()))?;
        session.state.extend(delta);
        Ok(())
    }

    async fn commit_turn(
        &self,
        key: &SessionKey,
        turns: Vec<Turn>,
        delta: StateMap,
    ) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(key)
            .ok_or_else(|| SayrError::SessionNotFound(key.to_string()))?;
        session.state.extend(delta);
        session.turns.extend(turns);
        Ok(())
    }

    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<SessionKey>> {
        let mut keys: Vec<SessionKey> = self
            .sessions
            .read()
            .await
            .keys()
            .filter(|k| k.app_name == app_name && k.user_id == user_id)
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &SessionKey) -> Result<bool> {
        Ok(self.sessions.write().await.remove(key).is_some())
    }
}

/// Build the session store selected by `cfg`.
pub async fn session_store_from_config(cfg: &StorageConfig) -> Result<Arc<dyn SessionStore>> {
    match cfg.backend {
        StorageBackend::Memory => Ok(Arc::new(InMemorySessionStore::new())),
        #[cfg(feature = "persistence")]
        StorageBackend::Sqlite => {
            let url = cfg.database_url.as_deref().ok_or_else(|| {
                SayrError::Config("sqlite storage requires a database url".into())
            })?;
            Ok(Arc::new(crate::storage::SqlSessionStore::connect(url).await?))
        }
        #[cfg(not(feature = "persistence"))]
        StorageBackend::Sqlite => Err(SayrError::Config(
            "sqlite storage needs the `persistence` feature".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let store = InMemorySessionStore::new();
        let key = SessionKey::new("app", "user", "s1");

        store.get_or_create(&key).await.unwrap();
        store.append_turn(&key, Turn::user("hello")).await.unwrap();
        let again = store.get_or_create(&key).await.unwrap();

        assert_eq!(again.turns.len(), 1);
        assert_eq!(store.list_sessions("app", "user").await.unwrap(), vec![key]);
    }

    #[tokio::test]
    async fn append_preserves_order() {
        let store = InMemorySessionStore::new();
        let key = SessionKey::new("app", "user", "ordered");
        store.get_or_create(&key).await.unwrap();

        for text in ["one", "two", "three"] {
            store.append_turn(&key, Turn::user(text)).await.unwrap();
        }

        let session = store.get(&key).await.unwrap().unwrap();
        let contents: Vec<&str> = session.turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn append_to_missing_session_fails() {
        let store = InMemorySessionStore::new();
        let key = SessionKey::new("app", "user", "ghost");
        let err = store.append_turn(&key, Turn::user("hi")).await.unwrap_err();
        assert!(matches!(err, SayrError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn merge_state_is_last_write_wins() {
        let store = InMemorySessionStore::new();
        let key = SessionKey::new("app", "user", "state");
        store.get_or_create(&key).await.unwrap();

        let mut first = StateMap::new();
        first.insert("outline".into(), json!("v1"));
        first.insert("draft".into(), json!("d1"));
        store.merge_state(&key, first).await.unwrap();

        let mut second = StateMap::new();
        second.insert("outline".into(), json!("v2"));
        store.merge_state(&key, second).await.unwrap();

        let session = store.get(&key).await.unwrap().unwrap();
        assert_eq!(session.state.get("outline"), Some(&json!("v2")));
        assert_eq!(session.state.get("draft"), Some(&json!("d1")));
    }

    #[tokio::test]
    async fn commit_turn_writes_turns_and_state_together() {
        let store = InMemorySessionStore::new();
        let key = SessionKey::new("app", "user", "commit");
        store.get_or_create(&key).await.unwrap();

        let mut delta = StateMap::new();
        delta.insert("blog_draft".into(), json!("DRAFT"));
        store
            .commit_turn(
                &key,
                vec![Turn::user("write"), Turn::agent("writer", "DRAFT")],
                delta.clone(),
            )
            .await
            .unwrap();

        let session = store.get(&key).await.unwrap().unwrap();
        assert_eq!(session.turns.len(), 2);
        assert_eq!(session.state.get("blog_draft"), Some(&json!("DRAFT")));

        let ghost = SessionKey::new("app", "user", "ghost");
        let err = store
            .commit_turn(&ghost, vec![Turn::user("hi")], delta)
            .await
            .unwrap_err();
        assert!(matches!(err, SayrError::SessionNotFound(_)));
        assert!(store.get(&ghost).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_backend_is_the_default() {
        let store = session_store_from_config(&StorageConfig::default())
            .await
            .unwrap();
        let key = SessionKey::new("app", "user", "fresh");
        assert!(store.get_or_create(&key).await.unwrap().turns.is_empty());
    }

    #[tokio::test]
    async fn sessions_are_scoped_by_user() {
        let store = InMemorySessionStore::new();
        store
            .get_or_create(&SessionKey::new("app", "alice", "a"))
            .await
            .unwrap();
        store
            .get_or_create(&SessionKey::new("app", "bob", "b"))
            .await
            .unwrap();

        let alice = store.list_sessions("app", "alice").await.unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].session_id, "a");
        assert!(store
            .delete(&SessionKey::new("app", "bob", "b"))
            .await
            .unwrap());
        assert!(store.list_sessions("app", "bob").await.unwrap().is_empty());
    }
}
