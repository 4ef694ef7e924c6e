use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::session::{Session, SessionKey, TurnRole};

/// A searchable copy of one turn that outlives its source session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub app_name: String,
    pub user_id: String,
    pub source_session_id: String,
    pub author_role: TurnRole,
    pub author: String,
    pub content: String,
    pub timestamp: SystemTime,
}

/// Long-term memory fed from sessions and searched by free text.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Copy the session's turns into memory. Returns how many records were added.
    async fn persist(&self, session: &Session) -> Result<usize>;

    /// Records for `app_name`/`user_id` matching `query`, most relevant first.
    async fn search(&self, app_name: &str, user_id: &str, query: &str)
        -> Result<Vec<MemoryRecord>>;
}

#[derive(Default)]
struct MemoryState {
    records: Vec<MemoryRecord>,
    persisted_upto: HashMap<SessionKey, usize>,
}

/// Keyword-matching memory held in process.
///
/// Persisting copies turns verbatim. By default a session persisted twice is copied
/// twice; [`InMemoryMemoryStore::skip_persisted`] only copies turns not seen before.
#[derive(Default)]
pub struct InMemoryMemoryStore {
    state: RwLock<MemoryState>,
    skip_persisted: bool,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_persisted(mut self) -> Self {
        self.skip_persisted = true;
        self
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn persist(&self, session: &Session) -> Result<usize> {
        let mut state = self.state.write().await;
        let start = if self.skip_persisted {
            state
                .persisted_upto
                .get(&session.key)
                .copied()
                .unwrap_or(0)
                .min(session.turns.len())
        } else {
            0
        };

        let fresh: Vec<MemoryRecord> = session.turns[start..]
            .iter()
            .map(|turn| MemoryRecord {
                id: Uuid::new_v4(),
                app_name: session.key.app_name.clone(),
                user_id: session.key.user_id.clone(),
                source_session_id: session.key.session_id.clone(),
                author_role: turn.role,
                author: turn.author.clone(),
                content: turn.content.clone(),
                timestamp: turn.timestamp,
            })
            .collect();
        let added = fresh.len();
        state.records.extend(fresh);
        state
            .persisted_upto
            .insert(session.key.clone(), session.turns.len());

        tracing::debug!(session = %session.key, records = added, "persisted session to memory");
        Ok(added)
    }

    async fn search(
        &self,
        app_name: &str,
        user_id: &str,
        query: &str,
    ) -> Result<Vec<MemoryRecord>> {
        let query_words = words(query);
        if query_words.is_empty() {
            return Ok(Vec::new());
        }

        let state = self.state.read().await;
        let mut scored: Vec<(usize, usize, &MemoryRecord)> = state
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.app_name == app_name && r.user_id == user_id)
            .filter_map(|(idx, record)| {
                let record_words = words(&record.content);
                let score = query_words
                    .iter()
                    .filter(|w| record_words.contains(*w))
                    .count();
                (score > 0).then_some((score, idx, record))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.2.timestamp.cmp(&a.2.timestamp))
                .then_with(|| a.1.cmp(&b.1))
        });

        tracing::debug!(app = app_name, user = user_id, matches = scored.len(), "memory search");
        Ok(scored.into_iter().map(|(_, _, r)| r.clone()).collect())
    }
}
