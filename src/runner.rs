//! Drives user queries through an agent and commits the results to a session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};

use crate::agent::{Agent, InvocationContext};
use crate::error::{Result, SayrError};
use crate::memory::{InMemoryMemoryStore, MemoryRecord, MemoryStore};
use crate::metrics::MetricsTracker;
use crate::session::{InMemorySessionStore, Session, SessionKey, SessionStore, StateMap, Turn};

const DEBUG_USER_ID: &str = "debug_user_id";
const DEBUG_SESSION_ID: &str = "debug_session_id";

/// Progress notifications published while turns run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerEvent {
    TurnStarted {
        session: String,
        user: String,
        query: String,
    },
    ToolCalled {
        session: String,
        agent: String,
        tool: String,
    },
    TurnCompleted {
        session: String,
        response: String,
    },
    TurnFailed {
        session: String,
        error: String,
    },
    MemoryPersisted {
        session: String,
        records: usize,
    },
}

/// Outcome of a successful turn.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub response: String,
    /// Tool calls made while producing the response, oldest first.
    pub tool_turns: Vec<Turn>,
}

/// Runs after every committed turn. Errors are logged and never fail the turn.
#[async_trait]
pub trait PostTurnHook: Send + Sync {
    fn name(&self) -> &str {
        "post_turn_hook"
    }

    async fn after_turn(
        &self,
        session: &Session,
        memory: Option<&Arc<dyn MemoryStore>>,
    ) -> Result<()>;
}

/// Copies the session into memory after each turn.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoPersistHook;

#[async_trait]
impl PostTurnHook for AutoPersistHook {
    fn name(&self) -> &str {
        "auto_persist"
    }

    async fn after_turn(
        &self,
        session: &Session,
        memory: Option<&Arc<dyn MemoryStore>>,
    ) -> Result<()> {
        let memory = memory
            .ok_or_else(|| SayrError::Config("auto persist needs a memory store".into()))?;
        let records = memory.persist(session).await?;
        tracing::debug!(session = %session.key, records, "session persisted to memory");
        Ok(())
    }
}

type LockMap = StdMutex<HashMap<SessionKey, Arc<Mutex<()>>>>;

fn lock_map(locks: &LockMap) -> std::sync::MutexGuard<'_, HashMap<SessionKey, Arc<Mutex<()>>>> {
    locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A handle on one session's turn lock. The map entry is dropped with the last lease,
/// including when the turn future is cancelled.
struct LockLease<'a> {
    locks: &'a LockMap,
    key: SessionKey,
    lock: Arc<Mutex<()>>,
}

impl Drop for LockLease<'_> {
    fn drop(&mut self) {
        let mut locks = lock_map(self.locks);
        // Leases are only cloned out while the map is locked, so two owners means the map and us.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

pub struct Runner {
    app_name: String,
    agent: Arc<dyn Agent>,
    sessions: Arc<dyn SessionStore>,
    memory: Option<Arc<dyn MemoryStore>>,
    hooks: Vec<Arc<dyn PostTurnHook>>,
    metrics: Option<MetricsTracker>,
    record_tool_turns: bool,
    locks: LockMap,
    events: broadcast::Sender<RunnerEvent>,
}

impl Runner {
    pub fn new(
        app_name: impl Into<String>,
        agent: Arc<dyn Agent>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            app_name: app_name.into(),
            agent,
            sessions,
            memory: None,
            hooks: Vec::new(),
            metrics: None,
            record_tool_turns: false,
            locks: StdMutex::new(HashMap::new()),
            events,
        }
    }

    /// In-process session and memory stores.
    pub fn in_memory(app_name: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        Self::new(app_name, agent, Arc::new(InMemorySessionStore::new()))
            .with_memory(Arc::new(InMemoryMemoryStore::new()))
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_hook(mut self, hook: impl PostTurnHook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsTracker) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Also commit tool calls to the session history, between the user and agent turns.
    pub fn record_tool_turns(mut self, enabled: bool) -> Self {
        self.record_tool_turns = enabled;
        self
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn memory(&self) -> Option<&Arc<dyn MemoryStore>> {
        self.memory.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunnerEvent> {
        self.events.subscribe()
    }

    pub fn key(&self, user_id: &str, session_id: &str) -> SessionKey {
        SessionKey::new(&self.app_name, user_id, session_id)
    }

    pub async fn session(&self, user_id: &str, session_id: &str) -> Result<Option<Session>> {
        self.sessions.get(&self.key(user_id, session_id)).await
    }

    /// Run each query in order on one session, stopping at the first failure.
    pub async fn run<I, S>(&self, user_id: &str, session_id: &str, queries: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut responses = Vec::new();
        for query in queries {
            let report = self.run_turn(user_id, session_id, query.as_ref()).await?;
            responses.push(report.response);
        }
        Ok(responses)
    }

    /// One query on a fixed debug session, logging both sides of the exchange.
    pub async fn run_debug(&self, query: &str) -> Result<String> {
        tracing::info!(target: "sayr_runner::debug", "User > {query}");
        let report = self.run_turn(DEBUG_USER_ID, DEBUG_SESSION_ID, query).await?;
        tracing::info!(target: "sayr_runner::debug", "{} > {}", self.agent.name(), report.response);
        Ok(report.response)
    }

    /// Run one query. The session only changes if the agent produces a final message.
    pub async fn run_turn(&self, user_id: &str, session_id: &str, query: &str) -> Result<TurnReport> {
        let key = self.key(user_id, session_id);
        let lease = self.session_lock(&key);
        let _serialized = lease.lock.lock().await;

        tracing::info!(session = %key, user = user_id, "turn started");
        self.emit(RunnerEvent::TurnStarted {
            session: key.session_id.clone(),
            user: user_id.to_string(),
            query: query.to_string(),
        });
        let mut guard = self.metrics.as_ref().map(|m| m.start_turn(key.to_string()));

        match self.execute(&key, query).await {
            Ok((report, session)) => {
                if let Some(mut guard) = guard.take() {
                    guard.record_tool_calls(report.tool_turns.len());
                    guard.finish(true);
                }
                tracing::info!(
                    session = %key,
                    tool_calls = report.tool_turns.len(),
                    turns = session.turns.len(),
                    "turn completed"
                );
                self.emit(RunnerEvent::TurnCompleted {
                    session: key.session_id.clone(),
                    response: report.response.clone(),
                });
                self.run_hooks(&session).await;
                Ok(report)
            }
            Err(err) => {
                if let Some(guard) = guard.take() {
                    guard.finish(false);
                }
                tracing::error!(session = %key, error = %err, "turn failed");
                self.emit(RunnerEvent::TurnFailed {
                    session: key.session_id.clone(),
                    error: err.to_string(),
                });
                Err(SayrError::TurnFailed {
                    session: key.session_id,
                    source: Box::new(err),
                })
            }
        }
    }

    /// Copy a session into memory now. Returns the number of records added.
    pub async fn persist_session(&self, user_id: &str, session_id: &str) -> Result<usize> {
        let memory = self.require_memory()?;
        let key = self.key(user_id, session_id);
        let session = self
            .sessions
            .get(&key)
            .await?
            .ok_or_else(|| SayrError::SessionNotFound(key.to_string()))?;
        let records = memory.persist(&session).await?;
        tracing::debug!(session = %key, records, "session persisted to memory");
        self.emit(RunnerEvent::MemoryPersisted {
            session: key.session_id,
            records,
        });
        Ok(records)
    }

    pub async fn search_memory(&self, user_id: &str, query: &str) -> Result<Vec<MemoryRecord>> {
        self.require_memory()?
            .search(&self.app_name, user_id, query)
            .await
    }

    async fn execute(&self, key: &SessionKey, query: &str) -> Result<(TurnReport, Session)> {
        let session = self.sessions.get_or_create(key).await?;
        let user_turn = Turn::user(query);

        let mut history = session.turns.clone();
        history.push(user_turn.clone());
        let mut ctx = InvocationContext::new(key.clone())
            .with_history(history)
            .with_state(session.state.clone())
            .with_memory(self.memory.clone())
            .with_events(self.events.clone());

        let response = self.agent.invoke(&mut ctx).await?;

        let delta: StateMap = ctx
            .state
            .into_iter()
            .filter(|(k, v)| session.state.get(k) != Some(v))
            .collect();
        let mut commit = vec![user_turn];
        if self.record_tool_turns {
            commit.extend(ctx.tool_turns.iter().cloned());
        }
        commit.push(Turn::agent(self.agent.name(), response.clone()));

        self.sessions.commit_turn(key, commit, delta).await?;

        let updated = self
            .sessions
            .get(key)
            .await?
            .ok_or_else(|| SayrError::SessionNotFound(key.to_string()))?;
        let report = TurnReport {
            response,
            tool_turns: ctx.tool_turns,
        };
        Ok((report, updated))
    }

    async fn run_hooks(&self, session: &Session) {
        for hook in &self.hooks {
            if let Err(err) = hook.after_turn(session, self.memory.as_ref()).await {
                tracing::warn!(
                    hook = hook.name(),
                    session = %session.key,
                    error = %err,
                    "post-turn hook failed"
                );
            }
        }
    }

    fn session_lock(&self, key: &SessionKey) -> LockLease<'_> {
        let mut locks = lock_map(&self.locks);
        let lock = locks.entry(key.clone()).or_default().clone();
        LockLease {
            locks: &self.locks,
            key: key.clone(),
            lock,
        }
    }

    fn require_memory(&self) -> Result<&Arc<dyn MemoryStore>> {
        self.memory
            .as_ref()
            .ok_or_else(|| SayrError::Config("runner has no memory store".into()))
    }

    fn emit(&self, event: RunnerEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::LlmAgent;
    use crate::llm::StubModel;
    use crate::session::TurnRole;
    use crate::tool::{Tool, ToolRegistry};
    use serde_json::{json, Value};

    struct FailingHook;

    #[async_trait]
    impl PostTurnHook for FailingHook {
        async fn after_turn(
            &self,
            _session: &Session,
            _memory: Option<&Arc<dyn MemoryStore>>,
        ) -> Result<()> {
            Err(SayrError::Storage("disk full".into()))
        }
    }

    struct Clock;

    #[async_trait]
    impl Tool for Clock {
        fn name(&self) -> &str {
            "clock"
        }

        fn description(&self) -> &str {
            "Returns the time"
        }

        async fn call(&self, _input: Value, _ctx: &mut InvocationContext) -> Result<Value> {
            Ok(json!("noon"))
        }
    }

    /// Delegates to an in-memory store but refuses to commit turns.
    #[derive(Default)]
    struct FullDisk {
        inner: InMemorySessionStore,
    }

    #[async_trait]
    impl SessionStore for FullDisk {
        async fn get_or_create(&self, key: &SessionKey) -> Result<Session> {
            self.inner.get_or_create(key).await
        }

        async fn get(&self, key: &SessionKey) -> Result<Option<Session>> {
            self.inner.get(key).await
        }

        async fn append_turn(&self, _key: &SessionKey, _turn: Turn) -> Result<()> {
            Err(SayrError::Storage("disk full".into()))
        }

        async fn merge_state(&self, key: &SessionKey, delta: StateMap) -> Result<()> {
            self.inner.merge_state(key, delta).await
        }

        async fn commit_turn(
            &self,
            _key: &SessionKey,
            _turns: Vec<Turn>,
            _delta: StateMap,
        ) -> Result<()> {
            Err(SayrError::Storage("disk full".into()))
        }

        async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<SessionKey>> {
            self.inner.list_sessions(app_name, user_id).await
        }

        async fn delete(&self, key: &SessionKey) -> Result<bool> {
            self.inner.delete(key).await
        }
    }

    fn runner(script: Vec<&str>) -> Runner {
        let model = StubModel::new(script.into_iter().map(String::from).collect());
        let agent = Arc::new(LlmAgent::new("assistant", model));
        Runner::in_memory("app", agent)
    }

    #[tokio::test]
    async fn hook_failure_does_not_fail_turn() {
        let runner = runner(vec!["ok"]).with_hook(FailingHook);
        let report = runner.run_turn("u", "s", "hello").await.unwrap();
        assert_eq!(report.response, "ok");
        let session = runner.session("u", "s").await.unwrap().unwrap();
        assert_eq!(session.turns.len(), 2);
    }

    #[tokio::test]
    async fn auto_persist_hook_feeds_memory() {
        let runner = runner(vec!["Noted."]).with_hook(AutoPersistHook);
        runner.run_turn("u", "s", "My favourite colour is teal.").await.unwrap();

        let found = runner.search_memory("u", "favourite colour").await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].content.contains("teal"));
    }

    #[tokio::test]
    async fn tool_turns_are_reported_and_optionally_recorded() {
        let model = StubModel::new(vec![
            r#"{"action":"call_tool","name":"clock","arguments":{}}"#.into(),
            "It is noon.".into(),
        ]);
        let mut tools = ToolRegistry::new();
        tools.register(Clock);
        let agent = Arc::new(LlmAgent::new("assistant", model).with_tools(tools));
        let runner = Runner::in_memory("app", agent).record_tool_turns(true);
        let mut events = runner.subscribe();

        let report = runner.run_turn("u", "s", "what time is it?").await.unwrap();

        assert_eq!(report.tool_turns.len(), 1);
        let session = runner.session("u", "s").await.unwrap().unwrap();
        let roles: Vec<TurnRole> = session.turns.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![TurnRole::User, TurnRole::Tool, TurnRole::Agent]);

        assert!(matches!(events.recv().await.unwrap(), RunnerEvent::TurnStarted { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            RunnerEvent::ToolCalled { ref tool, .. } if tool == "clock"
        ));
        assert!(matches!(events.recv().await.unwrap(), RunnerEvent::TurnCompleted { .. }));
    }

    #[tokio::test]
    async fn failed_turn_leaves_session_untouched() {
        let runner = runner(vec!["first answer"]);
        runner.run_turn("u", "s", "one").await.unwrap();

        let err = runner.run_turn("u", "s", "two").await.unwrap_err();
        assert!(matches!(err, SayrError::TurnFailed { .. }));

        let session = runner.session("u", "s").await.unwrap().unwrap();
        assert_eq!(session.turns.len(), 2);
        assert_eq!(session.turns[1].content, "first answer");
    }

    #[tokio::test]
    async fn storage_failure_keeps_outputs_out_of_state() {
        let model = StubModel::new(vec!["DRAFT".into()]);
        let agent = Arc::new(LlmAgent::new("writer", model).with_output_key("blog_draft"));
        let runner = Runner::new("app", agent, Arc::new(FullDisk::default()));

        let err = runner.run_turn("u", "s", "write").await.unwrap_err();
        assert!(matches!(err.root_cause(), SayrError::Storage(_)));

        let session = runner.session("u", "s").await.unwrap().unwrap();
        assert!(session.turns.is_empty());
        assert!(session.state.is_empty());
    }

    #[tokio::test]
    async fn session_locks_are_released_after_turns() {
        let runner = runner(vec!["a", "b", "c"]);
        for id in ["s1", "s2", "s3"] {
            runner.run_turn("u", id, "hi").await.unwrap();
            runner.sessions().delete(&runner.key("u", id)).await.unwrap();
        }
        let _ = runner.run_turn("u", "s4", "no reply scripted").await;

        assert!(lock_map(&runner.locks).is_empty());
    }

    #[tokio::test]
    async fn metrics_count_successes_and_failures() {
        let metrics = MetricsTracker::default();
        let runner = runner(vec!["fine"]).with_metrics(metrics.clone());
        runner.run_turn("u", "s", "a").await.unwrap();
        let _ = runner.run_turn("u", "s", "b").await;

        let turns = metrics.turns();
        assert_eq!(turns.len(), 2);
        assert!(turns[0].success);
        assert!(!turns[1].success);
    }

    #[tokio::test]
    async fn persist_requires_existing_session() {
        let runner = runner(vec![]);
        let err = runner.persist_session("u", "missing").await.unwrap_err();
        assert!(matches!(err, SayrError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn concurrent_turns_on_one_session_are_serialized() {
        let runner = Arc::new(runner(vec!["r1", "r2", "r3", "r4"]));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let runner = runner.clone();
                tokio::spawn(async move { runner.run_turn("u", "s", &format!("q{i}")).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let session = runner.session("u", "s").await.unwrap().unwrap();
        assert_eq!(session.turns.len(), 8);
        for pair in session.turns.chunks(2) {
            assert_eq!(pair[0].role, TurnRole::User);
            assert_eq!(pair[1].role, TurnRole::Agent);
        }
    }
}
