//! Multi-turn conversational runner for LLM agents.
//!
//! The crate provides:
//! - Session storage with ordered turn history and shared state (`SessionStore`).
//! - A keyword-searchable long-term memory fed from sessions (`MemoryStore`).
//! - Single model-backed agents and sequential or parallel pipelines (`Agent`).
//! - A `Runner` that commits each turn atomically and runs post-turn hooks.

mod agent;
mod config;
mod error;
mod llm;
mod memory;
mod message;
mod metrics;
mod retry;
mod runner;
#[cfg(feature = "server")]
mod server;
mod session;
#[cfg(feature = "persistence")]
mod storage;
pub mod telemetry;
mod template;
mod tool;
pub mod tools;
mod workflow;

pub use agent::{Agent, InvocationContext, LlmAgent};
pub use config::{
    parse_status_codes, AppConfig, AppSection, ModelConfig, RetryOptions, ServerConfig,
    StorageBackend, StorageConfig,
};
pub use error::{Result, SayrError};
pub use llm::{model_from_config, GeminiClient, LanguageModel, ModelCompletion, StubModel};
pub use memory::{InMemoryMemoryStore, MemoryRecord, MemoryStore};
pub use message::{Message, Role, ToolCall, ToolResult};
pub use metrics::{MetricsTracker, TurnGuard, TurnMetrics};
pub use retry::RetryingModel;
pub use runner::{AutoPersistHook, PostTurnHook, Runner, RunnerEvent, TurnReport};
#[cfg(feature = "server")]
pub use server::RunnerServer;
pub use session::{
    session_store_from_config, InMemorySessionStore, Session, SessionKey, SessionStore, StateMap,
    Turn, TurnRole,
};
#[cfg(feature = "persistence")]
pub use storage::SqlSessionStore;
pub use template::{render as render_template, required_keys};
pub use tool::{Tool, ToolDescription, ToolRegistry};
pub use workflow::{ParallelAgent, SequentialAgent};
