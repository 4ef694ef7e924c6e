//! Built-in tools: agents as tools, memory lookup and web search.

pub mod agent;
pub mod memory;
pub mod search;

pub use agent::AgentTool;
pub use memory::LoadMemoryTool;
pub use search::{web_search_toolkit, SearchResult, WebSearchConfig, WebSearchTool};
