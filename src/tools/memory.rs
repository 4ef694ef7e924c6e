use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agent::InvocationContext;
use crate::error::{Result, SayrError};
use crate::tool::Tool;

/// Lets the model search long-term memory on demand (`load_memory`).
///
/// Results are scoped to the app and user of the running session.
pub struct LoadMemoryTool {
    limit: usize,
}

impl LoadMemoryTool {
    pub fn new() -> Self {
        Self { limit: 5 }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }
}

impl Default for LoadMemoryTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for LoadMemoryTool {
    fn name(&self) -> &str {
        "load_memory"
    }

    fn description(&self) -> &str {
        "Search memories of past conversations with this user. Expects {\"query\": string}."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        }))
    }

    async fn call(&self, input: Value, ctx: &mut InvocationContext) -> Result<Value> {
        let query = input
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| SayrError::Protocol("missing `query` for load_memory".into()))?;
        let memory = ctx
            .memory
            .as_ref()
            .ok_or_else(|| SayrError::Config("no memory store attached to this runner".into()))?;

        let found = memory
            .search(&ctx.key.app_name, &ctx.key.user_id, query)
            .await?;
        let memories: Vec<Value> = found
            .iter()
            .take(self.limit)
            .map(|record| {
                json!({
                    "author": record.author,
                    "content": record.content,
                    "session": record.source_session_id,
                })
            })
            .collect();
        Ok(json!({ "query": query, "memories": memories }))
    }
}
