use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agent::{Agent, InvocationContext};
use crate::error::{Result, SayrError};
use crate::session::Turn;
use crate::tool::Tool;

/// Exposes an agent as a tool taking `{"request": string}`.
///
/// The wrapped agent sees only the request, not the caller's history. State it writes,
/// including its output key, is copied back into the caller's state.
pub struct AgentTool {
    agent: Arc<dyn Agent>,
}

impl AgentTool {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        self.agent.name()
    }

    fn description(&self) -> &str {
        self.agent.description()
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {"request": {"type": "string"}},
            "required": ["request"]
        }))
    }

    async fn call(&self, input: Value, ctx: &mut InvocationContext) -> Result<Value> {
        let request = input
            .get("request")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                SayrError::Protocol(format!("missing `request` for {}", self.agent.name()))
            })?;

        let mut child = ctx.fork(vec![Turn::user(request)]);
        let output = self.agent.invoke(&mut child).await?;
        ctx.state.extend(child.state);
        ctx.tool_turns.extend(child.tool_turns);
        Ok(json!({ "result": output }))
    }
}
