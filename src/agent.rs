use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{Result, SayrError};
use crate::llm::LanguageModel;
use crate::memory::MemoryStore;
use crate::message::Message;
use crate::runner::RunnerEvent;
use crate::session::{SessionKey, StateMap, Turn, TurnRole};
use crate::template;
use crate::tool::ToolRegistry;

/// Everything an agent may read or write while handling one turn.
///
/// `history` holds the committed session turns followed by the pending user turn.
/// Writes to `state` and `tool_turns` only reach the session if the turn succeeds.
pub struct InvocationContext {
    pub key: SessionKey,
    pub history: Vec<Turn>,
    pub state: StateMap,
    pub memory: Option<Arc<dyn MemoryStore>>,
    pub tool_turns: Vec<Turn>,
    events: Option<broadcast::Sender<RunnerEvent>>,
}

impl InvocationContext {
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            history: Vec::new(),
            state: StateMap::new(),
            memory: None,
            tool_turns: Vec::new(),
            events: None,
        }
    }

    pub fn with_history(mut self, history: Vec<Turn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_state(mut self, state: StateMap) -> Self {
        self.state = state;
        self
    }

    pub fn with_memory(mut self, memory: Option<Arc<dyn MemoryStore>>) -> Self {
        self.memory = memory;
        self
    }

    pub(crate) fn with_events(mut self, events: broadcast::Sender<RunnerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// A child context sharing key, memory and a copy of the state, with its own history.
    pub fn fork(&self, history: Vec<Turn>) -> Self {
        Self {
            key: self.key.clone(),
            history,
            state: self.state.clone(),
            memory: self.memory.clone(),
            tool_turns: Vec::new(),
            events: self.events.clone(),
        }
    }

    pub fn latest_user_text(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|turn| turn.role == TurnRole::User)
            .map(|turn| turn.content.as_str())
    }

    pub(crate) fn emit(&self, event: RunnerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Produces one final message per invocation.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// State key the final message is stored under.
    fn output_key(&self) -> Option<&str> {
        None
    }

    /// Every state key this agent (or its children) writes.
    fn produced_keys(&self) -> Vec<String> {
        self.output_key().map(str::to_string).into_iter().collect()
    }

    /// State keys that must exist before this agent runs.
    fn required_keys(&self) -> Vec<String> {
        Vec::new()
    }

    async fn invoke(&self, ctx: &mut InvocationContext) -> Result<String>;
}

/// A single model-backed agent that alternates between the LLM and its tools.
pub struct LlmAgent {
    name: String,
    description: String,
    instruction: String,
    model: Arc<dyn LanguageModel>,
    tools: ToolRegistry,
    output_key: Option<String>,
    max_steps: usize,
    preload_memory: Option<usize>,
}

impl LlmAgent {
    pub fn new(name: impl Into<String>, model: Arc<dyn LanguageModel>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instruction: "You are a helpful agent.".to_string(),
            model,
            tools: ToolRegistry::new(),
            output_key: None,
            max_steps: 6,
            preload_memory: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Instruction template; `{key}` placeholders are filled from session state.
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// Inject up to `limit` memories matching the latest user message into the instruction.
    pub fn with_memory_preload(mut self, limit: usize) -> Self {
        self.preload_memory = Some(limit.max(1));
        self
    }

    pub fn tools_mut(&mut self) -> &mut ToolRegistry {
        &mut self.tools
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    async fn build_system_message(&self, instruction: &str, ctx: &InvocationContext) -> String {
        let mut prompt = String::new();
        prompt.push_str(instruction);
        prompt.push_str(
            "\n\nWhen a tool is relevant, call it with JSON arguments. Otherwise, reply directly.",
        );
        if self.tools.is_empty() {
            prompt.push_str(" No tools are available.\n");
        } else {
            prompt.push_str("\nAvailable tools:\n");
            for tool in self.tools.describe() {
                prompt.push_str(&format!("- {}: {}\n", tool.name, tool.description));
            }
        }

        if let (Some(limit), Some(memory), Some(query)) =
            (self.preload_memory, &ctx.memory, ctx.latest_user_text())
        {
            let found = memory
                .search(&ctx.key.app_name, &ctx.key.user_id, query)
                .await
                .unwrap_or_else(|err| {
                    tracing::warn!(agent = %self.name, error = %err, "memory preload failed");
                    Vec::new()
                });
            if !found.is_empty() {
                prompt.push_str("\nRelevant memories from past conversations:\n");
                for record in found.iter().take(limit) {
                    prompt.push_str(&format!("- [{}] {}\n", record.author, record.content));
                }
            }
        }
        prompt
    }
}

#[async_trait]
impl Agent for LlmAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn output_key(&self) -> Option<&str> {
        self.output_key.as_deref()
    }

    fn required_keys(&self) -> Vec<String> {
        template::required_keys(&self.instruction)
    }

    async fn invoke(&self, ctx: &mut InvocationContext) -> Result<String> {
        let instruction = template::render(&self.name, &self.instruction, &ctx.state)?;
        let system = self.build_system_message(&instruction, ctx).await;
        let tools = self.tools.describe();
        let mut scratch: Vec<Message> = Vec::new();

        for _ in 0..self.max_steps {
            let mut request = vec![Message::system(system.clone())];
            request.extend(ctx.history.iter().map(Turn::to_message));
            request.extend(scratch.iter().cloned());
            let completion = self.model.complete_chat(&request, &tools).await?;

            if !completion.tool_calls.is_empty() {
                for mut call in completion.tool_calls {
                    if call.id.is_none() {
                        call.id = Some(format!("call-{}", scratch.len()));
                    }
                    let call_id = call.id.clone();
                    scratch.push(Message::tool_call(call.clone()));
                    ctx.emit(RunnerEvent::ToolCalled {
                        session: ctx.key.session_id.clone(),
                        agent: self.name.clone(),
                        tool: call.name.clone(),
                    });

                    let output = self
                        .tools
                        .call(&call.name, call.arguments.clone(), ctx)
                        .await?;
                    ctx.tool_turns.push(Turn::tool(
                        call.name.clone(),
                        format!("{}({}) -> {}", call.name, call.arguments, output),
                    ));
                    scratch.push(Message::tool_with_call(&call.name, output, call_id));
                }
                continue;
            }

            return match completion.content {
                Some(content) => {
                    if let Some(key) = &self.output_key {
                        ctx.state.insert(key.clone(), Value::String(content.clone()));
                    }
                    Ok(content)
                }
                None => Err(SayrError::Protocol(format!(
                    "model response for `{}` had neither content nor tool calls",
                    self.name
                ))),
            };
        }

        Err(SayrError::Protocol(format!(
            "agent `{}` reached the step limit without returning a response",
            self.name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StubModel;
    use crate::memory::InMemoryMemoryStore;
    use crate::message::Role;
    use crate::session::Session;
    use crate::tool::Tool;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes the `text` field back"
        }

        async fn call(&self, input: Value, _ctx: &mut InvocationContext) -> Result<Value> {
            Ok(input)
        }
    }

    fn ctx_with(query: &str) -> InvocationContext {
        InvocationContext::new(SessionKey::new("app", "user", "s"))
            .with_history(vec![Turn::user(query)])
    }

    #[tokio::test]
    async fn returns_llm_response_without_tools() {
        let model = StubModel::new(vec![r#"{"action":"respond","content":"Hello!"}"#.into()]);
        let agent = LlmAgent::new("assistant", model.clone());
        let mut ctx = ctx_with("hi");

        let reply = agent.invoke(&mut ctx).await.unwrap();

        assert_eq!(reply, "Hello!");
        assert!(ctx.tool_turns.is_empty());
        let request = &model.requests()[0];
        assert_eq!(request[0].role, Role::System);
        assert_eq!(request[1].role, Role::User);
        assert_eq!(request[1].content, "hi");
    }

    #[tokio::test]
    async fn executes_tool_then_replies() {
        let model = StubModel::new(vec![
            r#"{"action":"call_tool","name":"echo","arguments":{"text":"ping"}}"#.into(),
            r#"{"action":"respond","content":"Echoed your request."}"#.into(),
        ]);
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        let agent = LlmAgent::new("assistant", model.clone()).with_tools(tools);
        let mut ctx = ctx_with("say ping");

        let reply = agent.invoke(&mut ctx).await.unwrap();

        assert_eq!(reply, "Echoed your request.");
        assert_eq!(ctx.tool_turns.len(), 1);
        assert_eq!(ctx.tool_turns[0].role, TurnRole::Tool);
        let second = &model.requests()[1];
        let result = second.last().unwrap().tool_result.as_ref().unwrap();
        assert_eq!(result.output, json!({"text": "ping"}));
        assert!(second[0].content.contains("Echoes the `text` field back"));
    }

    #[tokio::test]
    async fn stores_output_under_key_and_resolves_placeholders() {
        let model = StubModel::new(vec!["a polished draft".into()]);
        let agent = LlmAgent::new("EditorAgent", model.clone())
            .with_instruction("Edit this draft: {blog_draft}")
            .with_output_key("final_blog");
        let mut ctx = ctx_with("write a blog");
        ctx.state.insert("blog_draft".into(), json!("rough draft"));

        agent.invoke(&mut ctx).await.unwrap();

        assert_eq!(ctx.state.get("final_blog"), Some(&json!("a polished draft")));
        assert!(model.requests()[0][0]
            .content
            .starts_with("Edit this draft: rough draft"));
        assert_eq!(agent.required_keys(), vec!["blog_draft".to_string()]);
    }

    #[tokio::test]
    async fn missing_placeholder_fails_before_calling_model() {
        let model = StubModel::new(vec!["unused".into()]);
        let agent = LlmAgent::new("WriterAgent", model.clone())
            .with_instruction("Following this outline strictly: {blog_outline}");

        let err = agent.invoke(&mut ctx_with("topic")).await.unwrap_err();

        assert!(matches!(err, SayrError::MissingStateKey { ref key, .. } if key == "blog_outline"));
        assert!(model.requests().is_empty());
    }

    #[tokio::test]
    async fn preloads_matching_memories_into_instruction() {
        let memory = Arc::new(InMemoryMemoryStore::new());
        let mut past = Session::new(SessionKey::new("app", "user", "earlier"));
        past.turns
            .push(Turn::user("I gifted a new toy to my nephew on his 1st birthday!"));
        memory.persist(&past).await.unwrap();

        let model = StubModel::new(vec!["You gifted a toy.".into()]);
        let agent = LlmAgent::new("AutoMemoryAgent", model.clone()).with_memory_preload(3);
        let mut ctx = ctx_with("What did I gift my nephew?").with_memory(Some(memory));

        agent.invoke(&mut ctx).await.unwrap();

        let system = &model.requests()[0][0].content;
        assert!(system.contains("Relevant memories"));
        assert!(system.contains("[user] I gifted a new toy"));
    }

    #[tokio::test]
    async fn step_limit_is_an_error() {
        let model = StubModel::new(vec![
            r#"{"action":"call_tool","name":"echo","arguments":{}}"#.into(),
            r#"{"action":"call_tool","name":"echo","arguments":{}}"#.into(),
        ]);
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        let agent = LlmAgent::new("looper", model)
            .with_tools(tools)
            .with_max_steps(2);

        let err = agent.invoke(&mut ctx_with("go")).await.unwrap_err();
        assert!(matches!(err, SayrError::Protocol(_)));
    }
}
