//! Language model abstraction, the Gemini client and a scripted stub.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{ModelConfig, RetryOptions};
use crate::error::{Result, SayrError};
use crate::message::{Message, Role, ToolCall};
use crate::retry::RetryingModel;
use crate::tool::ToolDescription;

/// Result of a chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelCompletion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl ModelCompletion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }
}

/// Minimal abstraction around a chat completion provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
    ) -> Result<ModelCompletion>;
}

/// Build the configured provider, wrapped in the retry policy.
pub fn model_from_config(
    cfg: &ModelConfig,
    retry: &RetryOptions,
) -> Result<Arc<dyn LanguageModel>> {
    let inner: Arc<dyn LanguageModel> = match cfg.provider.as_str() {
        "gemini" => Arc::new(GeminiClient::from_config(cfg)?),
        "stub" => StubModel::new(Vec::new()),
        other => {
            return Err(SayrError::Config(format!(
                "unknown model provider `{other}`"
            )))
        }
    };
    Ok(Arc::new(RetryingModel::new(inner, retry.clone())))
}

fn coalesce_error(status: reqwest::StatusCode, body: &str, provider: &str) -> SayrError {
    SayrError::ModelStatus {
        provider: provider.to_string(),
        status: status.as_u16(),
        body: body.to_string(),
    }
}

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    model: String,
    api_key: String,
    endpoint: String,
    google_search: bool,
}

impl GeminiClient {
    pub fn from_config(cfg: &ModelConfig) -> Result<Self> {
        let api_key = cfg
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| SayrError::Config("missing Gemini API key in model config".into()))?;
        let endpoint = cfg
            .endpoint
            .clone()
            .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string());
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .map_err(|err| SayrError::Config(format!("http client error: {err}")))?,
            model: cfg.model.clone(),
            api_key,
            endpoint,
            google_search: cfg.google_search,
        })
    }

    /// Enable Gemini's built-in Google Search grounding.
    pub fn with_google_search(mut self, enabled: bool) -> Self {
        self.google_search = enabled;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn to_contents(&self, messages: &[Message]) -> Vec<GeminiMessage> {
        messages
            .iter()
            .filter(|message| message.role != Role::System)
            .map(|message| {
                let (role, part) = match (message.role, &message.tool_call, &message.tool_result) {
                    (Role::Assistant, Some(call), _) => (
                        "model",
                        GeminiPart {
                            function_call: Some(GeminiFunctionCall {
                                name: call.name.clone(),
                                args: call.arguments.clone(),
                            }),
                            ..Default::default()
                        },
                    ),
                    (Role::Tool, _, Some(result)) => (
                        "user",
                        GeminiPart {
                            function_response: Some(GeminiFunctionResponse {
                                name: result.name.clone(),
                                response: json!({ "result": result.output }),
                            }),
                            ..Default::default()
                        },
                    ),
                    (Role::Assistant, None, _) => ("model", GeminiPart::text(&message.content)),
                    _ => ("user", GeminiPart::text(&message.content)),
                };
                GeminiMessage {
                    role: role.to_string(),
                    parts: vec![part],
                }
            })
            .collect()
    }

    fn to_tools(&self, tools: &[ToolDescription]) -> Option<Vec<Value>> {
        let mut built = Vec::new();
        if !tools.is_empty() {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|tool| {
                    let mut decl = json!({
                        "name": tool.name,
                        "description": tool.description,
                    });
                    if let Some(params) = &tool.parameters {
                        decl["parameters"] = params.clone();
                    }
                    decl
                })
                .collect();
            built.push(json!({ "functionDeclarations": declarations }));
        }
        if self.google_search {
            built.push(json!({ "google_search": {} }));
        }
        (!built.is_empty()).then_some(built)
    }

    fn build_payload(&self, messages: &[Message], tools: &[ToolDescription]) -> Value {
        let mut payload = json!({ "contents": self.to_contents(messages) });
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        if !system.is_empty() {
            payload["systemInstruction"] = json!({ "parts": [{ "text": system.join("\n\n") }] });
        }
        if let Some(tools) = self.to_tools(tools) {
            payload["tools"] = Value::Array(tools);
        }
        payload
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    async fn complete_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
    ) -> Result<ModelCompletion> {
        let payload = self.build_payload(messages, tools);
        let resp = self
            .http
            .post(format!(
                "{}/models/{}:generateContent",
                self.endpoint, self.model
            ))
            .header("x-goog-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| SayrError::ModelTransport(format!("Gemini request error: {err}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(coalesce_error(status, &body, "gemini"));
        }

        let parsed: GeminiResponse = resp.json().await.map_err(|err| {
            SayrError::LanguageModel(format!("Gemini response parse error: {err}"))
        })?;
        Ok(parsed.into_completion())
    }
}

/// A deterministic model used for tests and demos.
///
/// Each scripted entry is either a JSON directive (`respond`, `call_tool`, `fail`)
/// or plain text returned as the reply.
#[derive(Default)]
pub struct StubModel {
    responses: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl StubModel {
    pub fn new(responses: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().expect("stub model poisoned").clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().expect("stub model poisoned").len()
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum StubDirective {
    Respond { content: String },
    CallTool { name: String, arguments: Value },
    Fail { status: u16 },
}

#[async_trait]
impl LanguageModel for StubModel {
    async fn complete_chat(
        &self,
        messages: &[Message],
        _tools: &[ToolDescription],
    ) -> Result<ModelCompletion> {
        self.requests
            .lock()
            .expect("stub model poisoned")
            .push(messages.to_vec());
        let raw = self
            .responses
            .lock()
            .expect("stub model poisoned")
            .pop_front()
            .ok_or_else(|| {
                SayrError::LanguageModel("StubModel ran out of scripted responses".into())
            })?;

        match serde_json::from_str::<StubDirective>(&raw) {
            Ok(StubDirective::Respond { content }) => Ok(ModelCompletion::text(content)),
            Ok(StubDirective::CallTool { name, arguments }) => Ok(ModelCompletion {
                content: None,
                tool_calls: vec![ToolCall {
                    id: None,
                    name,
                    arguments,
                }],
            }),
            Ok(StubDirective::Fail { status }) => Err(SayrError::ModelStatus {
                provider: "stub".into(),
                status,
                body: "scripted failure".into(),
            }),
            Err(_) => Ok(ModelCompletion::text(raw)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiMessage {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<GeminiFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<GeminiFunctionResponse>,
}

impl GeminiPart {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiCandidateContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

impl GeminiResponse {
    fn into_completion(self) -> ModelCompletion {
        let parts = self
            .candidates
            .into_iter()
            .next()
            .and_then(|cand| cand.content)
            .map(|content| content.parts)
            .unwrap_or_default();

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for part in parts {
            if let Some(chunk) = part.text {
                text.push_str(&chunk);
            }
            if let Some(call) = part.function_call {
                tool_calls.push(ToolCall {
                    id: None,
                    name: call.name,
                    arguments: call.args,
                });
            }
        }

        ModelCompletion {
            content: if text.is_empty() { None } else { Some(text) },
            tool_calls,
        }
    }
}
