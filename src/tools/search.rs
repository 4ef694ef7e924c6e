//! Client-side web search over DuckDuckGo's HTML interface.
//!
//! Gemini can ground answers with its built-in `google_search`; this tool covers
//! models without one.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agent::InvocationContext;
use crate::error::{Result, SayrError};
use crate::tool::{Tool, ToolRegistry};

const TOOL_NAME: &str = "web_search";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub href: String,
}

#[derive(Debug, Clone)]
pub struct WebSearchConfig {
    pub max_results: usize,
    pub timeout: Duration,
    pub endpoint: String,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            max_results: 5,
            timeout: Duration::from_secs(10),
            endpoint: "https://html.duckduckgo.com/html/".to_string(),
        }
    }
}

/// A registry holding the `web_search` tool.
pub fn web_search_toolkit(config: WebSearchConfig) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(WebSearchTool { config });
    registry
}

pub struct WebSearchTool {
    config: WebSearchConfig,
}

impl WebSearchTool {
    pub fn new(config: WebSearchConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Search the web. Expects {\"query\": string, \"max_results\": number (optional)}."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "max_results": {"type": "integer"}
            },
            "required": ["query"]
        }))
    }

    async fn call(&self, input: Value, _ctx: &mut InvocationContext) -> Result<Value> {
        let query = input
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| SayrError::Protocol("missing `query` for web_search".into()))?;
        let max_results = input
            .get("max_results")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(self.config.max_results);

        let html = fetch(&self.config, query).await?;
        let results = parse_results(&html, max_results);
        tracing::debug!(query, found = results.len(), "web search finished");
        Ok(json!({ "query": query, "results": results }))
    }
}

fn invocation_error(err: reqwest::Error) -> SayrError {
    SayrError::ToolInvocation {
        name: TOOL_NAME.into(),
        source: Box::new(err),
    }
}

async fn fetch(config: &WebSearchConfig, query: &str) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(config.timeout)
        .user_agent("Mozilla/5.0 (compatible; SayrRunner/0.1)")
        .build()
        .map_err(invocation_error)?;
    let url = format!("{}?q={}", config.endpoint, urlencoding::encode(query));

    client
        .get(&url)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(invocation_error)?
        .text()
        .await
        .map_err(invocation_error)
}

/// Pull `<a class="result__a" href="...">title</a>` links out of a results page.
fn parse_results(html: &str, max_results: usize) -> Vec<SearchResult> {
    html.split("result__a")
        .skip(1)
        .filter_map(|chunk| {
            let href = chunk.split("href=\"").nth(1)?.split('"').next()?;
            let title = chunk.split_once('>')?.1.split("</a>").next()?;
            (href.starts_with("http") && !title.is_empty()).then(|| SearchResult {
                title: html_decode(title),
                href: href.to_string(),
            })
        })
        .take(max_results)
        .collect()
}

fn html_decode(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <div><a class="result__a" href="https://example.com/euro">Euro 2024 &amp; results</a></div>
        <div><a class="result__a" href="/relative">skipped</a></div>
        <div><a class="result__a" href="https://example.org/final">Final report</a></div>
    "#;

    #[test]
    fn extracts_absolute_links() {
        let results = parse_results(PAGE, 5);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].title, "Euro 2024 & results");
        assert_eq!(results[1].href, "https://example.org/final");
    }

    #[test]
    fn respects_max_results() {
        assert_eq!(parse_results(PAGE, 1).len(), 1);
    }

    #[test]
    fn toolkit_registers_web_search() {
        let registry = web_search_toolkit(WebSearchConfig::default());
        assert_eq!(registry.names(), vec!["web_search".to_string()]);
    }
}
