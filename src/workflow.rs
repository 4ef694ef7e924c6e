//! Composite agents: fixed pipelines and concurrent fan-out.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;

use crate::agent::{Agent, InvocationContext};
use crate::error::{Result, SayrError};
use crate::session::StateMap;

/// Runs child agents strictly in order over one shared context.
///
/// Each child's `output_key` is in state before the next child starts, so later
/// instructions can reference earlier outputs. The pipeline's reply is the last child's.
pub struct SequentialAgent {
    name: String,
    description: String,
    children: Vec<Arc<dyn Agent>>,
}

impl SequentialAgent {
    pub fn new(name: impl Into<String>, children: Vec<Arc<dyn Agent>>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            children,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn children(&self) -> &[Arc<dyn Agent>] {
        &self.children
    }

    /// Check that every placeholder is produced by an earlier step or present in `initial`.
    pub fn validate(&self, initial: &StateMap) -> Result<()> {
        let mut available: BTreeSet<String> = initial.keys().cloned().collect();
        for child in &self.children {
            if let Some(key) = child
                .required_keys()
                .into_iter()
                .find(|key| !available.contains(key))
            {
                return Err(SayrError::MissingStateKey {
                    agent: child.name().to_string(),
                    key,
                });
            }
            available.extend(child.produced_keys());
        }
        Ok(())
    }
}

#[async_trait]
impl Agent for SequentialAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn output_key(&self) -> Option<&str> {
        self.children.last().and_then(|child| child.output_key())
    }

    fn produced_keys(&self) -> Vec<String> {
        self.children
            .iter()
            .flat_map(|child| child.produced_keys())
            .collect()
    }

    fn required_keys(&self) -> Vec<String> {
        let mut produced: BTreeSet<String> = BTreeSet::new();
        let mut required = Vec::new();
        for child in &self.children {
            for key in child.required_keys() {
                if !produced.contains(&key) && !required.contains(&key) {
                    required.push(key);
                }
            }
            produced.extend(child.produced_keys());
        }
        required
    }

    async fn invoke(&self, ctx: &mut InvocationContext) -> Result<String> {
        let mut last = None;
        for child in &self.children {
            tracing::debug!(pipeline = %self.name, step = %child.name(), "running pipeline step");
            last = Some(child.invoke(ctx).await?);
        }
        last.ok_or_else(|| SayrError::Protocol(format!("pipeline `{}` has no steps", self.name)))
    }
}

/// Runs child agents concurrently on copies of the context.
///
/// State changes are merged back in child order; a later child wins on conflicting keys.
pub struct ParallelAgent {
    name: String,
    description: String,
    children: Vec<Arc<dyn Agent>>,
}

impl ParallelAgent {
    pub fn new(name: impl Into<String>, children: Vec<Arc<dyn Agent>>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            children,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[async_trait]
impl Agent for ParallelAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn produced_keys(&self) -> Vec<String> {
        self.children
            .iter()
            .flat_map(|child| child.produced_keys())
            .collect()
    }

    fn required_keys(&self) -> Vec<String> {
        let mut required: Vec<String> = Vec::new();
        for key in self.children.iter().flat_map(|child| child.required_keys()) {
            if !required.contains(&key) {
                required.push(key);
            }
        }
        required
    }

    async fn invoke(&self, ctx: &mut InvocationContext) -> Result<String> {
        if self.children.is_empty() {
            return Err(SayrError::Protocol(format!(
                "parallel agent `{}` has no children",
                self.name
            )));
        }

        let base = ctx.state.clone();
        let runs = self.children.iter().map(|child| {
            let mut child_ctx = ctx.fork(ctx.history.clone());
            async move {
                let output = child.invoke(&mut child_ctx).await?;
                Ok::<_, SayrError>((output, child_ctx))
            }
        });
        let finished = try_join_all(runs).await?;

        let mut outputs = Vec::with_capacity(finished.len());
        for (output, child_ctx) in finished {
            for (key, value) in child_ctx.state {
                if base.get(&key) != Some(&value) {
                    ctx.state.insert(key, value);
                }
            }
            ctx.tool_turns.extend(child_ctx.tool_turns);
            outputs.push(output);
        }
        Ok(outputs.join("\n\n"))
    }
}
