//! `{key}` placeholder substitution for agent instructions.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::error::{Result, SayrError};
use crate::session::StateMap;

fn placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)(\?)?\}").expect("placeholder pattern is valid")
    })
}

/// Keys an instruction requires, in order of first appearance. `{key?}` is optional and skipped.
pub fn required_keys(template: &str) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for caps in placeholder().captures_iter(template) {
        if caps.get(2).is_some() {
            continue;
        }
        let key = caps[1].to_string();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

/// Replace `{key}` with the state value for `key`. Strings are inserted verbatim, other
/// values as JSON. A missing `{key?}` becomes empty; a missing `{key}` is an error.
pub fn render(agent: &str, template: &str, state: &StateMap) -> Result<String> {
    let mut missing: Option<String> = None;
    let rendered = placeholder().replace_all(template, |caps: &Captures| {
        let key = &caps[1];
        match state.get(key) {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None if caps.get(2).is_some() => String::new(),
            None => {
                missing.get_or_insert_with(|| key.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(key) => Err(SayrError::MissingStateKey {
            agent: agent.to_string(),
            key,
        }),
        None => Ok(rendered.into_owned()),
    }
}
