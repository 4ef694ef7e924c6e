use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SayrError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppSection {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_user_id")]
    pub user_id: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            user_id: default_user_id(),
        }
    }
}

fn default_app_name() -> String {
    "MemoryDemoApp".into()
}

fn default_user_id() -> String {
    "demo_user".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub google_search: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            endpoint: None,
            google_search: false,
        }
    }
}

fn default_provider() -> String {
    "gemini".into()
}

fn default_model() -> String {
    "gemini-2.5-flash-lite".into()
}

/// Retry settings for model calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryOptions {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_exp_base")]
    pub exp_base: u32,
    #[serde(default = "default_initial_delay", with = "secs")]
    #[serde(rename = "initial_delay_secs")]
    pub initial_delay: Duration,
    #[serde(default = "default_status_codes")]
    pub http_status_codes: Vec<u16>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            exp_base: default_exp_base(),
            initial_delay: default_initial_delay(),
            http_status_codes: default_status_codes(),
        }
    }
}

fn default_attempts() -> u32 {
    5
}

fn default_exp_base() -> u32 {
    7
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_status_codes() -> Vec<u16> {
    vec![429, 500, 503, 504]
}

pub(crate) mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

impl RetryOptions {
    pub fn validate(&self) -> Result<()> {
        if self.attempts == 0 {
            return Err(SayrError::Config("retry attempts must be at least 1".into()));
        }
        if self.exp_base == 0 {
            return Err(SayrError::Config(
                "retry exponential base must be at least 1".into(),
            ));
        }
        if self.http_status_codes.is_empty() {
            return Err(SayrError::Config(
                "retryable status code list must not be empty".into(),
            ));
        }
        if let Some(bad) = self
            .http_status_codes
            .iter()
            .find(|code| !(100..=599).contains(*code))
        {
            return Err(SayrError::Config(format!(
                "`{bad}` is not an HTTP status code"
            )));
        }
        Ok(())
    }
}

/// Parse a list such as `429, 500, 503` or `[429, 500, 503]` into validated status codes.
pub fn parse_status_codes(raw: &str) -> Result<Vec<u16>> {
    let trimmed = raw.trim();
    let inner = match (trimmed.strip_prefix('['), trimmed.strip_suffix(']')) {
        (Some(_), Some(_)) => &trimmed[1..trimmed.len() - 1],
        (None, None) => trimmed,
        _ => {
            return Err(SayrError::Config(format!(
                "unbalanced brackets in status code list `{raw}`"
            )))
        }
    };

    let codes = inner
        .split(',')
        .map(str::trim)
        .map(|item| {
            let code: u16 = item.parse().map_err(|_| {
                SayrError::Config(format!("invalid HTTP status code `{item}` in `{raw}`"))
            })?;
            if !(100..=599).contains(&code) {
                return Err(SayrError::Config(format!(
                    "`{code}` is not an HTTP status code"
                )));
            }
            Ok(code)
        })
        .collect::<Result<Vec<u16>>>()?;

    if codes.is_empty() {
        return Err(SayrError::Config("status code list is empty".into()));
    }
    Ok(codes)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|err| SayrError::Config(format!("invalid server address: {err}")))
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub retry: RetryOptions,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| SayrError::Config(format!("invalid value `{raw}` for {name}")))
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&raw)
            .map_err(|err| SayrError::Config(format!("failed to parse configuration: {err}")))?;
        Ok(cfg)
    }

    /// Defaults overridden by the process environment (and `.env`, when present).
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        cfg.apply_overrides(|name| env::var(name).ok())?;
        cfg.validate()?;
        tracing::info!(app = %cfg.app.name, provider = %cfg.model.provider, "configuration loaded");
        Ok(cfg)
    }

    pub fn from_env_or_file(path: impl AsRef<Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::from_file(path)?;
        cfg.apply_overrides(|name| env::var(name).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `SAYR_*` overrides read through `lookup`. Malformed values are errors.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(name) = lookup("SAYR_APP_NAME") {
            self.app.name = name;
        }
        if let Some(user) = lookup("SAYR_USER_ID") {
            self.app.user_id = user;
        }
        if let Some(provider) = lookup("SAYR_MODEL_PROVIDER") {
            self.model.provider = provider.trim().to_ascii_lowercase();
        }
        if let Some(model) = lookup("SAYR_MODEL") {
            self.model.model = model;
        }
        if let Some(key) = lookup("SAYR_GEMINI_API_KEY").or_else(|| lookup("GEMINI_API_KEY")) {
            self.model.api_key = Some(key);
        }
        if let Some(endpoint) = lookup("SAYR_GEMINI_ENDPOINT") {
            self.model.endpoint = Some(endpoint);
        }
        if let Some(raw) = lookup("SAYR_GOOGLE_SEARCH") {
            self.model.google_search = parse_var("SAYR_GOOGLE_SEARCH", &raw)?;
        }
        if let Some(raw) = lookup("SAYR_RETRY_ATTEMPTS") {
            self.retry.attempts = parse_var("SAYR_RETRY_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = lookup("SAYR_RETRY_EXP_BASE") {
            self.retry.exp_base = parse_var("SAYR_RETRY_EXP_BASE", &raw)?;
        }
        if let Some(raw) = lookup("SAYR_RETRY_INITIAL_DELAY") {
            let secs: f64 = parse_var("SAYR_RETRY_INITIAL_DELAY", &raw)?;
            self.retry.initial_delay = Duration::try_from_secs_f64(secs).map_err(|_| {
                SayrError::Config(format!("invalid value `{raw}` for SAYR_RETRY_INITIAL_DELAY"))
            })?;
        }
        if let Some(raw) = lookup("SAYR_RETRY_STATUS_CODES") {
            self.retry.http_status_codes = parse_status_codes(&raw)?;
        }
        if let Some(host) = lookup("SAYR_HOST") {
            self.server.host = host;
        }
        if let Some(raw) = lookup("SAYR_PORT") {
            self.server.port = parse_var("SAYR_PORT", &raw)?;
        }
        if let Some(raw) = lookup("SAYR_STORAGE_BACKEND") {
            self.storage.backend = match raw.trim().to_ascii_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                "sqlite" => StorageBackend::Sqlite,
                other => {
                    return Err(SayrError::Config(format!(
                        "unknown storage backend `{other}`"
                    )))
                }
            };
        }
        if let Some(url) = lookup("SAYR_DATABASE_URL") {
            self.storage.database_url = Some(url);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        match self.model.provider.as_str() {
            "gemini" => {
                if self
                    .model
                    .api_key
                    .as_deref()
                    .map_or(true, |k| k.trim().is_empty())
                {
                    return Err(SayrError::Config(
                        "Gemini provider requires SAYR_GEMINI_API_KEY".into(),
                    ));
                }
            }
            "stub" => {}
            other => {
                return Err(SayrError::Config(format!(
                    "unknown model provider `{other}`"
                )))
            }
        }
        if self.storage.backend == StorageBackend::Sqlite && self.storage.database_url.is_none() {
            return Err(SayrError::Config(
                "sqlite storage requires SAYR_DATABASE_URL".into(),
            ));
        }
        self.retry.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn parses_status_code_lists() {
        assert_eq!(parse_status_codes("429, 500,503").unwrap(), vec![429, 500, 503]);
        assert_eq!(
            parse_status_codes("[429, 500, 503, 504]").unwrap(),
            vec![429, 500, 503, 504]
        );
        assert!(parse_status_codes("[429, 500").is_err());
        assert!(parse_status_codes("__import__('os')").is_err());
        assert!(parse_status_codes("429, 99").is_err());
        assert!(parse_status_codes("[]").is_err());
    }

    #[test]
    fn applies_env_overrides_with_defaults() {
        let mut cfg = AppConfig::default();
        cfg.apply_overrides(lookup(&[
            ("SAYR_GEMINI_API_KEY", "k"),
            ("SAYR_RETRY_ATTEMPTS", "3"),
            ("SAYR_RETRY_STATUS_CODES", "[503]"),
        ]))
        .unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.retry.attempts, 3);
        assert_eq!(cfg.retry.exp_base, 7);
        assert_eq!(cfg.retry.initial_delay, Duration::from_secs(1));
        assert_eq!(cfg.retry.http_status_codes, vec![503]);
        assert_eq!(cfg.model.api_key.as_deref(), Some("k"));
    }

    #[test]
    fn malformed_values_fail_fast() {
        let mut cfg = AppConfig::default();
        let err = cfg
            .apply_overrides(lookup(&[("SAYR_RETRY_ATTEMPTS", "five")]))
            .unwrap_err();
        assert!(matches!(err, SayrError::Config(_)));

        let mut cfg = AppConfig::default();
        assert!(cfg
            .apply_overrides(lookup(&[("SAYR_STORAGE_BACKEND", "redis")]))
            .is_err());
    }

    #[test]
    fn missing_api_key_is_rejected() {
        let cfg = AppConfig::default();
        assert!(matches!(cfg.validate(), Err(SayrError::Config(_))));

        let mut stub = AppConfig::default();
        stub.model.provider = "stub".into();
        stub.validate().unwrap();

        stub.retry.attempts = 0;
        assert!(stub.validate().is_err());
    }

    #[test]
    fn loads_file_and_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[app]\nname='Blog'\n[model]\nprovider='stub'\nmodel='m'\n[retry]\nattempts=2\ninitial_delay_secs=0.5\n[server]\nport=9000"
        )
        .unwrap();

        let mut cfg = AppConfig::from_file(file.path()).unwrap();
        cfg.apply_overrides(lookup(&[("SAYR_PORT", "9100")])).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.app.name, "Blog");
        assert_eq!(cfg.app.user_id, "demo_user");
        assert_eq!(cfg.retry.attempts, 2);
        assert_eq!(cfg.retry.initial_delay, Duration::from_millis(500));
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
    }
}
