use thiserror::Error;

pub type Result<T> = std::result::Result<T, SayrError>;

#[derive(Debug, Error)]
pub enum SayrError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{provider} request failed with status {status}: {body}")]
    ModelStatus {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("model transport error: {0}")]
    ModelTransport(String),

    #[error("language model error: {0}")]
    LanguageModel(String),

    #[error("model call failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<SayrError>,
    },

    #[error("tool `{0}` not found")]
    ToolNotFound(String),

    #[error("tool `{name}` invocation failed: {source}")]
    ToolInvocation {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("agent `{agent}` references state key `{key}` that no earlier step produced")]
    MissingStateKey { agent: String, key: String },

    #[error("session `{0}` not found")]
    SessionNotFound(String),

    #[error("turn failed in session `{session}`: {source}")]
    TurnFailed {
        session: String,
        #[source]
        source: Box<SayrError>,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SayrError {
    /// Whether a retry policy with the given retryable status codes should try again.
    pub fn is_transient(&self, retryable: &[u16]) -> bool {
        match self {
            SayrError::ModelStatus { status, .. } => retryable.contains(status),
            SayrError::ModelTransport(_) => true,
            _ => false,
        }
    }

    /// The innermost error, looking through turn failures and retry exhaustion.
    pub fn root_cause(&self) -> &SayrError {
        match self {
            SayrError::TurnFailed { source, .. } | SayrError::RetriesExhausted { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}
