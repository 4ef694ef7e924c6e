//! Retry with exponential backoff for model calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::RetryOptions;
use crate::error::{Result, SayrError};
use crate::llm::{LanguageModel, ModelCompletion};
use crate::message::Message;
use crate::tool::ToolDescription;

const MAX_DELAY_SECS: f64 = 3600.0;
const MAX_EXPONENT: u32 = 64;

impl RetryOptions {
    /// Sleep before attempt `attempt + 1`, where `attempt` is the 1-based attempt that failed.
    /// Capped at one hour.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay.as_secs_f64();
        if initial == 0.0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT) as i32;
        let secs = initial * f64::from(self.exp_base).powi(exponent);
        Duration::from_secs_f64(secs.min(MAX_DELAY_SECS))
    }
}

/// Wraps a model so retryable failures are retried per [`RetryOptions`].
pub struct RetryingModel {
    inner: Arc<dyn LanguageModel>,
    options: RetryOptions,
}

impl RetryingModel {
    pub fn new(inner: Arc<dyn LanguageModel>, options: RetryOptions) -> Self {
        Self { inner, options }
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }
}

#[async_trait]
impl LanguageModel for RetryingModel {
    async fn complete_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
    ) -> Result<ModelCompletion> {
        let attempts = self.options.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.inner.complete_chat(messages, tools).await {
                Ok(completion) => return Ok(completion),
                Err(err) if !err.is_transient(&self.options.http_status_codes) => return Err(err),
                Err(err) if attempt >= attempts => {
                    return Err(SayrError::RetriesExhausted {
                        attempts,
                        source: Box::new(err),
                    })
                }
                Err(err) => {
                    let delay = self.options.delay_after(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying model call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StubModel;

    fn options(attempts: u32) -> RetryOptions {
        RetryOptions {
            attempts,
            exp_base: 7,
            initial_delay: Duration::ZERO,
            http_status_codes: vec![429, 500, 503, 504],
        }
    }

    #[test]
    fn backoff_grows_exponentially() {
        let opts = RetryOptions {
            initial_delay: Duration::from_secs(1),
            ..options(5)
        };
        assert_eq!(opts.delay_after(1), Duration::from_secs(1));
        assert_eq!(opts.delay_after(2), Duration::from_secs(7));
        assert_eq!(opts.delay_after(3), Duration::from_secs(49));
    }

    #[test]
    fn backoff_saturates_for_huge_attempt_counts() {
        assert_eq!(options(u32::MAX).delay_after(u32::MAX), Duration::ZERO);
        assert_eq!(options(500).delay_after(400), Duration::ZERO);

        let opts = RetryOptions {
            initial_delay: Duration::from_millis(10),
            exp_base: u32::MAX,
            ..options(u32::MAX)
        };
        assert_eq!(opts.delay_after(u32::MAX), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let stub = StubModel::new(vec![
            r#"{"action":"fail","status":503}"#.into(),
            r#"{"action":"fail","status":503}"#.into(),
            r#"{"action":"respond","content":"third time"}"#.into(),
        ]);
        let model = RetryingModel::new(stub.clone(), options(3));

        let out = model.complete_chat(&[], &[]).await.unwrap();
        assert_eq!(out.content.as_deref(), Some("third time"));
        assert_eq!(stub.requests().len(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let stub = StubModel::new(vec![r#"{"action":"fail","status":503}"#.into(); 4]);
        let model = RetryingModel::new(stub.clone(), options(3));

        let err = model.complete_chat(&[], &[]).await.unwrap_err();
        assert!(matches!(err, SayrError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(stub.remaining(), 1);
    }

    #[tokio::test]
    async fn does_not_retry_non_retryable_status() {
        let stub = StubModel::new(vec![
            r#"{"action":"fail","status":400}"#.into(),
            r#"{"action":"respond","content":"unused"}"#.into(),
        ]);
        let model = RetryingModel::new(stub.clone(), options(3));

        let err = model.complete_chat(&[], &[]).await.unwrap_err();
        assert!(matches!(err, SayrError::ModelStatus { status: 400, .. }));
        assert_eq!(stub.remaining(), 1);
    }
}
