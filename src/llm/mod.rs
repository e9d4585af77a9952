//! Language model capability
//!
//! The core consumes exactly one abstract capability: `generate` (and its
//! streaming variant). Providers live outside the core; variation between
//! them is configuration, not subtypes. Retry policy is bounded and only
//! applies to the transient error classes.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::CoreError;

/// Generation options shared by both call forms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub stop_sequences: Vec<String>,
    /// Per-call deadline; exceeded deadlines surface as `LlmError::Timeout`
    pub deadline_ms: u64,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.7,
            top_p: 0.95,
            stop_sequences: Vec::new(),
            deadline_ms: 30_000,
        }
    }
}

impl GenerateOptions {
    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = deadline.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Capability error classes the core must handle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("rate limited")]
    RateLimited,

    #[error("deadline exceeded")]
    Timeout,

    #[error("authentication failed")]
    AuthFailed,

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("content filtered: {0}")]
    ContentFiltered(String),
}

impl LlmError {
    /// Only rate limiting and unavailability are retried.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Unavailable(_))
    }
}

impl From<LlmError> for CoreError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::RateLimited | LlmError::Unavailable(_) | LlmError::Timeout => {
                Self::Transient(e.to_string())
            }
            LlmError::AuthFailed => Self::Fatal(e.to_string()),
            LlmError::ContentFiltered(reason) => {
                Self::CoherenceViolation(format!("provider filtered: {reason}"))
            }
        }
    }
}

/// One streamed fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub chunk: String,
    pub done: bool,
    pub error: Option<LlmError>,
}

/// The single language-model capability consumed by the core.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate a completion for `prompt` under `system`.
    async fn generate(
        &self,
        system: &str,
        prompt: &str,
        opts: &GenerateOptions,
    ) -> Result<String, LlmError>;

    /// Streaming variant. Providers without native streaming inherit this
    /// polyfill, which emits the whole completion as a single final chunk.
    async fn generate_stream(
        &self,
        system: &str,
        prompt: &str,
        opts: &GenerateOptions,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(4);
        match self.generate(system, prompt, opts).await {
            Ok(text) => {
                let _ = tx
                    .send(StreamEvent {
                        chunk: text,
                        done: true,
                        error: None,
                    })
                    .await;
            }
            Err(e) => {
                let _ = tx
                    .send(StreamEvent {
                        chunk: String::new(),
                        done: true,
                        error: Some(e),
                    })
                    .await;
            }
        }
        rx
    }
}

/// Drain a streamed generation into a single string, failing on the first
/// error event.
pub async fn collect_stream(
    model: &dyn LanguageModel,
    system: &str,
    prompt: &str,
    opts: &GenerateOptions,
) -> Result<String, LlmError> {
    let mut rx = model.generate_stream(system, prompt, opts).await;
    let mut text = String::new();
    while let Some(event) = rx.recv().await {
        if let Some(error) = event.error {
            return Err(error);
        }
        text.push_str(&event.chunk);
        if event.done {
            break;
        }
    }
    Ok(text)
}

/// Call the capability with the configured deadline and bounded
/// exponential backoff on retriable errors. Streams and accumulates unless
/// the policy forces plain calls; providers without native streaming are
/// polyfilled either way.
pub async fn generate_with_retry(
    model: &dyn LanguageModel,
    system: &str,
    prompt: &str,
    opts: &GenerateOptions,
    policy: &LlmConfig,
) -> Result<String, LlmError> {
    let mut attempt: u32 = 0;
    loop {
        let outcome = if policy.disable_streaming {
            match tokio::time::timeout(opts.deadline(), model.generate(system, prompt, opts))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout),
            }
        } else {
            match tokio::time::timeout(
                opts.deadline(),
                collect_stream(model, system, prompt, opts),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout),
            }
        };

        match outcome {
            Ok(text) => return Ok(text),
            Err(e) if e.is_retriable() && attempt < policy.retry_max => {
                let backoff = policy.backoff_base() * 2u32.saturating_pow(attempt);
                warn!(attempt, error = %e, backoff_ms = backoff.as_millis() as u64, "retrying capability call");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                debug!(attempt, error = %e, "capability call failed");
                return Err(e);
            }
        }
    }
}

/// Deterministic scripted model for tests and offline operation.
///
/// Pops queued responses in order, falling back to a fixed default; every
/// received prompt is recorded for inspection.
pub struct ScriptedModel {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: String,
    prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedModel {
    #[must_use]
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: fallback.into(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// A quiet inner voice: echoes a compact reflection of the prompt.
    #[must_use]
    pub fn offline() -> Self {
        Self::new("I am still turning this over; the echoes have not settled yet.")
    }

    #[must_use]
    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.push_response(text);
        self
    }

    #[must_use]
    pub fn with_error(self, error: LlmError) -> Self {
        self.responses
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(Err(error));
        self
    }

    pub fn push_response(&self, text: impl Into<String>) {
        self.responses
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(Ok(text.into()));
    }

    /// Every `(system, prompt)` pair this model has seen.
    #[must_use]
    pub fn seen_prompts(&self) -> Vec<(String, String)> {
        self.prompts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.prompts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(
        &self,
        system: &str,
        prompt: &str,
        _opts: &GenerateOptions,
    ) -> Result<String, LlmError> {
        self.prompts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((system.to_string(), prompt.to_string()));
        let next = self
            .responses
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front();
        match next {
            Some(result) => result,
            None => Ok(self.fallback.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;

    fn fast_policy() -> LlmConfig {
        let mut cfg = CoreConfig::fast().llm;
        cfg.backoff_base_ms = 1;
        cfg
    }

    #[test]
    fn scripted_model_pops_in_order() {
        tokio_test::block_on(async {
            let model = ScriptedModel::offline()
                .with_response("first")
                .with_response("second");
            let opts = GenerateOptions::default();
            assert_eq!(model.generate("s", "p", &opts).await.unwrap(), "first");
            assert_eq!(model.generate("s", "p", &opts).await.unwrap(), "second");
            // falls back to the default once the script runs out
            assert!(model.generate("s", "p", &opts).await.is_ok());
            assert_eq!(model.call_count(), 3);
        });
    }

    #[tokio::test]
    async fn retry_recovers_from_rate_limit() {
        let model = ScriptedModel::offline()
            .with_error(LlmError::RateLimited)
            .with_response("recovered");
        let result =
            generate_with_retry(&model, "s", "p", &GenerateOptions::default(), &fast_policy())
                .await;
        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let model = ScriptedModel::offline()
            .with_error(LlmError::Unavailable("down".into()))
            .with_error(LlmError::Unavailable("down".into()))
            .with_error(LlmError::Unavailable("down".into()))
            .with_error(LlmError::Unavailable("down".into()))
            .with_error(LlmError::Unavailable("down".into()));
        let policy = fast_policy(); // retry_max = 3
        let result =
            generate_with_retry(&model, "s", "p", &GenerateOptions::default(), &policy).await;
        assert!(matches!(result, Err(LlmError::Unavailable(_))));
        assert_eq!(model.call_count(), (policy.retry_max + 1) as usize);
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let model = ScriptedModel::offline().with_error(LlmError::AuthFailed);
        let result =
            generate_with_retry(&model, "s", "p", &GenerateOptions::default(), &fast_policy())
                .await;
        assert_eq!(result.unwrap_err(), LlmError::AuthFailed);
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn disable_streaming_uses_the_plain_path() {
        let model = ScriptedModel::offline().with_response("plain");
        let mut policy = fast_policy();
        policy.disable_streaming = true;
        let result =
            generate_with_retry(&model, "s", "p", &GenerateOptions::default(), &policy).await;
        assert_eq!(result.unwrap(), "plain");
    }

    #[test]
    fn collect_stream_accumulates_until_done() {
        tokio_test::block_on(async {
            let model = ScriptedModel::offline().with_response("whole answer");
            let text = collect_stream(&model, "s", "p", &GenerateOptions::default())
                .await
                .unwrap();
            assert_eq!(text, "whole answer");
        });
    }

    #[test]
    fn collect_stream_surfaces_errors() {
        tokio_test::block_on(async {
            let model = ScriptedModel::offline().with_error(LlmError::RateLimited);
            let result = collect_stream(&model, "s", "p", &GenerateOptions::default()).await;
            assert_eq!(result.unwrap_err(), LlmError::RateLimited);
        });
    }

    #[test]
    fn stream_polyfill_emits_single_final_chunk() {
        tokio_test::block_on(async {
            let model = ScriptedModel::offline().with_response("streamed whole");
            let mut rx = model
                .generate_stream("s", "p", &GenerateOptions::default())
                .await;
            let event = rx.recv().await.expect("one event");
            assert!(event.done);
            assert_eq!(event.chunk, "streamed whole");
            assert!(event.error.is_none());
            assert!(rx.recv().await.is_none());
        });
    }

    #[test]
    fn error_classes_map_into_core_taxonomy() {
        assert!(matches!(
            CoreError::from(LlmError::RateLimited),
            CoreError::Transient(_)
        ));
        assert!(matches!(
            CoreError::from(LlmError::AuthFailed),
            CoreError::Fatal(_)
        ));
        assert!(matches!(
            CoreError::from(LlmError::ContentFiltered("x".into())),
            CoreError::CoherenceViolation(_)
        ));
    }

    #[test]
    fn retriable_classes() {
        assert!(LlmError::RateLimited.is_retriable());
        assert!(LlmError::Unavailable("x".into()).is_retriable());
        assert!(!LlmError::Timeout.is_retriable());
        assert!(!LlmError::AuthFailed.is_retriable());
    }
}
