//! Structured parsing: table crop → vision model → loosely-typed rows.
//!
//! The vision model sits behind the [`VisionModel`] trait; production wraps
//! an `edgequake-llm` provider ([`LlmVisionModel`]), tests use scripted
//! fakes. [`StructuredParser`] owns the retry policy and the run-wide
//! concurrency permit, and always hands back a [`RawExtraction`] so the
//! exchange can be audited whether or not it produced rows.
//!
//! ## Retry strategy
//!
//! Timeouts, rate limits and other transient failures are retried up to
//! `max_attempts` total attempts, sleeping `backoff_ms * 2^(n-1)` (capped at
//! `max_backoff_ms`) before retry `n`. The permit is released during the
//! sleep so a backing-off region does not starve the others. Permanent
//! provider errors and unparseable answers are quarantined at once.

use crate::error::StageError;
use crate::model::{ExtractionStatus, RawExtraction, RegionRef};
use crate::prompts::PromptTemplate;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, LlmError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, warn};

/// One row as the model returned it, before validation.
pub type IntermediateRow = Map<String, Value>;

/// Failure of a single vision-model call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum VisionCallError {
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("request rejected: {0}")]
    Permanent(String),
}

impl VisionCallError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, VisionCallError::Permanent(_))
    }

    /// Sort a provider error into retryable / permanent by its variant.
    /// Only the untyped variants fall back to [`classify`](Self::classify).
    pub fn from_llm(error: LlmError) -> Self {
        match error {
            LlmError::RateLimited(m) => VisionCallError::RateLimited(m),
            LlmError::Timeout
            | LlmError::NetworkError(_)
            | LlmError::ProviderError(_)
            | LlmError::SerializationError(_) => VisionCallError::Transient(error.to_string()),
            LlmError::AuthError(_)
            | LlmError::InvalidRequest(_)
            | LlmError::ModelNotFound(_)
            | LlmError::ConfigError(_)
            | LlmError::NotSupported(_)
            | LlmError::TokenLimitExceeded { .. } => VisionCallError::Permanent(error.to_string()),
            LlmError::ApiError(_) | LlmError::Unknown(_) => Self::classify(error.to_string()),
        }
    }

    /// Sort a provider error message into retryable / permanent.
    pub fn classify(message: String) -> Self {
        let lower = message.to_lowercase();
        if RE_RATE_LIMIT.is_match(&lower) {
            VisionCallError::RateLimited(message)
        } else if RE_PERMANENT.is_match(&lower) {
            VisionCallError::Permanent(message)
        } else {
            VisionCallError::Transient(message)
        }
    }
}

static RE_RATE_LIMIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b429\b|rate.?limit|too many requests").unwrap());
static RE_PERMANENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(400|401|403|404)\b|unauthori[sz]ed|authentication|invalid api key|bad request|invalid_request|permission denied",
    )
    .unwrap()
});

/// A vision-capable model: instruction + images in, text out.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Identifier recorded with every extraction, e.g. `openai/gpt-4o`.
    fn model_id(&self) -> String;

    async fn complete(
        &self,
        instruction: &str,
        images: Vec<ImageData>,
    ) -> Result<String, VisionCallError>;
}

/// [`VisionModel`] over an `edgequake-llm` provider.
pub struct LlmVisionModel {
    provider: Arc<dyn LLMProvider>,
    model_id: String,
    options: CompletionOptions,
    timeout: Duration,
}

impl LlmVisionModel {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        model_id: impl Into<String>,
        temperature: f32,
        max_tokens: usize,
        timeout_secs: u64,
    ) -> Self {
        Self {
            provider,
            model_id: model_id.into(),
            options: CompletionOptions {
                temperature: Some(temperature),
                max_tokens: Some(max_tokens),
                ..Default::default()
            },
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl VisionModel for LlmVisionModel {
    fn model_id(&self) -> String {
        self.model_id.clone()
    }

    async fn complete(
        &self,
        instruction: &str,
        images: Vec<ImageData>,
    ) -> Result<String, VisionCallError> {
        let messages = vec![
            ChatMessage::system(instruction),
            ChatMessage::user_with_images("Extract the tariff rows from this table.", images),
        ];

        let call = self.provider.chat(&messages, Some(&self.options));
        match tokio::time::timeout(self.timeout, call).await {
            Err(_) => Err(VisionCallError::Timeout(self.timeout.as_secs())),
            Ok(Err(e)) => Err(VisionCallError::from_llm(e)),
            Ok(Ok(response)) => {
                debug!(
                    "{}: {} input tokens, {} output tokens",
                    self.model_id, response.prompt_tokens, response.completion_tokens
                );
                Ok(response.content)
            }
        }
    }
}

// ── Parser ───────────────────────────────────────────────────────────────

/// Retry policy for the parser.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Sleep before retry `n` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(20);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }
}

/// Result of parsing one region. The extraction is always present.
#[derive(Debug, Clone)]
pub enum ParseOutcome {
    Parsed {
        extraction: RawExtraction,
        rows: Vec<IntermediateRow>,
    },
    Quarantined {
        extraction: RawExtraction,
        error: StageError,
    },
}

impl ParseOutcome {
    pub fn extraction(&self) -> &RawExtraction {
        match self {
            ParseOutcome::Parsed { extraction, .. } | ParseOutcome::Quarantined { extraction, .. } => {
                extraction
            }
        }
    }
}

/// Drives the vision model for table regions.
pub struct StructuredParser {
    model: Arc<dyn VisionModel>,
    permits: Arc<Semaphore>,
    prompt: PromptTemplate,
    retry: RetryPolicy,
}

impl StructuredParser {
    /// `permits` is shared by every parser call of a run and bounds
    /// concurrent model requests.
    pub fn new(
        model: Arc<dyn VisionModel>,
        permits: Arc<Semaphore>,
        prompt: PromptTemplate,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            model,
            permits,
            prompt,
            retry,
        }
    }

    pub async fn parse(
        &self,
        region: RegionRef,
        images: Vec<ImageData>,
        country: &str,
        line: Option<&str>,
    ) -> ParseOutcome {
        let instruction = self.prompt.render(country, line);
        let start = Instant::now();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_err: Option<VisionCallError> = None;
        let mut attempts = 0;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let backoff = self.retry.backoff(attempt);
                warn!(
                    "{}: retry {}/{} after {}ms",
                    region,
                    attempt,
                    max_attempts - 1,
                    backoff.as_millis()
                );
                sleep(backoff).await;
            }
            attempts = attempt + 1;

            let result = {
                let _permit = match self.permits.acquire().await {
                    Ok(p) => p,
                    Err(e) => {
                        last_err = Some(VisionCallError::Permanent(e.to_string()));
                        break;
                    }
                };
                self.model.complete(&instruction, images.clone()).await
            };

            match result {
                Ok(text) => {
                    let extraction = self.extraction(&region, text.clone(), start, attempts);
                    return match decode_rows(&text) {
                        Ok(rows) => {
                            debug!("{}: {} row(s) from model", region, rows.len());
                            ParseOutcome::Parsed {
                                extraction: extraction.with_status(ExtractionStatus::Parsed, None),
                                rows,
                            }
                        }
                        Err(detail) => {
                            warn!("{}: unparseable output: {}", region, detail);
                            quarantine(
                                extraction,
                                ExtractionStatus::StructuralError,
                                StageError::ParseStructural { detail },
                            )
                        }
                    };
                }
                Err(e) if !e.is_retryable() => {
                    warn!("{}: {}", region, e);
                    let extraction = self.extraction(&region, e.to_string(), start, attempts);
                    return quarantine(
                        extraction,
                        ExtractionStatus::RejectedByModel,
                        StageError::ParseRejected {
                            detail: e.to_string(),
                        },
                    );
                }
                Err(e) => {
                    warn!("{}: attempt {} failed: {}", region, attempts, e);
                    last_err = Some(e);
                }
            }
        }

        let detail = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        let extraction = self.extraction(&region, detail.clone(), start, attempts);
        quarantine(
            extraction,
            ExtractionStatus::RetryExhausted,
            StageError::ParseTransientExhausted { attempts, detail },
        )
    }

    fn extraction(
        &self,
        region: &RegionRef,
        raw_output: String,
        start: Instant,
        attempts: u32,
    ) -> RawExtraction {
        RawExtraction {
            region: region.clone(),
            prompt_version: self.prompt.version.clone(),
            model_id: self.model.model_id(),
            raw_output,
            latency_ms: start.elapsed().as_millis() as u64,
            attempts,
            status: ExtractionStatus::Parsed,
            reason: None,
        }
    }
}

impl RawExtraction {
    fn with_status(mut self, status: ExtractionStatus, reason: Option<String>) -> Self {
        self.status = status;
        self.reason = reason;
        self
    }
}

fn quarantine(extraction: RawExtraction, status: ExtractionStatus, error: StageError) -> ParseOutcome {
    let reason = format!("{}: {}", error.code(), error);
    ParseOutcome::Quarantined {
        extraction: extraction.with_status(status, Some(reason)),
        error,
    }
}

// ── Output decoding ──────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*\s*\n(.*?)\n?```\s*$").unwrap());

/// Keys under which a model sometimes nests the row array.
const ROW_CONTAINERS: &[&str] = &["rows", "records", "tariffs", "data"];

/// Turn model text into rows.
///
/// Accepts a JSON array of objects, an object wrapping such an array, or a
/// single object, optionally inside a Markdown code fence or surrounded by
/// prose.
pub fn decode_rows(text: &str) -> Result<Vec<IntermediateRow>, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("empty response".into());
    }
    let body = RE_OUTER_FENCES
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .unwrap_or(trimmed);

    let value = match serde_json::from_str::<Value>(body) {
        Ok(v) => v,
        Err(first) => embedded_json(body).ok_or_else(|| format!("not valid JSON: {first}"))?,
    };

    match value {
        Value::Array(items) => rows_from_array(items),
        Value::Object(mut obj) => {
            let container = ROW_CONTAINERS
                .iter()
                .find(|key| obj.get(**key).is_some_and(Value::is_array));
            match container.and_then(|key| obj.remove(*key)) {
                Some(Value::Array(items)) => rows_from_array(items),
                _ => Ok(vec![obj]),
            }
        }
        other => Err(format!("expected an array or object, got {}", kind(&other))),
    }
}

fn rows_from_array(items: Vec<Value>) -> Result<Vec<IntermediateRow>, String> {
    items
        .into_iter()
        .enumerate()
        .map(|(i, v)| match v {
            Value::Object(obj) => Ok(obj),
            other => Err(format!("row {i} is {}, not an object", kind(&other))),
        })
        .collect()
}

/// Largest `[...]` or `{...}` span in the text that parses as JSON.
fn embedded_json(text: &str) -> Option<Value> {
    [('[', ']'), ('{', '}')].into_iter().find_map(|(open, close)| {
        let start = text.find(open)?;
        let end = text.rfind(close)?;
        (end > start)
            .then(|| serde_json::from_str(&text[start..=end]).ok())
            .flatten()
    })
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<VecDeque<Result<String, VisionCallError>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String, VisionCallError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl VisionModel for Scripted {
        fn model_id(&self) -> String {
            "fake/scripted".into()
        }

        async fn complete(&self, _: &str, _: Vec<ImageData>) -> Result<String, VisionCallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(VisionCallError::Transient("script exhausted".into())))
        }
    }

    fn parser(model: Arc<Scripted>) -> StructuredParser {
        StructuredParser::new(
            model,
            Arc::new(Semaphore::new(1)),
            PromptTemplate::default(),
            RetryPolicy {
                max_attempts: 3,
                backoff_ms: 1,
                max_backoff_ms: 5,
            },
        )
    }

    fn region() -> RegionRef {
        RegionRef {
            document: "india.pdf".into(),
            page: 1,
            region: 0,
            confidence: 0.92,
        }
    }

    #[test]
    fn decodes_fenced_array() {
        let rows = decode_rows("```json\n[{\"port\": \"Nhava Sheva\"}]\n```").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["port"], "Nhava Sheva");
    }

    #[test]
    fn decodes_wrapped_and_single_objects() {
        let rows = decode_rows(r#"{"rows": [{"a": 1}, {"a": 2}]}"#).unwrap();
        assert_eq!(rows.len(), 2);
        let rows = decode_rows(r#"{"port": "Mombasa"}"#).unwrap();
        assert_eq!(rows[0]["port"], "Mombasa");
    }

    #[test]
    fn decodes_json_inside_prose() {
        let rows = decode_rows("Here is the table:\n[{\"port\": \"Chennai\"}]\nHope this helps.").unwrap();
        assert_eq!(rows[0]["port"], "Chennai");
    }

    #[test]
    fn rejects_non_rows() {
        assert!(decode_rows("").is_err());
        assert!(decode_rows("I cannot read this image.").is_err());
        assert!(decode_rows("[1, 2]").unwrap_err().contains("row 0"));
        assert!(decode_rows("42").is_err());
    }

    #[test]
    fn classify_errors() {
        assert!(matches!(
            VisionCallError::classify("HTTP 429 Too Many Requests".into()),
            VisionCallError::RateLimited(_)
        ));
        assert!(matches!(
            VisionCallError::classify("401 Unauthorized: invalid api key".into()),
            VisionCallError::Permanent(_)
        ));
        assert!(matches!(
            VisionCallError::classify("connection reset by peer".into()),
            VisionCallError::Transient(_)
        ));
        assert!(matches!(
            VisionCallError::classify("context of 4000 tokens exceeded, retry".into()),
            VisionCallError::Transient(_)
        ));
    }

    #[test]
    fn typed_provider_errors() {
        let transient = [
            LlmError::Timeout,
            LlmError::NetworkError("connection refused".into()),
            LlmError::ProviderError("upstream overloaded".into()),
            LlmError::SerializationError(serde_json::from_str::<Value>("{").unwrap_err()),
        ];
        for e in transient {
            assert!(matches!(VisionCallError::from_llm(e), VisionCallError::Transient(_)));
        }

        // Wording that would fool the message fallback still maps by variant.
        let permanent = [
            LlmError::AuthError("try again later".into()),
            LlmError::InvalidRequest("429".into()),
            LlmError::ModelNotFound("gpt-9".into()),
            LlmError::ConfigError("no key".into()),
            LlmError::NotSupported("vision".into()),
            LlmError::TokenLimitExceeded { max: 10, got: 20 },
        ];
        for e in permanent {
            assert!(matches!(VisionCallError::from_llm(e), VisionCallError::Permanent(_)));
        }

        assert_eq!(
            VisionCallError::from_llm(LlmError::RateLimited("slow down".into())),
            VisionCallError::RateLimited("slow down".into())
        );
        assert!(matches!(
            VisionCallError::from_llm(LlmError::ApiError("401 Unauthorized".into())),
            VisionCallError::Permanent(_)
        ));
        assert!(matches!(
            VisionCallError::from_llm(LlmError::ApiError("503 Service Unavailable".into())),
            VisionCallError::Transient(_)
        ));
        assert!(matches!(
            VisionCallError::from_llm(LlmError::Unknown("rate limit hit".into())),
            VisionCallError::RateLimited(_)
        ));
    }

    #[test]
    fn scalar_container_key_stays_a_field() {
        let rows = decode_rows(r#"{"port": "Chennai", "data": "2024 tariff"}"#).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["data"], "2024 tariff");
        assert_eq!(rows[0]["port"], "Chennai");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            backoff_ms: 500,
            max_backoff_ms: 1500,
        };
        assert_eq!(p.backoff(1), Duration::from_millis(500));
        assert_eq!(p.backoff(2), Duration::from_millis(1000));
        assert_eq!(p.backoff(3), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn success_after_transient_failure() {
        let model = Scripted::new(vec![
            Err(VisionCallError::Timeout(60)),
            Ok(r#"[{"port": "Nhava Sheva"}]"#.into()),
        ]);
        let out = parser(Arc::clone(&model))
            .parse(region(), vec![], "India", Some("COSCO"))
            .await;
        match out {
            ParseOutcome::Parsed { extraction, rows } => {
                assert_eq!(rows.len(), 1);
                assert_eq!(extraction.attempts, 2);
                assert_eq!(extraction.status, ExtractionStatus::Parsed);
                assert_eq!(extraction.model_id, "fake/scripted");
            }
            other => panic!("expected parsed, got {other:?}"),
        }
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timeouts_exhaust_into_quarantine() {
        let model = Scripted::new(vec![
            Err(VisionCallError::Timeout(60)),
            Err(VisionCallError::Timeout(60)),
            Err(VisionCallError::Timeout(60)),
        ]);
        let out = parser(Arc::clone(&model))
            .parse(region(), vec![], "India", None)
            .await;
        match out {
            ParseOutcome::Quarantined { extraction, error } => {
                assert_eq!(extraction.status, ExtractionStatus::RetryExhausted);
                assert_eq!(extraction.attempts, 3);
                assert!(extraction.raw_output.contains("timed out"));
                assert!(extraction.reason.unwrap().starts_with("retry_exhausted"));
                assert!(matches!(
                    error,
                    StageError::ParseTransientExhausted { attempts: 3, .. }
                ));
            }
            other => panic!("expected quarantine, got {other:?}"),
        }
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn structural_error_is_not_retried() {
        let model = Scripted::new(vec![Ok("Sorry, no table here.".into())]);
        let out = parser(Arc::clone(&model))
            .parse(region(), vec![], "India", None)
            .await;
        let ParseOutcome::Quarantined { extraction, error } = out else {
            panic!("expected quarantine");
        };
        assert_eq!(extraction.status, ExtractionStatus::StructuralError);
        assert_eq!(extraction.raw_output, "Sorry, no table here.");
        assert_eq!(error.code(), "structural_error");
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permanent_error_quarantines_immediately() {
        let model = Scripted::new(vec![Err(VisionCallError::Permanent("401".into()))]);
        let out = parser(Arc::clone(&model))
            .parse(region(), vec![], "India", None)
            .await;
        assert_eq!(out.extraction().status, ExtractionStatus::RejectedByModel);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }
}
