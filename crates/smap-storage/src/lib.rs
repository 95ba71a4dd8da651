//! Raw document archive + completion-service HTTP transport.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use smap_core::{sha256_hex, DocumentFormat};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "smap-storage";

#[derive(Debug, Clone)]
pub struct ArchivedDocument {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw uploaded documents.
#[derive(Debug, Clone)]
pub struct DocumentArchive {
    root: PathBuf,
}

impl DocumentArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn relative_path_for(
        &self,
        uploaded_at: DateTime<Utc>,
        format: Option<DocumentFormat>,
        content_hash: &str,
    ) -> PathBuf {
        let day = uploaded_at.format("%Y%m%d").to_string();
        let bucket = format.map(|f| f.as_str()).unwrap_or("unknown");
        let ext = format.map(|f| f.extension()).unwrap_or("bin");
        PathBuf::from(day)
            .join(bucket)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    pub async fn store_bytes(
        &self,
        uploaded_at: DateTime<Utc>,
        format: Option<DocumentFormat>,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedDocument> {
        let content_hash = sha256_hex(bytes);
        let relative_path = self.relative_path_for(uploaded_at, format, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .with_context(|| format!("archive path {} has no parent", absolute_path.display()))?;

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let archived = |deduplicated| ArchivedDocument {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp archive {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Request budget for the completion endpoint: `burst` calls may go out
/// back to back, then one call per `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRate {
    pub burst: u32,
    pub interval: Duration,
}

impl RequestRate {
    pub fn per_minute(requests: u32) -> Option<Self> {
        (requests > 0).then(|| Self {
            burst: requests.min(10),
            interval: Duration::from_secs(60) / requests,
        })
    }
}

/// Paces calls to a [`RequestRate`]; credit accrues continuously.
#[derive(Debug)]
pub struct RequestPacer {
    rate: RequestRate,
    state: Mutex<PacerState>,
}

#[derive(Debug)]
struct PacerState {
    credit: f64,
    updated: Instant,
}

impl RequestPacer {
    pub fn new(rate: RequestRate) -> Self {
        Self {
            rate,
            state: Mutex::new(PacerState {
                credit: f64::from(rate.burst.max(1)),
                updated: Instant::now(),
            }),
        }
    }

    /// Wait for one request slot and return how long the caller waited.
    pub async fn acquire(&self) -> Duration {
        let started = Instant::now();
        let interval = self.rate.interval.as_secs_f64();
        let ceiling = f64::from(self.rate.burst.max(1));
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                if interval > 0.0 {
                    let earned = now.duration_since(state.updated).as_secs_f64() / interval;
                    state.credit = (state.credit + earned).min(ceiling);
                } else {
                    state.credit = ceiling;
                }
                state.updated = now;
                if state.credit >= 1.0 {
                    state.credit -= 1.0;
                    return started.elapsed();
                }
                Duration::from_secs_f64((1.0 - state.credit) * interval)
            };
            debug!(?wait, "completion rate limit reached");
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// One chat-completion call, provider independent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub json_mode: bool,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("completion service returned http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("completion call timed out after {0:?}")]
    Timeout(Duration),
    #[error("completion response had no message content: {0}")]
    InvalidResponse(String),
    #[error("completion client is shut down")]
    Closed,
}

/// Black-box completion service boundary.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError>;
}

#[derive(Debug, Clone)]
pub struct CompletionClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RequestRate>,
    pub user_agent: Option<String>,
}

impl Default for CompletionClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o".to_string(),
            temperature: 0.2,
            timeout: Duration::from_secs(60),
            concurrency: 4,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
            user_agent: None,
        }
    }
}

/// OpenAI-compatible `chat/completions` client with bounded concurrency,
/// optional rate limiting and transient-failure retries.
#[derive(Debug)]
pub struct HttpCompletionClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    timeout: Duration,
    limit: Arc<Semaphore>,
    pacer: Option<RequestPacer>,
    backoff: BackoffPolicy,
}

impl HttpCompletionClient {
    pub fn new(config: CompletionClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key,
            model: config.model,
            temperature: config.temperature,
            timeout: config.timeout,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            pacer: config.rate_limit.map(RequestPacer::new),
            backoff: config.backoff,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send_with_retries(&self, body: &JsonValue) -> Result<String, CompletionError> {
        let _permit = self.limit.acquire().await.map_err(|_| CompletionError::Closed)?;

        if let Some(pacer) = &self.pacer {
            pacer.acquire().await;
        }

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.post(&self.endpoint).json(body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let payload: JsonValue = resp.json().await?;
                        return extract_message_content(&payload);
                    }

                    let retryable = classify_status(status) == RetryDisposition::Retryable;
                    if retryable && attempt < self.backoff.max_retries {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(status = status.as_u16(), attempt, ?delay, "completion call failed; backing off");
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(CompletionError::HttpStatus {
                        status: status.as_u16(),
                        body: truncate(&body, 500),
                    });
                }
                Err(err) => {
                    let retryable = classify_reqwest_error(&err) == RetryDisposition::Retryable;
                    if retryable && attempt < self.backoff.max_retries {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(error = %err, attempt, ?delay, "completion call errored; backing off");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    if err.is_timeout() {
                        return Err(CompletionError::Timeout(self.timeout));
                    }
                    return Err(CompletionError::Request(err));
                }
            }
        }

        Err(CompletionError::Timeout(self.timeout))
    }
}

#[async_trait]
impl CompletionService for HttpCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let body = chat_request_body(&self.model, self.temperature, request);
        let span = info_span!("completion_call", model = %self.model, messages = request.messages.len());
        let content = self.send_with_retries(&body).instrument(span).await?;
        debug!(chars = content.len(), "completion received");
        Ok(content)
    }
}

pub fn chat_request_body(model: &str, temperature: f32, request: &CompletionRequest) -> JsonValue {
    let mut body = json!({
        "model": model,
        "temperature": temperature,
        "messages": request.messages,
    });
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if request.json_mode {
        body["response_format"] = json!({ "type": "json_object" });
    }
    body
}

pub fn extract_message_content(payload: &JsonValue) -> Result<String, CompletionError> {
    payload
        .pointer("/choices/0/message/content")
        .and_then(JsonValue::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| CompletionError::InvalidResponse(truncate(&payload.to_string(), 300)))
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn archive_writes_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let archive = DocumentArchive::new(dir.path());
        let uploaded_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .store_bytes(uploaded_at, Some(DocumentFormat::Xml), b"<Policy/>")
            .await
            .expect("first store");
        let second = archive
            .store_bytes(uploaded_at, Some(DocumentFormat::Xml), b"<Policy/>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20260224/xml"));
        assert_eq!(
            fs::read(&first.absolute_path).await.expect("read back"),
            b"<Policy/>"
        );
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn rate_limits_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
    }

    #[test]
    fn request_body_uses_json_mode_when_asked() {
        let request = CompletionRequest {
            messages: vec![ChatMessage::system("Return JSON only."), ChatMessage::user("map")],
            json_mode: true,
            max_tokens: Some(512),
        };
        let body = chat_request_body("gpt-4o", 0.2, &request);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "map");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["max_tokens"], 512);
    }

    #[test]
    fn message_content_is_extracted_or_rejected() {
        let ok = json!({"choices": [{"message": {"role": "assistant", "content": "{\"mappings\":[]}"}}]});
        assert_eq!(extract_message_content(&ok).expect("content"), "{\"mappings\":[]}");

        let missing = json!({"choices": []});
        assert!(matches!(
            extract_message_content(&missing),
            Err(CompletionError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn pacer_spends_the_burst_then_spaces_calls() {
        let pacer = RequestPacer::new(RequestRate {
            burst: 2,
            interval: Duration::from_millis(80),
        });
        assert!(pacer.acquire().await < Duration::from_millis(20));
        assert!(pacer.acquire().await < Duration::from_millis(20));

        let started = Instant::now();
        let waited = pacer.acquire().await;
        assert!(waited >= Duration::from_millis(60), "waited {waited:?}");
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn per_minute_rates_cap_the_burst() {
        assert_eq!(RequestRate::per_minute(0), None);
        let slow = RequestRate::per_minute(30).expect("rate");
        assert_eq!(slow.interval, Duration::from_secs(2));
        assert_eq!(slow.burst, 10);
        assert_eq!(RequestRate::per_minute(3).map(|r| r.burst), Some(3));
    }
}
