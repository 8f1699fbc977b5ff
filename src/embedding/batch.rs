//! Submit-then-poll embedding over an asynchronous batch API.
//!
//! [`BatchProvider`] wraps a synchronous remote provider. Each
//! `embed_batch` call submits one job through a [`BatchTransport`], polls
//! it every `poll_interval_ms` and downloads the output. Jobs in flight
//! are bounded by a semaphore of `concurrency` permits.
//!
//! Any job failure (submit error, failed job, timeout, bad output) is
//! counted and the call is answered by the wrapped provider instead.
//! After [`BATCH_FAILURE_LIMIT`] failures the batch path is switched off
//! for the lifetime of the provider.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use bridge_memory_core::embedding::EmbeddingProvider;
use bridge_memory_core::error::EmbeddingError;

use super::remote::{classify_status, parse_openai_response, transport_error, RemoteProvider};
use crate::config::BatchSettings;

pub const BATCH_FAILURE_LIMIT: u32 = 2;

/// State of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchJobState {
    Pending,
    Completed { output_file: String },
    Failed(String),
}

/// Wire protocol of a batch embedding API.
#[async_trait]
pub trait BatchTransport: Send + Sync {
    /// Provider name for status reporting.
    fn name(&self) -> &str;

    /// Submit `texts` as one job; returns the job id.
    async fn submit(&self, texts: &[String]) -> Result<String, EmbeddingError>;

    async fn poll(&self, job_id: &str) -> Result<BatchJobState, EmbeddingError>;

    /// Download `expected` vectors, in input order.
    async fn fetch(&self, output_file: &str, expected: usize)
        -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Batch telemetry surfaced by `status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchTelemetry {
    pub enabled: bool,
    pub active: bool,
    pub failures: u32,
    pub limit: u32,
    pub wait: bool,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub timeout_minutes: u64,
    pub last_error: Option<String>,
    pub last_provider: Option<String>,
}

#[derive(Default)]
struct BatchState {
    failures: u32,
    last_error: Option<String>,
    last_provider: Option<String>,
}

enum JobError {
    /// `wait = false` and the job has not finished yet.
    Pending(String),
    Failed(EmbeddingError),
}

impl From<EmbeddingError> for JobError {
    fn from(e: EmbeddingError) -> Self {
        JobError::Failed(e)
    }
}

pub struct BatchProvider {
    inner: Arc<dyn EmbeddingProvider>,
    transport: Arc<dyn BatchTransport>,
    settings: BatchSettings,
    permits: Semaphore,
    state: Mutex<BatchState>,
}

impl BatchProvider {
    pub fn new(
        inner: Arc<dyn EmbeddingProvider>,
        transport: Arc<dyn BatchTransport>,
        settings: BatchSettings,
    ) -> Self {
        let permits = Semaphore::new(settings.concurrency.max(1));
        Self {
            inner,
            transport,
            settings,
            permits,
            state: Mutex::new(BatchState::default()),
        }
    }

    pub fn telemetry(&self) -> BatchTelemetry {
        let (failures, last_error, last_provider) = match self.state.lock() {
            Ok(s) => (s.failures, s.last_error.clone(), s.last_provider.clone()),
            Err(_) => (BATCH_FAILURE_LIMIT, Some("batch state poisoned".into()), None),
        };
        BatchTelemetry {
            enabled: self.settings.enabled,
            active: failures < BATCH_FAILURE_LIMIT,
            failures,
            limit: BATCH_FAILURE_LIMIT,
            wait: self.settings.wait,
            concurrency: self.settings.concurrency,
            poll_interval_ms: self.settings.poll_interval_ms,
            timeout_minutes: self.settings.timeout_minutes,
            last_error,
            last_provider,
        }
    }

    fn active(&self) -> bool {
        self.state
            .lock()
            .map(|s| s.failures < BATCH_FAILURE_LIMIT)
            .unwrap_or(false)
    }

    fn record_failure(&self, error: &EmbeddingError) {
        if let Ok(mut state) = self.state.lock() {
            state.failures += 1;
            state.last_error = Some(error.to_string());
            state.last_provider = Some(self.transport.name().to_string());
            if state.failures >= BATCH_FAILURE_LIMIT {
                warn!(
                    failures = state.failures,
                    "Batch embedding disabled after repeated failures"
                );
            }
        }
    }

    async fn run_job(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, JobError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EmbeddingError::Unavailable("batch permits closed".into()))?;

        let timeout = Duration::from_secs(self.settings.timeout_minutes.saturating_mul(60));
        let poll_interval = Duration::from_millis(self.settings.poll_interval_ms);
        let deadline = Instant::now() + timeout;

        let job = self.transport.submit(texts).await?;
        debug!(job = %job, inputs = texts.len(), "Submitted embedding batch");

        loop {
            match self.transport.poll(&job).await? {
                BatchJobState::Completed { output_file } => {
                    let vectors = self.transport.fetch(&output_file, texts.len()).await?;
                    if vectors.len() != texts.len() {
                        return Err(JobError::Failed(EmbeddingError::CountMismatch {
                            expected: texts.len(),
                            got: vectors.len(),
                        }));
                    }
                    return Ok(vectors);
                }
                BatchJobState::Failed(reason) => {
                    return Err(JobError::Failed(EmbeddingError::Rejected(format!(
                        "batch job {} failed: {}",
                        job, reason
                    ))));
                }
                BatchJobState::Pending => {
                    if !self.settings.wait {
                        return Err(JobError::Pending(job));
                    }
                    if Instant::now() + poll_interval > deadline {
                        return Err(JobError::Failed(EmbeddingError::Timeout(timeout)));
                    }
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }
}

#[async_trait]
impl EmbeddingProvider for BatchProvider {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    fn dims(&self) -> Option<usize> {
        self.inner.dims()
    }

    fn provider_key(&self) -> String {
        self.inner.provider_key()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if !self.active() {
            return self.inner.embed_batch(texts).await;
        }

        match self.run_job(texts).await {
            Ok(vectors) => Ok(vectors),
            Err(JobError::Pending(job)) => {
                debug!(job = %job, "Batch pending and wait disabled, embedding directly");
                self.inner.embed_batch(texts).await
            }
            Err(JobError::Failed(e)) => {
                warn!(error = %e, "Batch embedding failed, embedding directly");
                self.record_failure(&e);
                self.inner.embed_batch(texts).await
            }
        }
    }
}

/// OpenAI Batch API: upload JSONL, create a batch, poll it, download the
/// output file.
pub struct OpenAiBatchTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiBatchTransport {
    pub fn new(remote: &RemoteProvider) -> anyhow::Result<Self> {
        let api_key = remote
            .api_key()
            .ok_or_else(|| anyhow::anyhow!("OpenAI batch embeddings require OPENAI_API_KEY"))?;
        Ok(Self {
            client: remote.client().clone(),
            base_url: remote.base_url().to_string(),
            api_key: api_key.to_string(),
            model: remote.model().to_string(),
        })
    }

    fn request_lines(&self, texts: &[String]) -> Result<String, EmbeddingError> {
        let mut jsonl = String::new();
        for (i, text) in texts.iter().enumerate() {
            let line = serde_json::json!({
                "custom_id": i.to_string(),
                "method": "POST",
                "url": "/v1/embeddings",
                "body": {"model": self.model, "input": text},
            });
            let encoded = serde_json::to_string(&line)
                .map_err(|e| EmbeddingError::Rejected(format!("batch encode: {}", e)))?;
            jsonl.push_str(&encoded);
            jsonl.push('\n');
        }
        Ok(jsonl)
    }

    async fn send_json(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<serde_json::Value, EmbeddingError> {
        let response = request
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| transport_error("openai-batch", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("openai-batch", status, &body));
        }
        response
            .json()
            .await
            .map_err(|e| transport_error("openai-batch", e))
    }
}

fn json_str(value: &serde_json::Value, key: &str) -> Result<String, EmbeddingError> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| EmbeddingError::Rejected(format!("batch response missing '{}'", key)))
}

/// Parse a batch output file into vectors ordered by `custom_id`.
fn parse_batch_output(body: &str, expected: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected];
    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        let item: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| EmbeddingError::Rejected(format!("batch output line: {}", e)))?;
        let index: usize = json_str(&item, "custom_id")?
            .parse()
            .map_err(|_| EmbeddingError::Rejected("batch output has a bad custom_id".into()))?;
        let body = item
            .get("response")
            .and_then(|r| r.get("body"))
            .ok_or_else(|| EmbeddingError::Rejected(format!("batch item {} has no body", index)))?;
        let mut vectors = parse_openai_response(body).map_err(EmbeddingError::Rejected)?;
        match (slots.get_mut(index), vectors.pop()) {
            (Some(slot), Some(vector)) => *slot = Some(vector),
            _ => {
                return Err(EmbeddingError::Rejected(format!(
                    "batch item {} out of range or empty",
                    index
                )))
            }
        }
    }
    let got = slots.iter().filter(|s| s.is_some()).count();
    if got != expected {
        return Err(EmbeddingError::CountMismatch { expected, got });
    }
    Ok(slots.into_iter().flatten().collect())
}

#[async_trait]
impl BatchTransport for OpenAiBatchTransport {
    fn name(&self) -> &str {
        "openai"
    }

    async fn submit(&self, texts: &[String]) -> Result<String, EmbeddingError> {
        let jsonl = self.request_lines(texts)?;
        let part = reqwest::multipart::Part::bytes(jsonl.into_bytes())
            .file_name("embeddings.jsonl")
            .mime_str("application/jsonl")
            .map_err(|e| EmbeddingError::Rejected(format!("batch upload: {}", e)))?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "batch")
            .part("file", part);

        let file = self
            .send_json(
                self.client
                    .post(format!("{}/v1/files", self.base_url))
                    .multipart(form),
            )
            .await?;
        let input_file_id = json_str(&file, "id")?;

        let batch = self
            .send_json(
                self.client
                    .post(format!("{}/v1/batches", self.base_url))
                    .json(&serde_json::json!({
                        "input_file_id": input_file_id,
                        "endpoint": "/v1/embeddings",
                        "completion_window": "24h",
                    })),
            )
            .await?;
        json_str(&batch, "id")
    }

    async fn poll(&self, job_id: &str) -> Result<BatchJobState, EmbeddingError> {
        let batch = self
            .send_json(
                self.client
                    .get(format!("{}/v1/batches/{}", self.base_url, job_id)),
            )
            .await?;
        let status = json_str(&batch, "status")?;
        Ok(match status.as_str() {
            "completed" => BatchJobState::Completed {
                output_file: json_str(&batch, "output_file_id")?,
            },
            "failed" | "expired" | "cancelled" | "cancelling" => BatchJobState::Failed(status),
            _ => BatchJobState::Pending,
        })
    }

    async fn fetch(
        &self,
        output_file: &str,
        expected: usize,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let response = self
            .client
            .get(format!("{}/v1/files/{}/content", self.base_url, output_file))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| transport_error("openai-batch", e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error("openai-batch", e))?;
        if !status.is_success() {
            return Err(classify_status("openai-batch", status, &body));
        }
        parse_batch_output(&body, expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn id(&self) -> &str {
            "openai"
        }
        fn model(&self) -> &str {
            "test-model"
        }
        fn dims(&self) -> Option<usize> {
            Some(2)
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|_| vec![0.0, 1.0]).collect())
        }
    }

    /// Reports `Pending` for `pending_polls` polls, then `outcome`.
    struct ScriptedTransport {
        pending_polls: usize,
        outcome: BatchJobState,
        submits: AtomicUsize,
        polls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(pending_polls: usize, outcome: BatchJobState) -> Arc<Self> {
            Arc::new(Self {
                pending_polls,
                outcome,
                submits: AtomicUsize::new(0),
                polls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl BatchTransport for ScriptedTransport {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn submit(&self, _texts: &[String]) -> Result<String, EmbeddingError> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            Ok("job-1".into())
        }
        async fn poll(&self, _job_id: &str) -> Result<BatchJobState, EmbeddingError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if n < self.pending_polls {
                Ok(BatchJobState::Pending)
            } else {
                Ok(self.outcome.clone())
            }
        }
        async fn fetch(
            &self,
            _output_file: &str,
            expected: usize,
        ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok((0..expected).map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn settings(wait: bool, timeout_minutes: u64) -> BatchSettings {
        BatchSettings {
            enabled: true,
            wait,
            concurrency: 2,
            poll_interval_ms: 1000,
            timeout_minutes,
        }
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("t{}", i)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_job_returns_batch_vectors() {
        let inner = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let transport = ScriptedTransport::new(
            3,
            BatchJobState::Completed {
                output_file: "out".into(),
            },
        );
        let provider = BatchProvider::new(inner.clone(), transport.clone(), settings(true, 60));
        let vectors = provider.embed_batch(&texts(3)).await.unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0]; 3]);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
        assert_eq!(transport.polls.load(Ordering::SeqCst), 4);
        assert_eq!(provider.telemetry().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_fall_back_then_disable_batch() {
        let inner = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let transport = ScriptedTransport::new(0, BatchJobState::Failed("failed".into()));
        let provider = BatchProvider::new(inner.clone(), transport.clone(), settings(true, 60));

        for _ in 0..3 {
            let vectors = provider.embed_batch(&texts(2)).await.unwrap();
            assert_eq!(vectors, vec![vec![0.0, 1.0]; 2]);
        }
        assert_eq!(transport.submits.load(Ordering::SeqCst), 2);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);

        let telemetry = provider.telemetry();
        assert_eq!(telemetry.failures, 2);
        assert!(!telemetry.active);
        assert_eq!(telemetry.last_provider.as_deref(), Some("scripted"));
        assert!(telemetry.last_error.unwrap().contains("failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let inner = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let transport = ScriptedTransport::new(usize::MAX, BatchJobState::Pending);
        let provider = BatchProvider::new(inner.clone(), transport, settings(true, 1));
        provider.embed_batch(&texts(1)).await.unwrap();
        let telemetry = provider.telemetry();
        assert_eq!(telemetry.failures, 1);
        assert!(telemetry.last_error.unwrap().contains("timed out"));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_wait_answers_directly_without_failure() {
        let inner = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let transport = ScriptedTransport::new(usize::MAX, BatchJobState::Pending);
        let provider = BatchProvider::new(inner.clone(), transport.clone(), settings(false, 60));
        provider.embed_batch(&texts(1)).await.unwrap();
        assert_eq!(transport.polls.load(Ordering::SeqCst), 1);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.telemetry().failures, 0);
    }

    #[test]
    fn test_parse_batch_output_orders_by_custom_id() {
        let body = concat!(
            r#"{"custom_id":"1","response":{"status_code":200,"body":{"data":[{"index":0,"embedding":[0.0,1.0]}]}}}"#,
            "\n",
            r#"{"custom_id":"0","response":{"status_code":200,"body":{"data":[{"index":0,"embedding":[1.0,0.0]}]}}}"#,
            "\n"
        );
        let vectors = parse_batch_output(body, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert!(matches!(
            parse_batch_output(body, 3),
            Err(EmbeddingError::CountMismatch { expected: 3, got: 2 })
        ));
    }
}
