//! Model client abstraction and implementations.
//!
//! The orchestrator consumes a narrow streaming interface: start a stream
//! with a token cap, receive token batches, and learn the final token
//! usage. Every stream carries a cancellation handle; once cancelled, no
//! further batches are delivered and the producer releases its resources.
//!
//! Errors are classified **here**, at the adapter boundary, into
//! transient (retryable) and permanent (skip the model this race) so that
//! orchestrator logic stays free of provider-specific branching.
//!
//! Implementations:
//! - [`HttpModelClient`]: OpenAI-compatible `/completions` streaming API.
//! - [`ScriptedClient`]: deterministic in-process backend for tests/demos.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::ModelId;

/// Backend error, classified for the orchestrator's retry policy.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// Worth retrying: network hiccups, rate limits, 5xx responses.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// Not worth retrying this race: bad request, auth, missing model.
    #[error("permanent backend error: {0}")]
    Permanent(String),
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Whether the stream ran to a natural stop or hit its token cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Complete,
    Truncated,
}

/// Final accounting for one stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamUsage {
    pub tokens_consumed: u64,
    pub status: CompletionStatus,
}

/// One chunk of generated text.
#[derive(Debug, Clone)]
pub struct TokenBatch {
    pub text: String,
    pub tokens: u64,
}

/// Events delivered over a [`TokenStream`].
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Batch(TokenBatch),
    Done(StreamUsage),
    Failed(ClientError),
}

// ── Cancellation ────────────────────────────────────────────────────────

/// Cloneable cancellation handle shared between a stream's producer and
/// its consumer.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives inside this handle, so wait_for cannot observe
        // a closed channel while `self` is alive.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

// ── Stream plumbing ─────────────────────────────────────────────────────

/// Consumer half of a model stream.
#[derive(Debug)]
pub struct TokenStream {
    rx: mpsc::Receiver<StreamEvent>,
    cancel: CancelHandle,
}

impl TokenStream {
    /// Create a connected producer/consumer pair.
    pub fn channel(capacity: usize) -> (TokenSink, TokenStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = CancelHandle::new();
        (
            TokenSink {
                tx,
                cancel: cancel.clone(),
            },
            TokenStream { rx, cancel },
        )
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Cancel the producer. Batches already queued may still be drained.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Next event, or `None` once the producer is gone (e.g. cancelled
    /// before it could report usage).
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

/// Producer half of a model stream, used by client implementations.
pub struct TokenSink {
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancelHandle,
}

impl TokenSink {
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Send one batch. Returns false when the stream is cancelled or the
    /// consumer is gone; producers must stop promptly.
    pub async fn batch(&self, text: String, tokens: u64) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.tx
            .send(StreamEvent::Batch(TokenBatch { text, tokens }))
            .await
            .is_ok()
    }

    pub async fn done(self, usage: StreamUsage) {
        let _ = self.tx.send(StreamEvent::Done(usage)).await;
    }

    pub async fn fail(self, error: ClientError) {
        let _ = self.tx.send(StreamEvent::Failed(error)).await;
    }
}

// ── Trait ───────────────────────────────────────────────────────────────

/// Streaming interface to one LLM backend.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Stable identifier of the backend this client talks to.
    fn id(&self) -> &ModelId;

    /// Begin generating for `prompt`, bounded by `token_cap` when given.
    async fn stream(
        &self,
        prompt: &str,
        token_cap: Option<u64>,
    ) -> Result<TokenStream, ClientError>;
}

// ── Scripted client (testing / demo) ────────────────────────────────────

/// Deterministic in-process backend for pipeline tests and offline demos.
///
/// Emits `total_tokens` synthetic tokens in fixed-size batches with
/// configurable delays, and can be scripted to fail transiently a number
/// of times or permanently.
pub struct ScriptedClient {
    id: ModelId,
    first_token_delay: Duration,
    batch_delay: Duration,
    batch_size: u64,
    total_tokens: u64,
    transient_failures: AtomicU32,
    permanent: bool,
    emitted: Arc<AtomicU64>,
}

impl ScriptedClient {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: ModelId::new(id),
            first_token_delay: Duration::from_millis(5),
            batch_delay: Duration::from_millis(1),
            batch_size: 8,
            total_tokens: 64,
            transient_failures: AtomicU32::new(0),
            permanent: false,
            emitted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_first_token_delay(mut self, delay: Duration) -> Self {
        self.first_token_delay = delay;
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    pub fn with_batch_size(mut self, size: u64) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_total_tokens(mut self, tokens: u64) -> Self {
        self.total_tokens = tokens;
        self
    }

    /// Fail the next `n` calls to `stream` with a transient error.
    pub fn failing_transient(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Every call fails permanently.
    pub fn failing_permanent(mut self) -> Self {
        self.permanent = true;
        self
    }

    /// Total tokens emitted across every stream from this client. Used by
    /// cancellation tests to verify the loser stopped.
    pub fn emitted_tokens(&self) -> u64 {
        self.emitted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    fn id(&self) -> &ModelId {
        &self.id
    }

    async fn stream(
        &self,
        _prompt: &str,
        token_cap: Option<u64>,
    ) -> Result<TokenStream, ClientError> {
        if self.permanent {
            return Err(ClientError::Permanent(format!(
                "{} is scripted to fail",
                self.id
            )));
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ClientError::Transient(format!(
                "{} scripted transient failure",
                self.id
            )));
        }

        let (sink, stream) = TokenStream::channel(32);
        let cancel = sink.cancel_handle();
        let to_emit = token_cap.map_or(self.total_tokens, |cap| self.total_tokens.min(cap));
        let truncated = to_emit < self.total_tokens;
        let batch_size = self.batch_size;
        let first_delay = self.first_token_delay;
        let batch_delay = self.batch_delay;
        let emitted = self.emitted.clone();
        let label = self.id.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(first_delay) => {}
                _ = cancel.cancelled() => return,
            }
            let mut sent = 0u64;
            while sent < to_emit {
                let n = batch_size.min(to_emit - sent);
                let text = format!("{} ", label).repeat(n as usize);
                if !sink.batch(text, n).await {
                    return;
                }
                emitted.fetch_add(n, Ordering::SeqCst);
                sent += n;
                if sent < to_emit {
                    tokio::select! {
                        _ = tokio::time::sleep(batch_delay) => {}
                        _ = cancel.cancelled() => return,
                    }
                }
            }
            let status = if truncated {
                CompletionStatus::Truncated
            } else {
                CompletionStatus::Complete
            };
            sink.done(StreamUsage {
                tokens_consumed: sent,
                status,
            })
            .await;
        });

        Ok(stream)
    }
}

// ── HTTP client (OpenAI-compatible streaming) ───────────────────────────

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
}

/// Streaming client for OpenAI-compatible `/completions` endpoints
/// (OpenAI, vLLM, llama.cpp's compat server, local proxies).
pub struct HttpModelClient {
    id: ModelId,
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    remote_model: String,
    timeout: Duration,
}

impl HttpModelClient {
    pub fn new(id: impl Into<String>, remote_model: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            id: ModelId::new(id),
            http: reqwest::Client::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            remote_model: remote_model.into(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Override the API base URL — for compatible endpoints or mock
    /// servers in tests.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn classify_status(status: reqwest::StatusCode, body: String) -> ClientError {
        let msg = format!("HTTP {status}: {body}");
        if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
            ClientError::Transient(msg)
        } else {
            ClientError::Permanent(msg)
        }
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    fn id(&self) -> &ModelId {
        &self.id
    }

    async fn stream(
        &self,
        prompt: &str,
        token_cap: Option<u64>,
    ) -> Result<TokenStream, ClientError> {
        let request = CompletionRequest {
            model: &self.remote_model,
            prompt,
            max_tokens: token_cap,
            stream: true,
        };

        let mut builder = self
            .http
            .post(format!("{}/completions", self.base_url))
            .timeout(self.timeout)
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ClientError::Transient(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body));
        }

        let (sink, stream) = TokenStream::channel(64);
        let cancel = sink.cancel_handle();
        let model = self.id.clone();

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buffer = String::new();
            let mut total_tokens = 0u64;
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(model = %model, "stream cancelled, dropping connection");
                        return;
                    }
                    chunk = body.next() => chunk,
                };
                match chunk {
                    None => break,
                    Some(Err(e)) => {
                        sink.fail(ClientError::Transient(format!("stream broke: {e}")))
                            .await;
                        return;
                    }
                    Some(Ok(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = buffer.find('\n') {
                            let line = buffer[..pos].trim().to_string();
                            buffer.drain(..=pos);
                            let Some(data) = line.strip_prefix("data:") else {
                                continue;
                            };
                            let data = data.trim();
                            if data == "[DONE]" {
                                sink.done(StreamUsage {
                                    tokens_consumed: total_tokens,
                                    status: CompletionStatus::Complete,
                                })
                                .await;
                                return;
                            }
                            let Ok(parsed) = serde_json::from_str::<CompletionChunk>(data)
                            else {
                                continue;
                            };
                            let Some(choice) = parsed.choices.first() else {
                                continue;
                            };
                            if choice.text.is_empty() {
                                continue;
                            }
                            let tokens = choice.text.split_whitespace().count().max(1) as u64;
                            total_tokens += tokens;
                            if !sink.batch(choice.text.clone(), tokens).await {
                                return;
                            }
                        }
                    }
                }
            }
            sink.done(StreamUsage {
                tokens_consumed: total_tokens,
                status: CompletionStatus::Complete,
            })
            .await;
        });

        Ok(stream)
    }
}

/// Drain a stream to completion, collecting text and usage. Convenience
/// used by the judge and by tests; the orchestrator consumes events
/// incrementally instead.
pub async fn collect_stream(mut stream: TokenStream) -> Result<(String, StreamUsage), ClientError> {
    let mut text = String::new();
    loop {
        match stream.next_event().await {
            Some(StreamEvent::Batch(batch)) => text.push_str(&batch.text),
            Some(StreamEvent::Done(usage)) => return Ok((text, usage)),
            Some(StreamEvent::Failed(e)) => return Err(e),
            None => {
                return Err(ClientError::Transient(
                    "stream ended without usage report".into(),
                ))
            }
        }
    }
}
