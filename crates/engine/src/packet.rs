//! Per-request state and result delivery
//!
//! A [`Packet`] is owned by the scheduling loop and wraps one immutable
//! [`GenerateRequest`]. The code that submitted the request holds the matching
//! [`PacketHandle`] and reads results from it. The two halves share a lock-free
//! result queue: the loop is the only producer, the handle the only consumer.

use crossbeam::queue::SegQueue;
use futures::Stream;
use llmperf_common::{LlmPerfError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Vocabulary index
pub type TokenId = u32;

/// Generation parameters, interpreted by the sampler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateConfig {
    /// Upper bound on generated tokens
    pub max_new_tokens: usize,

    /// Tokens that end generation when sampled
    #[serde(default)]
    pub stop_token_ids: Vec<TokenId>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default)]
    pub top_k: usize,

    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    1.0
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 128,
            stop_token_ids: Vec::new(),
            temperature: default_temperature(),
            top_k: 0,
            top_p: default_top_p(),
        }
    }
}

/// A generation request as submitted by a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub input_ids: Vec<TokenId>,
    pub generate_config: GenerateConfig,
}

impl GenerateRequest {
    pub fn new(input_ids: Vec<TokenId>, generate_config: GenerateConfig) -> Self {
        Self {
            input_ids,
            generate_config,
        }
    }

    /// Reject requests that can never produce a batch row
    pub fn validate(&self) -> Result<()> {
        if self.input_ids.is_empty() {
            return Err(LlmPerfError::invalid_input("request has no input tokens"));
        }
        if self.generate_config.max_new_tokens == 0 {
            return Err(LlmPerfError::invalid_input("max_new_tokens must be positive"));
        }
        Ok(())
    }
}

/// Why the sampler ended a sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// A stop token was produced
    Stop,

    /// `max_new_tokens` was reached
    Length,
}

/// One produced token plus its per-step metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResult {
    pub token_id: TokenId,
    pub finish_reason: Option<FinishReason>,
}

impl GenerateResult {
    pub fn token(token_id: TokenId) -> Self {
        Self {
            token_id,
            finish_reason: None,
        }
    }

    pub fn last(token_id: TokenId, reason: FinishReason) -> Self {
        Self {
            token_id,
            finish_reason: Some(reason),
        }
    }
}

/// Item read from a packet's result queue
#[derive(Debug, Clone, PartialEq)]
pub enum PacketOutput {
    Token(GenerateResult),

    /// Terminal marker: generation completed
    Finished,

    /// Terminal marker: generation failed with the given message
    Failed(String),
}

impl PacketOutput {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PacketOutput::Token(_))
    }
}

/// Packet lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
    /// Queued, never selected into a batch
    Pending,

    /// Selected into at least one batch
    Running,

    /// Generation completed
    Finish,

    /// Generation failed
    Error,
}

impl PacketState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PacketState::Finish | PacketState::Error)
    }
}

/// Single-producer, single-consumer result queue
#[derive(Debug, Default)]
struct ResultQueue {
    items: SegQueue<PacketOutput>,
    notify: Notify,
    cancelled: AtomicBool,
}

impl ResultQueue {
    fn put(&self, item: PacketOutput) {
        self.items.push(item);
        // Stores a permit when the consumer is not parked yet
        self.notify.notify_one();
    }

    async fn take(&self) -> PacketOutput {
        loop {
            if let Some(item) = self.items.pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }
}

/// Scheduler-side state of one request
#[derive(Debug)]
pub struct Packet {
    id: Uuid,
    request: GenerateRequest,
    state: PacketState,
    generate_ids: Vec<TokenId>,
    error: Option<String>,
    queue: Arc<ResultQueue>,
    arrival_time: Instant,
    first_token_time: Option<Instant>,
}

impl Packet {
    /// Create a pending packet and the handle its caller reads results from
    pub fn new(request: GenerateRequest) -> (Packet, PacketHandle) {
        let id = Uuid::new_v4();
        let queue = Arc::new(ResultQueue::default());

        let packet = Packet {
            id,
            request,
            state: PacketState::Pending,
            generate_ids: Vec::new(),
            error: None,
            queue: queue.clone(),
            arrival_time: Instant::now(),
            first_token_time: None,
        };
        let handle = PacketHandle {
            id,
            queue,
            terminal: None,
        };

        (packet, handle)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> &GenerateRequest {
        &self.request
    }

    pub fn state(&self) -> PacketState {
        self.state
    }

    pub fn generate_ids(&self) -> &[TokenId] {
        &self.generate_ids
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Prompt plus generated tokens
    pub fn seq_len(&self) -> usize {
        self.request.input_ids.len() + self.generate_ids.len()
    }

    /// Most recently generated token
    pub fn last_token(&self) -> Option<TokenId> {
        self.generate_ids.last().copied()
    }

    /// Submission to first generated token
    pub fn time_to_first_token(&self) -> Option<Duration> {
        self.first_token_time
            .map(|t| t.duration_since(self.arrival_time))
    }

    /// Mark the packet as selected into a batch
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            PacketState::Pending => {
                self.state = PacketState::Running;
                trace!(packet = %self.id, "packet running");
                Ok(())
            }
            PacketState::Running => Ok(()),
            state => Err(LlmPerfError::invalid_state(format!(
                "packet {} cannot run from {:?}",
                self.id, state
            ))),
        }
    }

    /// Append a produced token and deliver it to the caller
    pub fn add_result(&mut self, result: GenerateResult) -> Result<()> {
        if self.state.is_terminal() {
            return Err(LlmPerfError::invalid_state(format!(
                "packet {} already ended in {:?}",
                self.id, self.state
            )));
        }

        if self.generate_ids.is_empty() {
            self.first_token_time = Some(Instant::now());
        }
        self.generate_ids.push(result.token_id);
        self.queue.put(PacketOutput::Token(result));
        Ok(())
    }

    /// Move to FINISH and push the terminal marker
    ///
    /// Returns `false` if the packet had already ended.
    pub fn finish(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = PacketState::Finish;
        self.queue.put(PacketOutput::Finished);
        debug!(packet = %self.id, tokens = self.generate_ids.len(), "packet finished");
        true
    }

    /// Move to ERROR, record the cause and push the error marker
    ///
    /// Returns `false` if the packet had already ended.
    pub fn error(&mut self, message: impl Into<String>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        let message = message.into();
        warn!(packet = %self.id, error = %message, "packet failed");
        self.state = PacketState::Error;
        self.queue.put(PacketOutput::Failed(message.clone()));
        self.error = Some(message);
        true
    }

    pub fn is_finished(&self) -> bool {
        self.state == PacketState::Finish
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the caller asked to stop this request
    pub fn is_cancelled(&self) -> bool {
        self.queue.cancelled.load(Ordering::Acquire)
    }

    /// Whether the caller has drained every delivered item
    pub fn return_queue_empty(&self) -> bool {
        self.queue.items.is_empty()
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        // A caller must never wait on a packet nobody will finish
        if !self.state.is_terminal() {
            self.queue
                .put(PacketOutput::Failed("packet dropped before completion".to_string()));
        }
    }
}

/// Caller-side half of a packet
#[derive(Debug)]
pub struct PacketHandle {
    id: Uuid,
    queue: Arc<ResultQueue>,
    terminal: Option<PacketOutput>,
}

impl PacketHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the next result or terminal marker
    ///
    /// Once the terminal marker has been read, every further call returns it
    /// again immediately.
    pub async fn get_result(&mut self) -> PacketOutput {
        if let Some(marker) = &self.terminal {
            return marker.clone();
        }

        let item = self.queue.take().await;
        if item.is_terminal() {
            self.terminal = Some(item.clone());
        }
        item
    }

    /// Whether the terminal marker has been consumed
    pub fn is_finished(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn return_queue_empty(&self) -> bool {
        self.queue.items.is_empty()
    }

    /// Ask the scheduler to drop this request at its next step
    pub fn cancel(&self) {
        self.queue.cancelled.store(true, Ordering::Release);
    }

    /// Results as a stream that ends after the terminal marker
    pub fn into_stream(self) -> impl Stream<Item = PacketOutput> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut handle = state?;
            let item = handle.get_result().await;
            let next = if item.is_terminal() { None } else { Some(handle) };
            Some((item, next))
        })
    }

    /// Drain all tokens, failing with the packet's error message
    pub async fn collect_tokens(mut self) -> std::result::Result<Vec<TokenId>, String> {
        let mut tokens = Vec::new();
        loop {
            match self.get_result().await {
                PacketOutput::Token(result) => tokens.push(result.token_id),
                PacketOutput::Finished => return Ok(tokens),
                PacketOutput::Failed(message) => return Err(message),
            }
        }
    }
}
