//! Common error types for LLMPerf
//!
//! This module defines all error types used across the LLMPerf system.
//! Errors are split by the granularity at which the scheduler handles them:
//! per-packet errors only fail the offending request, batch and process level
//! errors fail every packet that took part in the step.

use thiserror::Error;

/// Main error type for LLMPerf
#[derive(Error, Debug)]
pub enum LlmPerfError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Batch preparation was invoked without any packets
    #[error("Empty batch: no packets selected for this step")]
    EmptyBatch,

    /// Prefill and decode rows were selected into the same batch
    #[error("Mixed batch: {prefill} prefill and {decode} decode rows in one step")]
    MixedBatch { prefill: usize, decode: usize },

    /// Broadcast or receive failure between ranks
    #[error("Transport error: {0}")]
    Transport(String),

    /// The leader rank ended the rank group
    #[error("Rank group shut down by leader")]
    GroupShutdown,

    /// The model executor failed during the forward pass
    #[error("Executor error: {0}")]
    Executor(String),

    /// Malformed request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not allowed in the packet's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Queue full (backpressure)
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Tensor shape errors
    #[error("Tensor error: {0}")]
    Tensor(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Wire message decode errors
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_yaml::Error> for LlmPerfError {
    fn from(err: serde_yaml::Error) -> Self {
        LlmPerfError::Config(err.to_string())
    }
}

impl LlmPerfError {
    /// Whether the error must take down the whole process rather than a batch
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LlmPerfError::Transport(_) | LlmPerfError::GroupShutdown | LlmPerfError::Decode(_)
        )
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        LlmPerfError::Config(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        LlmPerfError::Transport(msg.into())
    }

    /// Create an executor error
    pub fn executor(msg: impl Into<String>) -> Self {
        LlmPerfError::Executor(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        LlmPerfError::InvalidInput(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        LlmPerfError::InvalidState(msg.into())
    }

    /// Create a queue full error
    pub fn queue_full(msg: impl Into<String>) -> Self {
        LlmPerfError::QueueFull(msg.into())
    }

    /// Create a tensor error
    pub fn tensor(msg: impl Into<String>) -> Self {
        LlmPerfError::Tensor(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        LlmPerfError::Internal(msg.into())
    }
}

/// Result type alias for LLMPerf operations
pub type Result<T> = std::result::Result<T, LlmPerfError>;
