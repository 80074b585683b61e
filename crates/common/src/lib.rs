//! LLMPerf common library
//!
//! This crate contains configuration, error and metrics code shared by the
//! engine and the rank binary.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::LlmPerfConfig;
pub use error::{LlmPerfError, Result};
pub use metrics::{MetricsRegistry, METRICS};
