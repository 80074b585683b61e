//! Configuration structures for LLMPerf
//!
//! This module defines all configuration types used by the rank processes.
//! Configurations are loaded from YAML files and can be overridden by environment variables.

use crate::error::{LlmPerfError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for an LLMPerf rank process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmPerfConfig {
    /// Model configuration, passed through to the executor
    pub model: ModelConfig,

    /// Hardware backend used to pick vendor executor overrides
    #[serde(default = "default_hardware_type")]
    pub hardware_type: String,

    /// Scheduling configuration (leader only)
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Rank group communication
    #[serde(default)]
    pub distributed: DistributedConfig,

    /// Benchmark workload driven by the leader
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workload: Option<WorkloadConfig>,

    /// Observability configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Model configuration
///
/// Only presence of the identifying keys is checked; everything else is
/// interpreted by the executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model family identifier (e.g., "llama2", "chatglm2")
    pub model_name: Option<String>,

    /// Location of the model weights
    pub model_path: Option<PathBuf>,

    /// Token used to right-pad batch rows
    pub pad_token_id: Option<u32>,

    /// Network hyper-parameters handed to the executor factory untouched
    #[serde(default)]
    pub network: serde_json::Map<String, serde_json::Value>,
}

/// Scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of live packets (and therefore rows per batch)
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Maximum number of submitted packets waiting for admission
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// How long the idle loop waits for a submission before re-checking
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,
}

/// Rank group communication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Address the leader listens on and followers connect to
    #[serde(default = "default_master_addr")]
    pub master_addr: String,

    /// Port of the leader's broadcast listener
    #[serde(default = "default_master_port")]
    pub master_port: u16,

    /// How long followers retry connecting and the leader waits for followers
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Synthetic benchmark workload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Number of requests submitted at start
    pub num_requests: usize,

    /// Prompt length in tokens
    pub prompt_len: usize,

    /// Tokens to generate per request
    pub max_new_tokens: usize,

    /// Token ids that end generation early
    #[serde(default)]
    pub stop_token_ids: Vec<u32>,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Dump Prometheus metrics to the log on exit
    #[serde(default)]
    pub dump_metrics: bool,
}

/// Default value functions
fn default_hardware_type() -> String {
    "CPU".to_string()
}

fn default_max_batch_size() -> usize {
    8
}

fn default_max_queue_size() -> usize {
    1024
}

fn default_idle_wait_ms() -> u64 {
    100
}

fn default_master_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_master_port() -> u16 {
    29500
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_queue_size: default_max_queue_size(),
            idle_wait_ms: default_idle_wait_ms(),
        }
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            master_addr: default_master_addr(),
            master_port: default_master_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ModelConfig {
    /// Model identifier, required for branch selection
    pub fn model_name(&self) -> Result<&str> {
        self.model_name
            .as_deref()
            .ok_or_else(|| LlmPerfError::config("model.model_name is required"))
    }

    /// Padding token, required by the batch builder
    pub fn pad_token_id(&self) -> Result<u32> {
        self.pad_token_id
            .ok_or_else(|| LlmPerfError::config("model.pad_token_id is required"))
    }

    /// Check that the keys every rank relies on are present
    pub fn validate(&self) -> Result<()> {
        self.model_name()?;
        if self.model_path.is_none() {
            return Err(LlmPerfError::config("model.model_path is required"));
        }
        Ok(())
    }
}

impl SchedulerConfig {
    /// Get idle wait as Duration
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }
}

impl DistributedConfig {
    /// Leader listener address as "host:port"
    pub fn master_endpoint(&self) -> String {
        format!("{}:{}", self.master_addr, self.master_port)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl LlmPerfConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| LlmPerfError::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

        Self::from_yaml(&content)
            .map_err(|e| LlmPerfError::Config(format!("Failed to load config file {}: {}", path.display(), e)))
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut config: LlmPerfConfig = serde_yaml::from_str(content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `LLMPERF_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("LLMPERF_MAX_BATCH_SIZE") {
            self.scheduler.max_batch_size = value
                .parse()
                .map_err(|_| LlmPerfError::config(format!("Invalid LLMPERF_MAX_BATCH_SIZE: {}", value)))?;
        }
        if let Ok(value) = std::env::var("LLMPERF_MASTER_ADDR") {
            self.distributed.master_addr = value;
        }
        if let Ok(value) = std::env::var("LLMPERF_MASTER_PORT") {
            self.distributed.master_port = value
                .parse()
                .map_err(|_| LlmPerfError::config(format!("Invalid LLMPERF_MASTER_PORT: {}", value)))?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;

        if self.scheduler.max_batch_size == 0 {
            return Err(LlmPerfError::config("scheduler.max_batch_size must be positive"));
        }

        if let Some(workload) = &self.workload {
            if workload.prompt_len == 0 || workload.max_new_tokens == 0 {
                return Err(LlmPerfError::config(
                    "workload.prompt_len and workload.max_new_tokens must be positive",
                ));
            }
        }
        Ok(())
    }
}
