//! Model executor boundary
//!
//! The forward pass itself lives outside this crate. An executor receives the
//! batch as `[batch, max_length]` tensors and returns logits shaped
//! `[batch, sequence, vocabulary]`. Executors are produced by factories held in
//! an [`ExecutorRegistry`], resolved once when the rank starts.

use crate::batch::{GenerateType, ModelInputs};
use crate::context::RankContext;
use crate::tensor::Tensor;
use llmperf_common::config::ModelConfig;
use llmperf_common::{LlmPerfError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Execution target a rank binds before running the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Accelerator(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Accelerator(ordinal) => write!(f, "accelerator:{}", ordinal),
        }
    }
}

/// Arguments of one forward call
#[derive(Debug, Clone)]
pub struct ForwardInputs {
    pub input_ids: Tensor<u32>,
    pub position_ids: Tensor<u32>,
    pub generate_type: GenerateType,
    pub return_last_logit: Option<bool>,

    // Reserved for the executor's own caching strategy, always unset here
    pub past_key_values: Option<Tensor<f32>>,
    pub attention_mask: Option<Tensor<u32>>,
    pub use_cache: Option<bool>,
}

impl ForwardInputs {
    /// Stack the padded rows into `[batch, max_length]` tensors
    pub fn from_model_inputs(inputs: &ModelInputs) -> Result<Self> {
        Ok(Self {
            input_ids: Tensor::from_rows(&inputs.input_ids)?,
            position_ids: Tensor::from_rows(&inputs.position_ids)?,
            generate_type: inputs.generate_type,
            return_last_logit: inputs.return_last_logit,
            past_key_values: None,
            attention_mask: None,
            use_cache: None,
        })
    }
}

/// Result of one forward call
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// `[batch, sequence, vocabulary]`
    pub logits: Tensor<f32>,
}

/// A model instance (or this rank's shard of one)
pub trait ModelExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// Bind the execution target; called before every forward pass
    fn set_device(&self, _device: Device) -> Result<()> {
        Ok(())
    }

    fn forward(&self, inputs: &ForwardInputs) -> Result<ModelOutput>;
}

/// Builds an executor for a model configuration on a given rank
pub type ExecutorFactory =
    Arc<dyn Fn(&ModelConfig, &RankContext) -> Result<Arc<dyn ModelExecutor>> + Send + Sync>;

/// Model families the built-in registry knows about
pub const KNOWN_MODELS: [&str; 4] = ["gpt2", "chatglm", "chatglm2", "llama2"];

/// Maps model families to executor factories
///
/// Vendor entries, keyed by hardware type, take precedence over the base
/// entry for the same family.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    base: HashMap<String, ExecutorFactory>,
    vendor: HashMap<(String, String), ExecutorFactory>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with [`SyntheticExecutor`] behind every known family
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for model in KNOWN_MODELS {
            registry.register(model, Arc::new(SyntheticExecutor::factory));
        }
        registry
    }

    pub fn register(&mut self, model_family: &str, factory: ExecutorFactory) -> &mut Self {
        self.base.insert(model_family.to_string(), factory);
        self
    }

    pub fn register_vendor(
        &mut self,
        hardware_type: &str,
        model_family: &str,
        factory: ExecutorFactory,
    ) -> &mut Self {
        self.vendor
            .insert((hardware_type.to_string(), model_family.to_string()), factory);
        self
    }

    /// Pick the factory for a model name such as `llama2-7b`
    ///
    /// The family is the part before the first `-`; an exact match on the full
    /// name wins over the family.
    pub fn resolve(&self, hardware_type: &str, model_name: &str) -> Result<ExecutorFactory> {
        let family = model_name.split('-').next().unwrap_or(model_name);
        let candidates = [model_name, family];

        for name in candidates {
            let key = (hardware_type.to_string(), name.to_string());
            if let Some(factory) = self.vendor.get(&key) {
                info!(model = name, hardware = hardware_type, "selected vendor executor");
                return Ok(factory.clone());
            }
        }
        for name in candidates {
            if let Some(factory) = self.base.get(name) {
                info!(model = name, hardware = hardware_type, "selected base executor");
                return Ok(factory.clone());
            }
        }

        Err(LlmPerfError::config(format!("Unknown model name: {}", model_name)))
    }

    /// Resolve and build the executor for this rank
    pub fn load(
        &self,
        hardware_type: &str,
        model_config: &ModelConfig,
        rank: &RankContext,
    ) -> Result<Arc<dyn ModelExecutor>> {
        let factory = self.resolve(hardware_type, model_config.model_name()?)?;
        let executor = factory(model_config, rank)?;
        info!(
            executor = executor.name(),
            path = ?model_config.model_path,
            rank = rank.rank,
            "model executor loaded"
        );
        Ok(executor)
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("base", &self.base.keys().collect::<Vec<_>>())
            .field("vendor", &self.vendor.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Deterministic stand-in executor for benchmarking the scheduling path
///
/// At every position of a row it puts all probability mass on one more than
/// the largest token id in that row (modulo the vocabulary).
#[derive(Debug, Clone)]
pub struct SyntheticExecutor {
    name: String,
    vocab_size: usize,
}

impl SyntheticExecutor {
    pub const DEFAULT_VOCAB_SIZE: usize = 32_000;

    pub fn new(name: impl Into<String>, vocab_size: usize) -> Self {
        Self {
            name: name.into(),
            vocab_size,
        }
    }

    /// Factory reading `network.vocab_size`
    pub fn factory(
        model_config: &ModelConfig,
        _rank: &RankContext,
    ) -> Result<Arc<dyn ModelExecutor>> {
        let vocab_size = match model_config.network.get("vocab_size") {
            None => Self::DEFAULT_VOCAB_SIZE,
            Some(value) => value
                .as_u64()
                .filter(|&v| v > 0)
                .ok_or_else(|| LlmPerfError::config("network.vocab_size must be a positive integer"))?
                as usize,
        };
        let name = model_config.model_name()?;
        Ok(Arc::new(SyntheticExecutor::new(name, vocab_size)))
    }
}

impl ModelExecutor for SyntheticExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, inputs: &ForwardInputs) -> Result<ModelOutput> {
        let shape = inputs.input_ids.shape();
        let (batch, seq) = match shape {
            [batch, seq] => (*batch, *seq),
            _ => return Err(LlmPerfError::executor(format!("expected 2-D input_ids, got {:?}", shape))),
        };

        let mut data = vec![0.0f32; batch * seq * self.vocab_size];
        for (b, row) in inputs.input_ids.data().chunks(seq.max(1)).enumerate() {
            let next = row.iter().max().map_or(0, |&m| (m as usize + 1) % self.vocab_size);
            for s in 0..seq {
                data[(b * seq + s) * self.vocab_size + next] = 1.0;
            }
        }

        Ok(ModelOutput {
            logits: Tensor::new(data, vec![batch, seq, self.vocab_size])?,
        })
    }
}
