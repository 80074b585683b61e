//! LLMPerf Engine
//!
//! Continuous-batching generation loop for a tensor-parallel rank group.
//! The leader rank schedules packets and samples tokens; every rank runs the
//! same forward pass in lock-step on inputs the leader broadcasts.

pub mod batch;
pub mod broadcast;
pub mod context;
pub mod engine;
pub mod executor;
pub mod packet;
pub mod sampler;
pub mod scheduler;
pub mod tensor;

pub use batch::{BatchBuilder, GenerateType, ModelInputs};
pub use broadcast::{Broadcaster, ChannelBroadcaster, TcpBroadcaster};
pub use context::{ExecutionContext, RankContext};
pub use engine::{Engine, InferenceOutput};
pub use executor::{Device, ExecutorRegistry, ModelExecutor, SyntheticExecutor};
pub use packet::{
    FinishReason, GenerateConfig, GenerateRequest, GenerateResult, Packet, PacketHandle, PacketOutput,
    PacketState, TokenId,
};
pub use sampler::{GreedySampler, Sampler};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use tensor::Tensor;
