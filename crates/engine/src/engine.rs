//! Per-rank inference engine
//!
//! Every rank owns one [`Engine`]. The leader turns packets into inputs and
//! distributes them; every rank then runs the same forward pass. A step ends
//! only once every follower has acknowledged it, and a failure on any rank
//! fails the step on the leader. Only the leader gets logits back, split into
//! the positions before the last one and the last position the sampler
//! consumes.

use crate::batch::{BatchBuilder, GenerateType, ModelInputs};
use crate::broadcast::{Broadcaster, TcpBroadcaster};
use crate::context::{ExecutionContext, RankContext};
use crate::executor::{ForwardInputs, ModelOutput};
use crate::packet::Packet;
use crate::tensor::Tensor;
use llmperf_common::config::DistributedConfig;
use llmperf_common::metrics::LatencyTimer;
use llmperf_common::{LlmPerfError, Result, METRICS};
use llmperf_proto::step_message::Kind;
use llmperf_proto::{Shutdown, StepMessage};
use prost::Message;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Leader-side logits of one step
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    /// `[batch, sequence - 1, vocabulary]`
    pub input_logits: Tensor<f32>,

    /// `[batch, vocabulary]`
    pub last_logits: Tensor<f32>,
}

pub struct Engine {
    context: ExecutionContext,
    builder: BatchBuilder,
    distributed: DistributedConfig,
    broadcaster: Option<Box<dyn Broadcaster>>,
    initialized: bool,
}

impl Engine {
    pub fn new(context: ExecutionContext, builder: BatchBuilder, distributed: DistributedConfig) -> Self {
        Self {
            context,
            builder,
            distributed,
            broadcaster: None,
            initialized: false,
        }
    }

    /// Use an already connected broadcaster instead of dialing TCP in `setup`
    pub fn with_broadcaster(mut self, broadcaster: Box<dyn Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn rank(&self) -> &RankContext {
        self.context.rank()
    }

    pub fn is_leader(&self) -> bool {
        self.context.rank().is_leader()
    }

    /// One-time initialization of the rank group
    pub async fn setup(&mut self) -> Result<()> {
        if self.initialized {
            return Err(LlmPerfError::internal("engine setup called twice"));
        }

        let rank = *self.context.rank();
        if rank.is_distributed() && self.broadcaster.is_none() {
            let broadcaster = TcpBroadcaster::connect(rank, &self.distributed).await?;
            self.broadcaster = Some(Box::new(broadcaster));
        }
        self.initialized = true;

        info!(
            %rank,
            device = %self.context.device(),
            executor = self.context.executor().name(),
            "engine ready"
        );
        Ok(())
    }

    /// Build this step's inputs; only the leader sees packets
    pub fn prepare_inputs(&self, packets: &[&Packet]) -> Result<ModelInputs> {
        if !self.is_leader() {
            return Err(LlmPerfError::internal("only the leader prepares inputs"));
        }
        self.builder.prepare(packets)
    }

    /// Make the leader's inputs available on every rank
    ///
    /// Single-rank groups get their inputs back untouched.
    pub async fn broadcast_inputs(&mut self, inputs: Option<ModelInputs>) -> Result<ModelInputs> {
        let rank = *self.context.rank();
        if !rank.is_distributed() {
            return inputs.ok_or_else(|| LlmPerfError::internal("no inputs to run"));
        }

        let broadcaster = self
            .broadcaster
            .as_mut()
            .ok_or_else(|| LlmPerfError::internal("engine is not set up"))?;
        let start = Instant::now();

        let inputs = if rank.is_leader() {
            let inputs = inputs.ok_or_else(|| LlmPerfError::internal("leader has no inputs to broadcast"))?;
            let message = StepMessage {
                kind: Some(Kind::Inputs(inputs.to_proto())),
            };
            broadcaster.broadcast(message.encode_to_vec()).await?;
            inputs
        } else {
            let payload = broadcaster.receive().await?;
            match StepMessage::decode(payload.as_slice())?.kind {
                Some(Kind::Inputs(batch)) => ModelInputs::from_proto(batch)?,
                Some(Kind::Shutdown(shutdown)) => {
                    info!(%rank, reason = %shutdown.reason, "leader closed the group");
                    return Err(LlmPerfError::GroupShutdown);
                }
                None => return Err(LlmPerfError::transport("step message without content")),
            }
        };

        METRICS
            .engine
            .broadcast_duration
            .observe(start.elapsed().as_secs_f64());
        Ok(inputs)
    }

    /// Run one step on this rank
    ///
    /// Followers ignore `packets` and return `None`.
    pub async fn do_inference(&mut self, packets: &[&Packet]) -> Result<Option<InferenceOutput>> {
        if !self.initialized {
            return Err(LlmPerfError::internal("engine is not set up"));
        }

        let local = if self.is_leader() {
            Some(self.prepare_inputs(packets)?)
        } else {
            None
        };
        let inputs = self.broadcast_inputs(local).await?;

        let outcome = self.execute(&inputs);
        let synced = self.synchronize(&outcome).await;
        let output = match (outcome, synced) {
            (_, Err(e)) if e.is_fatal() => return Err(e),
            (Err(e), _) | (Ok(_), Err(e)) => return Err(e),
            (Ok(output), Ok(())) => output,
        };

        if !self.is_leader() {
            return Ok(None);
        }

        let logits = output.logits;
        let seq = match logits.shape() {
            [batch, seq, _] if *batch == inputs.batch_size() && *seq > 0 => *seq,
            shape => {
                return Err(LlmPerfError::executor(format!(
                    "expected logits shaped [{}, seq, vocab], got {:?}",
                    inputs.batch_size(),
                    shape
                )))
            }
        };
        let input_logits = logits.narrow(1, 0, seq - 1)?;
        let last_logits = logits.select(1, seq - 1)?;

        debug!(
            generate_type = %inputs.generate_type,
            logits = ?logits.shape(),
            input_logits = ?input_logits.shape(),
            last_logits = ?last_logits.shape(),
            "forward complete"
        );

        Ok(Some(InferenceOutput {
            input_logits,
            last_logits,
        }))
    }

    /// Local forward pass; every failure is scoped to this step
    fn execute(&self, inputs: &ModelInputs) -> Result<ModelOutput> {
        let run = || -> Result<ModelOutput> {
            self.context.bind_device()?;
            let forward = ForwardInputs::from_model_inputs(inputs)?;

            match inputs.generate_type {
                GenerateType::Prefill => METRICS.engine.prefill_steps.inc(),
                GenerateType::Decode => METRICS.engine.decode_steps.inc(),
            }

            let executor = self.context.executor();
            METRICS.engine.forward_duration.time(|| executor.forward(&forward))
        };

        run().map_err(|e| match e {
            LlmPerfError::Executor(_) => e,
            other => LlmPerfError::executor(other.to_string()),
        })
    }

    /// Step barrier: followers report their outcome, the leader waits for all of them
    async fn synchronize(&mut self, outcome: &Result<ModelOutput>) -> Result<()> {
        let rank = *self.context.rank();
        if !rank.is_distributed() {
            return Ok(());
        }

        let broadcaster = self
            .broadcaster
            .as_mut()
            .ok_or_else(|| LlmPerfError::internal("engine is not set up"))?;

        if !rank.is_leader() {
            let error = outcome.as_ref().err().map(|e| e.to_string());
            return broadcaster.acknowledge(error).await;
        }

        let failures = broadcaster.gather_acks().await?;
        if !failures.is_empty() {
            warn!(step = broadcaster.step(), failures = ?failures, "followers failed the step");
            return Err(LlmPerfError::executor(failures.join("; ")));
        }
        Ok(())
    }

    /// Follower main loop: execute every step until the leader shuts down
    ///
    /// Returns the number of steps executed.
    pub async fn run_follower(&mut self) -> Result<u64> {
        if self.is_leader() {
            return Err(LlmPerfError::internal("the leader cannot run as a follower"));
        }

        let mut steps = 0u64;
        loop {
            match self.do_inference(&[]).await {
                Ok(_) => steps += 1,
                Err(LlmPerfError::GroupShutdown) => {
                    info!(rank = %self.rank(), steps, "follower stopped");
                    return Ok(steps);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    // Already reported to the leader, which fails the batch
                    warn!(rank = %self.rank(), error = %e, "follower step failed");
                    steps += 1;
                }
            }
        }
    }

    /// Tell every follower to leave its loop
    pub async fn shutdown_group(&mut self, reason: &str) -> Result<()> {
        if !self.rank().is_distributed() {
            return Ok(());
        }
        if !self.is_leader() {
            return Err(LlmPerfError::internal("only the leader can shut the group down"));
        }

        let broadcaster = self
            .broadcaster
            .as_mut()
            .ok_or_else(|| LlmPerfError::internal("engine is not set up"))?;
        let message = StepMessage {
            kind: Some(Kind::Shutdown(Shutdown {
                reason: reason.to_string(),
            })),
        };
        broadcaster.broadcast(message.encode_to_vec()).await?;
        info!(reason, "group shutdown broadcast");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ChannelBroadcaster;
    use crate::executor::{Device, ModelExecutor, SyntheticExecutor};
    use std::time::Duration;
    use tokio::time::timeout;
    use crate::packet::{GenerateConfig, GenerateRequest, GenerateResult, PacketHandle};
    use llmperf_common::config::ModelConfig;
    use std::path::PathBuf;
    use std::sync::Arc;

    struct FailingExecutor;

    impl ModelExecutor for FailingExecutor {
        fn name(&self) -> &str {
            "failing"
        }

        fn forward(&self, _inputs: &ForwardInputs) -> Result<ModelOutput> {
            Err(LlmPerfError::tensor("device out of memory"))
        }
    }

    fn model_config() -> ModelConfig {
        ModelConfig {
            model_name: Some("llama2".to_string()),
            model_path: Some(PathBuf::from("/models/llama2")),
            pad_token_id: Some(0),
            ..Default::default()
        }
    }

    fn engine(rank: RankContext, executor: Arc<dyn ModelExecutor>) -> Engine {
        let context = ExecutionContext::new(rank, Device::Cpu, executor);
        let builder = BatchBuilder::new(&model_config()).unwrap();
        Engine::new(context, builder, DistributedConfig::default())
    }

    fn synthetic() -> Arc<dyn ModelExecutor> {
        Arc::new(SyntheticExecutor::new("llama2", 16))
    }

    fn packet(prompt: Vec<u32>) -> (Packet, PacketHandle) {
        Packet::new(GenerateRequest::new(prompt, GenerateConfig::default()))
    }

    #[tokio::test]
    async fn test_single_rank_prefill_logits() {
        let mut engine = engine(RankContext::single(), synthetic());
        engine.setup().await.unwrap();
        let (p, _h) = packet(vec![5, 7, 9]);

        let output = engine.do_inference(&[&p]).await.unwrap().unwrap();

        assert_eq!(output.input_logits.shape(), &[1, 2, 16]);
        assert_eq!(output.last_logits.shape(), &[1, 16]);
        assert_eq!(output.last_logits.get(&[0, 10]), Some(1.0));
    }

    #[tokio::test]
    async fn test_decode_step_logits() {
        let mut engine = engine(RankContext::single(), synthetic());
        engine.setup().await.unwrap();
        let (mut p, _h) = packet(vec![3]);
        p.start().unwrap();
        p.add_result(GenerateResult::token(4)).unwrap();

        let output = engine.do_inference(&[&p]).await.unwrap().unwrap();

        // decode row [4, pad]
        assert_eq!(output.input_logits.shape(), &[1, 1, 16]);
        assert_eq!(output.last_logits.get(&[0, 5]), Some(1.0));
    }

    #[tokio::test]
    async fn test_setup_is_one_time() {
        let mut engine = engine(RankContext::single(), synthetic());
        let (p, _h) = packet(vec![1]);

        assert!(matches!(engine.do_inference(&[&p]).await, Err(LlmPerfError::Internal(_))));
        engine.setup().await.unwrap();
        assert!(matches!(engine.setup().await, Err(LlmPerfError::Internal(_))));
    }

    #[tokio::test]
    async fn test_single_rank_broadcast_is_identity() {
        let mut engine = engine(RankContext::single(), synthetic());
        engine.setup().await.unwrap();
        let (p, _h) = packet(vec![1, 2]);
        let inputs = engine.prepare_inputs(&[&p]).unwrap();

        assert_eq!(engine.broadcast_inputs(Some(inputs.clone())).await.unwrap(), inputs);
    }

    #[tokio::test]
    async fn test_executor_failure_is_executor_error() {
        let mut engine = engine(RankContext::single(), Arc::new(FailingExecutor));
        engine.setup().await.unwrap();
        let (p, _h) = packet(vec![1, 2]);

        let err = engine.do_inference(&[&p]).await.unwrap_err();
        assert!(matches!(err, LlmPerfError::Executor(_)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_empty_batch_on_leader() {
        let mut engine = engine(RankContext::single(), synthetic());
        engine.setup().await.unwrap();

        assert!(matches!(engine.do_inference(&[]).await, Err(LlmPerfError::EmptyBatch)));
    }

    #[tokio::test]
    async fn test_follower_cannot_prepare_inputs() {
        let mut group = ChannelBroadcaster::group(2, 1).unwrap();
        let follower = group.pop().unwrap();
        let engine = engine(RankContext::new(1, 2).unwrap(), synthetic()).with_broadcaster(Box::new(follower));
        let (p, _h) = packet(vec![1]);

        assert!(matches!(engine.prepare_inputs(&[&p]), Err(LlmPerfError::Internal(_))));
    }

    #[tokio::test]
    async fn test_two_ranks_follow_the_leader() {
        let mut group = ChannelBroadcaster::group(2, 4).unwrap();
        let follower_link = group.pop().unwrap();
        let leader_link = group.pop().unwrap();

        let mut follower =
            engine(RankContext::new(1, 2).unwrap(), synthetic()).with_broadcaster(Box::new(follower_link));
        follower.setup().await.unwrap();
        let follower_task = tokio::spawn(async move { follower.run_follower().await });

        let mut leader =
            engine(RankContext::new(0, 2).unwrap(), synthetic()).with_broadcaster(Box::new(leader_link));
        leader.setup().await.unwrap();

        let (p, _h) = packet(vec![1, 2, 3]);
        let output = leader.do_inference(&[&p]).await.unwrap().unwrap();
        assert_eq!(output.last_logits.shape(), &[1, 16]);
        leader.do_inference(&[&p]).await.unwrap();

        leader.shutdown_group("test complete").await.unwrap();
        assert_eq!(follower_task.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_leader_waits_for_silent_follower() {
        let mut group = ChannelBroadcaster::group(2, 4).unwrap();
        let _silent = group.pop().unwrap();
        let mut leader =
            engine(RankContext::new(0, 2).unwrap(), synthetic()).with_broadcaster(Box::new(group.pop().unwrap()));
        leader.setup().await.unwrap();
        let (p, _h) = packet(vec![1, 2, 3]);

        for _ in 0..4 {
            let step = timeout(Duration::from_millis(200), leader.do_inference(&[&p])).await;
            assert!(step.is_err());
        }
    }

    #[tokio::test]
    async fn test_follower_failure_fails_leader_step() {
        let mut group = ChannelBroadcaster::group(2, 4).unwrap();
        let follower_link = group.pop().unwrap();
        let leader_link = group.pop().unwrap();

        let mut follower = engine(RankContext::new(1, 2).unwrap(), Arc::new(FailingExecutor))
            .with_broadcaster(Box::new(follower_link));
        follower.setup().await.unwrap();
        let follower_task = tokio::spawn(async move { follower.run_follower().await });

        let mut leader =
            engine(RankContext::new(0, 2).unwrap(), synthetic()).with_broadcaster(Box::new(leader_link));
        leader.setup().await.unwrap();
        let (p, _h) = packet(vec![1, 2, 3]);

        let err = leader.do_inference(&[&p]).await.unwrap_err();
        assert!(matches!(&err, LlmPerfError::Executor(message) if message.contains("rank 1")));
        assert!(!err.is_fatal());

        leader.shutdown_group("test complete").await.unwrap();
        assert_eq!(follower_task.await.unwrap().unwrap(), 1);
    }
}
