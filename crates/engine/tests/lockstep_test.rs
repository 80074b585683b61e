//! Multi-rank lock-step tests
//!
//! A leader scheduler drives follower engines over both transports; every
//! rank must see exactly the inputs the leader built, step for step.

use llmperf_common::config::{DistributedConfig, ModelConfig, SchedulerConfig};
use llmperf_common::Result;
use llmperf_engine::executor::{ForwardInputs, ModelOutput};
use llmperf_engine::{
    BatchBuilder, Broadcaster, ChannelBroadcaster, Device, Engine, ExecutionContext, GenerateConfig,
    GenerateRequest, GreedySampler, ModelExecutor, RankContext, Scheduler, SyntheticExecutor,
    TcpBroadcaster,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

type Steps = Arc<Mutex<Vec<(Vec<usize>, Vec<u32>, Vec<u32>)>>>;

/// Synthetic executor that remembers every input it was given
struct RecordingExecutor {
    inner: SyntheticExecutor,
    steps: Steps,
}

impl RecordingExecutor {
    fn new() -> (Arc<dyn ModelExecutor>, Steps) {
        let steps: Steps = Arc::default();
        let executor = RecordingExecutor {
            inner: SyntheticExecutor::new("llama2", 128),
            steps: steps.clone(),
        };
        (Arc::new(executor), steps)
    }
}

impl ModelExecutor for RecordingExecutor {
    fn name(&self) -> &str {
        "recording"
    }

    fn forward(&self, inputs: &ForwardInputs) -> Result<ModelOutput> {
        self.steps.lock().unwrap().push((
            inputs.input_ids.shape().to_vec(),
            inputs.input_ids.data().to_vec(),
            inputs.position_ids.data().to_vec(),
        ));
        self.inner.forward(inputs)
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

async fn rank_engine(rank: RankContext, broadcaster: Box<dyn Broadcaster>) -> (Engine, Steps) {
    let (executor, steps) = RecordingExecutor::new();
    let context = ExecutionContext::new(rank, Device::Accelerator(rank.rank), executor);
    let builder = BatchBuilder::new(&model_config()).unwrap();
    let mut engine = Engine::new(context, builder, DistributedConfig::default()).with_broadcaster(broadcaster);
    engine.setup().await.unwrap();
    (engine, steps)
}

/// Run a small workload on the leader while followers mirror it
async fn drive_group(mut engines: Vec<(Engine, Steps)>) -> Vec<Steps> {
    let (leader, leader_steps) = engines.remove(0);
    let mut recorded = vec![leader_steps];

    let mut followers = Vec::new();
    for (mut engine, steps) in engines {
        recorded.push(steps);
        followers.push(tokio::spawn(async move { engine.run_follower().await }));
    }

    let config = SchedulerConfig {
        max_batch_size: 2,
        max_queue_size: 16,
        idle_wait_ms: 10,
    };
    let (scheduler, handle) = Scheduler::new(leader, Box::new(GreedySampler::new()), &config).unwrap();
    let scheduler_task = tokio::spawn(scheduler.run());

    let prompts = [vec![3, 1, 4], vec![1, 5], vec![9, 2, 6, 5], vec![3]];
    let mut handles = Vec::new();
    for prompt in prompts {
        let generate_config = GenerateConfig {
            max_new_tokens: 3,
            ..Default::default()
        };
        handles.push(handle.submit(GenerateRequest::new(prompt, generate_config)).unwrap());
    }
    for packet in handles {
        let tokens = timeout(WAIT, packet.collect_tokens()).await.unwrap().unwrap();
        assert_eq!(tokens.len(), 3);
    }

    handle.shutdown();
    let leader_steps = timeout(WAIT, scheduler_task).await.unwrap().unwrap().unwrap();
    for follower in followers {
        let follower_steps = timeout(WAIT, follower).await.unwrap().unwrap().unwrap();
        assert_eq!(follower_steps, leader_steps);
    }

    recorded
}

fn assert_lockstep(recorded: &[Steps]) {
    let leader = recorded[0].lock().unwrap();
    assert!(!leader.is_empty());
    for follower in &recorded[1..] {
        assert_eq!(*follower.lock().unwrap(), *leader);
    }
}

#[tokio::test]
async fn test_channel_group_runs_in_lockstep() {
    let world_size = 3;
    let links = ChannelBroadcaster::group(world_size, 4).unwrap();

    let mut engines = Vec::new();
    for (rank, link) in links.into_iter().enumerate() {
        let rank = RankContext::new(rank, world_size).unwrap();
        engines.push(rank_engine(rank, Box::new(link)).await);
    }

    let recorded = drive_group(engines).await;
    assert_lockstep(&recorded);
}

#[tokio::test]
async fn test_tcp_group_runs_in_lockstep() {
    let world_size = 3;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();

    let leader_link = tokio::spawn(async move {
        TcpBroadcaster::accept(RankContext::new(0, world_size).unwrap(), listener, WAIT).await
    });
    let mut follower_links = Vec::new();
    for rank in 1..world_size {
        let rank = RankContext::new(rank, world_size).unwrap();
        follower_links.push((rank, TcpBroadcaster::join(rank, &endpoint, WAIT).await.unwrap()));
    }
    let leader_link = leader_link.await.unwrap().unwrap();

    let mut engines = vec![rank_engine(RankContext::new(0, world_size).unwrap(), Box::new(leader_link)).await];
    for (rank, link) in follower_links {
        engines.push(rank_engine(rank, Box::new(link)).await);
    }

    let recorded = drive_group(engines).await;
    assert_lockstep(&recorded);
}

#[tokio::test]
async fn test_single_rank_needs_no_broadcaster() {
    let (executor, steps) = RecordingExecutor::new();
    let context = ExecutionContext::new(RankContext::single(), Device::Cpu, executor);
    let builder = BatchBuilder::new(&model_config()).unwrap();
    let mut engine = Engine::new(context, builder, DistributedConfig::default());
    engine.setup().await.unwrap();

    let config = SchedulerConfig {
        max_batch_size: 4,
        max_queue_size: 4,
        idle_wait_ms: 10,
    };
    let (scheduler, handle) = Scheduler::new(engine, Box::new(GreedySampler::new()), &config).unwrap();
    let task = tokio::spawn(scheduler.run());

    let packet = handle
        .submit(GenerateRequest::new(vec![5, 7, 9], GenerateConfig {
            max_new_tokens: 2,
            ..Default::default()
        }))
        .unwrap();
    assert_eq!(timeout(WAIT, packet.collect_tokens()).await.unwrap(), Ok(vec![10, 11]));

    handle.shutdown();
    assert_eq!(timeout(WAIT, task).await.unwrap().unwrap().unwrap(), 2);

    let steps = steps.lock().unwrap();
    assert_eq!(steps[0], (vec![1, 3], vec![5, 7, 9], vec![0, 1, 2]));
    assert_eq!(steps[1], (vec![1, 4], vec![10, 0, 0, 0], vec![3, 0, 0, 0]));
}
