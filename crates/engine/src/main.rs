//! LLMPerf Rank - Main Entry Point
//!
//! Starts one rank of the group. Rank 0 runs the scheduler over the configured
//! synthetic workload; every other rank follows the leader's steps.

use anyhow::Context;
use llmperf_common::config::WorkloadConfig;
use llmperf_common::{LlmPerfConfig, METRICS};
use llmperf_engine::{
    BatchBuilder, Device, Engine, ExecutionContext, ExecutorRegistry, GenerateConfig, GenerateRequest,
    GreedySampler, RankContext, Scheduler, SchedulerHandle,
};
use std::time::Instant;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::var("LLMPERF_CONFIG").unwrap_or_else(|_| "configs/llmperf.yaml".to_string());
    let config = LlmPerfConfig::from_file(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path))?;

    // Initialize logging
    let default_filter = config
        .observability
        .as_ref()
        .map(|o| format!("llmperf_engine={}", o.log_level))
        .unwrap_or_else(|| "llmperf_engine=info".to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rank = RankContext::from_env()?;
    info!(%rank, config = %config_path, "starting LLMPerf rank");

    let registry = ExecutorRegistry::with_defaults();
    let executor = registry.load(&config.hardware_type, &config.model, &rank)?;
    let device = if config.hardware_type.eq_ignore_ascii_case("CPU") {
        Device::Cpu
    } else {
        Device::Accelerator(rank.rank)
    };

    let context = ExecutionContext::new(rank, device, executor);
    let builder = BatchBuilder::new(&config.model)?;
    let mut engine = Engine::new(context, builder, config.distributed.clone());
    engine.setup().await?;

    if !rank.is_leader() {
        let steps = engine.run_follower().await?;
        info!(steps, "follower finished");
        return Ok(());
    }

    let (scheduler, handle) = Scheduler::new(engine, Box::new(GreedySampler::new()), &config.scheduler)?;
    let scheduler_task = tokio::spawn(scheduler.run());

    let workload = config.workload.clone().unwrap_or(WorkloadConfig {
        num_requests: 16,
        prompt_len: 32,
        max_new_tokens: 32,
        stop_token_ids: Vec::new(),
    });

    drive_leader(&handle, scheduler_task, &workload).await?;

    if config.observability.as_ref().is_some_and(|o| o.dump_metrics) {
        info!("metrics:\n{}", METRICS.gather());
    }

    info!("LLMPerf rank shutdown complete");
    Ok(())
}

/// Run the workload, then stop the scheduler whatever the outcome
async fn drive_leader(
    handle: &SchedulerHandle,
    scheduler_task: JoinHandle<llmperf_common::Result<u64>>,
    workload: &WorkloadConfig,
) -> anyhow::Result<()> {
    let outcome = tokio::select! {
        _ = signal::ctrl_c() => {
            warn!("Received shutdown signal");
            Ok(())
        }
        result = run_workload(handle, workload) => result,
    };
    if let Err(e) = &outcome {
        error!(error = %e, "workload failed");
    }

    // Always release the scheduler and the followers
    handle.shutdown();
    match scheduler_task.await? {
        Ok(steps) => info!(steps, "scheduler finished"),
        Err(e) => {
            error!(error = %e, "scheduler failed");
            return Err(e.into());
        }
    }
    outcome
}

/// Submit the synthetic workload and wait for every request
async fn run_workload(handle: &SchedulerHandle, workload: &WorkloadConfig) -> anyhow::Result<()> {
    let start = Instant::now();
    let generate_config = GenerateConfig {
        max_new_tokens: workload.max_new_tokens,
        stop_token_ids: workload.stop_token_ids.clone(),
        ..Default::default()
    };

    let mut pending = Vec::with_capacity(workload.num_requests);
    for i in 0..workload.num_requests {
        let prompt = (0..workload.prompt_len as u32).map(|t| t + i as u32 + 1).collect();
        pending.push(handle.submit(GenerateRequest::new(prompt, generate_config.clone()))?);
    }
    info!(requests = pending.len(), "workload submitted");

    let mut tokens = 0usize;
    let mut failed = 0usize;
    for packet in pending {
        let id = packet.id();
        match packet.collect_tokens().await {
            Ok(generated) => tokens += generated.len(),
            Err(message) => {
                warn!(packet = %id, error = %message, "request failed");
                failed += 1;
            }
        }
    }

    let elapsed = start.elapsed();
    info!(
        requests = workload.num_requests,
        failed,
        tokens,
        elapsed_ms = elapsed.as_millis() as u64,
        tokens_per_second = tokens as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        "workload complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmperf_common::config::{DistributedConfig, ModelConfig, SchedulerConfig};
    use llmperf_engine::SyntheticExecutor;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn start_scheduler(max_queue_size: usize) -> (SchedulerHandle, JoinHandle<llmperf_common::Result<u64>>) {
        let model = ModelConfig {
            model_name: Some("llama2".to_string()),
            model_path: Some(PathBuf::from("/models/llama2")),
            pad_token_id: Some(0),
            ..Default::default()
        };
        let context = ExecutionContext::new(
            RankContext::single(),
            Device::Cpu,
            Arc::new(SyntheticExecutor::new("llama2", 64)),
        );
        let mut engine = Engine::new(context, BatchBuilder::new(&model).unwrap(), DistributedConfig::default());
        engine.setup().await.unwrap();

        let config = SchedulerConfig {
            max_batch_size: 4,
            max_queue_size,
            idle_wait_ms: 10,
        };
        let (scheduler, handle) = Scheduler::new(engine, Box::new(GreedySampler::new()), &config).unwrap();
        (handle, tokio::spawn(scheduler.run()))
    }

    fn workload(num_requests: usize) -> WorkloadConfig {
        WorkloadConfig {
            num_requests,
            prompt_len: 4,
            max_new_tokens: 2,
            stop_token_ids: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_workload_completes_and_scheduler_stops() {
        let (handle, task) = start_scheduler(16).await;

        timeout(Duration::from_secs(5), drive_leader(&handle, task, &workload(3)))
            .await
            .unwrap()
            .unwrap();
        assert!(handle.submit(GenerateRequest::new(vec![1], GenerateConfig::default())).is_err());
    }

    #[tokio::test]
    async fn test_failed_workload_still_stops_scheduler() {
        // the scheduler task cannot admit between submits, so the queue overflows
        let (handle, task) = start_scheduler(1).await;

        let result = timeout(Duration::from_secs(5), drive_leader(&handle, task, &workload(3)))
            .await
            .unwrap();
        assert!(result.is_err());
        assert!(handle.submit(GenerateRequest::new(vec![1], GenerateConfig::default())).is_err());
    }
}
