//! Process identity and execution context
//!
//! A rank learns its place in the tensor-parallel group once, from the
//! environment, and carries it in an immutable [`RankContext`]. The model
//! handle and device binding travel together in an [`ExecutionContext`] that
//! is built at process start and handed to the engine.

use crate::executor::{Device, ModelExecutor};
use llmperf_common::{LlmPerfError, Result};
use std::fmt;
use std::sync::Arc;

/// Environment variable holding the number of ranks
pub const WORLD_SIZE_ENV: &str = "WORLD_SIZE";

/// Environment variable holding this process's rank
pub const LOCAL_RANK_ENV: &str = "LOCAL_RANK";

/// Rank index and group size, fixed for the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankContext {
    pub rank: usize,
    pub world_size: usize,
}

impl RankContext {
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(LlmPerfError::config("world size must be at least 1"));
        }
        if rank >= world_size {
            return Err(LlmPerfError::config(format!(
                "rank {} out of range for world size {}",
                rank, world_size
            )));
        }
        Ok(Self { rank, world_size })
    }

    /// A group of one
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// Read `WORLD_SIZE` (default 1) and `LOCAL_RANK` (default 0)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`RankContext::from_env`] with an explicit variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str, default: usize| -> Result<usize> {
            match lookup(key) {
                None => Ok(default),
                Some(value) => value
                    .trim()
                    .parse()
                    .map_err(|_| LlmPerfError::config(format!("Invalid {}: {}", key, value))),
            }
        };

        let world_size = parse(WORLD_SIZE_ENV, 1)?;
        let rank = parse(LOCAL_RANK_ENV, 0)?;
        Self::new(rank, world_size)
    }

    /// Rank 0 builds batches and distributes them
    pub fn is_leader(&self) -> bool {
        self.rank == 0
    }

    /// Whether any broadcast machinery is needed
    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }
}

impl fmt::Display for RankContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rank {}/{}", self.rank, self.world_size)
    }
}

/// Everything a rank needs to run the executor
#[derive(Clone)]
pub struct ExecutionContext {
    rank: RankContext,
    device: Device,
    executor: Arc<dyn ModelExecutor>,
}

impl ExecutionContext {
    pub fn new(rank: RankContext, device: Device, executor: Arc<dyn ModelExecutor>) -> Self {
        Self {
            rank,
            device,
            executor,
        }
    }

    pub fn rank(&self) -> &RankContext {
        &self.rank
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn executor(&self) -> &dyn ModelExecutor {
        self.executor.as_ref()
    }

    /// Bind this rank's device on the executor
    pub fn bind_device(&self) -> Result<()> {
        self.executor.set_device(self.device)
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("rank", &self.rank)
            .field("device", &self.device)
            .field("executor", &self.executor.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_to_single_rank() {
        let ctx = RankContext::from_lookup(lookup(&[])).unwrap();

        assert_eq!(ctx, RankContext::single());
        assert!(ctx.is_leader());
        assert!(!ctx.is_distributed());
    }

    #[test]
    fn test_reads_rank_and_world_size() {
        let ctx = RankContext::from_lookup(lookup(&[("WORLD_SIZE", "4"), ("LOCAL_RANK", "2")])).unwrap();

        assert_eq!(ctx.rank, 2);
        assert_eq!(ctx.world_size, 4);
        assert!(!ctx.is_leader());
        assert!(ctx.is_distributed());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(RankContext::from_lookup(lookup(&[("WORLD_SIZE", "two")])).is_err());
        assert!(RankContext::from_lookup(lookup(&[("WORLD_SIZE", "2"), ("LOCAL_RANK", "2")])).is_err());
        assert!(RankContext::new(0, 0).is_err());
    }
}
