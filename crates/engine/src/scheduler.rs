//! Continuous-batching scheduler
//!
//! Callers submit requests through a [`SchedulerHandle`] into a lock-free
//! arrival queue. The scheduling loop admits them FIFO into a live set of at
//! most `max_batch_size` packets and, step by step, drives the engine and
//! feeds sampled tokens back into each packet.
//!
//! Each step is homogeneous: it either prefills every newly admitted packet
//! or decodes every running one. Running packets come first, so a step that
//! prefilled is always followed by a decode when anything is running, and
//! arrivals wait at most one decode step for their prefill.

use crate::batch::GenerateType;
use crate::engine::Engine;
use crate::packet::{GenerateRequest, GenerateResult, Packet, PacketHandle, PacketState};
use crate::sampler::Sampler;
use crossbeam::queue::SegQueue;
use llmperf_common::config::SchedulerConfig;
use llmperf_common::{LlmPerfError, Result, METRICS};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

const SHUTDOWN_MESSAGE: &str = "scheduler shut down";

/// State shared between the loop and every submitter
struct Shared {
    /// Submitted, not yet admitted
    arrivals: SegQueue<Packet>,

    /// Current arrival queue depth
    queue_depth: AtomicUsize,

    max_queue_size: usize,
    shutdown: AtomicBool,
    notify: Notify,
}

impl Shared {
    fn pop_arrival(&self) -> Option<Packet> {
        let packet = self.arrivals.pop()?;
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
        METRICS.scheduler.pending_packets.dec();
        Some(packet)
    }

    /// Fail everything still waiting for admission
    fn drain_arrivals(&self, reason: &str) {
        while let Some(mut packet) = self.pop_arrival() {
            if packet.error(reason) {
                METRICS.scheduler.requests_failed.inc();
            }
        }
    }
}

/// Cloneable submission side of a [`Scheduler`]
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Queue a request and return the handle its results arrive on
    ///
    /// Fails with `QueueFull` when `max_queue_size` requests are already
    /// waiting for admission.
    pub fn submit(&self, request: GenerateRequest) -> Result<PacketHandle> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(LlmPerfError::invalid_state(SHUTDOWN_MESSAGE));
        }
        if self.shared.queue_depth.load(Ordering::Relaxed) >= self.shared.max_queue_size {
            return Err(LlmPerfError::queue_full(format!(
                "{} requests already waiting",
                self.shared.max_queue_size
            )));
        }

        let (packet, handle) = Packet::new(request);
        self.shared.arrivals.push(packet);
        self.shared.queue_depth.fetch_add(1, Ordering::Relaxed);
        METRICS.scheduler.requests_total.inc();
        METRICS.scheduler.pending_packets.inc();
        self.shared.notify.notify_one();

        // Lost the race with a loop that already exited
        if self.shared.shutdown.load(Ordering::Acquire) {
            self.shared.drain_arrivals(SHUTDOWN_MESSAGE);
        }

        trace!(
            packet = %handle.id(),
            depth = self.shared.queue_depth.load(Ordering::Relaxed),
            "request submitted"
        );
        Ok(handle)
    }

    /// Requests waiting for admission
    pub fn queue_depth(&self) -> usize {
        self.shared.queue_depth.load(Ordering::Relaxed)
    }

    /// Stop the scheduling loop after its current step
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        // notify_one keeps a permit if the loop is between checks
        self.shared.notify.notify_one();
    }
}

/// Leader-side scheduling loop
pub struct Scheduler {
    engine: Engine,
    sampler: Box<dyn Sampler>,
    max_batch_size: usize,
    idle_wait: Duration,
    live: Vec<Packet>,
    last_step: Option<GenerateType>,
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Wrap a set-up leader engine
    pub fn new(
        engine: Engine,
        sampler: Box<dyn Sampler>,
        config: &SchedulerConfig,
    ) -> Result<(Scheduler, SchedulerHandle)> {
        if !engine.is_leader() {
            return Err(LlmPerfError::config("the scheduler runs on the leader rank only"));
        }
        if config.max_batch_size == 0 {
            return Err(LlmPerfError::config("max_batch_size must be positive"));
        }

        let shared = Arc::new(Shared {
            arrivals: SegQueue::new(),
            queue_depth: AtomicUsize::new(0),
            max_queue_size: config.max_queue_size,
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        });
        let scheduler = Scheduler {
            engine,
            sampler,
            max_batch_size: config.max_batch_size,
            idle_wait: config.idle_wait(),
            live: Vec::with_capacity(config.max_batch_size),
            last_step: None,
            shared: shared.clone(),
        };

        Ok((scheduler, SchedulerHandle { shared }))
    }

    /// Run until shutdown or a transport failure
    ///
    /// Returns the number of steps executed. On a clean shutdown the
    /// follower ranks are released as well.
    pub async fn run(mut self) -> Result<u64> {
        info!(max_batch_size = self.max_batch_size, "scheduler started");
        let mut steps = 0u64;

        while !self.shared.shutdown.load(Ordering::Acquire) {
            self.admit();
            if self.live.is_empty() {
                let _ = timeout(self.idle_wait, self.shared.notify.notified()).await;
                continue;
            }

            match self.step().await {
                Ok(true) => steps += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(error = %e, live = self.live.len(), "fatal step error, stopping scheduler");
                    self.stop(&e.to_string());
                    return Err(e);
                }
            }
            // Single-rank steps never suspend; let submitters run
            tokio::task::yield_now().await;
        }

        info!(steps, "scheduler stopping");
        self.stop(SHUTDOWN_MESSAGE);
        self.engine.shutdown_group(SHUTDOWN_MESSAGE).await?;
        Ok(steps)
    }

    /// Move arrivals into the live set while there is room
    fn admit(&mut self) {
        while self.live.len() < self.max_batch_size {
            let Some(mut packet) = self.shared.pop_arrival() else {
                break;
            };

            if let Err(e) = packet.request().validate() {
                packet.error(e.to_string());
                METRICS.scheduler.requests_failed.inc();
                continue;
            }
            debug!(packet = %packet.id(), prompt = packet.seq_len(), "packet admitted");
            self.live.push(packet);
        }
        METRICS.scheduler.active_packets.set(self.live.len() as i64);
    }

    /// Execute one batch; `Ok(false)` means nothing was runnable
    ///
    /// Only fatal errors are returned, everything else is routed to the
    /// packets of the batch.
    async fn step(&mut self) -> Result<bool> {
        for packet in self.live.iter_mut().filter(|p| p.is_cancelled()) {
            if packet.error("cancelled") {
                METRICS.scheduler.requests_failed.inc();
            }
        }

        let Some(wanted) = self.next_phase() else {
            self.evict();
            return Ok(false);
        };
        let selected: Vec<usize> = (0..self.live.len())
            .filter(|&i| self.live[i].state() == wanted)
            .collect();

        if selected.is_empty() {
            self.evict();
            return Ok(false);
        }
        for &i in &selected {
            self.live[i].start()?;
        }
        self.last_step = Some(match wanted {
            PacketState::Pending => GenerateType::Prefill,
            _ => GenerateType::Decode,
        });
        METRICS.scheduler.batch_size.observe(selected.len() as f64);

        let batch: Vec<&Packet> = selected.iter().map(|&i| &self.live[i]).collect();
        let outcome = match self.engine.do_inference(&batch).await {
            Ok(Some(output)) => self.sampler.sample(&output.last_logits, &batch),
            Ok(None) => Err(LlmPerfError::internal("leader produced no logits")),
            Err(e) => Err(e),
        };
        drop(batch);

        match outcome {
            Ok(results) if results.len() == selected.len() => {
                for (&i, result) in selected.iter().zip(results) {
                    self.deliver(i, result);
                }
            }
            Ok(results) => {
                let message = format!("sampler returned {} results for {} packets", results.len(), selected.len());
                self.fail(&selected, &message);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, batch = selected.len(), "step failed");
                self.fail(&selected, &e.to_string());
            }
        }

        self.evict();
        Ok(true)
    }

    /// State of the packets the next step runs
    ///
    /// Decodes unless the previous step already decoded and prefills are waiting.
    fn next_phase(&self) -> Option<PacketState> {
        let pending = self.live.iter().any(|p| p.state() == PacketState::Pending);
        let running = self.live.iter().any(|p| p.state() == PacketState::Running);

        match (pending, running) {
            (true, true) if self.last_step == Some(GenerateType::Decode) => Some(PacketState::Pending),
            (_, true) => Some(PacketState::Running),
            (true, false) => Some(PacketState::Pending),
            (false, false) => None,
        }
    }

    fn deliver(&mut self, index: usize, result: GenerateResult) {
        let packet = &mut self.live[index];
        let first = packet.generate_ids().is_empty();
        let done = result.finish_reason.is_some();

        if let Err(e) = packet.add_result(result) {
            packet.error(e.to_string());
            METRICS.scheduler.requests_failed.inc();
            return;
        }
        METRICS.scheduler.tokens_generated_total.inc();
        if first {
            if let Some(ttft) = packet.time_to_first_token() {
                METRICS.scheduler.time_to_first_token.observe(ttft.as_secs_f64());
            }
        }
        if done && packet.finish() {
            METRICS.scheduler.requests_finished.inc();
        }
    }

    fn fail(&mut self, indices: &[usize], message: &str) {
        for &i in indices {
            if self.live[i].error(message) {
                METRICS.scheduler.requests_failed.inc();
            }
        }
    }

    fn evict(&mut self) {
        self.live.retain(|p| !p.is_terminal());
        METRICS.scheduler.active_packets.set(self.live.len() as i64);
    }

    /// Fail every live and queued packet and refuse new submissions
    fn stop(&mut self, reason: &str) {
        self.shared.shutdown.store(true, Ordering::Release);
        let all: Vec<usize> = (0..self.live.len()).collect();
        self.fail(&all, reason);
        self.evict();
        self.shared.drain_arrivals(reason);
    }
}
