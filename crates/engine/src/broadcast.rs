//! Leader to follower distribution of step inputs
//!
//! Rank 0 decides each batch and every other rank must execute exactly the
//! same one. The leader writes once per step and each follower reads once per
//! step. Every frame carries a step counter, and a follower that sees any
//! step other than the next one fails instead of executing out of lock-step.
//! After executing a step each follower answers with a [`StepAck`]; the leader
//! gathers one ack per follower before it moves on, so no rank runs ahead.
//!
//! Two transports implement [`Broadcaster`]:
//! - [`ChannelBroadcaster`]: ranks as tasks in one process, one bounded
//!   channel per follower.
//! - [`TcpBroadcaster`]: ranks as processes, one TCP stream per follower
//!   carrying length-prefixed protobuf frames.

use crate::context::RankContext;
use async_trait::async_trait;
use llmperf_common::config::DistributedConfig;
use llmperf_common::{LlmPerfError, Result};
use llmperf_proto::{BroadcastFrame, Handshake, StepAck};
use prost::Message;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

/// Upper bound on a single frame, guards against reading garbage lengths
const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Delay between follower connection attempts
const CONNECT_RETRY: Duration = Duration::from_millis(50);

/// Ordered, reliable one-to-many payload distribution
#[async_trait]
pub trait Broadcaster: Send {
    /// Leader only: send `payload` to every follower and hand it back
    async fn broadcast(&mut self, payload: Vec<u8>) -> Result<Vec<u8>>;

    /// Follower only: wait for the leader's next payload
    async fn receive(&mut self) -> Result<Vec<u8>>;

    /// Follower only: report that the current step finished, with its failure if any
    async fn acknowledge(&mut self, error: Option<String>) -> Result<()>;

    /// Leader only: wait until every follower acknowledged the current step
    ///
    /// Returns the failures followers reported, one `rank N: message` entry each.
    async fn gather_acks(&mut self) -> Result<Vec<String>>;

    /// Number of steps sent or received so far
    fn step(&self) -> u64;
}

fn expect_next_step(current: u64, frame: &BroadcastFrame) -> Result<u64> {
    if frame.step != current + 1 {
        return Err(LlmPerfError::transport(format!(
            "out-of-order frame: expected step {}, got {}",
            current + 1,
            frame.step
        )));
    }
    Ok(frame.step)
}

fn check_ack(step: u64, rank: usize, ack: StepAck) -> Result<Option<String>> {
    if ack.step != step {
        return Err(LlmPerfError::transport(format!(
            "follower rank {} acknowledged step {}, expected {}",
            rank, ack.step, step
        )));
    }
    Ok(ack.error.map(|e| format!("rank {}: {}", rank, e)))
}

struct ChannelLink {
    rank: usize,
    frames: mpsc::Sender<BroadcastFrame>,
    acks: mpsc::Receiver<StepAck>,
}

enum ChannelRole {
    Leader {
        followers: Vec<ChannelLink>,
    },
    Follower {
        inbox: mpsc::Receiver<BroadcastFrame>,
        acks: mpsc::Sender<StepAck>,
    },
}

/// In-process broadcaster for ranks running as tasks or threads
pub struct ChannelBroadcaster {
    rank: RankContext,
    step: u64,
    role: ChannelRole,
}

impl ChannelBroadcaster {
    /// Build a connected group; element `i` belongs to rank `i`
    pub fn group(world_size: usize, capacity: usize) -> Result<Vec<ChannelBroadcaster>> {
        if world_size < 2 {
            return Err(LlmPerfError::config("a broadcast group needs at least two ranks"));
        }

        let capacity = capacity.max(1);
        let mut links = Vec::with_capacity(world_size - 1);
        let mut members = Vec::with_capacity(world_size);
        members.push(None);

        for rank in 1..world_size {
            let (frame_tx, frame_rx) = mpsc::channel(capacity);
            let (ack_tx, ack_rx) = mpsc::channel(capacity);
            links.push(ChannelLink {
                rank,
                frames: frame_tx,
                acks: ack_rx,
            });
            members.push(Some(ChannelBroadcaster {
                rank: RankContext::new(rank, world_size)?,
                step: 0,
                role: ChannelRole::Follower {
                    inbox: frame_rx,
                    acks: ack_tx,
                },
            }));
        }
        members[0] = Some(ChannelBroadcaster {
            rank: RankContext::new(0, world_size)?,
            step: 0,
            role: ChannelRole::Leader { followers: links },
        });

        Ok(members.into_iter().flatten().collect())
    }

    pub fn rank(&self) -> &RankContext {
        &self.rank
    }
}

#[async_trait]
impl Broadcaster for ChannelBroadcaster {
    async fn broadcast(&mut self, payload: Vec<u8>) -> Result<Vec<u8>> {
        let ChannelRole::Leader { followers } = &mut self.role else {
            return Err(LlmPerfError::transport(format!("{} is not the leader", self.rank)));
        };

        let frame = BroadcastFrame {
            step: self.step + 1,
            payload,
        };
        for link in followers.iter() {
            link.frames
                .send(frame.clone())
                .await
                .map_err(|_| LlmPerfError::transport(format!("follower rank {} disconnected", link.rank)))?;
        }

        self.step = frame.step;
        trace!(step = self.step, followers = followers.len(), "payload broadcast");
        Ok(frame.payload)
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        let ChannelRole::Follower { inbox, .. } = &mut self.role else {
            return Err(LlmPerfError::transport("the leader cannot receive"));
        };

        let frame = inbox
            .recv()
            .await
            .ok_or_else(|| LlmPerfError::transport("leader disconnected"))?;
        self.step = expect_next_step(self.step, &frame)?;
        Ok(frame.payload)
    }

    async fn acknowledge(&mut self, error: Option<String>) -> Result<()> {
        let ChannelRole::Follower { acks, .. } = &mut self.role else {
            return Err(LlmPerfError::transport("the leader cannot acknowledge"));
        };

        let ack = StepAck { step: self.step, error };
        acks.send(ack)
            .await
            .map_err(|_| LlmPerfError::transport("leader disconnected"))
    }

    async fn gather_acks(&mut self) -> Result<Vec<String>> {
        let ChannelRole::Leader { followers } = &mut self.role else {
            return Err(LlmPerfError::transport(format!("{} is not the leader", self.rank)));
        };

        let mut failures = Vec::new();
        for link in followers.iter_mut() {
            let ack = link
                .acks
                .recv()
                .await
                .ok_or_else(|| LlmPerfError::transport(format!("follower rank {} disconnected", link.rank)))?;
            failures.extend(check_ack(self.step, link.rank, ack)?);
        }
        trace!(step = self.step, failures = failures.len(), "step acknowledged");
        Ok(failures)
    }

    fn step(&self) -> u64 {
        self.step
    }
}

async fn write_message<M: Message>(stream: &mut TcpStream, message: &M) -> std::io::Result<()> {
    let bytes = message.encode_to_vec();
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await
}

async fn read_message<M: Message + Default>(stream: &mut TcpStream) -> Result<M> {
    let len = stream
        .read_u32()
        .await
        .map_err(|e| LlmPerfError::transport(format!("connection lost: {}", e)))? as usize;
    if len > MAX_FRAME_BYTES {
        return Err(LlmPerfError::transport(format!("frame of {} bytes exceeds limit", len)));
    }

    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| LlmPerfError::transport(format!("connection lost mid-frame: {}", e)))?;
    Ok(M::decode(buf.as_slice())?)
}

enum TcpRole {
    Leader { followers: Vec<(usize, TcpStream)> },
    Follower { stream: TcpStream },
}

/// Broadcaster for ranks running as separate processes
pub struct TcpBroadcaster {
    rank: RankContext,
    step: u64,
    role: TcpRole,
}

impl TcpBroadcaster {
    /// Listen (leader) or join (follower) using the configured endpoint
    pub async fn connect(rank: RankContext, config: &DistributedConfig) -> Result<Self> {
        let endpoint = config.master_endpoint();
        if rank.is_leader() {
            let listener = TcpListener::bind(&endpoint)
                .await
                .map_err(|e| LlmPerfError::transport(format!("cannot listen on {}: {}", endpoint, e)))?;
            Self::accept(rank, listener, config.connect_timeout()).await
        } else {
            Self::join(rank, &endpoint, config.connect_timeout()).await
        }
    }

    /// Leader side: wait for every follower to connect and introduce itself
    pub async fn accept(rank: RankContext, listener: TcpListener, wait: Duration) -> Result<Self> {
        let deadline = Instant::now() + wait;
        let expected = rank.world_size - 1;
        let mut followers: Vec<(usize, TcpStream)> = Vec::with_capacity(expected);

        info!(%rank, expected, "waiting for followers");
        while followers.len() < expected {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (mut stream, addr) = timeout(remaining, listener.accept())
                .await
                .map_err(|_| {
                    LlmPerfError::transport(format!(
                        "only {} of {} followers connected in time",
                        followers.len(),
                        expected
                    ))
                })?
                .map_err(|e| LlmPerfError::transport(format!("accept failed: {}", e)))?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            let hello: Handshake = timeout(remaining, read_message(&mut stream))
                .await
                .map_err(|_| LlmPerfError::transport(format!("follower at {} sent no handshake", addr)))??;
            let follower = hello.rank as usize;
            if hello.world_size as usize != rank.world_size
                || follower == 0
                || follower >= rank.world_size
                || followers.iter().any(|(r, _)| *r == follower)
            {
                warn!(%addr, rank = hello.rank, world_size = hello.world_size, "rejected follower");
                return Err(LlmPerfError::transport(format!(
                    "invalid handshake from {}: rank {} of {}",
                    addr, hello.rank, hello.world_size
                )));
            }

            stream
                .set_nodelay(true)
                .map_err(|e| LlmPerfError::transport(format!("cannot configure link to {}: {}", addr, e)))?;
            debug!(%addr, follower, "follower joined");
            followers.push((follower, stream));
        }
        followers.sort_by_key(|(r, _)| *r);

        Ok(Self {
            rank,
            step: 0,
            role: TcpRole::Leader { followers },
        })
    }

    /// Follower side: connect to the leader, retrying until `wait` elapses
    pub async fn join(rank: RankContext, endpoint: &str, wait: Duration) -> Result<Self> {
        let deadline = Instant::now() + wait;
        let mut stream = loop {
            match TcpStream::connect(endpoint).await {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    trace!(endpoint, error = %e, "leader not reachable yet");
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
                Err(e) => {
                    return Err(LlmPerfError::transport(format!(
                        "cannot reach leader at {}: {}",
                        endpoint, e
                    )))
                }
            }
        };
        stream
            .set_nodelay(true)
            .map_err(|e| LlmPerfError::transport(format!("cannot configure link to {}: {}", endpoint, e)))?;

        let hello = Handshake {
            rank: rank.rank as u32,
            world_size: rank.world_size as u32,
        };
        write_message(&mut stream, &hello)
            .await
            .map_err(|e| LlmPerfError::transport(format!("handshake failed: {}", e)))?;
        info!(%rank, endpoint, "joined leader");

        Ok(Self {
            rank,
            step: 0,
            role: TcpRole::Follower { stream },
        })
    }
}

#[async_trait]
impl Broadcaster for TcpBroadcaster {
    async fn broadcast(&mut self, payload: Vec<u8>) -> Result<Vec<u8>> {
        let TcpRole::Leader { followers } = &mut self.role else {
            return Err(LlmPerfError::transport(format!("{} is not the leader", self.rank)));
        };

        let frame = BroadcastFrame {
            step: self.step + 1,
            payload,
        };
        for (rank, stream) in followers.iter_mut() {
            write_message(stream, &frame)
                .await
                .map_err(|e| LlmPerfError::transport(format!("follower rank {} unreachable: {}", rank, e)))?;
        }

        self.step = frame.step;
        Ok(frame.payload)
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        let TcpRole::Follower { stream } = &mut self.role else {
            return Err(LlmPerfError::transport("the leader cannot receive"));
        };

        let frame: BroadcastFrame = read_message(stream).await?;
        self.step = expect_next_step(self.step, &frame)?;
        Ok(frame.payload)
    }

    async fn acknowledge(&mut self, error: Option<String>) -> Result<()> {
        let TcpRole::Follower { stream } = &mut self.role else {
            return Err(LlmPerfError::transport("the leader cannot acknowledge"));
        };

        let ack = StepAck { step: self.step, error };
        write_message(stream, &ack)
            .await
            .map_err(|e| LlmPerfError::transport(format!("leader unreachable: {}", e)))
    }

    async fn gather_acks(&mut self) -> Result<Vec<String>> {
        let TcpRole::Leader { followers } = &mut self.role else {
            return Err(LlmPerfError::transport(format!("{} is not the leader", self.rank)));
        };

        let mut failures = Vec::new();
        for (rank, stream) in followers.iter_mut() {
            let ack: StepAck = read_message(stream).await?;
            failures.extend(check_ack(self.step, *rank, ack)?);
        }
        Ok(failures)
    }

    fn step(&self) -> u64 {
        self.step
    }
}
