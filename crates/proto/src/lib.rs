//! LLMPerf wire protocol
//!
//! Messages exchanged between the leader rank and its followers. They are
//! declared with `prost` derives directly rather than generated from `.proto`
//! files; field tags are part of the wire contract and must not be reused.
//!
//! Every message on a rank link is preceded by a big-endian `u32` length. The
//! leader sends [`BroadcastFrame`]s; followers answer each with a [`StepAck`].

/// Kind of padding/position policy applied to a batch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum GenerateKind {
    Unspecified = 0,
    Prefill = 1,
    Decode = 2,
}

/// First message a follower sends after connecting to the leader
#[derive(Clone, PartialEq, prost::Message)]
pub struct Handshake {
    #[prost(uint32, tag = "1")]
    pub rank: u32,

    #[prost(uint32, tag = "2")]
    pub world_size: u32,
}

/// One step's worth of payload on a rank link
#[derive(Clone, PartialEq, prost::Message)]
pub struct BroadcastFrame {
    /// Monotonic step counter, starting at 1
    #[prost(uint64, tag = "1")]
    pub step: u64,

    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

/// Follower's report that it finished executing a step
#[derive(Clone, PartialEq, prost::Message)]
pub struct StepAck {
    /// Step being acknowledged
    #[prost(uint64, tag = "1")]
    pub step: u64,

    /// Set when the follower's forward pass failed
    #[prost(string, optional, tag = "2")]
    pub error: Option<String>,
}

/// Batch inputs in row-major packed form
#[derive(Clone, PartialEq, prost::Message)]
pub struct BatchInputs {
    #[prost(uint32, tag = "1")]
    pub rows: u32,

    #[prost(uint32, tag = "2")]
    pub cols: u32,

    #[prost(uint32, repeated, tag = "3")]
    pub input_ids: Vec<u32>,

    #[prost(uint32, repeated, tag = "4")]
    pub position_ids: Vec<u32>,

    #[prost(enumeration = "GenerateKind", tag = "5")]
    pub generate_type: i32,

    #[prost(bool, optional, tag = "6")]
    pub return_last_logit: Option<bool>,
}

/// Tells followers the leader is done and they should exit their loop
#[derive(Clone, PartialEq, prost::Message)]
pub struct Shutdown {
    #[prost(string, tag = "1")]
    pub reason: String,
}

/// Engine-level message carried in a frame's payload
#[derive(Clone, PartialEq, prost::Message)]
pub struct StepMessage {
    #[prost(oneof = "step_message::Kind", tags = "1, 2")]
    pub kind: Option<step_message::Kind>,
}

pub mod step_message {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Inputs(super::BatchInputs),

        #[prost(message, tag = "2")]
        Shutdown(super::Shutdown),
    }
}
