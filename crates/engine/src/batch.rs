//! Batch formation
//!
//! Turns the packets selected for one step into uniformly shaped rows for the
//! executor. Every row is right-padded to the step's `max_length`, the longest
//! prompt-plus-generated length among the selected packets.
//!
//! - Prefill rows carry the whole prompt, positions `0..max_length`.
//! - Decode rows carry only the newest token, position `max_length - 1`
//!   followed by zeros; the executor keeps the rest of the context itself.

use crate::packet::{Packet, TokenId};
use llmperf_common::config::ModelConfig;
use llmperf_common::{LlmPerfError, Result};
use llmperf_proto::{BatchInputs, GenerateKind};
use std::fmt;
use tracing::trace;

/// Model family whose executor takes `return_last_logit = false`
pub const CHATGLM2: &str = "chatglm2";

/// Padding/position policy applied to a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerateType {
    Prefill,
    Decode,
}

impl GenerateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerateType::Prefill => "prefill",
            GenerateType::Decode => "decode",
        }
    }

    /// Policy a packet needs given how far it has generated
    pub fn for_packet(packet: &Packet) -> Self {
        if packet.generate_ids().is_empty() {
            GenerateType::Prefill
        } else {
            GenerateType::Decode
        }
    }
}

impl fmt::Display for GenerateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executor-ready inputs for one step
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInputs {
    pub input_ids: Vec<Vec<TokenId>>,
    pub position_ids: Vec<Vec<u32>>,
    pub generate_type: GenerateType,

    /// Pass-through knob for executors that trim logits themselves
    pub return_last_logit: Option<bool>,
}

impl ModelInputs {
    pub fn batch_size(&self) -> usize {
        self.input_ids.len()
    }

    pub fn max_length(&self) -> usize {
        self.input_ids.first().map(Vec::len).unwrap_or(0)
    }

    /// Pack into the wire representation
    pub fn to_proto(&self) -> BatchInputs {
        let kind = match self.generate_type {
            GenerateType::Prefill => GenerateKind::Prefill,
            GenerateType::Decode => GenerateKind::Decode,
        };
        BatchInputs {
            rows: self.batch_size() as u32,
            cols: self.max_length() as u32,
            input_ids: self.input_ids.concat(),
            position_ids: self.position_ids.concat(),
            generate_type: kind as i32,
            return_last_logit: self.return_last_logit,
        }
    }

    /// Unpack the wire representation, checking its shape
    pub fn from_proto(inputs: BatchInputs) -> Result<Self> {
        let generate_type = match GenerateKind::try_from(inputs.generate_type) {
            Ok(GenerateKind::Prefill) => GenerateType::Prefill,
            Ok(GenerateKind::Decode) => GenerateType::Decode,
            _ => {
                return Err(LlmPerfError::transport(format!(
                    "unknown generate type {}",
                    inputs.generate_type
                )))
            }
        };

        let (rows, cols) = (inputs.rows as usize, inputs.cols as usize);
        if rows == 0 || cols == 0 {
            return Err(LlmPerfError::transport("received an empty batch"));
        }
        if inputs.input_ids.len() != rows * cols || inputs.position_ids.len() != rows * cols {
            return Err(LlmPerfError::transport(format!(
                "batch payload does not match shape [{}, {}]",
                rows, cols
            )));
        }

        Ok(Self {
            input_ids: inputs.input_ids.chunks(cols).map(<[u32]>::to_vec).collect(),
            position_ids: inputs.position_ids.chunks(cols).map(<[u32]>::to_vec).collect(),
            generate_type,
            return_last_logit: inputs.return_last_logit,
        })
    }
}

/// Builds [`ModelInputs`] from packets for one model configuration
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    model_name: String,
    pad_token_id: TokenId,
}

impl BatchBuilder {
    /// Fails with a configuration error when the model name or pad token is absent
    pub fn new(model_config: &ModelConfig) -> Result<Self> {
        Ok(Self {
            model_name: model_config.model_name()?.to_string(),
            pad_token_id: model_config.pad_token_id()?,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn pad_token_id(&self) -> TokenId {
        self.pad_token_id
    }

    /// Serialize the selected packets into padded rows
    ///
    /// All packets must need the same policy; a mix of prefill and decode rows
    /// is rejected instead of being tagged after whichever row came last.
    pub fn prepare(&self, packets: &[&Packet]) -> Result<ModelInputs> {
        let max_length = packets
            .iter()
            .map(|p| p.seq_len())
            .max()
            .ok_or(LlmPerfError::EmptyBatch)?;

        let prefill = packets
            .iter()
            .filter(|p| GenerateType::for_packet(p) == GenerateType::Prefill)
            .count();
        let decode = packets.len() - prefill;
        if prefill > 0 && decode > 0 {
            return Err(LlmPerfError::MixedBatch { prefill, decode });
        }
        let generate_type = if decode == 0 {
            GenerateType::Prefill
        } else {
            GenerateType::Decode
        };

        let mut input_ids = Vec::with_capacity(packets.len());
        let mut position_ids = Vec::with_capacity(packets.len());

        for packet in packets {
            let mut row = Vec::with_capacity(max_length);
            let positions: Vec<u32> = match packet.last_token() {
                None => {
                    row.extend_from_slice(&packet.request().input_ids);
                    (0..max_length as u32).collect()
                }
                Some(token) => {
                    row.push(token);
                    let mut positions = vec![0; max_length];
                    positions[0] = (max_length - 1) as u32;
                    positions
                }
            };
            row.resize(max_length, self.pad_token_id);

            trace!(packet = %packet.id(), len = packet.seq_len(), "row prepared");
            input_ids.push(row);
            position_ids.push(positions);
        }

        Ok(ModelInputs {
            input_ids,
            position_ids,
            generate_type,
            return_last_logit: (self.model_name == CHATGLM2).then_some(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{GenerateConfig, GenerateRequest, GenerateResult, PacketHandle};
    use std::path::PathBuf;

    fn model_config(name: &str) -> ModelConfig {
        ModelConfig {
            model_name: Some(name.to_string()),
            model_path: Some(PathBuf::from("/models/test")),
            pad_token_id: Some(0),
            ..Default::default()
        }
    }

    fn packet(prompt: Vec<TokenId>, generated: &[TokenId]) -> (Packet, PacketHandle) {
        let (mut packet, handle) =
            Packet::new(GenerateRequest::new(prompt, GenerateConfig::default()));
        for &token in generated {
            packet.add_result(GenerateResult::token(token)).unwrap();
        }
        (packet, handle)
    }

    #[test]
    fn test_single_prefill_row() {
        let builder = BatchBuilder::new(&model_config("llama2")).unwrap();
        let (p, _h) = packet(vec![5, 7, 9], &[]);

        let inputs = builder.prepare(&[&p]).unwrap();

        assert_eq!(inputs.input_ids, vec![vec![5, 7, 9]]);
        assert_eq!(inputs.position_ids, vec![vec![0, 1, 2]]);
        assert_eq!(inputs.generate_type, GenerateType::Prefill);
        assert_eq!(inputs.return_last_logit, None);
    }

    #[test]
    fn test_prefill_rows_are_right_padded() {
        let builder = BatchBuilder::new(&model_config("llama2")).unwrap();
        let (a, _ha) = packet(vec![1, 2], &[]);
        let (b, _hb) = packet(vec![3, 4, 5, 6], &[]);

        let inputs = builder.prepare(&[&a, &b]).unwrap();

        assert_eq!(inputs.input_ids, vec![vec![1, 2, 0, 0], vec![3, 4, 5, 6]]);
        assert_eq!(inputs.position_ids, vec![vec![0, 1, 2, 3], vec![0, 1, 2, 3]]);
    }

    #[test]
    fn test_decode_row_carries_last_token() {
        let builder = BatchBuilder::new(&model_config("llama2")).unwrap();
        let (p, _h) = packet(vec![5, 7, 9], &[42]);

        let inputs = builder.prepare(&[&p]).unwrap();

        assert_eq!(inputs.input_ids, vec![vec![42, 0, 0, 0]]);
        assert_eq!(inputs.position_ids, vec![vec![3, 0, 0, 0]]);
        assert_eq!(inputs.generate_type, GenerateType::Decode);
    }

    #[test]
    fn test_decode_rows_share_batch_max_length() {
        let builder = BatchBuilder::new(&model_config("llama2")).unwrap();
        let (a, _ha) = packet(vec![1], &[10, 11]);
        let (b, _hb) = packet(vec![1, 2, 3, 4], &[20]);

        let inputs = builder.prepare(&[&a, &b]).unwrap();

        assert_eq!(inputs.max_length(), 5);
        assert_eq!(inputs.input_ids, vec![vec![11, 0, 0, 0, 0], vec![20, 0, 0, 0, 0]]);
        for row in inputs.input_ids.iter().chain(&inputs.position_ids) {
            assert_eq!(row.len(), 5);
        }
        assert_eq!(inputs.position_ids[0][0], 4);
    }

    #[test]
    fn test_empty_batch_is_an_error() {
        let builder = BatchBuilder::new(&model_config("llama2")).unwrap();

        assert!(matches!(builder.prepare(&[]), Err(LlmPerfError::EmptyBatch)));
    }

    #[test]
    fn test_mixed_batch_is_rejected() {
        let builder = BatchBuilder::new(&model_config("llama2")).unwrap();
        let (a, _ha) = packet(vec![1, 2], &[]);
        let (b, _hb) = packet(vec![1], &[7]);

        let err = builder.prepare(&[&a, &b]).unwrap_err();
        assert!(matches!(err, LlmPerfError::MixedBatch { prefill: 1, decode: 1 }));
    }

    #[test]
    fn test_chatglm2_disables_last_logit_trim() {
        let builder = BatchBuilder::new(&model_config(CHATGLM2)).unwrap();
        let (p, _h) = packet(vec![1, 2], &[]);

        assert_eq!(builder.prepare(&[&p]).unwrap().return_last_logit, Some(false));
    }

    #[test]
    fn test_missing_configuration() {
        let mut config = model_config("llama2");
        config.pad_token_id = None;
        assert!(matches!(BatchBuilder::new(&config), Err(LlmPerfError::Config(_))));

        let mut config = model_config("llama2");
        config.model_name = None;
        assert!(matches!(BatchBuilder::new(&config), Err(LlmPerfError::Config(_))));
    }

    #[test]
    fn test_wire_form_preserves_rows() {
        let builder = BatchBuilder::new(&model_config(CHATGLM2)).unwrap();
        let (a, _ha) = packet(vec![1, 2], &[]);
        let (b, _hb) = packet(vec![3, 4, 5], &[]);
        let inputs = builder.prepare(&[&a, &b]).unwrap();

        let wire = inputs.to_proto();
        assert_eq!((wire.rows, wire.cols), (2, 3));
        assert_eq!(ModelInputs::from_proto(wire).unwrap(), inputs);
    }

    #[test]
    fn test_wire_form_shape_mismatch() {
        let wire = BatchInputs {
            rows: 2,
            cols: 2,
            input_ids: vec![1, 2, 3],
            position_ids: vec![0, 1, 0, 1],
            generate_type: GenerateKind::Prefill as i32,
            return_last_logit: None,
        };

        assert!(matches!(ModelInputs::from_proto(wire), Err(LlmPerfError::Transport(_))));
    }
}
