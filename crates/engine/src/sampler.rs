//! Token selection from last-position logits

use crate::packet::{FinishReason, GenerateResult, Packet, TokenId};
use crate::tensor::Tensor;
use llmperf_common::{LlmPerfError, Result};

/// Turns one step's logits into one result per packet
///
/// The result's `finish_reason` tells the scheduler whether the packet is done.
pub trait Sampler: Send + Sync {
    /// `last_logits` is `[batch, vocabulary]`, row `i` belongs to `packets[i]`
    fn sample(&self, last_logits: &Tensor<f32>, packets: &[&Packet]) -> Result<Vec<GenerateResult>>;
}

/// Picks the highest-scoring token, ignoring sampling parameters
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedySampler;

impl GreedySampler {
    pub fn new() -> Self {
        Self
    }

    fn argmax(row: &[f32]) -> Option<TokenId> {
        let mut best: Option<(usize, f32)> = None;
        for (idx, &value) in row.iter().enumerate() {
            if value.is_nan() {
                continue;
            }
            if best.map_or(true, |(_, top)| value > top) {
                best = Some((idx, value));
            }
        }
        best.map(|(idx, _)| idx as TokenId)
    }
}

impl Sampler for GreedySampler {
    fn sample(&self, last_logits: &Tensor<f32>, packets: &[&Packet]) -> Result<Vec<GenerateResult>> {
        if last_logits.ndim() != 2 || last_logits.shape()[0] != packets.len() {
            return Err(LlmPerfError::tensor(format!(
                "logits {:?} do not match {} packets",
                last_logits.shape(),
                packets.len()
            )));
        }

        packets
            .iter()
            .enumerate()
            .map(|(i, packet)| {
                let row = last_logits
                    .last_dim(&[i])
                    .ok_or_else(|| LlmPerfError::tensor(format!("missing logits row {}", i)))?;
                let token = Self::argmax(row)
                    .ok_or_else(|| LlmPerfError::tensor(format!("no finite logits in row {}", i)))?;

                let config = &packet.request().generate_config;
                let generated = packet.generate_ids().len() + 1;
                let finish_reason = if config.stop_token_ids.contains(&token) {
                    Some(FinishReason::Stop)
                } else if generated >= config.max_new_tokens {
                    Some(FinishReason::Length)
                } else {
                    None
                };

                Ok(GenerateResult {
                    token_id: token,
                    finish_reason,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{GenerateConfig, GenerateRequest, PacketHandle};

    fn packet(max_new_tokens: usize, stop: Vec<TokenId>) -> (Packet, PacketHandle) {
        let config = GenerateConfig {
            max_new_tokens,
            stop_token_ids: stop,
            ..Default::default()
        };
        Packet::new(GenerateRequest::new(vec![1, 2], config))
    }

    #[test]
    fn test_argmax_per_row() {
        let logits = Tensor::new(vec![0.1, 0.9, 0.0, 0.5, 0.2, 0.7], vec![2, 3]).unwrap();
        let (a, _ha) = packet(8, vec![]);
        let (b, _hb) = packet(8, vec![]);

        let results = GreedySampler::new().sample(&logits, &[&a, &b]).unwrap();

        assert_eq!(results, vec![GenerateResult::token(1), GenerateResult::token(2)]);
    }

    #[test]
    fn test_stop_token_and_length_limits() {
        let logits = Tensor::new(vec![0.0, 1.0, 0.0, 1.0], vec![2, 2]).unwrap();
        let (stops, _hs) = packet(8, vec![1]);
        let (short, _hl) = packet(1, vec![]);

        let results = GreedySampler::new().sample(&logits, &[&stops, &short]).unwrap();

        assert_eq!(results[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(results[1].finish_reason, Some(FinishReason::Length));
    }

    #[test]
    fn test_ties_pick_lowest_id_and_skip_nan() {
        assert_eq!(GreedySampler::argmax(&[0.5, 0.5, 0.1]), Some(0));
        assert_eq!(GreedySampler::argmax(&[f32::NAN, 0.2, 0.3]), Some(2));
        assert_eq!(GreedySampler::argmax(&[f32::NAN]), None);
    }

    #[test]
    fn test_row_count_mismatch() {
        let logits = Tensor::new(vec![0.0; 4], vec![1, 4]).unwrap();
        let (a, _ha) = packet(8, vec![]);
        let (b, _hb) = packet(8, vec![]);

        assert!(GreedySampler::new().sample(&logits, &[&a, &b]).is_err());
    }
}
