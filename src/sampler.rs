use std::collections::HashMap;

use candle_core::{IndexOp, Tensor};
use thiserror::Error;
use tracing::trace;

use crate::{
    sequence::{FinishReason, SequenceError, SequenceGroup, SyncSequenceGroup},
    types::{ReadLock, RequestId, SequenceId, WriteLock},
};

/// `Sampler` trait - the sampling/search policy driven by the decode loop.
///
/// One `sample` call covers one engine step: the policy reads the logits rows
/// belonging to each group's running hypotheses (rows appear in group order,
/// hypotheses in row order within the group) and mutates the groups — applying
/// a token to each hypothesis, updating scores, possibly forking or pruning
/// hypotheses, possibly marking them finished. Advancing the groups'
/// scheduled/processed counters is the decode loop's job, not the policy's.
///
/// The policy owns per-request bookkeeping keyed by request id; it is not
/// reentrant for a given request id across concurrently driven loops.
pub trait Sampler {
    /// Applies the policy to one step's logits for the given groups.
    fn sample(&mut self, groups: &[SyncSequenceGroup], logits: &Tensor)
        -> Result<(), SamplerError>;

    /// For each running hypothesis of `group`, the source row *within the
    /// group's previous-step rows* its hidden state should be copied from.
    fn get_beam_idxs(&mut self, group: &SequenceGroup) -> HashMap<SequenceId, u32>;

    /// Releases per-request bookkeeping. Idempotent; unknown ids are not an
    /// error.
    fn clear_request_info(&mut self, request_id: RequestId);

    /// Reseeds the policy's randomness source.
    fn set_seed(&mut self, seed: u64);

    /// Getter for the current seed.
    fn get_seed(&self) -> u64;
}

/// Deterministic argmax policy.
///
/// Each running hypothesis receives the highest-probability token of its
/// logits row along with that token's log-softmax value. Groups finish on EOS
/// or when `max_new_tokens` is reached. Beam indices are the identity: with no
/// search, every hypothesis continues its own previous row.
#[derive(Debug, Default)]
pub struct GreedySampler {
    seed: u64,
}

impl GreedySampler {
    /// Constructor
    pub fn new() -> Self {
        Self::default()
    }
}

impl Sampler for GreedySampler {
    fn sample(
        &mut self,
        groups: &[SyncSequenceGroup],
        logits: &Tensor,
    ) -> Result<(), SamplerError> {
        let (num_rows, _seq_len, _vocab_size) = logits.dims3()?;
        let total_running: usize = groups
            .iter()
            .map(|g| g.read_lock().map(|g| g.num_running_seqs()))
            .collect::<Result<Vec<_>, _>>()?
            .iter()
            .sum();
        if num_rows != total_running {
            return Err(SamplerError::LogitsRowMismatch {
                logits_rows: num_rows,
                running_rows: total_running,
            });
        }

        let mut logits_idx = 0;
        for group in groups {
            let group_guard = group.read_lock()?;
            let params = group_guard.sampling_params().clone();
            let running = group_guard.get_running_sequences();
            drop(group_guard);

            for sequence in running {
                // Only the last position of the row carries the next-token
                // distribution; the prompt step may have seq_len > 1.
                let row = logits.i(logits_idx)?;
                let (positions, _) = row.dims2()?;
                let scores = row.i(positions - 1)?.to_vec1::<f32>()?;
                logits_idx += 1;

                let (token_id, logprob) = argmax_log_softmax(&scores);
                let mut sequence_guard = sequence.write_lock()?;
                sequence_guard.add_token_id(token_id, logprob);

                let is_eos = params.eos_token_id == Some(token_id);
                if is_eos && !params.ignore_eos {
                    trace!("Sequence finished on EOS token `{token_id}`");
                    sequence_guard.set_finish_reason(FinishReason::Stop);
                } else if sequence_guard.get_output_len() >= params.max_new_tokens {
                    trace!("Sequence finished on `max_new_tokens`");
                    sequence_guard.set_finish_reason(FinishReason::Length);
                }
            }
        }
        Ok(())
    }

    fn get_beam_idxs(&mut self, group: &SequenceGroup) -> HashMap<SequenceId, u32> {
        group
            .get_running_sequences()
            .iter()
            .enumerate()
            .filter_map(|(row, sequence)| {
                sequence
                    .read()
                    .ok()
                    .map(|s| (s.sequence_id(), row as u32))
            })
            .collect()
    }

    fn clear_request_info(&mut self, request_id: RequestId) {
        trace!("Clearing request info for request id = {request_id}");
    }

    fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
    }

    fn get_seed(&self) -> u64 {
        self.seed
    }
}

/// Argmax over raw scores plus the winner's log-softmax log-probability.
fn argmax_log_softmax(scores: &[f32]) -> (u32, f32) {
    let mut best_idx = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (idx, &score) in scores.iter().enumerate() {
        if score > best_score {
            best_idx = idx;
            best_score = score;
        }
    }
    let log_sum_exp = scores
        .iter()
        .map(|&s| (s - best_score).exp())
        .sum::<f32>()
        .ln();
    (best_idx as u32, -log_sum_exp)
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("Candle error: `{0}`")]
    CandleError(#[from] candle_core::Error),
    #[error("Sequence error: `{0}`")]
    SequenceError(#[from] SequenceError),
    #[error("Logits rows (`{logits_rows}`) do not match running hypotheses (`{running_rows}`)")]
    LogitsRowMismatch {
        logits_rows: usize,
        running_rows: usize,
    },
}
