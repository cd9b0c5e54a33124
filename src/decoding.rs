use std::collections::HashMap;

use candle_core::Tensor;
use thiserror::Error;
use tracing::{instrument, trace};

use crate::{
    beam_state::{update_attention_mask_with_beams, update_position_ids, BeamStateError},
    model_executor::{
        ComputeEngine, EngineError, InputsEmbedder, ATTENTION_MASK, BEAM_IDX, INPUTS_EMBEDS,
        INPUT_IDS, LOGITS, POSITION_IDS,
    },
    sampler::{Sampler, SamplerError},
    sequence::{FinishReason, SequenceError, SyncSequenceGroup},
    types::{ReadLock, RequestId, SequenceId, TokenId, WriteLock},
};

/// Output aggregate of one decode run: for each returned hypothesis, the full
/// generated token sequence and its score (cumulative log-probability, or the
/// beam-search-adjusted score when the policy is beam search).
#[derive(Clone, Debug, Default)]
pub struct EncodedResults {
    /// Generated token ids, one vector per returned hypothesis
    pub tokens: Vec<Vec<TokenId>>,
    /// Score of each returned hypothesis
    pub scores: Vec<f32>,
}

/// Step-0 tensor state for a decode run.
pub struct DecodingInputs {
    /// Initial token-id or embedding tensor; its leading dimension is the
    /// prompt-step batch size (one row per group)
    pub inputs: Tensor,
    /// Initial attention mask, `(rows, history + turn length)` of `i64`
    pub attention_mask: Tensor,
    /// Initial position ids. When present, position ids are recomputed and
    /// re-bound every generation step.
    pub position_ids: Option<Tensor>,
}

/// Drives a batch of sequence groups from the prompt step to completion.
///
/// Each iteration performs one synchronous engine call over one flat batch:
/// heterogeneous groups (different hypothesis counts, different schedules)
/// share the step through an offset table keyed by request id, recomputed as
/// a prefix sum over the active-group list every step. Beam reordering is
/// expressed solely through the per-step beam mapping fed to the engine and
/// the beam-state updater; no row of any tensor is ever aliased across steps.
///
/// Returns the assembled results together with the optional "disappeared
/// token": the last token of the best hypothesis of the first group when that
/// hypothesis was length-capped or its handle dropped. The engine never
/// committed internal state for such a token, so a later turn must re-feed it.
#[instrument(skip_all)]
pub fn get_encoded_results<E, S>(
    engine: &mut E,
    inputs: DecodingInputs,
    sampler: &mut S,
    sequence_groups: Vec<SyncSequenceGroup>,
    mut embedder: Option<&mut dyn InputsEmbedder>,
) -> Result<(EncodedResults, Option<TokenId>), DecodingError>
where
    E: ComputeEngine,
    S: Sampler,
{
    if sequence_groups.is_empty() {
        return Err(DecodingError::NoSequenceGroups);
    }

    let device = inputs.attention_mask.device().clone();
    let batch_size = inputs.inputs.dims()[0];
    let track_position_ids = inputs.position_ids.is_some();

    // Step-0 bindings. No beam reordering can exist before the first step, so
    // the beam-index tensor is the identity (all zeros).
    let input_name = if embedder.is_some() {
        INPUTS_EMBEDS
    } else {
        INPUT_IDS
    };
    engine.set_tensor(input_name, inputs.inputs)?;
    engine.set_tensor(ATTENTION_MASK, inputs.attention_mask)?;
    if let Some(position_ids) = inputs.position_ids {
        engine.set_tensor(POSITION_IDS, position_ids)?;
    }
    engine.set_tensor(
        BEAM_IDX,
        Tensor::from_vec(vec![0u32; batch_size], (batch_size,), &device)?,
    )?;

    // Prompt step.
    engine.infer()?;
    let logits = engine.get_tensor(LOGITS)?;
    let (_, sequence_len, _) = logits.dims3()?;

    // A group's prompt may be longer than this step's sequence length: the
    // excess is prompt history already represented in the engine's persisted
    // cache from a prior turn, and counts as processed.
    for group in &sequence_groups {
        let mut group_guard = group.write_lock()?;
        let prompt_len = group_guard.get_prompt_len();
        if prompt_len < sequence_len {
            return Err(DecodingError::PromptShorterThanStep {
                request_id: group_guard.request_id,
                prompt_len,
                sequence_len,
            });
        }
        group_guard.set_num_processed_tokens(prompt_len - sequence_len);
        group_guard.schedule_tokens(sequence_len);
    }

    // Row offset of each group within the batch just fed. The prompt step has
    // exactly one row per group.
    let mut beam_offsets: HashMap<RequestId, usize> = HashMap::new();
    for (idx, group) in sequence_groups.iter().enumerate() {
        beam_offsets.insert(group.read_lock()?.request_id, idx);
    }

    sampler.sample(&sequence_groups, &logits)?;
    for group in &sequence_groups {
        group.write_lock()?.finish_iteration();
    }

    let mut active_sequence_groups = filter_active(&sequence_groups)?;

    // Generation loop: one token per running hypothesis per step.
    while !active_sequence_groups.is_empty() {
        let mut total_num_tokens = 0;
        for group in &active_sequence_groups {
            let mut group_guard = group.write_lock()?;
            group_guard.schedule_tokens(1);
            total_num_tokens +=
                group_guard.get_num_scheduled_tokens() * group_guard.num_running_seqs();
        }

        // Build the input rows and the beam mapping in one pass, in the same
        // row order. A scheduled position still inside the prompt re-feeds
        // the prompt token; past it, the hypothesis's own generated token.
        let mut input_ids_data: Vec<TokenId> = Vec::with_capacity(total_num_tokens);
        let mut next_beams: Vec<u32> = Vec::with_capacity(total_num_tokens);
        for group in &active_sequence_groups {
            let group_guard = group.read_lock()?;
            let num_scheduled_tokens = group_guard.get_num_scheduled_tokens();
            let group_position_id = group_guard.get_num_processed_tokens();
            let prompt_ids = group_guard.get_prompt_ids();
            let group_offset = *beam_offsets
                .get(&group_guard.request_id)
                .ok_or(DecodingError::MissingBeamOffset(group_guard.request_id))?;
            let beam_idxs = sampler.get_beam_idxs(&group_guard);

            for sequence in group_guard.get_running_sequences() {
                let sequence_guard = sequence.read_lock()?;
                for token_idx in 0..num_scheduled_tokens {
                    let position_id = group_position_id + token_idx;
                    let token = if position_id < prompt_ids.len() {
                        prompt_ids[position_id]
                    } else {
                        sequence_guard.get_generated_ids()[position_id - prompt_ids.len()]
                    };
                    input_ids_data.push(token);
                }
                let beam_idx = beam_idxs
                    .get(&sequence_guard.sequence_id())
                    .copied()
                    .ok_or_else(|| {
                        DecodingError::MissingBeamIndex(sequence_guard.sequence_id())
                    })?;
                next_beams.push(beam_idx + group_offset as u32);
            }
        }
        if input_ids_data.len() != total_num_tokens {
            return Err(DecodingError::InputRowMismatch {
                expected: total_num_tokens,
                got: input_ids_data.len(),
            });
        }

        // Offsets for the batch being fed now, and therefore the source-row
        // offsets of the *next* step's beam mapping. Always a fresh prefix
        // sum over the current active list; never carried over incrementally.
        let mut running_offset = 0;
        for group in &active_sequence_groups {
            let group_guard = group.read_lock()?;
            beam_offsets.insert(group_guard.request_id, running_offset);
            running_offset += group_guard.num_running_seqs();
        }

        trace!(
            "Generation step: {} rows over {} active groups",
            total_num_tokens,
            active_sequence_groups.len()
        );

        let new_input_ids =
            Tensor::from_vec(input_ids_data, (total_num_tokens, 1), &device)?;
        match embedder.as_deref_mut() {
            Some(embedder) => {
                let embeds = embedder.infer(&new_input_ids)?;
                engine.set_tensor(INPUTS_EMBEDS, embeds)?;
            }
            None => engine.set_tensor(INPUT_IDS, new_input_ids)?,
        }

        let previous_mask = engine.get_tensor(ATTENTION_MASK)?;
        let new_mask = update_attention_mask_with_beams(&previous_mask, &next_beams)?;
        engine.set_tensor(ATTENTION_MASK, new_mask.clone())?;
        if track_position_ids {
            engine.set_tensor(POSITION_IDS, update_position_ids(&new_mask)?)?;
        }
        let num_beam_rows = next_beams.len();
        engine.set_tensor(
            BEAM_IDX,
            Tensor::from_vec(next_beams, (num_beam_rows,), &device)?,
        )?;

        engine.infer()?;
        let logits = engine.get_tensor(LOGITS)?;
        sampler.sample(&active_sequence_groups, &logits)?;
        for group in &active_sequence_groups {
            group.write_lock()?.finish_iteration();
        }

        active_sequence_groups = filter_active(&active_sequence_groups)?;
    }

    // Result assembly over the caller's full list: groups retired mid-run
    // still contribute their finished hypotheses.
    let mut results = EncodedResults::default();
    for group in &sequence_groups {
        let group_guard = group.read_lock()?;
        let sampling_params = group_guard.sampling_params();
        let finished = group_guard.get_finished_sequences();
        let num_outputs = sampling_params.num_return_sequences.min(finished.len());

        for sequence in finished.iter().take(num_outputs) {
            let sequence_guard = sequence.read_lock()?;
            let score = if sampling_params.is_beam_search() {
                sequence_guard.get_beam_search_score(sampling_params.length_penalty)
            } else {
                sequence_guard.cumulative_logprob()
            };
            results.tokens.push(sequence_guard.get_generated_ids().to_vec());
            results.scores.push(score);
        }
    }

    for group in &sequence_groups {
        sampler.clear_request_info(group.read_lock()?.request_id);
    }

    // The engine does not commit internal state for the terminal token of a
    // length-capped or abandoned generation; surface it so the next turn can
    // re-inject it.
    let first_group = sequence_groups[0].read_lock()?;
    let best_finish_reason = first_group
        .get_finished_sequences()
        .first()
        .and_then(|s| s.read_lock().ok()?.finish_reason());
    let last_token_of_best_sequence = if best_finish_reason == Some(FinishReason::Length)
        || first_group.handle_dropped()
    {
        results.tokens.first().and_then(|tokens| tokens.last().copied())
    } else {
        None
    };

    Ok((results, last_token_of_best_sequence))
}

/// Keeps the groups that should still be scheduled: not finished, not out of
/// resource, handle not dropped. Retired groups take no further steps but
/// stay in the caller's full list for result assembly.
fn filter_active(
    groups: &[SyncSequenceGroup],
) -> Result<Vec<SyncSequenceGroup>, DecodingError> {
    let mut active = Vec::with_capacity(groups.len());
    for group in groups {
        let group_guard = group.read_lock()?;
        if !group_guard.has_finished()
            && !group_guard.is_out_of_resource()
            && !group_guard.handle_dropped()
        {
            drop(group_guard);
            active.push(group.clone());
        }
    }
    Ok(active)
}

#[derive(Debug, Error)]
pub enum DecodingError {
    #[error("No sequence groups to decode")]
    NoSequenceGroups,
    #[error("Engine error: `{0}`")]
    EngineError(#[from] EngineError),
    #[error("Beam state error: `{0}`")]
    BeamStateError(#[from] BeamStateError),
    #[error("Sampler error: `{0}`")]
    SamplerError(#[from] SamplerError),
    #[error("Sequence error: `{0}`")]
    SequenceError(#[from] SequenceError),
    #[error("Candle error: `{0}`")]
    CandleError(#[from] candle_core::Error),
    #[error("Prompt of request `{request_id}` (`{prompt_len}` tokens) shorter than prompt-step sequence length `{sequence_len}`")]
    PromptShorterThanStep {
        request_id: RequestId,
        prompt_len: usize,
        sequence_len: usize,
    },
    #[error("No beam offset recorded for request id = `{0}`")]
    MissingBeamOffset(RequestId),
    #[error("Sampling policy returned no beam index for sequence id = `{0}`")]
    MissingBeamIndex(SequenceId),
    #[error("Input rows built (`{got}`) do not match scheduled total (`{expected}`)")]
    InputRowMismatch { expected: usize, got: usize },
}
