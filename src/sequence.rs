use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};

use indexmap::IndexMap;
use thiserror::Error;
use tracing::{info_span, instrument, trace, Span};

use crate::{
    config::GenerationConfig,
    types::{ReadLock, RequestId, SequenceId, TokenId, WriteLock},
};

/// Reason why a hypothesis stopped generating.
///
/// `Length`: the hypothesis hit `max_new_tokens`.
/// `Stop`: a stop condition was met (EOS or a stop token id).
/// `Aborted`: the hypothesis was terminated by an error or user intervention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishReason {
    Length,
    Stop,
    Aborted,
}

/// `Sequence` - A single hypothesis within a `SequenceGroup`.
///
/// Holds the tokens generated for this hypothesis so far together with their
/// cumulative log-probability. A sequence without a finish reason is running.
#[derive(Clone, Debug, PartialEq)]
pub struct Sequence {
    /// Unique identifier for the sequence, stable across beam reordering
    sequence_id: SequenceId,
    /// The token IDs generated for this hypothesis
    generated_token_ids: Vec<TokenId>,
    /// The cumulative log probability of the generated tokens
    cumulative_logprob: f32,
    /// Why generation stopped, if it has
    finish_reason: Option<FinishReason>,
}

impl Sequence {
    /// Constructor
    pub fn new(sequence_id: SequenceId) -> Self {
        Self {
            sequence_id,
            generated_token_ids: vec![],
            cumulative_logprob: 0.0,
            finish_reason: None,
        }
    }

    /// Getter for `sequence_id`
    pub fn sequence_id(&self) -> SequenceId {
        self.sequence_id
    }

    /// Appends a newly sampled token and accumulates its log-probability.
    pub fn add_token_id(&mut self, token_id: TokenId, logprob: f32) {
        self.generated_token_ids.push(token_id);
        self.cumulative_logprob += logprob;
    }

    /// Returns the generated token ids of this hypothesis.
    pub fn get_generated_ids(&self) -> &[TokenId] {
        &self.generated_token_ids
    }

    /// Number of generated tokens.
    pub fn get_output_len(&self) -> usize {
        self.generated_token_ids.len()
    }

    /// The last generated token, if any.
    pub fn get_last_token_id(&self) -> Option<TokenId> {
        self.generated_token_ids.last().copied()
    }

    /// Getter for `cumulative_logprob`
    pub fn cumulative_logprob(&self) -> f32 {
        self.cumulative_logprob
    }

    /// Getter for `finish_reason`
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Marks the hypothesis as finished.
    pub fn set_finish_reason(&mut self, reason: FinishReason) {
        self.finish_reason = Some(reason);
    }

    /// Whether the hypothesis has stopped generating.
    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// Calculate the beam search score with length penalty.
    ///
    /// Adapted from
    ///
    /// https://github.com/huggingface/transformers/blob/ccb92be23def445f2afdea94c31286f84b89eb5b/src/transformers/generation/beam_search.py#L938
    pub fn get_beam_search_score(&self, length_penalty: f32) -> f32 {
        let length = self.get_output_len().max(1) as f32;
        self.cumulative_logprob / length.powf(length_penalty)
    }

    /// Creates a new `Sequence` by forking the current one.
    ///
    /// Used by beam search when a hypothesis branches into several candidates:
    /// the clone shares this hypothesis's history under a new stable id.
    pub fn fork(&self, new_sequence_id: SequenceId) -> Self {
        let mut new_seq = self.clone();
        new_seq.sequence_id = new_sequence_id;
        new_seq
    }
}

pub type SyncSequence = Arc<RwLock<Sequence>>;

impl ReadLock for SyncSequence {
    type Error = SequenceError;
    type Inner = Sequence;

    fn read_lock(&self) -> Result<std::sync::RwLockReadGuard<Self::Inner>, Self::Error> {
        self.read()
            .map_err(|e| SequenceError::ReadLockError(e.to_string()))
    }
}

impl WriteLock for SyncSequence {
    type Error = SequenceError;
    type Inner = Sequence;

    fn write_lock(&self) -> Result<std::sync::RwLockWriteGuard<Self::Inner>, Self::Error> {
        self.write()
            .map_err(|e| SequenceError::WriteLockError(e.to_string()))
    }
}

/// Caller-visible handle onto an in-flight request.
///
/// Dropping interest in a request is cooperative: the decode loop polls the
/// flag once per step and stops scheduling the group, without aborting the
/// batch for other groups.
#[derive(Clone, Debug, Default)]
pub struct GenerationHandle {
    dropped: Arc<AtomicBool>,
}

impl GenerationHandle {
    /// Signals that the caller no longer wants output for this request.
    pub fn abort(&self) {
        self.dropped.store(true, Ordering::Release);
    }

    /// Whether the caller has abandoned the request.
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }
}

/// `SequenceGroup` - One logical generation request, holding the prompt, the
/// generation parameters and 1..N competing hypotheses.
///
/// The group also carries the two counters the decode loop schedules with:
/// the number of prompt/generated tokens the compute engine has already
/// consumed, and the number of tokens scheduled for the current step.
pub struct SequenceGroup {
    /// Unique identifier for the request
    pub request_id: RequestId,
    /// Token IDs of the full logical prompt (persisted history + new input)
    prompt_token_ids: Vec<TokenId>,
    /// Generation parameters for this request
    sampling_params: GenerationConfig,
    /// Number of tokens already consumed by the compute engine
    num_processed_tokens: usize,
    /// Number of tokens scheduled for the current step
    num_scheduled_tokens: usize,
    /// Ordered map of sequence IDs to hypotheses. Insertion order defines the
    /// row order of this group's hypotheses within the batched tensors.
    sequences: IndexMap<SequenceId, SyncSequence>,
    /// Next id handed out to a forked hypothesis
    next_sequence_id: SequenceId,
    /// Set when the group can no longer be scheduled (out-of-memory analog)
    out_of_resource: bool,
    /// Shared with the caller-visible `GenerationHandle`
    handle: GenerationHandle,
    /// Tracing span for the group
    pub span: Span,
}

impl SequenceGroup {
    /// Creates a group with a single initial hypothesis.
    pub fn new(
        request_id: RequestId,
        prompt_token_ids: Vec<TokenId>,
        sampling_params: GenerationConfig,
    ) -> Result<Self, SequenceError> {
        if prompt_token_ids.is_empty() {
            return Err(SequenceError::ConstructorError("Empty prompt".into()));
        }
        let initial = Sequence::new(0);
        Ok(Self {
            request_id,
            prompt_token_ids,
            sampling_params,
            num_processed_tokens: 0,
            num_scheduled_tokens: 0,
            sequences: IndexMap::from_iter([(0, Arc::new(RwLock::new(initial)))]),
            next_sequence_id: 1,
            out_of_resource: false,
            handle: GenerationHandle::default(),
            span: info_span!("sequence-group"),
        })
    }

    /// Getter for `prompt_token_ids`
    pub fn get_prompt_ids(&self) -> &[TokenId] {
        &self.prompt_token_ids
    }

    /// Length of the logical prompt.
    pub fn get_prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    /// Getter for `sampling_params`
    pub fn sampling_params(&self) -> &GenerationConfig {
        &self.sampling_params
    }

    /// Schedules `num_tokens` additional tokens for the current step.
    pub fn schedule_tokens(&mut self, num_tokens: usize) {
        self.num_scheduled_tokens += num_tokens;
    }

    /// Getter for `num_scheduled_tokens`
    pub fn get_num_scheduled_tokens(&self) -> usize {
        self.num_scheduled_tokens
    }

    /// Overwrites the processed-token counter.
    ///
    /// Called once after the prompt step, where the counter accounts for
    /// prompt tokens already represented in the engine's persisted cache from
    /// a prior conversation turn.
    pub fn set_num_processed_tokens(&mut self, num_tokens: usize) {
        self.num_processed_tokens = num_tokens;
    }

    /// Getter for `num_processed_tokens`
    pub fn get_num_processed_tokens(&self) -> usize {
        self.num_processed_tokens
    }

    /// Folds the scheduled tokens of the finished step into the processed
    /// counter. Invoked by the decode loop after sampling, never by the
    /// sampling policy.
    #[instrument(skip_all)]
    pub fn finish_iteration(&mut self) {
        let _enter = self.span.enter();
        trace!(
            "Finishing iteration: processed {} + scheduled {}",
            self.num_processed_tokens,
            self.num_scheduled_tokens
        );
        self.num_processed_tokens += self.num_scheduled_tokens;
        self.num_scheduled_tokens = 0;
    }

    /// Adds a forked hypothesis to the group, assigning it a fresh id.
    pub fn fork_sequence(&mut self, parent_id: SequenceId) -> Result<SequenceId, SequenceError> {
        let parent = self
            .sequences
            .get(&parent_id)
            .ok_or(SequenceError::MissingSequence(parent_id))?;
        let new_id = self.next_sequence_id;
        self.next_sequence_id += 1;
        let forked = parent.read_lock()?.fork(new_id);
        self.sequences.insert(new_id, Arc::new(RwLock::new(forked)));
        Ok(new_id)
    }

    /// Removes a pruned hypothesis from the group.
    pub fn remove_sequence(&mut self, sequence_id: SequenceId) -> Result<(), SequenceError> {
        self.sequences
            .shift_remove(&sequence_id)
            .map(|_| ())
            .ok_or(SequenceError::MissingSequence(sequence_id))
    }

    /// Retrieves a hypothesis by id.
    pub fn get_sequence_from_id(&self, sequence_id: SequenceId) -> Option<&SyncSequence> {
        self.sequences.get(&sequence_id)
    }

    /// Running (unfinished) hypotheses in row order.
    pub fn get_running_sequences(&self) -> Vec<SyncSequence> {
        self.sequences
            .values()
            .filter(|s| !s.read().map(|s| s.is_finished()).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Number of running hypotheses.
    pub fn num_running_seqs(&self) -> usize {
        self.sequences
            .values()
            .filter(|s| !s.read().map(|s| s.is_finished()).unwrap_or(true))
            .count()
    }

    /// Finished hypotheses sorted best-first by cumulative log-probability.
    ///
    /// If no hypothesis carries a finish reason (the caller dropped its handle
    /// mid-generation), all hypotheses are returned instead, so the partial
    /// output is still observable in the final results.
    pub fn get_finished_sequences(&self) -> Vec<SyncSequence> {
        let mut finished: Vec<SyncSequence> = self
            .sequences
            .values()
            .filter(|s| s.read().map(|s| s.is_finished()).unwrap_or(false))
            .cloned()
            .collect();
        if finished.is_empty() {
            finished = self.sequences.values().cloned().collect();
        }
        finished.sort_by(|a, b| {
            let a_score = a.read().map(|s| s.cumulative_logprob()).unwrap_or(f32::MIN);
            let b_score = b.read().map(|s| s.cumulative_logprob()).unwrap_or(f32::MIN);
            b_score.partial_cmp(&a_score).unwrap_or(std::cmp::Ordering::Equal)
        });
        finished
    }

    /// Whether every hypothesis has stopped generating.
    pub fn has_finished(&self) -> bool {
        self.num_running_seqs() == 0
    }

    /// Marks the group as unschedulable for resource reasons. This is a
    /// normal termination path for the group, not a batch failure.
    pub fn set_out_of_resource(&mut self) {
        self.out_of_resource = true;
    }

    /// Getter for `out_of_resource`
    pub fn is_out_of_resource(&self) -> bool {
        self.out_of_resource
    }

    /// Returns a caller-visible handle for cooperative cancellation.
    pub fn generation_handle(&self) -> GenerationHandle {
        self.handle.clone()
    }

    /// Whether the caller has dropped its handle.
    pub fn handle_dropped(&self) -> bool {
        self.handle.is_dropped()
    }
}

pub type SyncSequenceGroup = Arc<RwLock<SequenceGroup>>;

impl ReadLock for SyncSequenceGroup {
    type Error = SequenceError;
    type Inner = SequenceGroup;

    fn read_lock(&self) -> Result<std::sync::RwLockReadGuard<Self::Inner>, Self::Error> {
        self.read()
            .map_err(|e| SequenceError::ReadLockError(e.to_string()))
    }
}

impl WriteLock for SyncSequenceGroup {
    type Error = SequenceError;
    type Inner = SequenceGroup;

    fn write_lock(&self) -> Result<std::sync::RwLockWriteGuard<Self::Inner>, Self::Error> {
        self.write()
            .map_err(|e| SequenceError::WriteLockError(e.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("Constructor error: `{0}`")]
    ConstructorError(String),
    #[error("Missing sequence, with id = `{0}`")]
    MissingSequence(SequenceId),
    #[error("Read lock error: `{0}`")]
    ReadLockError(String),
    #[error("Write lock error: `{0}`")]
    WriteLockError(String),
}
