use std::time::Instant;

use candle_core::{Device, Tensor};
use metrics::{counter, gauge};
use thiserror::Error;
use tracing::{info, info_span, instrument, Span};

use crate::{
    config::{ConfigError, GenerationConfig},
    decoding::{get_encoded_results, DecodingError, DecodingInputs, EncodedResults},
    history::{CacheHistory, HistoryError},
    model_executor::{ComputeEngine, EngineError, InputsEmbedder, ATTENTION_MASK},
    sampler::Sampler,
    sequence::{SequenceError, SequenceGroup},
    types::{RequestId, TokenId},
};

/// Axis of the engine's internal key/value cache tensors that indexes
/// sequence positions, and along which cross-turn trimming happens.
pub const KV_CACHE_SEQ_LENGTH_AXIS: usize = 2;

/// `VlmPipeline` - synchronous text-plus-image generation facade.
///
/// Owns the compute engine, the embedding collaborator, the sampling policy
/// and the cross-turn cache bookkeeping. A `generate` call runs one full
/// conversation turn to completion; in chat mode the engine's internal cache
/// is reused across turns, with the persisted history re-feeding whatever
/// suffix the cache no longer holds.
pub struct VlmPipeline<E, I, S> {
    /// The black-box autoregressive compute engine
    engine: E,
    /// Converts prompt text and images into embedded inputs
    embedder: I,
    /// The sampling/search policy
    sampler: S,
    /// Cross-turn history and cache-eviction bookkeeping
    history: CacheHistory,
    /// Default generation parameters, used when a call passes none
    generation_config: GenerationConfig,
    /// Axis along which the engine cache is trimmed
    kv_cache_seq_length_axis: usize,
    /// Whether turns accumulate into one conversation
    is_chat_conversation: bool,
    /// Request id handed to the next turn's sequence group
    next_request_id: RequestId,
    /// Device on which pipeline-built tensors are allocated
    device: Device,
    /// Tracing span for the pipeline
    span: Span,
}

impl<E, I, S> VlmPipeline<E, I, S>
where
    E: ComputeEngine,
    I: InputsEmbedder,
    S: Sampler,
{
    /// Constructor. Binds an empty attention mask so the first turn observes
    /// a zero-length cache.
    pub fn new(
        mut engine: E,
        embedder: I,
        sampler: S,
        device: Device,
        generation_config: GenerationConfig,
    ) -> Result<Self, PipelineError> {
        engine.set_tensor(ATTENTION_MASK, empty_mask(&device)?)?;
        Ok(Self {
            engine,
            embedder,
            sampler,
            history: CacheHistory::new(),
            generation_config,
            kv_cache_seq_length_axis: KV_CACHE_SEQ_LENGTH_AXIS,
            is_chat_conversation: false,
            next_request_id: 0,
            device,
            span: info_span!("vlm-pipeline"),
        })
    }

    /// Overrides the cache trimming axis, for engines whose cache layout
    /// differs from the usual `(batch, heads, seq, head_dim)`.
    pub fn with_kv_cache_seq_length_axis(mut self, axis: usize) -> Self {
        self.kv_cache_seq_length_axis = axis;
        self
    }

    /// Getter for the default generation config.
    pub fn get_generation_config(&self) -> &GenerationConfig {
        &self.generation_config
    }

    /// Replaces the default generation config.
    pub fn set_generation_config(&mut self, config: GenerationConfig) {
        self.generation_config = config;
    }

    /// Runs one conversation turn to completion.
    ///
    /// `config` overrides the pipeline default for this call only; an unset
    /// `eos_token_id` is filled from the default before validation. Outside
    /// chat mode every call is an independent conversation: the engine state
    /// and the persisted history are reset once the results are assembled.
    #[instrument(skip_all)]
    pub fn generate(
        &mut self,
        prompt: &str,
        images: &[Tensor],
        config: Option<GenerationConfig>,
    ) -> Result<EncodedResults, PipelineError> {
        let _enter = self.span.clone().entered();
        let start = Instant::now();

        let mut config = config.unwrap_or_else(|| self.generation_config.clone());
        if config.eos_token_id.is_none() {
            config.eos_token_id = self.generation_config.eos_token_id;
        }
        config.validate()?;

        // Reconcile the cache with the persisted history before any new
        // input is embedded.
        let mask_len = self.engine.get_tensor(ATTENTION_MASK)?.dims2()?.1;
        self.engine.trim_cache(
            self.kv_cache_seq_length_axis,
            self.history.num_tokens_to_remove(),
        )?;
        let history_size = self.history.start_turn(mask_len)?;
        let prefix_tokens = self.history.uncached_tokens(history_size).to_vec();

        let turn = self
            .embedder
            .get_inputs_embeds(prompt, images, &prefix_tokens)?;
        let input_size = turn.token_ids.len();
        let (_, embed_len, _) = turn.inputs_embeds.dims3()?;
        if embed_len != input_size || prefix_tokens.len() > input_size {
            return Err(PipelineError::EmbedderMismatch {
                embed_len,
                num_tokens: input_size,
                num_prefix: prefix_tokens.len(),
            });
        }

        // The group's logical prompt spans the cached history plus this
        // turn's input, so prompt positions line up with cache positions.
        let mut prompt_ids = self.history.tokens()[..history_size].to_vec();
        prompt_ids.extend_from_slice(&turn.token_ids);

        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let group = SequenceGroup::new(request_id, prompt_ids, config.clone())?;
        let sequence_groups = vec![std::sync::Arc::new(std::sync::RwLock::new(group))];

        let attention_mask = Tensor::from_vec(
            vec![1i64; history_size + input_size],
            (1, history_size + input_size),
            &self.device,
        )?;
        let position_ids = Tensor::from_vec(
            (history_size as i64..(history_size + input_size) as i64).collect::<Vec<_>>(),
            (1, input_size),
            &self.device,
        )?;

        if self.sampler.get_seed() != config.rng_seed {
            self.sampler.set_seed(config.rng_seed);
        }

        let inputs = DecodingInputs {
            inputs: turn.inputs_embeds,
            attention_mask,
            position_ids: Some(position_ids),
        };
        let (results, disappeared_token) = get_encoded_results(
            &mut self.engine,
            inputs,
            &mut self.sampler,
            sequence_groups,
            Some(&mut self.embedder),
        )?;

        let num_generated: usize = results.tokens.iter().map(Vec::len).sum();
        counter!("vlm-pipeline-generated-tokens").increment(num_generated as u64);
        gauge!("vlm-pipeline-generate-time").set(start.elapsed().as_secs_f32());
        info!(
            "Turn for request id = {request_id} produced {} hypotheses, {num_generated} tokens",
            results.tokens.len()
        );

        if self.is_chat_conversation {
            self.commit_turn(history_size, input_size, &turn.token_ids, &prefix_tokens, &results, disappeared_token, &config)?;
        } else {
            self.reset_conversation()?;
        }

        Ok(results)
    }

    /// Opens a chat conversation: subsequent `generate` calls share the
    /// engine cache and the persisted history.
    pub fn start_chat(&mut self) -> Result<(), PipelineError> {
        self.is_chat_conversation = true;
        self.reset_conversation()
    }

    /// Closes the chat conversation and discards its state.
    pub fn finish_chat(&mut self) -> Result<(), PipelineError> {
        self.is_chat_conversation = false;
        self.reset_conversation()
    }

    /// Folds a finished turn into the persisted history.
    #[allow(clippy::too_many_arguments)]
    fn commit_turn(
        &mut self,
        history_size: usize,
        input_size: usize,
        turn_token_ids: &[TokenId],
        prefix_tokens: &[TokenId],
        results: &EncodedResults,
        disappeared_token: Option<TokenId>,
        config: &GenerationConfig,
    ) -> Result<(), PipelineError> {
        let mask_len_end = self.engine.get_tensor(ATTENTION_MASK)?.dims2()?.1;
        // Generated tokens whose state the engine actually committed: the
        // post-turn mask length minus the rows the turn's input occupied.
        let committed_len = mask_len_end
            .checked_sub(history_size + input_size)
            .ok_or(PipelineError::MaskAccounting {
                mask_len: mask_len_end,
                expected_at_least: history_size + input_size,
            })?;
        let best_answer = results.tokens.first().cloned().unwrap_or_default();
        self.history.finish_turn(
            &turn_token_ids[prefix_tokens.len()..],
            &best_answer,
            disappeared_token,
            config.is_beam_search(),
            committed_len,
        );
        Ok(())
    }

    /// Resets the engine state, the bound mask and the persisted history.
    fn reset_conversation(&mut self) -> Result<(), PipelineError> {
        self.engine.reset_state()?;
        self.engine
            .set_tensor(ATTENTION_MASK, empty_mask(&self.device)?)?;
        self.history.clear();
        Ok(())
    }
}

fn empty_mask(device: &Device) -> Result<Tensor, candle_core::Error> {
    Tensor::from_vec(Vec::<i64>::new(), (1, 0), device)
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Config error: `{0}`")]
    ConfigError(#[from] ConfigError),
    #[error("Engine error: `{0}`")]
    EngineError(#[from] EngineError),
    #[error("Decoding error: `{0}`")]
    DecodingError(#[from] DecodingError),
    #[error("Sequence error: `{0}`")]
    SequenceError(#[from] SequenceError),
    #[error("History error: `{0}`")]
    HistoryError(#[from] HistoryError),
    #[error("Candle error: `{0}`")]
    CandleError(#[from] candle_core::Error),
    #[error("Embedder produced `{embed_len}` embeddings for `{num_tokens}` tokens (prefix `{num_prefix}`)")]
    EmbedderMismatch {
        embed_len: usize,
        num_tokens: usize,
        num_prefix: usize,
    },
    #[error("Post-turn mask length `{mask_len}` below turn input size `{expected_at_least}`")]
    MaskAccounting {
        mask_len: usize,
        expected_at_least: usize,
    },
}
