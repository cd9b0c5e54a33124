use candle_core::Tensor;
use thiserror::Error;

use crate::types::TokenId;

/// Tensor name for the raw token-id input.
pub const INPUT_IDS: &str = "input_ids";
/// Tensor name for the embedded input, used instead of `input_ids` when an
/// embedding collaborator is configured.
pub const INPUTS_EMBEDS: &str = "inputs_embeds";
/// Tensor name for the attention mask.
pub const ATTENTION_MASK: &str = "attention_mask";
/// Tensor name for the position ids.
pub const POSITION_IDS: &str = "position_ids";
/// Tensor name for the per-row beam source indices.
pub const BEAM_IDX: &str = "beam_idx";
/// Tensor name for the output logits.
pub const LOGITS: &str = "logits";

/// `ComputeEngine` trait - interface to the black-box autoregressive model.
///
/// The engine consumes and produces fixed-shape numeric tensors bound by
/// name; every `infer` is a synchronous, blocking call. The engine owns an
/// opaque internal key/value cache whose sequence axis can be trimmed, which
/// is what allows a multi-turn conversation to reuse state across turns.
pub trait ComputeEngine {
    /// Binds `tensor` under `name` as an input for subsequent `infer` calls.
    fn set_tensor(&mut self, name: &str, tensor: Tensor) -> Result<(), EngineError>;

    /// Retrieves the tensor currently bound under `name`. Output tensors
    /// (such as `logits`) become available after `infer`.
    fn get_tensor(&self, name: &str) -> Result<Tensor, EngineError>;

    /// Runs one forward pass over the currently bound inputs.
    fn infer(&mut self) -> Result<(), EngineError>;

    /// Clears the engine's internal cache and bound mask state, starting a
    /// wholly new conversation.
    fn reset_state(&mut self) -> Result<(), EngineError>;

    /// Evicts `count` trailing positions from the internal cache along the
    /// sequence axis `seq_len_axis`. A count of zero must be a no-op.
    fn trim_cache(&mut self, seq_len_axis: usize, count: usize) -> Result<(), EngineError>;
}

/// Model-ready inputs for one conversation turn, produced by the embedding
/// collaborator.
pub struct TurnInputs {
    /// Embedded input of shape `(1, turn_len, hidden_size)`
    pub inputs_embeds: Tensor,
    /// The `turn_len` token ids the embeds represent, prefix tokens included
    pub token_ids: Vec<TokenId>,
}

/// `InputsEmbedder` trait - converts caller input (prompt text plus optional
/// images) into model-ready tensors.
///
/// `prefix_tokens` carries tokens the pipeline needs re-fed because they are
/// part of the persisted history but absent from the engine's internal cache;
/// the embedder must place their embeddings before the new prompt's.
pub trait InputsEmbedder {
    fn get_inputs_embeds(
        &mut self,
        prompt: &str,
        images: &[Tensor],
        prefix_tokens: &[TokenId],
    ) -> Result<TurnInputs, EngineError>;

    /// Embeds a `(rows, 1)` token-id batch during the generation loop.
    fn infer(&mut self, token_ids: &Tensor) -> Result<Tensor, EngineError>;
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Candle error: `{0}`")]
    CandleError(#[from] candle_core::Error),
    #[error("No tensor bound under name `{0}`")]
    MissingTensor(String),
    #[error("Invalid tensor shape for `{name}`: `{message}`")]
    InvalidShape { name: String, message: String },
    #[error("Engine execution error: `{0}`")]
    ExecutionError(String),
}
