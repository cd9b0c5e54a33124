//! Decoding core for a text-plus-image generation pipeline.
//!
//! The crate drives a black-box autoregressive compute engine through the
//! prompt step and the token-by-token generation loop, batching heterogeneous
//! requests into flat tensors, tracking beam-search row reordering, and
//! reconciling the engine's internal key/value cache with the persisted
//! conversation history across chat turns.
//!
//! The main entry points are [`pipeline::VlmPipeline`] for the turn-level
//! facade and [`decoding::get_encoded_results`] for driving an already
//! prepared batch of sequence groups.

pub mod beam_state;
pub mod config;
pub mod decoding;
pub mod history;
pub mod model_executor;
pub mod pipeline;
pub mod sampler;
pub mod sequence;
pub mod types;

#[cfg(test)]
mod tests;

pub use config::{ConfigError, GenerationConfig};
pub use decoding::{get_encoded_results, DecodingError, DecodingInputs, EncodedResults};
pub use history::{CacheHistory, HistoryError};
pub use model_executor::{ComputeEngine, EngineError, InputsEmbedder, TurnInputs};
pub use pipeline::{PipelineError, VlmPipeline, KV_CACHE_SEQ_LENGTH_AXIS};
pub use sampler::{GreedySampler, Sampler, SamplerError};
pub use sequence::{
    FinishReason, GenerationHandle, Sequence, SequenceError, SequenceGroup, SyncSequence,
    SyncSequenceGroup,
};
pub use types::{RequestId, SequenceId, TokenId};
