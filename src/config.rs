use thiserror::Error;

use crate::types::TokenId;

/// Generation parameters for a single request.
///
/// Args:
///   max_new_tokens: Maximum number of tokens to generate per hypothesis.
///   num_return_sequences: Number of finished hypotheses to return. For beam
///       search this must not exceed `num_beams`.
///   num_beams: Number of beam-search hypotheses to run in parallel. A value
///       of 1 disables beam search.
///   length_penalty: Exponential length penalty applied to beam-search scores.
///   eos_token_id: Token id that terminates generation. May be left unset on a
///       per-request config, in which case the pipeline fills it from its own
///       default before validation.
///   ignore_eos: Keep generating after the EOS token is produced.
///   rng_seed: Seed handed to the sampling policy for reproducibility.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationConfig {
    /// Maximum number of newly generated tokens
    pub max_new_tokens: usize,
    /// Number of sequences to return
    pub num_return_sequences: usize,
    /// Number of beams (1 = no beam search)
    pub num_beams: usize,
    /// Length penalty for beam search scoring
    pub length_penalty: f32,
    /// EOS token id (optional until resolved by the pipeline)
    pub eos_token_id: Option<TokenId>,
    /// Whether to ignore the EOS token
    pub ignore_eos: bool,
    /// Random seed for the sampling policy
    pub rng_seed: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            num_return_sequences: 1,
            num_beams: 1,
            length_penalty: 1.0,
            eos_token_id: None,
            ignore_eos: false,
            rng_seed: 0,
        }
    }
}

impl GenerationConfig {
    /// Whether this config selects beam-search decoding.
    pub fn is_beam_search(&self) -> bool {
        self.num_beams > 1
    }

    /// Verifies the config before any engine call.
    ///
    /// Configuration errors are non-retryable and must be rejected here,
    /// before tensors are bound or the compute engine is invoked.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_new_tokens == 0 {
            return Err(ConfigError::ZeroMaxNewTokens);
        }
        if self.num_return_sequences == 0 {
            return Err(ConfigError::ZeroReturnSequences);
        }
        if self.num_beams == 0 {
            return Err(ConfigError::ZeroBeams);
        }
        if self.is_beam_search() && self.num_return_sequences > self.num_beams {
            return Err(ConfigError::TooManyReturnSequences {
                num_return_sequences: self.num_return_sequences,
                num_beams: self.num_beams,
            });
        }
        if !self.length_penalty.is_finite() {
            return Err(ConfigError::InvalidLengthPenalty(self.length_penalty));
        }
        if self.eos_token_id.is_none() && !self.ignore_eos {
            return Err(ConfigError::MissingEosTokenId);
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("`max_new_tokens` must be positive")]
    ZeroMaxNewTokens,
    #[error("`num_return_sequences` must be positive")]
    ZeroReturnSequences,
    #[error("`num_beams` must be positive")]
    ZeroBeams,
    #[error("`num_return_sequences` (`{num_return_sequences}`) exceeds `num_beams` (`{num_beams}`)")]
    TooManyReturnSequences {
        num_return_sequences: usize,
        num_beams: usize,
    },
    #[error("Invalid length penalty: `{0}`")]
    InvalidLengthPenalty(f32),
    #[error("`eos_token_id` is not set and `ignore_eos` is false")]
    MissingEosTokenId,
}
