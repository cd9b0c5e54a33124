use thiserror::Error;
use tracing::{debug, trace};

use crate::types::TokenId;

/// `CacheHistory` - cross-turn reconciliation between the persisted token
/// history and the compute engine's internal key/value cache.
///
/// The persisted history is the flat list of every token fed to or generated
/// by the model across a conversation. The engine's cache holds state for a
/// *prefix* of that history: the terminal token of a turn is sampled but never
/// fed back, and a beam-search turn leaves the cache holding one beam's state
/// that the chosen answer may not match. This manager tracks how many trailing
/// cache positions must be evicted before the next turn and which history
/// suffix must be re-fed as part of the next turn's input.
#[derive(Clone, Debug, Default)]
pub struct CacheHistory {
    /// Everything fed or generated so far, prompts and answers interleaved
    tokens: Vec<TokenId>,
    /// Trailing cache positions to evict before the next turn starts
    to_remove_from_cache: usize,
    /// Token generated last turn but never committed to the cache
    last_disappeared_token: Option<TokenId>,
    /// Committed-row delta recorded at the end of the last turn
    last_answer_len: usize,
}

impl CacheHistory {
    /// Constructor
    pub fn new() -> Self {
        Self::default()
    }

    /// The persisted token history.
    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    /// Number of trailing positions the engine cache must evict before the
    /// next turn's input is fed.
    pub fn num_tokens_to_remove(&self) -> usize {
        self.to_remove_from_cache
    }

    /// Getter for `last_disappeared_token`
    pub fn last_disappeared_token(&self) -> Option<TokenId> {
        self.last_disappeared_token
    }

    /// Opens a turn, given the current column count of the engine's bound
    /// attention mask (measured *before* the trim is applied).
    ///
    /// Returns `history_size`: the number of leading history tokens the
    /// trimmed cache still represents. The invariant `history_size +
    /// turn_input_size == mask rows fed this turn` is what keeps generations
    /// positionally aligned, so the size is always recomputed from the
    /// current mask length minus the pending eviction, never from a cached
    /// value that predates the trim.
    pub fn start_turn(&mut self, mask_len: usize) -> Result<usize, HistoryError> {
        let to_remove = self.to_remove_from_cache;
        if to_remove > mask_len {
            return Err(HistoryError::TrimExceedsCache { to_remove, mask_len });
        }
        let history_size = mask_len - to_remove;
        if history_size > self.tokens.len() {
            return Err(HistoryError::CacheAheadOfHistory {
                history_size,
                num_tokens: self.tokens.len(),
            });
        }
        trace!(
            "Starting turn: mask_len = {mask_len}, to_remove = {to_remove}, history_size = {history_size}"
        );
        self.to_remove_from_cache = 0;
        Ok(history_size)
    }

    /// The history suffix absent from the engine cache, which the next turn
    /// must re-feed ahead of its new prompt tokens. After a length-capped
    /// turn this starts with the disappeared token.
    pub fn uncached_tokens(&self, history_size: usize) -> &[TokenId] {
        &self.tokens[history_size.min(self.tokens.len())..]
    }

    /// Closes a turn.
    ///
    /// `new_input_tokens` are the turn's fresh prompt tokens (the re-fed
    /// prefix is already persisted and must not be appended twice);
    /// `generated` is the winning hypothesis's output, disappeared token
    /// included. `committed_len` is the row-count delta between the engine's
    /// post-turn mask length and the rows consumed by the turn's initial
    /// input: the number of generated tokens actually committed to cache.
    /// A beam-search turn schedules that many trailing positions for
    /// eviction, since the committed rows belong to whichever beam the
    /// engine last advanced, not necessarily the returned answer.
    pub fn finish_turn(
        &mut self,
        new_input_tokens: &[TokenId],
        generated: &[TokenId],
        disappeared_token: Option<TokenId>,
        is_beam_search: bool,
        committed_len: usize,
    ) {
        debug!(
            "Finishing turn: {} input tokens, {} generated, committed = {committed_len}, beam = {is_beam_search}",
            new_input_tokens.len(),
            generated.len()
        );
        self.tokens.extend_from_slice(new_input_tokens);
        self.tokens.extend_from_slice(generated);
        self.last_disappeared_token = disappeared_token;
        self.last_answer_len = committed_len;
        self.to_remove_from_cache = if is_beam_search { committed_len } else { 0 };
    }

    /// Wholly new conversation: history empties and nothing is pending
    /// eviction. The caller resets the engine's internal state alongside.
    pub fn clear(&mut self) {
        self.tokens.clear();
        self.to_remove_from_cache = 0;
        self.last_disappeared_token = None;
        self.last_answer_len = 0;
    }
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Pending eviction (`{to_remove}`) exceeds cached mask length (`{mask_len}`)")]
    TrimExceedsCache { to_remove: usize, mask_len: usize },
    #[error("Cache claims `{history_size}` tokens but history holds only `{num_tokens}`")]
    CacheAheadOfHistory {
        history_size: usize,
        num_tokens: usize,
    },
}
