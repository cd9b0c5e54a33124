use candle_core::Tensor;
use thiserror::Error;

/// Recomputes the position-id tensor from the current attention mask.
///
/// The mask has one row per active hypothesis and one column per position
/// generated so far, where the trailing column stands for the not-yet-appended
/// new token slot. The position id of a row is therefore the number of real
/// tokens in that row *excluding* the trailing column: how many tokens precede
/// the position being generated, not counting the slot being filled.
///
/// Returns a `(rows, 1)` tensor of `i64` position ids. Fails if the mask has
/// no columns.
pub fn update_position_ids(attention_mask: &Tensor) -> Result<Tensor, BeamStateError> {
    let (num_rows, num_cols) = attention_mask.dims2()?;
    if num_cols < 1 {
        return Err(BeamStateError::EmptyMask);
    }

    let mask = attention_mask.to_vec2::<i64>()?;
    let position_ids: Vec<i64> = mask
        .iter()
        .map(|row| row[..num_cols - 1].iter().sum())
        .collect();

    Ok(Tensor::from_vec(
        position_ids,
        (num_rows, 1),
        attention_mask.device(),
    )?)
}

/// Rebuilds the attention mask after a beam reordering.
///
/// `next_beams` has one entry per row of the *new* batch, naming the source
/// row of the previous mask whose state that row continues. Row `r` of the
/// result is a copy of previous row `next_beams[r]` with an appended 1: the
/// new token is always real.
///
/// The result is a fresh tensor, never an alias of the input: the mapping may
/// duplicate a source row (a hypothesis forked) or omit one (a hypothesis was
/// pruned), which an in-place update cannot express. Fails if any entry
/// addresses a row the previous mask does not have.
pub fn update_attention_mask_with_beams(
    attention_mask: &Tensor,
    next_beams: &[u32],
) -> Result<Tensor, BeamStateError> {
    let (num_rows, num_cols) = attention_mask.dims2()?;
    let mask = attention_mask.to_vec2::<i64>()?;

    let mut new_mask = Vec::with_capacity(next_beams.len() * (num_cols + 1));
    for &beam_id in next_beams {
        let source_row = mask
            .get(beam_id as usize)
            .ok_or(BeamStateError::BeamIndexOutOfRange {
                index: beam_id,
                num_rows,
            })?;
        new_mask.extend_from_slice(source_row);
        new_mask.push(1);
    }

    Ok(Tensor::from_vec(
        new_mask,
        (next_beams.len(), num_cols + 1),
        attention_mask.device(),
    )?)
}

#[derive(Debug, Error)]
pub enum BeamStateError {
    #[error("Candle error: `{0}`")]
    CandleError(#[from] candle_core::Error),
    #[error("Attention mask has no columns")]
    EmptyMask,
    #[error("Beam index `{index}` out of range for previous batch of `{num_rows}` rows")]
    BeamIndexOutOfRange { index: u32, num_rows: usize },
}
