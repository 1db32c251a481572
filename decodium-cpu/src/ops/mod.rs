//! CPU implementations of the decoding op traits.

pub mod ban_words;
pub mod beam_search;
pub mod history;
pub mod kv_cache;
pub mod medusa;
pub mod penalty;
pub mod sampling;
pub mod stop_criteria;
pub mod tensor_data;

use std::cmp::Ordering;

use decodium::dtype::DType;
use decodium::io::{LogitsView, StepDims};
use decodium::tensor::Tensor;
use decodium::{Error, Result};

use crate::tensor::CpuTensor;

/// Value used to mask a vocabulary entry out of every distribution.
pub(crate) const MASKED_LOGIT: f32 = f32::MIN;

/// Convert a stored id or length to an index, rejecting negatives.
pub(crate) fn to_index(value: i32) -> Option<usize> {
    usize::try_from(value).ok()
}

pub(crate) use decodium::tensor::i32_from_index as to_i32;

pub(crate) fn check_slots(batch_slots: &[usize], dims: &StepDims) -> Result<()> {
    if batch_slots.len() != dims.batch_size {
        return Err(Error::InvalidShape(format!(
            "{} batch slots for batch size {}",
            batch_slots.len(),
            dims.batch_size
        )));
    }
    match batch_slots.iter().find(|&&s| s >= dims.max_batch_size) {
        Some(&slot) => Err(Error::SlotOutOfRange {
            slot,
            max_batch_size: dims.max_batch_size,
        }),
        None => Ok(()),
    }
}

pub(crate) fn f32_slice<'a>(t: &'a CpuTensor, min: usize, what: &str) -> Result<&'a [f32]> {
    t.check_dtype(DType::F32)?;
    t.check_min_numel(min, what)?;
    Ok(t.as_f32_slice())
}

pub(crate) fn i32_slice<'a>(t: &'a CpuTensor, min: usize, what: &str) -> Result<&'a [i32]> {
    t.check_dtype(DType::I32)?;
    t.check_min_numel(min, what)?;
    Ok(t.as_i32_slice())
}

pub(crate) fn u8_slice<'a>(t: &'a CpuTensor, min: usize, what: &str) -> Result<&'a [u8]> {
    t.check_dtype(DType::U8)?;
    t.check_min_numel(min, what)?;
    Ok(t.as_u8_slice())
}

pub(crate) fn f32_slice_mut<'a>(t: &'a mut CpuTensor, min: usize, what: &str) -> Result<&'a mut [f32]> {
    t.check_dtype(DType::F32)?;
    t.check_min_numel(min, what)?;
    Ok(t.as_f32_slice_mut())
}

pub(crate) fn i32_slice_mut<'a>(t: &'a mut CpuTensor, min: usize, what: &str) -> Result<&'a mut [i32]> {
    t.check_dtype(DType::I32)?;
    t.check_min_numel(min, what)?;
    Ok(t.as_i32_slice_mut())
}

pub(crate) fn u8_slice_mut<'a>(t: &'a mut CpuTensor, min: usize, what: &str) -> Result<&'a mut [u8]> {
    t.check_dtype(DType::U8)?;
    t.check_min_numel(min, what)?;
    Ok(t.as_u8_slice_mut())
}

/// Check that the runtime workspace covers the step.
pub(crate) fn check_runtime_logits(runtime_logits: &CpuTensor, dims: &StepDims) -> Result<()> {
    runtime_logits.check_dtype(DType::F32)?;
    runtime_logits.check_min_numel(dims.batch_size * dims.logits_stride(), "runtime logits")
}

/// Copy `logits` into `dst` (`[batch, TPS, BW, VP]`), casting half types.
pub(crate) fn copy_logits(logits: LogitsView<'_, CpuTensor>, dst: &mut [f32], dims: &StepDims) -> Result<()> {
    let shape = logits.shape()?;
    if shape.batch_size != dims.batch_size
        || shape.tokens_per_step != dims.tokens_per_step
        || shape.beam_width != dims.beam_width
        || shape.vocab_size_padded != dims.vocab_size_padded
    {
        return Err(Error::ShapeMismatch {
            expected: vec![
                dims.batch_size,
                dims.tokens_per_step,
                dims.beam_width,
                dims.vocab_size_padded,
            ],
            got: vec![
                shape.batch_size,
                shape.tokens_per_step,
                shape.beam_width,
                shape.vocab_size_padded,
            ],
        });
    }
    let stride = shape.request_stride();
    let dst = &mut dst[..shape.batch_size * stride];
    match logits {
        LogitsView::Dense(t) => t.copy_to_f32(dst),
        LogitsView::Ragged(ts) => {
            for (t, rows) in ts.iter().zip(dst.chunks_mut(stride)) {
                t.copy_to_f32(rows)?;
            }
            Ok(())
        }
    }
}

/// Descending by value, ties to the lower id. NaN sorts last.
pub(crate) fn rank_desc(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    let key = |v: f32| if v.is_nan() { f32::NEG_INFINITY } else { v };
    key(b.1).total_cmp(&key(a.1)).then(a.0.cmp(&b.0))
}

/// The `k` best entries of `row` in rank order.
pub(crate) fn top_candidates(row: &[f32], k: usize, out: &mut Vec<(usize, f32)>) {
    out.clear();
    out.extend(row.iter().copied().enumerate());
    let k = k.min(out.len());
    if k == 0 {
        out.clear();
        return;
    }
    if k < out.len() {
        out.select_nth_unstable_by(k - 1, rank_desc);
        out.truncate(k);
    }
    out.sort_unstable_by(rank_desc);
}

/// Index of the best entry, ties to the lower id.
pub(crate) fn argmax(row: &[f32]) -> usize {
    let mut best = 0;
    for i in 1..row.len() {
        if rank_desc(&(i, row[i]), &(best, row[best])) == Ordering::Less {
            best = i;
        }
    }
    best
}

/// `(max, ln(sum(exp(x - max))))` over `row`.
///
/// A row with no finite entry yields a zero normalizer so that callers see
/// a degenerate but finite distribution.
pub(crate) fn log_normalizer(row: &[f32]) -> (f32, f32) {
    let max = row.iter().copied().filter(|v| !v.is_nan()).fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return (0.0, 0.0);
    }
    let sum: f32 = row.iter().filter(|v| !v.is_nan()).map(|&v| (v - max).exp()).sum();
    (max, sum.ln())
}

/// Write `log_softmax(row)` into `out`.
pub(crate) fn log_softmax_into(row: &[f32], out: &mut Vec<f32>) {
    let (max, log_sum) = log_normalizer(row);
    out.clear();
    out.extend(row.iter().map(|&v| v - max - log_sum));
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_top_candidates_order_and_ties() {
        let mut out = Vec::new();
        top_candidates(&[0.1, 0.5, 0.5, f32::NAN, 0.2], 3, &mut out);
        let ids: Vec<usize> = out.iter().map(|c| c.0).collect();
        assert_eq!(ids, vec![1, 2, 4]);
    }

    #[test]
    fn test_top_candidates_k_larger_than_row() {
        let mut out = Vec::new();
        top_candidates(&[1.0, 2.0], 5, &mut out);
        assert_eq!(out.iter().map(|c| c.0).collect::<Vec<_>>(), vec![1, 0]);
    }

    #[test]
    fn test_argmax_lowest_id_on_tie() {
        assert_eq!(argmax(&[0.0, 3.0, 3.0, 1.0]), 1);
        assert_eq!(argmax(&[MASKED_LOGIT, MASKED_LOGIT]), 0);
    }

    #[test]
    fn test_log_softmax_sums_to_one() {
        let mut out = Vec::new();
        log_softmax_into(&[1.0, 2.0, 3.0], &mut out);
        let total: f32 = out.iter().map(|v| v.exp()).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_copy_ragged_matches_dense() {
        let dims = StepDims {
            batch_size: 2,
            max_batch_size: 4,
            beam_width: 1,
            tokens_per_step: 1,
            vocab_size: 3,
            vocab_size_padded: 3,
            max_seq_len: 8,
        };
        let dense = CpuTensor::from_f32(&[2, 1, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let ragged = [
            CpuTensor::from_f32_as_bf16(&[1, 3], &[1.0, 2.0, 3.0]),
            CpuTensor::from_f32(&[1, 1, 3], &[4.0, 5.0, 6.0]),
        ];
        let mut a = vec![0.0; 6];
        let mut b = vec![0.0; 6];
        copy_logits(LogitsView::Dense(&dense), &mut a, &dims).unwrap();
        copy_logits(LogitsView::Ragged(&ragged), &mut b, &dims).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_check_slots_out_of_range() {
        let dims = StepDims {
            batch_size: 1,
            max_batch_size: 2,
            beam_width: 1,
            tokens_per_step: 1,
            vocab_size: 3,
            vocab_size_padded: 3,
            max_seq_len: 8,
        };
        assert!(matches!(
            check_slots(&[2], &dims),
            Err(Error::SlotOutOfRange { slot: 2, .. })
        ));
    }
}
