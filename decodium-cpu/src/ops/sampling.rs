//! CPU top-k / top-p sampling kernel.

use decodium::backend::{SamplingBuffers, SamplingOps};
use decodium::finished::FinishedState;
use decodium::io::{DecodingInputs, DecodingOutputs, StepDims};
use decodium::{Error, Result};
use rand::rngs::StdRng;
use rand::Rng;

use super::{
    argmax, check_runtime_logits, check_slots, f32_slice, f32_slice_mut, i32_slice, i32_slice_mut,
    log_normalizer, to_index, top_candidates, u8_slice_mut,
};
use crate::tensor::CpuTensor;
use crate::{CpuBackend, CpuRngState};

/// Fill `scratch` with the top-k candidates of `row`, weighted relative to
/// the best logit, and return how many survive the nucleus cut.
///
/// Returns `None` when the best logit is not finite; `scratch` then still
/// holds the ranked candidates.
fn nucleus(row: &[f32], k: usize, p: f32, scratch: &mut Vec<(usize, f32)>) -> Option<usize> {
    let limit = if k == 0 { row.len() } else { k };
    top_candidates(row, limit, scratch);
    let &(_, max) = scratch.first()?;
    if !max.is_finite() {
        return None;
    }
    for c in scratch.iter_mut() {
        c.1 = (c.1 - max).exp();
    }
    let total: f32 = scratch.iter().map(|c| c.1).sum();

    let mut keep = scratch.len();
    if p > 0.0 && p < 1.0 {
        let mut cumulative = 0.0f32;
        for (i, c) in scratch.iter().enumerate() {
            cumulative += c.1 / total;
            if cumulative >= p {
                keep = i + 1;
                break;
            }
        }
    }
    Some(keep)
}

/// Pick a token from `row` under a top-k / top-p restriction.
///
/// `k == 0 && p == 0` is greedy. `k == 0` alone keeps the whole vocabulary
/// before the nucleus cut. Top-p applies to the renormalized top-k mass.
pub(crate) fn select_token(
    row: &[f32],
    k: usize,
    p: f32,
    rng: &mut StdRng,
    scratch: &mut Vec<(usize, f32)>,
) -> usize {
    if k == 0 && p <= 0.0 {
        return argmax(row);
    }
    let Some(keep) = nucleus(row, k, p, scratch) else {
        return scratch.first().map_or(0, |c| c.0);
    };
    let kept = &scratch[..keep];
    let mass: f32 = kept.iter().map(|c| c.1).sum();
    let threshold = rng.gen::<f32>() * mass;
    let mut cumulative = 0.0f32;
    for &(idx, w) in kept {
        cumulative += w;
        if cumulative > threshold {
            return idx;
        }
    }
    kept[keep - 1].0
}

/// Log probability of `idx` under the renormalized candidate set that
/// [`select_token`] draws from. Greedy rows and fully masked rows fall back
/// to the full-vocabulary softmax.
pub(crate) fn truncated_log_prob(
    row: &[f32],
    idx: usize,
    k: usize,
    p: f32,
    scratch: &mut Vec<(usize, f32)>,
) -> f32 {
    let full = || {
        let (max, log_sum) = log_normalizer(row);
        row[idx] - max - log_sum
    };
    if k == 0 && p <= 0.0 {
        return full();
    }
    let Some(keep) = nucleus(row, k, p, scratch) else {
        return full();
    };
    let kept = &scratch[..keep];
    let mass: f32 = kept.iter().map(|c| c.1).sum();
    kept.iter()
        .find(|c| c.0 == idx)
        .map_or(f32::NEG_INFINITY, |c| (c.1 / mass).ln())
}

impl SamplingOps for CpuBackend {
    fn allocate_rng(max_batch_size: usize) -> Result<CpuRngState> {
        Ok(CpuRngState::new(max_batch_size))
    }

    fn seed_rng(state: &mut CpuRngState, batch_slots: &[usize], seeds: &[u64]) -> Result<()> {
        if seeds.len() != 1 && seeds.len() != batch_slots.len() {
            return Err(Error::InvalidConfig("random seed vector size mismatch".into()));
        }
        for (bi, &slot) in batch_slots.iter().enumerate() {
            if slot >= state.len() {
                return Err(Error::SlotOutOfRange {
                    slot,
                    max_batch_size: state.len(),
                });
            }
            let seed = if seeds.len() == 1 { seeds[0] } else { seeds[bi] };
            state.reseed(slot, seed);
        }
        Ok(())
    }

    fn sample_top_k_top_p(
        runtime_logits: &CpuTensor,
        rng: &mut CpuRngState,
        params: &mut SamplingBuffers<CpuTensor>,
        inputs: &DecodingInputs<'_, CpuTensor>,
        outputs: &mut DecodingOutputs<CpuTensor>,
        dims: &StepDims,
        compute_log_probs: bool,
    ) -> Result<()> {
        check_slots(inputs.batch_slots, dims)?;
        check_runtime_logits(runtime_logits, dims)?;
        if dims.beam_width != 1 || dims.tokens_per_step != 1 {
            return Err(Error::InvalidShape(format!(
                "top-k/top-p sampling takes one beam and one token per step, got {} and {}",
                dims.beam_width, dims.tokens_per_step
            )));
        }
        if rng.len() < dims.max_batch_size {
            return Err(Error::InvalidShape("rng state smaller than the batch".into()));
        }
        let (mb, vocab, vp, l) = (dims.max_batch_size, dims.vocab_size, dims.vocab_size_padded, dims.max_seq_len);

        let normalize = params.normalize_log_probs;
        let top_k = i32_slice(&params.top_k, mb, "top k")?;
        let initial_top_p = f32_slice(&params.initial_top_p, mb, "initial top p")?;
        let decay = f32_slice(&params.top_p_decay, mb, "top p decay")?;
        let floor = f32_slice(&params.top_p_min, mb, "top p min")?;
        let reset_ids = i32_slice(&params.top_p_reset_ids, mb, "top p reset ids")?;
        let top_p = f32_slice_mut(&mut params.top_p, mb, "top p")?;

        let end_ids = i32_slice(inputs.end_ids, mb, "end ids")?;
        let logits = runtime_logits.as_f32_slice();
        let output_ids = i32_slice_mut(&mut outputs.output_ids, mb * l, "output ids")?;
        let parent_ids = i32_slice_mut(&mut outputs.parent_ids, mb * l, "parent ids")?;
        let seq_lens = i32_slice_mut(&mut outputs.sequence_lengths, mb, "sequence lengths")?;
        let finished = u8_slice_mut(&mut outputs.finished, mb, "finished")?;
        let new_tokens = i32_slice_mut(&mut outputs.new_tokens, mb, "new tokens")?;
        let mut cum_log_probs = outputs
            .cum_log_probs
            .as_mut()
            .map(|t| f32_slice_mut(t, mb, "cum log probs"))
            .transpose()?;
        let mut output_log_probs = outputs
            .output_log_probs
            .as_mut()
            .map(|t| f32_slice_mut(t, mb * l, "output log probs"))
            .transpose()?;

        let mut scratch = Vec::new();
        for (bi, &slot) in inputs.batch_slots.iter().enumerate() {
            let end_id = end_ids[slot];
            let state = FinishedState::from_bits(finished[slot]);
            let seq_len = to_index(seq_lens[slot]).unwrap_or(0);
            if state.is_finished() || state.is_skip_decoding() || seq_len >= l {
                new_tokens[slot] = end_id;
                continue;
            }

            let row = &logits[bi * vp..bi * vp + vocab];
            let k = to_index(top_k[slot]).unwrap_or(0);
            let idx = select_token(row, k, top_p[slot], rng.slot_mut(slot), &mut scratch);
            let token = super::to_i32(idx)?;
            let log_prob = if !compute_log_probs {
                0.0
            } else if normalize {
                truncated_log_prob(row, idx, k, top_p[slot], &mut scratch)
            } else {
                let (max, log_sum) = log_normalizer(row);
                row[idx] - max - log_sum
            };

            let pos = slot * l + seq_len;
            output_ids[pos] = token;
            parent_ids[pos] = 0;
            new_tokens[slot] = token;
            if let Some(lp) = output_log_probs.as_deref_mut() {
                lp[pos] = log_prob;
            }
            if let Some(cum) = cum_log_probs.as_deref_mut() {
                cum[slot] += log_prob;
            }
            if token == end_id {
                finished[slot] = (state | FinishedState::END_ID).bits();
            } else {
                seq_lens[slot] += 1;
            }

            if initial_top_p[slot] > 0.0 {
                top_p[slot] = if reset_ids[slot] >= 0 && token == reset_ids[slot] {
                    initial_top_p[slot]
                } else {
                    (top_p[slot] * decay[slot]).max(floor[slot])
                };
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::tests_util::{dims, outputs_with_history};
    use approx::assert_relative_eq;
    use decodium::dtype::DType;
    use decodium::io::LogitsView;
    use rand::SeedableRng;

    fn buffers(top_k: &[i32], top_p: &[f32]) -> SamplingBuffers<CpuTensor> {
        let n = top_k.len();
        SamplingBuffers {
            top_k: CpuTensor::from_i32(&[n], top_k),
            top_p: CpuTensor::from_f32(&[n], top_p),
            initial_top_p: CpuTensor::from_f32(&[n], top_p),
            top_p_decay: CpuTensor::from_f32(&[n], &vec![1.0; n]),
            top_p_min: CpuTensor::from_f32(&[n], &vec![1e-6; n]),
            top_p_reset_ids: CpuTensor::from_i32(&[n], &vec![-1; n]),
            normalize_log_probs: false,
        }
    }

    fn step(
        logits: &[f32],
        params: &mut SamplingBuffers<CpuTensor>,
        rng: &mut CpuRngState,
        outputs: &mut DecodingOutputs<CpuTensor>,
        d: &StepDims,
        end_id: i32,
    ) {
        let runtime = CpuTensor::from_f32(&[d.batch_size, 1, 1, d.vocab_size_padded], logits);
        let end_ids = CpuTensor::from_i32(&[d.max_batch_size], &vec![end_id; d.max_batch_size]);
        let slots: Vec<usize> = (0..d.batch_size).collect();
        let inputs = DecodingInputs::new(0, LogitsView::Dense(&runtime), &slots, &end_ids);
        CpuBackend::sample_top_k_top_p(&runtime, rng, params, &inputs, outputs, d, true).unwrap();
    }

    #[test]
    fn test_greedy_lowest_id_on_tie() {
        let mut out = Vec::new();
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(select_token(&[0.1, 0.7, 0.7, 0.2], 0, 0.0, &mut rng, &mut out), 1);
    }

    #[test]
    fn test_top_k_stays_in_candidates() {
        let row = [0.0, 0.0, 0.0, 0.0, 0.4f32.ln(), 0.3f32.ln(), 0.2f32.ln(), 0.1f32.ln(), 0.0];
        let mut out = Vec::new();
        for seed in 0..64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let token = select_token(&row[..8], 2, 0.0, &mut rng, &mut out);
            assert!(token == 4 || token == 5, "token {token}");
        }
    }

    #[test]
    fn test_top_p_cut() {
        // Probabilities .5/.3/.2: p = .6 keeps the first two.
        let row = [0.5f32.ln(), 0.3f32.ln(), 0.2f32.ln()];
        let mut out = Vec::new();
        for seed in 0..64 {
            let mut rng = StdRng::seed_from_u64(seed);
            assert_ne!(select_token(&row, 0, 0.6, &mut rng, &mut out), 2);
        }
    }

    #[test]
    fn test_all_masked_row_is_deterministic() {
        let mut out = Vec::new();
        let mut rng = StdRng::seed_from_u64(3);
        let row = [f32::NEG_INFINITY; 4];
        assert_eq!(select_token(&row, 2, 0.5, &mut rng, &mut out), 0);
    }

    #[test]
    fn test_step_appends_and_tracks_log_probs() {
        let d = dims(2, 1, 4, 4, 6);
        let mut outputs = outputs_with_history(&d, &[&[1], &[1]]);
        outputs.cum_log_probs = Some(CpuTensor::zeros(&[2, 1], DType::F32));
        outputs.output_log_probs = Some(CpuTensor::zeros(&[2, 1, 6], DType::F32));
        let mut params = buffers(&[0, 0], &[0.0, 0.0]);
        let mut rng = CpuBackend::allocate_rng(2).unwrap();
        let logits = [0.0, 2.0, 1.0, 0.0, 0.0, 0.0, 0.0, 3.0];
        step(&logits, &mut params, &mut rng, &mut outputs, &d, 3);

        assert_eq!(outputs.new_tokens.as_i32_slice(), &[1, 3]);
        assert_eq!(outputs.sequence_lengths.as_i32_slice(), &[2, 1]);
        assert_eq!(outputs.output_ids.as_i32_slice()[1], 1);
        assert_eq!(outputs.output_ids.as_i32_slice()[6 + 1], 3);
        let finished = outputs.finished.as_u8_slice();
        assert!(!FinishedState::from_bits(finished[0]).is_finished());
        assert!(FinishedState::from_bits(finished[1]).is_finished_end_id());

        let (max, lse) = log_normalizer(&logits[..4]);
        let cum = outputs.cum_log_probs.as_ref().unwrap().as_f32_slice();
        assert_relative_eq!(cum[0], 2.0 - max - lse, epsilon = 1e-6);
    }

    #[test]
    fn test_truncated_log_prob() {
        let row = [0.4f32.ln(), 0.3f32.ln(), 0.2f32.ln(), 0.1f32.ln()];
        let mut out = Vec::new();
        assert_relative_eq!(truncated_log_prob(&row, 1, 2, 0.0, &mut out), (0.3f32 / 0.7).ln(), epsilon = 1e-5);
        assert_relative_eq!(truncated_log_prob(&row, 0, 0, 0.6, &mut out), (0.4f32 / 0.7).ln(), epsilon = 1e-5);
        assert_eq!(truncated_log_prob(&row, 3, 2, 0.0, &mut out), f32::NEG_INFINITY);
        // Greedy keeps the full vocabulary.
        assert_relative_eq!(truncated_log_prob(&row, 0, 0, 0.0, &mut out), 0.4f32.ln(), epsilon = 1e-5);
    }

    #[test]
    fn test_normalized_log_probs_use_kept_mass() {
        let d = dims(1, 1, 4, 4, 6);
        let logits = [0.6f32.ln(), 0.2f32.ln(), 0.1f32.ln(), 0.1f32.ln()];
        let run = |normalize: bool| {
            let mut outputs = outputs_with_history(&d, &[&[1]]);
            outputs.cum_log_probs = Some(CpuTensor::zeros(&[1, 1], DType::F32));
            let mut params = buffers(&[1], &[0.0]);
            params.normalize_log_probs = normalize;
            let mut rng = CpuBackend::allocate_rng(1).unwrap();
            step(&logits, &mut params, &mut rng, &mut outputs, &d, 3);
            assert_eq!(outputs.new_tokens.as_i32_slice(), &[0]);
            outputs.cum_log_probs.unwrap().as_f32_slice()[0]
        };
        assert_relative_eq!(run(false), 0.6f32.ln(), epsilon = 1e-5);
        assert_relative_eq!(run(true), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_finished_slot_emits_end_id() {
        let d = dims(1, 1, 4, 4, 6);
        let mut outputs = outputs_with_history(&d, &[&[1, 2]]);
        outputs.finished = CpuTensor::from_u8(&[1, 1], &[FinishedState::END_ID.bits()]);
        let mut params = buffers(&[0], &[0.0]);
        let mut rng = CpuBackend::allocate_rng(1).unwrap();
        step(&[0.0, 5.0, 0.0, 0.0], &mut params, &mut rng, &mut outputs, &d, 3);
        assert_eq!(outputs.new_tokens.as_i32_slice(), &[3]);
        assert_eq!(outputs.sequence_lengths.as_i32_slice(), &[2]);
    }

    #[test]
    fn test_top_p_decay_and_reset() {
        let d = dims(1, 1, 4, 4, 8);
        let mut outputs = outputs_with_history(&d, &[&[]]);
        let mut params = buffers(&[1], &[0.8]);
        params.top_p_decay = CpuTensor::from_f32(&[1], &[0.5]);
        params.top_p_min = CpuTensor::from_f32(&[1], &[0.3]);
        params.top_p_reset_ids = CpuTensor::from_i32(&[1], &[2]);
        let mut rng = CpuBackend::allocate_rng(1).unwrap();

        step(&[5.0, 0.0, 0.0, 0.0], &mut params, &mut rng, &mut outputs, &d, 3);
        assert_relative_eq!(params.top_p.as_f32_slice()[0], 0.4);
        step(&[5.0, 0.0, 0.0, 0.0], &mut params, &mut rng, &mut outputs, &d, 3);
        assert_relative_eq!(params.top_p.as_f32_slice()[0], 0.3);
        step(&[0.0, 0.0, 5.0, 0.0], &mut params, &mut rng, &mut outputs, &d, 3);
        assert_relative_eq!(params.top_p.as_f32_slice()[0], 0.8);
    }

    #[test]
    fn test_seed_vector_size_mismatch() {
        let mut rng = CpuBackend::allocate_rng(4).unwrap();
        let err = CpuBackend::seed_rng(&mut rng, &[0, 1, 2], &[1, 2]).unwrap_err();
        assert!(err.to_string().contains("random seed vector size mismatch"));
        CpuBackend::seed_rng(&mut rng, &[0, 1, 2], &[7]).unwrap();
        assert!(CpuBackend::seed_rng(&mut rng, &[4], &[7]).is_err());
    }

    #[test]
    fn test_same_seed_same_tokens() {
        let row: Vec<f32> = (0..16u8).map(|i| f32::from(i) * 0.1).collect();
        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..8).map(|_| select_token(&row, 0, 0.9, &mut rng, &mut Vec::new())).collect::<Vec<_>>()
        };
        assert_eq!(draw(11), draw(11));
    }
}
