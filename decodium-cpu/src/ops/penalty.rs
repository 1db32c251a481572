//! CPU penalty kernel.

use decodium::backend::{PenaltyBuffers, PenaltyOps};
use decodium::io::{DecodingInputs, DecodingOutputs, LogitsView, StepDims};
use decodium::{Error, Result};
use rayon::prelude::*;

use super::history::Lineage;
use super::{
    check_runtime_logits, check_slots, copy_logits, f32_slice, i32_slice, i32_slice_mut, to_index, MASKED_LOGIT,
};
use crate::tensor::CpuTensor;
use crate::CpuBackend;

/// Penalty values resolved for one slot.
#[derive(Debug, Clone, Copy)]
struct RowPenalties {
    inv_temperature: Option<f32>,
    repetition: f32,
    presence: f32,
    frequency: f32,
}

impl RowPenalties {
    #[allow(clippy::float_cmp)]
    fn uses_counts(&self) -> bool {
        self.repetition != 1.0 || self.presence != 0.0 || self.frequency != 0.0
    }
}

fn optional_f32<'a>(t: Option<&'a CpuTensor>, mb: usize, what: &str) -> Result<Option<&'a [f32]>> {
    t.map(|t| f32_slice(t, mb, what)).transpose()
}

/// Apply bias, temperature and the occurrence penalties to one row, then
/// mask the end id if requested and every padded entry.
#[allow(clippy::cast_precision_loss, clippy::float_cmp)]
fn penalize_row(
    row: &mut [f32],
    vocab_size: usize,
    bias: Option<&[f32]>,
    p: RowPenalties,
    counts: Option<&[i32]>,
    masked_end_id: Option<usize>,
) {
    let (live, padded) = row.split_at_mut(vocab_size);
    for (v, logit) in live.iter_mut().enumerate() {
        let mut x = *logit;
        if let Some(bias) = bias {
            x += bias[v];
        }
        if let Some(inv_t) = p.inv_temperature {
            x *= inv_t;
        }
        if let Some(count) = counts.map(|c| c[v]).filter(|&c| c > 0) {
            if p.repetition != 1.0 {
                x = if x > 0.0 { x / p.repetition } else { x * p.repetition };
            }
            x -= p.presence;
            x -= p.frequency * count as f32;
        }
        *logit = x;
    }
    if let Some(end) = masked_end_id.filter(|&e| e < vocab_size) {
        live[end] = MASKED_LOGIT;
    }
    padded.fill(MASKED_LOGIT);
}

impl PenaltyOps for CpuBackend {
    fn apply_penalties(
        logits: LogitsView<'_, CpuTensor>,
        runtime_logits: &mut CpuTensor,
        occurrences: &mut CpuTensor,
        penalties: &PenaltyBuffers<CpuTensor>,
        inputs: &DecodingInputs<'_, CpuTensor>,
        outputs: &DecodingOutputs<CpuTensor>,
        dims: &StepDims,
    ) -> Result<()> {
        check_slots(inputs.batch_slots, dims)?;
        check_runtime_logits(runtime_logits, dims)?;
        let mb = dims.max_batch_size;
        let bw = dims.beam_width;
        let vocab = dims.vocab_size;
        let vp = dims.vocab_size_padded;
        let max_seq_len = dims.max_seq_len;
        let stride = dims.logits_stride();

        let occurrences = i32_slice_mut(occurrences, dims.batch_size * bw * vocab, "occurrence workspace")?;

        let temperatures = optional_f32(penalties.temperatures.as_ref(), mb, "temperatures")?;
        let repetition = optional_f32(penalties.repetition_penalties.as_ref(), mb, "repetition penalties")?;
        let presence = optional_f32(penalties.presence_penalties.as_ref(), mb, "presence penalties")?;
        let frequency = optional_f32(penalties.frequency_penalties.as_ref(), mb, "frequency penalties")?;
        let min_lengths = penalties
            .min_lengths
            .as_ref()
            .map(|t| i32_slice(t, mb, "min lengths"))
            .transpose()?;

        let bias = inputs.embedding_bias.map(CpuTensor::to_f32_vec).transpose()?;
        if bias.as_ref().is_some_and(|b| b.len() < mb * vp) {
            return Err(Error::InvalidShape(format!(
                "embedding bias must cover [{mb}, {vp}]"
            )));
        }
        let end_ids = i32_slice(inputs.end_ids, mb, "end ids")?;
        let input_lengths = inputs
            .input_lengths
            .map(|t| i32_slice(t, mb * bw, "input lengths"))
            .transpose()?;
        let seq_lens = i32_slice(&outputs.sequence_lengths, mb * bw, "sequence lengths")?;
        let output_ids = i32_slice(&outputs.output_ids, mb * bw * max_seq_len, "output ids")?;
        let parent_ids = i32_slice(&outputs.parent_ids, mb * bw * max_seq_len, "parent ids")?;

        let runtime = runtime_logits.as_f32_slice_mut();
        copy_logits(logits, runtime, dims)?;

        let batch = dims.batch_size;
        let slots = inputs.batch_slots;
        runtime[..batch * stride]
            .par_chunks_mut(stride)
            .zip(occurrences[..batch * bw * vocab].par_chunks_mut(bw * vocab))
            .enumerate()
            .for_each(|(bi, (rows, counts))| {
                let slot = slots[bi];
                let p = RowPenalties {
                    inv_temperature: temperatures.map(|t| 1.0 / (t[slot] + 1e-6)),
                    repetition: repetition.map_or(1.0, |r| r[slot]),
                    presence: presence.map_or(0.0, |r| r[slot]),
                    frequency: frequency.map_or(0.0, |r| r[slot]),
                };
                let bias_row = bias.as_deref().map(|b| &b[slot * vp..slot * vp + vocab]);
                let block = slot * bw * max_seq_len..(slot + 1) * bw * max_seq_len;

                for (beam, beam_counts) in counts.chunks_mut(vocab).enumerate() {
                    let seq_len = to_index(seq_lens[slot * bw + beam]).unwrap_or(0);
                    let counted = if p.uses_counts() {
                        beam_counts.fill(0);
                        let history = Lineage::new(
                            &output_ids[block.clone()],
                            &parent_ids[block.clone()],
                            bw,
                            max_seq_len,
                            beam,
                            seq_len,
                        );
                        for token in history.filter_map(to_index).filter(|&t| t < vocab) {
                            beam_counts[token] += 1;
                        }
                        Some(&*beam_counts)
                    } else {
                        None
                    };

                    let input_len =
                        input_lengths.map_or(0, |l| to_index(l[slot * bw + beam]).unwrap_or(0));
                    let generated = seq_len.saturating_sub(input_len);
                    let masked_end_id = min_lengths
                        .and_then(|m| to_index(m[slot]))
                        .filter(|&min_len| generated < min_len)
                        .and_then(|_| to_index(end_ids[slot]));

                    for t in 0..dims.tokens_per_step {
                        let start = (t * bw + beam) * vp;
                        penalize_row(&mut rows[start..start + vp], vocab, bias_row, p, counted, masked_end_id);
                    }
                }
            });
        log::trace!("penalties applied to {batch} requests");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::tests_util::{dims, outputs_with_history};
    use decodium::dtype::DType;
    use approx::assert_relative_eq;

    fn no_penalties() -> PenaltyBuffers<CpuTensor> {
        PenaltyBuffers {
            temperatures: None,
            repetition_penalties: None,
            presence_penalties: None,
            frequency_penalties: None,
            min_lengths: None,
        }
    }

    fn run(
        logits: &CpuTensor,
        penalties: &PenaltyBuffers<CpuTensor>,
        history: &[&[i32]],
        end_id: i32,
        input_len: Option<i32>,
    ) -> Vec<f32> {
        let d = dims(history.len(), 1, 4, 5, 8);
        let outputs = outputs_with_history(&d, history);
        let slots: Vec<usize> = (0..history.len()).collect();
        let end_ids = CpuTensor::from_i32(&[d.max_batch_size], &vec![end_id; d.max_batch_size]);
        let lens = input_len.map(|l| CpuTensor::from_i32(&[d.max_batch_size], &vec![l; d.max_batch_size]));
        let mut inputs = DecodingInputs::new(0, LogitsView::Dense(logits), &slots, &end_ids);
        inputs.input_lengths = lens.as_ref();
        let mut runtime = CpuTensor::zeros(&[d.batch_size, 1, 1, 5], DType::F32);
        let mut occ = CpuTensor::zeros(&[d.batch_size * 4], DType::I32);
        CpuBackend::apply_penalties(
            LogitsView::Dense(logits),
            &mut runtime,
            &mut occ,
            penalties,
            &inputs,
            &outputs,
            &d,
        )
        .unwrap();
        runtime.as_f32_slice().to_vec()
    }

    #[test]
    fn test_copy_masks_padding() {
        let logits = CpuTensor::from_f32(&[1, 1, 5], &[1.0, 2.0, 3.0, 4.0, 9.0]);
        let out = run(&logits, &no_penalties(), &[&[]], 0, None);
        assert_eq!(&out[..4], &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(out[4], MASKED_LOGIT);
        // The caller's tensor is untouched.
        assert_eq!(logits.as_f32_slice()[4], 9.0);
    }

    #[test]
    fn test_repetition_sign_rule() {
        let logits = CpuTensor::from_f32(&[1, 1, 5], &[2.0, -2.0, 1.0, 1.0, 0.0]);
        let mut p = no_penalties();
        p.repetition_penalties = Some(CpuTensor::from_f32(&[1], &[2.0]));
        let out = run(&logits, &p, &[&[0, 1]], 3, None);
        assert_relative_eq!(out[0], 1.0);
        assert_relative_eq!(out[1], -4.0);
        assert_relative_eq!(out[2], 1.0);
    }

    #[test]
    fn test_presence_and_frequency_use_counts() {
        let logits = CpuTensor::from_f32(&[1, 1, 5], &[0.0; 5]);
        let mut p = no_penalties();
        p.presence_penalties = Some(CpuTensor::from_f32(&[1], &[0.5]));
        p.frequency_penalties = Some(CpuTensor::from_f32(&[1], &[0.25]));
        let out = run(&logits, &p, &[&[2, 2, 2, 1]], 3, None);
        assert_relative_eq!(out[0], 0.0);
        assert_relative_eq!(out[1], -0.75);
        assert_relative_eq!(out[2], -1.25);
    }

    #[test]
    fn test_temperature_scales_before_repetition() {
        let logits = CpuTensor::from_f32(&[1, 1, 5], &[4.0, 4.0, 0.0, 0.0, 0.0]);
        let mut p = no_penalties();
        p.temperatures = Some(CpuTensor::from_f32(&[1], &[2.0]));
        p.repetition_penalties = Some(CpuTensor::from_f32(&[1], &[2.0]));
        let out = run(&logits, &p, &[&[1]], 3, None);
        assert_relative_eq!(out[0], 2.0, epsilon = 1e-5);
        assert_relative_eq!(out[1], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_min_length_masks_end_id_until_reached() {
        let logits = CpuTensor::from_f32(&[2, 1, 5], &[1.0; 10]);
        let mut p = no_penalties();
        p.min_lengths = Some(CpuTensor::from_i32(&[2], &[2, 2]));
        // Prompt length 1: the first request has generated one token, the
        // second two.
        let out = run(&logits, &p, &[&[0, 1], &[0, 1, 2]], 3, Some(1));
        assert_eq!(out[3], MASKED_LOGIT);
        assert_relative_eq!(out[5 + 3], 1.0);
    }
}
