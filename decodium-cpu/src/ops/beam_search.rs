//! CPU beam search kernels.

use std::cmp::Ordering;

use decodium::backend::{BeamSearchBuffers, BeamSearchOps};
use decodium::finished::FinishedState;
use decodium::io::{
    BeamHypotheses, DecodingInputs, DecodingOutputs, GatheredBeams, StepDims, DEAD_BEAM_LOG_PROB,
};
use decodium::{Error, Result};

use super::history::source_rows;
use super::{
    check_runtime_logits, check_slots, f32_slice, f32_slice_mut, i32_slice, i32_slice_mut, log_softmax_into,
    to_i32, to_index, top_candidates, u8_slice, u8_slice_mut,
};
use crate::tensor::CpuTensor;
use crate::CpuBackend;

/// Score of a finished sequence: `cum / gen_len ^ length_penalty`.
#[allow(clippy::cast_precision_loss, clippy::float_cmp)]
#[must_use]
pub fn length_normalized(cum_log_prob: f32, generated_len: usize, length_penalty: f32) -> f32 {
    if length_penalty == 0.0 {
        cum_log_prob
    } else {
        cum_log_prob / (generated_len.max(1) as f32).powf(length_penalty)
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    score: f32,
    cum: f32,
    log_prob: f32,
    token: usize,
    parent: usize,
}

fn by_score(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.parent.cmp(&b.parent))
        .then(a.token.cmp(&b.token))
}

fn missing(what: &str) -> Error {
    Error::InvalidConfig(format!("beam search requires {what}"))
}

/// Mutable views of the hypothesis store.
struct Hypotheses<'a> {
    ids: &'a mut [i32],
    log_probs: &'a mut [f32],
    seq_lens: &'a mut [i32],
    cum: &'a mut [f32],
    normed: &'a mut [f32],
    num: &'a mut [i32],
    min_normed: &'a mut [f32],
    is_done: &'a mut [u8],
    beam_width: usize,
}

impl<'a> Hypotheses<'a> {
    fn new(h: &'a mut BeamHypotheses<CpuTensor>, dims: &StepDims) -> Result<Self> {
        let (mb, bw, l) = (dims.max_batch_size, dims.beam_width, dims.max_seq_len);
        Ok(Self {
            ids: i32_slice_mut(&mut h.output_ids, mb * bw * l, "hypothesis ids")?,
            log_probs: f32_slice_mut(&mut h.log_probs, mb * bw * l, "hypothesis log probs")?,
            seq_lens: i32_slice_mut(&mut h.sequence_lengths, mb * bw, "hypothesis lengths")?,
            cum: f32_slice_mut(&mut h.cum_log_probs, mb * bw, "hypothesis cum log probs")?,
            normed: f32_slice_mut(&mut h.normed_scores, mb * bw, "hypothesis scores")?,
            num: i32_slice_mut(&mut h.num_beams, mb, "hypothesis counts")?,
            min_normed: f32_slice_mut(&mut h.min_normed_scores, mb, "hypothesis min scores")?,
            is_done: u8_slice_mut(&mut h.is_done, mb, "hypothesis done flags")?,
            beam_width: bw,
        })
    }

    fn count(&self, slot: usize) -> usize {
        to_index(self.num[slot]).unwrap_or(0).min(self.beam_width)
    }

    /// Row a candidate with score `normed` goes to, if it makes the cut.
    fn claim_row(&mut self, slot: usize, normed: f32) -> Option<usize> {
        let num = self.count(slot);
        if num < self.beam_width {
            self.num[slot] += 1;
            return Some(num);
        }
        let base = slot * self.beam_width;
        let (worst, worst_score) = (0..self.beam_width)
            .map(|h| (h, self.normed[base + h]))
            .min_by(|a, b| a.1.total_cmp(&b.1))?;
        (normed > worst_score).then_some(worst)
    }

    fn refresh_min(&mut self, slot: usize) {
        let base = slot * self.beam_width;
        self.min_normed[slot] = self.normed[base..base + self.count(slot)]
            .iter()
            .copied()
            .fold(f32::INFINITY, f32::min);
    }
}

impl BeamSearchOps for CpuBackend {
    #[allow(clippy::cast_precision_loss, clippy::too_many_lines)]
    fn beam_search_step(
        runtime_logits: &CpuTensor,
        params: &BeamSearchBuffers<CpuTensor>,
        inputs: &DecodingInputs<'_, CpuTensor>,
        outputs: &mut DecodingOutputs<CpuTensor>,
        dims: &StepDims,
    ) -> Result<()> {
        check_slots(inputs.batch_slots, dims)?;
        check_runtime_logits(runtime_logits, dims)?;
        if dims.tokens_per_step != 1 {
            return Err(Error::InvalidShape("beam search decodes one token per step".into()));
        }
        let (mb, bw, vocab, vp, l) = (
            dims.max_batch_size,
            dims.beam_width,
            dims.vocab_size,
            dims.vocab_size_padded,
            dims.max_seq_len,
        );

        let diversity = f32_slice(&params.diversity_rates, mb, "diversity rates")?;
        let length_penalties = f32_slice(&params.length_penalties, mb, "length penalties")?;
        let early_stopping = i32_slice(&params.early_stopping, mb, "early stopping")?;
        let end_ids = i32_slice(inputs.end_ids, mb, "end ids")?;
        let input_lengths = inputs
            .input_lengths
            .map(|t| i32_slice(t, mb * bw, "input lengths"))
            .transpose()?;
        let src_indirection = inputs
            .src_cache_indirection
            .map(|t| i32_slice(t, mb * bw * l, "source cache indirection"))
            .transpose()?;
        let logits = runtime_logits.as_f32_slice();

        let mut hyps = Hypotheses::new(
            outputs.beam_hypotheses.as_mut().ok_or_else(|| missing("hypothesis buffers"))?,
            dims,
        )?;
        let cum_log_probs = f32_slice_mut(
            outputs.cum_log_probs.as_mut().ok_or_else(|| missing("cumulative log probs"))?,
            mb * bw,
            "cum log probs",
        )?;
        let output_ids = i32_slice_mut(&mut outputs.output_ids, mb * bw * l, "output ids")?;
        let parent_ids = i32_slice_mut(&mut outputs.parent_ids, mb * bw * l, "parent ids")?;
        let seq_lens = i32_slice_mut(&mut outputs.sequence_lengths, mb * bw, "sequence lengths")?;
        let finished = u8_slice_mut(&mut outputs.finished, mb * bw, "finished")?;
        let new_tokens = i32_slice_mut(&mut outputs.new_tokens, mb * bw, "new tokens")?;
        let mut output_log_probs = outputs
            .output_log_probs
            .as_mut()
            .map(|t| f32_slice_mut(t, mb * bw * l, "output log probs"))
            .transpose()?;
        let mut tgt_indirection = outputs
            .tgt_cache_indirection
            .as_mut()
            .map(|t| i32_slice_mut(t, mb * bw * l, "target cache indirection"))
            .transpose()?;

        let mut log_probs = Vec::with_capacity(vocab);
        let mut top = Vec::new();
        let mut candidates = Vec::with_capacity(2 * bw * bw);
        let mut live: Vec<Candidate> = Vec::with_capacity(bw);

        for (bi, &slot) in inputs.batch_slots.iter().enumerate() {
            let base = slot * bw;
            let end_id = end_ids[slot];
            let cur_len = to_index(seq_lens[base]).unwrap_or(0);
            let all_finished = finished[base..base + bw].iter().all(|&bits| {
                let state = FinishedState::from_bits(bits);
                state.is_finished() || state.is_skip_decoding()
            });
            if hyps.is_done[slot] != 0 || all_finished || cur_len >= l {
                new_tokens[base..base + bw].fill(end_id);
                continue;
            }
            let input_len = input_lengths.map_or(0, |x| to_index(x[base]).unwrap_or(0));
            let generated = (cur_len + 1).saturating_sub(input_len);
            let penalty = length_penalties[slot];

            candidates.clear();
            for beam in 0..bw {
                let start = (bi * bw + beam) * vp;
                log_softmax_into(&logits[start..start + vocab], &mut log_probs);
                top_candidates(&log_probs, 2 * bw, &mut top);
                for (rank, &(token, log_prob)) in top.iter().enumerate() {
                    let cum = cum_log_probs[base + beam] + log_prob;
                    candidates.push(Candidate {
                        score: cum - diversity[slot] * rank as f32,
                        cum,
                        log_prob,
                        token,
                        parent: beam,
                    });
                }
            }
            candidates.sort_by(by_score);
            candidates.truncate(2 * bw);

            live.clear();
            for (i, c) in candidates.iter().enumerate() {
                if live.len() == bw {
                    break;
                }
                if to_index(end_id) != Some(c.token) {
                    live.push(*c);
                    continue;
                }
                if i >= bw {
                    continue;
                }
                let normed = length_normalized(c.cum, generated, penalty);
                let Some(row) = hyps.claim_row(slot, normed) else {
                    continue;
                };
                let rows = source_rows(&parent_ids[base * l..(base + bw) * l], bw, l, c.parent, cur_len);
                let dst = (base + row) * l;
                hyps.ids[dst..dst + l].fill(-1);
                hyps.log_probs[dst..dst + l].fill(0.0);
                for (pos, &r) in rows.iter().enumerate() {
                    let src = (base + r) * l + pos;
                    hyps.ids[dst + pos] = output_ids[src];
                    if let Some(lps) = output_log_probs.as_deref() {
                        hyps.log_probs[dst + pos] = lps[src];
                    }
                }
                hyps.ids[dst + cur_len] = end_id;
                hyps.log_probs[dst + cur_len] = c.log_prob;
                hyps.seq_lens[base + row] = to_i32(cur_len)?;
                hyps.cum[base + row] = c.cum;
                hyps.normed[base + row] = normed;
                hyps.refresh_min(slot);
            }

            let Some(&last) = live.last() else {
                hyps.is_done[slot] = 1;
                for bits in &mut finished[base..base + bw] {
                    *bits |= FinishedState::END_ID.bits();
                }
                new_tokens[base..base + bw].fill(end_id);
                continue;
            };
            while live.len() < bw {
                live.push(Candidate {
                    cum: DEAD_BEAM_LOG_PROB,
                    ..last
                });
            }

            for (j, c) in live.iter().enumerate() {
                let pos = (base + j) * l + cur_len;
                let token = to_i32(c.token)?;
                output_ids[pos] = token;
                parent_ids[pos] = to_i32(c.parent)?;
                if let Some(lps) = output_log_probs.as_deref_mut() {
                    lps[pos] = c.log_prob;
                }
                cum_log_probs[base + j] = c.cum;
                seq_lens[base + j] = to_i32(cur_len + 1)?;
                new_tokens[base + j] = token;
                if let (Some(src), Some(tgt)) = (src_indirection, tgt_indirection.as_deref_mut()) {
                    let (dst, from) = ((base + j) * l, (base + c.parent) * l);
                    tgt[dst..dst + cur_len].copy_from_slice(&src[from..from + cur_len]);
                    tgt[dst + cur_len] = to_i32(j)?;
                }
            }

            if hyps.count(slot) >= bw {
                let best_live = live.iter().map(|c| c.cum).fold(f32::NEG_INFINITY, f32::max);
                let done = match early_stopping[slot] {
                    1 => true,
                    0 => hyps.min_normed[slot] >= length_normalized(best_live, generated, penalty),
                    _ => {
                        let len = if penalty > 0.0 {
                            l.saturating_sub(input_len)
                        } else {
                            generated
                        };
                        hyps.min_normed[slot] >= length_normalized(best_live, len, penalty)
                    }
                };
                if done {
                    hyps.is_done[slot] = 1;
                    for bits in &mut finished[base..base + bw] {
                        *bits |= FinishedState::END_ID.bits();
                    }
                    log::debug!("beam search done for slot {slot} at length {}", cur_len + 1);
                }
            }
        }
        Ok(())
    }

    fn gather_beams(
        params: &BeamSearchBuffers<CpuTensor>,
        batch_slots: &[usize],
        input_lengths: Option<&CpuTensor>,
        outputs: &DecodingOutputs<CpuTensor>,
        gathered: &mut GatheredBeams<CpuTensor>,
        dims: &StepDims,
    ) -> Result<()> {
        let (mb, bw, l) = (dims.max_batch_size, dims.beam_width, dims.max_seq_len);
        if let Some(&slot) = batch_slots.iter().find(|&&s| s >= mb) {
            return Err(Error::SlotOutOfRange {
                slot,
                max_batch_size: mb,
            });
        }
        let length_penalties = f32_slice(&params.length_penalties, mb, "length penalties")?;
        let input_lengths = input_lengths
            .map(|t| i32_slice(t, mb * bw, "input lengths"))
            .transpose()?;
        let hyps = outputs
            .beam_hypotheses
            .as_ref()
            .ok_or_else(|| missing("hypothesis buffers"))?;
        let hyp_ids = i32_slice(&hyps.output_ids, mb * bw * l, "hypothesis ids")?;
        let hyp_lens = i32_slice(&hyps.sequence_lengths, mb * bw, "hypothesis lengths")?;
        let hyp_cum = f32_slice(&hyps.cum_log_probs, mb * bw, "hypothesis cum log probs")?;
        let hyp_normed = f32_slice(&hyps.normed_scores, mb * bw, "hypothesis scores")?;
        let hyp_num = i32_slice(&hyps.num_beams, mb, "hypothesis counts")?;
        let is_done = u8_slice(&hyps.is_done, mb, "hypothesis done flags")?;
        let output_ids = i32_slice(&outputs.output_ids, mb * bw * l, "output ids")?;
        let parent_ids = i32_slice(&outputs.parent_ids, mb * bw * l, "parent ids")?;
        let seq_lens = i32_slice(&outputs.sequence_lengths, mb * bw, "sequence lengths")?;
        let cum_log_probs = f32_slice(
            outputs.cum_log_probs.as_ref().ok_or_else(|| missing("cumulative log probs"))?,
            mb * bw,
            "cum log probs",
        )?;

        let out_ids = i32_slice_mut(&mut gathered.output_ids, mb * bw * l, "gathered ids")?;
        let out_lens = i32_slice_mut(&mut gathered.sequence_lengths, mb * bw, "gathered lengths")?;
        let out_cum = f32_slice_mut(&mut gathered.cum_log_probs, mb * bw, "gathered cum log probs")?;
        let out_normed = f32_slice_mut(&mut gathered.normed_scores, mb * bw, "gathered scores")?;

        struct Entry {
            normed: f32,
            cum: f32,
            len: i32,
            tokens: Vec<i32>,
        }
        let mut entries: Vec<Entry> = Vec::with_capacity(2 * bw);
        for &slot in batch_slots {
            let base = slot * bw;
            entries.clear();
            let num = to_index(hyp_num[slot]).unwrap_or(0).min(bw);
            for h in 0..num {
                let row = (base + h) * l;
                entries.push(Entry {
                    normed: hyp_normed[base + h],
                    cum: hyp_cum[base + h],
                    len: hyp_lens[base + h],
                    tokens: hyp_ids[row..row + l].to_vec(),
                });
            }
            if is_done[slot] == 0 {
                for beam in 0..bw {
                    let len = to_index(seq_lens[base + beam]).unwrap_or(0).min(l);
                    let rows = source_rows(&parent_ids[base * l..(base + bw) * l], bw, l, beam, len);
                    let mut tokens = vec![-1; l];
                    for (pos, &r) in rows.iter().enumerate() {
                        tokens[pos] = output_ids[(base + r) * l + pos];
                    }
                    let input_len = input_lengths.map_or(0, |x| to_index(x[base + beam]).unwrap_or(0));
                    let cum = cum_log_probs[base + beam];
                    entries.push(Entry {
                        normed: length_normalized(cum, len.saturating_sub(input_len), length_penalties[slot]),
                        cum,
                        len: to_i32(len)?,
                        tokens,
                    });
                }
            }
            entries.sort_by(|a, b| b.normed.total_cmp(&a.normed));

            for j in 0..bw {
                let dst = (base + j) * l;
                match entries.get(j) {
                    Some(e) => {
                        out_ids[dst..dst + l].copy_from_slice(&e.tokens);
                        out_lens[base + j] = e.len;
                        out_cum[base + j] = e.cum;
                        out_normed[base + j] = e.normed;
                    }
                    None => {
                        out_ids[dst..dst + l].fill(-1);
                        out_lens[base + j] = 0;
                        out_cum[base + j] = DEAD_BEAM_LOG_PROB;
                        out_normed[base + j] = DEAD_BEAM_LOG_PROB;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use decodium::dtype::DType;
    use decodium::io::LogitsView;

    const BW: usize = 2;
    const L: usize = 6;
    const V: usize = 4;
    const END: i32 = 3;

    fn dims() -> StepDims {
        StepDims {
            batch_size: 1,
            max_batch_size: 1,
            beam_width: BW,
            tokens_per_step: 1,
            vocab_size: V,
            vocab_size_padded: V,
            max_seq_len: L,
        }
    }

    fn params(early_stopping: i32) -> BeamSearchBuffers<CpuTensor> {
        BeamSearchBuffers {
            diversity_rates: CpuTensor::from_f32(&[1], &[0.0]),
            length_penalties: CpuTensor::from_f32(&[1], &[0.0]),
            early_stopping: CpuTensor::from_i32(&[1], &[early_stopping]),
        }
    }

    /// One slot, prompt `[0]` in both beams.
    fn outputs() -> DecodingOutputs<CpuTensor> {
        DecodingOutputs {
            output_ids: CpuTensor::from_i32(&[1, BW, L], &[0; BW * L]),
            parent_ids: CpuTensor::from_i32(&[1, BW, L], &[0; BW * L]),
            sequence_lengths: CpuTensor::from_i32(&[1, BW], &[1, 1]),
            finished: CpuTensor::from_u8(&[1, BW], &[0, 0]),
            finished_sum: CpuTensor::from_i32(&[1], &[0]),
            new_tokens: CpuTensor::from_i32(&[1, 1, BW], &[0, 0]),
            cum_log_probs: Some(CpuTensor::from_f32(&[1, BW], &[0.0, DEAD_BEAM_LOG_PROB])),
            output_log_probs: Some(CpuTensor::zeros(&[1, BW, L], DType::F32)),
            tgt_cache_indirection: Some(CpuTensor::zeros(&[1, BW, L], DType::I32)),
            beam_hypotheses: Some(BeamHypotheses {
                output_ids: CpuTensor::zeros(&[1, BW, L], DType::I32),
                log_probs: CpuTensor::zeros(&[1, BW, L], DType::F32),
                sequence_lengths: CpuTensor::zeros(&[1, BW], DType::I32),
                cum_log_probs: CpuTensor::zeros(&[1, BW], DType::F32),
                normed_scores: CpuTensor::zeros(&[1, BW], DType::F32),
                num_beams: CpuTensor::zeros(&[1], DType::I32),
                min_normed_scores: CpuTensor::zeros(&[1], DType::F32),
                is_done: CpuTensor::zeros(&[1], DType::U8),
            }),
            medusa: None,
        }
    }

    fn step(probs: [[f32; V]; BW], p: &BeamSearchBuffers<CpuTensor>, out: &mut DecodingOutputs<CpuTensor>, src: Option<&CpuTensor>) {
        let logits: Vec<f32> = probs.iter().flatten().map(|p| p.ln()).collect();
        let runtime = CpuTensor::from_f32(&[1, 1, BW, V], &logits);
        let end_ids = CpuTensor::from_i32(&[1], &[END]);
        let input_lengths = CpuTensor::from_i32(&[1, BW], &[1, 1]);
        let mut inputs = DecodingInputs::new(0, LogitsView::Dense(&runtime), &[0], &end_ids);
        inputs.input_lengths = Some(&input_lengths);
        inputs.src_cache_indirection = src;
        CpuBackend::beam_search_step(&runtime, p, &inputs, out, &dims()).unwrap();
    }

    #[test]
    fn test_length_normalized() {
        assert_relative_eq!(length_normalized(-4.0, 4, 0.0), -4.0);
        assert_relative_eq!(length_normalized(-4.0, 4, 1.0), -1.0);
        assert_relative_eq!(length_normalized(-4.0, 4, 0.5), -2.0);
    }

    #[test]
    fn test_expand_then_finish_a_hypothesis() {
        let p = params(1);
        let mut out = outputs();
        step([[0.6, 0.3, 0.05, 0.05], [0.25; 4]], &p, &mut out, None);
        assert_eq!(out.new_tokens.as_i32_slice(), &[0, 1]);
        assert_eq!(out.sequence_lengths.as_i32_slice(), &[2, 2]);
        let cum = out.cum_log_probs.as_ref().unwrap().as_f32_slice().to_vec();
        assert_relative_eq!(cum[0], 0.6f32.ln(), epsilon = 1e-5);
        assert_relative_eq!(cum[1], 0.3f32.ln(), epsilon = 1e-5);

        // Beam 0 now prefers the end id; beam 1 continues with token 1.
        let src = CpuTensor::from_i32(&[1, BW, L], &[0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1]);
        step([[0.05, 0.05, 0.4, 0.5], [0.05, 0.9, 0.03, 0.02]], &p, &mut out, Some(&src));
        assert_eq!(out.new_tokens.as_i32_slice(), &[1, 2]);
        assert_eq!(&out.parent_ids.as_i32_slice()[2], &1);
        assert_eq!(&out.parent_ids.as_i32_slice()[L + 2], &0);

        let hyps = out.beam_hypotheses.as_ref().unwrap();
        assert_eq!(hyps.num_beams.as_i32_slice(), &[1]);
        assert_eq!(&hyps.output_ids.as_i32_slice()[..L], &[0, 0, 3, -1, -1, -1]);
        assert_eq!(hyps.sequence_lengths.as_i32_slice()[0], 2);
        assert_relative_eq!(hyps.cum_log_probs.as_f32_slice()[0], 0.3f32.ln(), epsilon = 1e-5);
        assert_eq!(hyps.is_done.as_u8_slice(), &[0]);

        let tgt = out.tgt_cache_indirection.as_ref().unwrap().as_i32_slice();
        assert_eq!(&tgt[..3], &[1, 1, 0]);
        assert_eq!(&tgt[L..L + 3], &[0, 0, 1]);

        let mut gathered = GatheredBeams {
            output_ids: CpuTensor::zeros(&[1, BW, L], DType::I32),
            sequence_lengths: CpuTensor::zeros(&[1, BW], DType::I32),
            cum_log_probs: CpuTensor::zeros(&[1, BW], DType::F32),
            normed_scores: CpuTensor::zeros(&[1, BW], DType::F32),
        };
        let input_lengths = CpuTensor::from_i32(&[1, BW], &[1, 1]);
        CpuBackend::gather_beams(&p, &[0], Some(&input_lengths), &out, &mut gathered, &dims()).unwrap();
        let ids = gathered.output_ids.as_i32_slice();
        assert_eq!(&ids[..L], &[0, 0, 3, -1, -1, -1]);
        assert_eq!(&ids[L..2 * L], &[0, 1, 1, -1, -1, -1]);
        assert_eq!(gathered.sequence_lengths.as_i32_slice(), &[2, 3]);
    }

    #[test]
    fn test_done_after_beam_width_hypotheses() {
        let p = params(1);
        let mut out = outputs();
        step([[0.6, 0.3, 0.05, 0.05], [0.25; 4]], &p, &mut out, None);
        step([[0.1, 0.2, 0.2, 0.5], [0.02, 0.03, 0.05, 0.9]], &p, &mut out, None);

        let hyps = out.beam_hypotheses.as_ref().unwrap();
        assert_eq!(hyps.num_beams.as_i32_slice(), &[2]);
        assert_eq!(hyps.is_done.as_u8_slice(), &[1]);
        assert!(out
            .finished
            .as_u8_slice()
            .iter()
            .all(|&b| FinishedState::from_bits(b).is_finished_end_id()));

        // A done slot only emits end ids.
        step([[0.25; 4], [0.25; 4]], &p, &mut out, None);
        assert_eq!(out.new_tokens.as_i32_slice(), &[END, END]);
    }

    #[test]
    fn test_exhaustive_mode_depends_on_length_penalty() {
        let run = |length_penalty: f32| {
            let mut p = params(2);
            p.length_penalties = CpuTensor::from_f32(&[1], &[length_penalty]);
            let mut out = outputs();
            step([[0.6, 0.3, 0.05, 0.05], [0.25; 4]], &p, &mut out, None);
            step([[0.1, 0.2, 0.2, 0.5], [0.02, 0.03, 0.05, 0.9]], &p, &mut out, None);
            let hyps = out.beam_hypotheses.as_ref().unwrap();
            assert_eq!(hyps.num_beams.as_i32_slice(), &[2]);
            hyps.is_done.as_u8_slice()[0]
        };
        // Without a length penalty the live beams can only lose score.
        assert_eq!(run(0.0), 1);
        // With a positive penalty a longer live beam could still win.
        assert_eq!(run(1.0), 0);
    }

    #[test]
    fn test_missing_hypotheses_is_a_config_error() {
        let mut out = outputs();
        out.beam_hypotheses = None;
        let runtime = CpuTensor::zeros(&[1, 1, BW, V], DType::F32);
        let end_ids = CpuTensor::from_i32(&[1], &[END]);
        let inputs = DecodingInputs::new(0, LogitsView::Dense(&runtime), &[0], &end_ids);
        let err = CpuBackend::beam_search_step(&runtime, &params(1), &inputs, &mut out, &dims()).unwrap_err();
        assert!(err.is_config_error());
    }
}
