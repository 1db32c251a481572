//! CPU stop criteria: stop words and length limits.

use decodium::backend::StopCriteriaOps;
use decodium::finished::FinishedState;
use decodium::io::{DecodingInputs, DecodingOutputs, StepDims};
use decodium::word_list::{word_spans, WordTable};
use decodium::Result;

use super::history::{ends_with, Lineage};
use super::{check_slots, i32_slice, i32_slice_mut, to_index, to_i32, u8_slice_mut};
use crate::tensor::CpuTensor;
use crate::CpuBackend;

impl StopCriteriaOps for CpuBackend {
    fn stop_words_criterion(
        stop_words: &WordTable<CpuTensor>,
        inputs: &DecodingInputs<'_, CpuTensor>,
        outputs: &mut DecodingOutputs<CpuTensor>,
        dims: &StepDims,
    ) -> Result<()> {
        check_slots(inputs.batch_slots, dims)?;
        let (mb, bw, l) = (dims.max_batch_size, dims.beam_width, dims.max_seq_len);
        let width = stop_words.max_row_len;
        let words = i32_slice(&stop_words.words, mb * 2 * width, "stop words")?;
        let lens = i32_slice(&stop_words.lens, mb, "stop word lengths")?;
        let output_ids = i32_slice(&outputs.output_ids, mb * bw * l, "output ids")?;
        let parent_ids = i32_slice(&outputs.parent_ids, mb * bw * l, "parent ids")?;
        let seq_lens = i32_slice(&outputs.sequence_lengths, mb * bw, "sequence lengths")?;
        let finished = u8_slice_mut(&mut outputs.finished, mb * bw, "finished")?;

        for &slot in inputs.batch_slots {
            let len = to_index(lens[slot]).unwrap_or(0).min(width);
            if len == 0 {
                continue;
            }
            let row = &words[slot * 2 * width..(slot + 1) * 2 * width];
            let (tokens, offsets) = (&row[..len], &row[width..width + len]);
            let block = slot * bw * l..(slot + 1) * bw * l;
            for beam in 0..bw {
                let idx = slot * bw + beam;
                let mut state = FinishedState::from_bits(finished[idx]);
                if state.is_finished() || state.is_skip_decoding() {
                    continue;
                }
                let seq_len = to_index(seq_lens[idx]).unwrap_or(0);
                let history = Lineage::new(&output_ids[block.clone()], &parent_ids[block.clone()], bw, l, beam, seq_len);
                if word_spans(tokens, offsets).any(|word| !word.is_empty() && ends_with(history.clone(), word)) {
                    state |= FinishedState::STOP_WORDS;
                    finished[idx] = state.bits();
                }
            }
        }
        Ok(())
    }

    fn length_criterion(
        inputs: &DecodingInputs<'_, CpuTensor>,
        outputs: &mut DecodingOutputs<CpuTensor>,
        dims: &StepDims,
    ) -> Result<()> {
        check_slots(inputs.batch_slots, dims)?;
        let (mb, bw) = (dims.max_batch_size, dims.beam_width);
        let limits = inputs
            .sequence_limit_lengths
            .map(|t| i32_slice(t, mb, "sequence limit lengths"))
            .transpose()?;
        let max_new = inputs
            .max_new_tokens
            .map(|t| i32_slice(t, mb, "max new tokens"))
            .transpose()?;
        let input_lens = inputs
            .input_lengths
            .map(|t| i32_slice(t, mb * bw, "input lengths"))
            .transpose()?;
        let seq_lens = i32_slice(&outputs.sequence_lengths, mb * bw, "sequence lengths")?;
        let finished = u8_slice_mut(&mut outputs.finished, mb * bw, "finished")?;
        let finished_sum = i32_slice_mut(&mut outputs.finished_sum, mb, "finished sum")?;

        let max_seq_len = to_i32(dims.max_seq_len)?;
        for &slot in inputs.batch_slots {
            let limit = limits.map_or(max_seq_len, |l| l[slot]);
            let mut count = 0;
            for beam in 0..bw {
                let idx = slot * bw + beam;
                let mut state = FinishedState::from_bits(finished[idx]);
                if state.is_skip_decoding() {
                    continue;
                }
                let seq_len = seq_lens[idx];
                if seq_len >= limit {
                    state |= FinishedState::MAX_LENGTH;
                }
                if let Some(max_new) = max_new {
                    let prompt = input_lens.map_or(0, |lens| lens[idx]);
                    if seq_len.saturating_sub(prompt) >= max_new[slot] {
                        state |= FinishedState::MAX_NEW_TOKENS;
                    }
                }
                finished[idx] = state.bits();
                if state.is_finished() {
                    count += 1;
                }
            }
            finished_sum[slot] = count;
        }
        Ok(())
    }
}
