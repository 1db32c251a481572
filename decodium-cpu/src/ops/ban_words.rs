//! CPU ban-words kernels.

use decodium::backend::BanWordsOps;
use decodium::io::{DecodingInputs, DecodingOutputs, StepDims};
use decodium::word_list::{word_spans, WordTable};
use decodium::Result;
use rayon::prelude::*;

use super::history::{ends_with, Lineage};
use super::{check_runtime_logits, check_slots, i32_slice, to_index};
use crate::tensor::CpuTensor;
use crate::CpuBackend;

/// Shared view of the history buffers of a step.
struct Histories<'a> {
    output_ids: &'a [i32],
    parent_ids: &'a [i32],
    seq_lens: &'a [i32],
    beam_width: usize,
    max_seq_len: usize,
}

impl<'a> Histories<'a> {
    fn new(outputs: &'a DecodingOutputs<CpuTensor>, dims: &StepDims) -> Result<Self> {
        let (mb, bw, l) = (dims.max_batch_size, dims.beam_width, dims.max_seq_len);
        Ok(Self {
            output_ids: i32_slice(&outputs.output_ids, mb * bw * l, "output ids")?,
            parent_ids: i32_slice(&outputs.parent_ids, mb * bw * l, "parent ids")?,
            seq_lens: i32_slice(&outputs.sequence_lengths, mb * bw, "sequence lengths")?,
            beam_width: bw,
            max_seq_len: l,
        })
    }

    fn lineage(&self, slot: usize, beam: usize) -> Lineage<'a> {
        let block = slot * self.beam_width * self.max_seq_len..(slot + 1) * self.beam_width * self.max_seq_len;
        let seq_len = to_index(self.seq_lens[slot * self.beam_width + beam]).unwrap_or(0);
        Lineage::new(
            &self.output_ids[block.clone()],
            &self.parent_ids[block],
            self.beam_width,
            self.max_seq_len,
            beam,
            seq_len,
        )
    }
}

/// Set `token` to `-inf` in every step row of `beam`.
fn ban(rows: &mut [f32], dims: &StepDims, beam: usize, token: usize) {
    if token >= dims.vocab_size {
        return;
    }
    for t in 0..dims.tokens_per_step {
        rows[(t * dims.beam_width + beam) * dims.vocab_size_padded + token] = f32::NEG_INFINITY;
    }
}

impl BanWordsOps for CpuBackend {
    fn ban_bad_words(
        runtime_logits: &mut CpuTensor,
        bad_words: &WordTable<CpuTensor>,
        inputs: &DecodingInputs<'_, CpuTensor>,
        outputs: &DecodingOutputs<CpuTensor>,
        dims: &StepDims,
    ) -> Result<()> {
        check_slots(inputs.batch_slots, dims)?;
        check_runtime_logits(runtime_logits, dims)?;
        let width = bad_words.max_row_len;
        let words = i32_slice(&bad_words.words, dims.max_batch_size * 2 * width, "bad words")?;
        let lens = i32_slice(&bad_words.lens, dims.max_batch_size, "bad word lengths")?;
        let histories = Histories::new(outputs, dims)?;
        let stride = dims.logits_stride();
        let slots = inputs.batch_slots;

        runtime_logits.as_f32_slice_mut()[..dims.batch_size * stride]
            .par_chunks_mut(stride)
            .enumerate()
            .for_each(|(bi, rows)| {
                let slot = slots[bi];
                let len = to_index(lens[slot]).unwrap_or(0).min(width);
                if len == 0 {
                    return;
                }
                let block = &words[slot * 2 * width..(slot + 1) * 2 * width];
                let (tokens, offsets) = (&block[..len], &block[width..width + len]);
                for beam in 0..dims.beam_width {
                    for word in word_spans(tokens, offsets) {
                        let Some((&last, prefix)) = word.split_last() else {
                            continue;
                        };
                        if ends_with(histories.lineage(slot, beam), prefix) {
                            if let Some(token) = to_index(last) {
                                ban(rows, dims, beam, token);
                            }
                        }
                    }
                }
            });
        Ok(())
    }

    fn ban_repeat_ngrams(
        runtime_logits: &mut CpuTensor,
        ngram_sizes: &CpuTensor,
        inputs: &DecodingInputs<'_, CpuTensor>,
        outputs: &DecodingOutputs<CpuTensor>,
        dims: &StepDims,
    ) -> Result<()> {
        check_slots(inputs.batch_slots, dims)?;
        check_runtime_logits(runtime_logits, dims)?;
        let sizes = i32_slice(ngram_sizes, dims.max_batch_size, "no-repeat n-gram sizes")?;
        let histories = Histories::new(outputs, dims)?;
        let stride = dims.logits_stride();
        let slots = inputs.batch_slots;

        runtime_logits.as_f32_slice_mut()[..dims.batch_size * stride]
            .par_chunks_mut(stride)
            .enumerate()
            .for_each(|(bi, rows)| {
                let slot = slots[bi];
                let n = to_index(sizes[slot]).unwrap_or(0);
                if n == 0 {
                    return;
                }
                for beam in 0..dims.beam_width {
                    let history = histories.lineage(slot, beam).to_vec();
                    if history.len() < n {
                        continue;
                    }
                    let context = &history[history.len() + 1 - n..];
                    for window in history.windows(n) {
                        let Some((&next, head)) = window.split_last() else {
                            continue;
                        };
                        if head == context {
                            if let Some(token) = to_index(next) {
                                ban(rows, dims, beam, token);
                            }
                        }
                    }
                }
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::tests_util::{dims, outputs_with_history};
    use decodium::backend::TensorFactory;
    use decodium::dtype::DType;

    fn banned(runtime: &CpuTensor, vp: usize) -> Vec<Vec<usize>> {
        runtime
            .as_f32_slice()
            .chunks(vp)
            .map(|row| (0..vp).filter(|&v| row[v] == f32::NEG_INFINITY).collect())
            .collect()
    }

    #[test]
    fn test_bad_words_by_prefix() {
        let d = dims(3, 1, 9, 9, 8);
        let history: [&[i32]; 3] = [&[4], &[4, 0], &[1]];
        let outputs = outputs_with_history(&d, &history);
        let words = vec![
            vec![vec![4, 0], vec![2]],
            vec![vec![4, 0, 2], vec![4, 0, 3, 0]],
            vec![vec![0, 2]],
        ];
        let slots = [0, 1, 2];
        let table = WordTable::from_words::<CpuBackend>(&words, &slots, 3).unwrap();
        let end_ids = CpuTensor::from_i32(&[3], &[8, 8, 8]);
        let logits = CpuTensor::zeros(&[3, 1, 9], DType::F32);
        let inputs = DecodingInputs::new(0, decodium::io::LogitsView::Dense(&logits), &slots, &end_ids);
        let mut runtime = CpuTensor::zeros(&[3, 1, 1, 9], DType::F32);

        CpuBackend::ban_bad_words(&mut runtime, &table, &inputs, &outputs, &d).unwrap();
        assert_eq!(banned(&runtime, 9), vec![vec![0, 2], vec![2], vec![]]);
    }

    #[test]
    fn test_empty_table_bans_nothing() {
        let d = dims(1, 1, 4, 4, 4);
        let outputs = outputs_with_history(&d, &[&[1, 2]]);
        let table = WordTable::from_words::<CpuBackend>(&[vec![]], &[0], 1).unwrap();
        let end_ids = CpuTensor::from_i32(&[1], &[3]);
        let logits = CpuTensor::zeros(&[1, 1, 4], DType::F32);
        let inputs = DecodingInputs::new(0, decodium::io::LogitsView::Dense(&logits), &[0], &end_ids);
        let mut runtime = CpuBackend::full_f32(&[1, 1, 1, 4], 1.0).unwrap();
        CpuBackend::ban_bad_words(&mut runtime, &table, &inputs, &outputs, &d).unwrap();
        assert_eq!(runtime.as_f32_slice(), &[1.0; 4]);
    }

    #[test]
    fn test_repeat_ngram() {
        let d = dims(2, 1, 6, 6, 8);
        // Trailing bigram context [2] occurred before, followed by 3.
        let outputs = outputs_with_history(&d, &[&[1, 2, 3, 2], &[1, 2, 3, 2]]);
        let sizes = CpuTensor::from_i32(&[2], &[2, 0]);
        let end_ids = CpuTensor::from_i32(&[2], &[5, 5]);
        let logits = CpuTensor::zeros(&[2, 1, 6], DType::F32);
        let slots = [0, 1];
        let inputs = DecodingInputs::new(0, decodium::io::LogitsView::Dense(&logits), &slots, &end_ids);
        let mut runtime = CpuTensor::zeros(&[2, 1, 1, 6], DType::F32);
        CpuBackend::ban_repeat_ngrams(&mut runtime, &sizes, &inputs, &outputs, &d).unwrap();
        assert_eq!(banned(&runtime, 6), vec![vec![3], vec![]]);
    }
}
