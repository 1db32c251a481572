//! CPU Medusa kernels: target sampling, draft acceptance, next drafts and
//! accepted-path packing.

use decodium::backend::{MedusaBuffers, MedusaOps};
use decodium::finished::FinishedState;
use decodium::io::{DecodingInputs, DecodingOutputs, MedusaInputs, MedusaOutputs, StepDims};
use decodium::tensor::Tensor;
use decodium::{Error, Result};

use super::sampling::select_token;
use super::{
    check_runtime_logits, check_slots, i32_slice, i32_slice_mut, to_i32, to_index, top_candidates,
    u8_slice, u8_slice_mut,
};
use crate::tensor::CpuTensor;
use crate::{CpuBackend, CpuRngState};

fn medusa_inputs<'a, 'b>(inputs: &'a DecodingInputs<'b, CpuTensor>) -> Result<&'a MedusaInputs<'b, CpuTensor>> {
    inputs
        .medusa
        .as_ref()
        .ok_or_else(|| Error::InvalidConfig("medusa decoding requires medusa inputs".into()))
}

fn medusa_outputs(medusa: &mut Option<MedusaOutputs<CpuTensor>>) -> Result<&mut MedusaOutputs<CpuTensor>> {
    medusa
        .as_mut()
        .ok_or_else(|| Error::InvalidConfig("medusa decoding requires medusa outputs".into()))
}

fn is_active(bits: u8) -> bool {
    let state = FinishedState::from_bits(bits);
    !state.is_finished() && !state.is_skip_decoding()
}

/// Tree nodes decoded this step for `slot`, clamped to the step maximum.
fn slot_tokens_per_step(tokens_per_step: &[i32], slot: usize, dims: &StepDims) -> usize {
    to_index(tokens_per_step[slot]).unwrap_or(1).clamp(1, dims.tokens_per_step)
}

/// Number of tokens accepted along `path` and whether the walk hit the end id.
///
/// Node `n > 0` of the tree carries draft token `drafts[n - 1]`. The walk
/// emits the target token of each visited node and continues while the
/// next node's draft equals that target.
fn walk_path(path: &[i32], targets: &[i32], drafts: &[i32], end_id: i32) -> usize {
    for (ti, &node) in path.iter().enumerate() {
        let Some(node) = to_index(node).filter(|&n| n < targets.len()) else {
            return ti;
        };
        let target = targets[node];
        if target == end_id {
            return ti + 1;
        }
        let next_draft = path
            .get(ti + 1)
            .and_then(|&n| to_index(n))
            .filter(|&n| n >= 1)
            .and_then(|n| drafts.get(n - 1));
        if next_draft != Some(&target) {
            return ti + 1;
        }
    }
    path.len()
}

impl MedusaOps for CpuBackend {
    fn sample_target_tokens(
        runtime_logits: &CpuTensor,
        rng: &mut CpuRngState,
        params: &mut MedusaBuffers<CpuTensor>,
        inputs: &DecodingInputs<'_, CpuTensor>,
        outputs: &DecodingOutputs<CpuTensor>,
        dims: &StepDims,
    ) -> Result<()> {
        check_slots(inputs.batch_slots, dims)?;
        check_runtime_logits(runtime_logits, dims)?;
        let medusa = medusa_inputs(inputs)?;
        let (mb, tps, vocab, vp) = (
            dims.max_batch_size,
            dims.tokens_per_step,
            dims.vocab_size,
            dims.vocab_size_padded,
        );
        if dims.beam_width != 1 {
            return Err(Error::InvalidShape("medusa decodes a single beam".into()));
        }
        let top_k = i32_slice(&params.top_k, mb, "medusa top k")?;
        let tokens_per_step = i32_slice(medusa.tokens_per_step, mb, "tokens per step")?;
        let finished = u8_slice(&outputs.finished, mb, "finished")?;
        let targets = i32_slice_mut(&mut params.target_tokens, mb * tps, "target tokens")?;
        let logits = runtime_logits.as_f32_slice();

        let mut scratch = Vec::new();
        for (bi, &slot) in inputs.batch_slots.iter().enumerate() {
            if !is_active(finished[slot]) {
                continue;
            }
            let k = to_index(top_k[slot]).unwrap_or(0).max(1);
            for t in 0..slot_tokens_per_step(tokens_per_step, slot, dims) {
                let start = (bi * tps + t) * vp;
                let idx = select_token(&logits[start..start + vocab], k, 0.0, rng.slot_mut(slot), &mut scratch);
                targets[slot * tps + t] = to_i32(idx)?;
            }
        }
        Ok(())
    }

    fn accept_draft_tokens(
        params: &MedusaBuffers<CpuTensor>,
        inputs: &DecodingInputs<'_, CpuTensor>,
        outputs: &mut DecodingOutputs<CpuTensor>,
        dims: &StepDims,
        max_medusa_heads: usize,
    ) -> Result<()> {
        check_slots(inputs.batch_slots, dims)?;
        let medusa = medusa_inputs(inputs)?;
        let (mb, tps, l) = (dims.max_batch_size, dims.tokens_per_step, dims.max_seq_len);
        let path_len = max_medusa_heads + 1;
        let paths = i32_slice(medusa.paths, mb * tps * path_len, "medusa paths")?;
        let drafts = i32_slice(medusa.draft_tokens, mb * (tps - 1), "draft tokens")?;
        let tokens_per_step = i32_slice(medusa.tokens_per_step, mb, "tokens per step")?;
        let targets = i32_slice(&params.target_tokens, mb * tps, "target tokens")?;
        let end_ids = i32_slice(inputs.end_ids, mb, "end ids")?;

        let m = medusa_outputs(&mut outputs.medusa)?;
        let accepted_lengths = i32_slice_mut(&mut m.accepted_lengths, mb, "accepted lengths")?;
        let best_path_ids = i32_slice_mut(&mut m.best_path_ids, mb, "best path ids")?;
        let output_ids = i32_slice_mut(&mut outputs.output_ids, mb * l, "output ids")?;
        let seq_lens = i32_slice_mut(&mut outputs.sequence_lengths, mb, "sequence lengths")?;
        let finished = u8_slice_mut(&mut outputs.finished, mb, "finished")?;
        let new_tokens = i32_slice_mut(&mut outputs.new_tokens, tps * mb, "new tokens")?;

        for &slot in inputs.batch_slots {
            let end_id = end_ids[slot];
            for t in 0..tps {
                new_tokens[t * mb + slot] = end_id;
            }
            accepted_lengths[slot] = 0;
            let seq_len = to_index(seq_lens[slot]).unwrap_or(0);
            if !is_active(finished[slot]) || seq_len >= l {
                continue;
            }

            let nodes = slot_tokens_per_step(tokens_per_step, slot, dims);
            let slot_targets = &targets[slot * tps..slot * tps + nodes];
            let slot_drafts = &drafts[slot * (tps - 1)..slot * (tps - 1) + nodes - 1];
            let mut best = (0usize, 0usize);
            for pi in 0..nodes {
                let path = &paths[(slot * tps + pi) * path_len..(slot * tps + pi + 1) * path_len];
                if path[0] < 0 {
                    continue;
                }
                let accepted = walk_path(path, slot_targets, slot_drafts, end_id);
                if accepted > best.1 {
                    best = (pi, accepted);
                }
            }
            let (best_path, accepted) = best;
            let accepted = accepted.min(l - seq_len);
            let path = &paths[(slot * tps + best_path) * path_len..(slot * tps + best_path + 1) * path_len];

            let mut state = FinishedState::from_bits(finished[slot]);
            let mut appended = 0;
            for (i, &node) in path[..accepted].iter().enumerate() {
                let token = to_index(node).map_or(end_id, |n| slot_targets[n]);
                output_ids[slot * l + seq_len + i] = token;
                new_tokens[i * mb + slot] = token;
                if token == end_id {
                    state |= FinishedState::END_ID;
                    break;
                }
                appended += 1;
            }
            finished[slot] = state.bits();
            seq_lens[slot] += to_i32(appended)?;
            accepted_lengths[slot] = to_i32(accepted)?;
            best_path_ids[slot] = to_i32(best_path)?;
        }
        Ok(())
    }

    fn next_draft_tokens(
        params: &MedusaBuffers<CpuTensor>,
        inputs: &DecodingInputs<'_, CpuTensor>,
        outputs: &mut DecodingOutputs<CpuTensor>,
        dims: &StepDims,
        max_medusa_heads: usize,
    ) -> Result<()> {
        check_slots(inputs.batch_slots, dims)?;
        let medusa = medusa_inputs(inputs)?;
        let (mb, tps, vocab, vp) = (
            dims.max_batch_size,
            dims.tokens_per_step,
            dims.vocab_size,
            dims.vocab_size_padded,
        );
        let path_len = max_medusa_heads + 1;
        let paths = i32_slice(medusa.paths, mb * tps * path_len, "medusa paths")?;
        let tree_ids = i32_slice(medusa.tree_ids, mb * (tps - 1), "tree ids")?;
        let tokens_per_step = i32_slice(medusa.tokens_per_step, mb, "tokens per step")?;
        let top_k_heads = i32_slice(&params.top_k_heads, mb * max_medusa_heads, "medusa head top k")?;
        let head_stride = dims.batch_size * tps * vp;
        medusa
            .medusa_logits
            .check_min_numel(max_medusa_heads * head_stride, "medusa logits")?;
        let head_logits = medusa.medusa_logits.to_f32_vec()?;
        let finished = u8_slice(&outputs.finished, mb, "finished")?;

        let m = medusa_outputs(&mut outputs.medusa)?;
        let accepted_lengths = i32_slice(&m.accepted_lengths, mb, "accepted lengths")?;
        let best_path_ids = i32_slice(&m.best_path_ids, mb, "best path ids")?;
        let next = i32_slice_mut(&mut m.next_draft_tokens, mb * (tps - 1), "next draft tokens")?;

        let mut top = Vec::new();
        let mut candidates = Vec::new();
        for (bi, &slot) in inputs.batch_slots.iter().enumerate() {
            let accepted = to_index(accepted_lengths[slot]).unwrap_or(0);
            if !is_active(finished[slot]) || accepted == 0 {
                continue;
            }
            let best_path = to_index(best_path_ids[slot]).unwrap_or(0);
            let path = &paths[(slot * tps + best_path) * path_len..(slot * tps + best_path + 1) * path_len];
            let last_node = to_index(path[accepted - 1]).unwrap_or(0).min(tps - 1);

            candidates.clear();
            for h in 0..max_medusa_heads {
                let k = to_index(top_k_heads[slot * max_medusa_heads + h]).unwrap_or(0);
                if k == 0 {
                    continue;
                }
                let start = h * head_stride + (bi * tps + last_node) * vp;
                top_candidates(&head_logits[start..start + vocab], k, &mut top);
                candidates.extend(top.iter().map(|&(id, _)| id));
            }

            let drafts = slot_tokens_per_step(tokens_per_step, slot, dims) - 1;
            for j in 0..drafts {
                let tree_id = tree_ids[slot * (tps - 1) + j];
                let token = to_index(tree_id).and_then(|i| candidates.get(i)).ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "tree id {tree_id} out of range for {} medusa candidates",
                        candidates.len()
                    ))
                })?;
                next[slot * (tps - 1) + j] = to_i32(*token)?;
            }
        }
        Ok(())
    }

    fn pack_accepted_paths(
        inputs: &DecodingInputs<'_, CpuTensor>,
        outputs: &mut DecodingOutputs<CpuTensor>,
        dims: &StepDims,
        max_medusa_heads: usize,
    ) -> Result<()> {
        check_slots(inputs.batch_slots, dims)?;
        let medusa = medusa_inputs(inputs)?;
        let (mb, tps) = (dims.max_batch_size, dims.tokens_per_step);
        let path_len = max_medusa_heads + 1;
        let paths = i32_slice(medusa.paths, mb * tps * path_len, "medusa paths")?;

        let m = medusa_outputs(&mut outputs.medusa)?;
        let accepted_lengths = i32_slice(&m.accepted_lengths, mb, "accepted lengths")?;
        let best_path_ids = i32_slice(&m.best_path_ids, mb, "best path ids")?;
        let cum_sum = i32_slice_mut(&mut m.accepted_lengths_cum_sum, mb + 1, "accepted length prefix sums")?;
        let offsets = i32_slice_mut(&mut m.paths_offsets, mb * max_medusa_heads, "paths offsets")?;

        cum_sum[0] = 0;
        let mut packed = 0usize;
        for (bi, &slot) in inputs.batch_slots.iter().enumerate() {
            let drafts = to_index(accepted_lengths[slot]).unwrap_or(0).saturating_sub(1);
            let best_path = to_index(best_path_ids[slot]).unwrap_or(0);
            let path = &paths[(slot * tps + best_path) * path_len..(slot * tps + best_path + 1) * path_len];
            for &node in &path[1..=drafts.min(max_medusa_heads)] {
                offsets[packed] = node - 1;
                packed += 1;
            }
            cum_sum[bi + 1] = to_i32(packed)?;
        }
        Ok(())
    }
}
