//! Per-slot sequence state: admission, extraction and slot recycling.

#![allow(clippy::module_name_repetitions)]

use decodium::io::{BeamHypotheses, DecodingInputs, DecodingOutputs, LogitsView, MedusaOutputs, DEAD_BEAM_LOG_PROB};
use decodium::tensor::{i32_from_index as to_i32, index_from_i32};
use decodium::{DType, DecodeBackend, DecoderDomain, Error, FinishReason, FinishedState, Result, SlotAllocator};

/// A request entering the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub prompt: Vec<i32>,
    pub end_id: i32,
    pub max_new_tokens: usize,
}

/// Which optional output buffers to allocate.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputOptions {
    /// `[MB, BW, L]` per-step log probabilities.
    pub output_log_probs: bool,
}

/// Sequence state of every slot of a decoder.
///
/// Owns the [`DecodingOutputs`] the pipeline writes and the per-slot inputs
/// (end ids, prompt lengths, limits) the pipeline reads. Slots are handed
/// out by a [`SlotAllocator`], so a released slot stays untouched until the
/// caller synchronizes.
pub struct DecoderState<B: DecodeBackend> {
    domain: DecoderDomain,
    beam_width: usize,
    slots: SlotAllocator,
    outputs: DecodingOutputs<B::Tensor>,
    end_ids: B::Tensor,
    input_lengths: B::Tensor,
    sequence_limits: B::Tensor,
    max_new_tokens: B::Tensor,
    /// Last step's cache indirection; `outputs.tgt_cache_indirection` is the
    /// next one.
    src_cache_indirection: Option<B::Tensor>,
}

impl<B: DecodeBackend> DecoderState<B> {
    /// Allocate state for `beam_width` beams per slot.
    ///
    /// Beam search (`beam_width > 1`) also gets the hypothesis store and the
    /// cache indirection buffers; a domain with Medusa heads gets the
    /// Medusa outputs.
    ///
    /// # Errors
    /// Returns a configuration error if the beam width does not fit the
    /// domain, or an allocation error from the backend.
    pub fn new(domain: &DecoderDomain, beam_width: usize, options: OutputOptions) -> Result<Self> {
        domain.validate()?;
        if beam_width == 0 || beam_width > domain.max_beam_width {
            return Err(Error::InvalidConfig(format!(
                "beam width {beam_width} outside 1..={}",
                domain.max_beam_width
            )));
        }
        let (mb, bw, l) = (domain.max_batch_size, beam_width, domain.max_seq_len);
        let tps = domain.max_tokens_per_step;
        let beam_search = bw > 1;

        let beam_hypotheses = if beam_search {
            Some(BeamHypotheses {
                output_ids: B::full_i32(&[mb, bw, l], -1)?,
                log_probs: B::zeros(&[mb, bw, l], DType::F32)?,
                sequence_lengths: B::zeros(&[mb, bw], DType::I32)?,
                cum_log_probs: B::zeros(&[mb, bw], DType::F32)?,
                normed_scores: B::zeros(&[mb, bw], DType::F32)?,
                num_beams: B::zeros(&[mb], DType::I32)?,
                min_normed_scores: B::zeros(&[mb], DType::F32)?,
                is_done: B::zeros(&[mb], DType::U8)?,
            })
        } else {
            None
        };
        let medusa = if domain.max_medusa_heads > 0 {
            let heads = domain.max_medusa_heads;
            Some(MedusaOutputs {
                next_draft_tokens: B::zeros(&[mb, tps.saturating_sub(1).max(1)], DType::I32)?,
                accepted_lengths: B::zeros(&[mb], DType::I32)?,
                accepted_lengths_cum_sum: B::zeros(&[mb + 1], DType::I32)?,
                paths_offsets: B::zeros(&[mb * heads], DType::I32)?,
                best_path_ids: B::zeros(&[mb], DType::I32)?,
            })
        } else {
            None
        };

        let outputs = DecodingOutputs {
            output_ids: B::zeros(&[mb, bw, l], DType::I32)?,
            parent_ids: B::zeros(&[mb, bw, l], DType::I32)?,
            sequence_lengths: B::zeros(&[mb, bw], DType::I32)?,
            finished: B::zeros(&[mb, bw], DType::U8)?,
            finished_sum: B::zeros(&[mb], DType::I32)?,
            new_tokens: B::zeros(&[tps, mb, bw], DType::I32)?,
            cum_log_probs: Some(B::zeros(&[mb, bw], DType::F32)?),
            output_log_probs: if options.output_log_probs {
                Some(B::zeros(&[mb, bw, l], DType::F32)?)
            } else {
                None
            },
            tgt_cache_indirection: if beam_search {
                Some(B::zeros(&[mb, bw, l], DType::I32)?)
            } else {
                None
            },
            beam_hypotheses,
            medusa,
        };
        log::debug!("decoder state: {mb} slots x {bw} beams x {l} tokens");

        Ok(Self {
            domain: domain.clone(),
            beam_width,
            slots: SlotAllocator::new(mb),
            outputs,
            end_ids: B::zeros(&[mb], DType::I32)?,
            input_lengths: B::zeros(&[mb, bw], DType::I32)?,
            sequence_limits: B::zeros(&[mb], DType::I32)?,
            max_new_tokens: B::zeros(&[mb], DType::I32)?,
            src_cache_indirection: if beam_search {
                Some(B::zeros(&[mb, bw, l], DType::I32)?)
            } else {
                None
            },
        })
    }

    /// Place `request` in a free slot and reset that slot's state.
    ///
    /// # Errors
    /// Returns [`Error::ResourceExhausted`] when no slot is free and
    /// [`Error::InvalidConfig`] for an empty or oversized prompt or an
    /// out-of-vocabulary token.
    pub fn admit(&mut self, request: &Request) -> Result<usize> {
        let (bw, l) = (self.beam_width, self.domain.max_seq_len);
        let len = request.prompt.len();
        if len == 0 || len >= l {
            return Err(Error::InvalidConfig(format!(
                "prompt of {len} tokens must be non-empty and shorter than max_seq_len {l}"
            )));
        }
        let vocab = self.domain.vocab_size;
        if let Some(&t) = request
            .prompt
            .iter()
            .find(|&&t| usize::try_from(t).map_or(true, |t| t >= vocab))
        {
            return Err(Error::InvalidConfig(format!("prompt token {t} outside vocabulary of {vocab}")));
        }
        let slot = self
            .slots
            .allocate()
            .ok_or_else(|| Error::ResourceExhausted("no free batch slot".into()))?;

        let len_i32 = to_i32(len)?;
        let limit = self.domain.sequence_limit(len, request.max_new_tokens);
        let mut ids_row = vec![0i32; l];
        ids_row[..len].copy_from_slice(&request.prompt);
        let out = &mut self.outputs;
        for beam in 0..bw {
            let row = (slot * bw + beam) * l;
            B::write_i32(&mut out.output_ids, row, &ids_row)?;
            B::write_i32(&mut out.parent_ids, row, &vec![to_i32(beam)?; l])?;
            if let Some(t) = out.output_log_probs.as_mut() {
                B::write_f32(t, row, &vec![0.0; l])?;
            }
            if let Some(t) = out.tgt_cache_indirection.as_mut() {
                B::write_i32(t, row, &vec![to_i32(beam)?; l])?;
            }
            if let Some(t) = self.src_cache_indirection.as_mut() {
                B::write_i32(t, row, &vec![to_i32(beam)?; l])?;
            }
        }
        B::write_i32(&mut out.sequence_lengths, slot * bw, &vec![len_i32; bw])?;
        B::write_i32(&mut self.input_lengths, slot * bw, &vec![len_i32; bw])?;
        B::write_u8(&mut out.finished, slot * bw, &vec![FinishedState::NOT_FINISHED.bits(); bw])?;
        B::write_i32(&mut out.finished_sum, slot, &[0])?;
        if let Some(t) = out.cum_log_probs.as_mut() {
            let mut cum = vec![DEAD_BEAM_LOG_PROB; bw];
            cum[0] = 0.0;
            B::write_f32(t, slot * bw, &cum)?;
        }
        if let Some(h) = out.beam_hypotheses.as_mut() {
            B::write_i32(&mut h.num_beams, slot, &[0])?;
            B::write_u8(&mut h.is_done, slot, &[0])?;
            B::write_f32(&mut h.min_normed_scores, slot, &[0.0])?;
            B::write_i32(&mut h.sequence_lengths, slot * bw, &vec![0; bw])?;
        }
        if let Some(m) = out.medusa.as_mut() {
            let drafts = self.domain.max_tokens_per_step.saturating_sub(1).max(1);
            B::write_i32(&mut m.next_draft_tokens, slot * drafts, &vec![0; drafts])?;
            B::write_i32(&mut m.accepted_lengths, slot, &[0])?;
            B::write_i32(&mut m.best_path_ids, slot, &[0])?;
        }
        B::write_i32(&mut self.end_ids, slot, &[request.end_id])?;
        B::write_i32(&mut self.sequence_limits, slot, &[to_i32(limit)?])?;
        B::write_i32(
            &mut self.max_new_tokens,
            slot,
            &[i32::try_from(request.max_new_tokens).unwrap_or(i32::MAX)],
        )?;
        log::debug!("admitted slot {slot}: {len} prompt tokens, length limit {limit}");
        Ok(slot)
    }

    /// Return `slot` to the allocator. It becomes reusable after
    /// [`synchronize`](Self::synchronize).
    ///
    /// # Errors
    /// Returns [`Error::SlotOutOfRange`] for a slot past the batch capacity
    /// and [`Error::InvalidConfig`] for a slot that is not admitted,
    /// including one already released.
    pub fn release(&mut self, slot: usize) -> Result<()> {
        self.check_slot(slot)?;
        if !self.slots.is_allocated(slot) {
            return Err(Error::InvalidConfig(format!("slot {slot} is not admitted")));
        }
        self.slots.release(slot);
        Ok(())
    }

    /// Recycle released slots once no in-flight step can touch them.
    pub fn synchronize(&mut self) {
        self.slots.synchronize();
    }

    #[must_use]
    pub fn slots(&self) -> &SlotAllocator {
        &self.slots
    }

    /// Generated tokens of every beam of `slot`, prompt excluded, recovered
    /// by following parent ids from the newest token back to the prompt.
    ///
    /// # Errors
    /// Returns an error if the slot is out of range or a buffer cannot be
    /// read.
    pub fn extract(&self, slot: usize) -> Result<Vec<Vec<i32>>> {
        self.check_slot(slot)?;
        let (bw, l) = (self.beam_width, self.domain.max_seq_len);
        let ids = B::to_i32_vec(&self.outputs.output_ids)?;
        let parents = B::to_i32_vec(&self.outputs.parent_ids)?;
        let seq_lens = B::to_i32_vec(&self.outputs.sequence_lengths)?;
        let input_lens = B::to_i32_vec(&self.input_lengths)?;
        let block = slot * bw * l;
        let (ids, parents) = (&ids[block..block + bw * l], &parents[block..block + bw * l]);

        (0..bw)
            .map(|beam| -> Result<Vec<i32>> {
                let seq_len = index_from_i32(seq_lens[slot * bw + beam], "sequence length")?.min(l);
                let input_len = index_from_i32(input_lens[slot * bw + beam], "input length")?.min(seq_len);
                let mut cur = beam;
                let mut tokens = Vec::with_capacity(seq_len - input_len);
                for pos in (input_len..seq_len).rev() {
                    tokens.push(ids[cur * l + pos]);
                    if bw > 1 {
                        let parent = index_from_i32(parents[cur * l + pos], "parent id")?;
                        if parent < bw {
                            cur = parent;
                        }
                    }
                }
                tokens.reverse();
                Ok(tokens)
            })
            .collect()
    }

    /// Termination flags of every beam of `slot`.
    ///
    /// # Errors
    /// Returns an error if the slot is out of range.
    pub fn finished_states(&self, slot: usize) -> Result<Vec<FinishedState>> {
        self.check_slot(slot)?;
        let bw = self.beam_width;
        let finished = B::to_u8_vec(&self.outputs.finished)?;
        Ok(finished[slot * bw..(slot + 1) * bw]
            .iter()
            .map(|&b| FinishedState::from_bits(b))
            .collect())
    }

    /// Whether every beam of `slot` is finished.
    ///
    /// # Errors
    /// Returns an error if the slot is out of range.
    pub fn is_finished(&self, slot: usize) -> Result<bool> {
        Ok(self.finished_states(slot)?.iter().all(|s| s.is_finished()))
    }

    /// Reason beam 0 of `slot` stopped, if it did.
    ///
    /// # Errors
    /// Returns an error if the slot is out of range.
    pub fn finish_reason(&self, slot: usize) -> Result<Option<FinishReason>> {
        Ok(self.finished_states(slot)?.first().and_then(|s| s.reason()))
    }

    /// Inputs of one step over `batch_slots` with every per-slot buffer this
    /// state owns attached, split from the outputs the step writes.
    pub fn step_io<'a>(
        &'a mut self,
        step: usize,
        logits: LogitsView<'a, B::Tensor>,
        batch_slots: &'a [usize],
    ) -> (DecodingInputs<'a, B::Tensor>, &'a mut DecodingOutputs<B::Tensor>) {
        let mut inputs = DecodingInputs::new(step, logits, batch_slots, &self.end_ids);
        inputs.input_lengths = Some(&self.input_lengths);
        inputs.sequence_limit_lengths = Some(&self.sequence_limits);
        inputs.max_new_tokens = Some(&self.max_new_tokens);
        inputs.src_cache_indirection = self.src_cache_indirection.as_ref();
        (inputs, &mut self.outputs)
    }

    /// Make this step's target cache indirection the next step's source.
    pub fn swap_cache_indirection(&mut self) {
        if let (Some(src), Some(tgt)) = (
            self.src_cache_indirection.as_mut(),
            self.outputs.tgt_cache_indirection.as_mut(),
        ) {
            std::mem::swap(src, tgt);
        }
    }

    #[must_use]
    pub fn outputs(&self) -> &DecodingOutputs<B::Tensor> {
        &self.outputs
    }

    pub fn outputs_mut(&mut self) -> &mut DecodingOutputs<B::Tensor> {
        &mut self.outputs
    }

    #[must_use]
    pub fn input_lengths(&self) -> &B::Tensor {
        &self.input_lengths
    }

    #[must_use]
    pub fn beam_width(&self) -> usize {
        self.beam_width
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot < self.domain.max_batch_size {
            Ok(())
        } else {
            Err(Error::SlotOutOfRange {
                slot,
                max_batch_size: self.domain.max_batch_size,
            })
        }
    }
}

impl<B: DecodeBackend> std::fmt::Debug for DecoderState<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderState")
            .field("beam_width", &self.beam_width)
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}
