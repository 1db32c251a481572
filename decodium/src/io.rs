//! Per-step decoding inputs and outputs.
//!
//! Buffers are indexed by physical slot unless noted otherwise. Shapes use
//! `MB` for `max_batch_size`, `BW` for the beam width, `L` for
//! `max_seq_len`, `TPS` for `max_tokens_per_step`, `H` for
//! `max_medusa_heads` and `VP` for the padded vocabulary size.

use crate::kv_cache::Rewind;
use crate::tensor::Tensor;
use crate::{Error, Result};

/// Logits handed to the pipeline by the forward pass.
///
/// Both forms must produce identical results.
#[derive(Debug)]
pub enum LogitsView<'a, T> {
    /// `[batch, BW, VP]` or `[batch, TPS, BW, VP]`, indexed by batch index.
    Dense(&'a T),
    /// One tensor per request, `[BW, VP]` or `[TPS, BW, VP]`, optionally
    /// with a leading dimension of 1.
    Ragged(&'a [T]),
}

impl<T> Clone for LogitsView<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for LogitsView<'_, T> {}

/// Logical logits geometry shared by both views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogitsShape {
    pub batch_size: usize,
    pub tokens_per_step: usize,
    pub beam_width: usize,
    pub vocab_size_padded: usize,
}

impl LogitsShape {
    /// Elements of one request's logits.
    #[must_use]
    pub fn request_stride(&self) -> usize {
        self.tokens_per_step * self.beam_width * self.vocab_size_padded
    }
}

impl<T: Tensor> LogitsView<'_, T> {
    /// Validate ranks and extract the logical geometry.
    ///
    /// # Errors
    /// Returns [`Error::InvalidShape`] for a dense tensor whose rank is
    /// neither 3 nor 4, for ragged views of inconsistent shape, or for a
    /// non-float dtype.
    pub fn shape(&self) -> Result<LogitsShape> {
        match self {
            Self::Dense(t) => {
                check_float(*t)?;
                match *t.shape() {
                    [batch, beam, vocab] => Ok(LogitsShape {
                        batch_size: batch,
                        tokens_per_step: 1,
                        beam_width: beam,
                        vocab_size_padded: vocab,
                    }),
                    [batch, tps, beam, vocab] => Ok(LogitsShape {
                        batch_size: batch,
                        tokens_per_step: tps,
                        beam_width: beam,
                        vocab_size_padded: vocab,
                    }),
                    _ => Err(Error::InvalidShape(format!(
                        "logits must have rank 3 or 4, got shape {:?}",
                        t.shape()
                    ))),
                }
            }
            Self::Ragged(ts) => {
                let mut per_request: Option<(usize, usize, usize)> = None;
                for t in ts.iter() {
                    check_float(t)?;
                    let dims = match *t.shape() {
                        [beam, vocab] | [1, beam, vocab] => (1, beam, vocab),
                        [tps, beam, vocab] | [1, tps, beam, vocab] => (tps, beam, vocab),
                        _ => {
                            return Err(Error::InvalidShape(format!(
                                "ragged logits must have rank 2 to 4, got shape {:?}",
                                t.shape()
                            )))
                        }
                    };
                    if per_request.is_some_and(|p| p != dims) {
                        return Err(Error::InvalidShape(
                            "ragged logits disagree on shape".into(),
                        ));
                    }
                    per_request = Some(dims);
                }
                let (tps, beam, vocab) = per_request.unwrap_or((1, 1, 0));
                Ok(LogitsShape {
                    batch_size: ts.len(),
                    tokens_per_step: tps,
                    beam_width: beam,
                    vocab_size_padded: vocab,
                })
            }
        }
    }
}

fn check_float<T: Tensor>(t: &T) -> Result<()> {
    if t.dtype().is_float() {
        Ok(())
    } else {
        Err(Error::DtypeMismatch {
            expected: "float logits".into(),
            got: t.dtype().to_string(),
        })
    }
}

/// Scalar dimensions of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDims {
    pub batch_size: usize,
    pub max_batch_size: usize,
    pub beam_width: usize,
    pub tokens_per_step: usize,
    pub vocab_size: usize,
    pub vocab_size_padded: usize,
    pub max_seq_len: usize,
}

impl StepDims {
    /// Elements of one request's rows in the runtime logits workspace.
    #[must_use]
    pub fn logits_stride(&self) -> usize {
        self.tokens_per_step * self.beam_width * self.vocab_size_padded
    }
}

/// Medusa-specific step inputs.
#[derive(Debug)]
pub struct MedusaInputs<'a, T> {
    /// `[MB, TPS, H + 1]` `I32`: tree paths as node indices, `-1` padded.
    pub paths: &'a T,
    /// `[MB, TPS - 1]` `I32`: the draft tokens the forward pass verified.
    pub draft_tokens: &'a T,
    /// `[H, batch, TPS, VP]` float: per-head logits, batch-index order.
    pub medusa_logits: &'a T,
    /// `[MB, TPS - 1]` `I32`: index into the concatenated per-head top-k
    /// candidates for every draft position of the next step.
    pub tree_ids: &'a T,
    /// `[MB]` `I32`: tokens per step for each slot.
    pub tokens_per_step: &'a T,
}

/// Inputs of one decoding step.
#[derive(Debug)]
pub struct DecodingInputs<'a, T> {
    pub step: usize,
    pub logits: LogitsView<'a, T>,
    /// Logical batch index to physical slot.
    pub batch_slots: &'a [usize],
    /// `[MB]` `I32`.
    pub end_ids: &'a T,
    /// `[MB, BW]` `I32`: prompt lengths. `None` treats every token as generated.
    pub input_lengths: Option<&'a T>,
    /// `[MB]` `I32`: absolute length limit per slot.
    pub sequence_limit_lengths: Option<&'a T>,
    /// `[MB]` `I32`: generated-token budget per slot.
    pub max_new_tokens: Option<&'a T>,
    /// `[MB, VP]` float.
    pub embedding_bias: Option<&'a T>,
    pub bad_words: Option<&'a crate::word_list::WordTable<T>>,
    pub stop_words: Option<&'a crate::word_list::WordTable<T>>,
    /// `[MB, BW, L]` `I32`: beam search cache indirection from the last step.
    pub src_cache_indirection: Option<&'a T>,
    pub medusa: Option<MedusaInputs<'a, T>>,
}

impl<'a, T> DecodingInputs<'a, T> {
    /// Inputs with only the required fields set.
    pub fn new(step: usize, logits: LogitsView<'a, T>, batch_slots: &'a [usize], end_ids: &'a T) -> Self {
        Self {
            step,
            logits,
            batch_slots,
            end_ids,
            input_lengths: None,
            sequence_limit_lengths: None,
            max_new_tokens: None,
            embedding_bias: None,
            bad_words: None,
            stop_words: None,
            src_cache_indirection: None,
            medusa: None,
        }
    }
}

/// Finished candidates kept per slot during beam search.
///
/// `BW` candidate rows per slot. Once full, a better candidate replaces the
/// lowest-scoring one.
#[derive(Debug, Clone)]
pub struct BeamHypotheses<T> {
    /// `[MB, BW, L]` `I32`: full token rows including the prompt and the
    /// end id, `-1` padded.
    pub output_ids: T,
    /// `[MB, BW, L]` F32: per-step log probabilities.
    pub log_probs: T,
    /// `[MB, BW]` `I32`: length without the end id.
    pub sequence_lengths: T,
    /// `[MB, BW]` F32.
    pub cum_log_probs: T,
    /// `[MB, BW]` F32: length-normalized scores.
    pub normed_scores: T,
    /// `[MB]` `I32`: candidates stored.
    pub num_beams: T,
    /// `[MB]` F32: lowest kept normalized score.
    pub min_normed_scores: T,
    /// `[MB]` `U8`: search finished for the slot.
    pub is_done: T,
}

/// Medusa-specific step outputs.
#[derive(Debug, Clone)]
pub struct MedusaOutputs<T> {
    /// `[MB, TPS - 1]` `I32`.
    pub next_draft_tokens: T,
    /// `[MB]` `I32`: tokens accepted this step, the target token included.
    pub accepted_lengths: T,
    /// `[MB + 1]` `I32`: prefix sum of accepted draft tokens, batch-index order.
    pub accepted_lengths_cum_sum: T,
    /// `[MB * H]` `I32`: packed accepted draft positions.
    pub paths_offsets: T,
    /// `[MB]` `I32`.
    pub best_path_ids: T,
}

/// Cumulative log probability given to every beam but beam 0 when a
/// request is admitted, so the first expansion only grows beam 0.
pub const DEAD_BEAM_LOG_PROB: f32 = -1.0e20;

/// Buffers written by a decoding step.
#[derive(Debug, Clone)]
pub struct DecodingOutputs<T> {
    /// `[MB, BW, L]` `I32`.
    pub output_ids: T,
    /// `[MB, BW, L]` `I32`: beam of the previous position each token extends.
    pub parent_ids: T,
    /// `[MB, BW]` `I32`.
    pub sequence_lengths: T,
    /// `[MB, BW]` `U8` of `FinishedState` bits.
    pub finished: T,
    /// `[MB]` `I32`.
    pub finished_sum: T,
    /// `[TPS, MB, BW]` `I32`.
    pub new_tokens: T,
    /// `[MB, BW]` F32.
    pub cum_log_probs: Option<T>,
    /// `[MB, BW, L]` F32.
    pub output_log_probs: Option<T>,
    /// `[MB, BW, L]` `I32`.
    pub tgt_cache_indirection: Option<T>,
    pub beam_hypotheses: Option<BeamHypotheses<T>>,
    pub medusa: Option<MedusaOutputs<T>>,
}

/// Final beams after [`gather`](crate::backend::BeamSearchOps::gather_beams).
#[derive(Debug, Clone)]
pub struct GatheredBeams<T> {
    /// `[MB, BW, L]` `I32`: best-first token rows including the prompt,
    /// `-1` padded.
    pub output_ids: T,
    /// `[MB, BW]` `I32`.
    pub sequence_lengths: T,
    /// `[MB, BW]` F32.
    pub cum_log_probs: T,
    /// `[MB, BW]` F32.
    pub normed_scores: T,
}

/// Parameters of a KV cache relocation after speculative acceptance.
#[derive(Debug)]
pub struct KvCacheUpdateParams<'a, T> {
    /// Logical sequence index to physical slot.
    pub batch_slots: &'a [usize],
    /// `[batch + 1]` `I32` prefix sums into `packed_accepted_indices`.
    pub accepted_offsets: &'a T,
    /// `I32` draft positions (relative to the pre-step cache length) of
    /// every accepted token, packed in sequence order.
    pub packed_accepted_indices: &'a T,
    /// `[MB]` `I32`: cache length per slot including speculative entries.
    pub past_kv_lengths: &'a T,
    pub rewind: Rewind<'a, T>,
}
