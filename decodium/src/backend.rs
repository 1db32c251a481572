//! Backend trait and op trait definitions for hardware-agnostic decoding.
//!
//! The pipeline in `decodium-runtime` is generic over `B: DecodeBackend`
//! and calls the per-stage op traits below. Each backend implements them
//! with its own tensor type.
//!
//! # Design notes
//!
//! - **Op traits extend `Backend`** and use `Self::Tensor` from the
//!   supertrait.
//! - **Per-slot configuration lives in tensors** owned by the layers and
//!   written once at setup (`PenaltyBuffers`, `SamplingBuffers`, ...).
//! - **Logits are never edited in the caller's tensor.** The penalty op
//!   copies them into a runtime workspace `[batch, TPS, BW, VP]` (batch
//!   index order) that ban words edits and the decoding ops only read.

use crate::dtype::DType;
use crate::io::{
    DecodingInputs, DecodingOutputs, GatheredBeams, KvCacheUpdateParams, LogitsView, StepDims,
};
use crate::kv_cache::KvCacheConfig;
use crate::tensor::Tensor;
use crate::word_list::WordTable;
use crate::Result;

// ---- Core backend trait ----

/// A compute backend.
pub trait Backend: 'static {
    /// The tensor type for this backend.
    type Tensor: Tensor + Clone + Send + std::fmt::Debug;

    /// Per-slot pseudo-random state, `max_batch_size` entries.
    type RngState: Send;

    /// KV cache storage the position updater relocates entries in.
    type KvCache: Send;
}

/// Tensor construction.
pub trait TensorFactory: Backend {
    fn zeros(shape: &[usize], dtype: DType) -> Result<Self::Tensor>;

    fn from_f32_slice(shape: &[usize], data: &[f32]) -> Result<Self::Tensor>;

    fn from_i32_slice(shape: &[usize], data: &[i32]) -> Result<Self::Tensor>;

    fn from_u8_slice(shape: &[usize], data: &[u8]) -> Result<Self::Tensor>;

    /// An `I32` tensor filled with `value`.
    fn full_i32(shape: &[usize], value: i32) -> Result<Self::Tensor> {
        let numel = shape.iter().product();
        Self::from_i32_slice(shape, &vec![value; numel])
    }

    /// An F32 tensor filled with `value`.
    fn full_f32(shape: &[usize], value: f32) -> Result<Self::Tensor> {
        let numel = shape.iter().product();
        Self::from_f32_slice(shape, &vec![value; numel])
    }
}

/// Host/device transfers.
///
/// These are the synchronization points of the pipeline; they are used at
/// setup and admission time, not inside a step.
pub trait TensorDataOps: Backend {
    /// Read a float tensor as f32, casting half types.
    fn to_f32_vec(tensor: &Self::Tensor) -> Result<Vec<f32>>;

    fn to_i32_vec(tensor: &Self::Tensor) -> Result<Vec<i32>>;

    fn to_u8_vec(tensor: &Self::Tensor) -> Result<Vec<u8>>;

    /// Overwrite `data.len()` elements starting at element `offset`.
    fn write_f32(tensor: &mut Self::Tensor, offset: usize, data: &[f32]) -> Result<()>;

    fn write_i32(tensor: &mut Self::Tensor, offset: usize, data: &[i32]) -> Result<()>;

    fn write_u8(tensor: &mut Self::Tensor, offset: usize, data: &[u8]) -> Result<()>;
}

// ---- Penalty ----

/// Per-slot penalty configuration, each `[MB]`.
///
/// A `None` buffer means the penalty is disabled for the whole batch.
#[derive(Debug, Clone)]
pub struct PenaltyBuffers<T> {
    /// F32 temperature.
    pub temperatures: Option<T>,
    /// F32 repetition penalty (1 disables).
    pub repetition_penalties: Option<T>,
    /// F32 presence penalty (0 disables).
    pub presence_penalties: Option<T>,
    /// F32 frequency penalty (0 disables).
    pub frequency_penalties: Option<T>,
    /// `I32` minimum generated length.
    pub min_lengths: Option<T>,
}

pub trait PenaltyOps: Backend {
    /// Copy `logits` into `runtime_logits` and apply, in order: embedding
    /// bias, temperature, repetition, presence and frequency penalties,
    /// then min-length masking of the end id. Padded vocabulary entries are
    /// forced to the lowest finite value.
    ///
    /// `occurrences` is an `I32` workspace of at least
    /// `batch_size * BW * vocab_size` elements.
    fn apply_penalties(
        logits: LogitsView<'_, Self::Tensor>,
        runtime_logits: &mut Self::Tensor,
        occurrences: &mut Self::Tensor,
        penalties: &PenaltyBuffers<Self::Tensor>,
        inputs: &DecodingInputs<'_, Self::Tensor>,
        outputs: &DecodingOutputs<Self::Tensor>,
        dims: &StepDims,
    ) -> Result<()>;
}

// ---- Ban words ----

pub trait BanWordsOps: Backend {
    /// Mask the completion token of every bad word whose prefix matches the
    /// trailing history of a beam.
    fn ban_bad_words(
        runtime_logits: &mut Self::Tensor,
        bad_words: &WordTable<Self::Tensor>,
        inputs: &DecodingInputs<'_, Self::Tensor>,
        outputs: &DecodingOutputs<Self::Tensor>,
        dims: &StepDims,
    ) -> Result<()>;

    /// Mask tokens that would repeat an n-gram already present in the
    /// history. `ngram_sizes` is `[MB]` `I32`; 0 disables a slot.
    fn ban_repeat_ngrams(
        runtime_logits: &mut Self::Tensor,
        ngram_sizes: &Self::Tensor,
        inputs: &DecodingInputs<'_, Self::Tensor>,
        outputs: &DecodingOutputs<Self::Tensor>,
        dims: &StepDims,
    ) -> Result<()>;
}

// ---- Top-k / top-p sampling ----

/// Per-slot sampling configuration, each `[MB]`.
#[derive(Debug, Clone)]
pub struct SamplingBuffers<T> {
    /// `I32` top-k; 0 disables.
    pub top_k: T,
    /// F32 current top-p (decays across steps); 0 disables.
    pub top_p: T,
    /// F32 top-p restored on a reset id.
    pub initial_top_p: T,
    /// F32 multiplicative decay.
    pub top_p_decay: T,
    /// F32 decay floor.
    pub top_p_min: T,
    /// `I32` reset token, `-1` for none.
    pub top_p_reset_ids: T,
    /// Report log probabilities over the renormalized top-k/top-p set
    /// instead of the full vocabulary. Batch-wide.
    pub normalize_log_probs: bool,
}

pub trait SamplingOps: Backend {
    /// Allocate unseeded state for `max_batch_size` slots.
    fn allocate_rng(max_batch_size: usize) -> Result<Self::RngState>;

    /// Seed the state of each slot in `batch_slots`. `seeds` holds one
    /// seed for every slot or one per batch index.
    fn seed_rng(state: &mut Self::RngState, batch_slots: &[usize], seeds: &[u64]) -> Result<()>;

    /// Select one token per active slot from the runtime logits
    /// `[batch, 1, 1, VP]` using each slot's top-k/top-p restriction,
    /// append it, update log probabilities, set the end-id flag and decay
    /// top-p.
    ///
    /// `compute_log_probs` is false when no log-probability output and no
    /// top-p slot needs a normalized distribution.
    fn sample_top_k_top_p(
        runtime_logits: &Self::Tensor,
        rng: &mut Self::RngState,
        params: &mut SamplingBuffers<Self::Tensor>,
        inputs: &DecodingInputs<'_, Self::Tensor>,
        outputs: &mut DecodingOutputs<Self::Tensor>,
        dims: &StepDims,
        compute_log_probs: bool,
    ) -> Result<()>;
}

// ---- Beam search ----

/// Per-slot beam search configuration, each `[MB]`.
#[derive(Debug, Clone)]
pub struct BeamSearchBuffers<T> {
    /// F32 rank-based diversity rate.
    pub diversity_rates: T,
    /// F32 length penalty exponent.
    pub length_penalties: T,
    /// `I32` early stopping mode.
    pub early_stopping: T,
}

pub trait BeamSearchOps: Backend {
    /// Expand every live beam, record finished candidates and keep the
    /// best `BW` continuations per slot.
    ///
    /// Requires `outputs.cum_log_probs` and `outputs.beam_hypotheses`.
    fn beam_search_step(
        runtime_logits: &Self::Tensor,
        params: &BeamSearchBuffers<Self::Tensor>,
        inputs: &DecodingInputs<'_, Self::Tensor>,
        outputs: &mut DecodingOutputs<Self::Tensor>,
        dims: &StepDims,
    ) -> Result<()>;

    /// Merge live beams into the finished candidates of every slot in
    /// `batch_slots` and write the best `BW` in score order.
    fn gather_beams(
        params: &BeamSearchBuffers<Self::Tensor>,
        batch_slots: &[usize],
        input_lengths: Option<&Self::Tensor>,
        outputs: &DecodingOutputs<Self::Tensor>,
        gathered: &mut GatheredBeams<Self::Tensor>,
        dims: &StepDims,
    ) -> Result<()>;
}

// ---- Medusa ----

/// Per-slot Medusa configuration.
#[derive(Debug, Clone)]
pub struct MedusaBuffers<T> {
    /// `[MB]` `I32`: top-k used to draw target tokens (0 means 1).
    pub top_k: T,
    /// `[MB, H]` `I32`: candidates taken from each head.
    pub top_k_heads: T,
    /// `[MB, TPS]` `I32` workspace of target tokens per tree node.
    pub target_tokens: T,
}

pub trait MedusaOps: Backend {
    /// Draw one target token per tree node of every active slot.
    fn sample_target_tokens(
        runtime_logits: &Self::Tensor,
        rng: &mut Self::RngState,
        params: &mut MedusaBuffers<Self::Tensor>,
        inputs: &DecodingInputs<'_, Self::Tensor>,
        outputs: &DecodingOutputs<Self::Tensor>,
        dims: &StepDims,
    ) -> Result<()>;

    /// Walk every tree path against the target tokens, take the longest
    /// accepted prefix, append its tokens and record the best path.
    fn accept_draft_tokens(
        params: &MedusaBuffers<Self::Tensor>,
        inputs: &DecodingInputs<'_, Self::Tensor>,
        outputs: &mut DecodingOutputs<Self::Tensor>,
        dims: &StepDims,
        max_medusa_heads: usize,
    ) -> Result<()>;

    /// Build the next step's draft tokens from the Medusa heads' top-k at
    /// the last accepted node.
    fn next_draft_tokens(
        params: &MedusaBuffers<Self::Tensor>,
        inputs: &DecodingInputs<'_, Self::Tensor>,
        outputs: &mut DecodingOutputs<Self::Tensor>,
        dims: &StepDims,
        max_medusa_heads: usize,
    ) -> Result<()>;

    /// Write the accepted-length prefix sums and the packed accepted draft
    /// positions consumed by the KV cache updater.
    fn pack_accepted_paths(
        inputs: &DecodingInputs<'_, Self::Tensor>,
        outputs: &mut DecodingOutputs<Self::Tensor>,
        dims: &StepDims,
        max_medusa_heads: usize,
    ) -> Result<()>;
}

// ---- Stop criteria ----

pub trait StopCriteriaOps: Backend {
    /// Set the stop-words flag of every beam whose history ends with a
    /// configured stop word.
    fn stop_words_criterion(
        stop_words: &WordTable<Self::Tensor>,
        inputs: &DecodingInputs<'_, Self::Tensor>,
        outputs: &mut DecodingOutputs<Self::Tensor>,
        dims: &StepDims,
    ) -> Result<()>;

    /// Set the length flags and recount `finished_sum` per slot.
    fn length_criterion(
        inputs: &DecodingInputs<'_, Self::Tensor>,
        outputs: &mut DecodingOutputs<Self::Tensor>,
        dims: &StepDims,
    ) -> Result<()>;
}

// ---- KV cache relocation ----

pub trait KvCacheOps: Backend {
    fn allocate_kv_cache(config: &KvCacheConfig) -> Result<Self::KvCache>;

    /// Move the K/V entries of every accepted draft token to the contiguous
    /// positions following the pre-step cache length, for every layer and
    /// head, and shorten each slot's cache to the accepted length.
    fn update_kv_cache_draft_token_location(
        cache: &mut Self::KvCache,
        params: &KvCacheUpdateParams<'_, Self::Tensor>,
    ) -> Result<()>;
}

/// Everything the decoding pipeline needs from a backend.
pub trait DecodeBackend:
    TensorFactory
    + TensorDataOps
    + PenaltyOps
    + BanWordsOps
    + SamplingOps
    + BeamSearchOps
    + MedusaOps
    + StopCriteriaOps
{
}

impl<B> DecodeBackend for B where
    B: TensorFactory
        + TensorDataOps
        + PenaltyOps
        + BanWordsOps
        + SamplingOps
        + BeamSearchOps
        + MedusaOps
        + StopCriteriaOps
{
}
