//! Decodium: batched token decoding for LLM serving
//!
//! This crate provides the backend-agnostic types and traits of the
//! decoding core: configuration, slot bookkeeping, word tables, step I/O
//! buffers and the per-stage op traits. Backend implementations (CPU, ...)
//! and the layer pipeline live in separate crates.

#[allow(clippy::missing_errors_doc, clippy::doc_markdown)]
pub mod backend;
pub mod comm;
pub mod decoding_mode;
pub mod domain;
pub mod dtype;
pub mod error;
pub mod finished;
pub mod io;
pub mod kv_cache;
pub mod sampling_config;
pub mod slots;
pub mod tensor;
pub mod word_list;

pub use backend::{
    Backend, BanWordsOps, BeamSearchBuffers, BeamSearchOps, DecodeBackend, KvCacheOps,
    MedusaBuffers, MedusaOps, PenaltyBuffers, PenaltyOps, SamplingBuffers, SamplingOps,
    StopCriteriaOps, TensorDataOps, TensorFactory,
};
pub use comm::{Comm, LocalComm, SingleRank};
pub use decoding_mode::{DecodingMode, DecodingVariant};
pub use domain::DecoderDomain;
pub use dtype::{DType, TensorDType};
pub use error::{Error, Result};
pub use finished::{FinishReason, FinishedState};
pub use io::{
    BeamHypotheses, DecodingInputs, DEAD_BEAM_LOG_PROB, DecodingOutputs, GatheredBeams, KvCacheUpdateParams,
    LogitsShape, LogitsView, MedusaInputs, MedusaOutputs, StepDims,
};
pub use kv_cache::{BlockAllocator, BlockTable, KvCacheConfig, KvCacheLayout, Rewind};
pub use sampling_config::{broadcast_value, defaults, SamplingConfig};
pub use slots::{BatchSlots, SlotAllocator};
pub use tensor::{i32_from_index, index_from_i32, Tensor};
pub use word_list::{word_spans, WordList, WordTable};
