//! Decodium Runtime: the dynamic decode pipeline
//!
//! This crate composes the per-stage backend ops into the step pipeline a
//! serving loop calls once per forward pass.
//!
//! # Architecture
//!
//! ```text
//! DynamicDecodeLayer<B>      ← setup per batch, forward per step
//!   ├── PenaltyLayer         ← logits -> runtime logits workspace
//!   ├── BanWordsLayer        ← masks the workspace (not for Medusa)
//!   ├── DecodingLayer        ← TopKTopP | BeamSearch | Medusa
//!   └── StopCriteriaLayer    ← stop words, length limits
//! DecoderState<B>            ← per-slot sequence buffers and admission
//! KvCacheUpdater<B>          ← cache compaction after Medusa acceptance
//! ```

mod dynamic_decode;
pub mod factory;
mod kv_cache_updater;
pub mod layers;
mod state;

pub use dynamic_decode::{DynamicDecodeLayer, Workspace};
pub use factory::{create_layers, layer_types};
pub use kv_cache_updater::KvCacheUpdater;
pub use layers::{Layer, LayerType};
pub use state::{DecoderState, OutputOptions, Request};
