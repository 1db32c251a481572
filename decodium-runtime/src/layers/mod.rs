//! Pipeline layers.
//!
//! A pipeline is an ordered list of [`Layer`]s. Each layer is configured
//! once per batch through `setup` and then run once per step by
//! [`DynamicDecodeLayer`](crate::DynamicDecodeLayer), which is the only
//! place the layer list is dispatched on.

mod ban_words;
mod beam_search;
mod decoding;
mod medusa;
mod penalty;
mod sampling;
mod stop_criteria;

use std::fmt;

use decodium::sampling_config::broadcast_value;
use decodium::{DecodeBackend, Error, Result, SamplingConfig};

pub use ban_words::BanWordsLayer;
pub use beam_search::BeamSearchLayer;
pub use decoding::DecodingLayer;
pub use medusa::MedusaLayer;
pub use penalty::PenaltyLayer;
pub use sampling::SamplingLayer;
pub use stop_criteria::StopCriteriaLayer;

/// Kind of a pipeline stage, in the order stages may appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerType {
    Penalty,
    BanWords,
    Decoding,
    StopCriteria,
}

impl fmt::Display for LayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Penalty => "penalty",
            Self::BanWords => "ban_words",
            Self::Decoding => "decoding",
            Self::StopCriteria => "stop_criteria",
        };
        f.write_str(name)
    }
}

/// One stage of the pipeline.
pub enum Layer<B: DecodeBackend> {
    Penalty(PenaltyLayer<B>),
    BanWords(BanWordsLayer<B>),
    Decoding(DecodingLayer<B>),
    StopCriteria(StopCriteriaLayer),
}

impl<B: DecodeBackend> Layer<B> {
    #[must_use]
    pub fn layer_type(&self) -> LayerType {
        match self {
            Self::Penalty(_) => LayerType::Penalty,
            Self::BanWords(_) => LayerType::BanWords,
            Self::Decoding(_) => LayerType::Decoding,
            Self::StopCriteria(_) => LayerType::StopCriteria,
        }
    }

    /// Write the per-slot configuration of a new batch.
    ///
    /// # Errors
    /// Returns an error if `config` holds values the layer rejects.
    pub fn setup(&mut self, batch_slots: &[usize], config: &SamplingConfig) -> Result<()> {
        match self {
            Self::Penalty(l) => l.setup(batch_slots, config),
            Self::BanWords(l) => l.setup(batch_slots, config),
            Self::Decoding(l) => l.setup(batch_slots, config),
            Self::StopCriteria(_) => Ok(()),
        }
    }
}

impl<B: DecodeBackend> fmt::Debug for Layer<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Layer({})", self.layer_type())
    }
}

// ---- Per-slot buffer helpers ----

/// Write `values[bi]` (broadcast rule) to `slot` for every batch entry.
pub(crate) fn write_slots_f32<B: DecodeBackend>(
    tensor: &mut B::Tensor,
    batch_slots: &[usize],
    values: Option<&[f32]>,
    default: f32,
) -> Result<()> {
    for (bi, &slot) in batch_slots.iter().enumerate() {
        B::write_f32(tensor, slot, &[broadcast_value(values, bi, default)])?;
    }
    Ok(())
}

pub(crate) fn write_slots_i32<B: DecodeBackend>(
    tensor: &mut B::Tensor,
    batch_slots: &[usize],
    values: &[i32],
) -> Result<()> {
    for (bi, &slot) in batch_slots.iter().enumerate() {
        B::write_i32(tensor, slot, &[broadcast_value(Some(values), bi, 0)])?;
    }
    Ok(())
}

/// Convert unsigned config values to the `I32` layout of the buffers.
pub(crate) fn to_i32_values(name: &str, values: &[u32]) -> Result<Vec<i32>> {
    values
        .iter()
        .map(|&v| {
            i32::try_from(v).map_err(|_| Error::InvalidConfig(format!("{name} value {v} overflows i32")))
        })
        .collect()
}

/// Lazily allocated `[MB]` F32 buffer: stays `None` until a batch sets it.
pub(crate) fn update_optional_f32<B: DecodeBackend>(
    buffer: &mut Option<B::Tensor>,
    max_batch_size: usize,
    batch_slots: &[usize],
    values: Option<&[f32]>,
    default: f32,
) -> Result<()> {
    if values.is_none() && buffer.is_none() {
        return Ok(());
    }
    if buffer.is_none() {
        *buffer = Some(B::full_f32(&[max_batch_size], default)?);
    }
    if let Some(t) = buffer.as_mut() {
        write_slots_f32::<B>(t, batch_slots, values, default)?;
    }
    Ok(())
}

/// Lazily allocated `[MB]` `I32` buffer.
pub(crate) fn update_optional_i32<B: DecodeBackend>(
    buffer: &mut Option<B::Tensor>,
    max_batch_size: usize,
    batch_slots: &[usize],
    values: Option<&[i32]>,
    default: i32,
) -> Result<()> {
    if values.is_none() && buffer.is_none() {
        return Ok(());
    }
    if buffer.is_none() {
        *buffer = Some(B::full_i32(&[max_batch_size], default)?);
    }
    if let Some(t) = buffer.as_mut() {
        match values {
            Some(v) => write_slots_i32::<B>(t, batch_slots, v)?,
            None => write_slots_i32::<B>(t, batch_slots, &[default])?,
        }
    }
    Ok(())
}
