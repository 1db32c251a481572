//! Layer factory: the ordered stage list of a decoding mode.

use decodium::{DecodeBackend, DecoderDomain, DecodingMode, DecodingVariant, Error, Result};

use crate::layers::{
    BanWordsLayer, DecodingLayer, Layer, LayerType, PenaltyLayer, StopCriteriaLayer,
};

/// Stages run for a resolved `mode`, in order.
///
/// Medusa skips ban words: draft verification compares against the raw
/// target distribution.
///
/// # Errors
/// Returns [`Error::InvalidDecodingMode`] for an unresolved `None` mode.
pub fn layer_types(mode: DecodingMode) -> Result<Vec<LayerType>> {
    Ok(match mode.variant()? {
        DecodingVariant::TopKTopP | DecodingVariant::BeamSearch => vec![
            LayerType::Penalty,
            LayerType::BanWords,
            LayerType::Decoding,
            LayerType::StopCriteria,
        ],
        DecodingVariant::Medusa => vec![
            LayerType::Penalty,
            LayerType::Decoding,
            LayerType::StopCriteria,
        ],
    })
}

/// Build the layers of a resolved `mode`.
///
/// # Errors
/// Returns an error if the mode is unresolved or a layer cannot allocate
/// its buffers.
pub fn create_layers<B: DecodeBackend>(mode: DecodingMode, domain: &DecoderDomain) -> Result<Vec<Layer<B>>> {
    let types = layer_types(mode)?;
    let layers = build_layers(&types, mode.variant()?, domain)?;
    log::debug!(
        "created {} layers for mode {mode}: {}",
        layers.len(),
        types.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> ")
    );
    Ok(layers)
}

/// Instantiate `types` in order. The penalty layer must come first since
/// it fills the runtime logits every later stage reads.
///
/// # Errors
/// Returns [`Error::InvalidConfig`] when `types` does not start with
/// [`LayerType::Penalty`] or names a stage twice.
pub fn build_layers<B: DecodeBackend>(
    types: &[LayerType],
    variant: DecodingVariant,
    domain: &DecoderDomain,
) -> Result<Vec<Layer<B>>> {
    if types.first() != Some(&LayerType::Penalty) {
        return Err(Error::InvalidConfig(format!(
            "the penalty layer must be first, got {types:?}"
        )));
    }
    for (i, t) in types.iter().enumerate() {
        if types[..i].contains(t) {
            return Err(Error::InvalidConfig(format!("layer {t} appears more than once")));
        }
    }
    types
        .iter()
        .map(|t| {
            Ok(match t {
                LayerType::Penalty => Layer::Penalty(PenaltyLayer::new(domain)),
                LayerType::BanWords => Layer::BanWords(BanWordsLayer::new(domain)),
                LayerType::Decoding => Layer::Decoding(DecodingLayer::new(variant, domain)?),
                LayerType::StopCriteria => Layer::StopCriteria(StopCriteriaLayer::new()),
            })
        })
        .collect()
}
