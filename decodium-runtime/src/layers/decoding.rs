//! The decoding stage, one of three algorithms.

use decodium::io::{DecodingInputs, DecodingOutputs, StepDims};
use decodium::{DecodeBackend, DecoderDomain, DecodingVariant, Result, SamplingConfig};

use super::{BeamSearchLayer, MedusaLayer, SamplingLayer};

pub enum DecodingLayer<B: DecodeBackend> {
    TopKTopP(SamplingLayer<B>),
    BeamSearch(BeamSearchLayer<B>),
    Medusa(MedusaLayer<B>),
}

impl<B: DecodeBackend> DecodingLayer<B> {
    pub fn new(variant: DecodingVariant, domain: &DecoderDomain) -> Result<Self> {
        Ok(match variant {
            DecodingVariant::TopKTopP => Self::TopKTopP(SamplingLayer::new(domain)?),
            DecodingVariant::BeamSearch => Self::BeamSearch(BeamSearchLayer::new(domain)?),
            DecodingVariant::Medusa => Self::Medusa(MedusaLayer::new(domain)?),
        })
    }

    #[must_use]
    pub fn variant(&self) -> DecodingVariant {
        match self {
            Self::TopKTopP(_) => DecodingVariant::TopKTopP,
            Self::BeamSearch(_) => DecodingVariant::BeamSearch,
            Self::Medusa(_) => DecodingVariant::Medusa,
        }
    }

    pub fn setup(&mut self, batch_slots: &[usize], config: &SamplingConfig) -> Result<()> {
        match self {
            Self::TopKTopP(l) => l.setup(batch_slots, config),
            Self::BeamSearch(l) => l.setup(batch_slots, config),
            Self::Medusa(l) => l.setup(batch_slots, config),
        }
    }

    pub fn forward(
        &mut self,
        runtime_logits: &B::Tensor,
        inputs: &DecodingInputs<'_, B::Tensor>,
        outputs: &mut DecodingOutputs<B::Tensor>,
        dims: &StepDims,
    ) -> Result<()> {
        match self {
            Self::TopKTopP(l) => l.forward(runtime_logits, inputs, outputs, dims),
            Self::BeamSearch(l) => l.forward(runtime_logits, inputs, outputs, dims),
            Self::Medusa(l) => l.forward(runtime_logits, inputs, outputs, dims),
        }
    }
}
