//! Stop-criteria layer.

use std::marker::PhantomData;

use decodium::io::{DecodingInputs, DecodingOutputs, StepDims};
use decodium::{DecodeBackend, Result};

/// Stop words (when a table is given) followed by the length criterion.
#[derive(Debug, Default)]
pub struct StopCriteriaLayer {
    _private: PhantomData<()>,
}

impl StopCriteriaLayer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forward<B: DecodeBackend>(
        &self,
        inputs: &DecodingInputs<'_, B::Tensor>,
        outputs: &mut DecodingOutputs<B::Tensor>,
        dims: &StepDims,
    ) -> Result<()> {
        if let Some(stop_words) = inputs.stop_words {
            B::stop_words_criterion(stop_words, inputs, outputs, dims)?;
        }
        B::length_criterion(inputs, outputs, dims)
    }
}
