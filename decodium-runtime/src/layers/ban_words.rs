//! Ban-words layer: bad words and no-repeat n-grams.

use decodium::io::{DecodingInputs, DecodingOutputs, StepDims};
use decodium::sampling_config::defaults;
use decodium::{DecodeBackend, DecoderDomain, Result, SamplingConfig};

use super::{to_i32_values, update_optional_i32};
use crate::Workspace;

pub struct BanWordsLayer<B: DecodeBackend> {
    ngram_sizes: Option<B::Tensor>,
    max_batch_size: usize,
}

impl<B: DecodeBackend> BanWordsLayer<B> {
    #[must_use]
    pub fn new(domain: &DecoderDomain) -> Self {
        Self {
            ngram_sizes: None,
            max_batch_size: domain.max_batch_size,
        }
    }

    pub fn setup(&mut self, batch_slots: &[usize], config: &SamplingConfig) -> Result<()> {
        let sizes = config
            .no_repeat_ngram_size
            .as_deref()
            .map(|v| to_i32_values("no_repeat_ngram_size", v))
            .transpose()?;
        update_optional_i32::<B>(
            &mut self.ngram_sizes,
            self.max_batch_size,
            batch_slots,
            sizes.as_deref(),
            defaults::NO_REPEAT_NGRAM_SIZE as i32,
        )
    }

    /// Mask banned continuations in the workspace. Both constraints are
    /// skipped when absent.
    pub fn forward(
        &self,
        workspace: &mut Workspace<B::Tensor>,
        inputs: &DecodingInputs<'_, B::Tensor>,
        outputs: &DecodingOutputs<B::Tensor>,
        dims: &StepDims,
    ) -> Result<()> {
        if let Some(bad_words) = inputs.bad_words {
            B::ban_bad_words(&mut workspace.runtime_logits, bad_words, inputs, outputs, dims)?;
        }
        if let Some(sizes) = &self.ngram_sizes {
            B::ban_repeat_ngrams(&mut workspace.runtime_logits, sizes, inputs, outputs, dims)?;
        }
        Ok(())
    }
}
