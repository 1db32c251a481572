//! Medusa speculative decoding layer.

use decodium::io::{DecodingInputs, DecodingOutputs, StepDims};
use decodium::sampling_config::defaults;
use decodium::{DType, DecodeBackend, DecoderDomain, Error, MedusaBuffers, Result, SamplingConfig};

use super::{to_i32_values, write_slots_i32};

pub struct MedusaLayer<B: DecodeBackend> {
    buffers: MedusaBuffers<B::Tensor>,
    rng: B::RngState,
    max_medusa_heads: usize,
}

impl<B: DecodeBackend> MedusaLayer<B> {
    pub fn new(domain: &DecoderDomain) -> Result<Self> {
        let (mb, heads, tps) = (
            domain.max_batch_size,
            domain.max_medusa_heads,
            domain.max_tokens_per_step,
        );
        if heads == 0 {
            return Err(Error::InvalidConfig("medusa decoding needs at least one head".into()));
        }
        Ok(Self {
            buffers: MedusaBuffers {
                top_k: B::full_i32(&[mb], 1)?,
                top_k_heads: B::zeros(&[mb, heads], DType::I32)?,
                target_tokens: B::zeros(&[mb, tps], DType::I32)?,
            },
            rng: B::allocate_rng(mb)?,
            max_medusa_heads: heads,
        })
    }

    pub fn setup(&mut self, batch_slots: &[usize], config: &SamplingConfig) -> Result<()> {
        let top_k = match config.top_k.as_deref() {
            Some(v) => to_i32_values("top_k", v)?,
            None => vec![1],
        };
        write_slots_i32::<B>(&mut self.buffers.top_k, batch_slots, &top_k)?;

        let heads = self.max_medusa_heads;
        let per_request = config.top_k_medusa_heads.as_deref().unwrap_or_default();
        let fallback = defaults::top_k_medusa_heads();
        for (bi, &slot) in batch_slots.iter().enumerate() {
            let ks = match per_request {
                [] => &fallback,
                [one] => one,
                many => many.get(bi).unwrap_or(&fallback),
            };
            if ks.len() > heads {
                return Err(Error::InvalidConfig(format!(
                    "request {bi} configures {} medusa heads, the decoder has {heads}",
                    ks.len()
                )));
            }
            let mut row = to_i32_values("top_k_medusa_heads", ks)?;
            row.resize(heads, 0);
            B::write_i32(&mut self.buffers.top_k_heads, slot * heads, &row)?;
        }

        let seeds = config.random_seed.as_deref().unwrap_or(&[defaults::SEED]);
        B::seed_rng(&mut self.rng, batch_slots, seeds)
    }

    /// Verify the drafts of the previous step, append the accepted tokens
    /// and propose the next drafts.
    pub fn forward(
        &mut self,
        runtime_logits: &B::Tensor,
        inputs: &DecodingInputs<'_, B::Tensor>,
        outputs: &mut DecodingOutputs<B::Tensor>,
        dims: &StepDims,
    ) -> Result<()> {
        let heads = self.max_medusa_heads;
        B::sample_target_tokens(runtime_logits, &mut self.rng, &mut self.buffers, inputs, outputs, dims)?;
        B::accept_draft_tokens(&self.buffers, inputs, outputs, dims, heads)?;
        B::next_draft_tokens(&self.buffers, inputs, outputs, dims, heads)?;
        B::pack_accepted_paths(inputs, outputs, dims, heads)
    }

    #[must_use]
    pub fn max_medusa_heads(&self) -> usize {
        self.max_medusa_heads
    }
}
