//! Top-k / top-p sampling layer.

use decodium::io::{DecodingInputs, DecodingOutputs, StepDims};
use decodium::sampling_config::defaults;
use decodium::{DecodeBackend, DecoderDomain, Result, SamplingBuffers, SamplingConfig};

use super::{to_i32_values, write_slots_f32, write_slots_i32};

pub struct SamplingLayer<B: DecodeBackend> {
    buffers: SamplingBuffers<B::Tensor>,
    rng: B::RngState,
    /// Whether any configured slot filters by top-p.
    uses_top_p: bool,
}

impl<B: DecodeBackend> SamplingLayer<B> {
    pub fn new(domain: &DecoderDomain) -> Result<Self> {
        let mb = domain.max_batch_size;
        Ok(Self {
            buffers: SamplingBuffers {
                top_k: B::full_i32(&[mb], defaults::TOP_K as i32)?,
                top_p: B::full_f32(&[mb], defaults::TOP_P)?,
                initial_top_p: B::full_f32(&[mb], defaults::TOP_P)?,
                top_p_decay: B::full_f32(&[mb], defaults::TOP_P_DECAY)?,
                top_p_min: B::full_f32(&[mb], defaults::TOP_P_MIN)?,
                top_p_reset_ids: B::full_i32(&[mb], defaults::TOP_P_RESET_ID)?,
                normalize_log_probs: defaults::NORMALIZE_LOG_PROBS,
            },
            rng: B::allocate_rng(mb)?,
            uses_top_p: false,
        })
    }

    pub fn setup(&mut self, batch_slots: &[usize], config: &SamplingConfig) -> Result<()> {
        let b = &mut self.buffers;
        let top_k = match config.top_k.as_deref() {
            Some(v) => to_i32_values("top_k", v)?,
            None => vec![defaults::TOP_K as i32],
        };
        write_slots_i32::<B>(&mut b.top_k, batch_slots, &top_k)?;
        let top_p = config.top_p.as_deref();
        write_slots_f32::<B>(&mut b.top_p, batch_slots, top_p, defaults::TOP_P)?;
        write_slots_f32::<B>(&mut b.initial_top_p, batch_slots, top_p, defaults::TOP_P)?;
        write_slots_f32::<B>(
            &mut b.top_p_decay,
            batch_slots,
            config.top_p_decay.as_deref(),
            defaults::TOP_P_DECAY,
        )?;
        write_slots_f32::<B>(
            &mut b.top_p_min,
            batch_slots,
            config.top_p_min.as_deref(),
            defaults::TOP_P_MIN,
        )?;
        let reset_ids = config
            .top_p_reset_ids
            .clone()
            .unwrap_or_else(|| vec![defaults::TOP_P_RESET_ID]);
        write_slots_i32::<B>(&mut b.top_p_reset_ids, batch_slots, &reset_ids)?;
        b.normalize_log_probs = config
            .normalize_log_probs
            .unwrap_or(defaults::NORMALIZE_LOG_PROBS);

        let seeds = config.random_seed.as_deref().unwrap_or(&[defaults::SEED]);
        B::seed_rng(&mut self.rng, batch_slots, seeds)?;
        self.uses_top_p = config.uses_top_p();
        log::debug!(
            "sampling setup: {} slots, top_p {}",
            batch_slots.len(),
            if self.uses_top_p { "on" } else { "off" }
        );
        Ok(())
    }

    pub fn forward(
        &mut self,
        runtime_logits: &B::Tensor,
        inputs: &DecodingInputs<'_, B::Tensor>,
        outputs: &mut DecodingOutputs<B::Tensor>,
        dims: &StepDims,
    ) -> Result<()> {
        let compute_log_probs =
            self.uses_top_p || outputs.cum_log_probs.is_some() || outputs.output_log_probs.is_some();
        B::sample_top_k_top_p(
            runtime_logits,
            &mut self.rng,
            &mut self.buffers,
            inputs,
            outputs,
            dims,
            compute_log_probs,
        )
    }
}
