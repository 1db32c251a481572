//! Beam search layer.

use decodium::io::{DecodingInputs, DecodingOutputs, GatheredBeams, StepDims};
use decodium::sampling_config::defaults;
use decodium::{BeamSearchBuffers, DecodeBackend, DecoderDomain, Result, SamplingConfig};

use super::{write_slots_f32, write_slots_i32};

pub struct BeamSearchLayer<B: DecodeBackend> {
    buffers: BeamSearchBuffers<B::Tensor>,
}

impl<B: DecodeBackend> BeamSearchLayer<B> {
    pub fn new(domain: &DecoderDomain) -> Result<Self> {
        let mb = domain.max_batch_size;
        Ok(Self {
            buffers: BeamSearchBuffers {
                diversity_rates: B::full_f32(&[mb], defaults::BEAM_SEARCH_DIVERSITY)?,
                length_penalties: B::full_f32(&[mb], defaults::LENGTH_PENALTY)?,
                early_stopping: B::full_i32(&[mb], defaults::EARLY_STOPPING)?,
            },
        })
    }

    pub fn setup(&mut self, batch_slots: &[usize], config: &SamplingConfig) -> Result<()> {
        let b = &mut self.buffers;
        write_slots_f32::<B>(
            &mut b.diversity_rates,
            batch_slots,
            config.beam_search_diversity_rate.as_deref(),
            defaults::BEAM_SEARCH_DIVERSITY,
        )?;
        write_slots_f32::<B>(
            &mut b.length_penalties,
            batch_slots,
            config.length_penalty.as_deref(),
            defaults::LENGTH_PENALTY,
        )?;
        let early_stopping = config
            .early_stopping
            .clone()
            .unwrap_or_else(|| vec![defaults::EARLY_STOPPING]);
        write_slots_i32::<B>(&mut b.early_stopping, batch_slots, &early_stopping)
    }

    pub fn forward(
        &self,
        runtime_logits: &B::Tensor,
        inputs: &DecodingInputs<'_, B::Tensor>,
        outputs: &mut DecodingOutputs<B::Tensor>,
        dims: &StepDims,
    ) -> Result<()> {
        B::beam_search_step(runtime_logits, &self.buffers, inputs, outputs, dims)
    }

    pub fn gather(
        &self,
        batch_slots: &[usize],
        input_lengths: Option<&B::Tensor>,
        outputs: &DecodingOutputs<B::Tensor>,
        gathered: &mut GatheredBeams<B::Tensor>,
        dims: &StepDims,
    ) -> Result<()> {
        B::gather_beams(&self.buffers, batch_slots, input_lengths, outputs, gathered, dims)
    }
}
