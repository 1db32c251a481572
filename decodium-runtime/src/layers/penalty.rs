//! Penalty layer: temperature, repetition/presence/frequency penalties and
//! min-length masking.

use decodium::io::{DecodingInputs, DecodingOutputs, LogitsView, StepDims};
use decodium::sampling_config::defaults;
use decodium::{DecodeBackend, DecoderDomain, PenaltyBuffers, Result, SamplingConfig};

use super::{to_i32_values, update_optional_f32, update_optional_i32};
use crate::Workspace;

/// Always the first stage of a pipeline. Buffers stay unallocated (and the
/// corresponding penalty disabled) until a batch sets them.
pub struct PenaltyLayer<B: DecodeBackend> {
    buffers: PenaltyBuffers<B::Tensor>,
    max_batch_size: usize,
}

impl<B: DecodeBackend> PenaltyLayer<B> {
    #[must_use]
    pub fn new(domain: &DecoderDomain) -> Self {
        Self {
            buffers: PenaltyBuffers {
                temperatures: None,
                repetition_penalties: None,
                presence_penalties: None,
                frequency_penalties: None,
                min_lengths: None,
            },
            max_batch_size: domain.max_batch_size,
        }
    }

    pub fn setup(&mut self, batch_slots: &[usize], config: &SamplingConfig) -> Result<()> {
        if config.temperature.as_deref().is_some_and(|t| t.contains(&0.0)) {
            log::warn!("temperature 0 is clamped to 1e-6");
        }
        let mb = self.max_batch_size;
        let b = &mut self.buffers;
        update_optional_f32::<B>(
            &mut b.temperatures,
            mb,
            batch_slots,
            config.temperature.as_deref(),
            defaults::TEMPERATURE,
        )?;
        update_optional_f32::<B>(
            &mut b.repetition_penalties,
            mb,
            batch_slots,
            config.repetition_penalty.as_deref(),
            defaults::REPETITION_PENALTY,
        )?;
        update_optional_f32::<B>(
            &mut b.presence_penalties,
            mb,
            batch_slots,
            config.presence_penalty.as_deref(),
            defaults::PRESENCE_PENALTY,
        )?;
        update_optional_f32::<B>(
            &mut b.frequency_penalties,
            mb,
            batch_slots,
            config.frequency_penalty.as_deref(),
            defaults::FREQUENCY_PENALTY,
        )?;
        let min_lengths = config
            .min_length
            .as_deref()
            .map(|v| to_i32_values("min_length", v))
            .transpose()?;
        update_optional_i32::<B>(
            &mut b.min_lengths,
            mb,
            batch_slots,
            min_lengths.as_deref(),
            defaults::MIN_LENGTH as i32,
        )?;
        Ok(())
    }

    /// Copy `logits` into the workspace and apply the configured penalties.
    pub fn forward(
        &self,
        logits: LogitsView<'_, B::Tensor>,
        workspace: &mut Workspace<B::Tensor>,
        inputs: &DecodingInputs<'_, B::Tensor>,
        outputs: &DecodingOutputs<B::Tensor>,
        dims: &StepDims,
    ) -> Result<()> {
        B::apply_penalties(
            logits,
            &mut workspace.runtime_logits,
            &mut workspace.occurrences,
            &self.buffers,
            inputs,
            outputs,
            dims,
        )
    }

    #[must_use]
    pub fn buffers(&self) -> &PenaltyBuffers<B::Tensor> {
        &self.buffers
    }
}
