//! The pipeline driver.
//!
//! [`DynamicDecodeLayer`] owns the stage list built by the
//! [factory](crate::factory) and the runtime logits workspace the stages
//! share. One step runs every stage in order:
//!
//! 1. penalty: copies the caller's logits into the workspace, then applies
//!    bias, temperature, penalties and min-length masking there
//! 2. ban words: masks bad-word completions and repeated n-grams in the
//!    workspace
//! 3. decoding: reads the workspace and appends tokens
//! 4. stop criteria: sets termination flags
//!
//! The caller's logits are never written. Only the penalty and ban-words
//! stages write the workspace.

#![allow(clippy::module_name_repetitions)]

use std::sync::Arc;

use decodium::io::{DecodingInputs, DecodingOutputs, GatheredBeams, StepDims};
use decodium::{
    BatchSlots, Comm, DType, DecodeBackend, DecoderDomain, DecodingMode, Error, Result, SamplingConfig,
};

use crate::factory;
use crate::layers::{DecodingLayer, Layer};

/// Buffers shared by the stages of one step.
#[derive(Debug)]
pub struct Workspace<T> {
    /// `[MB * TPS * BW * VP]` F32, batch-index order.
    pub runtime_logits: T,
    /// `[MB * BW * vocab]` `I32` token occurrence counts.
    pub occurrences: T,
}

/// Ordered decoding pipeline for one decoder instance.
pub struct DynamicDecodeLayer<B: DecodeBackend> {
    domain: DecoderDomain,
    /// Mode requested at construction, possibly `None`.
    requested_mode: DecodingMode,
    /// Mode the current layers were built for.
    mode: Option<DecodingMode>,
    layers: Vec<Layer<B>>,
    workspace: Workspace<B::Tensor>,
    beam_width: usize,
    comm: Option<Arc<dyn Comm>>,
}

impl<B: DecodeBackend> DynamicDecodeLayer<B> {
    /// Validate `domain` and allocate the shared workspace.
    ///
    /// An explicit `mode` builds its layers immediately. `None` defers
    /// layer creation to the first [`setup`](Self::setup), where the beam
    /// width decides between sampling and beam search.
    ///
    /// # Errors
    /// Returns a configuration error for an inconsistent domain and
    /// [`Error::ResourceExhausted`] when the workspace does not fit.
    pub fn new(mode: DecodingMode, domain: DecoderDomain) -> Result<Self> {
        domain.validate()?;
        let d = &domain;
        let logits_elems = d.workspace_elements(
            "runtime logits",
            &[d.max_batch_size, d.max_tokens_per_step, d.max_beam_width, d.vocab_size_padded],
            DType::F32.size_in_bytes(),
        )?;
        let occurrence_elems = d.workspace_elements(
            "occurrence counts",
            &[d.max_batch_size, d.max_beam_width, d.vocab_size],
            DType::I32.size_in_bytes(),
        )?;
        log::debug!(
            "decode workspace: {logits_elems} logits, {occurrence_elems} occurrence counters"
        );
        let workspace = Workspace {
            runtime_logits: B::zeros(&[logits_elems], DType::F32)?,
            occurrences: B::zeros(&[occurrence_elems], DType::I32)?,
        };

        let (layers, built_mode) = if mode.is_none() {
            (Vec::new(), None)
        } else {
            (factory::create_layers(mode, &domain)?, Some(mode))
        };

        Ok(Self {
            domain,
            requested_mode: mode,
            mode: built_mode,
            layers,
            workspace,
            beam_width: 1,
            comm: None,
        })
    }

    /// Broadcast each step's decoding result from rank 0 of `comm`.
    #[must_use]
    pub fn with_comm(mut self, comm: Arc<dyn Comm>) -> Self {
        self.comm = Some(comm);
        self
    }

    /// Resolved mode of the current batch, once set up.
    #[must_use]
    pub fn mode(&self) -> Option<DecodingMode> {
        self.mode
    }

    #[must_use]
    pub fn domain(&self) -> &DecoderDomain {
        &self.domain
    }

    #[must_use]
    pub fn layers(&self) -> &[Layer<B>] {
        &self.layers
    }

    /// Masked logits of the last step.
    #[must_use]
    pub fn runtime_logits(&self) -> &B::Tensor {
        &self.workspace.runtime_logits
    }

    /// Configure the slots of a new batch.
    ///
    /// # Errors
    /// Returns a configuration error if the slots are invalid, `config`
    /// breaks the broadcast rule or a value range, or the beam width does
    /// not fit the mode or the domain.
    pub fn setup(&mut self, batch_slots: &[usize], config: &SamplingConfig) -> Result<()> {
        BatchSlots::new(batch_slots.to_vec(), self.domain.max_batch_size)?;
        config.validate(batch_slots.len())?;
        if config.beam_width > self.domain.max_beam_width {
            return Err(Error::InvalidConfig(format!(
                "beam width {} exceeds max_beam_width {}",
                config.beam_width, self.domain.max_beam_width
            )));
        }
        let resolved = self.requested_mode.resolve(config.beam_width)?;
        if self.mode != Some(resolved) {
            self.layers = factory::create_layers(resolved, &self.domain)?;
            self.mode = Some(resolved);
        }
        for layer in &mut self.layers {
            layer.setup(batch_slots, config)?;
        }
        self.beam_width = config.beam_width;
        log::debug!(
            "setup {} slots, mode {resolved}, beam width {}",
            batch_slots.len(),
            config.beam_width
        );
        Ok(())
    }

    /// Run one decoding step.
    ///
    /// # Errors
    /// Returns an error if the logits do not match the domain or the
    /// configured beam width, if [`setup`](Self::setup) has not run, or if
    /// a stage or the collective fails.
    pub fn forward(
        &mut self,
        outputs: &mut DecodingOutputs<B::Tensor>,
        inputs: &DecodingInputs<'_, B::Tensor>,
    ) -> Result<()> {
        if self.layers.is_empty() {
            return Err(Error::InvalidConfig("forward called before setup".into()));
        }
        let dims = self.step_dims(inputs)?;

        let Self {
            layers,
            workspace,
            comm,
            ..
        } = self;
        for layer in layers.iter_mut() {
            log::trace!("step {}: {}", inputs.step, layer.layer_type());
            match layer {
                Layer::Penalty(l) => l.forward(inputs.logits, workspace, inputs, outputs, &dims)?,
                Layer::BanWords(l) => l.forward(workspace, inputs, outputs, &dims)?,
                Layer::Decoding(l) => {
                    l.forward(&workspace.runtime_logits, inputs, outputs, &dims)?;
                    if let Some(comm) = comm {
                        broadcast_outputs::<B>(&**comm, outputs)?;
                    }
                }
                Layer::StopCriteria(l) => l.forward::<B>(inputs, outputs, &dims)?,
            }
        }
        Ok(())
    }

    /// Write the final beams of `batch_slots` into `gathered`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidDecodingMode`] unless the pipeline runs beam
    /// search.
    pub fn gather_beams(
        &self,
        batch_slots: &[usize],
        input_lengths: Option<&B::Tensor>,
        outputs: &DecodingOutputs<B::Tensor>,
        gathered: &mut GatheredBeams<B::Tensor>,
    ) -> Result<()> {
        let beam = self.layers.iter().find_map(|l| match l {
            Layer::Decoding(DecodingLayer::BeamSearch(b)) => Some(b),
            _ => None,
        });
        let Some(beam) = beam else {
            return Err(Error::InvalidDecodingMode(
                "gathering beams requires beam search".into(),
            ));
        };
        let dims = StepDims {
            batch_size: batch_slots.len(),
            max_batch_size: self.domain.max_batch_size,
            beam_width: self.beam_width,
            tokens_per_step: 1,
            vocab_size: self.domain.vocab_size,
            vocab_size_padded: self.domain.vocab_size_padded,
            max_seq_len: self.domain.max_seq_len,
        };
        beam.gather(batch_slots, input_lengths, outputs, gathered, &dims)
    }

    fn step_dims(&self, inputs: &DecodingInputs<'_, B::Tensor>) -> Result<StepDims> {
        let shape = inputs.logits.shape()?;
        let d = &self.domain;
        if shape.batch_size != inputs.batch_slots.len() {
            return Err(Error::InvalidShape(format!(
                "logits hold {} requests for {} batch slots",
                shape.batch_size,
                inputs.batch_slots.len()
            )));
        }
        if shape.batch_size > d.max_batch_size
            || shape.beam_width != self.beam_width
            || shape.tokens_per_step > d.max_tokens_per_step
            || shape.vocab_size_padded != d.vocab_size_padded
        {
            return Err(Error::ShapeMismatch {
                expected: vec![d.max_batch_size, d.max_tokens_per_step, self.beam_width, d.vocab_size_padded],
                got: vec![
                    shape.batch_size,
                    shape.tokens_per_step,
                    shape.beam_width,
                    shape.vocab_size_padded,
                ],
            });
        }
        Ok(StepDims {
            batch_size: shape.batch_size,
            max_batch_size: d.max_batch_size,
            beam_width: shape.beam_width,
            tokens_per_step: shape.tokens_per_step,
            vocab_size: d.vocab_size,
            vocab_size_padded: d.vocab_size_padded,
            max_seq_len: d.max_seq_len,
        })
    }
}

impl<B: DecodeBackend> std::fmt::Debug for DynamicDecodeLayer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicDecodeLayer")
            .field("mode", &self.mode)
            .field("layers", &self.layers)
            .field("beam_width", &self.beam_width)
            .field("distributed", &self.comm.is_some())
            .finish_non_exhaustive()
    }
}

/// Make rank 0's step result authoritative on every rank.
fn broadcast_outputs<B: DecodeBackend>(comm: &dyn Comm, outputs: &mut DecodingOutputs<B::Tensor>) -> Result<()> {
    const ROOT: usize = 0;
    for t in [
        &mut outputs.output_ids,
        &mut outputs.parent_ids,
        &mut outputs.sequence_lengths,
        &mut outputs.new_tokens,
    ] {
        let mut data = B::to_i32_vec(t)?;
        comm.broadcast_i32(&mut data, ROOT)?;
        B::write_i32(t, 0, &data)?;
    }
    let mut finished = B::to_u8_vec(&outputs.finished)?;
    comm.broadcast_bytes(&mut finished, ROOT)?;
    B::write_u8(&mut outputs.finished, 0, &finished)?;
    comm.barrier()?;
    log::trace!("rank {} synchronized step outputs", comm.rank());
    Ok(())
}
