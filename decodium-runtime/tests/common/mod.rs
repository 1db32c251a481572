//! Shared helpers for the pipeline integration tests.

#![allow(dead_code)]

use decodium::io::{DecodingOutputs, LogitsView, MedusaInputs};
use decodium::{DecoderDomain, DecodingMode, Result, SamplingConfig, WordTable};
use decodium_cpu::{CpuBackend, CpuTensor};
use decodium_runtime::{DecoderState, DynamicDecodeLayer, OutputOptions, Request};

/// Log-space stand-in for a zero probability.
pub const NEG: f32 = -1.0e9;

/// The step-0 distribution over a vocabulary of 9: 0.4/0.3/0.2/0.1 on
/// tokens 4..=7.
pub const STEP0_PROBS: [f32; 9] = [0.0, 0.0, 0.0, 0.0, 0.4, 0.3, 0.2, 0.1, 0.0];

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `ln(p)` per entry, with zero probabilities mapped to [`NEG`].
pub fn log_probs(probs: &[f32]) -> Vec<f32> {
    probs.iter().map(|&p| if p > 0.0 { p.ln() } else { NEG }).collect()
}

/// Dense `[batch, 1, V]` logits with every request seeing `row`.
pub fn dense_logits(batch: usize, row: &[f32]) -> CpuTensor {
    let data: Vec<f32> = (0..batch).flat_map(|_| row.iter().copied()).collect();
    CpuTensor::from_f32(&[batch, 1, row.len()], &data)
}

/// Dense `[batch, beam, V]` logits from explicit rows, batch-major.
pub fn logits_from_rows(batch: usize, beam: usize, rows: &[Vec<f32>]) -> CpuTensor {
    let vocab = rows.first().map_or(0, Vec::len);
    let data: Vec<f32> = rows.iter().flatten().copied().collect();
    CpuTensor::from_f32(&[batch, beam, vocab], &data)
}

/// Optional per-step inputs.
#[derive(Default)]
pub struct Extras<'a> {
    pub bad_words: Option<&'a WordTable<CpuTensor>>,
    pub stop_words: Option<&'a WordTable<CpuTensor>>,
    pub embedding_bias: Option<&'a CpuTensor>,
    pub medusa: Option<MedusaInputs<'a, CpuTensor>>,
}

pub struct Decoder {
    pub pipeline: DynamicDecodeLayer<CpuBackend>,
    pub state: DecoderState<CpuBackend>,
    pub slots: Vec<usize>,
    pub step: usize,
}

impl Decoder {
    /// Admit one request per prompt and set the batch up with `config`.
    pub fn new(
        mode: DecodingMode,
        domain: DecoderDomain,
        config: &SamplingConfig,
        prompts: &[Vec<i32>],
        end_id: i32,
        max_new_tokens: usize,
    ) -> Result<Self> {
        let mut state = DecoderState::new(&domain, config.beam_width, OutputOptions::default())?;
        let slots = prompts
            .iter()
            .map(|p| {
                state.admit(&Request {
                    prompt: p.clone(),
                    end_id,
                    max_new_tokens,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let mut pipeline = DynamicDecodeLayer::new(mode, domain)?;
        pipeline.setup(&slots, config)?;
        Ok(Self {
            pipeline,
            state,
            slots,
            step: 0,
        })
    }

    /// Run one step over every admitted slot.
    pub fn step(&mut self, logits: &CpuTensor) -> Result<()> {
        self.step_with(logits, Extras::default())
    }

    /// Run one step with optional inputs attached.
    pub fn step_with(&mut self, logits: &CpuTensor, extras: Extras<'_>) -> Result<()> {
        let step = self.step;
        let (mut inputs, outputs) = self.state.step_io(step, LogitsView::Dense(logits), &self.slots);
        inputs.bad_words = extras.bad_words;
        inputs.stop_words = extras.stop_words;
        inputs.embedding_bias = extras.embedding_bias;
        inputs.medusa = extras.medusa;
        self.pipeline.forward(outputs, &inputs)?;
        self.state.swap_cache_indirection();
        self.step += 1;
        Ok(())
    }

    pub fn outputs(&self) -> &DecodingOutputs<CpuTensor> {
        self.state.outputs()
    }

    /// This step's token of beam 0 of every slot, in batch order.
    pub fn new_tokens(&self) -> Vec<i32> {
        let bw = self.state.beam_width();
        let tokens = self.outputs().new_tokens.as_i32_slice();
        self.slots.iter().map(|&s| tokens[s * bw]).collect()
    }

    /// Generated tokens of beam 0 of every slot.
    pub fn generated(&self) -> Vec<Vec<i32>> {
        self.slots
            .iter()
            .map(|&s| self.state.extract(s).unwrap().swap_remove(0))
            .collect()
    }
}
