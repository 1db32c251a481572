mod common;

use approx::assert_relative_eq;
use common::{dense_logits, init_logger, log_probs, logits_from_rows, Decoder, STEP0_PROBS};
use decodium::io::GatheredBeams;
use decodium::{DType, DecoderDomain, DecodingMode, Error, FinishReason, SamplingConfig};
use decodium_cpu::{CpuBackend, CpuTensor};
use decodium_runtime::DynamicDecodeLayer;

const V: usize = 9;
const L: usize = 16;
const BW: usize = 2;
const END: i32 = 8;

fn beam_decoder() -> Decoder {
    let domain = DecoderDomain::new(1, BW, V, L);
    Decoder::new(DecodingMode::none(), domain, &SamplingConfig::new(BW), &[vec![0]], END, 8).unwrap()
}

fn gathered() -> GatheredBeams<CpuTensor> {
    GatheredBeams {
        output_ids: CpuTensor::zeros(&[1, BW, L], DType::I32),
        sequence_lengths: CpuTensor::zeros(&[1, BW], DType::I32),
        cum_log_probs: CpuTensor::zeros(&[1, BW], DType::F32),
        normed_scores: CpuTensor::zeros(&[1, BW], DType::F32),
    }
}

fn gather(dec: &Decoder) -> GatheredBeams<CpuTensor> {
    let mut out = gathered();
    dec.pipeline
        .gather_beams(&dec.slots, Some(dec.state.input_lengths()), dec.outputs(), &mut out)
        .unwrap();
    out
}

fn row(gathered: &GatheredBeams<CpuTensor>, beam: usize) -> Vec<i32> {
    gathered.output_ids.as_i32_slice()[beam * L..(beam + 1) * L]
        .iter()
        .copied()
        .take_while(|&t| t >= 0)
        .collect()
}

/// Step 0 picks 4 and 5; step 1 ends the `4` beam and extends the `5` beam
/// twice.
fn run_two_steps(dec: &mut Decoder) {
    let step0 = log_probs(&STEP0_PROBS);
    dec.step(&logits_from_rows(1, BW, &[step0.clone(), step0])).unwrap();
    let beam0 = log_probs(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.1, 0.0, 0.9]);
    let beam1 = log_probs(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.6, 0.4, 0.0]);
    dec.step(&logits_from_rows(1, BW, &[beam0, beam1])).unwrap();
}

#[test]
fn test_first_step_takes_distinct_tokens_from_beam_zero() {
    init_logger();
    let mut dec = beam_decoder();
    let step0 = log_probs(&STEP0_PROBS);
    dec.step(&logits_from_rows(1, BW, &[step0.clone(), step0])).unwrap();

    assert_eq!(dec.pipeline.mode(), Some(DecodingMode::beam_search()));
    assert_eq!(dec.outputs().new_tokens.as_i32_slice(), &[4, 5]);
    assert_eq!(dec.outputs().parent_ids.as_i32_slice()[1], 0);
    assert_eq!(dec.outputs().parent_ids.as_i32_slice()[L + 1], 0);
    let cum = dec.outputs().cum_log_probs.as_ref().unwrap().as_f32_slice();
    assert_relative_eq!(cum[0], 0.4f32.ln(), epsilon = 1e-5);
    assert_relative_eq!(cum[1], 0.3f32.ln(), epsilon = 1e-5);
    assert_eq!(dec.state.extract(dec.slots[0]).unwrap(), vec![vec![4], vec![5]]);
}

#[test]
fn test_end_token_moves_beam_to_hypotheses() {
    let mut dec = beam_decoder();
    run_two_steps(&mut dec);

    assert_eq!(dec.outputs().new_tokens.as_i32_slice(), &[6, 7]);
    // Both live beams descend from the `5` beam.
    assert_eq!(dec.state.extract(dec.slots[0]).unwrap(), vec![vec![5, 6], vec![5, 7]]);
    let hyps = dec.outputs().beam_hypotheses.as_ref().unwrap();
    assert_eq!(hyps.num_beams.as_i32_slice(), &[1]);
    assert_eq!(&hyps.output_ids.as_i32_slice()[..3], &[0, 4, END]);
    assert!(!dec.state.is_finished(dec.slots[0]).unwrap());

    let out = gather(&dec);
    assert_eq!(row(&out, 0), vec![0, 4, END]);
    assert_eq!(row(&out, 1), vec![0, 5, 6]);
    let scores = out.normed_scores.as_f32_slice();
    assert!(scores[0] >= scores[1]);
    assert_relative_eq!(scores[0], 0.4f32.ln() + 0.9f32.ln(), epsilon = 1e-5);
}

#[test]
fn test_early_stopping_when_hypotheses_are_full() {
    let mut dec = beam_decoder();
    run_two_steps(&mut dec);
    let ending = log_probs(&[0.0, 0.1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.9]);
    dec.step(&logits_from_rows(1, BW, &[ending.clone(), ending])).unwrap();

    let slot = dec.slots[0];
    assert!(dec.state.is_finished(slot).unwrap());
    assert_eq!(dec.state.finish_reason(slot).unwrap(), Some(FinishReason::EndId));
    let hyps = dec.outputs().beam_hypotheses.as_ref().unwrap();
    assert_eq!(hyps.is_done.as_u8_slice(), &[1]);

    let out = gather(&dec);
    assert_eq!(row(&out, 0), vec![0, 4, END]);
    assert_eq!(row(&out, 1), vec![0, 5, 6, END]);

    // Further steps leave a finished slot alone.
    let step0 = log_probs(&STEP0_PROBS);
    dec.step(&logits_from_rows(1, BW, &[step0.clone(), step0])).unwrap();
    assert_eq!(dec.outputs().new_tokens.as_i32_slice(), &[END, END]);
}

#[test]
fn test_beam_logits_must_match_width() {
    let mut dec = beam_decoder();
    let err = dec.step(&dense_logits(1, &log_probs(&STEP0_PROBS))).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
}

#[test]
fn test_gather_requires_beam_search() {
    let domain = DecoderDomain::new(1, 1, V, L);
    let dec = Decoder::new(DecodingMode::top_k(), domain, &SamplingConfig::new(1), &[vec![0]], END, 4).unwrap();
    let mut out = gathered();
    let err = dec
        .pipeline
        .gather_beams(&dec.slots, None, dec.outputs(), &mut out)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidDecodingMode(_)));
}

#[test]
fn test_beam_width_above_domain_is_rejected() {
    let domain = DecoderDomain::new(1, BW, V, L);
    let mut pipeline = DynamicDecodeLayer::<CpuBackend>::new(DecodingMode::beam_search(), domain).unwrap();
    assert!(pipeline.setup(&[0], &SamplingConfig::new(3)).unwrap_err().is_config_error());
    pipeline.setup(&[0], &SamplingConfig::new(BW)).unwrap();
}
