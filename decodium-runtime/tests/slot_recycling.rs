mod common;

use common::{init_logger, log_probs, Decoder};
use decodium::io::LogitsView;
use decodium::{DecoderDomain, DecodingMode, Error, SamplingConfig};
use decodium_cpu::{CpuBackend, CpuTensor};
use decodium_runtime::{DecoderState, DynamicDecodeLayer, OutputOptions, Request};

const V: usize = 9;
const L: usize = 8;

fn request(prompt: &[i32]) -> Request {
    Request {
        prompt: prompt.to_vec(),
        end_id: 8,
        max_new_tokens: 4,
    }
}

fn greedy_to(token: usize) -> Vec<f32> {
    let mut probs = vec![0.0; V];
    probs[token] = 1.0;
    log_probs(&probs)
}

#[test]
fn test_admission_until_full() {
    init_logger();
    let domain = DecoderDomain::new(2, 1, V, L);
    let mut state = DecoderState::<CpuBackend>::new(&domain, 1, OutputOptions::default()).unwrap();
    let a = state.admit(&request(&[1])).unwrap();
    let b = state.admit(&request(&[2, 3])).unwrap();
    assert_ne!(a, b);
    let err = state.admit(&request(&[1])).unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted(_)));
    assert!(!err.is_config_error());
}

#[test]
fn test_invalid_prompts_are_rejected() {
    let domain = DecoderDomain::new(1, 1, V, L);
    let mut state = DecoderState::<CpuBackend>::new(&domain, 1, OutputOptions::default()).unwrap();
    assert!(state.admit(&request(&[])).is_err());
    assert!(state.admit(&request(&[0; L])).is_err());
    assert!(state.admit(&request(&[V as i32])).is_err());
    assert!(state.admit(&request(&[-1])).is_err());
    // Rejections do not consume the slot.
    state.admit(&request(&[1])).unwrap();
}

#[test]
fn test_released_slot_waits_for_synchronize() {
    let domain = DecoderDomain::new(1, 1, V, L);
    let mut state = DecoderState::<CpuBackend>::new(&domain, 1, OutputOptions::default()).unwrap();
    let slot = state.admit(&request(&[1])).unwrap();
    state.release(slot).unwrap();
    assert!(matches!(state.admit(&request(&[1])), Err(Error::ResourceExhausted(_))));
    state.synchronize();
    assert_eq!(state.admit(&request(&[2])).unwrap(), slot);
}

#[test]
fn test_release_rejects_unknown_slots() {
    let domain = DecoderDomain::new(2, 1, V, L);
    let mut state = DecoderState::<CpuBackend>::new(&domain, 1, OutputOptions::default()).unwrap();
    assert!(matches!(state.release(0), Err(Error::InvalidConfig(_))));
    assert!(matches!(state.release(2), Err(Error::SlotOutOfRange { slot: 2, .. })));

    let slot = state.admit(&request(&[1])).unwrap();
    state.release(slot).unwrap();
    // A second release is refused while draining and after recycling.
    assert!(matches!(state.release(slot), Err(Error::InvalidConfig(_))));
    state.synchronize();
    assert!(matches!(state.release(slot), Err(Error::InvalidConfig(_))));
    assert_eq!(state.slots().num_free(), 2);
}

#[test]
fn test_corrupt_sequence_length_fails_extraction() {
    let domain = DecoderDomain::new(1, 1, V, L);
    let mut state = DecoderState::<CpuBackend>::new(&domain, 1, OutputOptions::default()).unwrap();
    let slot = state.admit(&request(&[1, 2])).unwrap();
    state.outputs_mut().sequence_lengths.as_i32_slice_mut()[slot] = -3;
    let err = state.extract(slot).unwrap_err();
    assert!(matches!(err, Error::InvalidShape(_)));
    assert!(err.to_string().contains("negative sequence length"));
}

#[test]
fn test_reused_slot_starts_clean() {
    let domain = DecoderDomain::new(1, 1, V, L);
    let mut config = SamplingConfig::new(1);
    config.repetition_penalty = Some(vec![2.0]);
    let mut dec = Decoder::new(DecodingMode::none(), domain.clone(), &config, &[vec![1, 2]], 8, 4).unwrap();
    let logits = CpuTensor::from_f32(&[1, 1, V], &greedy_to(5));
    dec.step(&logits).unwrap();
    dec.step(&logits).unwrap();
    assert_eq!(dec.generated(), vec![vec![5, 5]]);

    let slot = dec.slots[0];
    dec.state.release(slot).unwrap();
    dec.state.synchronize();
    let reused = dec.state.admit(&request(&[3])).unwrap();
    assert_eq!(reused, slot);
    assert_eq!(dec.state.extract(reused).unwrap(), vec![Vec::<i32>::new()]);
    assert!(!dec.state.is_finished(reused).unwrap());
    assert_eq!(dec.outputs().sequence_lengths.as_i32_slice()[reused], 1);
    assert_eq!(dec.state.input_lengths().as_i32_slice()[reused], 1);
    assert_eq!(dec.outputs().finished_sum.as_i32_slice()[reused], 0);
}

#[test]
fn test_sparse_slots_decode_independently() {
    let domain = DecoderDomain::new(4, 1, V, L);
    let mut state = DecoderState::<CpuBackend>::new(&domain, 1, OutputOptions::default()).unwrap();
    let slots: Vec<usize> = (0..4).map(|i| state.admit(&request(&[i])).unwrap()).collect();
    state.release(slots[0]).unwrap();
    state.release(slots[2]).unwrap();
    let live = vec![slots[3], slots[1]];

    let mut pipeline = DynamicDecodeLayer::<CpuBackend>::new(DecodingMode::top_k(), domain).unwrap();
    pipeline.setup(&live, &SamplingConfig::new(1)).unwrap();
    // Logits are in batch order: request 0 is slot 3.
    let data: Vec<f32> = [greedy_to(6), greedy_to(4)].concat();
    let logits = CpuTensor::from_f32(&[2, 1, V], &data);
    let (inputs, outputs) = state.step_io(0, LogitsView::Dense(&logits), &live);
    pipeline.forward(outputs, &inputs).unwrap();

    assert_eq!(state.extract(slots[3]).unwrap(), vec![vec![6]]);
    assert_eq!(state.extract(slots[1]).unwrap(), vec![vec![4]]);
    // Released slots are not touched by the step.
    assert_eq!(state.extract(slots[0]).unwrap(), vec![Vec::<i32>::new()]);
    assert_eq!(state.extract(slots[2]).unwrap(), vec![Vec::<i32>::new()]);
    assert!(state.extract(4).is_err());
}
