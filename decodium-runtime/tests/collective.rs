mod common;

use std::sync::Arc;
use std::thread;

use common::{dense_logits, init_logger, log_probs, Decoder, STEP0_PROBS};
use decodium::{Comm, DecoderDomain, DecodingMode, LocalComm, SamplingConfig, SingleRank};

const V: usize = 9;
const BATCH: usize = 3;
const STEPS: usize = 4;

fn run(seed: u64, comm: Option<Arc<dyn Comm>>) -> Vec<Vec<i32>> {
    let mut config = SamplingConfig::new(1);
    config.top_k = Some(vec![4]);
    config.random_seed = Some(vec![seed]);
    let domain = DecoderDomain::new(BATCH, 1, V, 16);
    let mut dec = Decoder::new(DecodingMode::none(), domain, &config, &vec![vec![0]; BATCH], 8, 8).unwrap();
    if let Some(comm) = comm {
        dec.pipeline = dec.pipeline.with_comm(comm);
    }
    let logits = dense_logits(BATCH, &log_probs(&STEP0_PROBS));
    for _ in 0..STEPS {
        dec.step(&logits).unwrap();
    }
    dec.generated()
}

#[test]
fn test_ranks_agree_on_root_tokens() {
    init_logger();
    let reference = run(1, None);
    let handles: Vec<_> = LocalComm::group(2)
        .unwrap()
        .into_iter()
        .map(|comm| {
            // Every rank draws with its own seed; only rank 0's draws survive.
            let seed = 1 + comm.rank() as u64 * 1000;
            thread::spawn(move || run(seed, Some(Arc::new(comm))))
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), reference);
    }
}

#[test]
fn test_single_rank_is_transparent() {
    assert_eq!(run(5, Some(Arc::new(SingleRank))), run(5, None));
}
