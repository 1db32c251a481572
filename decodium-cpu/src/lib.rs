//! CPU backend for decodium.
//!
//! A host reference implementation of every decoding op trait. Kernels
//! work in f32; half-precision logits are cast when they are copied into
//! the runtime workspace. Per-request work is spread over rayon where the
//! requests are independent.

#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::too_many_arguments
)]

pub mod ops;
pub mod tensor;

use decodium::backend::Backend;
use rand::rngs::StdRng;
use rand::SeedableRng;

pub use ops::kv_cache::CpuKvCache;
pub use tensor::CpuTensor;

/// Marker type for the CPU backend.
///
/// All op trait impls are on this type. The pipeline parameterised by
/// `B: DecodeBackend` can use `CpuBackend` to run on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    type Tensor = CpuTensor;
    type RngState = CpuRngState;
    type KvCache = CpuKvCache;
}

/// One generator per slot.
#[derive(Debug)]
pub struct CpuRngState {
    generators: Vec<StdRng>,
}

impl CpuRngState {
    /// Every slot starts from seed 0.
    #[must_use]
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            generators: (0..max_batch_size).map(|_| StdRng::seed_from_u64(0)).collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.generators.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }

    pub(crate) fn reseed(&mut self, slot: usize, seed: u64) {
        self.generators[slot] = StdRng::seed_from_u64(seed);
    }

    pub(crate) fn slot_mut(&mut self, slot: usize) -> &mut StdRng {
        &mut self.generators[slot]
    }
}
