//! CPU KV cache storage and draft-token relocation.

use decodium::backend::KvCacheOps;
use decodium::io::KvCacheUpdateParams;
use decodium::kv_cache::{BlockTable, KvCacheConfig, KvCacheLayout, Rewind};
use decodium::{Error, Result};
use rayon::prelude::*;

use super::{i32_slice, to_index};
use crate::CpuBackend;

/// Layers relocated together in one parallel pass.
pub const MAX_LAYERS_PER_CHUNK: usize = 8;

/// Tokens staged per tile during relocation.
const STAGING_TOKENS: usize = 16;

struct CpuLayerKv {
    k: Vec<f32>,
    v: Vec<f32>,
}

/// Host KV cache in flat or paged layout.
///
/// Flat layout per layer: `(max_batch_size, num_kv_heads, max_seq_len, head_dim)`.
/// Paged layout per layer: `(num_blocks, num_kv_heads, tokens_per_block, head_dim)`,
/// addressed through one [`BlockTable`] per slot.
pub struct CpuKvCache {
    layers: Vec<CpuLayerKv>,
    config: KvCacheConfig,
    block_tables: Vec<BlockTable>,
    lengths: Vec<usize>,
}

impl std::fmt::Debug for CpuKvCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuKvCache")
            .field("config", &self.config)
            .field("lengths", &self.lengths)
            .finish_non_exhaustive()
    }
}

impl CpuKvCache {
    fn new(config: KvCacheConfig) -> Result<Self> {
        let per_layer = config.elements_per_layer()?;
        let tokens_per_block = match config.layout {
            KvCacheLayout::Linear { .. } => 1,
            KvCacheLayout::Paged { tokens_per_block, .. } => tokens_per_block,
        };
        if tokens_per_block == 0 || config.head_dim == 0 || config.num_kv_heads == 0 {
            return Err(Error::InvalidConfig(format!("degenerate kv cache geometry {config:?}")));
        }
        log::debug!(
            "kv cache: {} layers x {per_layer} elements ({:?})",
            config.num_layers,
            config.layout
        );
        let layers = (0..config.num_layers)
            .map(|_| CpuLayerKv {
                k: vec![0.0; per_layer],
                v: vec![0.0; per_layer],
            })
            .collect();
        Ok(Self {
            layers,
            config,
            block_tables: vec![BlockTable::new(tokens_per_block); config.max_batch_size],
            lengths: vec![0; config.max_batch_size],
        })
    }

    #[must_use]
    pub fn config(&self) -> &KvCacheConfig {
        &self.config
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot < self.config.max_batch_size {
            Ok(())
        } else {
            Err(Error::SlotOutOfRange {
                slot,
                max_batch_size: self.config.max_batch_size,
            })
        }
    }

    /// Cached tokens of `slot`, or `None` for a slot past the capacity.
    #[must_use]
    pub fn length(&self, slot: usize) -> Option<usize> {
        self.lengths.get(slot).copied()
    }

    /// Set the cached length of `slot`.
    pub fn set_length(&mut self, slot: usize, len: usize) -> Result<()> {
        self.check_slot(slot)?;
        match self.config.layout {
            KvCacheLayout::Linear { max_seq_len } if len > max_seq_len => {
                return Err(Error::ResourceExhausted(format!(
                    "slot {slot} cannot cache {len} tokens (max_seq_len {max_seq_len})"
                )));
            }
            KvCacheLayout::Linear { .. } => {}
            KvCacheLayout::Paged { .. } => self.block_tables[slot].set_seq_len(len)?,
        }
        self.lengths[slot] = len;
        Ok(())
    }

    /// Block table of `slot` (empty for the flat layout).
    pub fn block_table(&self, slot: usize) -> Result<&BlockTable> {
        self.check_slot(slot)?;
        Ok(&self.block_tables[slot])
    }

    /// Attach `table` to `slot` in a paged cache.
    pub fn set_block_table(&mut self, slot: usize, table: BlockTable) -> Result<()> {
        self.check_slot(slot)?;
        let KvCacheLayout::Paged { num_blocks, .. } = self.config.layout else {
            return Err(Error::InvalidConfig("block tables need a paged kv cache".into()));
        };
        if let Some(&block) = table.blocks().iter().find(|&&b| b >= num_blocks) {
            return Err(Error::InvalidConfig(format!(
                "block {block} out of range for a pool of {num_blocks}"
            )));
        }
        self.lengths[slot] = table.seq_len();
        self.block_tables[slot] = table;
        Ok(())
    }

    /// Element offset of `(slot, head, token)` within a layer.
    fn offset(&self, slot: usize, head: usize, token: usize) -> Result<usize> {
        let (heads, head_dim) = (self.config.num_kv_heads, self.config.head_dim);
        match self.config.layout {
            KvCacheLayout::Linear { max_seq_len } => {
                if token >= max_seq_len {
                    return Err(Error::InvalidConfig(format!(
                        "token {token} beyond max_seq_len {max_seq_len}"
                    )));
                }
                Ok(((slot * heads + head) * max_seq_len + token) * head_dim)
            }
            KvCacheLayout::Paged { tokens_per_block, .. } => {
                let (block, off) = self.block_tables[slot].locate(token).ok_or_else(|| {
                    Error::InvalidConfig(format!("token {token} of slot {slot} has no kv block"))
                })?;
                Ok(((block * heads + head) * tokens_per_block + off) * head_dim)
            }
        }
    }

    fn check_layer_head(&self, layer: usize, head: usize) -> Result<()> {
        if layer >= self.config.num_layers || head >= self.config.num_kv_heads {
            return Err(Error::InvalidConfig(format!(
                "layer {layer} head {head} out of range ({} layers, {} heads)",
                self.config.num_layers, self.config.num_kv_heads
            )));
        }
        Ok(())
    }

    /// Store one token's K and V (`[num_kv_heads * head_dim]` each).
    pub fn write_token(&mut self, layer: usize, slot: usize, token: usize, k: &[f32], v: &[f32]) -> Result<()> {
        self.check_slot(slot)?;
        self.check_layer_head(layer, 0)?;
        let (heads, head_dim) = (self.config.num_kv_heads, self.config.head_dim);
        if k.len() != heads * head_dim || v.len() != heads * head_dim {
            return Err(Error::ShapeMismatch {
                expected: vec![heads, head_dim],
                got: vec![k.len().max(v.len())],
            });
        }
        for head in 0..heads {
            let dst = self.offset(slot, head, token)?;
            let src = head * head_dim..(head + 1) * head_dim;
            let entry = &mut self.layers[layer];
            entry.k[dst..dst + head_dim].copy_from_slice(&k[src.clone()]);
            entry.v[dst..dst + head_dim].copy_from_slice(&v[src]);
        }
        Ok(())
    }

    /// K and V of one `(layer, slot, head, token)`.
    pub fn read_token(&self, layer: usize, slot: usize, head: usize, token: usize) -> Result<(&[f32], &[f32])> {
        self.check_slot(slot)?;
        self.check_layer_head(layer, head)?;
        let at = self.offset(slot, head, token)?;
        let entry = &self.layers[layer];
        let range = at..at + self.config.head_dim;
        Ok((&entry.k[range.clone()], &entry.v[range]))
    }
}

/// Source and destination element offsets of every entry one
/// `(sequence, head)` group moves, in ascending token order.
type Moves = Vec<(usize, usize)>;

fn relocate(buf: &mut [f32], moves: &[(usize, usize)], head_dim: usize, staging: &mut Vec<f32>) {
    for tile in moves.chunks(STAGING_TOKENS) {
        staging.clear();
        for &(src, _) in tile {
            staging.extend_from_slice(&buf[src..src + head_dim]);
        }
        for (i, &(_, dst)) in tile.iter().enumerate() {
            buf[dst..dst + head_dim].copy_from_slice(&staging[i * head_dim..(i + 1) * head_dim]);
        }
    }
}

impl KvCacheOps for CpuBackend {
    fn allocate_kv_cache(config: &KvCacheConfig) -> Result<CpuKvCache> {
        CpuKvCache::new(*config)
    }

    fn update_kv_cache_draft_token_location(
        cache: &mut CpuKvCache,
        params: &KvCacheUpdateParams<'_, Self::Tensor>,
    ) -> Result<()> {
        let mb = cache.config.max_batch_size;
        let batch = params.batch_slots.len();
        let offsets = i32_slice(params.accepted_offsets, batch + 1, "accepted offsets")?;
        let past = i32_slice(params.past_kv_lengths, mb, "past kv lengths")?;
        let total = to_index(offsets[batch]).unwrap_or(0);
        let packed = i32_slice(params.packed_accepted_indices, total, "packed accepted indices")?;
        let rewinds = match params.rewind {
            Rewind::Common(_) => None,
            Rewind::PerSequence(t) => Some(i32_slice(t, mb, "rewind lengths")?),
        };

        let head_dim = cache.config.head_dim;
        let mut groups: Vec<Moves> = Vec::new();
        let mut new_lengths = Vec::with_capacity(batch);
        for (seq, &slot) in params.batch_slots.iter().enumerate() {
            cache.check_slot(slot)?;
            let past_len = to_index(past[slot]).unwrap_or(0);
            let rewind = match (params.rewind, rewinds) {
                (Rewind::Common(n), _) => n,
                (_, Some(r)) => to_index(r[slot]).unwrap_or(0),
                (_, None) => 0,
            };
            let start = past_len.checked_sub(rewind).ok_or_else(|| {
                Error::InvalidConfig(format!("slot {slot} rewinds {rewind} of {past_len} cached tokens"))
            })?;
            let (lo, hi) = (to_index(offsets[seq]), to_index(offsets[seq + 1]));
            let accepted = match (lo, hi) {
                (Some(lo), Some(hi)) if lo <= hi && hi <= total => &packed[lo..hi],
                _ => {
                    return Err(Error::InvalidConfig(format!(
                        "accepted offsets of sequence {seq} are not a valid prefix sum"
                    )))
                }
            };

            let mut sources = Vec::with_capacity(accepted.len());
            for &idx in accepted {
                let src = to_index(idx)
                    .map(|i| start + i)
                    .filter(|&s| s < past_len && sources.last().map_or(true, |&prev| s > prev))
                    .ok_or_else(|| {
                        Error::InvalidConfig(format!(
                            "slot {slot}: accepted index {idx} is not ascending within {rewind} rewound tokens"
                        ))
                    })?;
                sources.push(src);
            }
            for head in 0..cache.config.num_kv_heads {
                let mut moves = Vec::with_capacity(sources.len());
                for (i, &src) in sources.iter().enumerate() {
                    if src != start + i {
                        moves.push((cache.offset(slot, head, src)?, cache.offset(slot, head, start + i)?));
                    }
                }
                if !moves.is_empty() {
                    groups.push(moves);
                }
            }
            new_lengths.push((slot, start + sources.len()));
        }

        log::trace!(
            "kv relocation: {batch} sequences, {} move groups, {} layers",
            groups.len(),
            cache.layers.len()
        );
        for chunk in cache.layers.chunks_mut(MAX_LAYERS_PER_CHUNK) {
            chunk.par_iter_mut().for_each(|layer| {
                let mut staging = Vec::with_capacity(STAGING_TOKENS * head_dim);
                for moves in &groups {
                    relocate(&mut layer.k, moves, head_dim, &mut staging);
                    relocate(&mut layer.v, moves, head_dim, &mut staging);
                }
            });
        }

        for (slot, len) in new_lengths {
            cache.set_length(slot, len)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::CpuTensor;

    const HEADS: usize = 2;
    const HEAD_DIM: usize = 3;

    fn config(num_layers: usize, layout: KvCacheLayout) -> KvCacheConfig {
        KvCacheConfig {
            num_layers,
            max_batch_size: 2,
            num_kv_heads: HEADS,
            head_dim: HEAD_DIM,
            layout,
        }
    }

    /// K encodes `(layer, slot, token)`, V is its negation.
    fn entry(layer: usize, slot: usize, token: usize) -> Vec<f32> {
        (0..HEADS * HEAD_DIM)
            .map(|i| (layer * 1000 + slot * 100 + token) as f32 + i as f32 * 0.01)
            .collect()
    }

    fn fill(cache: &mut CpuKvCache, slot: usize, tokens: usize) {
        for layer in 0..cache.config().num_layers {
            for token in 0..tokens {
                let k = entry(layer, slot, token);
                let v: Vec<f32> = k.iter().map(|x| -x).collect();
                cache.write_token(layer, slot, token, &k, &v).unwrap();
            }
        }
    }

    fn key_token(cache: &CpuKvCache, layer: usize, slot: usize, head: usize, token: usize) -> usize {
        let (k, v) = cache.read_token(layer, slot, head, token).unwrap();
        assert_eq!(k[0], -v[0]);
        (k[0] as usize) % 100
    }

    fn relocate_both(cache: &mut CpuKvCache, rewind: Rewind<'_, CpuTensor>) {
        // Slot 0 had 3 cached tokens before a 4-token step, root at position 3,
        // and accepted draft positions 1 and 2. Slot 1 accepted nothing.
        let offsets = CpuTensor::from_i32(&[3], &[0, 2, 2]);
        let packed = CpuTensor::from_i32(&[2], &[1, 2]);
        let past = CpuTensor::from_i32(&[2], &[7, 6]);
        let params = KvCacheUpdateParams {
            batch_slots: &[0, 1],
            accepted_offsets: &offsets,
            packed_accepted_indices: &packed,
            past_kv_lengths: &past,
            rewind,
        };
        CpuBackend::update_kv_cache_draft_token_location(cache, &params).unwrap();
    }

    #[test]
    fn test_linear_relocation() {
        let mut cache = CpuBackend::allocate_kv_cache(&config(3, KvCacheLayout::Linear { max_seq_len: 8 })).unwrap();
        fill(&mut cache, 0, 7);
        fill(&mut cache, 1, 6);
        relocate_both(&mut cache, Rewind::Common(3));

        assert_eq!(cache.length(0), Some(6));
        assert_eq!(cache.length(1), Some(3));
        for layer in 0..3 {
            for head in 0..HEADS {
                let tokens: Vec<usize> = (0..6).map(|t| key_token(&cache, layer, 0, head, t)).collect();
                assert_eq!(tokens, vec![0, 1, 2, 3, 5, 6]);
            }
        }
        assert_eq!(key_token(&cache, 2, 1, 1, 2), 2);
    }

    #[test]
    fn test_per_sequence_rewind_matches_common() {
        let mut cache = CpuBackend::allocate_kv_cache(&config(1, KvCacheLayout::Linear { max_seq_len: 8 })).unwrap();
        fill(&mut cache, 0, 7);
        fill(&mut cache, 1, 6);
        let rewind = CpuTensor::from_i32(&[2], &[3, 3]);
        relocate_both(&mut cache, Rewind::PerSequence(&rewind));
        assert_eq!(cache.length(0), Some(6));
        assert_eq!(key_token(&cache, 0, 0, 0, 4), 5);
        assert_eq!(key_token(&cache, 0, 0, 0, 5), 6);
    }

    #[test]
    fn test_paged_relocation_across_blocks() {
        let layout = KvCacheLayout::Paged {
            tokens_per_block: 2,
            num_blocks: 8,
        };
        let mut cache = CpuBackend::allocate_kv_cache(&config(2, layout)).unwrap();
        for (slot, blocks) in [(0, [5, 1, 6, 2]), (1, [0, 3, 4, 7])] {
            let mut table = BlockTable::new(2);
            for b in blocks {
                table.append_block(b);
            }
            cache.set_block_table(slot, table).unwrap();
        }
        fill(&mut cache, 0, 7);
        fill(&mut cache, 1, 6);
        relocate_both(&mut cache, Rewind::Common(3));

        assert_eq!(cache.length(0), Some(6));
        assert_eq!(cache.block_table(0).unwrap().seq_len(), 6);
        let tokens: Vec<usize> = (0..6).map(|t| key_token(&cache, 1, 0, 1, t)).collect();
        assert_eq!(tokens, vec![0, 1, 2, 3, 5, 6]);
    }

    #[test]
    fn test_many_layers_are_chunked() {
        let layers = MAX_LAYERS_PER_CHUNK * 2 + 1;
        let mut cache = CpuBackend::allocate_kv_cache(&config(layers, KvCacheLayout::Linear { max_seq_len: 8 })).unwrap();
        fill(&mut cache, 0, 7);
        fill(&mut cache, 1, 6);
        relocate_both(&mut cache, Rewind::Common(3));
        for layer in 0..layers {
            assert_eq!(key_token(&cache, layer, 0, 0, 5), 6, "layer {layer}");
        }
    }

    #[test]
    fn test_rewind_beyond_cache_is_rejected() {
        let mut cache = CpuBackend::allocate_kv_cache(&config(1, KvCacheLayout::Linear { max_seq_len: 8 })).unwrap();
        let offsets = CpuTensor::from_i32(&[2], &[0, 0]);
        let packed = CpuTensor::from_i32(&[1], &[0]);
        let past = CpuTensor::from_i32(&[2], &[2, 0]);
        let params = KvCacheUpdateParams {
            batch_slots: &[0],
            accepted_offsets: &offsets,
            packed_accepted_indices: &packed,
            past_kv_lengths: &past,
            rewind: Rewind::Common(3),
        };
        let err = CpuBackend::update_kv_cache_draft_token_location(&mut cache, &params).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_block_tables_need_paged_layout() {
        let mut cache = CpuBackend::allocate_kv_cache(&config(1, KvCacheLayout::Linear { max_seq_len: 4 })).unwrap();
        assert!(cache.set_block_table(0, BlockTable::new(2)).is_err());
        assert!(matches!(cache.set_length(2, 1), Err(Error::SlotOutOfRange { .. })));
        assert!(matches!(cache.set_length(0, 5), Err(Error::ResourceExhausted(_))));
        assert_eq!(cache.length(1), Some(0));
        assert_eq!(cache.length(2), None);
    }
}
