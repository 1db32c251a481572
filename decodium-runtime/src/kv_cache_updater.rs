//! KV cache compaction after speculative acceptance.
//!
//! A Medusa step runs the forward pass over the root token and every draft
//! node, so the cache of each sequence grows by `tokens_per_step` entries.
//! Once the decoding layer has chosen a path, only the root and the
//! accepted draft nodes stay. The updater moves the K/V entries of those
//! nodes next to each other and shortens every cache to
//! `past_kv_length - rewind + accepted`.

use decodium::io::{KvCacheUpdateParams, MedusaOutputs};
use decodium::kv_cache::{KvCacheConfig, Rewind};
use decodium::{Error, KvCacheOps, Result};

pub struct KvCacheUpdater<B: KvCacheOps> {
    cache: B::KvCache,
}

impl<B: KvCacheOps> KvCacheUpdater<B> {
    /// Allocate a cache of `config`'s geometry.
    ///
    /// # Errors
    /// Returns an error if the geometry is degenerate or too large.
    pub fn new(config: &KvCacheConfig) -> Result<Self> {
        Ok(Self {
            cache: B::allocate_kv_cache(config)?,
        })
    }

    #[must_use]
    pub fn cache(&self) -> &B::KvCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut B::KvCache {
        &mut self.cache
    }

    /// Compact the cache after a Medusa step using the accepted paths the
    /// decoding layer packed into `medusa`.
    ///
    /// `past_kv_lengths` includes the entries of the step just run. With
    /// `Rewind::Common(tokens_per_step - 1)` the draft node `n` of a path
    /// sits at offset `n - 1` past the root.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] when an accepted index does not
    /// address a rewound entry.
    pub fn update(
        &mut self,
        batch_slots: &[usize],
        medusa: &MedusaOutputs<B::Tensor>,
        past_kv_lengths: &B::Tensor,
        rewind: Rewind<'_, B::Tensor>,
    ) -> Result<()> {
        if batch_slots.is_empty() {
            return Ok(());
        }
        self.relocate(&KvCacheUpdateParams {
            batch_slots,
            accepted_offsets: &medusa.accepted_lengths_cum_sum,
            packed_accepted_indices: &medusa.paths_offsets,
            past_kv_lengths,
            rewind,
        })
    }

    /// Relocate with explicit parameters.
    ///
    /// # Errors
    /// See [`update`](Self::update).
    pub fn relocate(&mut self, params: &KvCacheUpdateParams<'_, B::Tensor>) -> Result<()> {
        if let Rewind::Common(n) = params.rewind {
            if i32::try_from(n).is_err() {
                return Err(Error::InvalidConfig(format!("rewind of {n} tokens")));
            }
        }
        log::trace!("kv cache update for {} sequences", params.batch_slots.len());
        B::update_kv_cache_draft_token_location(&mut self.cache, params)
    }
}

impl<B: KvCacheOps> std::fmt::Debug for KvCacheUpdater<B>
where
    B::KvCache: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvCacheUpdater").field("cache", &self.cache).finish()
    }
}
