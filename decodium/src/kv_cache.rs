//! KV cache layout bookkeeping.
//!
//! The decoding core does not own attention compute, but it does move
//! cached key/value entries after speculative acceptance. This module holds
//! the backend-independent description of where a sequence's entries live:
//! either a flat per-slot buffer or a paged pool addressed through a
//! per-slot [`BlockTable`].

#![allow(clippy::must_use_candidate)]

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Physical layout of the KV cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvCacheLayout {
    /// One contiguous `[num_kv_heads, max_seq_len, head_dim]` region per slot.
    Linear { max_seq_len: usize },
    /// Shared pool of `num_blocks` blocks, each
    /// `[num_kv_heads, tokens_per_block, head_dim]`.
    Paged {
        tokens_per_block: usize,
        num_blocks: usize,
    },
}

/// Geometry of a KV cache allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvCacheConfig {
    pub num_layers: usize,
    pub max_batch_size: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub layout: KvCacheLayout,
}

impl KvCacheConfig {
    /// Elements per layer for K (and again for V).
    ///
    /// # Errors
    /// Returns [`Error::ResourceExhausted`] if the size overflows `usize`.
    pub fn elements_per_layer(&self) -> Result<usize> {
        let per_token = self
            .num_kv_heads
            .checked_mul(self.head_dim)
            .ok_or_else(|| overflow("kv head stride"))?;
        let tokens = match self.layout {
            KvCacheLayout::Linear { max_seq_len } => self.max_batch_size.checked_mul(max_seq_len),
            KvCacheLayout::Paged {
                tokens_per_block,
                num_blocks,
            } => num_blocks.checked_mul(tokens_per_block),
        }
        .ok_or_else(|| overflow("kv token capacity"))?;
        tokens
            .checked_mul(per_token)
            .ok_or_else(|| overflow("kv layer size"))
    }
}

fn overflow(what: &str) -> Error {
    Error::ResourceExhausted(format!("{what} overflows usize"))
}

/// How many trailing speculative entries to discard before relocation.
#[derive(Debug)]
pub enum Rewind<'a, T> {
    /// The same count for every sequence.
    Common(usize),
    /// `[max_batch_size]` `I32` tensor indexed by slot.
    PerSequence(&'a T),
}

impl<T> Clone for Rewind<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Rewind<'_, T> {}

/// Manages a pool of KV cache blocks.
///
/// Blocks are identified by an index in `[0, num_blocks)` and handed out
/// from a stack (LIFO).
#[derive(Debug)]
pub struct BlockAllocator {
    free_blocks: Vec<usize>,
    num_blocks: usize,
    tokens_per_block: usize,
}

impl BlockAllocator {
    /// Create an allocator with all blocks free.
    ///
    /// # Panics
    /// Panics if `tokens_per_block` or `num_blocks` is zero.
    pub fn new(tokens_per_block: usize, num_blocks: usize) -> Self {
        assert!(tokens_per_block > 0, "tokens_per_block must be > 0");
        assert!(num_blocks > 0, "num_blocks must be > 0");
        Self {
            free_blocks: (0..num_blocks).collect(),
            num_blocks,
            tokens_per_block,
        }
    }

    /// Allocate a single block, or `None` if the pool is exhausted.
    pub fn allocate(&mut self) -> Option<usize> {
        self.free_blocks.pop()
    }

    /// Grow `table` until it can address `num_tokens` tokens.
    ///
    /// # Errors
    /// Returns [`Error::ResourceExhausted`] if the pool runs dry. Blocks
    /// appended before the failure stay in the table.
    pub fn reserve(&mut self, table: &mut BlockTable, num_tokens: usize) -> Result<()> {
        while table.capacity() < num_tokens {
            let block = self.allocate().ok_or_else(|| {
                Error::ResourceExhausted(format!(
                    "no free kv block for {num_tokens} tokens ({} blocks in pool)",
                    self.num_blocks
                ))
            })?;
            table.append_block(block);
        }
        Ok(())
    }

    /// Free a single block, returning it to the pool.
    ///
    /// # Panics
    /// Panics if `block_idx` is out of range or was already free.
    pub fn free(&mut self, block_idx: usize) {
        assert!(
            block_idx < self.num_blocks,
            "block index {block_idx} out of range (num_blocks = {})",
            self.num_blocks,
        );
        assert!(
            !self.free_blocks.contains(&block_idx),
            "double-free of block {block_idx}",
        );
        self.free_blocks.push(block_idx);
    }

    /// Return every block of `table` to the pool and reset it.
    pub fn release(&mut self, table: &mut BlockTable) {
        for &block in table.blocks() {
            self.free(block);
        }
        table.reset();
    }

    pub fn num_free(&self) -> usize {
        self.free_blocks.len()
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn tokens_per_block(&self) -> usize {
        self.tokens_per_block
    }
}

/// Per-slot mapping from logical block index to physical block index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTable {
    blocks: Vec<usize>,
    seq_len: usize,
    tokens_per_block: usize,
}

impl BlockTable {
    pub fn new(tokens_per_block: usize) -> Self {
        Self {
            blocks: Vec::new(),
            seq_len: 0,
            tokens_per_block,
        }
    }

    pub fn blocks(&self) -> &[usize] {
        &self.blocks
    }

    /// Number of tokens currently stored.
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Tokens addressable without another block.
    pub fn capacity(&self) -> usize {
        self.blocks.len() * self.tokens_per_block
    }

    pub fn append_block(&mut self, block_idx: usize) {
        self.blocks.push(block_idx);
    }

    /// Set the stored length. Blocks past the new length stay attached.
    ///
    /// # Errors
    /// Returns [`Error::ResourceExhausted`] if `len` exceeds the capacity.
    pub fn set_seq_len(&mut self, len: usize) -> Result<()> {
        if len > self.capacity() {
            return Err(Error::ResourceExhausted(format!(
                "block table holds {} tokens, cannot store {len}",
                self.capacity()
            )));
        }
        self.seq_len = len;
        Ok(())
    }

    /// Physical `(block, offset_in_block)` for logical token `token`.
    pub fn locate(&self, token: usize) -> Option<(usize, usize)> {
        let block = *self.blocks.get(token / self.tokens_per_block)?;
        Some((block, token % self.tokens_per_block))
    }

    /// Clear blocks and length. Does not free blocks.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.seq_len = 0;
    }
}
