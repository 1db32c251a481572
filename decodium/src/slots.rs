//! Batch slot bookkeeping.
//!
//! A slot is an index into the fixed-capacity per-sequence buffers. The
//! scheduler admits a request into a free slot, and the decoding pipeline
//! reaches the slot through a [`BatchSlots`] indirection so the buffers are
//! never reshaped as requests come and go.
//!
//! Released slots are parked until the next [`SlotAllocator::synchronize`]
//! call, which the caller issues once every in-flight step that may still
//! touch those slots has completed.

#![allow(clippy::must_use_candidate)]

use crate::{Error, Result};

/// Hands out slot indices in `[0, max_batch_size)`.
///
/// Free slots live on a stack (LIFO). Allocation and release are O(1);
/// the double-release check is O(n).
#[derive(Debug)]
pub struct SlotAllocator {
    free: Vec<usize>,
    draining: Vec<usize>,
    max_batch_size: usize,
}

impl SlotAllocator {
    /// Create an allocator with every slot free.
    ///
    /// # Panics
    /// Panics if `max_batch_size` is zero.
    pub fn new(max_batch_size: usize) -> Self {
        assert!(max_batch_size > 0, "max_batch_size must be > 0");
        // Reverse so that pop hands out slot 0 first.
        let free = (0..max_batch_size).rev().collect();
        Self {
            free,
            draining: Vec::new(),
            max_batch_size,
        }
    }

    /// Allocate a slot, or `None` when every slot is in use or draining.
    pub fn allocate(&mut self) -> Option<usize> {
        self.free.pop()
    }

    /// Release a slot. It becomes allocatable after the next
    /// [`synchronize`](Self::synchronize).
    ///
    /// # Panics
    /// Panics if `slot` is out of range or is not currently allocated.
    pub fn release(&mut self, slot: usize) {
        assert!(
            slot < self.max_batch_size,
            "slot {slot} out of range (max_batch_size = {})",
            self.max_batch_size,
        );
        assert!(
            !self.free.contains(&slot) && !self.draining.contains(&slot),
            "double release of slot {slot}",
        );
        self.draining.push(slot);
    }

    /// Return drained slots to the free list. Call at the stream boundary
    /// after the step that last touched them has completed.
    pub fn synchronize(&mut self) {
        if !self.draining.is_empty() {
            log::debug!("recycling {} drained slots", self.draining.len());
        }
        self.free.append(&mut self.draining);
    }

    /// Whether `slot` is handed out and not yet released.
    pub fn is_allocated(&self, slot: usize) -> bool {
        slot < self.max_batch_size && !self.free.contains(&slot) && !self.draining.contains(&slot)
    }

    pub fn num_free(&self) -> usize {
        self.free.len()
    }

    pub fn num_draining(&self) -> usize {
        self.draining.len()
    }

    pub fn num_active(&self) -> usize {
        self.max_batch_size - self.free.len() - self.draining.len()
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

/// Logical batch index to physical slot mapping for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSlots {
    slots: Vec<usize>,
}

impl BatchSlots {
    /// Validate a mapping against the buffer capacity.
    ///
    /// # Errors
    /// Returns [`Error::SlotOutOfRange`] for a slot past `max_batch_size`
    /// and [`Error::InvalidConfig`] for a slot named twice.
    pub fn new(slots: Vec<usize>, max_batch_size: usize) -> Result<Self> {
        if let Some(&slot) = slots.iter().find(|&&s| s >= max_batch_size) {
            return Err(Error::SlotOutOfRange {
                slot,
                max_batch_size,
            });
        }
        let mut seen = vec![false; max_batch_size];
        for &slot in &slots {
            if std::mem::replace(&mut seen[slot], true) {
                return Err(Error::InvalidConfig(format!(
                    "batch slot {slot} appears more than once"
                )));
            }
        }
        Ok(Self { slots })
    }

    /// The identity mapping `i -> i`.
    pub fn identity(batch_size: usize) -> Self {
        Self {
            slots: (0..batch_size).collect(),
        }
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Physical slot of logical batch index `batch_idx`.
    pub fn slot(&self, batch_idx: usize) -> usize {
        self.slots[batch_idx]
    }

    /// Inverse map: `result[slot] = Some(batch_idx)` for active slots.
    pub fn inverse(&self, max_batch_size: usize) -> Vec<Option<usize>> {
        let mut inv = vec![None; max_batch_size];
        for (bi, &slot) in self.slots.iter().enumerate() {
            inv[slot] = Some(bi);
        }
        inv
    }
}
