//! Collective communication between decoding ranks.
//!
//! When several ranks decode the same batch, one rank's sampling result is
//! authoritative for each step. After the decoding layer runs, the driver
//! broadcasts the slot-aligned state from the root rank and waits on a
//! barrier so no rank observes a partial update.

use std::sync::{Arc, Barrier, Mutex, PoisonError};

use crate::{Error, Result};

/// Collective operations used by the decoding pipeline.
pub trait Comm: Send + Sync {
    /// This rank's index.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn world_size(&self) -> usize;

    /// Replace `data` on every rank with the root's bytes.
    ///
    /// # Errors
    /// Returns [`Error::Collective`] on every rank if the ranks disagree on
    /// the buffer length or `root` is not a valid rank.
    fn broadcast_bytes(&self, data: &mut [u8], root: usize) -> Result<()>;

    /// Block until every rank has reached the barrier.
    ///
    /// # Errors
    /// Returns [`Error::Collective`] if the group is broken.
    fn barrier(&self) -> Result<()>;

    /// Broadcast an `i32` buffer.
    ///
    /// # Errors
    /// See [`broadcast_bytes`](Self::broadcast_bytes).
    fn broadcast_i32(&self, data: &mut [i32], root: usize) -> Result<()> {
        self.broadcast_bytes(bytemuck::cast_slice_mut(data), root)
    }
}

/// Single-rank group: every collective is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleRank;

impl Comm for SingleRank {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn broadcast_bytes(&self, _data: &mut [u8], root: usize) -> Result<()> {
        check_root(root, 1)
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct Shared {
    barrier: Barrier,
    lengths: Mutex<Vec<usize>>,
    staging: Mutex<Vec<u8>>,
}

/// In-process group of ranks, one per thread.
///
/// Ranks first publish their buffer lengths and agree on them; only then
/// does the root's payload get copied. A disagreement fails the collective
/// on every rank.
#[derive(Debug, Clone)]
pub struct LocalComm {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

impl LocalComm {
    /// Create `world_size` connected communicators, one per rank.
    ///
    /// # Errors
    /// Returns [`Error::Collective`] if `world_size` is zero.
    pub fn group(world_size: usize) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(Error::Collective("world size must be >= 1".into()));
        }
        let shared = Arc::new(Shared {
            barrier: Barrier::new(world_size),
            lengths: Mutex::new(vec![0; world_size]),
            staging: Mutex::new(Vec::new()),
        });
        Ok((0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect())
    }
}

fn poisoned<T>(_: PoisonError<T>) -> Error {
    Error::Collective("a rank panicked while holding the group lock".into())
}

fn check_root(root: usize, world_size: usize) -> Result<()> {
    if root < world_size {
        Ok(())
    } else {
        Err(Error::Collective(format!(
            "root rank {root} out of range for world size {world_size}"
        )))
    }
}

impl Comm for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn broadcast_bytes(&self, data: &mut [u8], root: usize) -> Result<()> {
        check_root(root, self.world_size)?;

        self.shared.lengths.lock().map_err(poisoned)?[self.rank] = data.len();
        if self.rank == root {
            let mut staging = self.shared.staging.lock().map_err(poisoned)?;
            staging.clear();
            staging.extend_from_slice(data);
        }
        self.shared.barrier.wait();

        let agreed = {
            let lengths = self.shared.lengths.lock().map_err(poisoned)?;
            lengths.iter().all(|&len| len == lengths[root])
        };
        let result = if agreed {
            if self.rank != root {
                let staging = self.shared.staging.lock().map_err(poisoned)?;
                data.copy_from_slice(&staging);
            }
            Ok(())
        } else {
            let lengths = self.shared.lengths.lock().map_err(poisoned)?.clone();
            Err(Error::Collective(format!(
                "broadcast length mismatch across ranks: {lengths:?}"
            )))
        };
        // Keep the root from restaging before every rank has read.
        self.shared.barrier.wait();
        result
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }
}
