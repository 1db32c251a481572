//! Flattened bad-word / stop-word tables.
//!
//! Each slot owns a `[2, row_len]` block of `i32`: row 0 holds the word
//! tokens concatenated, row 1 holds the cumulative end offset of every word.
//! Unused cells are `-1`. When every word of a slot is a single token the
//! row is one cell longer than the token count, leaving a trailing `-1`
//! offset; kernels stop at the first negative offset.

use crate::backend::TensorFactory;
use crate::{Error, Result};

/// Host-side flattened word list for one slot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WordList {
    tokens: Vec<i32>,
    offsets: Vec<i32>,
}

impl WordList {
    /// Flatten `words`, skipping empty entries.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if a word contains a negative token id.
    pub fn new(words: &[Vec<i32>]) -> Result<Self> {
        let mut tokens = Vec::new();
        let mut offsets = Vec::new();
        for word in words.iter().filter(|w| !w.is_empty()) {
            if let Some(bad) = word.iter().find(|&&t| t < 0) {
                return Err(Error::InvalidConfig(format!(
                    "word {word:?} contains negative token id {bad}"
                )));
            }
            tokens.extend_from_slice(word);
            offsets.push(to_i32(tokens.len())?);
        }
        Ok(Self { tokens, offsets })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Number of words.
    #[must_use]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Width of this slot's rows in the flattened table.
    #[must_use]
    pub fn row_len(&self) -> usize {
        let all_single = !self.is_empty() && self.offsets.len() == self.tokens.len();
        self.tokens.len() + usize::from(all_single)
    }

    /// The `i`-th word.
    #[must_use]
    pub fn word(&self, i: usize) -> Option<&[i32]> {
        let end = usize::try_from(*self.offsets.get(i)?).ok()?;
        let start = if i == 0 {
            0
        } else {
            usize::try_from(self.offsets[i - 1]).ok()?
        };
        self.tokens.get(start..end)
    }

    /// Write the `[2, width]` row pair, padding with `-1`.
    fn write_rows(&self, width: usize, out: &mut [i32]) {
        out[..2 * width].fill(-1);
        out[..self.tokens.len()].copy_from_slice(&self.tokens);
        out[width..width + self.offsets.len()].copy_from_slice(&self.offsets);
    }
}

/// Iterate the word spans of one slot's `[2, row_len]` block.
///
/// `tokens` and `offsets` are the two rows truncated to the slot's length.
/// Iteration stops at the first negative or out-of-range offset.
pub fn word_spans<'a>(tokens: &'a [i32], offsets: &'a [i32]) -> impl Iterator<Item = &'a [i32]> + 'a {
    let mut start = 0usize;
    offsets.iter().map_while(move |&end| {
        let end = usize::try_from(end).ok()?;
        if end < start || end > tokens.len() {
            return None;
        }
        let span = &tokens[start..end];
        start = end;
        Some(span)
    })
}

/// Device-resident word table for a whole batch.
///
/// `words` is `[max_batch_size, 2, max_row_len]` (`I32`), `lens` is
/// `[max_batch_size]` (`I32`) holding each slot's row length.
#[derive(Debug, Clone)]
pub struct WordTable<T> {
    pub words: T,
    pub lens: T,
    pub max_row_len: usize,
}

impl<T> WordTable<T> {
    /// Build a table from per-request word lists placed at `batch_slots`.
    ///
    /// Slots not named in `batch_slots` get an empty row.
    ///
    /// # Errors
    /// Returns an error if the list counts disagree, a slot is out of range,
    /// or a word is invalid.
    pub fn from_words<B>(
        words_per_request: &[Vec<Vec<i32>>],
        batch_slots: &[usize],
        max_batch_size: usize,
    ) -> Result<Self>
    where
        B: TensorFactory<Tensor = T>,
    {
        if words_per_request.len() != batch_slots.len() {
            return Err(Error::InvalidConfig(format!(
                "{} word lists for {} batch slots",
                words_per_request.len(),
                batch_slots.len()
            )));
        }
        let lists = words_per_request
            .iter()
            .map(|w| WordList::new(w))
            .collect::<Result<Vec<_>>>()?;
        let max_row_len = lists.iter().map(WordList::row_len).max().unwrap_or(0).max(1);

        let mut words = vec![-1i32; max_batch_size * 2 * max_row_len];
        let mut lens = vec![0i32; max_batch_size];
        for (list, &slot) in lists.iter().zip(batch_slots) {
            if slot >= max_batch_size {
                return Err(Error::SlotOutOfRange {
                    slot,
                    max_batch_size,
                });
            }
            let block = &mut words[slot * 2 * max_row_len..(slot + 1) * 2 * max_row_len];
            list.write_rows(max_row_len, block);
            lens[slot] = to_i32(list.row_len())?;
        }
        log::debug!(
            "word table: {} requests, row length {max_row_len}",
            batch_slots.len()
        );

        Ok(Self {
            words: B::from_i32_slice(&[max_batch_size, 2, max_row_len], &words)?,
            lens: B::from_i32_slice(&[max_batch_size], &lens)?,
            max_row_len,
        })
    }
}

fn to_i32(v: usize) -> Result<i32> {
    i32::try_from(v).map_err(|_| Error::InvalidConfig(format!("word table index {v} overflows i32")))
}
