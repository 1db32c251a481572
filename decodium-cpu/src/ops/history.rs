//! Token history of a beam, reconstructed through parent ids.

use super::to_index;

/// Newest-first walk over the tokens of one beam.
///
/// `output_ids` and `parent_ids` are one slot's `[BW, L]` blocks. With a
/// single beam the walk is a plain reverse scan of row 0.
#[derive(Debug, Clone)]
pub struct Lineage<'a> {
    output_ids: &'a [i32],
    parent_ids: &'a [i32],
    beam_width: usize,
    max_seq_len: usize,
    beam: usize,
    remaining: usize,
}

impl<'a> Lineage<'a> {
    /// Walk the first `seq_len` tokens of `beam`, newest first.
    #[must_use]
    pub fn new(
        output_ids: &'a [i32],
        parent_ids: &'a [i32],
        beam_width: usize,
        max_seq_len: usize,
        beam: usize,
        seq_len: usize,
    ) -> Self {
        Self {
            output_ids,
            parent_ids,
            beam_width,
            max_seq_len,
            beam,
            remaining: seq_len.min(max_seq_len),
        }
    }

    /// Collect the history in chronological order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<i32> {
        let mut tokens: Vec<i32> = self.clone().collect();
        tokens.reverse();
        tokens
    }
}

impl Iterator for Lineage<'_> {
    type Item = i32;

    fn next(&mut self) -> Option<i32> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let idx = self.beam * self.max_seq_len + self.remaining;
        let token = self.output_ids[idx];
        if self.beam_width > 1 {
            if let Some(parent) = to_index(self.parent_ids[idx]).filter(|&p| p < self.beam_width) {
                self.beam = parent;
            }
        }
        Some(token)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Lineage<'_> {}

/// Beam row holding each position of `beam`'s history, oldest first.
#[must_use]
pub fn source_rows(parent_ids: &[i32], beam_width: usize, max_seq_len: usize, beam: usize, seq_len: usize) -> Vec<usize> {
    let len = seq_len.min(max_seq_len);
    let mut rows = vec![0; len];
    let mut b = beam;
    for pos in (0..len).rev() {
        rows[pos] = b;
        if beam_width > 1 {
            if let Some(parent) = to_index(parent_ids[b * max_seq_len + pos]).filter(|&p| p < beam_width) {
                b = parent;
            }
        }
    }
    rows
}

/// Whether the newest tokens of `history` spell `word`.
pub fn ends_with(history: Lineage<'_>, word: &[i32]) -> bool {
    history.len() >= word.len() && word.iter().rev().zip(history).all(|(&w, t)| w == t)
}
