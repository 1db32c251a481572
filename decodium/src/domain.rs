//! Allocation dimensions of a decoder instance.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

fn default_tokens_per_step() -> usize {
    1
}

/// Fixed capacities every decoding buffer is sized against.
///
/// Loaded once (usually from JSON next to the engine) and validated before
/// any buffer is allocated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderDomain {
    pub max_batch_size: usize,
    pub max_beam_width: usize,
    pub vocab_size: usize,
    /// Vocabulary size rounded up by the forward pass; entries past
    /// `vocab_size` are never selected.
    pub vocab_size_padded: usize,
    pub max_seq_len: usize,
    #[serde(default = "default_tokens_per_step")]
    pub max_tokens_per_step: usize,
    #[serde(default)]
    pub max_medusa_heads: usize,
    #[serde(default)]
    pub max_attention_window: Option<usize>,
    /// Upper bound on the bytes the decoding workspaces may take.
    #[serde(default)]
    pub workspace_limit_bytes: Option<usize>,
}

impl DecoderDomain {
    /// A domain with one token per step and no Medusa heads.
    #[must_use]
    pub fn new(
        max_batch_size: usize,
        max_beam_width: usize,
        vocab_size: usize,
        max_seq_len: usize,
    ) -> Self {
        Self {
            max_batch_size,
            max_beam_width,
            vocab_size,
            vocab_size_padded: vocab_size,
            max_seq_len,
            max_tokens_per_step: 1,
            max_medusa_heads: 0,
            max_attention_window: None,
            workspace_limit_bytes: None,
        }
    }

    /// Load a domain from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or fails
    /// [`validate`](Self::validate).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse and validate a domain from JSON text.
    ///
    /// # Errors
    /// Returns [`Error::Json`] for malformed input and
    /// [`Error::InvalidConfig`] for inconsistent dimensions.
    pub fn from_json(text: &str) -> Result<Self> {
        let domain: Self = serde_json::from_str(text)?;
        domain.validate()?;
        Ok(domain)
    }

    /// Check the dimensions for consistency.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::InvalidConfig(msg));
        if self.max_batch_size == 0 || self.max_beam_width == 0 {
            return fail("max_batch_size and max_beam_width must be >= 1".into());
        }
        if self.vocab_size == 0 || self.vocab_size_padded < self.vocab_size {
            return fail(format!(
                "vocab_size_padded {} must be >= vocab_size {} > 0",
                self.vocab_size_padded, self.vocab_size
            ));
        }
        if self.max_seq_len == 0 || self.max_tokens_per_step == 0 {
            return fail("max_seq_len and max_tokens_per_step must be >= 1".into());
        }
        if i32::try_from(self.vocab_size_padded).is_err() || i32::try_from(self.max_seq_len).is_err() {
            return fail("vocabulary and sequence length must fit in i32 token ids".into());
        }
        if self.max_tokens_per_step > 1 && self.max_beam_width > 1 {
            return fail("multi-token steps are only supported with beam width 1".into());
        }
        if self.max_tokens_per_step > 1 && self.max_medusa_heads == 0 {
            return fail("multi-token steps require max_medusa_heads >= 1".into());
        }
        Ok(())
    }

    /// Absolute length limit of a request with `input_len` prompt tokens.
    #[must_use]
    pub fn sequence_limit(&self, input_len: usize, max_new_tokens: usize) -> usize {
        let mut limit = input_len.saturating_add(max_new_tokens).min(self.max_seq_len);
        if let Some(window) = self.max_attention_window {
            limit = limit.min(window);
        }
        limit
    }

    /// Checked product of `dims`, then compared against the workspace limit.
    ///
    /// # Errors
    /// Returns [`Error::ResourceExhausted`] on overflow or when the buffer
    /// would exceed `workspace_limit_bytes`.
    pub fn workspace_elements(&self, what: &str, dims: &[usize], elem_bytes: usize) -> Result<usize> {
        let numel = dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| Error::ResourceExhausted(format!("{what} size {dims:?} overflows usize")))?;
        let bytes = numel
            .checked_mul(elem_bytes)
            .ok_or_else(|| Error::ResourceExhausted(format!("{what} byte size overflows usize")))?;
        if let Some(limit) = self.workspace_limit_bytes {
            if bytes > limit {
                return Err(Error::ResourceExhausted(format!(
                    "{what} needs {bytes} bytes, workspace limit is {limit}"
                )));
            }
        }
        Ok(numel)
    }
}
