//! Per-beam termination flags.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Why a sequence stopped, in reporting priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinishReason {
    /// The end-of-sequence id was emitted.
    EndId,
    /// A configured stop-word sequence appeared as a suffix.
    StopWords,
    /// The request's max-new-tokens budget was used up.
    MaxNewTokens,
    /// The sequence reached its absolute length limit.
    MaxLength,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndId => write!(f, "end_id"),
            Self::StopWords => write!(f, "stop_words"),
            Self::MaxNewTokens => write!(f, "max_new_tokens"),
            Self::MaxLength => write!(f, "max_length"),
        }
    }
}

/// Bit set of termination reasons for one (slot, beam).
///
/// Stored as one byte per beam in the `finished` buffer. Several reasons may
/// be set at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct FinishedState(u8);

impl FinishedState {
    pub const NOT_FINISHED: Self = Self(0);
    pub const END_ID: Self = Self(1 << 0);
    pub const STOP_WORDS: Self = Self(1 << 1);
    pub const MAX_LENGTH: Self = Self(1 << 2);
    pub const MAX_NEW_TOKENS: Self = Self(1 << 3);
    /// The slot is inactive for this step; not a termination reason.
    pub const SKIP_DECODING: Self = Self(1 << 4);

    const FINISHED_MASK: u8 = Self::END_ID.0 | Self::STOP_WORDS.0 | Self::MAX_LENGTH.0 | Self::MAX_NEW_TOKENS.0;

    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any termination flag is set.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        self.0 & Self::FINISHED_MASK != 0
    }

    #[must_use]
    pub const fn is_finished_end_id(self) -> bool {
        self.contains(Self::END_ID)
    }

    #[must_use]
    pub const fn is_finished_stop_words(self) -> bool {
        self.contains(Self::STOP_WORDS)
    }

    #[must_use]
    pub const fn is_finished_max_length(self) -> bool {
        self.contains(Self::MAX_LENGTH)
    }

    #[must_use]
    pub const fn is_finished_max_new_tokens(self) -> bool {
        self.contains(Self::MAX_NEW_TOKENS)
    }

    #[must_use]
    pub const fn is_skip_decoding(self) -> bool {
        self.contains(Self::SKIP_DECODING)
    }

    pub fn set(&mut self, flag: Self) {
        self.0 |= flag.0;
    }

    /// The dominant reason, or `None` while the sequence is live.
    #[must_use]
    pub fn reason(self) -> Option<FinishReason> {
        if self.is_finished_end_id() {
            Some(FinishReason::EndId)
        } else if self.is_finished_stop_words() {
            Some(FinishReason::StopWords)
        } else if self.is_finished_max_new_tokens() {
            Some(FinishReason::MaxNewTokens)
        } else if self.is_finished_max_length() {
            Some(FinishReason::MaxLength)
        } else {
            None
        }
    }
}

impl BitOr for FinishedState {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for FinishedState {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_not_finished() {
        let s = FinishedState::default();
        assert_eq!(s, FinishedState::NOT_FINISHED);
        assert!(!s.is_finished());
        assert_eq!(s.reason(), None);
    }

    #[test]
    fn flags_compose() {
        let s = FinishedState::STOP_WORDS | FinishedState::MAX_LENGTH;
        assert!(s.is_finished());
        assert!(s.is_finished_stop_words());
        assert!(s.is_finished_max_length());
        assert!(!s.is_finished_end_id());
        assert_eq!(s.reason(), Some(FinishReason::StopWords));
    }

    #[test]
    fn skip_decoding_is_not_finished() {
        let mut s = FinishedState::SKIP_DECODING;
        assert!(!s.is_finished());
        s |= FinishedState::END_ID;
        assert!(s.is_finished());
        assert!(s.is_skip_decoding());
        assert_eq!(s.reason(), Some(FinishReason::EndId));
    }

    #[test]
    fn bits_round_trip_through_buffer_byte() {
        let mut s = FinishedState::NOT_FINISHED;
        s.set(FinishedState::MAX_NEW_TOKENS);
        let byte = s.bits();
        assert_eq!(FinishedState::from_bits(byte).reason(), Some(FinishReason::MaxNewTokens));
    }
}
