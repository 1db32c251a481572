//! Decoding mode bitmask.
//!
//! A batch runs exactly one decoding variant. The mode is a small bitmask
//! over {TopK, TopP, BeamSearch, Medusa}; only the combinations produced by
//! the named constructors are valid, and [`DecodingMode::from_bits`] rejects
//! everything else.

use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// The decoding-layer variant a mode dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodingVariant {
    /// Top-k and/or top-p sampling (greedy when both are disabled).
    TopKTopP,
    /// Beam search with `beam_width > 1`.
    BeamSearch,
    /// Medusa tree-based speculative acceptance.
    Medusa,
}

/// Immutable decoding mode bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DecodingMode(u8);

impl DecodingMode {
    const NONE: u8 = 0;
    const TOP_K: u8 = 1 << 0;
    const TOP_P: u8 = 1 << 1;
    const BEAM_SEARCH: u8 = 1 << 2;
    const MEDUSA: u8 = 1 << 3;
    const TOP_K_TOP_P: u8 = Self::TOP_K | Self::TOP_P;

    /// No mode selected; resolved from the beam width at setup.
    #[must_use]
    pub const fn none() -> Self {
        Self(Self::NONE)
    }

    #[must_use]
    pub const fn top_k() -> Self {
        Self(Self::TOP_K)
    }

    #[must_use]
    pub const fn top_p() -> Self {
        Self(Self::TOP_P)
    }

    #[must_use]
    pub const fn top_k_top_p() -> Self {
        Self(Self::TOP_K_TOP_P)
    }

    #[must_use]
    pub const fn beam_search() -> Self {
        Self(Self::BEAM_SEARCH)
    }

    #[must_use]
    pub const fn medusa() -> Self {
        Self(Self::MEDUSA)
    }

    /// Build a mode from raw bits.
    ///
    /// # Errors
    /// Returns [`Error::InvalidDecodingMode`] for unknown bits or when beam
    /// search or Medusa is combined with any other flag.
    pub fn from_bits(bits: u8) -> Result<Self> {
        let known = Self::TOP_K_TOP_P | Self::BEAM_SEARCH | Self::MEDUSA;
        if bits & !known != 0 {
            return Err(Error::InvalidDecodingMode(format!(
                "unknown mode bits {bits:#010b}"
            )));
        }
        let exclusive = |flag: u8| bits & flag != 0 && bits != flag;
        if exclusive(Self::BEAM_SEARCH) || exclusive(Self::MEDUSA) {
            return Err(Error::InvalidDecodingMode(format!(
                "{bits:#010b} combines beam search or medusa with other modes"
            )));
        }
        Ok(Self(bits))
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == Self::NONE
    }

    #[must_use]
    pub const fn is_top_k(self) -> bool {
        self.any_bit_set(Self::TOP_K)
    }

    #[must_use]
    pub const fn is_top_p(self) -> bool {
        self.any_bit_set(Self::TOP_P)
    }

    #[must_use]
    pub const fn is_top_k_or_top_p(self) -> bool {
        self.any_bit_set(Self::TOP_K_TOP_P)
    }

    #[must_use]
    pub const fn is_top_k_and_top_p(self) -> bool {
        self.all_bit_set(Self::TOP_K_TOP_P)
    }

    #[must_use]
    pub const fn is_beam_search(self) -> bool {
        self.any_bit_set(Self::BEAM_SEARCH)
    }

    #[must_use]
    pub const fn is_medusa(self) -> bool {
        self.any_bit_set(Self::MEDUSA)
    }

    /// Resolve `None` against the batch beam width: top-k/top-p for a beam
    /// width of 1, beam search otherwise.
    ///
    /// # Errors
    /// Returns [`Error::InvalidDecodingMode`] if beam search is requested
    /// with a beam width of 1, or a sampling/Medusa mode with a wider beam.
    pub fn resolve(self, beam_width: usize) -> Result<Self> {
        if self.is_none() {
            return Ok(if beam_width > 1 {
                Self::beam_search()
            } else {
                Self::top_k_top_p()
            });
        }
        if self.is_beam_search() != (beam_width > 1) {
            return Err(Error::InvalidDecodingMode(format!(
                "mode {self} is incompatible with beam width {beam_width}"
            )));
        }
        Ok(self)
    }

    /// The decoding-layer variant for a resolved mode.
    ///
    /// # Errors
    /// Returns [`Error::InvalidDecodingMode`] for an unresolved `None` mode.
    pub fn variant(self) -> Result<DecodingVariant> {
        if self.is_top_k_or_top_p() {
            Ok(DecodingVariant::TopKTopP)
        } else if self.is_beam_search() {
            Ok(DecodingVariant::BeamSearch)
        } else if self.is_medusa() {
            Ok(DecodingVariant::Medusa)
        } else {
            Err(Error::InvalidDecodingMode(
                "mode None must be resolved against a beam width first".into(),
            ))
        }
    }

    const fn any_bit_set(self, bits: u8) -> bool {
        self.0 & bits != 0
    }

    const fn all_bit_set(self, bits: u8) -> bool {
        self.0 & bits == bits
    }
}

impl fmt::Display for DecodingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            Self::NONE => "none",
            Self::TOP_K => "top_k",
            Self::TOP_P => "top_p",
            Self::TOP_K_TOP_P => "top_k_top_p",
            Self::BEAM_SEARCH => "beam_search",
            Self::MEDUSA => "medusa",
            _ => "invalid",
        };
        f.write_str(name)
    }
}

impl FromStr for DecodingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::none()),
            "top_k" => Ok(Self::top_k()),
            "top_p" => Ok(Self::top_p()),
            "top_k_top_p" => Ok(Self::top_k_top_p()),
            "beam_search" => Ok(Self::beam_search()),
            "medusa" => Ok(Self::medusa()),
            other => Err(Error::InvalidDecodingMode(format!("unknown mode '{other}'"))),
        }
    }
}
