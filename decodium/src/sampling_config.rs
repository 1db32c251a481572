//! Per-request sampling configuration and batch fusion.
//!
//! Every optional field holds either one value (broadcast to the whole
//! batch) or exactly `batch_size` values, one per request in batch order.
//! [`SamplingConfig::fuse`] merges single-request configs into one batch
//! config and [`SamplingConfig::validate`] enforces the length rule.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default values used when a request leaves a field unset.
pub mod defaults {
    pub const TEMPERATURE: f32 = 1.0;
    pub const MIN_LENGTH: u32 = 1;
    pub const REPETITION_PENALTY: f32 = 1.0;
    pub const PRESENCE_PENALTY: f32 = 0.0;
    pub const FREQUENCY_PENALTY: f32 = 0.0;
    pub const TOP_K: u32 = 0;
    pub const TOP_P: f32 = 0.0;
    pub const SEED: u64 = 0;
    pub const TOP_P_DECAY: f32 = 1.0;
    pub const TOP_P_MIN: f32 = 1.0e-6;
    pub const TOP_P_RESET_ID: i32 = -1;
    pub const BEAM_SEARCH_DIVERSITY: f32 = 0.0;
    pub const LENGTH_PENALTY: f32 = 0.0;
    pub const EARLY_STOPPING: i32 = 1;
    pub const NO_REPEAT_NGRAM_SIZE: u32 = 0;
    pub const NORMALIZE_LOG_PROBS: bool = false;

    /// Medusa heads default to an empty per-head top-k list.
    #[must_use]
    pub fn top_k_medusa_heads() -> Vec<u32> {
        Vec::new()
    }
}

fn default_beam_width() -> usize {
    1
}

/// Sampling configuration for one request or a fused batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_beam_width")]
    pub beam_width: usize,

    #[serde(default)]
    pub temperature: Option<Vec<f32>>,
    #[serde(default)]
    pub min_length: Option<Vec<u32>>,
    #[serde(default)]
    pub repetition_penalty: Option<Vec<f32>>,
    #[serde(default)]
    pub presence_penalty: Option<Vec<f32>>,
    #[serde(default)]
    pub frequency_penalty: Option<Vec<f32>>,
    #[serde(default)]
    pub no_repeat_ngram_size: Option<Vec<u32>>,

    // sampling
    #[serde(default)]
    pub top_k: Option<Vec<u32>>,
    #[serde(default)]
    pub top_p: Option<Vec<f32>>,
    #[serde(default)]
    pub random_seed: Option<Vec<u64>>,
    #[serde(default)]
    pub top_p_decay: Option<Vec<f32>>,
    #[serde(default)]
    pub top_p_min: Option<Vec<f32>>,
    #[serde(default)]
    pub top_p_reset_ids: Option<Vec<i32>>,

    // beam search
    #[serde(default)]
    pub beam_search_diversity_rate: Option<Vec<f32>>,
    #[serde(default)]
    pub length_penalty: Option<Vec<f32>>,
    #[serde(default)]
    pub early_stopping: Option<Vec<i32>>,

    // medusa
    #[serde(default)]
    pub top_k_medusa_heads: Option<Vec<Vec<u32>>>,

    /// Sampled log probabilities are taken over the renormalized
    /// top-k/top-p set rather than the full vocabulary. Batch-wide; beam
    /// search scores always use the full vocabulary.
    #[serde(default)]
    pub normalize_log_probs: Option<bool>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

impl SamplingConfig {
    /// An empty config: every field falls back to its default.
    #[must_use]
    pub fn new(beam_width: usize) -> Self {
        Self {
            beam_width,
            temperature: None,
            min_length: None,
            repetition_penalty: None,
            presence_penalty: None,
            frequency_penalty: None,
            no_repeat_ngram_size: None,
            top_k: None,
            top_p: None,
            random_seed: None,
            top_p_decay: None,
            top_p_min: None,
            top_p_reset_ids: None,
            beam_search_diversity_rate: None,
            length_penalty: None,
            early_stopping: None,
            top_k_medusa_heads: None,
            normalize_log_probs: None,
        }
    }

    /// Parse a config from JSON.
    ///
    /// # Errors
    /// Returns [`Error::Json`] if the text is not a valid config.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Fuse per-request configs into one batch config.
    ///
    /// For every field, if at least one request sets it, the result holds
    /// one value per request (the request's own value, or the default);
    /// otherwise the field stays unset. Each request must carry scalar
    /// overrides (length 1) and all requests must share one beam width.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] on an empty input, a mismatched beam
    /// width, or a request field holding more than one value.
    pub fn fuse(configs: &[SamplingConfig]) -> Result<Self> {
        let first = configs
            .first()
            .ok_or_else(|| Error::InvalidConfig("cannot fuse an empty config list".into()))?;
        if let Some(other) = configs.iter().find(|c| c.beam_width != first.beam_width) {
            return Err(Error::InvalidConfig(format!(
                "beam width {} differs from batch beam width {}",
                other.beam_width, first.beam_width
            )));
        }

        Ok(Self {
            beam_width: first.beam_width,
            normalize_log_probs: first.normalize_log_probs,
            temperature: fuse_values(configs, "temperature", |c| &c.temperature, defaults::TEMPERATURE)?,
            min_length: fuse_values(configs, "min_length", |c| &c.min_length, defaults::MIN_LENGTH)?,
            repetition_penalty: fuse_values(
                configs,
                "repetition_penalty",
                |c| &c.repetition_penalty,
                defaults::REPETITION_PENALTY,
            )?,
            presence_penalty: fuse_values(
                configs,
                "presence_penalty",
                |c| &c.presence_penalty,
                defaults::PRESENCE_PENALTY,
            )?,
            frequency_penalty: fuse_values(
                configs,
                "frequency_penalty",
                |c| &c.frequency_penalty,
                defaults::FREQUENCY_PENALTY,
            )?,
            no_repeat_ngram_size: fuse_values(
                configs,
                "no_repeat_ngram_size",
                |c| &c.no_repeat_ngram_size,
                defaults::NO_REPEAT_NGRAM_SIZE,
            )?,
            top_k: fuse_values(configs, "top_k", |c| &c.top_k, defaults::TOP_K)?,
            top_p: fuse_values(configs, "top_p", |c| &c.top_p, defaults::TOP_P)?,
            random_seed: fuse_values(configs, "random_seed", |c| &c.random_seed, defaults::SEED)?,
            top_p_decay: fuse_values(configs, "top_p_decay", |c| &c.top_p_decay, defaults::TOP_P_DECAY)?,
            top_p_min: fuse_values(configs, "top_p_min", |c| &c.top_p_min, defaults::TOP_P_MIN)?,
            top_p_reset_ids: fuse_values(
                configs,
                "top_p_reset_ids",
                |c| &c.top_p_reset_ids,
                defaults::TOP_P_RESET_ID,
            )?,
            beam_search_diversity_rate: fuse_values(
                configs,
                "beam_search_diversity_rate",
                |c| &c.beam_search_diversity_rate,
                defaults::BEAM_SEARCH_DIVERSITY,
            )?,
            length_penalty: fuse_values(
                configs,
                "length_penalty",
                |c| &c.length_penalty,
                defaults::LENGTH_PENALTY,
            )?,
            early_stopping: fuse_values(
                configs,
                "early_stopping",
                |c| &c.early_stopping,
                defaults::EARLY_STOPPING,
            )?,
            top_k_medusa_heads: fuse_values(
                configs,
                "top_k_medusa_heads",
                |c| &c.top_k_medusa_heads,
                defaults::top_k_medusa_heads(),
            )?,
        })
    }

    /// Check the broadcast rule and value ranges against a batch size.
    ///
    /// # Errors
    /// Returns [`Error::BroadcastLength`] when a vector has neither 1 nor
    /// `batch_size` entries, and [`Error::InvalidConfig`] for out-of-range
    /// values.
    pub fn validate(&self, batch_size: usize) -> Result<()> {
        if self.beam_width == 0 {
            return Err(Error::InvalidConfig("beam width must be >= 1".into()));
        }
        check_len("temperature", self.temperature.as_deref(), batch_size)?;
        check_len("min_length", self.min_length.as_deref(), batch_size)?;
        check_len("repetition_penalty", self.repetition_penalty.as_deref(), batch_size)?;
        check_len("presence_penalty", self.presence_penalty.as_deref(), batch_size)?;
        check_len("frequency_penalty", self.frequency_penalty.as_deref(), batch_size)?;
        check_len("no_repeat_ngram_size", self.no_repeat_ngram_size.as_deref(), batch_size)?;
        check_len("top_k", self.top_k.as_deref(), batch_size)?;
        check_len("top_p", self.top_p.as_deref(), batch_size)?;
        check_len("top_p_decay", self.top_p_decay.as_deref(), batch_size)?;
        check_len("top_p_min", self.top_p_min.as_deref(), batch_size)?;
        check_len("top_p_reset_ids", self.top_p_reset_ids.as_deref(), batch_size)?;
        check_len(
            "beam_search_diversity_rate",
            self.beam_search_diversity_rate.as_deref(),
            batch_size,
        )?;
        check_len("length_penalty", self.length_penalty.as_deref(), batch_size)?;
        check_len("early_stopping", self.early_stopping.as_deref(), batch_size)?;
        check_len("top_k_medusa_heads", self.top_k_medusa_heads.as_deref(), batch_size)?;
        if let Some(seeds) = &self.random_seed {
            if seeds.len() != 1 && seeds.len() != batch_size {
                return Err(Error::InvalidConfig(format!(
                    "random seed vector size mismatch: {} seeds for batch size {batch_size}",
                    seeds.len()
                )));
            }
        }

        check_range("temperature", self.temperature.as_deref(), |t| t >= 0.0)?;
        check_range("repetition_penalty", self.repetition_penalty.as_deref(), |p| p >= 0.0)?;
        check_range("presence_penalty", self.presence_penalty.as_deref(), f32::is_finite)?;
        check_range("frequency_penalty", self.frequency_penalty.as_deref(), f32::is_finite)?;
        check_range("top_p", self.top_p.as_deref(), |p| (0.0..=1.0).contains(&p))?;
        check_range("top_p_decay", self.top_p_decay.as_deref(), |d| d > 0.0 && d <= 1.0)?;
        check_range("top_p_min", self.top_p_min.as_deref(), |m| m > 0.0 && m <= 1.0)?;
        check_range(
            "beam_search_diversity_rate",
            self.beam_search_diversity_rate.as_deref(),
            |r| r >= 0.0,
        )?;
        check_range("length_penalty", self.length_penalty.as_deref(), f32::is_finite)?;
        Ok(())
    }

    /// Whether any request in the config asks for top-p filtering.
    #[must_use]
    pub fn uses_top_p(&self) -> bool {
        self.top_p
            .as_deref()
            .is_some_and(|v| v.iter().any(|&p| p > 0.0))
    }
}

/// Value for batch index `batch_idx` under the broadcast rule.
///
/// `None` yields `default`; a single value is shared by every request.
#[must_use]
pub fn broadcast_value<T: Copy>(values: Option<&[T]>, batch_idx: usize, default: T) -> T {
    match values {
        None | Some([]) => default,
        Some([v]) => *v,
        Some(vs) => vs.get(batch_idx).copied().unwrap_or(default),
    }
}

fn fuse_values<T: Clone>(
    configs: &[SamplingConfig],
    name: &'static str,
    accessor: impl Fn(&SamplingConfig) -> &Option<Vec<T>>,
    default: T,
) -> Result<Option<Vec<T>>> {
    if configs.iter().all(|c| accessor(c).is_none()) {
        return Ok(None);
    }
    configs
        .iter()
        .map(|c| match accessor(c) {
            None => Ok(default.clone()),
            Some(v) if v.len() == 1 => Ok(v[0].clone()),
            Some(v) => Err(Error::InvalidConfig(format!(
                "{name} of a single request must hold one value, got {}",
                v.len()
            ))),
        })
        .collect::<Result<Vec<T>>>()
        .map(Some)
}

fn check_len<T>(name: &'static str, values: Option<&[T]>, batch_size: usize) -> Result<()> {
    match values {
        Some(v) if v.len() != 1 && v.len() != batch_size => Err(Error::BroadcastLength {
            name,
            got: v.len(),
            batch_size,
        }),
        _ => Ok(()),
    }
}

fn check_range(name: &str, values: Option<&[f32]>, valid: impl Fn(f32) -> bool) -> Result<()> {
    if let Some(bad) = values.into_iter().flatten().find(|&&v| !valid(v)) {
        return Err(Error::InvalidConfig(format!("{name} value {bad} is out of range")));
    }
    Ok(())
}
