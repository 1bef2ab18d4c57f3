use crate::clock::MS_PER_DAY;
use crate::entry::Tier;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Policy inputs supplied by the governance/config layer.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub tiers: TierConfigs,
    #[serde(default)]
    pub quorum: QuorumConfig,
    #[serde(default)]
    pub snarc: SnarcConfig,
    #[serde(default)]
    pub tensor: TensorConfig,
    #[serde(default)]
    pub witness: WitnessConfig,
    #[serde(default)]
    pub federation: FederationConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TierConfig {
    /// Entries older than this are prunable. None = no TTL.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    /// Ring-buffer bound on stored slots. None = unbounded.
    #[serde(default)]
    pub capacity: Option<usize>,
    #[serde(default)]
    pub requires_signature: bool,
    /// Write appends through to the entry log.
    #[serde(default)]
    pub persist: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TierConfigs {
    #[serde(default = "default_compost")]
    pub compost: TierConfig,
    #[serde(default = "default_leaf")]
    pub leaf: TierConfig,
    #[serde(default = "default_stem")]
    pub stem: TierConfig,
    #[serde(default = "default_root")]
    pub root: TierConfig,
}

fn default_compost() -> TierConfig {
    TierConfig {
        ttl_ms: Some(60_000),
        capacity: Some(1_000),
        requires_signature: false,
        persist: false,
    }
}

fn default_leaf() -> TierConfig {
    TierConfig {
        ttl_ms: Some(4 * 60 * 60 * 1_000),
        capacity: Some(10_000),
        requires_signature: true,
        persist: true,
    }
}

fn default_stem() -> TierConfig {
    TierConfig {
        ttl_ms: Some(90 * MS_PER_DAY),
        capacity: None,
        requires_signature: true,
        persist: true,
    }
}

fn default_root() -> TierConfig {
    TierConfig {
        ttl_ms: None,
        capacity: None,
        requires_signature: true,
        persist: true,
    }
}

impl Default for TierConfigs {
    fn default() -> Self {
        Self {
            compost: default_compost(),
            leaf: default_leaf(),
            stem: default_stem(),
            root: default_root(),
        }
    }
}

impl TierConfigs {
    pub fn get(&self, tier: Tier) -> &TierConfig {
        match tier {
            Tier::Compost => &self.compost,
            Tier::Leaf => &self.leaf,
            Tier::Stem => &self.stem,
            Tier::Root => &self.root,
        }
    }
}

/// Type -> minimum witness count.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuorumConfig {
    #[serde(default = "default_min_witnesses")]
    pub default_min: usize,
    #[serde(default = "default_quorum_table")]
    pub by_type: BTreeMap<String, usize>,
}

fn default_min_witnesses() -> usize {
    1
}

fn default_quorum_table() -> BTreeMap<String, usize> {
    BTreeMap::from([
        ("pattern_consolidation".to_string(), 2),
        ("trust_update".to_string(), 3),
        ("policy_change".to_string(), 5),
    ])
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            default_min: default_min_witnesses(),
            by_type: default_quorum_table(),
        }
    }
}

impl QuorumConfig {
    pub fn required(&self, kind: &str) -> usize {
        self.by_type.get(kind).copied().unwrap_or(self.default_min)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SnarcConfig {
    pub significant_weight: u32,
    pub novel_weight: u32,
    pub anomalous_weight: u32,
    pub relevant_weight: u32,
    pub consequential_weight: u32,
    /// Impact at or above this is Significant.
    pub significance_threshold: f64,
    /// Deviation strictly above this is Anomalous.
    pub anomaly_threshold: f64,
    pub retain_threshold: u32,
    pub promote_threshold: u32,
    /// Stem entries with value * access_bonus * age_decay below this are pruned.
    pub stem_value_threshold: f64,
    pub age_decay_per_day: f64,
    pub access_bonus_step: f64,
    pub access_bonus_cap: f64,
}

impl Default for SnarcConfig {
    fn default() -> Self {
        Self {
            significant_weight: 2,
            novel_weight: 3,
            anomalous_weight: 2,
            relevant_weight: 1,
            consequential_weight: 2,
            significance_threshold: 1.0,
            anomaly_threshold: 0.7,
            retain_threshold: 3,
            promote_threshold: 5,
            stem_value_threshold: 0.1,
            age_decay_per_day: 0.1,
            access_bonus_step: 0.1,
            access_bonus_cap: 2.0,
        }
    }
}

/// EMA constants: alpha(n) = alpha0 / (1 + n / k).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EmaConfig {
    pub alpha0: f64,
    pub k: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TensorConfig {
    #[serde(default = "default_trust_ema")]
    pub trust: EmaConfig,
    #[serde(default = "default_value_ema")]
    pub value: EmaConfig,
    /// Observation count at which confidence saturates.
    #[serde(default = "default_n_max")]
    pub n_max: u64,
    #[serde(default = "default_floor")]
    pub floor: f64,
    #[serde(default = "default_decay_rate")]
    pub decay_rate_per_day: f64,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default = "default_initial")]
    pub initial: f64,
    /// Aggregate weights for the three root dimensions, in canonical order.
    #[serde(default = "default_root_weights")]
    pub trust_weights: [f64; 3],
    #[serde(default = "default_root_weights")]
    pub value_weights: [f64; 3],
}

fn default_trust_ema() -> EmaConfig {
    EmaConfig { alpha0: 0.3, k: 10.0 }
}

fn default_value_ema() -> EmaConfig {
    EmaConfig { alpha0: 0.25, k: 20.0 }
}

fn default_n_max() -> u64 {
    100
}

fn default_floor() -> f64 {
    0.3
}

fn default_decay_rate() -> f64 {
    0.05
}

fn default_epsilon() -> f64 {
    1e-6
}

fn default_initial() -> f64 {
    0.5
}

fn default_root_weights() -> [f64; 3] {
    [1.0, 1.0, 1.0]
}

impl Default for TensorConfig {
    fn default() -> Self {
        Self {
            trust: default_trust_ema(),
            value: default_value_ema(),
            n_max: default_n_max(),
            floor: default_floor(),
            decay_rate_per_day: default_decay_rate(),
            epsilon: default_epsilon(),
            initial: default_initial(),
            trust_weights: default_root_weights(),
            value_weights: default_root_weights(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WitnessConfig {
    pub min_trust: f64,
    /// Witness must have been active within this window.
    pub recency_window_ms: u64,
    /// Minimum Jaccard overlap between witness contexts and entry tags.
    pub min_relevance: f64,
    /// Window for counting recent witnessings of the same author.
    pub diversity_window_ms: u64,
    /// `time` witnesses must observe within this skew of the entry timestamp.
    pub max_time_skew_ms: u64,
    pub ack_delta: f64,
    pub quality_delta: f64,
    pub invalid_delta: f64,
    /// How far back a witness's eligibility history reaches.
    pub trust_history_window_ms: u64,
}

impl Default for WitnessConfig {
    fn default() -> Self {
        Self {
            min_trust: 0.7,
            recency_window_ms: 7 * MS_PER_DAY,
            min_relevance: 0.1,
            diversity_window_ms: MS_PER_DAY,
            max_time_skew_ms: 5 * 60 * 1_000,
            ack_delta: 0.01,
            quality_delta: 0.02,
            invalid_delta: -0.05,
            trust_history_window_ms: 30 * MS_PER_DAY,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub peer_timeout_ms: u64,
    /// Standing fetch scope, joined with the node's retention context. Summaries
    /// must share a tag with the union; an empty union accepts everything.
    pub relevant_tags: Vec<String>,
    /// Weight of a peer's tensor view when merging (local weight is 1 - this).
    pub peer_tensor_weight: f64,
    pub max_summaries: usize,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            peer_timeout_ms: 5_000,
            relevant_tags: Vec::new(),
            peer_tensor_weight: 0.2,
            max_summaries: 1_024,
        }
    }
}

impl LedgerConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: LedgerConfig =
            serde_json::from_str(s).map_err(|e| ConfigError::Parse(format!("{}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: LedgerConfig =
            toml::from_str(s).map_err(|e| ConfigError::Parse(format!("{}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load by extension: `.toml` or JSON otherwise.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&data),
            _ => Self::from_json_str(&data),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.snarc;
        if s.promote_threshold < s.retain_threshold {
            return Err(ConfigError::Invalid(format!(
                "snarc.promote_threshold ({}) below retain_threshold ({})",
                s.promote_threshold, s.retain_threshold
            )));
        }
        let t = &self.tensor;
        if !(0.0..=1.0).contains(&t.floor) {
            return Err(ConfigError::Invalid(format!("tensor.floor {} outside [0,1]", t.floor)));
        }
        if !(0.0..=1.0).contains(&t.initial) {
            return Err(ConfigError::Invalid(format!(
                "tensor.initial {} outside [0,1]",
                t.initial
            )));
        }
        for (name, ema) in [("trust", t.trust), ("value", t.value)] {
            if !(ema.alpha0 > 0.0 && ema.alpha0 <= 1.0) || !(ema.k > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "tensor.{} ema requires 0 < alpha0 <= 1 and k > 0",
                    name
                )));
            }
        }
        if t.n_max == 0 {
            return Err(ConfigError::Invalid("tensor.n_max must be > 0".into()));
        }
        for w in t.trust_weights.iter().chain(t.value_weights.iter()) {
            if !w.is_finite() || *w < 0.0 {
                return Err(ConfigError::Invalid("tensor root weights must be >= 0".into()));
            }
        }
        if t.trust_weights.iter().sum::<f64>() <= 0.0 || t.value_weights.iter().sum::<f64>() <= 0.0 {
            return Err(ConfigError::Invalid("tensor root weights must not all be zero".into()));
        }
        if !(0.0..=1.0).contains(&self.witness.min_trust) {
            return Err(ConfigError::Invalid("witness.min_trust outside [0,1]".into()));
        }
        if !(0.0..=1.0).contains(&self.federation.peer_tensor_weight) {
            return Err(ConfigError::Invalid(
                "federation.peer_tensor_weight outside [0,1]".into(),
            ));
        }
        for tier in Tier::ALL {
            if let Some(0) = self.tiers.get(tier).capacity {
                return Err(ConfigError::Invalid(format!("tier {} capacity must be > 0", tier)));
            }
        }
        if self.tiers.root.ttl_ms.is_some() || self.tiers.root.capacity.is_some() {
            return Err(ConfigError::Invalid(
                "root tier is permanent: ttl_ms and capacity must be unset".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        LedgerConfig::default().validate().expect("defaults valid");
    }

    #[test]
    fn quorum_table_defaults() {
        let q = QuorumConfig::default();
        assert_eq!(q.required("policy_change"), 5);
        assert_eq!(q.required("trust_update"), 3);
        assert_eq!(q.required("pattern_consolidation"), 2);
        assert_eq!(q.required("observation"), 1);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg = LedgerConfig::from_json_str(r#"{"witness":{"min_trust":0.8}}"#)
            .expect("parse");
        assert_eq!(cfg.witness.min_trust, 0.8);
        assert_eq!(cfg.tiers.compost.capacity, Some(1_000));
        assert_eq!(cfg.snarc.promote_threshold, 5);
    }

    #[test]
    fn toml_overrides_quorum() {
        let cfg = LedgerConfig::from_toml_str(
            r#"
            [quorum]
            default_min = 2
            [quorum.by_type]
            policy_change = 7
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.quorum.required("policy_change"), 7);
        assert_eq!(cfg.quorum.required("other"), 2);
    }

    #[test]
    fn rejects_promote_below_retain() {
        let mut cfg = LedgerConfig::default();
        cfg.snarc.promote_threshold = 2;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_root_ttl() {
        let mut cfg = LedgerConfig::default();
        cfg.tiers.root.ttl_ms = Some(1);
        assert!(cfg.validate().is_err());
    }
}
