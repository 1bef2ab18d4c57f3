// Tensor Engine: per-entity T3 (trust) and V3 (value) tensors.
// Each tensor has three root dimensions plus named sub-dimensions; every
// dimension tracks an EMA value, observation count, confidence and last update.
// T3 aggregates with a weighted geometric mean (a zero root collapses trust),
// V3 with a weighted arithmetic mean.
// Observations for one entity serialize on the map shard that owns it.

use crate::clock::ms_to_days;
use crate::config::{EmaConfig, TensorConfig};
use crate::entry::EntityId;
use crate::error::TensorInputError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorKind {
    Trust,
    Value,
}

impl TensorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TensorKind::Trust => "t3",
            TensorKind::Value => "v3",
        }
    }
}

/// Canonical root dimensions. The first three belong to T3, the last three to V3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Root {
    Talent,
    Training,
    Temperament,
    Valuation,
    Veracity,
    Validity,
}

pub const T3_ROOTS: [Root; 3] = [Root::Talent, Root::Training, Root::Temperament];
pub const V3_ROOTS: [Root; 3] = [Root::Valuation, Root::Veracity, Root::Validity];

impl Root {
    pub fn kind(self) -> TensorKind {
        match self {
            Root::Talent | Root::Training | Root::Temperament => TensorKind::Trust,
            Root::Valuation | Root::Veracity | Root::Validity => TensorKind::Value,
        }
    }

    fn slot(self) -> usize {
        match self {
            Root::Talent | Root::Valuation => 0,
            Root::Training | Root::Veracity => 1,
            Root::Temperament | Root::Validity => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Root::Talent => "talent",
            Root::Training => "training",
            Root::Temperament => "temperament",
            Root::Valuation => "valuation",
            Root::Veracity => "veracity",
            Root::Validity => "validity",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Root(Root),
    Sub { kind: TensorKind, name: String },
}

impl Dimension {
    pub fn sub(kind: TensorKind, name: impl Into<String>) -> Self {
        Dimension::Sub {
            kind,
            name: name.into(),
        }
    }

    pub fn kind(&self) -> TensorKind {
        match self {
            Dimension::Root(r) => r.kind(),
            Dimension::Sub { kind, .. } => *kind,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Root(r) => f.write_str(r.as_str()),
            Dimension::Sub { kind, name } => write!(f, "{}.{}", kind.as_str(), name),
        }
    }
}

impl From<Root> for Dimension {
    fn from(r: Root) -> Self {
        Dimension::Root(r)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DimensionState {
    pub value: f64,
    pub count: u64,
    pub confidence: f64,
    pub last_update: u64,
}

impl DimensionState {
    fn new(value: f64) -> Self {
        Self {
            value,
            count: 0,
            confidence: 0.0,
            last_update: 0,
        }
    }

    fn observe(&mut self, score: f64, weight: f64, now: u64, ema: EmaConfig, n_max: u64) {
        let alpha = learning_rate(ema, self.count) * weight;
        self.value = (self.value + alpha * (score - self.value)).clamp(0.0, 1.0);
        self.count = self.count.saturating_add(1);
        self.confidence = confidence(self.count, n_max);
        self.last_update = self.last_update.max(now);
    }

    fn shift(&mut self, delta: f64, now: u64, n_max: u64) {
        self.value = (self.value + delta).clamp(0.0, 1.0);
        self.count = self.count.saturating_add(1);
        self.confidence = confidence(self.count, n_max);
        self.last_update = self.last_update.max(now);
    }

    fn decay_toward(&mut self, floor: f64, rate_per_day: f64, elapsed_days: f64) {
        let factor = (-rate_per_day * elapsed_days).exp();
        self.value = floor + (self.value - floor) * factor;
    }
}

/// alpha(n) = alpha0 / (1 + n / k)
pub fn learning_rate(ema: EmaConfig, n: u64) -> f64 {
    ema.alpha0 / (1.0 + n as f64 / ema.k)
}

/// w = ln(1 + n) / ln(1 + n_max), capped at 1.
pub fn confidence(n: u64, n_max: u64) -> f64 {
    let denom = (n_max.max(1) as f64).ln_1p();
    ((n as f64).ln_1p() / denom).min(1.0)
}

/// exp(sum w_i ln(max(eps, x_i)) / sum w_i). An exact zero with positive weight returns 0.
pub fn weighted_geometric_mean(values: &[f64], weights: &[f64], epsilon: f64) -> f64 {
    let mut num = 0.0;
    let mut den = 0.0;
    for (x, w) in values.iter().zip(weights.iter()) {
        if *w <= 0.0 {
            continue;
        }
        if *x <= 0.0 {
            return 0.0;
        }
        num += w * x.max(epsilon).ln();
        den += w;
    }
    if den <= 0.0 {
        return 0.0;
    }
    (num / den).exp()
}

/// sum w_i x_i / sum w_i
pub fn weighted_arithmetic_mean(values: &[f64], weights: &[f64]) -> f64 {
    let mut num = 0.0;
    let mut den = 0.0;
    for (x, w) in values.iter().zip(weights.iter()) {
        if *w <= 0.0 {
            continue;
        }
        num += w * x;
        den += w;
    }
    if den <= 0.0 {
        return 0.0;
    }
    num / den
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub kind: TensorKind,
    pub roots: [DimensionState; 3],
    #[serde(default)]
    pub subs: BTreeMap<String, DimensionState>,
}

impl Tensor {
    pub fn new(kind: TensorKind, initial: f64) -> Self {
        Self {
            kind,
            roots: [DimensionState::new(initial); 3],
            subs: BTreeMap::new(),
        }
    }

    pub fn root(&self, root: Root) -> Option<&DimensionState> {
        if root.kind() != self.kind {
            return None;
        }
        Some(&self.roots[root.slot()])
    }

    pub fn dimension(&self, dim: &Dimension) -> Option<&DimensionState> {
        match dim {
            Dimension::Root(r) => self.root(*r),
            Dimension::Sub { kind, name } if *kind == self.kind => self.subs.get(name),
            Dimension::Sub { .. } => None,
        }
    }

    fn dimension_mut(&mut self, dim: &Dimension, initial: f64) -> Result<&mut DimensionState, TensorInputError> {
        if dim.kind() != self.kind {
            return Err(TensorInputError::WrongTensor {
                dimension: dim.to_string(),
                tensor: self.kind.as_str(),
            });
        }
        Ok(match dim {
            Dimension::Root(r) => &mut self.roots[r.slot()],
            Dimension::Sub { name, .. } => self
                .subs
                .entry(name.clone())
                .or_insert_with(|| DimensionState::new(initial)),
        })
    }

    pub fn root_values(&self) -> [f64; 3] {
        [self.roots[0].value, self.roots[1].value, self.roots[2].value]
    }

    /// Geometric mean for T3, arithmetic mean for V3, over root dimensions only.
    pub fn aggregate(&self, weights: &[f64; 3], epsilon: f64) -> f64 {
        let values = self.root_values();
        match self.kind {
            TensorKind::Trust => weighted_geometric_mean(&values, weights, epsilon),
            TensorKind::Value => weighted_arithmetic_mean(&values, weights),
        }
    }

    fn decay(&mut self, floor: f64, rate_per_day: f64, elapsed_days: f64) {
        for d in self.roots.iter_mut() {
            d.decay_toward(floor, rate_per_day, elapsed_days);
        }
        for d in self.subs.values_mut() {
            d.decay_toward(floor, rate_per_day, elapsed_days);
        }
    }
}

/// (entity, role/context). `scope: None` is the entity's global tensor.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorKey {
    pub entity: EntityId,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TensorKey {
    pub fn entity(entity: impl Into<EntityId>) -> Self {
        Self {
            entity: entity.into(),
            scope: None,
        }
    }

    pub fn scoped(entity: impl Into<EntityId>, scope: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            scope: Some(scope.into()),
        }
    }
}

impl fmt::Display for TensorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(s) => write!(f, "{}@{}", self.entity, s),
            None => f.write_str(&self.entity),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct EntityTensors {
    t3: Tensor,
    v3: Tensor,
}

impl EntityTensors {
    fn new(initial: f64) -> Self {
        Self {
            t3: Tensor::new(TensorKind::Trust, initial),
            v3: Tensor::new(TensorKind::Value, initial),
        }
    }

    fn for_kind_mut(&mut self, kind: TensorKind) -> &mut Tensor {
        match kind {
            TensorKind::Trust => &mut self.t3,
            TensorKind::Value => &mut self.v3,
        }
    }
}

/// Read-only copy of an entity's tensors with their aggregates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorSnapshot {
    pub key: TensorKey,
    pub t3: Tensor,
    pub v3: Tensor,
    pub t3_score: f64,
    pub v3_score: f64,
}

/// Inputs that move tensors. Acks are the only source of witness/author updates.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorEvent {
    AckAccepted {
        author: EntityId,
        witness: EntityId,
        credited: Root,
        trust_delta: f64,
        at: u64,
    },
    AckInvalidated {
        witness: EntityId,
        credited: Root,
        trust_delta: f64,
        at: u64,
    },
    Outcome {
        key: TensorKey,
        dimension: Dimension,
        score: f64,
        weight: f64,
        at: u64,
    },
}

pub struct TensorEngine {
    cfg: TensorConfig,
    tensors: DashMap<TensorKey, EntityTensors>,
}

impl TensorEngine {
    pub fn new(cfg: TensorConfig) -> Self {
        Self {
            cfg,
            tensors: DashMap::new(),
        }
    }

    pub fn config(&self) -> &TensorConfig {
        &self.cfg
    }

    fn ema(&self, kind: TensorKind) -> EmaConfig {
        match kind {
            TensorKind::Trust => self.cfg.trust,
            TensorKind::Value => self.cfg.value,
        }
    }

    fn snapshot_of(&self, key: &TensorKey, t: &EntityTensors) -> TensorSnapshot {
        TensorSnapshot {
            key: key.clone(),
            t3_score: t.t3.aggregate(&self.cfg.trust_weights, self.cfg.epsilon),
            v3_score: t.v3.aggregate(&self.cfg.value_weights, self.cfg.epsilon),
            t3: t.t3.clone(),
            v3: t.v3.clone(),
        }
    }

    /// Record one scored observation. Finite scores are clamped to [0,1];
    /// non-finite scores and weights outside (0,1] are rejected.
    pub fn observe(
        &self,
        key: &TensorKey,
        dimension: &Dimension,
        score: f64,
        weight: f64,
        now: u64,
    ) -> Result<TensorSnapshot, TensorInputError> {
        if !score.is_finite() {
            return Err(TensorInputError::NonFiniteScore(score));
        }
        if !weight.is_finite() || weight <= 0.0 || weight > 1.0 {
            return Err(TensorInputError::InvalidWeight(weight));
        }
        let score = score.clamp(0.0, 1.0);
        let kind = dimension.kind();
        let ema = self.ema(kind);
        let initial = self.cfg.initial;
        let n_max = self.cfg.n_max;

        let mut slot = self
            .tensors
            .entry(key.clone())
            .or_insert_with(|| EntityTensors::new(initial));
        slot.for_kind_mut(kind)
            .dimension_mut(dimension, initial)?
            .observe(score, weight, now, ema, n_max);
        Ok(self.snapshot_of(key, &slot))
    }

    /// Additive trust/value delta (witness rewards and penalties), clamped to [0,1].
    pub fn apply_delta(
        &self,
        key: &TensorKey,
        dimension: &Dimension,
        delta: f64,
        now: u64,
    ) -> Result<TensorSnapshot, TensorInputError> {
        if !delta.is_finite() {
            return Err(TensorInputError::NonFiniteScore(delta));
        }
        let kind = dimension.kind();
        let initial = self.cfg.initial;
        let n_max = self.cfg.n_max;
        let mut slot = self
            .tensors
            .entry(key.clone())
            .or_insert_with(|| EntityTensors::new(initial));
        slot.for_kind_mut(kind)
            .dimension_mut(dimension, initial)?
            .shift(delta, now, n_max);
        Ok(self.snapshot_of(key, &slot))
    }

    /// (t3_score, v3_score). Unknown entities read as all-default without being stored.
    pub fn aggregate(&self, key: &TensorKey) -> (f64, f64) {
        let s = self.snapshot(key);
        (s.t3_score, s.v3_score)
    }

    /// Global (unscoped) trust aggregate.
    pub fn trust_score(&self, entity: &str) -> f64 {
        self.aggregate(&TensorKey::entity(entity)).0
    }

    pub fn value_score(&self, entity: &str) -> f64 {
        self.aggregate(&TensorKey::entity(entity)).1
    }

    pub fn snapshot(&self, key: &TensorKey) -> TensorSnapshot {
        match self.tensors.get(key) {
            Some(t) => self.snapshot_of(key, &t),
            None => self.snapshot_of(key, &EntityTensors::new(self.cfg.initial)),
        }
    }

    pub fn contains(&self, key: &TensorKey) -> bool {
        self.tensors.contains_key(key)
    }

    /// Move every dimension toward the floor for `elapsed_ms` without observation.
    pub fn decay(&self, key: &TensorKey, elapsed_ms: u64) -> TensorSnapshot {
        let initial = self.cfg.initial;
        let floor = self.cfg.floor;
        let rate = self.cfg.decay_rate_per_day;
        let days = ms_to_days(elapsed_ms);
        let mut slot = self
            .tensors
            .entry(key.clone())
            .or_insert_with(|| EntityTensors::new(initial));
        slot.t3.decay(floor, rate, days);
        slot.v3.decay(floor, rate, days);
        self.snapshot_of(key, &slot)
    }

    /// Fold a remote view `b` into the local view `a`. The remote side moves each
    /// dimension by at most `wb / (wa + wb)`, scaled down by its own confidence.
    /// Counts, confidence and timestamps stay local; remote sub-dimensions this
    /// node does not track are ignored.
    pub fn merge(a: &Tensor, b: &Tensor, weights: (f64, f64)) -> Result<Tensor, TensorInputError> {
        let (wa, wb) = weights;
        if !wa.is_finite() || !wb.is_finite() || wa < 0.0 || wb < 0.0 || wa + wb <= 0.0 {
            return Err(TensorInputError::InvalidMergeWeights);
        }
        if a.kind != b.kind {
            return Err(TensorInputError::WrongTensor {
                dimension: "*".into(),
                tensor: a.kind.as_str(),
            });
        }
        check_remote(b)?;
        let share = wb / (wa + wb);
        let mut out = a.clone();
        for i in 0..3 {
            out.roots[i] = absorb(&a.roots[i], &b.roots[i], share);
        }
        for (name, ad) in out.subs.iter_mut() {
            if let Some(bd) = b.subs.get(name) {
                *ad = absorb(ad, bd, share);
            }
        }
        Ok(out)
    }

    /// Fold a peer's snapshot into the local one for the same key. `peer_weight`
    /// caps the peer's share of every dimension.
    pub fn merge_snapshot(&self, remote: &TensorSnapshot, peer_weight: f64) -> Result<TensorSnapshot, TensorInputError> {
        if !peer_weight.is_finite() || !(0.0..=1.0).contains(&peer_weight) {
            return Err(TensorInputError::InvalidMergeWeights);
        }
        if remote.t3.kind != TensorKind::Trust || remote.v3.kind != TensorKind::Value {
            return Err(TensorInputError::WrongTensor {
                dimension: "*".into(),
                tensor: remote.t3.kind.as_str(),
            });
        }
        check_remote(&remote.t3)?;
        check_remote(&remote.v3)?;
        let weights = (1.0 - peer_weight, peer_weight);
        let initial = self.cfg.initial;
        let mut slot = self
            .tensors
            .entry(remote.key.clone())
            .or_insert_with(|| EntityTensors::new(initial));
        let t3 = Self::merge(&slot.t3, &remote.t3, weights)?;
        let v3 = Self::merge(&slot.v3, &remote.v3, weights)?;
        slot.t3 = t3;
        slot.v3 = v3;
        Ok(self.snapshot_of(&remote.key, &slot))
    }

    pub fn restore(&self, snapshots: Vec<TensorSnapshot>) {
        for s in snapshots {
            self.tensors.insert(s.key, EntityTensors { t3: s.t3, v3: s.v3 });
        }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// Remote values and confidences must lie in [0, 1].
fn check_remote(t: &Tensor) -> Result<(), TensorInputError> {
    let roots = match t.kind {
        TensorKind::Trust => T3_ROOTS,
        TensorKind::Value => V3_ROOTS,
    };
    let named = roots
        .iter()
        .map(|r| (r.as_str().to_string(), t.roots[r.slot()]))
        .chain(t.subs.iter().map(|(n, d)| (format!("{}.{}", t.kind.as_str(), n), *d)));
    for (dimension, d) in named {
        for value in [d.value, d.confidence] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(TensorInputError::OutOfRange { dimension, value });
            }
        }
    }
    Ok(())
}

fn absorb(local: &DimensionState, remote: &DimensionState, share: f64) -> DimensionState {
    let step = share * remote.confidence;
    DimensionState {
        value: (local.value + step * (remote.value - local.value)).clamp(0.0, 1.0),
        ..*local
    }
}
