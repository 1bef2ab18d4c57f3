// Retention scoring (SNARC) and tier pruning.
// Local, non-consensus: scores never touch chain validity, only what a node keeps.

use crate::clock::{Clock, ms_to_days};
use crate::config::{QuorumConfig, SnarcConfig};
use crate::entry::{Entry, EntryRef, Hash, Tier, put_bytes, sha256};
use crate::error::StorageError;
use crate::ledger::ChainStore;
use crate::tensor::TensorEngine;
use crate::witness::WitnessProtocol;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::info;

/// Which of the five signals fired for an entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnarcSignals {
    pub significant: bool,
    pub novel: bool,
    pub anomalous: bool,
    pub relevant: bool,
    pub consequential: bool,
}

impl SnarcSignals {
    pub fn score(&self, cfg: &SnarcConfig) -> u32 {
        let mut s = 0;
        if self.significant {
            s += cfg.significant_weight;
        }
        if self.novel {
            s += cfg.novel_weight;
        }
        if self.anomalous {
            s += cfg.anomalous_weight;
        }
        if self.relevant {
            s += cfg.relevant_weight;
        }
        if self.consequential {
            s += cfg.consequential_weight;
        }
        s
    }
}

/// Pattern identity: entry type plus its context tags.
pub fn pattern_fingerprint(entry: &Entry) -> Hash {
    let mut out = Vec::new();
    put_bytes(&mut out, entry.content.kind.as_bytes());
    for t in &entry.content.tags {
        put_bytes(&mut out, t.as_bytes());
    }
    sha256(&out)
}

pub struct RetentionEngine {
    cfg: SnarcConfig,
    quorum: QuorumConfig,
    store: Arc<ChainStore>,
    tensors: Arc<TensorEngine>,
    witnesses: Arc<WitnessProtocol>,
    clock: Arc<dyn Clock>,
    /// fingerprint -> first entry showing it
    patterns: DashMap<Hash, EntryRef>,
    references: DashMap<EntryRef, u32>,
    access: DashMap<EntryRef, u32>,
    context: RwLock<BTreeSet<String>>,
    /// Leaf entries at or before this time belong to a closed session.
    session_closed_at: AtomicU64,
}

impl RetentionEngine {
    pub fn new(
        cfg: SnarcConfig,
        quorum: QuorumConfig,
        store: Arc<ChainStore>,
        tensors: Arc<TensorEngine>,
        witnesses: Arc<WitnessProtocol>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cfg,
            quorum,
            store,
            tensors,
            witnesses,
            clock,
            patterns: DashMap::new(),
            references: DashMap::new(),
            access: DashMap::new(),
            context: RwLock::new(BTreeSet::new()),
            session_closed_at: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SnarcConfig {
        &self.cfg
    }

    /// Register an appended entry: claim its pattern and count its references.
    pub fn note(&self, entry: &Entry) {
        self.patterns
            .entry(pattern_fingerprint(entry))
            .or_insert(entry.entry_ref());
        for r in &entry.source_entries {
            *self.references.entry(*r).or_insert(0) += 1;
        }
    }

    pub fn set_context<I, S>(&self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut ctx) = self.context.write() {
            *ctx = tags.into_iter().map(Into::into).collect();
        }
    }

    pub fn end_session(&self, now: u64) {
        self.session_closed_at.fetch_max(now, Ordering::SeqCst);
    }

    pub fn record_access(&self, r: EntryRef) {
        *self.access.entry(r).or_insert(0) += 1;
    }

    pub fn reference_count(&self, r: &EntryRef) -> u32 {
        self.references.get(r).map(|c| *c).unwrap_or(0)
    }

    pub fn signals(&self, entry: &Entry) -> SnarcSignals {
        let me = entry.entry_ref();
        let novel = match self.patterns.get(&pattern_fingerprint(entry)) {
            Some(first) => *first == me,
            None => true,
        };
        let relevant = match self.context.read() {
            Ok(ctx) => entry.content.tags.iter().any(|t| ctx.contains(t)),
            Err(_) => false,
        };
        SnarcSignals {
            significant: entry.content.impact >= self.cfg.significance_threshold,
            novel,
            anomalous: entry.content.deviation > self.cfg.anomaly_threshold,
            relevant,
            consequential: self.reference_count(&me) > 0,
        }
    }

    pub fn score(&self, entry: &Entry) -> u32 {
        self.signals(entry).score(&self.cfg)
    }

    pub fn should_retain(&self, entry: &Entry) -> bool {
        self.score(entry) >= self.cfg.retain_threshold
    }

    /// Score at or above the promote threshold and the type's witness quorum met.
    pub fn should_promote(&self, entry: &Entry) -> bool {
        if entry.tier == Tier::Root {
            return false;
        }
        self.score(entry) >= self.cfg.promote_threshold
            && self.witnesses.check_quorum(entry, &self.quorum).is_ok()
    }

    /// value * access_bonus * age_decay for a Stem entry at `now`.
    pub fn stem_value(&self, entry: &Entry, now: u64) -> f64 {
        let value = self.tensors.value_score(&entry.author_id);
        let hits = self.access.get(&entry.entry_ref()).map(|c| *c).unwrap_or(0);
        let bonus = (1.0 + hits as f64 * self.cfg.access_bonus_step).min(self.cfg.access_bonus_cap);
        let age_days = ms_to_days(now.saturating_sub(entry.timestamp));
        let age_decay = 1.0 / (1.0 + age_days * self.cfg.age_decay_per_day);
        value * bonus * age_decay
    }

    /// Apply the tier's retention policy; returns how many entries left the tier.
    pub fn prune(&self, tier: Tier) -> Result<usize, StorageError> {
        let now = self.clock.now_ms();
        let expired = self.store.evict_expired(tier, now)?;
        let pruned = match tier {
            Tier::Compost | Tier::Root => Vec::new(),
            Tier::Leaf => {
                let closed = self.session_closed_at.load(Ordering::SeqCst);
                self.store
                    .prune_where(tier, |e| e.timestamp <= closed && !self.should_retain(e))?
            }
            Tier::Stem => self
                .store
                .prune_where(tier, |e| self.stem_value(e, now) < self.cfg.stem_value_threshold)?,
        };
        let released = self.release_dead(tier)?;
        let total = expired + pruned.len();
        if total > 0 {
            info!(tier = %tier, expired, pruned = pruned.len(), released, "prune");
        }
        Ok(total)
    }

    /// Drop bookkeeping held for entries of `tier` that are no longer live.
    /// Ring evictions on append land here too. A pattern whose first holder is
    /// gone passes to its earliest surviving holder in the tier.
    fn release_dead(&self, tier: Tier) -> Result<usize, StorageError> {
        let live_entries = self.store.live_entries(tier)?;
        let live: BTreeSet<u64> = live_entries.iter().map(|e| e.entry_id).collect();
        let alive = |r: &EntryRef| r.tier != tier || live.contains(&r.entry_id);

        let mut orphaned = BTreeSet::new();
        self.patterns.retain(|fp, first| {
            let keep = alive(&*first);
            if !keep {
                orphaned.insert(*fp);
            }
            keep
        });
        for e in &live_entries {
            let fp = pattern_fingerprint(e);
            if orphaned.remove(&fp) {
                self.patterns.entry(fp).or_insert(e.entry_ref());
            }
        }
        self.references.retain(|r, _| alive(r));
        self.access.retain(|r, _| alive(r));
        Ok(self.witnesses.retain_entries(alive))
    }

    /// Current local context tags.
    pub fn context(&self) -> BTreeSet<String> {
        self.context.read().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn tracked_patterns(&self) -> usize {
        self.patterns.len()
    }

    pub fn tracked_references(&self) -> usize {
        self.references.len()
    }
}
