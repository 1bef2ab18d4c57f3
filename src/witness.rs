// Witness protocol: mark/ack handshake, witness selection, ack verification
// and the per-entry ack book.
//
// Marks are created and signed by an entry's author; acks are signed by the
// witness over (mark_id, entry_hash, witness_id, timestamp, type, validation).
// Eligibility is judged against the witness's trust at witnessing time, taken
// from a time-indexed history, so later trust changes never disqualify an ack
// retroactively.

use crate::config::{QuorumConfig, WitnessConfig};
use crate::entry::{
    EntityId, Entry, EntryRef, Hash, PublicKey, Signature, put_bytes, sha256, sig_hex, short_hex,
};
use crate::error::WitnessError;
use crate::tensor::{Root, TensorEngine, TensorEvent};
use crate::validation::{KeyRegistry, SignatureVerifier, Signer};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WitnessType {
    Time,
    Audit,
    Oracle,
    Existence,
    Action,
    State,
    Quality,
}

/// Validation rules a witness type is held to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WitnessRule {
    /// T3 root credited to the witness when its ack is accepted.
    pub credited: Root,
    pub requires_hash_verified: bool,
    pub requires_policy_compliant: bool,
    /// Witness timestamp must fall within `max_time_skew_ms` of the entry.
    pub bounded_skew: bool,
    /// Earns the quality delta instead of the standard ack delta.
    pub quality_bonus: bool,
}

impl WitnessType {
    pub const ALL: [WitnessType; 7] = [
        WitnessType::Time,
        WitnessType::Audit,
        WitnessType::Oracle,
        WitnessType::Existence,
        WitnessType::Action,
        WitnessType::State,
        WitnessType::Quality,
    ];

    pub fn rule(self) -> WitnessRule {
        use WitnessType::*;
        let (credited, hash, policy, skew, quality) = match self {
            Time => (Root::Temperament, false, false, true, false),
            Audit => (Root::Training, true, true, false, false),
            Oracle => (Root::Talent, true, false, false, false),
            Existence => (Root::Temperament, true, false, false, false),
            Action => (Root::Talent, true, false, false, false),
            State => (Root::Training, true, false, false, false),
            Quality => (Root::Talent, true, true, false, true),
        };
        WitnessRule {
            credited,
            requires_hash_verified: hash,
            requires_policy_compliant: policy,
            bounded_skew: skew,
            quality_bonus: quality,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WitnessType::Time => "time",
            WitnessType::Audit => "audit",
            WitnessType::Oracle => "oracle",
            WitnessType::Existence => "existence",
            WitnessType::Action => "action",
            WitnessType::State => "state",
            WitnessType::Quality => "quality",
        }
    }

    fn tag(self) -> u8 {
        self as u8
    }

    pub fn trust_delta(self, cfg: &WitnessConfig) -> f64 {
        if self.rule().quality_bonus {
            cfg.quality_delta
        } else {
            cfg.ack_delta
        }
    }
}

/// Author's signed request for a witness to observe one entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WitnessMark {
    pub mark_id: Hash,
    pub entry: EntryRef,
    pub content_hash: Hash,
    pub entry_hash: Hash,
    pub entry_timestamp: u64,
    pub timestamp: u64,
    pub summary: String,
    pub author_id: EntityId,
    #[serde(with = "sig_hex")]
    pub author_signature: Signature,
}

impl WitnessMark {
    fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.summary.len());
        out.extend_from_slice(b"TLMARK1");
        out.push(self.entry.tier.tag());
        out.extend_from_slice(&self.entry.entry_id.to_le_bytes());
        out.extend_from_slice(&self.content_hash);
        out.extend_from_slice(&self.entry_hash);
        out.extend_from_slice(&self.entry_timestamp.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        put_bytes(&mut out, self.summary.as_bytes());
        put_bytes(&mut out, self.author_id.as_bytes());
        out
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckValidation {
    pub hash_verified: bool,
    pub policy_compliant: bool,
}

impl AckValidation {
    /// Witness-side check of a mark against the entry it was shown.
    pub fn observe(mark: &WitnessMark, entry: &Entry, policy_compliant: bool) -> Self {
        Self {
            hash_verified: entry.content_hash_valid()
                && entry.content_hash == mark.content_hash
                && entry.compute_entry_hash() == mark.entry_hash,
            policy_compliant,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WitnessAck {
    pub mark_id: Hash,
    pub entry: EntryRef,
    pub entry_hash: Hash,
    pub witness_id: EntityId,
    pub witness_type: WitnessType,
    pub validation: AckValidation,
    pub trust_delta: f64,
    pub witness_timestamp: u64,
    #[serde(with = "sig_hex")]
    pub ack_signature: Signature,
}

impl WitnessAck {
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96 + self.witness_id.len());
        out.extend_from_slice(b"TLACK1");
        out.extend_from_slice(&self.mark_id);
        out.extend_from_slice(&self.entry_hash);
        put_bytes(&mut out, self.witness_id.as_bytes());
        out.extend_from_slice(&self.witness_timestamp.to_le_bytes());
        out.push(self.witness_type.tag());
        out.push(self.validation.hash_verified as u8);
        out.push(self.validation.policy_compliant as u8);
        out.extend_from_slice(&self.trust_delta.to_bits().to_le_bytes());
        out
    }
}

/// Acks per entry. One mutex-guarded list per entry via the map shard.
#[derive(Debug, Default)]
pub struct AckBook {
    acks: DashMap<EntryRef, Vec<WitnessAck>>,
}

impl AckBook {
    /// Insert an ack; returns the entry's ack count afterwards.
    pub fn insert(&self, ack: WitnessAck) -> Result<usize, WitnessError> {
        let mut list = self.acks.entry(ack.entry).or_default();
        if list.iter().any(|a| a.witness_id == ack.witness_id) {
            return Err(WitnessError::DuplicateAck {
                witness_id: ack.witness_id,
                entry: ack.entry,
            });
        }
        list.push(ack);
        Ok(list.len())
    }

    pub fn count(&self, entry: &EntryRef) -> usize {
        self.acks.get(entry).map(|l| l.len()).unwrap_or(0)
    }

    pub fn acks(&self, entry: &EntryRef) -> Vec<WitnessAck> {
        self.acks.get(entry).map(|l| l.clone()).unwrap_or_default()
    }

    pub fn witnesses(&self, entry: &EntryRef) -> Vec<EntityId> {
        self.acks
            .get(entry)
            .map(|l| l.iter().map(|a| a.witness_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn remove(&self, entry: &EntryRef, witness_id: &str) -> Option<WitnessAck> {
        let mut list = self.acks.get_mut(entry)?;
        let idx = list.iter().position(|a| a.witness_id == witness_id)?;
        Some(list.remove(idx))
    }

    pub fn clear(&self, entry: &EntryRef) {
        self.acks.remove(entry);
    }

    pub fn retain(&self, keep: impl Fn(&EntryRef) -> bool) {
        self.acks.retain(|r, _| keep(r));
    }

    pub fn len(&self) -> usize {
        self.acks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acks.is_empty()
    }

    pub fn check_quorum(&self, entry: &EntryRef, kind: &str, quorum: &QuorumConfig) -> Result<usize, WitnessError> {
        let have = self.count(entry);
        let required = quorum.required(kind);
        if have < required {
            return Err(WitnessError::QuorumNotMet {
                entry: *entry,
                kind: kind.to_string(),
                have,
                required,
            });
        }
        Ok(have)
    }
}

/// Hard cap on a witness's eligibility history, whatever the window.
pub const MAX_TRUST_POINTS: usize = 4_096;

#[derive(Clone, Debug, Default)]
struct WitnessProfile {
    contexts: BTreeSet<String>,
    last_active: u64,
    /// (at, t3 aggregate), sorted by time.
    trust_history: Vec<(u64, f64)>,
    /// (author, at) of recent witnessings.
    recent: VecDeque<(EntityId, u64)>,
}

impl WitnessProfile {
    fn trust_at(&self, at: u64) -> Option<f64> {
        let idx = self.trust_history.partition_point(|(t, _)| *t <= at);
        if idx == 0 {
            None
        } else {
            Some(self.trust_history[idx - 1].1)
        }
    }

    /// Insert a point, then forget what falls outside `window_ms` of the newest
    /// one. The last point before the window start survives so lookups at the
    /// window edge still resolve.
    fn record_trust(&mut self, at: u64, trust: f64, window_ms: u64) {
        if !trust.is_finite() {
            return;
        }
        let idx = self.trust_history.partition_point(|(t, _)| *t <= at);
        if idx > 0 && self.trust_history[idx - 1].0 == at {
            self.trust_history[idx - 1].1 = trust;
        } else {
            self.trust_history.insert(idx, (at, trust));
        }
        let newest = self.trust_history.last().map(|(t, _)| *t).unwrap_or(at);
        let cutoff = newest.saturating_sub(window_ms);
        let stale = self
            .trust_history
            .partition_point(|(t, _)| *t < cutoff)
            .saturating_sub(1);
        self.trust_history.drain(..stale);
        if self.trust_history.len() > MAX_TRUST_POINTS {
            let excess = self.trust_history.len() - MAX_TRUST_POINTS;
            self.trust_history.drain(..excess);
        }
    }

    fn recent_for(&self, author: &str, since: u64) -> usize {
        self.recent
            .iter()
            .filter(|(a, at)| a == author && *at >= since)
            .count()
    }
}

/// Jaccard overlap between a witness's contexts and an entry's tags.
/// An untagged entry carries no context restriction.
pub fn relevance(contexts: &BTreeSet<String>, tags: &[String]) -> f64 {
    if tags.is_empty() {
        return 1.0;
    }
    let tags: BTreeSet<&String> = tags.iter().collect();
    let inter = contexts.iter().filter(|c| tags.contains(c)).count();
    let union = contexts.len() + tags.len() - inter;
    if union == 0 {
        return 0.0;
    }
    inter as f64 / union as f64
}

/// Accepted ack plus the tensor event it produces.
#[derive(Clone, Debug, PartialEq)]
pub struct AckReceipt {
    pub ack_count: usize,
    pub event: TensorEvent,
}

pub struct WitnessProtocol {
    cfg: WitnessConfig,
    keys: Arc<KeyRegistry>,
    verifier: Arc<dyn SignatureVerifier>,
    tensors: Arc<TensorEngine>,
    profiles: DashMap<EntityId, WitnessProfile>,
    marks: DashMap<Hash, WitnessMark>,
    book: AckBook,
}

impl WitnessProtocol {
    pub fn new(
        cfg: WitnessConfig,
        keys: Arc<KeyRegistry>,
        verifier: Arc<dyn SignatureVerifier>,
        tensors: Arc<TensorEngine>,
    ) -> Self {
        Self {
            cfg,
            keys,
            verifier,
            tensors,
            profiles: DashMap::new(),
            marks: DashMap::new(),
            book: AckBook::default(),
        }
    }

    pub fn config(&self) -> &WitnessConfig {
        &self.cfg
    }

    pub fn book(&self) -> &AckBook {
        &self.book
    }

    /// Make `id` a selectable witness. Its current trust opens the eligibility history.
    pub fn register_witness<I, S>(&self, id: impl Into<EntityId>, key: PublicKey, contexts: I, now: u64)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        self.keys.register(id.clone(), key);
        let trust = self.tensors.trust_score(&id);
        let mut p = self.profiles.entry(id).or_default();
        p.contexts = contexts.into_iter().map(Into::into).collect();
        p.last_active = p.last_active.max(now);
        p.record_trust(now, trust, self.cfg.trust_history_window_ms);
    }

    pub fn is_witness(&self, id: &str) -> bool {
        self.profiles.contains_key(id)
    }

    pub fn touch(&self, id: &str, now: u64) {
        if let Some(mut p) = self.profiles.get_mut(id) {
            p.last_active = p.last_active.max(now);
        }
    }

    /// Append a trust observation to the witness's eligibility history.
    pub fn record_trust(&self, id: &str, at: u64, trust: f64) {
        if let Some(mut p) = self.profiles.get_mut(id) {
            p.record_trust(at, trust, self.cfg.trust_history_window_ms);
        }
    }

    pub fn trust_at(&self, id: &str, at: u64) -> Option<f64> {
        self.profiles.get(id).and_then(|p| p.trust_at(at))
    }

    pub fn trust_history_len(&self, id: &str) -> usize {
        self.profiles.get(id).map(|p| p.trust_history.len()).unwrap_or(0)
    }

    pub fn mark_count(&self) -> usize {
        self.marks.len()
    }

    /// Drop marks and acks for entries `keep` rejects. Called after pruning.
    pub fn retain_entries(&self, keep: impl Fn(&EntryRef) -> bool) -> usize {
        let before = self.marks.len();
        self.marks.retain(|_, m| keep(&m.entry));
        self.book.retain(&keep);
        before - self.marks.len()
    }

    pub fn create_mark(&self, entry: &Entry, signer: &dyn Signer, now: u64) -> WitnessMark {
        let mut mark = WitnessMark {
            mark_id: [0u8; 32],
            entry: entry.entry_ref(),
            content_hash: entry.content_hash,
            entry_hash: entry.entry_hash,
            entry_timestamp: entry.timestamp,
            timestamp: now,
            summary: entry.content.summary(),
            author_id: entry.author_id.clone(),
            author_signature: [0u8; 64],
        };
        let body = mark.signed_bytes();
        mark.mark_id = sha256(&body);
        mark.author_signature = signer.sign(&body);
        self.marks.insert(mark.mark_id, mark.clone());
        mark
    }

    pub fn mark(&self, mark_id: &Hash) -> Option<WitnessMark> {
        self.marks.get(mark_id).map(|m| m.clone())
    }

    /// Up to `count` eligible witnesses, least-recently-paired with this author first.
    pub fn select_witnesses(&self, entry: &Entry, count: usize, now: u64) -> Vec<EntityId> {
        let since = now.saturating_sub(self.cfg.diversity_window_ms);
        let mut ranked: Vec<(usize, f64, f64, EntityId)> = Vec::new();
        for p in self.profiles.iter() {
            let id = p.key();
            if *id == entry.author_id {
                continue;
            }
            if now.saturating_sub(p.last_active) > self.cfg.recency_window_ms {
                continue;
            }
            let trust = self.tensors.trust_score(id);
            if trust.is_nan() || trust < self.cfg.min_trust {
                continue;
            }
            let rel = relevance(&p.contexts, &entry.content.tags);
            if rel < self.cfg.min_relevance {
                continue;
            }
            let paired = p.recent_for(&entry.author_id, since);
            ranked.push((paired, trust, rel, id.clone()));
        }
        ranked.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then(b.1.total_cmp(&a.1))
                .then(b.2.total_cmp(&a.2))
                .then(a.3.cmp(&b.3))
        });
        ranked.into_iter().take(count).map(|r| r.3).collect()
    }

    /// Witness side: check the author's mark signature and sign an ack.
    pub fn acknowledge(
        &self,
        mark: &WitnessMark,
        witness_id: &str,
        witness_type: WitnessType,
        validation: AckValidation,
        signer: &dyn Signer,
        now: u64,
    ) -> Result<WitnessAck, WitnessError> {
        let Some(author_key) = self.keys.get(&mark.author_id) else {
            return Err(WitnessError::UnknownAuthor {
                author_id: mark.author_id.clone(),
                entry: mark.entry,
            });
        };
        if !self
            .verifier
            .verify(&author_key, &mark.signed_bytes(), &mark.author_signature)
            || sha256(&mark.signed_bytes()) != mark.mark_id
        {
            return Err(WitnessError::MarkMismatch { entry: mark.entry });
        }
        if now <= mark.entry_timestamp {
            return Err(WitnessError::StaleTimestamp {
                witness_id: witness_id.to_string(),
                entry: mark.entry,
                witness_timestamp: now,
                entry_timestamp: mark.entry_timestamp,
            });
        }
        let mut ack = WitnessAck {
            mark_id: mark.mark_id,
            entry: mark.entry,
            entry_hash: mark.entry_hash,
            witness_id: witness_id.to_string(),
            witness_type,
            validation,
            trust_delta: witness_type.trust_delta(&self.cfg),
            witness_timestamp: now,
            ack_signature: [0u8; 64],
        };
        ack.ack_signature = signer.sign(&ack.signed_bytes());
        Ok(ack)
    }

    pub fn verify_ack(&self, ack: &WitnessAck, entry: &Entry) -> bool {
        self.check_ack(ack, entry).is_ok()
    }

    /// Signature, ordering, rule table and eligibility at witnessing time.
    pub fn check_ack(&self, ack: &WitnessAck, entry: &Entry) -> Result<(), WitnessError> {
        let at = entry.entry_ref();
        let mark_ok = self
            .marks
            .get(&ack.mark_id)
            .map(|m| m.entry == at && m.entry_hash == entry.entry_hash)
            .unwrap_or(false);
        if ack.entry != at || ack.entry_hash != entry.entry_hash || !mark_ok {
            return Err(WitnessError::MarkMismatch { entry: at });
        }
        let Some(key) = self.keys.get(&ack.witness_id) else {
            return Err(WitnessError::UnknownWitness {
                witness_id: ack.witness_id.clone(),
            });
        };
        if !self.verifier.verify(&key, &ack.signed_bytes(), &ack.ack_signature) {
            return Err(WitnessError::InvalidSignature {
                witness_id: ack.witness_id.clone(),
                entry: at,
            });
        }
        if ack.witness_timestamp <= entry.timestamp {
            return Err(WitnessError::StaleTimestamp {
                witness_id: ack.witness_id.clone(),
                entry: at,
                witness_timestamp: ack.witness_timestamp,
                entry_timestamp: entry.timestamp,
            });
        }
        if ack.witness_id == entry.author_id {
            return Err(WitnessError::Ineligible {
                witness_id: ack.witness_id.clone(),
                entry: at,
                reason: "witness is the entry's author".into(),
            });
        }

        let rule = ack.witness_type.rule();
        let violation = if rule.requires_hash_verified && !ack.validation.hash_verified {
            Some("hash_verified")
        } else if rule.requires_policy_compliant && !ack.validation.policy_compliant {
            Some("policy_compliant")
        } else if rule.bounded_skew
            && ack.witness_timestamp - entry.timestamp > self.cfg.max_time_skew_ms
        {
            Some("time_skew")
        } else if ack.trust_delta != ack.witness_type.trust_delta(&self.cfg) {
            Some("trust_delta")
        } else {
            None
        };
        if let Some(rule) = violation {
            return Err(WitnessError::RuleViolation {
                witness_id: ack.witness_id.clone(),
                entry: at,
                rule,
            });
        }

        match self.trust_at(&ack.witness_id, ack.witness_timestamp) {
            Some(t) if t >= self.cfg.min_trust => Ok(()),
            Some(t) => Err(WitnessError::Ineligible {
                witness_id: ack.witness_id.clone(),
                entry: at,
                reason: format!("trust {:.3} below {:.3} at witnessing time", t, self.cfg.min_trust),
            }),
            None => Err(WitnessError::Ineligible {
                witness_id: ack.witness_id.clone(),
                entry: at,
                reason: "no trust record at witnessing time".into(),
            }),
        }
    }

    /// Verify and record an ack. Rejections are logged and returned; the caller
    /// may request another witness.
    pub fn record_ack(&self, ack: WitnessAck, entry: &Entry) -> Result<AckReceipt, WitnessError> {
        if let Err(e) = self.check_ack(&ack, entry) {
            warn!(entry = %entry.entry_ref(), witness = %ack.witness_id, error = %e, "ack rejected");
            return Err(e);
        }
        let witness = ack.witness_id.clone();
        let at = ack.witness_timestamp;
        let event = TensorEvent::AckAccepted {
            author: entry.author_id.clone(),
            witness: witness.clone(),
            credited: ack.witness_type.rule().credited,
            trust_delta: ack.trust_delta,
            at,
        };
        let ack_count = self.book.insert(ack)?;
        if let Some(mut p) = self.profiles.get_mut(&witness) {
            p.last_active = p.last_active.max(at);
            p.recent.push_back((entry.author_id.clone(), at));
            let since = at.saturating_sub(self.cfg.diversity_window_ms);
            while p.recent.front().map(|(_, t)| *t < since).unwrap_or(false) {
                p.recent.pop_front();
            }
        }
        debug!(
            entry = %entry.entry_ref(),
            witness = %witness,
            hash = %short_hex(&entry.entry_hash),
            acks = ack_count,
            "ack accepted"
        );
        Ok(AckReceipt { ack_count, event })
    }

    /// Withdraw a later-proven-invalid ack. Promotions already made stand.
    pub fn invalidate(&self, entry: &EntryRef, witness_id: &str, at: u64) -> Result<TensorEvent, WitnessError> {
        let Some(ack) = self.book.remove(entry, witness_id) else {
            return Err(WitnessError::Ineligible {
                witness_id: witness_id.to_string(),
                entry: *entry,
                reason: "no recorded ack to invalidate".into(),
            });
        };
        warn!(entry = %entry, witness = %witness_id, "ack invalidated");
        Ok(TensorEvent::AckInvalidated {
            witness: witness_id.to_string(),
            credited: ack.witness_type.rule().credited,
            trust_delta: self.cfg.invalid_delta,
            at,
        })
    }

    pub fn check_quorum(&self, entry: &Entry, quorum: &QuorumConfig) -> Result<usize, WitnessError> {
        self.book
            .check_quorum(&entry.entry_ref(), &entry.content.kind, quorum)
    }
}
