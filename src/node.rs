// LedgerNode: wires the engines together and exposes ingestion, witnessing,
// the read-only query API and periodic maintenance.

use crate::clock::Clock;
use crate::config::LedgerConfig;
use crate::entry::{EntityId, Entry, EntryRef, Hash, NewEntry, PublicKey, Tier};
use crate::error::{LedgerError, StorageError, WitnessError};
use crate::ledger::{ChainStore, VerificationResult};
use crate::merkle::{MerkleProof, MerkleTree, TierDigest};
use crate::promotion::{PromotionBatch, PromotionQueue, PromotionRequest, PromotionWorker, promotion_channel};
use crate::scoring::RetentionEngine;
use crate::storage::{EntryLog, FileLog, PersistedTensors, TensorStore};
use crate::tensor::{Dimension, TensorEngine, TensorEvent, TensorKey, TensorSnapshot};
use crate::validation::{Ed25519Verifier, KeyRegistry, SignatureVerifier, Signer, validate_ingest};
use crate::witness::{AckValidation, WitnessAck, WitnessMark, WitnessProtocol, WitnessType};
use std::collections::BTreeSet;
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, info};

/// Witnesses the node suggests for a freshly retained entry.
#[derive(Clone, Debug, PartialEq)]
pub struct WitnessRequest {
    pub entry: EntryRef,
    pub candidates: Vec<EntityId>,
    pub required: usize,
}

#[derive(Clone, Debug)]
pub struct Submission {
    pub entry: Arc<Entry>,
    pub score: u32,
    pub witness_request: Option<WitnessRequest>,
}

/// Result of offering an ack. Rejections are absorbed: the author asks someone else.
#[derive(Clone, Debug, PartialEq)]
pub enum AckOutcome {
    Accepted { ack_count: usize, promotion_queued: bool },
    Rejected(WitnessError),
}

pub struct LedgerNode {
    id: EntityId,
    cfg: LedgerConfig,
    clock: Arc<dyn Clock>,
    keys: Arc<KeyRegistry>,
    signer: Arc<dyn Signer>,
    store: Arc<ChainStore>,
    tensors: Arc<TensorEngine>,
    witnesses: Arc<WitnessProtocol>,
    retention: Arc<RetentionEngine>,
    promotions: PromotionQueue,
    worker: Mutex<Option<PromotionWorker>>,
    tensor_store: Option<TensorStore>,
}

impl LedgerNode {
    /// Ephemeral node: nothing touches disk.
    pub fn in_memory(
        id: impl Into<EntityId>,
        cfg: LedgerConfig,
        signer: Arc<dyn Signer>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LedgerError> {
        cfg.validate()?;
        let store = Arc::new(ChainStore::in_memory(cfg.tiers.clone(), clock.clone()));
        Ok(Self::assemble(id.into(), cfg, signer, clock, store, None))
    }

    /// Persistent node under `data_dir`: tier logs are replayed and re-verified,
    /// tensors restored from their last snapshot.
    pub fn open<P: AsRef<Path>>(
        id: impl Into<EntityId>,
        cfg: LedgerConfig,
        signer: Arc<dyn Signer>,
        clock: Arc<dyn Clock>,
        data_dir: P,
    ) -> Result<Self, LedgerError> {
        cfg.validate()?;
        let dir = data_dir.as_ref();
        let log: Arc<dyn EntryLog> = Arc::new(FileLog::new(dir.join("tiers"))?);
        let store = Arc::new(ChainStore::open(cfg.tiers.clone(), clock.clone(), log)?);
        let tensor_store = TensorStore::new(dir)?;
        let persisted = tensor_store.load()?;
        let node = Self::assemble(id.into(), cfg, signer, clock, store, Some(tensor_store));
        if let Some(p) = persisted {
            node.tensors.restore(p.snapshots);
        }
        for tier in Tier::ALL {
            for e in node.store.live_entries(tier)? {
                node.retention.note(&e);
            }
        }
        info!(node = %node.id, dir = %dir.display(), "ledger node opened");
        Ok(node)
    }

    fn assemble(
        id: EntityId,
        cfg: LedgerConfig,
        signer: Arc<dyn Signer>,
        clock: Arc<dyn Clock>,
        store: Arc<ChainStore>,
        tensor_store: Option<TensorStore>,
    ) -> Self {
        let keys = Arc::new(KeyRegistry::new());
        keys.register(id.clone(), signer.public_key());
        let verifier: Arc<dyn SignatureVerifier> = Arc::new(Ed25519Verifier);
        let tensors = Arc::new(TensorEngine::new(cfg.tensor.clone()));
        let witnesses = Arc::new(WitnessProtocol::new(
            cfg.witness.clone(),
            keys.clone(),
            verifier,
            tensors.clone(),
        ));
        let retention = Arc::new(RetentionEngine::new(
            cfg.snarc.clone(),
            cfg.quorum.clone(),
            store.clone(),
            tensors.clone(),
            witnesses.clone(),
            clock.clone(),
        ));
        let (promotions, worker) = promotion_channel(store.clone(), signer.clone(), id.clone());
        Self {
            id,
            cfg,
            clock,
            keys,
            signer,
            store,
            tensors,
            witnesses,
            retention,
            promotions,
            worker: Mutex::new(Some(worker)),
            tensor_store,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.cfg
    }

    pub fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn public_key(&self) -> PublicKey {
        self.signer.public_key()
    }

    pub fn store(&self) -> &Arc<ChainStore> {
        &self.store
    }

    pub fn tensors(&self) -> &Arc<TensorEngine> {
        &self.tensors
    }

    pub fn witnesses(&self) -> &Arc<WitnessProtocol> {
        &self.witnesses
    }

    pub fn retention(&self) -> &Arc<RetentionEngine> {
        &self.retention
    }

    pub fn keys(&self) -> &Arc<KeyRegistry> {
        &self.keys
    }

    // ---- identities ----

    pub fn register_entity(&self, id: impl Into<EntityId>, key: PublicKey) {
        self.keys.register(id, key);
    }

    pub fn register_witness<I, S>(&self, id: impl Into<EntityId>, key: PublicKey, contexts: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.witnesses.register_witness(id, key, contexts, self.now());
    }

    // ---- ingestion ----

    /// Validate, append, score. Retained entries above Compost come back with
    /// suggested witnesses. Stem and Root are written by promotion only.
    pub fn submit(&self, tier: Tier, draft: NewEntry) -> Result<Submission, LedgerError> {
        if !tier.accepts_submissions() {
            return Err(LedgerError::Rejected {
                author: draft.author_id,
                reason: format!("{} accepts promoted entries only", tier),
            });
        }
        if let Err(e) = validate_ingest(self.cfg.tiers.get(tier), &draft, &self.keys, &Ed25519Verifier) {
            return Err(LedgerError::Rejected {
                author: draft.author_id,
                reason: e.to_string(),
            });
        }
        let entry = self.store.append(tier, draft)?;
        self.retention.note(&entry);
        let score = self.retention.score(&entry);
        let witness_request = if tier != Tier::Compost && score >= self.cfg.snarc.retain_threshold {
            let required = self.cfg.quorum.required(&entry.content.kind);
            Some(WitnessRequest {
                entry: entry.entry_ref(),
                candidates: self.witnesses.select_witnesses(&entry, required, self.now()),
                required,
            })
        } else {
            None
        };
        debug!(entry = %entry.entry_ref(), score, "submitted");
        Ok(Submission {
            entry,
            score,
            witness_request,
        })
    }

    // ---- witnessing ----

    pub fn create_mark(&self, entry: EntryRef, author: &dyn Signer) -> Result<WitnessMark, LedgerError> {
        let e = self.entry_or_not_found(entry)?;
        Ok(self.witnesses.create_mark(&e, author, self.now()))
    }

    /// Witness-side signing against this node's view of the entry.
    pub fn acknowledge(
        &self,
        mark: &WitnessMark,
        witness_id: &str,
        witness_type: WitnessType,
        policy_compliant: bool,
        witness: &dyn Signer,
    ) -> Result<WitnessAck, LedgerError> {
        let e = self.entry_or_not_found(mark.entry)?;
        let validation = AckValidation::observe(mark, &e, policy_compliant);
        Ok(self
            .witnesses
            .acknowledge(mark, witness_id, witness_type, validation, witness, self.now())?)
    }

    pub fn record_ack(&self, ack: WitnessAck) -> Result<AckOutcome, LedgerError> {
        let entry = self.entry_or_not_found(ack.entry)?;
        let receipt = match self.witnesses.record_ack(ack, &entry) {
            Ok(r) => r,
            Err(e) => return Ok(AckOutcome::Rejected(e)),
        };
        self.apply_event(&receipt.event)?;
        let promotion_queued = self.retention.should_promote(&entry)
            && self.promotions.enqueue(PromotionRequest {
                source: entry.entry_ref(),
                requested_at: self.now(),
            });
        Ok(AckOutcome::Accepted {
            ack_count: receipt.ack_count,
            promotion_queued,
        })
    }

    /// Withdraw a later-proven-invalid ack and penalize its witness.
    /// Promotions it contributed to are not reversed.
    pub fn invalidate_ack(&self, entry: EntryRef, witness_id: &str) -> Result<Vec<TensorSnapshot>, LedgerError> {
        let event = self.witnesses.invalidate(&entry, witness_id, self.now())?;
        self.apply_event(&event)
    }

    pub fn record_outcome(
        &self,
        key: TensorKey,
        dimension: Dimension,
        score: f64,
        weight: f64,
    ) -> Result<TensorSnapshot, LedgerError> {
        let event = TensorEvent::Outcome {
            key: key.clone(),
            dimension,
            score,
            weight,
            at: self.now(),
        };
        self.apply_event(&event)?;
        Ok(self.tensors.snapshot(&key))
    }

    fn apply_event(&self, event: &TensorEvent) -> Result<Vec<TensorSnapshot>, LedgerError> {
        let touched = self.tensors.apply(event)?;
        let at = self.now();
        for s in &touched {
            if s.key.scope.is_none() {
                self.witnesses.record_trust(&s.key.entity, at, s.t3_score);
            }
        }
        Ok(touched)
    }

    // ---- query API (read-only) ----

    pub fn get_entry(&self, tier: Tier, entry_id: u64) -> Result<Option<Arc<Entry>>, LedgerError> {
        Ok(self.store.get(tier, entry_id)?)
    }

    pub fn verify_chain<R: RangeBounds<u64>>(&self, tier: Tier, range: R) -> Result<VerificationResult, LedgerError> {
        Ok(self.store.verify(tier, range)?)
    }

    pub fn get_tensor(&self, entity: &str) -> TensorSnapshot {
        self.tensors.snapshot(&TensorKey::entity(entity))
    }

    /// Proof of an entry's content hash against the tier's current live root.
    pub fn merkle_proof(&self, tier: Tier, entry_id: u64) -> Result<Option<(MerkleProof, Hash)>, LedgerError> {
        let snap = self.store.snapshot(tier)?;
        let tree = MerkleTree::from_entries(snap.live().map(|e| &**e));
        Ok(tree.proof(entry_id).map(|p| (p, tree.root())))
    }

    pub fn digest(&self, tier: Tier) -> Result<TierDigest, LedgerError> {
        Ok(TierDigest::of(&self.store.snapshot(tier)?))
    }

    pub fn ack_count(&self, entry: EntryRef) -> usize {
        self.witnesses.book().count(&entry)
    }

    pub fn promoted_to(&self, entry: EntryRef) -> Option<EntryRef> {
        self.promotions.state().promoted_to(&entry)
    }

    // ---- maintenance ----

    pub fn record_access(&self, entry: EntryRef) {
        self.retention.record_access(entry);
    }

    pub fn set_context<I, S>(&self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retention.set_context(tags);
    }

    pub fn end_session(&self) {
        self.retention.end_session(self.now());
    }

    /// Queue every promotable live entry of `tier`. Returns how many were queued.
    pub fn scan_promotions(&self, tier: Tier) -> Result<usize, LedgerError> {
        let now = self.now();
        let mut queued = 0;
        for e in self.store.live_entries(tier)? {
            if self.retention.should_promote(&e)
                && self.promotions.enqueue(PromotionRequest {
                    source: e.entry_ref(),
                    requested_at: now,
                })
            {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Run queued promotions inline. No-op once the worker was spawned.
    pub fn process_promotions(&self) -> Result<Vec<PromotionBatch>, LedgerError> {
        let guard = self
            .worker
            .lock()
            .map_err(|_| StorageError::LockPoisoned("promotion worker"))?;
        let Some(worker) = guard.as_ref() else {
            return Ok(Vec::new());
        };
        let batches = worker.drain()?;
        for b in &batches {
            self.retention.note(&b.consolidated);
        }
        Ok(batches)
    }

    /// Move the promotion worker onto its own thread.
    pub fn spawn_promotion_worker(&self) -> Option<JoinHandle<()>> {
        let worker = self.worker.lock().ok()?.take()?;
        Some(worker.spawn())
    }

    pub fn prune(&self, tier: Tier) -> Result<usize, LedgerError> {
        let n = self.retention.prune(tier)?;
        let live: BTreeSet<u64> = self.store.live_entries(tier)?.iter().map(|e| e.entry_id).collect();
        self.promotions
            .state()
            .retain_sources(|r| r.tier != tier || live.contains(&r.entry_id));
        Ok(n)
    }

    pub fn prune_all(&self) -> Result<usize, LedgerError> {
        let mut n = 0;
        for tier in Tier::ALL {
            n += self.prune(tier)?;
        }
        Ok(n)
    }

    /// Decay every stored tensor by `elapsed_ms` of inactivity.
    pub fn decay_tensors(&self, elapsed_ms: u64) {
        let at = self.now();
        for s in self.tensors.export() {
            let d = self.tensors.decay(&s.key, elapsed_ms);
            if d.key.scope.is_none() {
                self.witnesses.record_trust(&d.key.entity, at, d.t3_score);
            }
        }
    }

    pub fn persist_tensors(&self) -> Result<(), LedgerError> {
        if let Some(ts) = &self.tensor_store {
            ts.save(&PersistedTensors::from_snapshots(self.tensors.export()))?;
        }
        Ok(())
    }

    fn entry_or_not_found(&self, r: EntryRef) -> Result<Arc<Entry>, LedgerError> {
        self.store.get_ref(r)?.ok_or(LedgerError::NotFound(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::entry::EntryContent;
    use crate::tensor::{Root, T3_ROOTS};
    use crate::validation::{Ed25519Signer, sign_content};

    fn signer(seed: u8) -> Arc<Ed25519Signer> {
        Arc::new(Ed25519Signer::from_secret(&[seed; 32]).expect("key"))
    }

    fn node() -> (LedgerNode, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let n = LedgerNode::in_memory("node", LedgerConfig::default(), signer(100), clock.clone()).expect("node");
        (n, clock)
    }

    fn signed(author: &Ed25519Signer, id: &str, content: EntryContent) -> NewEntry {
        let sig = sign_content(author, &content, id);
        NewEntry::new(content, id).with_signature(sig)
    }

    #[test]
    fn unsigned_leaf_submission_rejected() {
        let (n, _) = node();
        let err = n
            .submit(Tier::Leaf, NewEntry::new(EntryContent::new("k", b"1".to_vec()), "alice"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Rejected { .. }));
        assert_eq!(n.store().len(Tier::Leaf).expect("len"), 0);
    }

    #[test]
    fn retained_submission_requests_trusted_witnesses() {
        let (n, clock) = node();
        let alice = signer(1);
        n.register_entity("alice", alice.public_key());
        for i in 0..10 {
            for r in T3_ROOTS {
                n.record_outcome(TensorKey::entity("w1"), Dimension::Root(r), 0.95, 1.0)
                    .expect("outcome");
            }
            clock.advance(i + 1);
        }
        n.register_witness("w1", signer(2).public_key(), ["ops"]);
        let sub = n
            .submit(
                Tier::Leaf,
                signed(&alice, "alice", EntryContent::new("observation", b"x".to_vec()).with_tags(["ops"])),
            )
            .expect("submit");
        assert_eq!(sub.score, 3);
        let req = sub.witness_request.expect("request");
        assert_eq!(req.candidates, vec!["w1".to_string()]);
        assert_eq!(req.required, 1);
    }

    #[test]
    fn compost_accepts_unsigned_and_never_requests_witnesses() {
        let (n, _) = node();
        let sub = n
            .submit(Tier::Compost, NewEntry::new(EntryContent::new("raw", b"1".to_vec()), "sensor"))
            .expect("submit");
        assert!(sub.witness_request.is_none());
    }

    #[test]
    fn query_api_is_consistent() {
        let (n, _) = node();
        let alice = signer(1);
        n.register_entity("alice", alice.public_key());
        let mut ids = Vec::new();
        for i in 0..5u8 {
            let s = n
                .submit(Tier::Leaf, signed(&alice, "alice", EntryContent::new("pattern", vec![i])))
                .expect("submit");
            ids.push(s.entry.entry_id);
        }
        assert!(n.verify_chain(Tier::Leaf, ..).expect("verify").is_valid());
        let (proof, root) = n.merkle_proof(Tier::Leaf, ids[3]).expect("proof").expect("present");
        let e = n.get_entry(Tier::Leaf, ids[3]).expect("get").expect("present");
        assert!(crate::merkle::verify_proof(ids[3], &e.content_hash, &root, &proof));
        let d = n.digest(Tier::Leaf).expect("digest");
        assert_eq!(d.root, root);
        assert_eq!((d.first_id, d.last_id, d.count), (Some(0), Some(4), 5));
        assert_eq!(n.get_tensor("nobody").t3_score, 0.5);
    }

    #[test]
    fn stem_and_root_only_fill_through_promotion() {
        let (n, _) = node();
        let alice = signer(1);
        n.register_entity("alice", alice.public_key());
        for tier in [Tier::Stem, Tier::Root] {
            let err = n
                .submit(tier, signed(&alice, "alice", EntryContent::new("law", b"1".to_vec())))
                .unwrap_err();
            assert!(matches!(err, LedgerError::Rejected { ref author, .. } if author == "alice"));
            assert_eq!(n.store().len(tier).expect("len"), 0);
        }
    }

    #[test]
    fn outcome_updates_trust_history() {
        let (n, clock) = node();
        n.register_witness("w", signer(3).public_key(), Vec::<String>::new());
        clock.advance(10);
        let s = n
            .record_outcome(TensorKey::entity("w"), Dimension::Root(Root::Talent), 1.0, 1.0)
            .expect("outcome");
        assert_eq!(n.witnesses().trust_at("w", n.now()), Some(s.t3_score));
        assert!(n
            .record_outcome(TensorKey::entity("w"), Dimension::Root(Root::Talent), f64::NAN, 1.0)
            .is_err());
    }
}
