use super::peer::FederationPeer;
use super::types::{EntrySummary, SyncError, SyncResult};
use crate::config::FederationConfig;
use crate::entry::{EntityId, Entry, EntryRef, ZERO_HASH, short_hex};
use crate::error::SyncConflictError;
use crate::node::LedgerNode;
use crate::tensor::TensorSnapshot;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Entries replicated from peers, keyed by (peer, position in the peer's chain).
/// Kept apart from the local tiers: a peer's chain is never re-hashed into ours.
#[derive(Debug, Default)]
pub struct ReplicaStore {
    entries: DashMap<(EntityId, EntryRef), Arc<Entry>>,
}

impl ReplicaStore {
    pub fn get(&self, peer: &str, r: EntryRef) -> Option<Arc<Entry>> {
        self.entries.get(&(peer.to_string(), r)).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Everything held for `peer`, in chain order.
    pub fn from_peer(&self, peer: &str) -> Vec<Arc<Entry>> {
        let mut out: Vec<Arc<Entry>> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == peer)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|e| e.entry_ref());
        out
    }

    /// Ok(true) if stored, Ok(false) if already held with the same hash.
    pub fn insert(&self, peer: &str, entry: Entry) -> Result<bool, SyncConflictError> {
        let r = entry.entry_ref();
        let expected_prev = match r.entry_id {
            0 => Some(ZERO_HASH),
            n => self
                .get(peer, EntryRef::new(r.tier, n - 1))
                .map(|p| p.entry_hash),
        };
        if let Some(prev) = expected_prev {
            if prev != entry.prev_hash {
                return Err(SyncConflictError::BrokenPeerLink {
                    peer: peer.to_string(),
                    tier: r.tier,
                    entry_id: r.entry_id,
                });
            }
        }
        match self.entries.entry((peer.to_string(), r)) {
            MapEntry::Occupied(o) => {
                if o.get().entry_hash == entry.entry_hash {
                    Ok(false)
                } else {
                    Err(divergent(peer, &o.get().entry_hash, &entry.entry_hash, r))
                }
            }
            MapEntry::Vacant(v) => {
                v.insert(Arc::new(entry));
                Ok(true)
            }
        }
    }
}

fn in_scope(scope: &BTreeSet<String>, summary: &EntrySummary) -> bool {
    scope.is_empty() || summary.tags.iter().any(|t| scope.contains(t))
}

fn divergent(peer: &str, known: &[u8; 32], offered: &[u8; 32], r: EntryRef) -> SyncConflictError {
    SyncConflictError::DivergentEntry {
        peer: peer.to_string(),
        tier: r.tier,
        entry_id: r.entry_id,
        known: short_hex(known),
        offered: short_hex(offered),
    }
}

/// Everything gathered from a peer before anything is committed locally.
struct Staged {
    result: SyncResult,
    entries: Vec<Entry>,
    tensors: Vec<TensorSnapshot>,
}

pub struct FederationSync {
    node: Arc<LedgerNode>,
    cfg: FederationConfig,
    replicas: ReplicaStore,
}

impl FederationSync {
    pub fn new(node: Arc<LedgerNode>) -> Self {
        let cfg = node.config().federation.clone();
        Self::with_config(node, cfg)
    }

    pub fn with_config(node: Arc<LedgerNode>, cfg: FederationConfig) -> Self {
        Self {
            node,
            cfg,
            replicas: ReplicaStore::default(),
        }
    }

    pub fn replicas(&self) -> &ReplicaStore {
        &self.replicas
    }

    /// Tags this node cares about: the configured federation scope plus the
    /// retention context currently set on the node.
    pub fn scope(&self) -> BTreeSet<String> {
        let mut scope = self.node.retention().context();
        scope.extend(self.cfg.relevant_tags.iter().cloned());
        scope
    }

    /// Any shared tag with the local scope, or everything when the scope is empty.
    pub fn is_relevant(&self, summary: &EntrySummary) -> bool {
        in_scope(&self.scope(), summary)
    }

    /// One exchange with `peer`. Nothing is committed unless the whole exchange
    /// completes within the peer timeout; re-running it is idempotent.
    pub async fn sync(&self, peer: &dyn FederationPeer) -> Result<SyncResult, SyncError> {
        let limit = Duration::from_millis(self.cfg.peer_timeout_ms);
        let staged = match tokio::time::timeout(limit, self.exchange(peer)).await {
            Ok(staged) => staged?,
            Err(_) => {
                warn!(peer = peer.peer_id(), timeout_ms = self.cfg.peer_timeout_ms, "sync abandoned");
                return Err(SyncError::Timeout {
                    peer: peer.peer_id().to_string(),
                    after_ms: self.cfg.peer_timeout_ms,
                });
            }
        };
        let result = self.commit(peer.peer_id(), staged);
        for c in &result.conflicts {
            warn!(peer = %result.peer, conflict = %c, "sync conflict");
        }
        info!(
            peer = %result.peer,
            offered = result.offered,
            fetched = result.fetched,
            known = result.already_known,
            conflicts = result.conflicts.len(),
            "sync complete"
        );
        Ok(result)
    }

    async fn exchange(&self, peer: &dyn FederationPeer) -> Result<Staged, SyncError> {
        let pid = peer.peer_id().to_string();
        let summaries = peer.summaries(self.cfg.max_summaries).await?;
        let mut result = SyncResult {
            peer: pid.clone(),
            offered: summaries.len(),
            ..SyncResult::default()
        };

        let scope = self.scope();
        let mut wanted = Vec::new();
        for s in summaries.iter().filter(|s| EntrySummary::is_shareable(s.entry.tier)) {
            if !in_scope(&scope, s) {
                continue;
            }
            result.relevant += 1;
            match self.replicas.get(&pid, s.entry) {
                Some(known) if known.entry_hash == s.entry_hash => result.already_known += 1,
                Some(known) => result
                    .conflicts
                    .push(divergent(&pid, &known.entry_hash, &s.entry_hash, s.entry)),
                None => wanted.push(s),
            }
        }
        if wanted.is_empty() {
            return Ok(Staged {
                result,
                entries: Vec::new(),
                tensors: Vec::new(),
            });
        }

        let refs: Vec<EntryRef> = wanted.iter().map(|s| s.entry).collect();
        let mut fetched = peer.fetch(&refs).await?;
        fetched.sort_by_key(|e| e.entry_ref());
        let mut entries = Vec::with_capacity(fetched.len());
        for e in fetched {
            match wanted.iter().find(|s| s.entry == e.entry_ref()) {
                Some(s) if s.describes(&e) => entries.push(e),
                _ => result.conflicts.push(SyncConflictError::SummaryMismatch {
                    peer: pid.clone(),
                    tier: e.tier,
                    entry_id: e.entry_id,
                }),
            }
        }

        let authors: BTreeSet<&str> = entries.iter().map(|e| e.author_id.as_str()).collect();
        let mut tensors = Vec::new();
        for a in authors {
            if let Some(t) = peer.tensor(a).await? {
                tensors.push(t);
            }
        }
        Ok(Staged {
            result,
            entries,
            tensors,
        })
    }

    fn commit(&self, peer: &str, staged: Staged) -> SyncResult {
        let Staged {
            mut result,
            entries,
            tensors,
        } = staged;
        for e in entries {
            match self.replicas.insert(peer, e) {
                Ok(true) => result.fetched += 1,
                Ok(false) => result.already_known += 1,
                Err(c) => result.conflicts.push(c),
            }
        }
        if self.cfg.peer_tensor_weight > 0.0 {
            let at = self.node.now();
            for t in &tensors {
                match self.node.tensors().merge_snapshot(t, self.cfg.peer_tensor_weight) {
                    Ok(merged) => {
                        self.node.witnesses().record_trust(&merged.key.entity, at, merged.t3_score);
                        result.tensors_merged += 1;
                    }
                    Err(e) => warn!(peer, entity = %t.key, error = %e, "peer tensor rejected"),
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::LedgerConfig;
    use crate::entry::{EntryContent, NewEntry, Tier};
    use crate::federation::peer::LocalPeer;
    use crate::tensor::{Dimension, Root, TensorKey};
    use crate::validation::{Ed25519Signer, Signer, sign_content};
    use async_trait::async_trait;

    fn node(id: &str, cfg: LedgerConfig) -> (Arc<LedgerNode>, Ed25519Signer) {
        let clock = Arc::new(ManualClock::new(1_000));
        let node_key = Arc::new(Ed25519Signer::from_secret(&[7; 32]).expect("key"));
        let n = LedgerNode::in_memory(id, cfg, node_key, clock).expect("node");
        let alice = Ed25519Signer::from_secret(&[1; 32]).expect("key");
        n.register_entity("alice", alice.public_key());
        (Arc::new(n), alice)
    }

    /// Straight onto the tier, the way the promotion worker writes.
    fn publish(n: &LedgerNode, alice: &Ed25519Signer, tier: Tier, payload: &[u8], tag: &str) {
        let content = EntryContent::new("pattern", payload.to_vec()).with_tags([tag]);
        let sig = sign_content(alice, &content, "alice");
        n.store()
            .append(tier, NewEntry::new(content, "alice").with_signature(sig))
            .expect("append");
    }

    #[tokio::test]
    async fn resync_is_idempotent() {
        let (a, alice) = node("node-a", LedgerConfig::default());
        for i in 0..3u8 {
            publish(&a, &alice, Tier::Stem, &[i], "ops");
        }
        let (b, _) = node("node-b", LedgerConfig::default());
        let sync = FederationSync::new(b);
        let peer = LocalPeer::new(a);

        let first = sync.sync(&peer).await.expect("sync");
        assert_eq!((first.offered, first.fetched, first.already_known), (3, 3, 0));
        assert!(first.is_clean());

        let second = sync.sync(&peer).await.expect("sync");
        assert_eq!((second.fetched, second.already_known), (0, 3));
        assert_eq!(sync.replicas().len(), 3);
        assert_eq!(sync.replicas().from_peer("node-a").len(), 3);
    }

    #[tokio::test]
    async fn leaf_entries_are_never_offered_and_scope_filters() {
        let (a, alice) = node("node-a", LedgerConfig::default());
        publish(&a, &alice, Tier::Leaf, b"private", "ops");
        publish(&a, &alice, Tier::Stem, b"shared", "ops");
        publish(&a, &alice, Tier::Stem, b"other", "finance");

        let mut cfg = LedgerConfig::default();
        cfg.federation.relevant_tags = vec!["ops".to_string()];
        let (b, _) = node("node-b", cfg);
        let sync = FederationSync::new(b);
        let r = sync.sync(&LocalPeer::new(a)).await.expect("sync");
        assert_eq!((r.offered, r.relevant, r.fetched), (2, 1, 1));
        let held = sync.replicas().from_peer("node-a");
        assert_eq!(held[0].content.payload, b"shared".to_vec());
    }

    #[tokio::test]
    async fn diverging_peer_chain_is_surfaced() {
        let (a, alice) = node("node-a", LedgerConfig::default());
        publish(&a, &alice, Tier::Stem, b"one", "ops");
        let (forked, alice2) = node("node-a", LedgerConfig::default());
        publish(&forked, &alice2, Tier::Stem, b"two", "ops");

        let (b, _) = node("node-b", LedgerConfig::default());
        let sync = FederationSync::new(b);
        sync.sync(&LocalPeer::new(a)).await.expect("sync");
        let r = sync.sync(&LocalPeer::new(forked)).await.expect("sync");
        assert_eq!(r.fetched, 0);
        assert!(matches!(
            r.conflicts.as_slice(),
            [SyncConflictError::DivergentEntry { entry_id: 0, .. }]
        ));
        assert!(r.into_clean().is_err());
    }

    #[tokio::test]
    async fn peer_tensors_merge_for_fetched_authors() {
        let (a, alice) = node("node-a", LedgerConfig::default());
        a.record_outcome(TensorKey::entity("alice"), Dimension::Root(Root::Talent), 1.0, 1.0)
            .expect("outcome");
        publish(&a, &alice, Tier::Stem, b"x", "ops");
        let (b, _) = node("node-b", LedgerConfig::default());
        let sync = FederationSync::new(b.clone());
        let r = sync.sync(&LocalPeer::new(a)).await.expect("sync");
        assert_eq!(r.tensors_merged, 1);
        assert!(b.get_tensor("alice").t3_score > 0.5);
    }

    #[tokio::test]
    async fn retention_context_scopes_what_is_fetched() {
        let (a, alice) = node("node-a", LedgerConfig::default());
        publish(&a, &alice, Tier::Stem, b"shared", "ops");
        publish(&a, &alice, Tier::Stem, b"other", "finance");
        let (b, _) = node("node-b", LedgerConfig::default());
        b.set_context(["finance"]);
        let sync = FederationSync::new(b);
        let r = sync.sync(&LocalPeer::new(a)).await.expect("sync");
        assert_eq!((r.offered, r.relevant, r.fetched), (2, 1, 1));
        assert_eq!(sync.replicas().from_peer("node-a")[0].content.payload, b"other".to_vec());
    }

    #[tokio::test]
    async fn peer_vouching_cannot_lift_a_witness_over_the_bar() {
        let (a, _) = node("node-a", LedgerConfig::default());
        // On the peer, mallory looks impeccable.
        for _ in 0..200 {
            for r in crate::tensor::T3_ROOTS {
                a.record_outcome(TensorKey::entity("mallory"), Dimension::Root(r), 1.0, 1.0)
                    .expect("outcome");
            }
        }
        assert!(a.get_tensor("mallory").t3_score > 0.95);
        let content = EntryContent::new("pattern", b"m".to_vec()).with_tags(["ops"]);
        a.store()
            .append(Tier::Stem, NewEntry::new(content, "mallory"))
            .expect("append");

        let (b, alice) = node("node-b", LedgerConfig::default());
        let mallory = Ed25519Signer::from_secret(&[66; 32]).expect("key");
        b.register_witness("mallory", mallory.public_key(), ["ops"]);
        let sync = FederationSync::new(b.clone());
        let r = sync.sync(&LocalPeer::new(a)).await.expect("sync");
        assert_eq!(r.tensors_merged, 1);
        let local = b.get_tensor("mallory");
        assert!(local.t3_score > 0.5 && local.t3_score < 0.7, "merged trust {}", local.t3_score);

        let content = EntryContent::new("observation", b"o".to_vec()).with_tags(["ops"]);
        let sig = sign_content(&alice, &content, "alice");
        let sub = b
            .submit(Tier::Leaf, NewEntry::new(content, "alice").with_signature(sig))
            .expect("submit");
        let req = sub.witness_request.expect("retained");
        assert!(req.candidates.is_empty());
    }

    struct SlowPeer;

    #[async_trait]
    impl FederationPeer for SlowPeer {
        fn peer_id(&self) -> &str {
            "slow"
        }

        async fn summaries(&self, _limit: usize) -> Result<Vec<EntrySummary>, SyncError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }

        async fn fetch(&self, _refs: &[EntryRef]) -> Result<Vec<Entry>, SyncError> {
            Ok(Vec::new())
        }

        async fn tensor(&self, _entity: &str) -> Result<Option<TensorSnapshot>, SyncError> {
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_peer_times_out_without_side_effects() {
        let (b, _) = node("node-b", LedgerConfig::default());
        let sync = FederationSync::new(b);
        let err = sync.sync(&SlowPeer).await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout { after_ms: 5_000, .. }));
        assert!(sync.replicas().is_empty());
    }
}
