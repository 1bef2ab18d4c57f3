// Promotion: the append path only enqueues; a worker migrates batches off-path.
// Each batch becomes one consolidated entry on the next tier, carrying its
// sources and the Merkle root over their content hashes.

use crate::entry::{EntityId, Entry, EntryContent, EntryRef, NewEntry, Tier, short_hex};
use crate::error::StorageError;
use crate::ledger::ChainStore;
use crate::merkle::build_root;
use crate::validation::{Signer, sign_content};
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

pub const CONSOLIDATION_KIND: &str = "pattern_consolidation";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PromotionRequest {
    pub source: EntryRef,
    pub requested_at: u64,
}

/// Where promoted entries went, and what is still in flight.
#[derive(Debug, Default)]
pub struct PromotionState {
    pending: DashMap<EntryRef, u64>,
    promoted: DashMap<EntryRef, EntryRef>,
}

impl PromotionState {
    pub fn is_pending(&self, r: &EntryRef) -> bool {
        self.pending.contains_key(r)
    }

    pub fn promoted_to(&self, r: &EntryRef) -> Option<EntryRef> {
        self.promoted.get(r).map(|t| *t)
    }

    pub fn promoted_count(&self) -> usize {
        self.promoted.len()
    }

    /// Forget promotions whose source `keep` rejects. In-flight requests are
    /// left to the worker, which skips sources that are gone.
    pub fn retain_sources(&self, keep: impl Fn(&EntryRef) -> bool) {
        self.promoted.retain(|r, _| keep(r));
    }
}

#[derive(Clone)]
pub struct PromotionQueue {
    tx: Sender<PromotionRequest>,
    state: Arc<PromotionState>,
}

impl PromotionQueue {
    /// Non-blocking. False if the entry is already queued, promoted, or the worker is gone.
    pub fn enqueue(&self, req: PromotionRequest) -> bool {
        if self.state.promoted.contains_key(&req.source) {
            return false;
        }
        if self.state.pending.insert(req.source, req.requested_at).is_some() {
            return false;
        }
        if self.tx.send(req).is_err() {
            self.state.pending.remove(&req.source);
            return false;
        }
        true
    }

    pub fn state(&self) -> &Arc<PromotionState> {
        &self.state
    }
}

/// One consolidated entry produced by the worker.
#[derive(Clone, Debug)]
pub struct PromotionBatch {
    pub from: Tier,
    pub to: Tier,
    pub sources: Vec<EntryRef>,
    pub consolidated: Arc<Entry>,
}

pub struct PromotionWorker {
    rx: Receiver<PromotionRequest>,
    state: Arc<PromotionState>,
    store: Arc<ChainStore>,
    signer: Arc<dyn Signer>,
    node_id: EntityId,
}

pub fn promotion_channel(
    store: Arc<ChainStore>,
    signer: Arc<dyn Signer>,
    node_id: impl Into<EntityId>,
) -> (PromotionQueue, PromotionWorker) {
    let (tx, rx) = mpsc::channel();
    let state = Arc::new(PromotionState::default());
    (
        PromotionQueue {
            tx,
            state: state.clone(),
        },
        PromotionWorker {
            rx,
            state,
            store,
            signer,
            node_id: node_id.into(),
        },
    )
}

impl PromotionWorker {
    pub fn state(&self) -> &Arc<PromotionState> {
        &self.state
    }

    /// Process everything queued right now.
    pub fn drain(&self) -> Result<Vec<PromotionBatch>, StorageError> {
        let mut batch = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(req) => batch.push(req),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        self.process(batch)
    }

    /// Run on a background thread until every queue handle is dropped.
    pub fn spawn(self) -> JoinHandle<()> {
        thread::spawn(move || {
            while let Ok(first) = self.rx.recv() {
                let mut batch = vec![first];
                while let Ok(req) = self.rx.try_recv() {
                    batch.push(req);
                }
                if let Err(e) = self.process(batch) {
                    warn!(error = %e, "promotion batch failed");
                }
            }
        })
    }

    fn process(&self, requests: Vec<PromotionRequest>) -> Result<Vec<PromotionBatch>, StorageError> {
        let mut by_tier: BTreeMap<Tier, BTreeSet<u64>> = BTreeMap::new();
        for req in requests {
            self.state.pending.remove(&req.source);
            if self.state.promoted.contains_key(&req.source) {
                continue;
            }
            by_tier.entry(req.source.tier).or_default().insert(req.source.entry_id);
        }

        let mut out = Vec::new();
        for (from, ids) in by_tier {
            let Some(to) = from.next() else {
                continue;
            };
            let mut sources: Vec<Arc<Entry>> = Vec::with_capacity(ids.len());
            for id in ids {
                // Pruned or evicted before the worker got to it.
                if let Some(e) = self.store.get(from, id)? {
                    sources.push(e);
                }
            }
            if sources.is_empty() {
                continue;
            }
            let batch = self.consolidate(from, to, &sources)?;
            for r in &batch.sources {
                self.state.promoted.insert(*r, batch.consolidated.entry_ref());
            }
            let root = batch.consolidated.merkle_root.map(|r| short_hex(&r)).unwrap_or_default();
            let target = batch.consolidated.entry_ref();
            info!(
                from = %from,
                to = %to,
                sources = batch.sources.len(),
                entry = %target,
                root = %root,
                "promotion"
            );
            out.push(batch);
        }
        Ok(out)
    }

    fn consolidate(&self, from: Tier, to: Tier, sources: &[Arc<Entry>]) -> Result<PromotionBatch, StorageError> {
        let hashes: Vec<_> = sources.iter().map(|e| e.content_hash).collect();
        let root = build_root(&hashes);
        let refs: Vec<EntryRef> = sources.iter().map(|e| e.entry_ref()).collect();

        let mut payload = Vec::with_capacity(32 * hashes.len());
        for h in &hashes {
            payload.extend_from_slice(h);
        }
        let tags: BTreeSet<&String> = sources.iter().flat_map(|e| e.content.tags.iter()).collect();
        let content = EntryContent::new(CONSOLIDATION_KIND, payload)
            .with_tags(tags.into_iter().cloned())
            .with_impact(sources.iter().map(|e| e.content.impact).sum())
            .with_deviation(sources.iter().map(|e| e.content.deviation).fold(0.0, f64::max));
        let sig = sign_content(self.signer.as_ref(), &content, &self.node_id);
        let draft = NewEntry::new(content, self.node_id.clone())
            .with_signature(sig)
            .with_sources(refs.clone(), Some(root));
        let consolidated = self.store.append(to, draft)?;
        Ok(PromotionBatch {
            from,
            to,
            sources: refs,
            consolidated,
        })
    }
}
