use super::types::{EntrySummary, SyncError};
use crate::entry::{Entry, EntryRef, Tier};
use crate::node::LedgerNode;
use crate::tensor::{TensorKey, TensorSnapshot};
use async_trait::async_trait;
use std::sync::Arc;

/// A remote ledger as seen by the sync engine.
#[async_trait]
pub trait FederationPeer: Send + Sync {
    fn peer_id(&self) -> &str;

    /// Summaries of the peer's promoted entries, oldest first, at most `limit`.
    async fn summaries(&self, limit: usize) -> Result<Vec<EntrySummary>, SyncError>;

    /// Full entries for the requested refs. Unknown or non-shareable refs are omitted.
    async fn fetch(&self, refs: &[EntryRef]) -> Result<Vec<Entry>, SyncError>;

    /// The peer's global tensor for `entity`, if it has one.
    async fn tensor(&self, entity: &str) -> Result<Option<TensorSnapshot>, SyncError>;
}

/// A `LedgerNode` in the same process, served as a peer.
pub struct LocalPeer {
    node: Arc<LedgerNode>,
}

impl LocalPeer {
    pub fn new(node: Arc<LedgerNode>) -> Self {
        Self { node }
    }

    fn fail(&self, e: impl std::fmt::Display) -> SyncError {
        SyncError::Peer {
            peer: self.node.id().to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl FederationPeer for LocalPeer {
    fn peer_id(&self) -> &str {
        self.node.id()
    }

    async fn summaries(&self, limit: usize) -> Result<Vec<EntrySummary>, SyncError> {
        let mut out = Vec::new();
        for tier in [Tier::Stem, Tier::Root] {
            let live = self.node.store().live_entries(tier).map_err(|e| self.fail(e))?;
            out.extend(live.iter().map(|e| EntrySummary::of(e)));
        }
        out.truncate(limit);
        Ok(out)
    }

    async fn fetch(&self, refs: &[EntryRef]) -> Result<Vec<Entry>, SyncError> {
        let mut out = Vec::with_capacity(refs.len());
        for r in refs {
            if !EntrySummary::is_shareable(r.tier) {
                continue;
            }
            if let Some(e) = self.node.store().get_ref(*r).map_err(|e| self.fail(e))? {
                out.push(Entry::clone(&e));
            }
        }
        Ok(out)
    }

    async fn tensor(&self, entity: &str) -> Result<Option<TensorSnapshot>, SyncError> {
        let key = TensorKey::entity(entity);
        if !self.node.tensors().contains(&key) {
            return Ok(None);
        }
        Ok(Some(self.node.tensors().snapshot(&key)))
    }
}
