use crate::entry::{EntityId, Entry, EntryRef, Hash, Tier};
use crate::error::SyncConflictError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a peer advertises about a promoted entry: hashes and metadata, no payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySummary {
    pub entry: EntryRef,
    pub entry_hash: Hash,
    pub prev_hash: Hash,
    pub content_hash: Hash,
    pub kind: String,
    pub tags: Vec<String>,
    pub timestamp: u64,
    pub author_id: EntityId,
}

impl EntrySummary {
    pub fn of(entry: &Entry) -> Self {
        Self {
            entry: entry.entry_ref(),
            entry_hash: entry.entry_hash,
            prev_hash: entry.prev_hash,
            content_hash: entry.content_hash,
            kind: entry.content.kind.clone(),
            tags: entry.content.tags.clone(),
            timestamp: entry.timestamp,
            author_id: entry.author_id.clone(),
        }
    }

    /// Only Stem and Root entries leave a node.
    pub fn is_shareable(tier: Tier) -> bool {
        matches!(tier, Tier::Stem | Tier::Root)
    }

    /// Full entry matches what was advertised and hashes to itself.
    pub fn describes(&self, entry: &Entry) -> bool {
        entry.entry_ref() == self.entry
            && entry.entry_hash == self.entry_hash
            && entry.content_hash == self.content_hash
            && entry.content_hash_valid()
            && entry.compute_entry_hash() == entry.entry_hash
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync with peer {peer} abandoned after {after_ms}ms")]
    Timeout { peer: String, after_ms: u64 },

    #[error("peer {peer} failed: {reason}")]
    Peer { peer: String, reason: String },

    #[error("sync with peer {peer} surfaced {count} conflict(s), first: {first}")]
    Conflict {
        peer: String,
        count: usize,
        first: SyncConflictError,
    },
}

/// Outcome of one exchange. Conflicts are reported here, never merged.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncResult {
    pub peer: String,
    pub offered: usize,
    pub relevant: usize,
    pub fetched: usize,
    pub already_known: usize,
    pub tensors_merged: usize,
    pub conflicts: Vec<SyncConflictError>,
}

impl SyncResult {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Escalate surfaced conflicts into an error for callers that want to stop on divergence.
    pub fn into_clean(self) -> Result<Self, SyncError> {
        match self.conflicts.first() {
            None => Ok(self),
            Some(first) => Err(SyncError::Conflict {
                peer: self.peer.clone(),
                count: self.conflicts.len(),
                first: first.clone(),
            }),
        }
    }
}
