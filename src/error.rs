// Error taxonomy. Messages name the violated invariant and where it broke.

use crate::entry::{EntryRef, Tier};
use thiserror::Error;

/// Broken hash link found by `verify`. Reported, never auto-repaired.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainIntegrityError {
    #[error("entry hash mismatch at {tier}#{entry_id}: content does not hash to stored content_hash")]
    ContentHashMismatch { tier: Tier, entry_id: u64 },

    #[error("entry hash mismatch at {tier}#{entry_id}: header does not hash to stored entry_hash")]
    EntryHashMismatch { tier: Tier, entry_id: u64 },

    #[error("broken link at {tier}#{entry_id}: prev_hash does not match predecessor entry_hash")]
    BrokenLink { tier: Tier, entry_id: u64 },

    #[error("sequence gap at {tier}#{entry_id}: expected entry id {expected}")]
    SequenceGap { tier: Tier, entry_id: u64, expected: u64 },
}

impl ChainIntegrityError {
    pub fn position(&self) -> EntryRef {
        match *self {
            ChainIntegrityError::ContentHashMismatch { tier, entry_id }
            | ChainIntegrityError::EntryHashMismatch { tier, entry_id }
            | ChainIntegrityError::BrokenLink { tier, entry_id }
            | ChainIntegrityError::SequenceGap { tier, entry_id, .. } => {
                EntryRef::new(tier, entry_id)
            }
        }
    }
}

/// Recoverable: the author re-requests from a different witness.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WitnessError {
    #[error("invalid ack signature from witness {witness_id} on {entry}")]
    InvalidSignature { witness_id: String, entry: EntryRef },

    #[error("unknown witness key for {witness_id}")]
    UnknownWitness { witness_id: String },

    #[error("stale timestamp from witness {witness_id} on {entry}: witness_timestamp {witness_timestamp} <= entry timestamp {entry_timestamp}")]
    StaleTimestamp {
        witness_id: String,
        entry: EntryRef,
        witness_timestamp: u64,
        entry_timestamp: u64,
    },

    #[error("witness {witness_id} ineligible on {entry}: {reason}")]
    Ineligible {
        witness_id: String,
        entry: EntryRef,
        reason: String,
    },

    #[error("no registered key for author {author_id} of {entry}")]
    UnknownAuthor { author_id: String, entry: EntryRef },

    #[error("ack does not reference {entry}: mark/hash mismatch")]
    MarkMismatch { entry: EntryRef },

    #[error("duplicate ack from witness {witness_id} on {entry}")]
    DuplicateAck { witness_id: String, entry: EntryRef },

    #[error("witness quorum not met on {entry}: {have} of {required} acks for type {kind}")]
    QuorumNotMet {
        entry: EntryRef,
        kind: String,
        have: usize,
        required: usize,
    },

    #[error("witness rule {rule} failed for {witness_id} on {entry}")]
    RuleViolation {
        witness_id: String,
        entry: EntryRef,
        rule: &'static str,
    },
}

/// Out-of-domain tensor input. Caller resends valid input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TensorInputError {
    #[error("score must be finite, got {0}")]
    NonFiniteScore(f64),

    #[error("observation weight must be finite and in (0, 1], got {0}")]
    InvalidWeight(f64),

    #[error("dimension {dimension} does not belong to the {tensor} tensor")]
    WrongTensor {
        dimension: String,
        tensor: &'static str,
    },

    #[error("merge weights must be finite, non-negative and not both zero")]
    InvalidMergeWeights,

    #[error("remote dimension {dimension} out of range: {value} not in [0, 1]")]
    OutOfRange { dimension: String, value: f64 },
}

/// I/O failure on append/read. Propagated unchanged, never retried here.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("storage encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("lock poisoned on {0}")]
    LockPoisoned(&'static str),

    #[error("persisted log for tier {tier} failed verification on reopen: {source}")]
    CorruptLog {
        tier: Tier,
        #[source]
        source: ChainIntegrityError,
    },
}

impl StorageError {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

/// Diverging peer chains. Surfaced for governance resolution, never auto-merged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncConflictError {
    #[error("peer {peer} diverged at {tier}#{entry_id}: known hash {known}, offered {offered}")]
    DivergentEntry {
        peer: String,
        tier: Tier,
        entry_id: u64,
        known: String,
        offered: String,
    },

    #[error("peer {peer} chain link broken at {tier}#{entry_id}")]
    BrokenPeerLink { peer: String, tier: Tier, entry_id: u64 },

    #[error("peer {peer} served entry {tier}#{entry_id} that does not match its summary")]
    SummaryMismatch { peer: String, tier: Tier, entry_id: u64 },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Umbrella error for the node facade.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Chain(#[from] ChainIntegrityError),

    #[error(transparent)]
    Witness(#[from] WitnessError),

    #[error(transparent)]
    Tensor(#[from] TensorInputError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Conflict(#[from] SyncConflictError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("ingestion rejected for author {author}: {reason}")]
    Rejected { author: String, reason: String },

    #[error("entry not found: {0}")]
    NotFound(EntryRef),
}
