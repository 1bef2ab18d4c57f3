// Hash-chain store: one append-only, single-writer sequence per tier.
// Entries link on entry_hash; pruned entries leave stubs so the chain keeps verifying,
// and anything dropped off the front of a tier folds into that tier's anchor hash.

use crate::clock::Clock;
use crate::config::TierConfigs;
use crate::entry::{Entry, EntryRef, Hash, NewEntry, Tier, ZERO_HASH, short_hex};
use crate::error::{ChainIntegrityError, StorageError};
use crate::storage::{EntryLog, LogRecord};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::{Bound, RangeBounds};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

/// What remains of an entry after its payload is pruned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrunedStub {
    pub entry_id: u64,
    pub timestamp: u64,
    pub prev_hash: Hash,
    pub entry_hash: Hash,
}

impl PrunedStub {
    fn of(entry: &Entry) -> Self {
        Self {
            entry_id: entry.entry_id,
            timestamp: entry.timestamp,
            prev_hash: entry.prev_hash,
            entry_hash: entry.entry_hash,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Slot {
    Live(Arc<Entry>),
    Pruned(PrunedStub),
}

impl Slot {
    pub fn entry_id(&self) -> u64 {
        match self {
            Slot::Live(e) => e.entry_id,
            Slot::Pruned(s) => s.entry_id,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Slot::Live(e) => e.timestamp,
            Slot::Pruned(s) => s.timestamp,
        }
    }

    pub fn prev_hash(&self) -> Hash {
        match self {
            Slot::Live(e) => e.prev_hash,
            Slot::Pruned(s) => s.prev_hash,
        }
    }

    pub fn entry_hash(&self) -> Hash {
        match self {
            Slot::Live(e) => e.entry_hash,
            Slot::Pruned(s) => s.entry_hash,
        }
    }

    pub fn live(&self) -> Option<&Arc<Entry>> {
        match self {
            Slot::Live(e) => Some(e),
            Slot::Pruned(_) => None,
        }
    }
}

/// Outcome of a verify call: how many slots were checked and the first break, if any.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationResult {
    pub tier: Tier,
    pub checked: u64,
    pub first_break: Option<ChainIntegrityError>,
}

impl VerificationResult {
    pub fn is_valid(&self) -> bool {
        self.first_break.is_none()
    }

    pub fn into_result(self) -> Result<u64, ChainIntegrityError> {
        match self.first_break {
            Some(e) => Err(e),
            None => Ok(self.checked),
        }
    }
}

/// Point-in-time copy of a tier. Slots share entries with the store.
#[derive(Clone, Debug)]
pub struct TierSnapshot {
    pub tier: Tier,
    pub anchor: Hash,
    pub front_id: u64,
    pub head: Hash,
    pub slots: Vec<Slot>,
}

impl TierSnapshot {
    pub fn live(&self) -> impl Iterator<Item = &Arc<Entry>> {
        self.slots.iter().filter_map(Slot::live)
    }

    pub fn verify<R: RangeBounds<u64>>(&self, range: R) -> VerificationResult {
        verify_slots(self.tier, self.anchor, self.front_id, &self.slots, range)
    }
}

#[derive(Debug)]
struct TierChain {
    tier: Tier,
    slots: VecDeque<Slot>,
    anchor: Hash,
    front_id: u64,
    next_id: u64,
    head: Hash,
    last_timestamp: u64,
    live: usize,
}

impl TierChain {
    fn new(tier: Tier) -> Self {
        Self {
            tier,
            slots: VecDeque::new(),
            anchor: ZERO_HASH,
            front_id: 0,
            next_id: 0,
            head: ZERO_HASH,
            last_timestamp: 0,
            live: 0,
        }
    }

    fn index_of(&self, entry_id: u64) -> Option<usize> {
        if entry_id < self.front_id {
            return None;
        }
        let idx = (entry_id - self.front_id) as usize;
        if idx < self.slots.len() { Some(idx) } else { None }
    }

    fn push(&mut self, entry: Arc<Entry>) {
        if self.slots.is_empty() {
            self.front_id = entry.entry_id;
        }
        self.next_id = entry.entry_id + 1;
        self.head = entry.entry_hash;
        self.last_timestamp = self.last_timestamp.max(entry.timestamp);
        self.live += 1;
        self.slots.push_back(Slot::Live(entry));
    }

    fn evict_front(&mut self) -> Option<Slot> {
        let slot = self.slots.pop_front()?;
        self.anchor = slot.entry_hash();
        self.front_id = slot.entry_id() + 1;
        if slot.live().is_some() {
            self.live -= 1;
        }
        Some(slot)
    }

    fn prune_at(&mut self, entry_id: u64) -> bool {
        let Some(idx) = self.index_of(entry_id) else {
            return false;
        };
        let stub = match &self.slots[idx] {
            Slot::Live(e) => PrunedStub::of(e),
            Slot::Pruned(_) => return false,
        };
        self.slots[idx] = Slot::Pruned(stub);
        self.live -= 1;
        true
    }

    fn fold_leading_stubs(&mut self) {
        while matches!(self.slots.front(), Some(Slot::Pruned(_))) {
            self.evict_front();
        }
    }

    fn apply(&mut self, rec: LogRecord) {
        match rec {
            LogRecord::Append { entry } => self.push(Arc::new(entry)),
            LogRecord::Evict { entry_id } => {
                if self.slots.front().map(Slot::entry_id) == Some(entry_id) {
                    self.evict_front();
                }
            }
            LogRecord::Prune { entry_id } => {
                self.prune_at(entry_id);
                self.fold_leading_stubs();
            }
        }
    }

    fn snapshot(&self) -> TierSnapshot {
        TierSnapshot {
            tier: self.tier,
            anchor: self.anchor,
            front_id: self.front_id,
            head: self.head,
            slots: self.slots.iter().cloned().collect(),
        }
    }
}

/// Recompute the chain over `range` (entry ids). Reports the first break only.
pub fn verify_slots<'a, I, R>(tier: Tier, anchor: Hash, front_id: u64, slots: I, range: R) -> VerificationResult
where
    I: IntoIterator<Item = &'a Slot>,
    R: RangeBounds<u64>,
{
    let mut checked = 0u64;
    let mut prev = anchor;
    let mut expected = front_id;
    for slot in slots {
        let id = slot.entry_id();
        let in_range = range.contains(&id);
        if in_range {
            checked += 1;
            let found = check_slot(tier, slot, prev, expected);
            if found.is_some() {
                return VerificationResult {
                    tier,
                    checked,
                    first_break: found,
                };
            }
        } else if past_end(&range, id) {
            break;
        }
        prev = slot.entry_hash();
        expected = id + 1;
    }
    VerificationResult {
        tier,
        checked,
        first_break: None,
    }
}

fn past_end<R: RangeBounds<u64>>(range: &R, id: u64) -> bool {
    match range.end_bound() {
        Bound::Included(end) => id > *end,
        Bound::Excluded(end) => id >= *end,
        Bound::Unbounded => false,
    }
}

fn check_slot(tier: Tier, slot: &Slot, prev: Hash, expected: u64) -> Option<ChainIntegrityError> {
    let entry_id = slot.entry_id();
    if entry_id != expected {
        return Some(ChainIntegrityError::SequenceGap {
            tier,
            entry_id,
            expected,
        });
    }
    if let Slot::Live(e) = slot {
        if e.tier != tier || !e.content_hash_valid() {
            return Some(ChainIntegrityError::ContentHashMismatch { tier, entry_id });
        }
        if e.compute_entry_hash() != e.entry_hash {
            return Some(ChainIntegrityError::EntryHashMismatch { tier, entry_id });
        }
    }
    if slot.prev_hash() != prev {
        return Some(ChainIntegrityError::BrokenLink { tier, entry_id });
    }
    None
}

/// The four tier chains of one node.
pub struct ChainStore {
    tiers: [RwLock<TierChain>; 4],
    configs: TierConfigs,
    clock: Arc<dyn Clock>,
    log: Option<Arc<dyn EntryLog>>,
}

impl ChainStore {
    pub fn in_memory(configs: TierConfigs, clock: Arc<dyn Clock>) -> Self {
        Self {
            tiers: Tier::ALL.map(|t| RwLock::new(TierChain::new(t))),
            configs,
            clock,
            log: None,
        }
    }

    /// Replay persisted tiers from `log` and re-verify each before accepting it.
    pub fn open(configs: TierConfigs, clock: Arc<dyn Clock>, log: Arc<dyn EntryLog>) -> Result<Self, StorageError> {
        let store = Self {
            tiers: Tier::ALL.map(|t| RwLock::new(TierChain::new(t))),
            configs,
            clock,
            log: Some(log.clone()),
        };
        for tier in Tier::ALL {
            if !store.configs.get(tier).persist {
                continue;
            }
            let records = log.replay(tier)?;
            let replayed = records.len();
            let mut chain = store.write(tier)?;
            for rec in records {
                chain.apply(rec);
            }
            let res = verify_slots(tier, chain.anchor, chain.front_id, &chain.slots, ..);
            if let Some(source) = res.first_break {
                warn!(tier = %tier, error = %source, "persisted tier failed verification");
                return Err(StorageError::CorruptLog { tier, source });
            }
            debug!(tier = %tier, records = replayed, live = chain.live, "tier replayed");
        }
        Ok(store)
    }

    fn read(&self, tier: Tier) -> Result<RwLockReadGuard<'_, TierChain>, StorageError> {
        self.tiers[tier.index()]
            .read()
            .map_err(|_| StorageError::LockPoisoned(tier.as_str()))
    }

    fn write(&self, tier: Tier) -> Result<RwLockWriteGuard<'_, TierChain>, StorageError> {
        self.tiers[tier.index()]
            .write()
            .map_err(|_| StorageError::LockPoisoned(tier.as_str()))
    }

    fn persisted_log(&self, tier: Tier) -> Option<&Arc<dyn EntryLog>> {
        if self.configs.get(tier).persist {
            self.log.as_ref()
        } else {
            None
        }
    }

    pub fn configs(&self) -> &TierConfigs {
        &self.configs
    }

    /// Seal `draft` at the tier head. Fails only on storage I/O.
    pub fn append(&self, tier: Tier, draft: NewEntry) -> Result<Arc<Entry>, StorageError> {
        let cfg = self.configs.get(tier);
        let log = self.persisted_log(tier);
        let mut chain = self.write(tier)?;

        if let Some(cap) = cfg.capacity {
            while chain.slots.len() >= cap {
                let Some(id) = chain.slots.front().map(Slot::entry_id) else {
                    break;
                };
                if let Some(log) = log {
                    log.record(tier, &LogRecord::Evict { entry_id: id })?;
                }
                chain.evict_front();
                debug!(tier = %tier, entry_id = id, "capacity eviction");
            }
        }

        // Timestamps never run backwards within a tier.
        let ts = self.clock.now_ms().max(chain.last_timestamp);
        let entry = Entry::seal(tier, chain.next_id, ts, chain.head, draft);
        if let Some(log) = log {
            log.record(tier, &LogRecord::Append { entry: entry.clone() })?;
        }
        let entry = Arc::new(entry);
        chain.push(entry.clone());
        if tier != Tier::Compost {
            debug!(
                tier = %tier,
                entry_id = entry.entry_id,
                kind = %entry.content.kind,
                hash = %short_hex(&entry.entry_hash),
                "append"
            );
        }
        Ok(entry)
    }

    pub fn verify<R: RangeBounds<u64>>(&self, tier: Tier, range: R) -> Result<VerificationResult, StorageError> {
        let chain = self.read(tier)?;
        let res = verify_slots(tier, chain.anchor, chain.front_id, &chain.slots, range);
        if let Some(e) = &res.first_break {
            warn!(tier = %tier, error = %e, "chain verification failed");
        }
        Ok(res)
    }

    pub fn get(&self, tier: Tier, entry_id: u64) -> Result<Option<Arc<Entry>>, StorageError> {
        let chain = self.read(tier)?;
        Ok(chain
            .index_of(entry_id)
            .and_then(|i| chain.slots[i].live().cloned()))
    }

    pub fn get_ref(&self, r: EntryRef) -> Result<Option<Arc<Entry>>, StorageError> {
        self.get(r.tier, r.entry_id)
    }

    pub fn slot(&self, tier: Tier, entry_id: u64) -> Result<Option<Slot>, StorageError> {
        let chain = self.read(tier)?;
        Ok(chain.index_of(entry_id).map(|i| chain.slots[i].clone()))
    }

    pub fn head(&self, tier: Tier) -> Result<Hash, StorageError> {
        Ok(self.read(tier)?.head)
    }

    /// Stored slots, stubs included.
    pub fn len(&self, tier: Tier) -> Result<usize, StorageError> {
        Ok(self.read(tier)?.slots.len())
    }

    pub fn live_len(&self, tier: Tier) -> Result<usize, StorageError> {
        Ok(self.read(tier)?.live)
    }

    /// Id the next append will receive.
    pub fn next_id(&self, tier: Tier) -> Result<u64, StorageError> {
        Ok(self.read(tier)?.next_id)
    }

    pub fn snapshot(&self, tier: Tier) -> Result<TierSnapshot, StorageError> {
        Ok(self.read(tier)?.snapshot())
    }

    pub fn live_entries(&self, tier: Tier) -> Result<Vec<Arc<Entry>>, StorageError> {
        let chain = self.read(tier)?;
        Ok(chain.slots.iter().filter_map(Slot::live).cloned().collect())
    }

    /// Stub every live entry matching `pred`. Root is never pruned.
    pub fn prune_where<F>(&self, tier: Tier, mut pred: F) -> Result<Vec<EntryRef>, StorageError>
    where
        F: FnMut(&Entry) -> bool,
    {
        if tier == Tier::Root {
            return Ok(Vec::new());
        }
        let log = self.persisted_log(tier);
        let mut chain = self.write(tier)?;
        let victims: Vec<u64> = chain
            .slots
            .iter()
            .filter_map(Slot::live)
            .filter(|e| pred(e))
            .map(|e| e.entry_id)
            .collect();
        let mut pruned = Vec::with_capacity(victims.len());
        for id in victims {
            if let Some(log) = log {
                log.record(tier, &LogRecord::Prune { entry_id: id })?;
            }
            if chain.prune_at(id) {
                pruned.push(EntryRef::new(tier, id));
            }
        }
        chain.fold_leading_stubs();
        Ok(pruned)
    }

    /// Drop front entries whose TTL has elapsed at `now`. Returns how many went.
    pub fn evict_expired(&self, tier: Tier, now: u64) -> Result<usize, StorageError> {
        let Some(ttl) = self.configs.get(tier).ttl_ms else {
            return Ok(0);
        };
        let log = self.persisted_log(tier);
        let mut chain = self.write(tier)?;
        let mut n = 0;
        loop {
            let Some((id, ts)) = chain.slots.front().map(|s| (s.entry_id(), s.timestamp())) else {
                break;
            };
            if ts.saturating_add(ttl) > now {
                break;
            }
            if let Some(log) = log {
                log.record(tier, &LogRecord::Evict { entry_id: id })?;
            }
            chain.evict_front();
            n += 1;
        }
        if n > 0 {
            debug!(tier = %tier, evicted = n, "ttl eviction");
        }
        Ok(n)
    }
}
