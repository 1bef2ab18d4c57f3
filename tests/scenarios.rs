use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tiered_ledger::error::{ChainIntegrityError, StorageError, WitnessError};
use tiered_ledger::promotion::CONSOLIDATION_KIND;
use tiered_ledger::tensor::T3_ROOTS;
use tiered_ledger::validation::{Ed25519Signer, Signer, sign_content};
use tiered_ledger::{
    AckOutcome, Dimension, EntryContent, EntryRef, LedgerConfig, LedgerError, LedgerNode, ManualClock, NewEntry,
    Root, TensorKey, Tier, WitnessType,
};

fn key(seed: u8) -> Ed25519Signer {
    Ed25519Signer::from_secret(&[seed; 32]).expect("32-byte secret")
}

fn new_node(clock: &Arc<ManualClock>) -> LedgerNode {
    LedgerNode::in_memory("node", LedgerConfig::default(), Arc::new(key(200)), clock.clone()).expect("node")
}

fn signed(author: &Ed25519Signer, author_id: &str, content: EntryContent) -> NewEntry {
    let sig = sign_content(author, &content, author_id);
    NewEntry::new(content, author_id).with_signature(sig)
}

/// Register a witness and feed it good outcomes until its trust clears the bar.
fn trusted_witness(node: &LedgerNode, clock: &ManualClock, id: &str, seed: u8) -> Ed25519Signer {
    let k = key(seed);
    node.register_witness(id, k.public_key(), ["governance"]);
    for _ in 0..10 {
        for r in T3_ROOTS {
            node.record_outcome(TensorKey::entity(id), Dimension::Root(r), 0.95, 1.0)
                .expect("outcome");
        }
        clock.advance(1);
    }
    assert!(node.get_tensor(id).t3_score >= 0.7);
    k
}

fn trusted_panel(node: &LedgerNode, clock: &ManualClock, n: u8) -> Vec<(String, Ed25519Signer)> {
    (0..n)
        .map(|i| {
            let id = format!("w{}", i);
            let k = trusted_witness(node, clock, &id, 10 + i);
            (id, k)
        })
        .collect()
}

/// Scores significant, anomalous and relevant under a "governance" context.
fn weighty(kind: &str, payload: Vec<u8>) -> EntryContent {
    EntryContent::new(kind, payload)
        .with_tags(["governance"])
        .with_impact(1.0)
        .with_deviation(0.9)
}

/// Every listed witness acks `entry` in turn; returns the outcomes.
fn witness_all(
    node: &LedgerNode,
    clock: &ManualClock,
    entry: EntryRef,
    author: &Ed25519Signer,
    panel: &[(String, Ed25519Signer)],
) -> Vec<AckOutcome> {
    clock.advance(1);
    let mark = node.create_mark(entry, author).expect("mark");
    panel
        .iter()
        .map(|(id, k)| {
            let ack = node
                .acknowledge(&mark, id, WitnessType::Audit, true, k)
                .expect("ack");
            node.record_ack(ack).expect("record")
        })
        .collect()
}

fn queued(outcomes: &[AckOutcome]) -> Vec<bool> {
    outcomes
        .iter()
        .map(|o| matches!(o, AckOutcome::Accepted { promotion_queued: true, .. }))
        .collect()
}

#[test]
fn policy_change_needs_five_acks_before_promotion() {
    let clock = Arc::new(ManualClock::new(10_000));
    let node = new_node(&clock);
    let alice = key(1);
    node.register_entity("alice", alice.public_key());
    let witnesses = trusted_panel(&node, &clock, 5);

    let content = EntryContent::new("policy_change", b"raise quorum".to_vec())
        .with_tags(["governance"])
        .with_impact(1.0);
    let sub = node
        .submit(Tier::Leaf, signed(&alice, "alice", content))
        .expect("submit");
    assert_eq!(sub.score, 5);
    let req = sub.witness_request.expect("witness request");
    assert_eq!(req.required, 5);
    assert_eq!(req.candidates.len(), 5);

    clock.advance(5);
    let mark = node.create_mark(req.entry, &alice).expect("mark");
    for (i, (id, k)) in witnesses.iter().enumerate() {
        let ack = node
            .acknowledge(&mark, id, WitnessType::Audit, true, k)
            .expect("ack");
        let outcome = node.record_ack(ack).expect("record");
        let expected_queued = i == 4;
        assert_eq!(
            outcome,
            AckOutcome::Accepted {
                ack_count: i + 1,
                promotion_queued: expected_queued
            }
        );
        if i == 3 {
            assert_eq!(node.scan_promotions(Tier::Leaf).expect("scan"), 0);
        }
    }

    let batches = node.process_promotions().expect("promote");
    assert_eq!(batches.len(), 1);
    let stem = &batches[0].consolidated;
    assert_eq!(stem.tier, Tier::Stem);
    assert_eq!(stem.content.kind, CONSOLIDATION_KIND);
    assert_eq!(stem.source_entries, vec![req.entry]);
    assert_eq!(node.promoted_to(req.entry), Some(stem.entry_ref()));
    assert!(node.verify_chain(Tier::Stem, ..).expect("verify").is_valid());
    // Author credited on veracity, witnesses on their rule dimension.
    assert!(node.get_tensor("alice").v3_score > 0.5);
}

#[test]
fn sybil_ring_never_reaches_promotion() {
    let clock = Arc::new(ManualClock::new(10_000));
    let node = new_node(&clock);
    let ring: Vec<(String, Ed25519Signer)> = (0..10u8)
        .map(|i| {
            let id = format!("sybil{}", i);
            let k = key(50 + i);
            node.register_witness(id.as_str(), k.public_key(), ["ops"]);
            (id, k)
        })
        .collect();

    let mut submitted = Vec::new();
    for (i, (id, k)) in ring.iter().enumerate() {
        let content = EntryContent::new("observation", vec![i as u8])
            .with_tags(["ops"])
            .with_impact(2.0)
            .with_deviation(0.9);
        let sub = node.submit(Tier::Leaf, signed(k, id, content)).expect("submit");
        let req = sub.witness_request.expect("retained entries ask for witnesses");
        assert!(req.candidates.is_empty(), "no ring member clears the trust filter");
        submitted.push((sub.entry.entry_ref(), id.clone()));
    }

    clock.advance(10);
    for (r, author) in &submitted {
        let author_key = &ring.iter().find(|(id, _)| id == author).expect("member").1;
        let mark = node.create_mark(*r, author_key).expect("mark");
        for (id, k) in ring.iter().filter(|(id, _)| id != author) {
            let ack = node
                .acknowledge(&mark, id, WitnessType::Existence, true, k)
                .expect("ack");
            assert!(matches!(
                node.record_ack(ack).expect("record"),
                AckOutcome::Rejected(WitnessError::Ineligible { .. })
            ));
        }
        assert_eq!(node.ack_count(*r), 0);
    }
    assert_eq!(node.scan_promotions(Tier::Leaf).expect("scan"), 0);
    assert!(node.process_promotions().expect("promote").is_empty());
    assert_eq!(node.store().len(Tier::Stem).expect("len"), 0);
}

#[test]
fn tampered_middle_entry_is_reported_at_its_own_position() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(1_000));
    let alice = key(1);
    {
        let node = LedgerNode::open("node", LedgerConfig::default(), Arc::new(key(200)), clock.clone(), dir.path())
            .expect("open");
        node.register_entity("alice", alice.public_key());
        for p in [b"e1", b"e2", b"e3"] {
            node.submit(Tier::Leaf, signed(&alice, "alice", EntryContent::new("observation", p.to_vec())))
                .expect("submit");
        }
        assert!(node.verify_chain(Tier::Leaf, ..).expect("verify").is_valid());
    }

    let log = dir.path().join("tiers").join("leaf.jsonl");
    let text = fs::read_to_string(&log).expect("read log");
    let mut lines: Vec<serde_json::Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).expect("json line"))
        .collect();
    lines[1]["entry"]["content"]["payload"] = serde_json::Value::String(hex::encode(b"E2"));
    let rewritten: Vec<String> = lines.iter().map(|v| v.to_string()).collect();
    fs::write(&log, rewritten.join("\n") + "\n").expect("write log");

    let err = LedgerNode::open("node", LedgerConfig::default(), Arc::new(key(200)), clock, dir.path())
        .err()
        .expect("corrupt log must not open");
    match err {
        LedgerError::Storage(StorageError::CorruptLog { tier, source }) => {
            assert_eq!(tier, Tier::Leaf);
            assert_eq!(
                source,
                ChainIntegrityError::ContentHashMismatch {
                    tier: Tier::Leaf,
                    entry_id: 1
                }
            );
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn reopen_restores_chains_and_tensors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(1_000));
    let alice = key(1);
    let trust = {
        let node = LedgerNode::open("node", LedgerConfig::default(), Arc::new(key(200)), clock.clone(), dir.path())
            .expect("open");
        node.register_entity("alice", alice.public_key());
        node.submit(Tier::Leaf, signed(&alice, "alice", EntryContent::new("pattern", b"p".to_vec())))
            .expect("submit");
        node.submit(Tier::Compost, NewEntry::new(EntryContent::new("raw", b"r".to_vec()), "sensor"))
            .expect("submit");
        let s = node
            .record_outcome(TensorKey::entity("alice"), Dimension::Root(tiered_ledger::Root::Talent), 0.9, 1.0)
            .expect("outcome");
        node.persist_tensors().expect("persist");
        s.t3_score
    };

    let node = LedgerNode::open("node", LedgerConfig::default(), Arc::new(key(200)), clock, dir.path())
        .expect("reopen");
    assert_eq!(node.store().live_len(Tier::Leaf).expect("len"), 1);
    // Compost is memory-only.
    assert_eq!(node.store().live_len(Tier::Compost).expect("len"), 0);
    assert!(node.verify_chain(Tier::Leaf, ..).expect("verify").is_valid());
    assert_eq!(node.get_tensor("alice").t3_score, trust);
}

#[test]
fn compost_stays_within_capacity_and_evicts_oldest_first() {
    let clock = Arc::new(ManualClock::new(1_000));
    let node = new_node(&clock);
    for i in 0..1_500u32 {
        node.submit(Tier::Compost, NewEntry::new(EntryContent::new("raw", i.to_le_bytes().to_vec()), "sensor"))
            .expect("submit");
        assert!(node.store().len(Tier::Compost).expect("len") <= 1_000);
    }
    let live = node.store().live_entries(Tier::Compost).expect("live");
    assert_eq!(live.len(), 1_000);
    assert_eq!(live[0].entry_id, 500);
    assert_eq!(live[999].entry_id, 1_499);
    assert!(node.get_entry(Tier::Compost, 499).expect("get").is_none());
    assert!(node.verify_chain(Tier::Compost, ..).expect("verify").is_valid());

    clock.advance(60_001);
    node.prune(Tier::Compost).expect("prune");
    assert_eq!(node.store().live_len(Tier::Compost).expect("len"), 0);
}

#[test]
fn consolidated_stem_entry_needs_two_acks_to_reach_root() {
    let clock = Arc::new(ManualClock::new(10_000));
    let node = new_node(&clock);
    node.set_context(["governance"]);
    let alice = key(1);
    node.register_entity("alice", alice.public_key());
    let panel = trusted_panel(&node, &clock, 2);

    let leaf = node
        .submit(Tier::Leaf, signed(&alice, "alice", weighty("law", b"l".to_vec())))
        .expect("submit");
    let outcomes = witness_all(&node, &clock, leaf.entry.entry_ref(), &alice, &panel[..1]);
    assert_eq!(queued(&outcomes), vec![true]);
    let stem = node.process_promotions().expect("promote")[0].consolidated.clone();
    assert_eq!((stem.tier, stem.content.kind.as_str()), (Tier::Stem, CONSOLIDATION_KIND));
    assert_eq!(node.retention().score(&stem), 8);

    let node_key = key(200);
    let first = witness_all(&node, &clock, stem.entry_ref(), &node_key, &panel[..1]);
    assert_eq!(queued(&first), vec![false]);
    assert_eq!(node.scan_promotions(Tier::Stem).expect("scan"), 0);
    let second = witness_all(&node, &clock, stem.entry_ref(), &node_key, &panel[1..]);
    assert_eq!(
        second,
        vec![AckOutcome::Accepted {
            ack_count: 2,
            promotion_queued: true
        }]
    );

    let batches = node.process_promotions().expect("promote");
    let root = &batches[0].consolidated;
    assert_eq!(root.tier, Tier::Root);
    assert_eq!(root.source_entries, vec![stem.entry_ref()]);
    assert_eq!(node.promoted_to(stem.entry_ref()), Some(root.entry_ref()));
    assert!(node.verify_chain(Tier::Root, ..).expect("verify").is_valid());
}

#[test]
fn root_only_grows() {
    let clock = Arc::new(ManualClock::new(1_000));
    let node = new_node(&clock);
    node.set_context(["governance"]);
    let alice = key(1);
    node.register_entity("alice", alice.public_key());
    let panel = trusted_panel(&node, &clock, 2);
    let node_key = key(200);
    for i in 0..5u8 {
        let leaf = node
            .submit(Tier::Leaf, signed(&alice, "alice", weighty("law", vec![i])))
            .expect("submit");
        witness_all(&node, &clock, leaf.entry.entry_ref(), &alice, &panel[..1]);
        let stem = node.process_promotions().expect("to stem")[0].consolidated.clone();
        witness_all(&node, &clock, stem.entry_ref(), &node_key, &panel);
        assert_eq!(node.process_promotions().expect("to root").len(), 1);
    }
    assert_eq!(node.store().live_len(Tier::Root).expect("len"), 5);

    clock.advance(10 * 365 * 86_400_000);
    node.end_session();
    node.prune_all().expect("prune");
    assert_eq!(node.store().live_len(Tier::Root).expect("len"), 5);
    let d = node.digest(Tier::Root).expect("digest");
    assert_eq!((d.first_id, d.last_id, d.count), (Some(0), Some(4), 5));
}

#[test]
fn pruned_sources_release_marks_and_promotion_records() {
    let clock = Arc::new(ManualClock::new(1_000));
    let node = new_node(&clock);
    node.set_context(["governance"]);
    let alice = key(1);
    node.register_entity("alice", alice.public_key());
    let panel = trusted_panel(&node, &clock, 1);
    let leaf = node
        .submit(Tier::Leaf, signed(&alice, "alice", weighty("observation", b"o".to_vec())))
        .expect("submit");
    let source = leaf.entry.entry_ref();
    witness_all(&node, &clock, source, &alice, &panel);
    node.process_promotions().expect("promote");
    assert!(node.promoted_to(source).is_some());
    assert_eq!(node.witnesses().mark_count(), 1);
    assert_eq!(node.retention().tracked_references(), 1);

    // Past the Leaf TTL.
    clock.advance(4 * 60 * 60 * 1_000 + 1);
    assert_eq!(node.prune(Tier::Leaf).expect("prune"), 1);
    assert_eq!(node.promoted_to(source), None);
    assert_eq!(node.ack_count(source), 0);
    assert_eq!(node.witnesses().mark_count(), 0);
    assert_eq!(node.retention().tracked_references(), 0);
    assert_eq!(node.store().live_len(Tier::Stem).expect("len"), 1);
}

#[test]
fn concurrent_acks_on_one_entry_are_counted_exactly_once_each() {
    let clock = Arc::new(ManualClock::new(10_000));
    let node = new_node(&clock);
    let alice = key(1);
    node.register_entity("alice", alice.public_key());
    let panel = trusted_panel(&node, &clock, 8);
    let content = EntryContent::new("policy_change", b"p".to_vec())
        .with_tags(["governance"])
        .with_impact(1.0);
    let entry = node
        .submit(Tier::Leaf, signed(&alice, "alice", content))
        .expect("submit")
        .entry
        .entry_ref();
    clock.advance(1);
    let mark = node.create_mark(entry, &alice).expect("mark");
    let acks: Vec<_> = panel
        .iter()
        .map(|(id, k)| {
            node.acknowledge(&mark, id, WitnessType::Audit, true, k)
                .expect("ack")
        })
        .collect();

    // Every ack is offered twice, from two threads.
    let outcomes: Vec<AckOutcome> = thread::scope(|s| {
        let handles: Vec<_> = acks
            .iter()
            .chain(acks.iter())
            .map(|ack| {
                let node = &node;
                let ack = ack.clone();
                s.spawn(move || node.record_ack(ack).expect("record"))
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("thread")).collect()
    });

    let mut counts: Vec<usize> = outcomes
        .iter()
        .filter_map(|o| match o {
            AckOutcome::Accepted { ack_count, .. } => Some(*ack_count),
            AckOutcome::Rejected(_) => None,
        })
        .collect();
    counts.sort_unstable();
    assert_eq!(counts, (1..=8).collect::<Vec<_>>());
    let duplicates = outcomes
        .iter()
        .filter(|o| matches!(o, AckOutcome::Rejected(WitnessError::DuplicateAck { .. })))
        .count();
    assert_eq!(duplicates, 8);
    assert_eq!(queued(&outcomes).iter().filter(|q| **q).count(), 1);
    assert_eq!(node.ack_count(entry), 8);
}

#[test]
fn concurrent_observations_stay_per_entity() {
    let clock = Arc::new(ManualClock::new(1_000));
    let node = new_node(&clock);
    thread::scope(|s| {
        for i in 0..8 {
            let node = &node;
            s.spawn(move || {
                let own = TensorKey::entity(format!("e{}", i));
                for _ in 0..50 {
                    node.record_outcome(own.clone(), Dimension::Root(Root::Talent), 0.9, 1.0)
                        .expect("own");
                    node.record_outcome(TensorKey::entity("shared"), Dimension::Root(Root::Training), 0.6, 1.0)
                        .expect("shared");
                }
            });
        }
    });

    let reference = new_node(&clock);
    for _ in 0..50 {
        reference
            .record_outcome(TensorKey::entity("solo"), Dimension::Root(Root::Talent), 0.9, 1.0)
            .expect("solo");
    }
    let expected = reference.get_tensor("solo");
    for i in 0..8 {
        let got = node.get_tensor(&format!("e{}", i));
        assert_eq!(got.t3.root(Root::Talent), expected.t3.root(Root::Talent));
        assert_eq!(got.t3_score, expected.t3_score);
    }
    let shared = node.get_tensor("shared");
    assert_eq!(shared.t3.root(Root::Training).expect("training").count, 400);
}

#[test]
fn promotion_worker_keeps_up_while_appends_continue() {
    let clock = Arc::new(ManualClock::new(10_000));
    let node = new_node(&clock);
    node.set_context(["governance"]);
    let alice = key(1);
    node.register_entity("alice", alice.public_key());
    let panel = trusted_panel(&node, &clock, 1);
    let worker = node.spawn_promotion_worker().expect("worker");
    assert!(node.process_promotions().expect("inline").is_empty());

    let sources: Vec<EntryRef> = thread::scope(|s| {
        let node = &node;
        s.spawn(move || {
            for i in 0..300u32 {
                node.submit(Tier::Compost, NewEntry::new(EntryContent::new("raw", i.to_le_bytes().to_vec()), "sensor"))
                    .expect("compost");
            }
        });
        let mut sources = Vec::new();
        for i in 0..10u8 {
            let leaf = node
                .submit(Tier::Leaf, signed(&alice, "alice", weighty("observation", vec![i])))
                .expect("leaf");
            let outcomes = witness_all(node, &clock, leaf.entry.entry_ref(), &alice, &panel);
            assert_eq!(queued(&outcomes), vec![true]);
            // A scan racing the worker must not promote anything twice.
            node.scan_promotions(Tier::Leaf).expect("scan");
            sources.push(leaf.entry.entry_ref());
        }
        sources
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    while sources.iter().any(|r| node.promoted_to(*r).is_none()) {
        assert!(Instant::now() < deadline, "promotion worker stalled");
        thread::sleep(Duration::from_millis(5));
    }
    assert!(!worker.is_finished());
    let stem = node.store().live_entries(Tier::Stem).expect("stem");
    let promoted: usize = stem.iter().map(|e| e.source_entries.len()).sum();
    assert_eq!(promoted, 10);
    assert_eq!(node.store().len(Tier::Compost).expect("len"), 300);
    for tier in [Tier::Compost, Tier::Leaf, Tier::Stem] {
        assert!(node.verify_chain(tier, ..).expect("verify").is_valid());
    }
}
