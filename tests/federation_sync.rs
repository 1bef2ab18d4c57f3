#![cfg(feature = "federation")]

use std::sync::Arc;
use tiered_ledger::federation::{FederationSync, LocalPeer};
use tiered_ledger::merkle::verify_proof;
use tiered_ledger::tensor::T3_ROOTS;
use tiered_ledger::validation::{Ed25519Signer, Signer, sign_content};
use tiered_ledger::{
    AckOutcome, Dimension, EntryContent, LedgerConfig, LedgerNode, ManualClock, NewEntry, TensorKey, Tier,
    WitnessType,
};

fn node(id: &str, seed: u8) -> (Arc<LedgerNode>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(5_000));
    let signer = Arc::new(Ed25519Signer::from_secret(&[seed; 32]).expect("key"));
    let n = LedgerNode::in_memory(id, LedgerConfig::default(), signer, clock.clone()).expect("node");
    (Arc::new(n), clock)
}

/// Leaf entry by `carol`, witnessed once by `w`, then promoted to Stem.
fn promote_one(n: &LedgerNode, clock: &ManualClock, carol: &Ed25519Signer, w: &Ed25519Signer, payload: u8) {
    let content = EntryContent::new("observation", vec![payload])
        .with_tags(["ops"])
        .with_impact(1.0)
        .with_deviation(0.9);
    let sig = sign_content(carol, &content, "carol");
    let sub = n
        .submit(Tier::Leaf, NewEntry::new(content, "carol").with_signature(sig))
        .expect("submit");
    assert!(sub.score >= 5);
    clock.advance(1);
    let mark = n.create_mark(sub.entry.entry_ref(), carol).expect("mark");
    let ack = n.acknowledge(&mark, "w", WitnessType::Audit, true, w).expect("ack");
    assert_eq!(
        n.record_ack(ack).expect("record"),
        AckOutcome::Accepted {
            ack_count: 1,
            promotion_queued: true
        }
    );
    assert_eq!(n.process_promotions().expect("promote").len(), 1);
}

#[tokio::test]
async fn replicated_stem_entries_keep_their_proofs() {
    let (a, clock) = node("node-a", 1);
    a.set_context(["ops"]);
    let carol = Ed25519Signer::from_secret(&[9; 32]).expect("key");
    a.register_entity("carol", carol.public_key());
    let w = Ed25519Signer::from_secret(&[10; 32]).expect("key");
    for _ in 0..10 {
        for r in T3_ROOTS {
            a.record_outcome(TensorKey::entity("w"), Dimension::Root(r), 0.95, 1.0)
                .expect("outcome");
        }
        clock.advance(1);
    }
    a.register_witness("w", w.public_key(), ["ops"]);
    for i in 0..4u8 {
        promote_one(&a, &clock, &carol, &w, i);
    }
    assert_eq!(a.store().live_len(Tier::Stem).expect("len"), 4);

    let digest = a.digest(Tier::Stem).expect("digest");
    let (proof, root) = a.merkle_proof(Tier::Stem, 2).expect("proof").expect("present");
    assert_eq!(root, digest.root);

    let (b, _) = node("node-b", 2);
    let sync = FederationSync::new(b);
    let peer = LocalPeer::new(a);
    let first = sync.sync(&peer).await.expect("sync");
    assert_eq!(first.fetched, 4);

    let replica = sync.replicas().from_peer("node-a");
    assert_eq!(replica.len(), 4);
    assert!(replica.iter().all(|e| e.author_id == "node-a" && e.source_entries.len() == 1));
    assert!(verify_proof(2, &replica[2].content_hash, &root, &proof));

    let again = sync.sync(&peer).await.expect("resync");
    assert_eq!((again.fetched, again.already_known), (0, 4));
    assert_eq!(sync.replicas().len(), 4);
}
