// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! PBFT quorum thresholds with n = 4, f = 1: a replica claims its
//! commit broadcast at the (2f-1)-th prepare, the leader at the 2f-th,
//! and every node replies at the 2f-th commit. Duplicates never move a
//! counter.

use consensus_core::message::PhaseBody;
use consensus_core::pbft::PbftEngine;
use consensus_core::request::Request;
use consensus_core::testing::{test_config, test_context, MemHub};
use consensus_core::types::{Digest, NodeId, PayloadKind};
use tokio_util::sync::CancellationToken;

fn setup_engine(id: NodeId) -> PbftEngine {
    let config = test_config(4, 100);
    let hub = MemHub::new();
    let cancel = CancellationToken::new();
    let ctx = test_context(&config, id, &hub, &cancel).expect("context");
    PbftEngine::new(ctx)
}

fn sample_request() -> Request {
    Request::new(0, PayloadKind::Value, b"transfer 10".to_vec()).expect("request")
}

fn prepare(sender: NodeId, digest: Digest) -> PhaseBody {
    PhaseBody { sender, digest }
}

#[tokio::test]
async fn test_replica_commits_at_one_prepare() {
    let engine = setup_engine(1);
    let request = sample_request();
    let digest = request.digest;

    engine.on_pre_prepare(request).await;
    let snapshot = engine.slot_snapshot(&digest).expect("slot exists");
    assert!(snapshot.has_request);
    assert!(!snapshot.commit_broadcast);

    // 2f - 1 = 1 for a replica: the first prepare crosses the threshold.
    engine.on_prepare(prepare(2, digest)).await;
    let snapshot = engine.slot_snapshot(&digest).unwrap();
    assert_eq!(snapshot.prepares, 1);
    assert!(snapshot.commit_broadcast);
}

#[tokio::test]
async fn test_leader_waits_for_two_prepares() {
    let engine = setup_engine(0);
    let request = sample_request();
    let digest = request.digest;

    engine.on_pre_prepare(request).await;

    engine.on_prepare(prepare(1, digest)).await;
    let snapshot = engine.slot_snapshot(&digest).unwrap();
    assert_eq!(snapshot.prepares, 1);
    assert!(!snapshot.commit_broadcast, "2f = 2 for the leader");

    engine.on_prepare(prepare(2, digest)).await;
    let snapshot = engine.slot_snapshot(&digest).unwrap();
    assert_eq!(snapshot.prepares, 2);
    assert!(snapshot.commit_broadcast);
}

#[tokio::test]
async fn test_reply_claimed_at_two_commits() {
    let engine = setup_engine(1);
    let request = sample_request();
    let digest = request.digest;
    engine.on_pre_prepare(request).await;

    engine.on_commit(prepare(2, digest)).await;
    assert!(!engine.slot_snapshot(&digest).unwrap().replied);

    engine.on_commit(prepare(3, digest)).await;
    let snapshot = engine.slot_snapshot(&digest).unwrap();
    assert_eq!(snapshot.commits, 2);
    assert!(snapshot.replied);

    // Further commits are counted but the claim never re-fires.
    engine.on_commit(prepare(0, digest)).await;
    let snapshot = engine.slot_snapshot(&digest).unwrap();
    assert_eq!(snapshot.commits, 3);
    assert!(snapshot.replied);
}

#[tokio::test]
async fn test_duplicate_phase_messages_are_no_ops() {
    let engine = setup_engine(0);
    let request = sample_request();
    let digest = request.digest;
    engine.on_pre_prepare(request).await;

    engine.on_prepare(prepare(1, digest)).await;
    engine.on_prepare(prepare(1, digest)).await;
    engine.on_prepare(prepare(1, digest)).await;

    let snapshot = engine.slot_snapshot(&digest).unwrap();
    assert_eq!(snapshot.prepares, 1);
    assert!(!snapshot.commit_broadcast, "one sender cannot make a quorum");
}

#[tokio::test]
async fn test_out_of_order_messages_create_the_slot() {
    let engine = setup_engine(1);
    let digest = Digest::of(b"not seen yet");

    // Prepares and commits may arrive before the pre-prepare.
    engine.on_prepare(prepare(2, digest)).await;
    engine.on_commit(prepare(3, digest)).await;

    let snapshot = engine.slot_snapshot(&digest).expect("slot created lazily");
    assert!(!snapshot.has_request);
    assert_eq!(snapshot.prepares, 1);
    assert_eq!(snapshot.commits, 1);
}

#[tokio::test]
async fn test_tampered_pre_prepare_is_dropped() {
    let engine = setup_engine(1);
    let mut request = sample_request();
    request.content = b"transfer 9999".to_vec();
    let digest = request.digest;

    engine.on_pre_prepare(request).await;
    let snapshot = engine.slot_snapshot(&digest);
    assert!(
        snapshot.is_none() || !snapshot.unwrap().has_request,
        "a request with a stale digest must not enter a slot"
    );
}
