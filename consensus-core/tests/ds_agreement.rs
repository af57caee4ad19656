// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Dolev-Strong over the in-memory hub: every honest node extracts the
//! leader's value and decides it at round f+1; without a proposal the
//! whole shard decides the fallback value.

use consensus_core::engine::{Engine, EngineKind};
use consensus_core::message::{Envelope, InitBody, MessageKind};
use consensus_core::testing::{build_cluster, dispatch_all, leader_request, test_config, MemHub};
use consensus_core::types::FALLBACK_VALUE;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

const TICK_MS: u64 = 40;

fn init_envelope(start_time: SystemTime) -> Envelope {
    Envelope::new(MessageKind::Init, &InitBody { start_time }).expect("init envelope")
}

fn ds_engine(node: &consensus_core::testing::TestNode) -> &consensus_core::DsEngine {
    match &node.engine {
        Engine::Ds(ds) => ds,
        _ => panic!("expected a ds engine"),
    }
}

#[tokio::test]
async fn test_all_nodes_decide_the_leader_value() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = test_config(4, TICK_MS);
    let hub = MemHub::new();
    let cancel = CancellationToken::new();
    let nodes = build_cluster(EngineKind::Ds, &config, &hub, &cancel).expect("cluster");

    let start = SystemTime::now() + Duration::from_millis(50);
    dispatch_all(&nodes, &init_envelope(start)).await;

    let request = leader_request(&config, b"X").expect("request");
    let propose = Envelope::new(MessageKind::Propose, &request).expect("propose envelope");
    dispatch_all(&nodes, &propose).await;

    // Commit fires at (f+1)Δ = 2 ticks after the start.
    tokio::time::sleep(Duration::from_millis(500)).await;

    for node in &nodes {
        let ds = ds_engine(node);
        let extracted = ds.extracted_snapshot();
        assert_eq!(extracted.len(), 1, "node {}: {extracted:?}", node.id);
        assert!(extracted.contains(&b"X".to_vec()));
        assert_eq!(ds.decided(), Some(b"X".to_vec()), "node {}", node.id);
    }

    // Replaying the proposal after the decision changes nothing.
    dispatch_all(&nodes, &propose).await;
    // Neither does an init that tries to rewind the clock.
    dispatch_all(&nodes, &init_envelope(UNIX_EPOCH)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    for node in &nodes {
        let ds = ds_engine(node);
        assert_eq!(ds.extracted_snapshot().len(), 1, "node {}", node.id);
        assert_eq!(ds.decided(), Some(b"X".to_vec()), "node {}", node.id);
    }

    cancel.cancel();
}

#[tokio::test]
async fn test_silent_leader_decides_the_fallback() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = test_config(4, TICK_MS);
    let hub = MemHub::new();
    let cancel = CancellationToken::new();
    let nodes = build_cluster(EngineKind::Ds, &config, &hub, &cancel).expect("cluster");

    let start = SystemTime::now() + Duration::from_millis(50);
    dispatch_all(&nodes, &init_envelope(start)).await;

    tokio::time::sleep(Duration::from_millis(400)).await;

    for node in &nodes {
        let ds = ds_engine(node);
        assert!(ds.extracted_snapshot().is_empty(), "node {}", node.id);
        assert_eq!(
            ds.decided(),
            Some(FALLBACK_VALUE.to_vec()),
            "node {}",
            node.id
        );
    }

    cancel.cancel();
}

#[tokio::test]
async fn test_unsigned_proposal_is_ignored() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = test_config(4, TICK_MS);
    let hub = MemHub::new();
    let cancel = CancellationToken::new();
    let nodes = build_cluster(EngineKind::Ds, &config, &hub, &cancel).expect("cluster");

    let start = SystemTime::now() + Duration::from_millis(50);
    dispatch_all(&nodes, &init_envelope(start)).await;

    let mut request = leader_request(&config, b"X").expect("request");
    request.sig = None;
    let propose = Envelope::new(MessageKind::Propose, &request).expect("propose envelope");
    dispatch_all(&nodes, &propose).await;

    tokio::time::sleep(Duration::from_millis(400)).await;

    for node in &nodes {
        let ds = ds_engine(node);
        assert!(ds.extracted_snapshot().is_empty(), "node {}", node.id);
        assert_eq!(ds.decided(), Some(FALLBACK_VALUE.to_vec()));
    }

    cancel.cancel();
}
