// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-memory transport and cluster builders for tests.
//!
//! The hub routes frames between registered addresses over unbounded
//! channels; a cluster wires one engine per node to the hub and pumps
//! its inbox into the engine's dispatcher.

use crate::config::SimConfig;
use crate::context::EngineContext;
use crate::crypto::derive_secret_key;
use crate::engine::{Engine, EngineKind};
use crate::message::Envelope;
use crate::request::Request;
use crate::types::{NodeId, PayloadKind};
use anyhow::Result;
use async_trait::async_trait;
use consensus_traits::Transport;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Message router between in-process nodes.
#[derive(Default)]
pub struct MemHub {
    inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl MemHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an address and get its inbox.
    pub fn register(&self, addr: &str) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().unwrap().insert(addr.to_string(), tx);
        rx
    }

    fn deliver(&self, addr: &str, bytes: Vec<u8>) {
        let sender = self.inboxes.lock().unwrap().get(addr).cloned();
        match sender {
            Some(tx) => {
                let _ = tx.send(bytes);
            }
            None => debug!("memhub: no inbox registered for {addr}"),
        }
    }
}

/// [`Transport`] over a [`MemHub`].
#[derive(Clone)]
pub struct MemTransport {
    hub: Arc<MemHub>,
}

impl MemTransport {
    pub fn new(hub: Arc<MemHub>) -> Arc<Self> {
        Arc::new(MemTransport { hub })
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn broadcast(
        &self,
        from: &str,
        peers: &[String],
        bytes: Vec<u8>,
    ) -> Result<(), consensus_traits::Error> {
        for peer in peers.iter().filter(|p| p.as_str() != from) {
            self.hub.deliver(peer, bytes.clone());
        }
        Ok(())
    }

    async fn send(&self, to: &str, bytes: Vec<u8>) -> Result<(), consensus_traits::Error> {
        self.hub.deliver(to, bytes);
        Ok(())
    }
}

/// One in-process simulated node.
pub struct TestNode {
    pub id: NodeId,
    pub addr: String,
    pub engine: Engine,
    pub ctx: Arc<EngineContext>,
}

/// Config for an in-process shard with logical addresses.
pub fn test_config(n: usize, tick_ms: u64) -> SimConfig {
    SimConfig {
        shard_size: n,
        tick_interval_ms: tick_ms,
        start_time_wait_ms: 50,
        peers: (0..n).map(|i| format!("node-{i}")).collect(),
        ..SimConfig::default()
    }
}

/// Build a context for one node attached to the hub, without an engine
/// or an inbox pump.
pub fn test_context(
    config: &SimConfig,
    id: NodeId,
    hub: &Arc<MemHub>,
    cancel: &CancellationToken,
) -> Result<Arc<EngineContext>> {
    EngineContext::new(
        id,
        Arc::new(config.clone()),
        MemTransport::new(Arc::clone(hub)),
        cancel.clone(),
    )
}

/// Build a full cluster: one engine per node, each with an inbox pump
/// feeding its dispatcher. Must run inside a tokio runtime.
pub fn build_cluster(
    kind: EngineKind,
    config: &SimConfig,
    hub: &Arc<MemHub>,
    cancel: &CancellationToken,
) -> Result<Vec<TestNode>> {
    config.validate()?;
    let mut nodes = Vec::with_capacity(config.shard_size);
    for id in 0..config.shard_size as NodeId {
        let ctx = test_context(config, id, hub, cancel)?;
        let engine = Engine::new(kind, Arc::clone(&ctx));
        engine.start();

        let addr = ctx.self_addr().to_string();
        let mut inbox = hub.register(&addr);
        let pump_engine = engine.clone();
        let pump_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => return,
                    frame = inbox.recv() => {
                        let Some(bytes) = frame else { return };
                        match Envelope::from_bytes(&bytes) {
                            Ok(env) => pump_engine.dispatch(&env).await,
                            Err(e) => debug!("dropping undecodable frame: {e:#}"),
                        }
                    }
                }
            }
        });

        nodes.push(TestNode {
            id,
            addr,
            engine,
            ctx,
        });
    }
    Ok(nodes)
}

/// Deliver an envelope to every node in the cluster, leader included.
pub async fn dispatch_all(nodes: &[TestNode], env: &Envelope) {
    for node in nodes {
        node.engine.dispatch(env).await;
    }
}

/// A request signed by the shard's view node.
pub fn leader_request(config: &SimConfig, value: &[u8]) -> Result<Request> {
    let secret = derive_secret_key(config.key_seed, config.view_node)?;
    Request::signed(config.shard_id, PayloadKind::Value, value.to_vec(), &secret)
        .map_err(Into::into)
}
