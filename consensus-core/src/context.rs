// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared per-node context handed to every protocol engine.

use crate::clock::RoundClock;
use crate::config::SimConfig;
use crate::crypto::{KeyStore, SecretKey};
use crate::message::Envelope;
use crate::types::NodeId;
use consensus_traits::Transport;
use log::{error, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Identity, configuration, and I/O handles of one simulated node.
pub struct EngineContext {
    pub node_id: NodeId,
    pub config: Arc<SimConfig>,
    pub secret: SecretKey,
    pub keys: Arc<KeyStore>,
    pub transport: Arc<dyn Transport>,
    pub cancel: CancellationToken,
    /// Signalled when a consensus round completes on this node.
    pub done: Arc<Notify>,
}

impl EngineContext {
    pub fn new(
        node_id: NodeId,
        config: Arc<SimConfig>,
        transport: Arc<dyn Transport>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        let secret = crate::crypto::derive_secret_key(config.key_seed, node_id)?;
        let keys = Arc::new(KeyStore::from_seed(config.key_seed, config.shard_size)?);
        Ok(Arc::new(EngineContext {
            node_id,
            config,
            secret,
            keys,
            transport,
            cancel,
            done: Arc::new(Notify::new()),
        }))
    }

    pub fn self_addr(&self) -> &str {
        self.config
            .peer_addr(self.node_id)
            .unwrap_or("<unknown>")
    }

    pub fn is_leader(&self) -> bool {
        self.config.is_leader(self.node_id)
    }

    /// Build a clock ticking at the configured round interval.
    pub fn new_clock(&self) -> Arc<RoundClock> {
        Arc::new(RoundClock::new(self.config.tick_interval()))
    }

    /// Fire-and-forget broadcast to every peer in the shard.
    pub async fn broadcast(&self, env: &Envelope) {
        let bytes = match env.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("node {}: failed to encode {}: {e:#}", self.node_id, env.kind);
                return;
            }
        };
        if let Err(e) = self
            .transport
            .broadcast(self.self_addr(), &self.config.peers, bytes)
            .await
        {
            warn!(
                "node {}: broadcast of {} failed: {e:#}",
                self.node_id, env.kind
            );
        }
    }

    /// Fire-and-forget send to one address.
    pub async fn send(&self, to: &str, env: &Envelope) {
        let bytes = match env.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("node {}: failed to encode {}: {e:#}", self.node_id, env.kind);
                return;
            }
        };
        if let Err(e) = self.transport.send(to, bytes).await {
            warn!(
                "node {}: send of {} to {to} failed: {e:#}",
                self.node_id, env.kind
            );
        }
    }

    /// Mark the current consensus round as finished on this node.
    pub fn signal_done(&self) {
        self.done.notify_one();
    }

    /// Run `fut` on the runtime, aborting it on shutdown.
    pub fn spawn_cancellable<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = fut => {}
            }
        });
    }
}
