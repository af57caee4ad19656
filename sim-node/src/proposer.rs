// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Leader-side driver turning injected values into protocol instances.
//!
//! Values queue up and run one at a time. PBFT serializes rounds inside
//! the engine, so a value is simply handed to it; the round-based
//! protocols first announce a fresh start time, sleep until it, and
//! then propose, waiting for the round window to elapse before the next
//! value.

use anyhow::Result;
use consensus_core::engine::{Engine, EngineKind};
use consensus_core::message::{Envelope, InitBody, MessageKind};
use consensus_core::request::Request;
use consensus_core::types::PayloadKind;
use consensus_core::EngineContext;
use log::{info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::Notify;

#[derive(Clone)]
pub struct Proposer {
    ctx: Arc<EngineContext>,
    engine: Engine,
    queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    ready: Arc<Notify>,
}

impl Proposer {
    pub fn new(ctx: Arc<EngineContext>, engine: Engine) -> Self {
        Proposer {
            ctx,
            engine,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            ready: Arc::new(Notify::new()),
        }
    }

    /// Queue a value for proposal. Only meaningful on the view node.
    pub fn inject(&self, value: Vec<u8>) {
        if !self.ctx.is_leader() {
            warn!(
                "node {}: ignoring injected value, not the view node",
                self.ctx.node_id
            );
            return;
        }
        self.queue.lock().unwrap().push_back(value);
        self.ready.notify_one();
    }

    pub fn start(&self) {
        if !self.ctx.is_leader() {
            return;
        }
        let this = self.clone();
        self.ctx.spawn_cancellable(async move { this.run().await });
    }

    async fn run(self) {
        loop {
            let value = loop {
                let next = self.queue.lock().unwrap().pop_front();
                match next {
                    Some(value) => break value,
                    None => self.ready.notified().await,
                }
            };
            if let Err(e) = self.propose(value).await {
                warn!("node {}: proposal failed: {e:#}", self.ctx.node_id);
            }
        }
    }

    async fn propose(&self, value: Vec<u8>) -> Result<()> {
        info!(
            "node {}: proposing {:?}",
            self.ctx.node_id,
            String::from_utf8_lossy(&value)
        );
        let kind = if self.engine.kind() == EngineKind::Pbft {
            PayloadKind::Value
        } else {
            PayloadKind::Block
        };
        match self.engine.kind() {
            EngineKind::Pbft => {
                let request = Request::signed(
                    self.ctx.config.shard_id,
                    kind,
                    value,
                    &self.ctx.secret,
                )?;
                let env = Envelope::new(MessageKind::Propose, &request)?;
                self.engine.dispatch(&env).await;
            }
            EngineKind::Ds | EngineKind::Tbb => {
                let start_time = SystemTime::now() + self.ctx.config.start_time_wait();
                let init = Envelope::new(MessageKind::Init, &InitBody { start_time })?;
                self.ctx.broadcast(&init).await;
                if let Some(client) = self.ctx.config.client_addr.clone() {
                    self.ctx.send(&client, &init).await;
                }
                self.engine.dispatch(&init).await;

                if let Ok(lead) = start_time.duration_since(SystemTime::now()) {
                    tokio::time::sleep(lead).await;
                }

                let request = Request::signed(
                    self.ctx.config.shard_id,
                    kind,
                    value,
                    &self.ctx.secret,
                )?;
                let env = Envelope::new(MessageKind::Propose, &request)?;
                self.ctx.broadcast(&env).await;
                self.engine.dispatch(&env).await;

                // The round window must elapse before the next value can
                // reuse the shard.
                self.ctx.done.notified().await;
                self.announce_done().await;
            }
        }
        Ok(())
    }

    async fn announce_done(&self) {
        info!("node {}: consensus round finished", self.ctx.node_id);
        let Some(client) = self.ctx.config.client_addr.clone() else {
            return;
        };
        match Envelope::new(MessageKind::ConsensusDone, &()) {
            Ok(env) => self.ctx.send(&client, &env).await,
            Err(e) => warn!("node {}: {e:#}", self.ctx.node_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consensus_core::testing::{test_config, test_context, MemHub};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_non_leader_drops_injected_values() {
        let config = test_config(4, 50);
        let hub = MemHub::new();
        let cancel = CancellationToken::new();
        let ctx = test_context(&config, 1, &hub, &cancel).unwrap();
        let engine = Engine::new(EngineKind::Ds, Arc::clone(&ctx));
        let proposer = Proposer::new(ctx, engine);

        proposer.inject(b"X".to_vec());
        assert!(proposer.queue.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_leader_queues_injected_values_in_order() {
        let config = test_config(4, 50);
        let hub = MemHub::new();
        let cancel = CancellationToken::new();
        let ctx = test_context(&config, 0, &hub, &cancel).unwrap();
        let engine = Engine::new(EngineKind::Ds, Arc::clone(&ctx));
        let proposer = Proposer::new(ctx, engine);

        proposer.inject(b"first".to_vec());
        proposer.inject(b"second".to_vec());
        let queued: Vec<_> = proposer.queue.lock().unwrap().iter().cloned().collect();
        assert_eq!(queued, vec![b"first".to_vec(), b"second".to_vec()]);
    }
}
