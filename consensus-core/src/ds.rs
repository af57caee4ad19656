// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Dolev-Strong broadcast with signature chains.
//!
//! The leader's proposal enters every honest node's extracted set; each
//! relay appends its own signature and re-broadcasts, and a chain of
//! length k is only forwarded once the local clock has reached round k.
//! At round f+1 a node commits the extracted singleton, or the fallback
//! value if the set is not a singleton.

use crate::clock::RoundClock;
use crate::context::EngineContext;
use crate::crypto::dst;
use crate::message::{ChainLink, Envelope, MessageKind, QueryBody, ReplyQueryBody, SignatureChain};
use crate::request::Request;
use crate::types::{Round, FALLBACK_VALUE};
use consensus_traits::VerifyError;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct DsEngine {
    ctx: Arc<EngineContext>,
    clock: Arc<RoundClock>,
    /// Values extracted from valid chains (set C in the hybrid).
    extracted: Arc<Mutex<BTreeSet<Vec<u8>>>>,
    decided: Arc<Mutex<Option<Vec<u8>>>>,
    /// Whether this instance owns the round-done timer. The hybrid
    /// composition arms its own instead.
    drive_done: bool,
}

impl DsEngine {
    pub fn new(ctx: Arc<EngineContext>, clock: Arc<RoundClock>, drive_done: bool) -> Self {
        DsEngine {
            ctx,
            clock,
            extracted: Arc::new(Mutex::new(BTreeSet::new())),
            decided: Arc::new(Mutex::new(None)),
            drive_done,
        }
    }

    /// Handle to the extracted set, shared with the hybrid composition.
    pub fn extracted_handle(&self) -> Arc<Mutex<BTreeSet<Vec<u8>>>> {
        Arc::clone(&self.extracted)
    }

    pub fn decided(&self) -> Option<Vec<u8>> {
        self.decided.lock().unwrap().clone()
    }

    pub fn extracted_snapshot(&self) -> BTreeSet<Vec<u8>> {
        self.extracted.lock().unwrap().clone()
    }

    fn fault_bound(&self) -> u64 {
        self.ctx.config.malicious_bound() as u64
    }

    pub async fn on_init(&self, body: crate::message::InitBody) {
        if !self.clock.restart(body.start_time) {
            warn!(
                "node {}: rejecting init with a start time earlier than the current one",
                self.ctx.node_id
            );
            return;
        }
        self.extracted.lock().unwrap().clear();
        *self.decided.lock().unwrap() = None;

        let commit_round = self.fault_bound() + 1;
        let this = self.clone();
        self.ctx.spawn_cancellable(async move {
            this.clock.wait_for_round(commit_round).await;
            this.commit();
        });

        if self.drive_done && self.ctx.is_leader() {
            let done_round = self.ctx.config.shard_size as Round + 7;
            let this = self.clone();
            self.ctx.spawn_cancellable(async move {
                this.clock.wait_for_round(done_round).await;
                info!("node {}: round window elapsed", this.ctx.node_id);
                this.ctx.signal_done();
            });
        }
    }

    /// Leader's proposal. Non-leaders answer with a two-link chain
    /// (leader's signature plus their own) at round 1.
    pub async fn on_propose(&self, request: Request) {
        let Some(sig) = request.sig else {
            warn!(
                "node {}: propose without a leader signature",
                self.ctx.node_id
            );
            return;
        };
        let view = self.ctx.config.view_node;
        if let Err(e) = self
            .ctx
            .keys
            .verify(view, &request.content, dst::MESSAGE, &sig)
        {
            warn!("node {}: propose signature invalid: {e}", self.ctx.node_id);
            return;
        }

        let inserted = self
            .extracted
            .lock()
            .unwrap()
            .insert(request.content.clone());
        if !inserted {
            debug!("node {}: proposed value already extracted", self.ctx.node_id);
        }

        if !self.ctx.is_leader() {
            let this = self.clone();
            let content = request.content;
            self.ctx.spawn_cancellable(async move {
                this.clock.wait_for_round(1).await;
                let own = this.ctx.secret.sign(&content, dst::MESSAGE);
                let chain = SignatureChain {
                    content,
                    links: vec![
                        ChainLink { signer: view, sig },
                        ChainLink {
                            signer: this.ctx.node_id,
                            sig: own,
                        },
                    ],
                };
                this.forward(chain).await;
            });
        }
    }

    pub async fn on_forward(&self, chain: SignatureChain) {
        if self.extracted.lock().unwrap().contains(&chain.content) {
            debug!(
                "node {}: chain for an already-extracted value",
                self.ctx.node_id
            );
            return;
        }
        if let Err(e) = self.verify_chain(&chain) {
            warn!("node {}: dropping invalid chain: {e}", self.ctx.node_id);
            return;
        }

        let round = self.clock.current_round();
        let len = chain.len() as Round;
        if len != round && len != round + 1 {
            // Tolerated: clocks drift a little between nodes.
            warn!(
                "node {}: chain of length {len} at round {round}, continuing",
                self.ctx.node_id
            );
        }

        self.extracted
            .lock()
            .unwrap()
            .insert(chain.content.clone());

        // Never relay a chain of length k before local round k.
        let this = self.clone();
        self.ctx.spawn_cancellable(async move {
            this.clock.wait_for_round(len).await;
            let mut chain = chain;
            let own = this.ctx.secret.sign(&chain.content, dst::MESSAGE);
            chain.links.push(ChainLink {
                signer: this.ctx.node_id,
                sig: own,
            });
            this.forward(chain).await;
        });
    }

    async fn forward(&self, chain: SignatureChain) {
        match Envelope::new(MessageKind::Forward, &chain) {
            Ok(env) => self.ctx.broadcast(&env).await,
            Err(e) => warn!("node {}: {e:#}", self.ctx.node_id),
        }
    }

    fn verify_chain(&self, chain: &SignatureChain) -> Result<(), VerifyError> {
        if chain.is_empty() {
            return Err(VerifyError::MalformedChain("no links".into()));
        }
        if chain.links[0].signer != self.ctx.config.view_node {
            return Err(VerifyError::MalformedChain(
                "first link is not the view node".into(),
            ));
        }
        let mut seen = BTreeSet::new();
        for link in &chain.links {
            if !seen.insert(link.signer) {
                return Err(VerifyError::MalformedChain(format!(
                    "node {} signed twice",
                    link.signer
                )));
            }
            self.ctx
                .keys
                .verify(link.signer, &chain.content, dst::MESSAGE, &link.sig)?;
        }
        Ok(())
    }

    /// Round f+1: commit the extracted singleton or the fallback value.
    fn commit(&self) {
        let value = {
            let extracted = self.extracted.lock().unwrap();
            if extracted.len() == 1 {
                extracted.iter().next().cloned().unwrap_or_default()
            } else {
                warn!(
                    "node {}: extracted {} values, committing the fallback",
                    self.ctx.node_id,
                    extracted.len()
                );
                FALLBACK_VALUE.to_vec()
            }
        };
        info!(
            "node {}: decided {:?}",
            self.ctx.node_id,
            String::from_utf8_lossy(&value)
        );
        *self.decided.lock().unwrap() = Some(value);
    }

    pub async fn on_query(&self, query: QueryBody) {
        let reply = ReplyQueryBody {
            value: self.decided(),
            certificates: vec![],
        };
        match Envelope::new(MessageKind::ReplyQuery, &reply) {
            Ok(env) => self.ctx.send(&query.reply_to, &env).await,
            Err(e) => warn!("node {}: {e:#}", self.ctx.node_id),
        }
    }
}
