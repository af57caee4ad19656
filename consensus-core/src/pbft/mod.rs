// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Four-phase PBFT engine: propose, pre-prepare, prepare, commit.
//!
//! The leader serializes rounds: it broadcasts one pre-prepare at a
//! time and waits for its own commit quorum before dequeuing the next
//! request. With f = (n-1)/3, a replica broadcasts its commit after
//! 2f-1 prepares (the leader never prepares its own value) while the
//! leader waits for 2f; every node replies after 2f commits.
//!
//! There is no view change: a silent leader stalls the instance. That
//! is an accepted limitation of the simulator.

mod slot;

pub use slot::{PhaseOutcome, RequestSlot, SlotSnapshot};

use crate::context::EngineContext;
use crate::message::{Envelope, MessageKind, PhaseBody, ReplyBody};
use crate::request::Request;
use crate::types::Digest;
use consensus_traits::{ProposalValidation, SimpleValidation};
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Clone)]
pub struct PbftEngine {
    ctx: Arc<EngineContext>,
    validation: Arc<dyn ProposalValidation<Request>>,
    queue: Arc<Mutex<VecDeque<Request>>>,
    queue_ready: Arc<Notify>,
    round_done: Arc<Notify>,
    slots: Arc<Mutex<HashMap<Digest, Arc<RequestSlot>>>>,
}

impl PbftEngine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self::with_validation(ctx, Arc::new(SimpleValidation))
    }

    pub fn with_validation(
        ctx: Arc<EngineContext>,
        validation: Arc<dyn ProposalValidation<Request>>,
    ) -> Self {
        PbftEngine {
            ctx,
            validation,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            queue_ready: Arc::new(Notify::new()),
            round_done: Arc::new(Notify::new()),
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn fault_bound(&self) -> usize {
        self.ctx.config.pbft_fault_bound()
    }

    /// Prepares required before broadcasting a commit. The leader does
    /// not prepare its own value, so replicas expect one fewer.
    fn prepare_threshold(&self) -> usize {
        let f = self.fault_bound();
        if self.ctx.is_leader() {
            2 * f
        } else {
            (2 * f).saturating_sub(1).max(1)
        }
    }

    fn commit_threshold(&self) -> usize {
        (2 * self.fault_bound()).max(1)
    }

    /// Fetch the slot for `digest`, creating it on first reference.
    fn slot(&self, digest: Digest) -> Arc<RequestSlot> {
        let mut slots = self.slots.lock().unwrap();
        slots
            .entry(digest)
            .or_insert_with(|| Arc::new(RequestSlot::new()))
            .clone()
    }

    /// Spawn the leader's round loop. No-op on replicas.
    pub fn start(&self) {
        if !self.ctx.is_leader() {
            return;
        }
        let this = self.clone();
        self.ctx.spawn_cancellable(async move {
            this.leader_loop().await;
        });
    }

    async fn leader_loop(&self) {
        loop {
            let next = self.queue.lock().unwrap().pop_front();
            match next {
                Some(request) => self.run_round(request).await,
                None => self.queue_ready.notified().await,
            }
        }
    }

    /// One serialized leader round: pre-prepare, then wait for the
    /// local commit quorum.
    async fn run_round(&self, request: Request) {
        let done = self.round_done.notified();
        info!(
            "node {}: leading round for request {}",
            self.ctx.node_id, request.digest
        );

        match Envelope::new(MessageKind::PrePrepare, &request) {
            Ok(env) => self.ctx.broadcast(&env).await,
            Err(e) => {
                warn!("node {}: dropping round: {e:#}", self.ctx.node_id);
                return;
            }
        }
        self.on_pre_prepare(request).await;

        done.await;
    }

    /// Leader-side entry point: queue a client request.
    pub async fn on_propose(&self, request: Request) {
        if !self.ctx.is_leader() {
            warn!(
                "node {}: ignoring propose, not the view node",
                self.ctx.node_id
            );
            return;
        }
        if !request.verify_digest() {
            warn!("node {}: propose with stale digest", self.ctx.node_id);
            return;
        }
        if let Err(e) = self.validation.validate_propose(&request) {
            warn!("node {}: propose rejected: {e:#}", self.ctx.node_id);
            return;
        }

        self.slot(request.digest).set_request(request.clone());
        self.queue.lock().unwrap().push_back(request);
        self.queue_ready.notify_one();
    }

    pub async fn on_pre_prepare(&self, request: Request) {
        if !request.verify_digest() {
            warn!("node {}: pre-prepare with stale digest", self.ctx.node_id);
            return;
        }
        if let Err(e) = self.validation.validate_pre_prepare(&request) {
            warn!("node {}: pre-prepare rejected: {e:#}", self.ctx.node_id);
            return;
        }
        let digest = request.digest;
        self.slot(digest).set_request(request);

        // The leader records its own pre-prepare but does not prepare.
        if !self.ctx.is_leader() {
            let body = PhaseBody {
                sender: self.ctx.node_id,
                digest,
            };
            match Envelope::new(MessageKind::Prepare, &body) {
                Ok(env) => self.ctx.broadcast(&env).await,
                Err(e) => warn!("node {}: {e:#}", self.ctx.node_id),
            }
        }
    }

    pub async fn on_prepare(&self, body: PhaseBody) {
        let slot = self.slot(body.digest);
        match slot.record_prepare(body.sender, self.prepare_threshold()) {
            PhaseOutcome::Duplicate => {
                debug!(
                    "node {}: duplicate prepare from {} for {}",
                    self.ctx.node_id, body.sender, body.digest
                );
            }
            PhaseOutcome::Counted(count) => {
                debug!(
                    "node {}: prepare {}/{} for {}",
                    self.ctx.node_id,
                    count,
                    self.prepare_threshold(),
                    body.digest
                );
            }
            PhaseOutcome::ThresholdReached(count) => {
                if let Some(request) = slot.request() {
                    if let Err(e) = self.validation.validate_prepare(&request) {
                        warn!("node {}: prepare rejected: {e:#}", self.ctx.node_id);
                        return;
                    }
                }
                debug!(
                    "node {}: prepare quorum ({count}) for {}, broadcasting commit",
                    self.ctx.node_id, body.digest
                );
                let commit = PhaseBody {
                    sender: self.ctx.node_id,
                    digest: body.digest,
                };
                match Envelope::new(MessageKind::Commit, &commit) {
                    Ok(env) => self.ctx.broadcast(&env).await,
                    Err(e) => warn!("node {}: {e:#}", self.ctx.node_id),
                }
            }
        }
    }

    pub async fn on_commit(&self, body: PhaseBody) {
        let slot = self.slot(body.digest);
        match slot.record_commit(body.sender, self.commit_threshold()) {
            PhaseOutcome::Duplicate => {
                debug!(
                    "node {}: duplicate commit from {} for {}",
                    self.ctx.node_id, body.sender, body.digest
                );
            }
            PhaseOutcome::Counted(count) => {
                debug!(
                    "node {}: commit {}/{} for {}",
                    self.ctx.node_id,
                    count,
                    self.commit_threshold(),
                    body.digest
                );
            }
            PhaseOutcome::ThresholdReached(count) => {
                match slot.request() {
                    Some(request) => {
                        if let Err(e) = self.validation.validate_commit(&request) {
                            warn!("node {}: commit hook failed: {e:#}", self.ctx.node_id);
                        }
                        info!(
                            "node {}: request {} committed with {count} commits",
                            self.ctx.node_id, body.digest
                        );
                        self.reply(request).await;
                    }
                    None => warn!(
                        "node {}: commit quorum for {} without the request payload",
                        self.ctx.node_id, body.digest
                    ),
                }
                if self.ctx.is_leader() {
                    self.round_done.notify_one();
                    self.ctx.signal_done();
                }
            }
        }
    }

    /// Tell the client its request went through, if one is registered.
    async fn reply(&self, request: Request) {
        let Some(client) = self.ctx.config.client_addr.clone() else {
            return;
        };
        match Envelope::new(MessageKind::Reply, &ReplyBody { request }) {
            Ok(env) => self.ctx.send(&client, &env).await,
            Err(e) => warn!("node {}: {e:#}", self.ctx.node_id),
        }
    }

    /// Point-in-time view of a slot's counters, if the digest is known.
    pub fn slot_snapshot(&self, digest: &Digest) -> Option<SlotSnapshot> {
        self.slots
            .lock()
            .unwrap()
            .get(digest)
            .map(|slot| slot.snapshot())
    }
}
