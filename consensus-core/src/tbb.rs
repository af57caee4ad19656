// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! TBB: hybrid of Dolev-Strong and 1Δ-BB* over a shared clock.
//!
//! Both sub-protocols run concurrently on the same proposal. The DS
//! extracted set doubles as the local set C and the BB certified block
//! set as set A. A reference value is derived from C at (t1+1)Δ and
//! (t2+1)Δ, and the hybrid commits at the earliest of three points:
//!
//! 1. the BB optimistic path (event-driven, suppresses the others),
//! 2. (t1+6)Δ: the A singleton, else the reference value,
//! 3. (t2+6)Δ: the C singleton, else the reference value.
//!
//! A query is answered with the first non-empty decision plus every
//! certificate accumulated so far.

use crate::bb::BbEngine;
use crate::clock::RoundClock;
use crate::context::EngineContext;
use crate::ds::DsEngine;
use crate::message::{
    BadsChain, Envelope, InitBody, MessageKind, QcBody, QueryBody, ReplyQueryBody, SignatureChain,
    VoteBody,
};
use crate::request::Request;
use crate::types::Round;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

/// Index of a commit point in the decision array.
const POINT_FAST: usize = 0;
const POINT_OPTIMISTIC: usize = 1;
const POINT_PESSIMISTIC: usize = 2;

#[derive(Clone)]
pub struct TbbEngine {
    ctx: Arc<EngineContext>,
    clock: Arc<RoundClock>,
    ds: DsEngine,
    bb: BbEngine,
    /// DS extracted set (set C).
    set_c: Arc<Mutex<BTreeSet<Vec<u8>>>>,
    /// BB certified block set (set A).
    set_a: Arc<Mutex<BTreeSet<Vec<u8>>>>,
    reference: Arc<Mutex<Option<Vec<u8>>>>,
    decisions: Arc<Mutex<[Option<Vec<u8>>; 3]>>,
}

impl TbbEngine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let clock = ctx.new_clock();
        let ds = DsEngine::new(Arc::clone(&ctx), Arc::clone(&clock), false);
        let bb = BbEngine::new(Arc::clone(&ctx), Arc::clone(&clock), false);
        let set_c = ds.extracted_handle();
        let set_a = bb.block_set_handle();
        TbbEngine {
            ctx,
            clock,
            ds,
            bb,
            set_c,
            set_a,
            reference: Arc::new(Mutex::new(None)),
            decisions: Arc::new(Mutex::new([None, None, None])),
        }
    }

    pub fn decisions_snapshot(&self) -> [Option<Vec<u8>>; 3] {
        self.decisions.lock().unwrap().clone()
    }

    /// First non-empty decision among the three commit points.
    pub fn decided(&self) -> Option<Vec<u8>> {
        self.decisions
            .lock()
            .unwrap()
            .iter()
            .find_map(|d| d.clone())
    }

    pub fn bb_engine(&self) -> &BbEngine {
        &self.bb
    }

    pub fn ds_engine(&self) -> &DsEngine {
        &self.ds
    }

    pub async fn on_init(&self, body: InitBody) {
        if !self.clock.restart(body.start_time) {
            warn!(
                "node {}: rejecting init with a start time earlier than the current one",
                self.ctx.node_id
            );
            return;
        }
        *self.reference.lock().unwrap() = None;
        *self.decisions.lock().unwrap() = [None, None, None];

        let t1 = self.ctx.config.t1();
        let t2 = self.ctx.config.t2();

        for reference_round in [t1 + 1, t2 + 1] {
            let this = self.clone();
            self.ctx.spawn_cancellable(async move {
                this.clock.wait_for_round(reference_round).await;
                this.update_reference(reference_round);
            });
        }

        // Commit point 1: wait on the BB optimistic path.
        let this = self.clone();
        let fast_path = self.bb.fast_path_handle();
        self.ctx.spawn_cancellable(async move {
            loop {
                if let Some(value) = this.bb.fast_value() {
                    this.record_decision(POINT_FAST, value);
                    return;
                }
                fast_path.notified().await;
            }
        });

        let this = self.clone();
        self.ctx.spawn_cancellable(async move {
            this.clock.wait_for_round(t1 + 6).await;
            this.commit_point_optimistic();
        });

        let this = self.clone();
        self.ctx.spawn_cancellable(async move {
            this.clock.wait_for_round(t2 + 6).await;
            this.commit_point_pessimistic();
        });

        self.ds.on_init(body).await;
        self.bb.on_init(body).await;

        if self.ctx.is_leader() {
            let done_round = self.ctx.config.shard_size as Round + 7;
            let this = self.clone();
            self.ctx.spawn_cancellable(async move {
                this.clock.wait_for_round(done_round).await;
                info!("node {}: round window elapsed", this.ctx.node_id);
                this.ctx.signal_done();
            });
        }
    }

    /// The proposal feeds both sub-protocols.
    pub async fn on_propose(&self, request: Request) {
        self.ds.on_propose(request.clone()).await;
        self.bb.on_propose(request).await;
    }

    pub async fn on_forward(&self, chain: SignatureChain) {
        self.ds.on_forward(chain).await;
    }

    pub async fn on_forward1(&self, request: Request) {
        self.bb.on_forward1(request).await;
    }

    pub async fn on_forward2(&self, chain: BadsChain) {
        self.bb.on_forward2(chain).await;
    }

    pub async fn on_vote(&self, body: VoteBody) {
        self.bb.on_vote(body).await;
    }

    pub async fn on_qc(&self, body: QcBody) {
        self.bb.on_qc(body).await;
    }

    /// Derive the reference value from the C singleton.
    fn update_reference(&self, round: Round) {
        let candidate = {
            let set_c = self.set_c.lock().unwrap();
            if set_c.len() == 1 {
                set_c.iter().next().cloned()
            } else {
                None
            }
        };
        let Some(candidate) = candidate else {
            debug!(
                "node {}: no reference value at round {round}",
                self.ctx.node_id
            );
            return;
        };
        let mut reference = self.reference.lock().unwrap();
        match reference.as_ref() {
            Some(current) if *current != candidate => warn!(
                "node {}: reference value changed at round {round}",
                self.ctx.node_id
            ),
            _ => {}
        }
        *reference = Some(candidate);
    }

    fn fast_committed(&self) -> bool {
        self.decisions.lock().unwrap()[POINT_FAST].is_some()
    }

    /// (t1+6)Δ: the A singleton, else the reference value.
    fn commit_point_optimistic(&self) {
        if self.fast_committed() {
            debug!(
                "node {}: optimistic point suppressed by the fast path",
                self.ctx.node_id
            );
            return;
        }
        let value = {
            let set_a = self.set_a.lock().unwrap();
            if set_a.len() == 1 {
                set_a.iter().next().cloned()
            } else {
                None
            }
        };
        match value.or_else(|| self.reference.lock().unwrap().clone()) {
            Some(value) => self.record_decision(POINT_OPTIMISTIC, value),
            None => info!(
                "node {}: nothing to commit at the optimistic point",
                self.ctx.node_id
            ),
        }
    }

    /// (t2+6)Δ: the C singleton, else the reference value.
    fn commit_point_pessimistic(&self) {
        if self.fast_committed() {
            debug!(
                "node {}: pessimistic point suppressed by the fast path",
                self.ctx.node_id
            );
            return;
        }
        let value = {
            let set_c = self.set_c.lock().unwrap();
            if set_c.len() == 1 {
                set_c.iter().next().cloned()
            } else {
                None
            }
        };
        match value.or_else(|| self.reference.lock().unwrap().clone()) {
            Some(value) => self.record_decision(POINT_PESSIMISTIC, value),
            None => info!(
                "node {}: nothing to commit at the pessimistic point",
                self.ctx.node_id
            ),
        }
    }

    fn record_decision(&self, point: usize, value: Vec<u8>) {
        let mut decisions = self.decisions.lock().unwrap();
        if decisions[point].is_some() {
            return;
        }
        info!(
            "node {}: commit point {} decided {:?}",
            self.ctx.node_id,
            point + 1,
            String::from_utf8_lossy(&value)
        );
        decisions[point] = Some(value);
    }

    pub async fn on_query(&self, query: QueryBody) {
        let reply = ReplyQueryBody {
            value: self.decided(),
            certificates: self
                .bb
                .certificates()
                .iter()
                .map(QcBody::from)
                .collect(),
        };
        match Envelope::new(MessageKind::ReplyQuery, &reply) {
            Ok(env) => self.ctx.send(&query.reply_to, &env).await,
            Err(e) => warn!("node {}: {e:#}", self.ctx.node_id),
        }
    }
}
