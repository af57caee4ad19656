// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! 1Δ-BB*: fast Byzantine broadcast with a BADS* fallback.
//!
//! Optimistic path: the leader proposes, every node votes after one
//! tick if its propose set is a singleton, and the first quorum
//! certificate commits the value if it arrives while the block set is
//! still a singleton before 3Δ.
//!
//! Fallback (BADS*): at 4Δ each node signs its block-set singleton (or
//! the fallback value) and broadcasts it. Signatures on a common input
//! are collected and aggregated at a quorum; the aggregate goes out at
//! 6Δ. From 5Δ on the exchange behaves like Dolev-Strong with the round
//! shifted by five ticks, and the final commit happens at (f+6)Δ.

use crate::clock::RoundClock;
use crate::context::EngineContext;
use crate::crypto::dst;
use crate::message::{
    AggregateSeed, BadsChain, ChainLink, Envelope, InitBody, MessageKind, QcBody, VoteBody,
};
use crate::quorum::{QuorumCertificate, VoteLedger, VoteOutcome};
use crate::request::Request;
use crate::types::{NodeId, Round, FALLBACK_VALUE};
use consensus_traits::VerifyError;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct CommitState {
    /// Value committed by the optimistic path, before 3Δ.
    fast: Option<Vec<u8>>,
    /// Value committed by the BADS* fallback at (f+6)Δ.
    fallback: Option<Vec<u8>>,
}

#[derive(Clone)]
pub struct BbEngine {
    ctx: Arc<EngineContext>,
    clock: Arc<RoundClock>,
    propose_set: Arc<Mutex<BTreeSet<Vec<u8>>>>,
    votes: Arc<Mutex<VoteLedger>>,
    /// Values with a quorum certificate (set A in the hybrid).
    block_set: Arc<Mutex<BTreeSet<Vec<u8>>>>,
    bads_sigs: Arc<Mutex<VoteLedger>>,
    bads_blocks: Arc<Mutex<BTreeSet<Vec<u8>>>>,
    state: Arc<Mutex<CommitState>>,
    /// Signalled when the optimistic path commits.
    fast_path: Arc<Notify>,
    drive_done: bool,
}

impl BbEngine {
    pub fn new(ctx: Arc<EngineContext>, clock: Arc<RoundClock>, drive_done: bool) -> Self {
        BbEngine {
            ctx,
            clock,
            propose_set: Arc::new(Mutex::new(BTreeSet::new())),
            votes: Arc::new(Mutex::new(VoteLedger::new())),
            block_set: Arc::new(Mutex::new(BTreeSet::new())),
            bads_sigs: Arc::new(Mutex::new(VoteLedger::new())),
            bads_blocks: Arc::new(Mutex::new(BTreeSet::new())),
            state: Arc::new(Mutex::new(CommitState::default())),
            fast_path: Arc::new(Notify::new()),
            drive_done,
        }
    }

    /// Handle to the certified block set, shared with the hybrid.
    pub fn block_set_handle(&self) -> Arc<Mutex<BTreeSet<Vec<u8>>>> {
        Arc::clone(&self.block_set)
    }

    /// Notified once when the optimistic path commits.
    pub fn fast_path_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.fast_path)
    }

    pub fn fast_value(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().fast.clone()
    }

    pub fn fallback_value(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().fallback.clone()
    }

    pub fn certificates(&self) -> Vec<QuorumCertificate> {
        self.votes.lock().unwrap().certificates()
    }

    pub fn certified_count(&self) -> usize {
        self.votes.lock().unwrap().certified_count()
    }

    fn quorum(&self) -> usize {
        self.ctx.config.vote_quorum()
    }

    fn fault_bound(&self) -> Round {
        self.ctx.config.malicious_bound() as Round
    }

    pub async fn on_init(&self, body: InitBody) {
        if !self.clock.restart(body.start_time) {
            warn!(
                "node {}: rejecting init with a start time earlier than the current one",
                self.ctx.node_id
            );
            return;
        }
        self.propose_set.lock().unwrap().clear();
        self.votes.lock().unwrap().clear();
        self.block_set.lock().unwrap().clear();
        self.bads_sigs.lock().unwrap().clear();
        self.bads_blocks.lock().unwrap().clear();
        *self.state.lock().unwrap() = CommitState::default();

        // 4Δ: enter the fallback by signing our best candidate.
        let this = self.clone();
        self.ctx.spawn_cancellable(async move {
            this.clock.wait_for_round(4).await;
            this.start_fallback().await;
        });

        // (f+6)Δ: final fallback commit.
        let final_round = self.fault_bound() + 6;
        let this = self.clone();
        self.ctx.spawn_cancellable(async move {
            this.clock.wait_for_round(final_round).await;
            this.final_commit();
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

    /// Leader's proposal: echo it once and vote one tick later if no
    /// conflicting proposal showed up.
    pub async fn on_propose(&self, request: Request) {
        if !self.accept_proposal(&request) {
            return;
        }

        if !self.ctx.is_leader() {
            match Envelope::new(MessageKind::Forward1, &request) {
                Ok(env) => self.ctx.broadcast(&env).await,
                Err(e) => warn!("node {}: {e:#}", self.ctx.node_id),
            }
        }

        let this = self.clone();
        self.ctx.spawn_cancellable(async move {
            tokio::time::sleep(this.clock.tick()).await;
            this.cast_vote().await;
        });
    }

    /// A peer's echo of the leader's proposal.
    pub async fn on_forward1(&self, request: Request) {
        self.accept_proposal(&request);
    }

    fn accept_proposal(&self, request: &Request) -> bool {
        let Some(sig) = request.sig else {
            warn!(
                "node {}: proposal without a leader signature",
                self.ctx.node_id
            );
            return false;
        };
        let view = self.ctx.config.view_node;
        if let Err(e) = self
            .ctx
            .keys
            .verify(view, &request.content, dst::MESSAGE, &sig)
        {
            warn!(
                "node {}: proposal signature invalid: {e}",
                self.ctx.node_id
            );
            return false;
        }
        let inserted = self
            .propose_set
            .lock()
            .unwrap()
            .insert(request.content.clone());
        if !inserted {
            debug!("node {}: proposal already known", self.ctx.node_id);
        }
        true
    }

    /// Vote for the propose-set singleton, one tick after the proposal.
    async fn cast_vote(&self) {
        let value = {
            let proposals = self.propose_set.lock().unwrap();
            if proposals.len() != 1 {
                warn!(
                    "node {}: {} proposals after one tick, not voting",
                    self.ctx.node_id,
                    proposals.len()
                );
                return;
            }
            proposals.iter().next().cloned().unwrap_or_default()
        };

        let sig = self.ctx.secret.sign(&value, dst::VOTE);
        self.apply_vote(self.ctx.node_id, &value, sig).await;

        let body = VoteBody {
            voter: self.ctx.node_id,
            content: value,
            sig,
        };
        match Envelope::new(MessageKind::Vote, &body) {
            Ok(env) => self.ctx.broadcast(&env).await,
            Err(e) => warn!("node {}: {e:#}", self.ctx.node_id),
        }
    }

    pub async fn on_vote(&self, body: VoteBody) {
        if let Err(e) =
            self.ctx
                .keys
                .verify(body.voter, &body.content, dst::VOTE, &body.sig)
        {
            warn!(
                "node {}: vote from {} invalid: {e}",
                self.ctx.node_id, body.voter
            );
            return;
        }
        self.apply_vote(body.voter, &body.content, body.sig).await;
    }

    /// Count a verified vote and drive the optimistic path when the
    /// first certificate forms.
    async fn apply_vote(&self, voter: NodeId, content: &[u8], sig: crate::crypto::Signature) {
        let (outcome, total_certified) = {
            let mut votes = self.votes.lock().unwrap();
            let outcome = votes.record(content, voter, sig, self.quorum());
            let total = votes.certified_count();
            (outcome, total)
        };
        let qc = match outcome {
            Err(e) => {
                warn!("node {}: vote bookkeeping failed: {e:#}", self.ctx.node_id);
                return;
            }
            Ok(VoteOutcome::Duplicate) => {
                debug!(
                    "node {}: duplicate vote from {voter}",
                    self.ctx.node_id
                );
                return;
            }
            Ok(VoteOutcome::Added { count }) => {
                debug!(
                    "node {}: vote {count}/{} from {voter}",
                    self.ctx.node_id,
                    self.quorum()
                );
                return;
            }
            Ok(VoteOutcome::Certified(qc)) => qc,
        };

        let singleton = {
            let mut blocks = self.block_set.lock().unwrap();
            blocks.insert(qc.value.clone());
            blocks.len() == 1
        };

        // Optimistic commit: first certificate, unique block, before 3Δ.
        let first = total_certified == 1;
        let in_window = self.clock.elapsed() < self.ctx.config.ticks(3);
        if first && singleton && in_window {
            let claimed = {
                let mut state = self.state.lock().unwrap();
                if state.fast.is_none() {
                    state.fast = Some(qc.value.clone());
                    true
                } else {
                    false
                }
            };
            if claimed {
                info!(
                    "node {}: optimistic commit of {:?}",
                    self.ctx.node_id,
                    String::from_utf8_lossy(&qc.value)
                );
                self.fast_path.notify_one();
                match Envelope::new(MessageKind::Qc, &QcBody::from(&qc)) {
                    Ok(env) => self.ctx.broadcast(&env).await,
                    Err(e) => warn!("node {}: {e:#}", self.ctx.node_id),
                }
            }
        }
    }

    /// A peer announced a certificate. Acting on it (detecting a run
    /// without an honest super-majority) is future work; for now the
    /// announcement is only verified.
    pub async fn on_qc(&self, body: QcBody) {
        if body.signers.len() < self.quorum() {
            warn!(
                "node {}: certificate with {} signers, quorum is {}",
                self.ctx.node_id,
                body.signers.len(),
                self.quorum()
            );
            return;
        }
        match self.ctx.keys.verify_aggregate(
            &body.signers,
            &body.content,
            dst::VOTE,
            &body.agg_sig,
        ) {
            Ok(()) => debug!(
                "node {}: verified certificate from {} signers",
                self.ctx.node_id,
                body.signers.len()
            ),
            Err(e) => warn!(
                "node {}: certificate announcement invalid: {e}",
                self.ctx.node_id
            ),
        }
    }

    /// 4Δ: propose our block-set singleton (or the fallback value) into
    /// the BADS* exchange.
    async fn start_fallback(&self) {
        let input = {
            let blocks = self.block_set.lock().unwrap();
            if blocks.len() == 1 {
                blocks.iter().next().cloned().unwrap_or_default()
            } else {
                FALLBACK_VALUE.to_vec()
            }
        };
        debug!(
            "node {}: entering fallback with {:?}",
            self.ctx.node_id,
            String::from_utf8_lossy(&input)
        );

        let sig = self.ctx.secret.sign(&input, dst::MESSAGE);
        self.record_fallback_sig(self.ctx.node_id, &input, sig).await;

        let chain = BadsChain {
            input,
            agg: None,
            links: vec![ChainLink {
                signer: self.ctx.node_id,
                sig,
            }],
        };
        self.forward2(chain).await;
    }

    pub async fn on_forward2(&self, chain: BadsChain) {
        let round = self.clock.current_round();
        if round < 5 {
            self.collect_fallback_sig(chain).await;
        } else {
            self.relay_fallback_chain(chain, round - 5).await;
        }
    }

    /// Collection phase (< 5Δ): individual signatures over a common
    /// input, aggregated at a quorum and re-broadcast at 6Δ.
    async fn collect_fallback_sig(&self, chain: BadsChain) {
        if chain.agg.is_some() || chain.links.len() != 1 {
            warn!(
                "node {}: malformed fallback proposal (len {})",
                self.ctx.node_id,
                chain.chain_len()
            );
            return;
        }
        let link = &chain.links[0];
        if let Err(e) = self
            .ctx
            .keys
            .verify(link.signer, &chain.input, dst::MESSAGE, &link.sig)
        {
            warn!(
                "node {}: fallback proposal from {} invalid: {e}",
                self.ctx.node_id, link.signer
            );
            return;
        }
        self.record_fallback_sig(link.signer, &chain.input, link.sig)
            .await;
    }

    async fn record_fallback_sig(
        &self,
        signer: NodeId,
        input: &[u8],
        sig: crate::crypto::Signature,
    ) {
        let outcome = self
            .bads_sigs
            .lock()
            .unwrap()
            .record(input, signer, sig, self.quorum());
        match outcome {
            Err(e) => warn!("node {}: fallback bookkeeping failed: {e:#}", self.ctx.node_id),
            Ok(VoteOutcome::Duplicate) => {
                debug!("node {}: duplicate fallback signature", self.ctx.node_id)
            }
            Ok(VoteOutcome::Added { count }) => debug!(
                "node {}: fallback signature {count}/{} on {:?}",
                self.ctx.node_id,
                self.quorum(),
                String::from_utf8_lossy(input)
            ),
            Ok(VoteOutcome::Certified(qc)) => {
                self.bads_blocks.lock().unwrap().insert(qc.value.clone());
                let this = self.clone();
                self.ctx.spawn_cancellable(async move {
                    this.clock.wait_for_round(6).await;
                    let chain = BadsChain {
                        input: qc.value.clone(),
                        agg: Some(AggregateSeed {
                            signers: qc.signers.clone(),
                            sig: qc.agg_sig,
                        }),
                        links: vec![],
                    };
                    this.forward2(chain).await;
                });
            }
        }
    }

    /// Relay phase (>= 5Δ): Dolev-Strong over the fallback inputs with
    /// the round shifted by five ticks.
    async fn relay_fallback_chain(&self, chain: BadsChain, shifted_round: Round) {
        if self.bads_blocks.lock().unwrap().contains(&chain.input) {
            debug!(
                "node {}: fallback chain for a known input",
                self.ctx.node_id
            );
            return;
        }
        if let Err(e) = self.verify_fallback_chain(&chain) {
            warn!(
                "node {}: dropping invalid fallback chain: {e}",
                self.ctx.node_id
            );
            return;
        }

        let len = chain.chain_len() as Round;
        if len != shifted_round && len != shifted_round + 1 {
            warn!(
                "node {}: fallback chain of length {len} at shifted round {shifted_round}, continuing",
                self.ctx.node_id
            );
        }

        self.bads_blocks.lock().unwrap().insert(chain.input.clone());

        let this = self.clone();
        self.ctx.spawn_cancellable(async move {
            this.clock.wait_for_round(5 + len).await;
            let mut chain = chain;
            let own = this.ctx.secret.sign(&chain.input, dst::MESSAGE);
            chain.links.push(ChainLink {
                signer: this.ctx.node_id,
                sig: own,
            });
            this.forward2(chain).await;
        });
    }

    fn verify_fallback_chain(&self, chain: &BadsChain) -> Result<(), VerifyError> {
        if chain.chain_len() == 0 {
            return Err(VerifyError::MalformedChain("no links".into()));
        }
        if let Some(seed) = &chain.agg {
            if seed.signers.len() < self.quorum() {
                return Err(VerifyError::TooFewVotes {
                    votes: seed.signers.len(),
                    quorum: self.quorum(),
                });
            }
            self.ctx.keys.verify_aggregate(
                &seed.signers,
                &chain.input,
                dst::MESSAGE,
                &seed.sig,
            )?;
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
                .verify(link.signer, &chain.input, dst::MESSAGE, &link.sig)?;
        }
        Ok(())
    }

    async fn forward2(&self, chain: BadsChain) {
        match Envelope::new(MessageKind::Forward2, &chain) {
            Ok(env) => self.ctx.broadcast(&env).await,
            Err(e) => warn!("node {}: {e:#}", self.ctx.node_id),
        }
    }

    /// (f+6)Δ: commit the fallback block-set singleton, or the fallback
    /// value, unless the optimistic path already committed.
    fn final_commit(&self) {
        if let Some(value) = self.fast_value() {
            info!(
                "node {}: already committed {:?} on the optimistic path",
                self.ctx.node_id,
                String::from_utf8_lossy(&value)
            );
            return;
        }
        let value = {
            let blocks = self.bads_blocks.lock().unwrap();
            if blocks.len() == 1 {
                blocks.iter().next().cloned().unwrap_or_default()
            } else {
                warn!(
                    "node {}: {} fallback inputs, committing the fallback value",
                    self.ctx.node_id,
                    blocks.len()
                );
                FALLBACK_VALUE.to_vec()
            }
        };
        info!(
            "node {}: fallback commit of {:?}",
            self.ctx.node_id,
            String::from_utf8_lossy(&value)
        );
        self.state.lock().unwrap().fallback = Some(value);
    }
}
