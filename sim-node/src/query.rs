// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Query client measuring decision latency against the view node.
//!
//! On every start-time announcement it fires two queries: an aggressive
//! one at 3Δ, just after the optimistic commit window, and a
//! conservative one half a tick after the last commit point at
//! (t2+6)Δ. Replies are matched to queries in order.

use consensus_core::message::{Envelope, MessageKind, QueryBody, ReplyQueryBody};
use consensus_core::{RoundClock, SimConfig};
use consensus_traits::Transport;
use log::{info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct QueryClient {
    config: Arc<SimConfig>,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    /// Address replies should be sent to (our own listener).
    reply_to: String,
    replies: Arc<Mutex<mpsc::UnboundedReceiver<ReplyQueryBody>>>,
    reply_tx: mpsc::UnboundedSender<ReplyQueryBody>,
}

impl QueryClient {
    pub fn new(
        config: Arc<SimConfig>,
        transport: Arc<dyn Transport>,
        cancel: CancellationToken,
        reply_to: String,
    ) -> Self {
        let (reply_tx, replies) = mpsc::unbounded_channel();
        QueryClient {
            config,
            transport,
            cancel,
            reply_to,
            replies: Arc::new(Mutex::new(replies)),
            reply_tx,
        }
    }

    /// Feed a reply received on the client's listener.
    pub fn on_reply(&self, body: ReplyQueryBody) {
        let _ = self.reply_tx.send(body);
    }

    /// Schedule the query pair for a newly announced instance.
    pub fn on_init(&self, body: consensus_core::message::InitBody) {
        let this = self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = this.run(body.start_time) => {}
            }
        });
    }

    async fn run(&self, start_time: std::time::SystemTime) {
        let clock = RoundClock::new(self.config.tick_interval());
        clock.restart(start_time);

        clock.wait_for_round(3).await;
        self.query_once("aggressive").await;

        clock.wait_for_round(self.config.t2() + 6).await;
        tokio::time::sleep(self.config.tick_interval() / 2).await;
        self.query_once("conservative").await;
    }

    async fn query_once(&self, label: &str) {
        let Some(view_addr) = self.config.peer_addr(self.config.view_node) else {
            warn!("no address for the view node");
            return;
        };
        let body = QueryBody {
            reply_to: self.reply_to.clone(),
        };
        let env = match Envelope::new(MessageKind::Query, &body) {
            Ok(env) => env,
            Err(e) => {
                warn!("{e:#}");
                return;
            }
        };
        let bytes = match env.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("{e:#}");
                return;
            }
        };
        let sent = Instant::now();
        if let Err(e) = self.transport.send(view_addr, bytes).await {
            warn!("{label} query to {view_addr} failed: {e:#}");
            return;
        }

        let mut replies = self.replies.lock().await;
        let wait = self.config.tick_interval() * 4;
        match tokio::time::timeout(wait, replies.recv()).await {
            Ok(Some(reply)) => match reply.value {
                Some(value) => info!(
                    "{label} query answered in {:?}: {:?} ({} certificates)",
                    sent.elapsed(),
                    String::from_utf8_lossy(&value),
                    reply.certificates.len()
                ),
                None => info!(
                    "{label} query answered in {:?}: no decision yet",
                    sent.elapsed()
                ),
            },
            Ok(None) => {}
            Err(_) => warn!("{label} query timed out after {wait:?}"),
        }
    }
}
