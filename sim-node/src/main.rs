// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Simulator node binary.
//!
//! Runs one consensus node over TCP, or with `--local` an entire shard
//! in-process plus a query client, which is the quickest way to watch a
//! protocol run end to end:
//!
//! ```text
//! sim-node --engine tbb --local --value hello
//! ```

mod proposer;
mod query;
mod transport;

use crate::proposer::Proposer;
use crate::query::QueryClient;
use crate::transport::TcpTransport;
use anyhow::{bail, Context, Result};
use consensus_core::engine::{Engine, EngineKind};
use consensus_core::message::{Envelope, InitBody, InjectBody, MessageKind, ReplyQueryBody};
use consensus_core::types::NodeId;
use consensus_core::{EngineContext, SimConfig, SIMULATOR_VERSION};
use consensus_traits::Transport;
use log::{debug, info, warn, LevelFilter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Options {
    engine: EngineKind,
    node_id: NodeId,
    shard_size: usize,
    view_node: NodeId,
    tick_ms: u64,
    start_wait_ms: u64,
    base_port: u16,
    key_seed: u64,
    log_level: String,
    local: bool,
    value: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            engine: EngineKind::Tbb,
            node_id: 0,
            shard_size: 4,
            view_node: 0,
            tick_ms: 100,
            start_wait_ms: 500,
            base_port: 28000,
            key_seed: 42,
            log_level: "info".to_string(),
            local: false,
            value: None,
        }
    }
}

fn print_usage() {
    eprintln!(
        "usage: sim-node [options]

  --engine <pbft|ds|tbb>   protocol to run (default tbb)
  --node-id <n>            id of this node (default 0)
  --shard-size <n>         number of nodes in the shard (default 4)
  --view-node <n>          id of the designated leader (default 0)
  --tick-ms <ms>           round length (default 100)
  --start-wait-ms <ms>     lead time before an announced start (default 500)
  --base-port <port>       node i listens on base-port + i (default 28000)
  --key-seed <n>           shared signing-key seed (default 42)
  --log-level <level>      error|warn|info|debug|trace (default info)
  --local                  run the whole shard in this process
  --value <string>         value to propose (local mode, or on the leader)
  --help                   this text"
    );
}

impl Options {
    fn parse(args: &[String]) -> Result<Options> {
        let mut opts = Options::default();
        let mut iter = args.iter();
        while let Some(flag) = iter.next() {
            let mut take = || {
                iter.next()
                    .with_context(|| format!("{flag} needs an argument"))
            };
            match flag.as_str() {
                "--engine" => opts.engine = take()?.parse()?,
                "--node-id" => opts.node_id = take()?.parse()?,
                "--shard-size" => opts.shard_size = take()?.parse()?,
                "--view-node" => opts.view_node = take()?.parse()?,
                "--tick-ms" => opts.tick_ms = take()?.parse()?,
                "--start-wait-ms" => opts.start_wait_ms = take()?.parse()?,
                "--base-port" => opts.base_port = take()?.parse()?,
                "--key-seed" => opts.key_seed = take()?.parse()?,
                "--log-level" => opts.log_level = take()?.clone(),
                "--local" => opts.local = true,
                "--value" => opts.value = Some(take()?.clone()),
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                other => bail!("unknown flag: {other}"),
            }
        }
        Ok(opts)
    }

    fn config(&self) -> SimConfig {
        let client_addr = self
            .local
            .then(|| addr(self.base_port, self.shard_size as u16));
        SimConfig {
            shard_size: self.shard_size,
            view_node: self.view_node,
            tick_interval_ms: self.tick_ms,
            start_time_wait_ms: self.start_wait_ms,
            key_seed: self.key_seed,
            peers: (0..self.shard_size as u16)
                .map(|i| addr(self.base_port, i))
                .collect(),
            client_addr,
            ..SimConfig::default()
        }
    }
}

fn addr(base_port: u16, offset: u16) -> String {
    format!("127.0.0.1:{}", base_port + offset)
}

fn init_logging(level: &str) {
    let filter = match level {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };
    env_logger::Builder::new().filter_level(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let opts = match Options::parse(&args) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("error: {e:#}\n");
            print_usage();
            std::process::exit(2);
        }
    };
    init_logging(&opts.log_level);
    info!("sim-node {SIMULATOR_VERSION}, engine {}", opts.engine);

    if opts.local {
        run_local(opts).await
    } else {
        run_node(opts).await
    }
}

/// One node over TCP until ctrl-c or a Stop message.
async fn run_node(opts: Options) -> Result<()> {
    let config = Arc::new(opts.config());
    config.validate()?;
    if opts.node_id as usize >= opts.shard_size {
        bail!(
            "node id {} is outside the shard of size {}",
            opts.node_id,
            opts.shard_size
        );
    }

    let cancel = CancellationToken::new();
    let (node, mut inbox) = start_node(opts.node_id, &config, opts.engine, &cancel).await?;

    if let Some(value) = &opts.value {
        node.proposer.inject(value.clone().into_bytes());
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            frame = inbox.recv() => {
                let Some(bytes) = frame else { break };
                match Envelope::from_bytes(&bytes) {
                    Ok(env) => route(&env, &node).await,
                    Err(e) => debug!("dropping undecodable frame: {e:#}"),
                }
            }
        }
    }
    cancel.cancel();
    Ok(())
}

struct Node {
    engine: Engine,
    proposer: Proposer,
    ctx: Arc<EngineContext>,
    cancel: CancellationToken,
}

/// Bind the node's listener, start its engine and proposer, and return
/// it together with the raw frame inbox.
async fn start_node(
    id: NodeId,
    config: &Arc<SimConfig>,
    kind: EngineKind,
    cancel: &CancellationToken,
) -> Result<(Node, mpsc::UnboundedReceiver<Vec<u8>>)> {
    let transport = TcpTransport::new();
    let ctx = EngineContext::new(id, Arc::clone(config), transport, cancel.clone())?;
    let engine = Engine::new(kind, Arc::clone(&ctx));
    engine.start();
    let proposer = Proposer::new(Arc::clone(&ctx), engine.clone());
    proposer.start();

    let (tx, inbox) = mpsc::unbounded_channel();
    let listener = transport::bind(ctx.self_addr()).await?;
    tokio::spawn(transport::serve(listener, tx, cancel.clone()));

    Ok((
        Node {
            engine,
            proposer,
            ctx,
            cancel: cancel.clone(),
        },
        inbox,
    ))
}

/// Control-plane kinds are handled here; everything else goes to the
/// engine.
async fn route(env: &Envelope, node: &Node) {
    match env.kind {
        MessageKind::Inject => match env.decode::<InjectBody>() {
            Ok(body) => node.proposer.inject(body.value),
            Err(e) => warn!("malformed inject: {e:#}"),
        },
        MessageKind::Stop => {
            info!("stop requested by a peer");
            node.cancel.cancel();
        }
        MessageKind::ConsensusDone => node.ctx.signal_done(),
        _ => node.engine.dispatch(env).await,
    }
}

/// The whole shard in one process, plus a query client, plus the value
/// injection. Prints the leader's decision before exiting.
async fn run_local(opts: Options) -> Result<()> {
    let config = Arc::new(opts.config());
    config.validate()?;
    let cancel = CancellationToken::new();

    let mut nodes = Vec::with_capacity(opts.shard_size);
    for id in 0..opts.shard_size as NodeId {
        let (node, mut inbox) = start_node(id, &config, opts.engine, &cancel).await?;
        let pump_cancel = cancel.clone();
        let pump = Node {
            engine: node.engine.clone(),
            proposer: node.proposer.clone(),
            ctx: Arc::clone(&node.ctx),
            cancel: cancel.clone(),
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => return,
                    frame = inbox.recv() => {
                        let Some(bytes) = frame else { return };
                        match Envelope::from_bytes(&bytes) {
                            Ok(env) => route(&env, &pump).await,
                            Err(e) => debug!("dropping undecodable frame: {e:#}"),
                        }
                    }
                }
            }
        });
        nodes.push(node);
    }

    // The client participates from base_port + n.
    let client_addr = config
        .client_addr
        .clone()
        .context("local mode always has a client address")?;
    let client_transport: Arc<dyn Transport> = TcpTransport::new();
    let query = QueryClient::new(
        Arc::clone(&config),
        Arc::clone(&client_transport),
        cancel.clone(),
        client_addr.clone(),
    );
    let (client_tx, mut client_inbox) = mpsc::unbounded_channel();
    let listener = transport::bind(&client_addr).await?;
    tokio::spawn(transport::serve(listener, client_tx, cancel.clone()));
    let client_query = query.clone();
    let client_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = client_cancel.cancelled() => return,
                frame = client_inbox.recv() => {
                    let Some(bytes) = frame else { return };
                    let env = match Envelope::from_bytes(&bytes) {
                        Ok(env) => env,
                        Err(e) => {
                            debug!("client dropping undecodable frame: {e:#}");
                            continue;
                        }
                    };
                    match env.kind {
                        MessageKind::Init => match env.decode::<InitBody>() {
                            Ok(body) => client_query.on_init(body),
                            Err(e) => warn!("malformed init: {e:#}"),
                        },
                        MessageKind::ReplyQuery => match env.decode::<ReplyQueryBody>() {
                            Ok(body) => client_query.on_reply(body),
                            Err(e) => warn!("malformed query reply: {e:#}"),
                        },
                        MessageKind::Reply => info!("client: request committed"),
                        MessageKind::ConsensusDone => info!("client: round finished"),
                        kind => debug!("client ignoring {kind}"),
                    }
                }
            }
        }
    });

    // Inject the value over the wire, the way an external client would.
    let value = opts.value.clone().unwrap_or_else(|| "hello".to_string());
    let inject = Envelope::new(
        MessageKind::Inject,
        &InjectBody {
            value: value.into_bytes(),
        },
    )?;
    let view_addr = config
        .peer_addr(config.view_node)
        .context("view node address")?
        .to_string();
    client_transport.send(&view_addr, inject.to_bytes()?).await?;

    // Run until the conservative query has had its chance.
    let wait = Duration::from_millis(
        opts.start_wait_ms + opts.tick_ms * (config.t2() + 8) + 200,
    );
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = tokio::time::sleep(wait) => {}
    }

    let decision = match &nodes[config.view_node as usize].engine {
        Engine::Pbft(_) => None,
        Engine::Ds(ds) => ds.decided(),
        Engine::Tbb(tbb) => tbb.decided(),
    };
    match decision {
        Some(value) => println!("decided: {:?}", String::from_utf8_lossy(&value)),
        None => println!("no decision recorded on the view node"),
    }

    cancel.cancel();
    // Let the per-connection tasks observe the shutdown.
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_defaults() {
        let opts = Options::parse(&[]).unwrap();
        assert_eq!(opts.engine, EngineKind::Tbb);
        assert_eq!(opts.shard_size, 4);
        assert!(!opts.local);
    }

    #[test]
    fn test_parse_overrides() {
        let opts = Options::parse(&args(&[
            "--engine",
            "pbft",
            "--node-id",
            "2",
            "--tick-ms",
            "50",
            "--local",
            "--value",
            "xyz",
        ]))
        .unwrap();
        assert_eq!(opts.engine, EngineKind::Pbft);
        assert_eq!(opts.node_id, 2);
        assert_eq!(opts.tick_ms, 50);
        assert!(opts.local);
        assert_eq!(opts.value.as_deref(), Some("xyz"));
    }

    #[test]
    fn test_parse_rejects_unknown_flags_and_missing_arguments() {
        assert!(Options::parse(&args(&["--bogus"])).is_err());
        assert!(Options::parse(&args(&["--tick-ms"])).is_err());
        assert!(Options::parse(&args(&["--engine", "raft"])).is_err());
    }

    #[test]
    fn test_config_lays_out_ports() {
        let opts = Options::parse(&args(&["--base-port", "9000", "--local"])).unwrap();
        let config = opts.config();
        assert_eq!(config.peers[0], "127.0.0.1:9000");
        assert_eq!(config.peers[3], "127.0.0.1:9003");
        assert_eq!(config.client_addr.as_deref(), Some("127.0.0.1:9004"));
    }
}
