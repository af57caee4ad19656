// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! TCP transport with length-prefixed frames.
//!
//! Each frame is a 4-byte big-endian length followed by the envelope
//! bytes. Outbound connections are cached per destination and redialed
//! once after a write failure; inbound connections are read until EOF
//! and their frames pushed into the node's dispatch channel.

use async_trait::async_trait;
use consensus_traits::Transport;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Upper bound on a single frame. Simulator payloads are tiny; anything
/// near this size is a corrupt length prefix.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    FrameTooLarge { len: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// [`Transport`] over per-destination TCP connections.
#[derive(Default)]
pub struct TcpTransport {
    conns: Mutex<HashMap<String, TcpStream>>,
}

impl TcpTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn write_to(&self, to: &str, bytes: &[u8]) -> Result<(), NetworkError> {
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(NetworkError::FrameTooLarge { len: bytes.len() });
        }
        let mut conns = self.conns.lock().await;
        if !conns.contains_key(to) {
            conns.insert(to.to_string(), TcpStream::connect(to).await?);
        }
        let stream = conns.get_mut(to).ok_or_else(|| {
            NetworkError::Io(std::io::Error::other("connection vanished"))
        })?;
        if let Err(e) = write_frame(stream, bytes).await {
            // The peer may have restarted; redial once.
            debug!("redialing {to} after write error: {e}");
            conns.remove(to);
            let mut stream = TcpStream::connect(to).await?;
            write_frame(&mut stream, bytes).await?;
            conns.insert(to.to_string(), stream);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn broadcast(
        &self,
        from: &str,
        peers: &[String],
        bytes: Vec<u8>,
    ) -> Result<(), consensus_traits::Error> {
        for peer in peers.iter().filter(|p| p.as_str() != from) {
            if let Err(e) = self.write_to(peer, &bytes).await {
                // An unreachable peer models a faulty node; keep going.
                warn!("dropping frame for {peer}: {e}");
            }
        }
        Ok(())
    }

    async fn send(&self, to: &str, bytes: Vec<u8>) -> Result<(), consensus_traits::Error> {
        self.write_to(to, &bytes).await.map_err(Into::into)
    }
}

async fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await
}

pub async fn bind(addr: &str) -> Result<TcpListener, NetworkError> {
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {addr}");
    Ok(listener)
}

/// Accept loop: every inbound connection gets a reader task that feeds
/// `inbound` until EOF, a bad frame, or shutdown.
pub async fn serve(
    listener: TcpListener,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                let inbound = inbound.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = read_frames(stream, inbound, cancel).await {
                        debug!("connection from {peer} closed: {e}");
                    }
                });
            }
        }
    }
}

async fn read_frames(
    mut stream: TcpStream,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
) -> Result<(), NetworkError> {
    loop {
        let mut len_buf = [0u8; 4];
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = stream.read_exact(&mut len_buf) => { read?; }
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(NetworkError::FrameTooLarge { len });
        }
        let mut frame = vec![0u8; len];
        stream.read_exact(&mut frame).await?;
        if inbound.send(frame).is_err() {
            // The node stopped dispatching.
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consensus_traits::Transport;

    #[tokio::test]
    async fn test_frames_round_trip_over_localhost() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, tx, cancel.clone()));

        let transport = TcpTransport::new();
        transport.send(&addr, b"hello".to_vec()).await.unwrap();
        transport.send(&addr, vec![]).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), b"hello".to_vec());
        assert_eq!(rx.recv().await.unwrap(), Vec::<u8>::new());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_broadcast_skips_the_sender_address() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, tx, cancel.clone()));

        let transport = TcpTransport::new();
        let peers = vec![addr.clone(), "127.0.0.1:1".to_string()];
        // Broadcasting "as" the listener must not loop back to it; the
        // unreachable second peer is logged and skipped.
        transport
            .broadcast(&addr, &peers, b"ping".to_vec())
            .await
            .unwrap();
        transport
            .broadcast("other", &peers, b"pong".to_vec())
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), b"pong".to_vec());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_oversize_frame_is_rejected_before_writing() {
        let transport = TcpTransport::new();
        let huge = vec![0u8; MAX_FRAME_BYTES + 1];
        let err = transport.write_to("127.0.0.1:1", &huge).await.unwrap_err();
        assert!(matches!(err, NetworkError::FrameTooLarge { .. }));
    }
}
