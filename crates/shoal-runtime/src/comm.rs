// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Reliable ordered links between every node pair.
//!
//! Startup builds a full TCP mesh: for each pair, the higher address dials
//! the lower, so every pair has exactly one link.  A HELLO exchange
//! identifies each link; once every link is up the main node publishes the
//! canonical node list (NODELIST) and the runtime proper begins.
//!
//! Each link gets a writer task fed by an mpsc queue and a reader task that
//! decodes envelopes into the dispatcher's inbound channel.  Envelopes are
//! length-prefixed: 4-byte big-endian length, then the tagged message bytes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use shoal_config::RuntimeConfig;

use crate::error::{Result, RtError};
use crate::location::{self, level, NodeId};
use crate::message::{Msg, MAX_FRAME_BYTES};
use crate::rt_debug;
use crate::stats::Counters;

/// How long startup waits for the whole mesh (and the node list) to come up.
const STARTUP_DEADLINE: Duration = Duration::from_secs(30);
const DIAL_RETRY: Duration = Duration::from_millis(100);

/// What the reader/writer tasks hand to the dispatcher.
#[derive(Debug)]
pub(crate) enum Inbound {
    Msg(NodeId, Msg),
    /// The link to this peer failed: transport error or unexpected close.
    Lost(NodeId, String),
}

pub(crate) struct Comm {
    links: HashMap<NodeId, mpsc::Sender<Msg>>,
    counters: Arc<Counters>,
    /// Set during orderly shutdown so link teardown is not reported as
    /// peer failure.
    pub closing: Arc<AtomicBool>,
}

impl Comm {
    pub async fn send(&self, to: NodeId, msg: Msg) -> Result<()> {
        rt_debug!(level::MSG_SEND, "-> {to} {}", msg.kind());
        self.counters.msgs_sent.fetch_add(1, Ordering::Relaxed);
        // Work accounting happens before the message becomes visible
        // anywhere, so a quiescence probe can never see the receipt of a
        // message before its send.
        if msg.bears_work() {
            self.counters.work_sent.fetch_add(1, Ordering::Relaxed);
        }
        let link = self
            .links
            .get(&to)
            .ok_or_else(|| RtError::PeerUnreachable(to.to_string()))?;
        link.send(msg)
            .await
            .map_err(|_| RtError::PeerUnreachable(to.to_string()))
    }

    pub async fn broadcast(&self, msg: Msg) -> Result<()> {
        let peers: Vec<NodeId> = self.links.keys().copied().collect();
        for peer in peers {
            self.send(peer, msg.clone()).await?;
        }
        Ok(())
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }
}

// ── Framing ───────────────────────────────────────────────────────────────────

async fn send_frame<W: AsyncWriteExt + Unpin>(w: &mut W, bytes: &[u8]) -> Result<()> {
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(RtError::WireDecode(format!(
            "outgoing frame of {} bytes exceeds limit",
            bytes.len()
        )));
    }
    w.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    w.write_all(bytes).await?;
    w.flush().await?;
    Ok(())
}

async fn recv_frame<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(RtError::WireDecode(format!(
            "incoming frame of {len} bytes exceeds limit"
        )));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

// ── Startup ───────────────────────────────────────────────────────────────────

/// Bring up the mesh per the startup sequence: bind, connect to all peers,
/// exchange identities, and agree on the node list (published by main).
///
/// Returns the comm handle, the dispatcher's inbound receiver, and any
/// runtime messages that raced ahead of the node list on a fast peer.
pub(crate) async fn establish(
    cfg: &RuntimeConfig,
    counters: Arc<Counters>,
) -> Result<(Comm, mpsc::Receiver<Inbound>, Vec<Inbound>)> {
    let listen_addr: std::net::SocketAddr = cfg
        .listen
        .parse()
        .map_err(|e| RtError::Config(format!("bad listen address {:?}: {e}", cfg.listen)))?;
    let listener = TcpListener::bind(listen_addr).await?;

    let me = match &cfg.public_addr {
        Some(s) => s.parse::<NodeId>()?,
        None => NodeId::new(listener.local_addr()?),
    };
    location::set_my_node(me)?;

    let peer_addrs: Vec<std::net::SocketAddr> = cfg
        .peers
        .iter()
        .map(|s| {
            s.parse()
                .map_err(|e| RtError::Config(format!("bad peer address {s:?}: {e}")))
        })
        .collect::<Result<_>>()?;
    if peer_addrs.is_empty() && !cfg.main_node {
        return Err(RtError::Config(
            "a node with no peers must be the main node".to_string(),
        ));
    }
    if peer_addrs.contains(&me.addr()) {
        return Err(RtError::Config(
            "peers must not include this node's own address".to_string(),
        ));
    }

    // Higher address dials lower, so each pair has exactly one link.
    let dial_targets: Vec<std::net::SocketAddr> = peer_addrs
        .iter()
        .copied()
        .filter(|a| *a < me.addr())
        .collect();
    let accept_n = peer_addrs.len() - dial_targets.len();

    let conns = tokio::time::timeout(
        STARTUP_DEADLINE,
        build_mesh(me, &listener, dial_targets, accept_n),
    )
    .await
    .map_err(|_| RtError::PeerUnreachable("startup deadline expired before mesh came up".to_string()))??;

    // Spawn link tasks.
    let closing = Arc::new(AtomicBool::new(false));
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Inbound>(1024);
    let mut links = HashMap::new();
    for (peer, stream) in conns {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel::<Msg>(256);
        links.insert(peer, tx);
        tokio::spawn(reader_loop(
            peer,
            read_half,
            inbound_tx.clone(),
            closing.clone(),
        ));
        tokio::spawn(writer_loop(
            peer,
            write_half,
            rx,
            inbound_tx.clone(),
            closing.clone(),
        ));
    }
    let comm = Comm {
        links,
        counters,
        closing,
    };

    // Node list: main publishes, everyone else waits for it.  Messages from
    // fast peers that already have the list are buffered and replayed into
    // the dispatcher.
    let mut pending = Vec::new();
    if cfg.main_node {
        let mut others: Vec<NodeId> = comm.links.keys().copied().collect();
        others.sort();
        let mut nodes = vec![me];
        nodes.extend(others);
        location::set_all_nodes(nodes.clone())?;
        comm.broadcast(Msg::NodeList { nodes }).await?;
    } else {
        let deadline = tokio::time::Instant::now() + STARTUP_DEADLINE;
        loop {
            let ev = tokio::time::timeout_at(deadline, inbound_rx.recv())
                .await
                .map_err(|_| {
                    RtError::PeerUnreachable("no node list received from main".to_string())
                })?
                .ok_or_else(|| RtError::Internal("inbound channel closed at startup".to_string()))?;
            match ev {
                Inbound::Msg(_, Msg::NodeList { nodes }) => {
                    if !nodes.contains(&me) {
                        return Err(RtError::Config(format!(
                            "published node list does not contain this node ({me})"
                        )));
                    }
                    location::set_all_nodes(nodes)?;
                    break;
                }
                Inbound::Msg(from, msg) => pending.push(Inbound::Msg(from, msg)),
                Inbound::Lost(peer, err) => {
                    return Err(RtError::PeerUnreachable(format!("{peer}: {err}")));
                }
            }
        }
    }

    Ok((comm, inbound_rx, pending))
}

async fn build_mesh(
    me: NodeId,
    listener: &TcpListener,
    dial_targets: Vec<std::net::SocketAddr>,
    accept_n: usize,
) -> Result<Vec<(NodeId, TcpStream)>> {
    let dial = async {
        let mut out = Vec::new();
        for addr in dial_targets {
            let mut stream = dial_with_retry(addr).await?;
            send_frame(&mut stream, &Msg::Hello { from: me }.encode()?).await?;
            let frame = recv_frame(&mut stream).await?;
            let peer = match Msg::decode(&frame)? {
                Msg::Hello { from } => from,
                other => {
                    return Err(RtError::WireDecode(format!(
                        "expected HELLO from {addr}, got {}",
                        other.kind()
                    )))
                }
            };
            if peer.addr() != addr {
                tracing::warn!(target: "shoal", dialed = %addr, identity = %peer,
                    "peer identity differs from configured address");
            }
            out.push((peer, stream));
        }
        Ok::<_, RtError>(out)
    };
    let accept = async {
        let mut out = Vec::new();
        while out.len() < accept_n {
            let (mut stream, _) = listener.accept().await?;
            let frame = recv_frame(&mut stream).await?;
            let peer = match Msg::decode(&frame)? {
                Msg::Hello { from } => from,
                other => {
                    return Err(RtError::WireDecode(format!(
                        "expected HELLO on inbound link, got {}",
                        other.kind()
                    )))
                }
            };
            send_frame(&mut stream, &Msg::Hello { from: me }.encode()?).await?;
            out.push((peer, stream));
        }
        Ok::<_, RtError>(out)
    };
    let (mut dialed, accepted) = tokio::try_join!(dial, accept)?;
    dialed.extend(accepted);
    Ok(dialed)
}

async fn dial_with_retry(addr: std::net::SocketAddr) -> Result<TcpStream> {
    // Peers boot in arbitrary order; keep knocking until the startup
    // deadline (enforced by the caller) cuts us off.
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(_) => tokio::time::sleep(DIAL_RETRY).await,
        }
    }
}

// ── Link tasks ────────────────────────────────────────────────────────────────

async fn reader_loop(
    peer: NodeId,
    mut half: OwnedReadHalf,
    tx: mpsc::Sender<Inbound>,
    closing: Arc<AtomicBool>,
) {
    loop {
        match recv_frame(&mut half).await {
            Ok(frame) => match Msg::decode(&frame) {
                Ok(msg) => {
                    if tx.send(Inbound::Msg(peer, msg)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // Malformed envelope: the connection is unusable from
                    // here on; treat the peer as failed.
                    let _ = tx.send(Inbound::Lost(peer, e.to_string())).await;
                    break;
                }
            },
            Err(e) => {
                if !closing.load(Ordering::Relaxed) {
                    let _ = tx.send(Inbound::Lost(peer, e.to_string())).await;
                }
                break;
            }
        }
    }
}

async fn writer_loop(
    peer: NodeId,
    mut half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Msg>,
    tx: mpsc::Sender<Inbound>,
    closing: Arc<AtomicBool>,
) {
    while let Some(msg) = rx.recv().await {
        let frame = match msg.encode() {
            Ok(f) => f,
            Err(e) => {
                let _ = tx.send(Inbound::Lost(peer, e.to_string())).await;
                break;
            }
        };
        if let Err(e) = send_frame(&mut half, &frame).await {
            if !closing.load(Ordering::Relaxed) {
                let _ = tx.send(Inbound::Lost(peer, e.to_string())).await;
            }
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            send_frame(&mut stream, b"hello frame").await.unwrap();
            recv_frame(&mut stream).await.unwrap()
        });
        let (mut server, _) = listener.accept().await.unwrap();
        assert_eq!(recv_frame(&mut server).await.unwrap(), b"hello frame");
        send_frame(&mut server, b"and back").await.unwrap();
        assert_eq!(client.await.unwrap(), b"and back");
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_send() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let _held = accept.await.unwrap();
        let huge = vec![0u8; MAX_FRAME_BYTES + 1];
        assert!(send_frame(&mut stream, &huge).await.is_err());
    }
}
