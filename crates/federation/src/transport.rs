//! Peer transport
//!
//! Newline-delimited JSON over TCP. Each side opens with a `handshake`
//! carrying its node id and public key; after that every line is one
//! [`WireMessage`] and the connection is bridged onto a node session with a
//! reader task and a writer task.
//!
//! [`link_in_memory`] wires two nodes in the same process together the same
//! way, without sockets.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use weave_protocol::{parse_public_key, NodeId, WireMessage, PROTOCOL_VERSION};

use crate::node::{Node, PeerSession};
use crate::registry::short_id;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake payload
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Hello {
    node_id: NodeId,
    public_key: String,
    name: String,
    version: String,
}

/// Accept peer connections until the listener fails.
pub fn spawn_listener(node: Node, listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Accepted connection from {}", addr);
                    let node = node.clone();
                    tokio::spawn(async move {
                        if let Err(e) = run_connection(node, stream).await {
                            warn!("Connection from {} ended: {:#}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    return;
                }
            }
        }
    })
}

/// Dial a peer and run the connection in the background.
pub async fn connect(node: &Node, addr: SocketAddr) -> Result<()> {
    info!("Connecting to peer: {}", addr);
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;

    let node = node.clone();
    tokio::spawn(async move {
        if let Err(e) = run_connection(node, stream).await {
            warn!("Connection to {} ended: {:#}", addr, e);
        }
    });
    Ok(())
}

async fn run_connection(node: Node, stream: TcpStream) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let hello = Hello {
        node_id: node.node_id().to_string(),
        public_key: hex::encode(node.public_key().as_bytes()),
        name: node.config().name.clone(),
        version: PROTOCOL_VERSION.to_string(),
    };
    let mut bytes = WireMessage::Handshake {
        payload: serde_json::to_value(&hello)?,
    }
    .to_bytes()?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;

    let line = timeout(HANDSHAKE_TIMEOUT, lines.next_line())
        .await
        .context("Handshake timed out")??
        .context("Connection closed before handshake")?;
    let hello = match WireMessage::from_bytes(line.as_bytes())? {
        WireMessage::Handshake { payload } => serde_json::from_value::<Hello>(payload)?,
        other => bail!("Expected handshake, got {}", other.kind()),
    };
    let public_key = parse_public_key(&hello.public_key)?;
    info!(
        "Handshake with {} ({}, protocol {})",
        hello.name,
        short_id(&hello.node_id),
        hello.version
    );

    let PeerSession {
        node_id,
        inbound,
        mut outbound,
    } = node.open_session(hello.node_id, public_key).await?;

    let writer_task = tokio::spawn(async move {
        while let Some(mut bytes) = outbound.recv().await {
            bytes.push(b'\n');
            if let Err(e) = writer.write_all(&bytes).await {
                debug!("Write failed: {}", e);
                break;
            }
        }
    });

    let result = async {
        while let Some(line) = lines.next_line().await? {
            if line.is_empty() {
                continue;
            }
            if inbound.send(line.into_bytes()).await.is_err() {
                break;
            }
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    writer_task.abort();
    node.disconnect(&node_id).await;
    result
}

/// Connect two in-process nodes with channel pumps.
pub async fn link_in_memory(a: &Node, b: &Node) -> Result<()> {
    let a_side = a
        .open_session(b.node_id().to_string(), b.public_key())
        .await?;
    let b_side = b
        .open_session(a.node_id().to_string(), a.public_key())
        .await?;

    tokio::spawn(pump(a_side.outbound, b_side.inbound));
    tokio::spawn(pump(b_side.outbound, a_side.inbound));
    Ok(())
}

async fn pump(mut from: mpsc::Receiver<Vec<u8>>, to: mpsc::Sender<Vec<u8>>) {
    while let Some(bytes) = from.recv().await {
        if to.send(bytes).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeConfig;

    fn local_config() -> NodeConfig {
        NodeConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_tcp_handshake_registers_both_sides() {
        let a = Node::new(local_config()).unwrap();
        let b = Node::new(local_config()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _accept = spawn_listener(a.clone(), listener);

        connect(&b, addr).await.unwrap();

        for _ in 0..100 {
            if a.stats().await.peers == 1 && b.stats().await.peers == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(a.node_ids().await.len(), 2);
        assert_eq!(b.node_ids().await.len(), 2);
        assert!(a.node_ids().await.contains(&b.node_id().to_string()));
    }

    #[tokio::test]
    async fn test_in_memory_link_carries_events() {
        let a = Node::new(local_config()).unwrap();
        let b = Node::new(local_config()).unwrap();
        link_in_memory(&a, &b).await.unwrap();

        a.submit_transaction(b"ping".to_vec()).await;
        let hash = a.create_event().await.unwrap().unwrap();

        let mut arrived = false;
        for _ in 0..100 {
            if b.graph().read().await.get_event(&hash).is_some() {
                arrived = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(arrived);
    }
}
