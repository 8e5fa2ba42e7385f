//! Loopback helpers shared by the root test suites.

#![allow(dead_code)]

use peer::{Node, NodeConfig, NodeEvent, SessionInfo};
use shared::{decode, encode, Envelope, GameConfig, Message, PeerId};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Instant};

pub fn loopback_config(name: &str) -> NodeConfig {
    NodeConfig {
        player_name: name.to_string(),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        multicast_group: None,
        ..NodeConfig::default()
    }
}

pub fn session_at(addr: SocketAddr, master_id: PeerId) -> SessionInfo {
    let config = GameConfig::default();
    SessionInfo {
        master_id,
        master_name: "host".to_string(),
        deputy_id: None,
        addr,
        width: config.width,
        height: config.height,
        players: 1,
        can_join: true,
        config,
    }
}

/// Waits until `events` yields something matching `wanted`.
pub async fn wait_for<F>(events: &mut UnboundedReceiver<NodeEvent>, within: Duration, wanted: F) -> bool
where
    F: Fn(&NodeEvent) -> bool,
{
    let deadline = Instant::now() + within;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match timeout(left, events.recv()).await {
            Ok(Some(event)) if wanted(&event) => return true,
            Ok(Some(_)) => continue,
            _ => return false,
        }
    }
}

/// Everything `events` yields during `window`.
pub async fn collect_events(events: &mut UnboundedReceiver<NodeEvent>, window: Duration) -> Vec<NodeEvent> {
    let deadline = Instant::now() + window;
    let mut seen = Vec::new();
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match timeout(left, events.recv()).await {
            Ok(Some(event)) => seen.push(event),
            _ => return seen,
        }
    }
}

/// A hand-driven peer speaking the wire format over a plain socket.
pub struct RawPeer {
    pub socket: UdpSocket,
    pub id: Option<PeerId>,
    next_seq: u64,
}

impl RawPeer {
    pub async fn bind() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            id: None,
            next_seq: 1,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub async fn send(&self, envelope: &Envelope, to: SocketAddr) {
        self.socket.send_to(&encode(envelope).unwrap(), to).await.unwrap();
    }

    pub async fn send_message(&mut self, receiver: Option<PeerId>, message: Message, to: SocketAddr) -> Envelope {
        let envelope = Envelope {
            seq: self.next_seq(),
            sender: self.id,
            receiver,
            message,
        };
        self.send(&envelope, to).await;
        envelope
    }

    pub async fn recv(&self, within: Duration) -> Option<(Envelope, SocketAddr)> {
        let mut buf = vec![0u8; shared::MAX_DATAGRAM_SIZE];
        let (len, from) = timeout(within, self.socket.recv_from(&mut buf)).await.ok()?.ok()?;
        Some((decode(&buf[..len]).unwrap(), from))
    }

    pub async fn ack(&self, envelope: &Envelope, to: SocketAddr) {
        self.send(&envelope.ack(self.id, envelope.sender), to).await;
    }

    /// Receives during `window`, acknowledging whatever needs it.
    pub async fn drain_acking(&self, window: Duration) -> Vec<(Envelope, SocketAddr)> {
        let deadline = Instant::now() + window;
        let mut seen = Vec::new();
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return seen;
            }
            let Some((envelope, from)) = self.recv(left).await else {
                return seen;
            };
            if envelope.message.requires_ack() {
                self.ack(&envelope, from).await;
            }
            seen.push((envelope, from));
        }
    }

    /// Joins the session hosted at `master` and returns the assigned id.
    pub async fn join(&mut self, name: &str, master: SocketAddr) -> Result<PeerId, String> {
        let join = self
            .send_message(
                Some(0),
                Message::Join {
                    player_name: name.to_string(),
                    only_view: false,
                },
                master,
            )
            .await;

        let deadline = Instant::now() + Duration::from_secs(2);
        while let Some((reply, _)) = self.recv(deadline.saturating_duration_since(Instant::now())).await {
            match reply.message {
                Message::Ack if reply.seq == join.seq => {
                    let id = reply.receiver.ok_or("ack without an assigned id")?;
                    self.id = Some(id);
                    return Ok(id);
                }
                Message::Error { reason } => return Err(reason),
                _ => continue,
            }
        }
        Err("no answer to join".to_string())
    }
}

pub async fn host(name: &str) -> (Node, UnboundedReceiver<NodeEvent>) {
    let (node, events) = Node::start(loopback_config(name)).await.unwrap();
    node.start_own_game().await;
    (node, events)
}
