//! Thin, lossy datagram layer: a timestamping send path and a timestamping
//! receive path, both exposed as pull-based queues.
//!
//! Nothing here retries or orders anything. [`Outbound::send`] encodes the
//! envelope, queues it for the socket writer task and reports the send on two
//! feeds: every send goes to the pinger's feed, ack-required sends also go to
//! the delivery controller's feed.

use crate::error::NodeError;
use log::{debug, error, warn};
use shared::{encode, Envelope, Message, PeerId, MAX_DATAGRAM_SIZE};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Record of an envelope handed to the socket writer.
#[derive(Debug, Clone)]
pub struct SentDatagram {
    pub envelope: Envelope,
    /// Destination, the announcement group for multicasts.
    pub addr: SocketAddr,
    pub sent_at: Instant,
}

/// Raw inbound datagram tagged with its source and receipt time.
#[derive(Debug, Clone)]
pub struct ReceivedDatagram {
    /// Undecoded payload.
    pub bytes: Vec<u8>,
    /// Source address.
    pub addr: SocketAddr,
    pub received_at: Instant,
}

/// Consumer ends of the send-activity feeds.
pub struct SendFeeds {
    /// Every send, for the pinger.
    pub sent: mpsc::UnboundedReceiver<SentDatagram>,
    /// Sends awaiting an ack, for the delivery controller.
    pub ack_required: mpsc::UnboundedReceiver<SentDatagram>,
}

/// Cloneable send handle shared by every component that emits envelopes.
#[derive(Clone)]
pub struct Outbound {
    socket_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    sent_tx: mpsc::UnboundedSender<SentDatagram>,
    ack_tx: mpsc::UnboundedSender<SentDatagram>,
    next_seq: Arc<AtomicU64>,
    local_id: Arc<watch::Sender<Option<PeerId>>>,
    group: Option<SocketAddr>,
}

impl Outbound {
    /// Builds a send handle whose datagrams land in the returned receiver
    /// instead of a socket.
    pub fn channel(
        group: Option<SocketAddr>,
    ) -> (Outbound, SendFeeds, mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>) {
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent) = mpsc::unbounded_channel();
        let (ack_tx, ack_required) = mpsc::unbounded_channel();
        let (local_id, _) = watch::channel(None);

        let outbound = Outbound {
            socket_tx,
            sent_tx,
            ack_tx,
            next_seq: Arc::new(AtomicU64::new(0)),
            local_id: Arc::new(local_id),
            group,
        };
        (outbound, SendFeeds { sent, ack_required }, socket_rx)
    }

    /// Id stamped as sender on new envelopes, `None` before joining.
    pub fn local_id(&self) -> Option<PeerId> {
        *self.local_id.borrow()
    }

    pub fn set_local_id(&self, id: Option<PeerId>) {
        self.local_id.send_replace(id);
    }

    /// Next sequence number, unique per node for its whole lifetime.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Fresh envelope from the local peer with the next sequence number.
    pub fn envelope(&self, receiver: Option<PeerId>, message: Message) -> Envelope {
        Envelope {
            seq: self.next_seq(),
            sender: self.local_id(),
            receiver,
            message,
        }
    }

    /// Sends `envelope`, registering it for acknowledgement when its type
    /// requires one.
    pub fn send(&self, envelope: Envelope, addr: SocketAddr) -> Result<SentDatagram, NodeError> {
        let ack_required = envelope.message.requires_ack();
        self.transmit(envelope, addr, ack_required)
    }

    /// Sends `envelope` once, never retransmitting it.
    pub fn send_without_ack(
        &self,
        envelope: Envelope,
        addr: SocketAddr,
    ) -> Result<SentDatagram, NodeError> {
        self.transmit(envelope, addr, false)
    }

    /// Sends to the announcement group. A no-op without a configured group.
    pub fn multicast(&self, envelope: Envelope) -> Result<Option<SentDatagram>, NodeError> {
        match self.group {
            Some(group) => self.transmit(envelope, group, false).map(Some),
            None => Ok(None),
        }
    }

    fn transmit(
        &self,
        envelope: Envelope,
        addr: SocketAddr,
        ack_required: bool,
    ) -> Result<SentDatagram, NodeError> {
        let bytes = encode(&envelope)?;
        let sent = SentDatagram {
            envelope,
            addr,
            sent_at: Instant::now(),
        };

        // Registered before the datagram can leave, so an ack can never
        // arrive ahead of its pending entry. Feeds whose consumer has
        // stopped are simply not reported to.
        if ack_required {
            let _ = self.ack_tx.send(sent.clone());
        }
        let _ = self.sent_tx.send(sent.clone());

        self.socket_tx
            .send((bytes, addr))
            .map_err(|_| NodeError::TransportClosed)?;
        Ok(sent)
    }
}

/// Bound sockets waiting to be started.
///
/// - A unicast socket for all peer traffic
/// - Optionally a second socket joined to the announcement group
pub struct Transport {
    socket: Arc<UdpSocket>,
    multicast: Option<Arc<UdpSocket>>,
    group: Option<SocketAddr>,
}

/// Running transport: handles, feeds and the inbound queue.
pub struct TransportQueues {
    /// Send handle feeding the socket writer.
    pub outbound: Outbound,
    pub feeds: SendFeeds,
    /// Datagrams from both sockets, in arrival order.
    pub inbound: mpsc::UnboundedReceiver<ReceivedDatagram>,
    /// Writer and reader tasks, aborted by the owner.
    pub tasks: Vec<JoinHandle<()>>,
}

impl Transport {
    /// Binds the unicast socket, and the group socket when `group` is set.
    /// A group that cannot be joined only disables discovery.
    pub async fn bind(bind_addr: SocketAddr, group: Option<SocketAddr>) -> Result<Self, NodeError> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);

        let multicast = match group {
            Some(group) => match bind_multicast(group) {
                Ok(socket) => Some(Arc::new(socket)),
                Err(e) => {
                    warn!("Session discovery disabled: {}", e);
                    None
                }
            },
            None => None,
        };

        Ok(Transport {
            socket,
            multicast,
            group,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NodeError> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawns the socket writer and one reader per socket.
    pub fn start(self) -> TransportQueues {
        let (outbound, feeds, mut socket_rx) = Outbound::channel(self.group);
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();

        let socket = Arc::clone(&self.socket);
        tasks.push(tokio::spawn(async move {
            while let Some((bytes, addr)) = socket_rx.recv().await {
                if let Err(e) = socket.send_to(&bytes, addr).await {
                    error!("Failed to send datagram to {}: {}", addr, e);
                }
            }
        }));

        tasks.push(spawn_reader(Arc::clone(&self.socket), inbound_tx.clone()));
        if let Some(multicast) = self.multicast {
            tasks.push(spawn_reader(multicast, inbound_tx));
        }

        TransportQueues {
            outbound,
            feeds,
            inbound,
            tasks,
        }
    }
}

fn spawn_reader(
    socket: Arc<UdpSocket>,
    inbound_tx: mpsc::UnboundedSender<ReceivedDatagram>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            match socket.recv_from(&mut buffer).await {
                Ok((len, addr)) => {
                    let datagram = ReceivedDatagram {
                        bytes: buffer[..len].to_vec(),
                        addr,
                        received_at: Instant::now(),
                    };
                    if inbound_tx.send(datagram).is_err() {
                        debug!("Inbound queue closed, stopping reader");
                        break;
                    }
                }
                Err(e) => {
                    error!("Error receiving datagram: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    })
}

fn bind_multicast(group: SocketAddr) -> Result<UdpSocket, NodeError> {
    let wrap = |source: std::io::Error| NodeError::Multicast { group, source };

    let socket = Socket::new(Domain::for_address(group), Type::DGRAM, Some(Protocol::UDP))
        .map_err(wrap)?;
    socket.set_reuse_address(true).map_err(wrap)?;

    let any: IpAddr = match group.ip() {
        IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        IpAddr::V6(_) => std::net::Ipv6Addr::UNSPECIFIED.into(),
    };
    socket
        .bind(&SocketAddr::new(any, group.port()).into())
        .map_err(wrap)?;
    match group.ip() {
        IpAddr::V4(ip) => socket
            .join_multicast_v4(&ip, &Ipv4Addr::UNSPECIFIED)
            .map_err(wrap)?,
        IpAddr::V6(ip) => socket.join_multicast_v6(&ip, 0).map_err(wrap)?,
    }
    socket.set_nonblocking(true).map_err(wrap)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(wrap)
}
