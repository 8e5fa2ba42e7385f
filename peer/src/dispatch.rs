//! Inbound message handling.
//!
//! Each datagram is decoded, checked against the address whitelist,
//! reported to the liveness detector, deduplicated and acknowledged. Acks go
//! to the delivery controller and ROLE_CHANGE goes to the role manager's
//! queue. JOIN, STATE, STEER, ERROR and ANNOUNCEMENT are handled here.

use crate::announce::session_info;
use crate::delivery::AckKey;
use crate::links::Links;
use crate::liveness::InboundActivity;
use crate::roles::{RoleEvent, RoleManager};
use crate::session::{NodeEvent, Session};
use crate::state_loop::InputQueue;
use crate::transport::{Outbound, ReceivedDatagram};
use log::{debug, info, warn};
use shared::{decode, Direction, Envelope, GameState, Message, NodeRole, PeerId, Player};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const NOT_A_MASTER: &str = "Not a master node";
pub const NO_PLACE: &str = "No place on the field, try again later";

/// Queues the dispatcher feeds.
pub struct Routes {
    pub acks: mpsc::UnboundedSender<AckKey>,
    pub activity: mpsc::UnboundedSender<InboundActivity>,
    pub role_events: mpsc::UnboundedSender<RoleEvent>,
    pub events: mpsc::UnboundedSender<NodeEvent>,
}

pub struct Dispatcher {
    session: Arc<Session>,
    outbound: Outbound,
    links: Arc<Links>,
    roles: Arc<RoleManager>,
    inputs: Arc<InputQueue>,
    routes: Routes,
    local_addr: SocketAddr,
}

impl Dispatcher {
    pub fn new(
        session: Arc<Session>,
        outbound: Outbound,
        links: Arc<Links>,
        roles: Arc<RoleManager>,
        inputs: Arc<InputQueue>,
        routes: Routes,
        local_addr: SocketAddr,
    ) -> Self {
        Self {
            session,
            outbound,
            links,
            roles,
            inputs,
            routes,
            local_addr,
        }
    }

    pub async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<ReceivedDatagram>) {
        while let Some(datagram) = inbound.recv().await {
            self.handle(datagram).await;
        }
        debug!("Inbound queue closed, dispatcher stopping");
    }

    pub async fn handle(&self, datagram: ReceivedDatagram) {
        let addr = datagram.addr;
        let envelope = match decode(&datagram.bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.reject_malformed(addr, &e.to_string());
                return;
            }
        };

        let open = matches!(
            envelope.message,
            Message::Join { .. } | Message::Announcement { .. }
        );
        if !open && !self.links.is_allowed(&addr) {
            debug!(
                "Dropping {} from unknown address {}",
                envelope.message.name(),
                addr
            );
            return;
        }

        let Envelope {
            seq,
            sender,
            receiver,
            message,
        } = envelope;

        if let Some(peer) = sender.filter(|_| !open) {
            let _ = self.routes.activity.send(InboundActivity {
                peer,
                received_at: datagram.received_at,
            });
        }

        let requires_ack = message.requires_ack();
        if requires_ack {
            if let Some(peer) = sender {
                if !self.links.first_delivery(peer, seq) {
                    debug!(
                        "Duplicate {} #{} from peer {}, re-acknowledging",
                        message.name(),
                        seq,
                        peer
                    );
                    self.acknowledge(seq, receiver, sender, addr);
                    return;
                }
            }
        }

        match message {
            Message::Ack => {
                if let Some(peer) = sender {
                    let _ = self.routes.acks.send(AckKey { seq, peer });
                }
                self.on_ack(sender, receiver).await;
            }
            Message::Error { reason } => self.on_error(seq, sender, reason).await,
            Message::Ping => {}
            Message::Join {
                player_name,
                only_view,
            } => {
                // Acknowledged (or refused) by the handshake itself.
                self.on_join(seq, receiver, player_name, only_view, addr)
                    .await;
                return;
            }
            Message::State { state } => self.on_state(sender, state, addr).await,
            Message::Steer { direction } => self.on_steer(seq, sender, direction).await,
            Message::RoleChange {
                sender_role,
                receiver_role,
            } => match sender {
                Some(sender) => {
                    let _ = self.routes.role_events.send(RoleEvent::RoleChange {
                        sender,
                        addr,
                        sender_role,
                        receiver_role,
                    });
                }
                None => warn!("ROLE_CHANGE without a sender id from {}", addr),
            },
            message @ Message::Announcement { .. } => {
                let envelope = Envelope {
                    seq,
                    sender,
                    receiver,
                    message,
                };
                self.on_announcement(&envelope, addr);
            }
        }

        if requires_ack {
            self.acknowledge(seq, receiver, sender, addr);
        }
    }

    /// Acks `seq`, signing with the id the original was addressed to.
    fn acknowledge(
        &self,
        seq: u64,
        addressed_to: Option<PeerId>,
        acked: Option<PeerId>,
        addr: SocketAddr,
    ) {
        let ack = Envelope {
            seq,
            sender: addressed_to.or_else(|| self.outbound.local_id()),
            receiver: acked,
            message: Message::Ack,
        };
        if let Err(e) = self.outbound.send(ack, addr) {
            warn!("Failed to acknowledge #{} to {}: {}", seq, addr, e);
        }
    }

    fn reject(&self, seq: u64, addressed_to: Option<PeerId>, addr: SocketAddr, reason: String) {
        info!("Refusing {}: {}", addr, reason);
        let error = Envelope {
            seq,
            sender: addressed_to.or_else(|| self.outbound.local_id()),
            receiver: None,
            message: Message::Error { reason },
        };
        if let Err(e) = self.outbound.send_without_ack(error, addr) {
            warn!("Failed to send error to {}: {}", addr, e);
        }
    }

    fn reject_malformed(&self, addr: SocketAddr, reason: &str) {
        if !self.links.is_allowed(&addr) {
            warn!("Dropping undecodable datagram from unknown {}: {}", addr, reason);
            return;
        }
        warn!("Undecodable datagram from {}: {}", addr, reason);
        // Unsigned, so it can never be taken for an answer to one of the peer's sends.
        let error = Envelope {
            seq: self.outbound.next_seq(),
            sender: None,
            receiver: None,
            message: Message::Error {
                reason: format!("Malformed message: {}", reason),
            },
        };
        if let Err(e) = self.outbound.send_without_ack(error, addr) {
            warn!("Failed to send error to {}: {}", addr, e);
        }
    }

    async fn on_ack(&self, sender: Option<PeerId>, receiver: Option<PeerId>) {
        let mut roles = self.session.roles().await;
        if !roles.is_joining() || sender != roles.master {
            return;
        }
        let Some(id) = receiver else {
            return;
        };

        roles.self_id = Some(id);
        roles.started = true;
        self.outbound.set_local_id(Some(id));
        info!("Joined session as peer {} ({:?})", id, roles.self_role);

        let _ = self.routes.events.send(NodeEvent::GameStarted);
        if let Some(role) = roles.self_role {
            let _ = self.routes.events.send(NodeEvent::RoleChanged(role));
        }
    }

    /// An ERROR only answers our JOIN, so it settles a send only while joining.
    async fn on_error(&self, seq: u64, sender: Option<PeerId>, reason: String) {
        if self.session.roles().await.is_joining() {
            if let Some(peer) = sender {
                let _ = self.routes.acks.send(AckKey { seq, peer });
            }
        }
        warn!("Peer reported an error: {}", reason);
        let _ = self.routes.events.send(NodeEvent::Info(reason));
        let _ = self.routes.role_events.send(RoleEvent::JoinRejected);
    }

    async fn on_join(
        &self,
        seq: u64,
        addressed_to: Option<PeerId>,
        player_name: String,
        only_view: bool,
        addr: SocketAddr,
    ) {
        let mut guard = self.session.lock().await;
        let reply_as = addressed_to.or(guard.roles.self_id);

        if !guard.roles.is_master() {
            self.reject(seq, reply_as, addr, NOT_A_MASTER.to_string());
            return;
        }

        if let Some((known_seq, known_id)) = self.links.join_record(&addr) {
            if known_seq == seq {
                debug!("Repeated JOIN #{} from {}, re-acknowledging", seq, addr);
                self.acknowledge(seq, reply_as, Some(known_id), addr);
                return;
            }
            let still_present = guard
                .state
                .as_ref()
                .map_or(false, |state| state.players.contains_key(&known_id));
            if still_present {
                warn!("{} joins again, evicting peer {}", addr, known_id);
                self.roles
                    .handle_locked(&mut guard, RoleEvent::PeerInactive(known_id));
            }
        }

        let id = guard.roles.next_peer_id;
        let role = if only_view {
            NodeRole::Viewer
        } else {
            NodeRole::Normal
        };

        let state = guard.authoritative_mut();
        if state
            .players
            .values()
            .any(|player| player.name == player_name)
        {
            self.reject(
                seq,
                reply_as,
                addr,
                format!("Name \"{}\" is already used", player_name),
            );
            return;
        }
        if role == NodeRole::Normal && !self.roles.simulation().spawn(state, id) {
            self.reject(seq, reply_as, addr, NO_PLACE.to_string());
            return;
        }
        state
            .players
            .insert(id, Player::new(id, player_name.clone(), role, Some(addr)));
        guard.roles.next_peer_id = id + 1;

        self.links.record_join(addr, seq, id);
        self.links.link(id, addr);
        self.acknowledge(seq, reply_as, Some(id), addr);
        info!("{} joined as peer {} ({:?})", player_name, id, role);
    }

    async fn on_state(&self, sender: Option<PeerId>, mut state: GameState, addr: SocketAddr) {
        let Some(sender) = sender else {
            warn!("STATE without a sender id from {}", addr);
            return;
        };

        let mut guard = self.session.lock().await;
        if guard.roles.is_master() {
            warn!("Ignoring STATE {} from peer {} while master", state.order, sender);
            return;
        }
        if !guard.roles.started {
            debug!("Ignoring STATE before the session started");
            return;
        }
        if let Some(held) = guard.state.as_ref() {
            if !state.supersedes(held) {
                debug!("Ignoring stale STATE {} (holding {})", state.order, held.order);
                return;
            }
        }

        if let Some(player) = state.players.get_mut(&sender) {
            player.addr = Some(addr);
        }
        for peer_addr in state.players.values().filter_map(|player| player.addr) {
            self.links.allow(peer_addr);
        }
        let next_id = state.players.keys().max().map_or(0, |max| max + 1);
        guard.roles.next_peer_id = guard.roles.next_peer_id.max(next_id);

        let order = state.order;
        *guard.state = Some(state);
        self.roles
            .handle_locked(&mut guard, RoleEvent::StateReceived { sender, addr });
        let _ = self.routes.events.send(NodeEvent::StateChanged(order));
    }

    async fn on_steer(&self, seq: u64, sender: Option<PeerId>, direction: Direction) {
        let Some(sender) = sender else {
            return;
        };
        if !self.session.roles().await.is_master() {
            debug!("Ignoring STEER from peer {}: not master", sender);
            return;
        }
        if self.links.accept_steer(sender, seq) {
            self.inputs.push(sender, direction);
        } else {
            debug!("Ignoring out-of-order STEER #{} from peer {}", seq, sender);
        }
    }

    fn is_own(&self, addr: SocketAddr) -> bool {
        addr.port() == self.local_addr.port()
            && (addr.ip() == self.local_addr.ip() || self.local_addr.ip().is_unspecified())
    }

    fn on_announcement(&self, envelope: &Envelope, addr: SocketAddr) {
        if self.is_own(addr) {
            return;
        }
        if let Some(info) = session_info(envelope, addr) {
            let _ = self.routes.events.send(NodeEvent::SessionDiscovered(info));
        }
    }
}
