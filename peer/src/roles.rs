//! Role succession.
//!
//! Every role-affecting event (a silent peer, a ROLE_CHANGE, players killed in
//! the simulation, a local exit) goes through [`transition`], a function of
//! the current [`RoleView`] and snapshot that mutates both and returns the
//! [`Effect`]s to carry out. The [`RoleManager`] task takes events one at a
//! time, under both session locks, so an election triggered by one failure is
//! complete before the next failure is looked at.
//!
//! | local role | event                           | action                                        |
//! |------------|---------------------------------|-----------------------------------------------|
//! | MASTER     | deputy inactive                 | drop it, elect a new deputy                   |
//! | MASTER     | other peer inactive             | drop it, retire its snake                     |
//! | MASTER     | ROLE_CHANGE(sender VIEWER)      | mark sender VIEWER, re-elect if it was deputy |
//! | MASTER     | players eliminated              | demote them to VIEWER, hand off if self died  |
//! | DEPUTY     | master inactive                 | take over, elect, announce MASTER to everyone |
//! | NORMAL     | master inactive                 | follow the deputy, or tear down without one   |
//! | any        | ROLE_CHANGE(receiver DEPUTY)    | become DEPUTY                                 |
//! | any        | ROLE_CHANGE(receiver MASTER)    | take over from the sender                     |
//! | any        | ROLE_CHANGE(sender MASTER)      | follow the sender                             |
//! | any        | ROLE_CHANGE(receiver VIEWER)    | become VIEWER                                 |
//! | any        | exit                            | hand off or say goodbye, then tear down       |

use crate::game::Simulation;
use crate::links::Links;
use crate::session::{NodeEvent, RoleView, Session, SessionGuard};
use crate::transport::Outbound;
use log::{debug, info, warn};
use shared::{GameState, Message, NodeRole, PeerId};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum RoleEvent {
    /// The liveness detector gave up on a peer.
    PeerInactive(PeerId),
    RoleChange {
        sender: PeerId,
        addr: SocketAddr,
        sender_role: Option<NodeRole>,
        receiver_role: Option<NodeRole>,
    },
    /// Players whose snakes died in the last tick.
    Eliminated(Vec<PeerId>),
    /// A state from `sender` replaced the local copy.
    StateReceived { sender: PeerId, addr: SocketAddr },
    /// The deputy slot may be empty after a join.
    DeputyVacancy,
    JoinRejected,
    ConnectTimeout { attempt: u64 },
    Exit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send {
        to: PeerId,
        addr: SocketAddr,
        sender_role: Option<NodeRole>,
        receiver_role: Option<NodeRole>,
        ack: bool,
    },
    Link {
        peer: PeerId,
        addr: SocketAddr,
    },
    Unlink(PeerId),
    /// Forget every link and the local identity.
    Reset,
    Notify(NodeEvent),
}

struct Transition<'a> {
    roles: &'a mut RoleView,
    state: &'a mut Option<GameState>,
    sim: &'a dyn Simulation,
    effects: Vec<Effect>,
}

/// Applies `event` to the view and snapshot, returning what has to be done
/// outside of them.
pub fn transition(
    roles: &mut RoleView,
    state: &mut Option<GameState>,
    sim: &dyn Simulation,
    event: RoleEvent,
) -> Vec<Effect> {
    let mut t = Transition {
        roles,
        state,
        sim,
        effects: Vec::new(),
    };

    match event {
        RoleEvent::PeerInactive(peer) => t.peer_inactive(peer),
        RoleEvent::RoleChange {
            sender,
            addr,
            sender_role,
            receiver_role,
        } => t.role_change(sender, addr, sender_role, receiver_role),
        RoleEvent::Eliminated(players) => t.eliminated(&players),
        RoleEvent::StateReceived { sender, addr } => t.state_received(sender, addr),
        RoleEvent::DeputyVacancy => {
            t.elect_deputy(None);
        }
        RoleEvent::JoinRejected => {
            if t.roles.is_joining() {
                t.teardown(NodeEvent::ConnectionFailed);
            }
        }
        RoleEvent::ConnectTimeout { attempt } => {
            if t.roles.is_joining() && t.roles.attempt == attempt {
                info!("No answer to join request, giving up");
                t.teardown(NodeEvent::ConnectionFailed);
            }
        }
        RoleEvent::Exit => t.exit(),
    }

    t.effects
}

impl Transition<'_> {
    fn notify(&mut self, event: NodeEvent) {
        self.effects.push(Effect::Notify(event));
    }

    fn addr_of(&self, peer: PeerId) -> Option<SocketAddr> {
        self.state
            .as_ref()
            .and_then(|state| state.players.get(&peer))
            .and_then(|player| player.addr)
    }

    fn send(
        &mut self,
        to: PeerId,
        sender_role: Option<NodeRole>,
        receiver_role: Option<NodeRole>,
        ack: bool,
    ) {
        match self.addr_of(to) {
            Some(addr) => self.effects.push(Effect::Send {
                to,
                addr,
                sender_role,
                receiver_role,
                ack,
            }),
            None => debug!("No address for peer {}, ROLE_CHANGE not sent", to),
        }
    }

    fn set_master(&mut self, master: Option<PeerId>) {
        if self.roles.master != master {
            self.roles.master = master;
            self.notify(NodeEvent::MasterChanged(master));
        }
    }

    fn note_self(&mut self, peer: PeerId, role: NodeRole) {
        if self.roles.self_id == Some(peer) && self.roles.self_role != Some(role) {
            info!("Local role: {:?} -> {:?}", self.roles.self_role, role);
            self.roles.self_role = Some(role);
            self.notify(NodeEvent::RoleChanged(role));
        }
    }

    /// Gives `peer` `role` in the roster and the view. A new MASTER demotes
    /// any other master to VIEWER and a new DEPUTY any other deputy to NORMAL.
    fn assign(&mut self, peer: PeerId, role: NodeRole) {
        let mut demoted = Vec::new();
        if let Some(state) = self.state.as_mut() {
            for player in state.players.values_mut() {
                if player.id == peer {
                    player.role = role;
                    continue;
                }
                let demotion = match (role, player.role) {
                    (NodeRole::Master, NodeRole::Master) => Some(NodeRole::Viewer),
                    (NodeRole::Deputy, NodeRole::Deputy) => Some(NodeRole::Normal),
                    _ => None,
                };
                if let Some(demotion) = demotion {
                    player.role = demotion;
                    demoted.push((player.id, demotion));
                }
            }
        }
        for (id, demotion) in demoted {
            self.note_self(id, demotion);
        }
        self.note_self(peer, role);

        match role {
            NodeRole::Master => {
                if self.roles.deputy == Some(peer) {
                    self.roles.deputy = None;
                }
                self.set_master(Some(peer));
            }
            NodeRole::Deputy => {
                if self.roles.master == Some(peer) {
                    self.set_master(None);
                }
                self.roles.deputy = Some(peer);
            }
            NodeRole::Normal | NodeRole::Viewer => {
                if self.roles.master == Some(peer) {
                    self.set_master(None);
                }
                if self.roles.deputy == Some(peer) {
                    self.roles.deputy = None;
                }
            }
        }
    }

    /// Drops `peer` from the roster; its snake is left to wander.
    fn remove_player(&mut self, peer: PeerId) {
        if let Some(state) = self.state.as_mut() {
            self.sim.retire(state, peer);
            if state.players.remove(&peer).is_some() {
                info!("Removed player {} from the roster", peer);
            }
        }
        if self.roles.master == Some(peer) {
            self.set_master(None);
        }
        if self.roles.deputy == Some(peer) {
            self.roles.deputy = None;
        }
        self.effects.push(Effect::Unlink(peer));
    }

    fn candidate(&self) -> Option<PeerId> {
        let state = self.state.as_ref()?;
        state
            .players
            .values()
            .find(|player| {
                player.role == NodeRole::Normal
                    && Some(player.id) != self.roles.self_id
                    && player.addr.is_some()
            })
            .map(|player| player.id)
    }

    /// Fills an empty deputy slot with the first NORMAL peer and tells it,
    /// optionally declaring the master's own role in the same message.
    fn elect_deputy(&mut self, announce_as: Option<NodeRole>) -> Option<PeerId> {
        if !self.roles.is_master() || self.roles.deputy.is_some() {
            return None;
        }
        let deputy = self.candidate()?;
        info!("Electing peer {} as deputy", deputy);
        self.assign(deputy, NodeRole::Deputy);
        self.send(deputy, announce_as, Some(NodeRole::Deputy), true);
        Some(deputy)
    }

    /// Makes the local peer MASTER, links every other player and tells them.
    fn take_over(&mut self) {
        let Some(me) = self.roles.self_id else {
            return;
        };
        let Some(state) = self.state.as_ref() else {
            warn!("Cannot take over without a game state");
            self.teardown(NodeEvent::Disconnected);
            return;
        };

        let others: Vec<(PeerId, SocketAddr)> = state
            .players
            .values()
            .filter(|player| player.id != me)
            .filter_map(|player| player.addr.map(|addr| (player.id, addr)))
            .collect();

        info!("Taking over as master");
        self.assign(me, NodeRole::Master);
        for (peer, addr) in &others {
            self.effects.push(Effect::Link {
                peer: *peer,
                addr: *addr,
            });
        }

        let deputy = self.elect_deputy(Some(NodeRole::Master));
        for (peer, _) in others {
            if Some(peer) != deputy {
                self.send(peer, Some(NodeRole::Master), None, true);
            }
        }
    }

    /// Follows `master`, reachable at `addr`.
    fn adopt_master(&mut self, master: PeerId, addr: SocketAddr) {
        if self.roles.master == Some(master) {
            return;
        }
        if self.roles.is_master() && self.roles.self_id != Some(master) {
            warn!("Peer {} claims MASTER, stepping down", master);
            if let Some(me) = self.roles.self_id {
                self.assign(me, NodeRole::Normal);
            }
        }

        let previous = self.roles.master;
        if let Some(player) = self
            .state
            .as_mut()
            .and_then(|state| state.players.get_mut(&master))
        {
            player.addr = Some(addr);
        }
        self.assign(master, NodeRole::Master);
        if let Some(previous) = previous.filter(|previous| *previous != master) {
            self.effects.push(Effect::Unlink(previous));
        }
        self.effects.push(Effect::Link { peer: master, addr });
    }

    fn teardown(&mut self, event: NodeEvent) {
        info!("Leaving session");
        self.roles.reset();
        *self.state = None;
        self.effects.push(Effect::Reset);
        self.notify(event);
    }

    fn peer_inactive(&mut self, peer: PeerId) {
        let Some(role) = self.roles.self_role else {
            return;
        };
        if self.roles.is_joining() {
            if self.roles.master == Some(peer) {
                info!("Master {} went silent before accepting us", peer);
                self.teardown(NodeEvent::ConnectionFailed);
            }
            return;
        }
        if self.roles.self_id == Some(peer) {
            return;
        }

        let is_master = self.roles.master == Some(peer);
        match role {
            NodeRole::Master => {
                let was_deputy = self.roles.deputy == Some(peer);
                info!("Peer {} timed out", peer);
                self.remove_player(peer);
                if was_deputy {
                    self.elect_deputy(None);
                }
            }
            NodeRole::Deputy if is_master => {
                info!("Master {} timed out, deputy takes over", peer);
                self.remove_player(peer);
                self.take_over();
            }
            NodeRole::Normal | NodeRole::Viewer if is_master => {
                let deputy = self
                    .roles
                    .deputy
                    .filter(|deputy| Some(*deputy) != self.roles.self_id);
                match deputy.and_then(|deputy| self.addr_of(deputy).map(|addr| (deputy, addr))) {
                    Some((deputy, addr)) => {
                        info!("Master {} timed out, following deputy {}", peer, deputy);
                        self.assign(deputy, NodeRole::Master);
                        self.effects.push(Effect::Unlink(peer));
                        self.effects.push(Effect::Link { peer: deputy, addr });
                    }
                    None => {
                        info!("Master {} timed out with no deputy", peer);
                        self.teardown(NodeEvent::Disconnected);
                    }
                }
            }
            _ => self.effects.push(Effect::Unlink(peer)),
        }
    }

    fn role_change(
        &mut self,
        sender: PeerId,
        addr: SocketAddr,
        sender_role: Option<NodeRole>,
        receiver_role: Option<NodeRole>,
    ) {
        if !self.roles.in_session() || !self.roles.started {
            debug!("ROLE_CHANGE from {} outside of a session", sender);
            return;
        }
        let Some(me) = self.roles.self_id else {
            return;
        };

        match (sender_role, receiver_role) {
            (_, Some(NodeRole::Viewer)) => {
                if let Some(sender_role) = sender_role {
                    self.assign(sender, sender_role);
                }
                info!("Our snake died");
                self.assign(me, NodeRole::Viewer);
                self.notify(NodeEvent::YouDied);
            }
            (_, Some(NodeRole::Deputy)) => {
                if self.roles.self_role == Some(NodeRole::Viewer) {
                    warn!("Viewer cannot become deputy, ignoring peer {}", sender);
                    return;
                }
                if sender_role == Some(NodeRole::Master) {
                    self.adopt_master(sender, addr);
                }
                self.assign(me, NodeRole::Deputy);
            }
            (_, Some(NodeRole::Master)) => {
                if self.roles.self_role == Some(NodeRole::Viewer) {
                    warn!("Viewer cannot become master, ignoring peer {}", sender);
                    return;
                }
                info!("Peer {} hands the session over to us", sender);
                self.assign(sender, sender_role.unwrap_or(NodeRole::Viewer));
                self.take_over();
            }
            (Some(NodeRole::Master), _) => self.adopt_master(sender, addr),
            (Some(NodeRole::Viewer), _) => self.departure(sender),
            _ => debug!(
                "Ignoring ROLE_CHANGE from {}: {:?}/{:?}",
                sender, sender_role, receiver_role
            ),
        }
    }

    fn departure(&mut self, peer: PeerId) {
        if !self.roles.is_master() {
            self.assign(peer, NodeRole::Viewer);
            return;
        }
        let was_deputy = self.roles.deputy == Some(peer);
        info!("Player {} left the game", peer);
        self.assign(peer, NodeRole::Viewer);
        if let Some(state) = self.state.as_mut() {
            self.sim.retire(state, peer);
        }
        if was_deputy {
            self.elect_deputy(None);
        }
    }

    fn eliminated(&mut self, players: &[PeerId]) {
        if !self.roles.is_master() {
            return;
        }
        let Some(me) = self.roles.self_id else {
            return;
        };

        for &peer in players.iter().filter(|peer| **peer != me) {
            info!("Player {} was eliminated", peer);
            self.assign(peer, NodeRole::Viewer);
            self.send(peer, None, Some(NodeRole::Viewer), true);
        }

        if !players.contains(&me) {
            self.elect_deputy(None);
            return;
        }

        self.notify(NodeEvent::YouDied);
        let Some(successor) = self.roles.deputy.or_else(|| self.candidate()) else {
            info!("Our snake died and nobody can take over, staying master");
            return;
        };

        info!("Our snake died, handing over to peer {}", successor);
        let others: Vec<PeerId> = self
            .state
            .as_ref()
            .map(|state| {
                state
                    .players
                    .keys()
                    .copied()
                    .filter(|peer| *peer != me && *peer != successor)
                    .collect()
            })
            .unwrap_or_default();

        self.assign(me, NodeRole::Viewer);
        self.assign(successor, NodeRole::Master);
        self.send(
            successor,
            Some(NodeRole::Viewer),
            Some(NodeRole::Master),
            true,
        );
        for peer in others {
            self.effects.push(Effect::Unlink(peer));
        }
    }

    fn state_received(&mut self, sender: PeerId, addr: SocketAddr) {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        let roster_master = state.player_with_role(NodeRole::Master).map(|p| p.id);
        let roster_deputy = state.player_with_role(NodeRole::Deputy).map(|p| p.id);
        let roster_self = self
            .roles
            .self_id
            .and_then(|me| state.players.get(&me))
            .map(|player| (player.id, player.role));

        if roster_master == Some(sender) {
            self.adopt_master(sender, addr);
        }
        if self.roles.deputy != roster_deputy {
            self.roles.deputy = roster_deputy;
        }
        if let Some((me, role)) = roster_self {
            if role != NodeRole::Master {
                self.note_self(me, role);
            }
        }
    }

    fn exit(&mut self) {
        match self.roles.self_role {
            Some(NodeRole::Master) => {
                if let Some(deputy) = self.roles.deputy {
                    info!("Handing the session over to deputy {}", deputy);
                    self.send(
                        deputy,
                        Some(NodeRole::Viewer),
                        Some(NodeRole::Master),
                        false,
                    );
                }
            }
            Some(NodeRole::Deputy) | Some(NodeRole::Normal) => {
                if let Some(master) = self.roles.master {
                    self.send(master, Some(NodeRole::Viewer), None, false);
                }
            }
            _ => {}
        }
        self.teardown(NodeEvent::Disconnected);
    }
}

/// Serialises role events and carries out their effects.
pub struct RoleManager {
    session: Arc<Session>,
    outbound: Outbound,
    links: Arc<Links>,
    sim: Arc<dyn Simulation>,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl RoleManager {
    pub fn new(
        session: Arc<Session>,
        outbound: Outbound,
        links: Arc<Links>,
        sim: Arc<dyn Simulation>,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> Self {
        Self {
            session,
            outbound,
            links,
            sim,
            events,
        }
    }

    pub fn simulation(&self) -> &dyn Simulation {
        self.sim.as_ref()
    }

    pub async fn handle(&self, event: RoleEvent) {
        let mut guard = self.session.lock().await;
        self.handle_locked(&mut guard, event);
    }

    /// Handles `event` for a caller that already holds both session locks.
    pub fn handle_locked(&self, guard: &mut SessionGuard<'_>, event: RoleEvent) {
        debug!("Role event: {:?}", event);
        let effects = transition(
            &mut guard.roles,
            &mut guard.state,
            self.sim.as_ref(),
            event,
        );
        self.apply(effects);
    }

    fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send {
                    to,
                    addr,
                    sender_role,
                    receiver_role,
                    ack,
                } => {
                    let envelope = self.outbound.envelope(
                        Some(to),
                        Message::RoleChange {
                            sender_role,
                            receiver_role,
                        },
                    );
                    let result = if ack {
                        self.outbound.send(envelope, addr)
                    } else {
                        self.outbound.send_without_ack(envelope, addr)
                    };
                    if let Err(e) = result {
                        warn!("Failed to send ROLE_CHANGE to peer {}: {}", to, e);
                    }
                }
                Effect::Link { peer, addr } => self.links.link(peer, addr),
                Effect::Unlink(peer) => self.links.unlink(peer),
                Effect::Reset => {
                    self.links.reset();
                    self.outbound.set_local_id(None);
                }
                Effect::Notify(event) => {
                    let _ = self.events.send(event);
                }
            }
        }
    }

    pub async fn run(
        self: Arc<Self>,
        mut inactive_rx: mpsc::UnboundedReceiver<PeerId>,
        mut events_rx: mpsc::UnboundedReceiver<RoleEvent>,
    ) {
        loop {
            let event = tokio::select! {
                peer = inactive_rx.recv() => match peer {
                    Some(peer) => RoleEvent::PeerInactive(peer),
                    None => break,
                },
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle(event).await;
        }
    }
}
