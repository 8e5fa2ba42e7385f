//! A running peer: every component wired together behind one handle.

use crate::announce;
use crate::config::NodeConfig;
use crate::delivery::DeliveryController;
use crate::dispatch::{Dispatcher, Routes};
use crate::error::NodeError;
use crate::game::{Simulation, SnakeRules};
use crate::links::Links;
use crate::liveness::LivenessDetector;
use crate::pinger::Pinger;
use crate::roles::{RoleEvent, RoleManager};
use crate::session::{NodeEvent, RoleView, Session, SessionInfo};
use crate::state_loop::{InputQueue, StateLoop};
use crate::transport::{Outbound, Transport, TransportQueues};
use log::{info, warn};
use shared::{Direction, GameState, Message, NodeRole, Player};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A running peer.
///
/// - Owns the sockets and every background task, aborted on drop
/// - Hosts a session, joins one, or sits idle listening for announcements
/// - Reports what happens through the [`NodeEvent`] receiver from [`Node::start`]
pub struct Node {
    config: NodeConfig,
    local_addr: SocketAddr,
    session: Arc<Session>,
    outbound: Outbound,
    links: Arc<Links>,
    roles: Arc<RoleManager>,
    inputs: Arc<InputQueue>,
    role_events: mpsc::UnboundedSender<RoleEvent>,
    events: mpsc::UnboundedSender<NodeEvent>,
    last_direction: Mutex<Option<Direction>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Binds the sockets and starts every background task with the default
    /// snake rules. The receiver yields the node's [`NodeEvent`]s.
    pub async fn start(
        config: NodeConfig,
    ) -> Result<(Node, mpsc::UnboundedReceiver<NodeEvent>), NodeError> {
        Self::start_with(config, Arc::new(SnakeRules::new())).await
    }

    /// Like [`Node::start`], with the game rules supplied by `sim`.
    pub async fn start_with(
        config: NodeConfig,
        sim: Arc<dyn Simulation>,
    ) -> Result<(Node, mpsc::UnboundedReceiver<NodeEvent>), NodeError> {
        config.validate()?;

        let transport = Transport::bind(config.bind_addr, config.multicast_group).await?;
        let local_addr = transport.local_addr()?;
        let TransportQueues {
            outbound,
            feeds,
            inbound,
            mut tasks,
        } = transport.start();
        info!("Peer {} listening on {}", config.player_name, local_addr);

        let delivery = Arc::new(DeliveryController::new(
            config.retry_interval,
            outbound.clone(),
        ));
        let pinger = Arc::new(Pinger::new(config.ping_interval(), outbound.clone()));
        let (liveness, inactive_rx) = LivenessDetector::new(config.inactivity_timeout());
        let liveness = Arc::new(liveness);
        let links = Arc::new(Links::new(
            Arc::clone(&delivery),
            Arc::clone(&pinger),
            Arc::clone(&liveness),
        ));

        let session = Arc::new(Session::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        let (activity_tx, activity_rx) = mpsc::unbounded_channel();
        let (role_events_tx, role_events_rx) = mpsc::unbounded_channel();

        let roles = Arc::new(RoleManager::new(
            Arc::clone(&session),
            outbound.clone(),
            Arc::clone(&links),
            Arc::clone(&sim),
            events_tx.clone(),
        ));
        let inputs = Arc::new(InputQueue::new());
        let state_loop = Arc::new(StateLoop::new(
            Arc::clone(&session),
            outbound.clone(),
            Arc::clone(&roles),
            sim,
            Arc::clone(&inputs),
            events_tx.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&session),
            outbound.clone(),
            Arc::clone(&links),
            Arc::clone(&roles),
            Arc::clone(&inputs),
            Routes {
                acks: acks_tx,
                activity: activity_tx,
                role_events: role_events_tx.clone(),
                events: events_tx.clone(),
            },
            local_addr,
        ));

        tasks.push(tokio::spawn(delivery.run(feeds.ack_required, acks_rx)));
        tasks.push(tokio::spawn(pinger.run(feeds.sent)));
        tasks.push(tokio::spawn(liveness.run(activity_rx)));
        tasks.push(tokio::spawn(
            Arc::clone(&roles).run(inactive_rx, role_events_rx),
        ));
        tasks.push(tokio::spawn(dispatcher.run(inbound)));
        tasks.push(tokio::spawn(state_loop.run(config.tick_interval())));
        tasks.push(tokio::spawn(announce::run(
            Arc::clone(&session),
            outbound.clone(),
            config.announce_interval,
        )));

        let node = Node {
            config,
            local_addr,
            session,
            outbound,
            links,
            roles,
            inputs,
            role_events: role_events_tx,
            events: events_tx,
            last_direction: Mutex::new(None),
            tasks,
        };
        Ok((node, events_rx))
    }

    /// Unicast address peers reach us on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Snapshot of who holds which role, as this peer sees it.
    pub async fn view(&self) -> RoleView {
        self.session.roles().await.clone()
    }

    pub async fn role(&self) -> Option<NodeRole> {
        self.session.roles().await.self_role
    }

    /// Latest game state held, authoritative when we are master.
    pub async fn state(&self) -> Option<GameState> {
        self.session.snapshot().await.1
    }

    fn last_direction(&self) -> MutexGuard<'_, Option<Direction>> {
        self.last_direction
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn leave_current(&self) {
        if self.session.roles().await.in_session() {
            self.leave().await;
        }
        self.links.reset();
        self.inputs.clear();
        *self.last_direction() = None;
    }

    /// Hosts a fresh session with the local peer as MASTER (id 0).
    pub async fn start_own_game(&self) {
        self.leave_current().await;

        let mut guard = self.session.lock().await;
        let mut state = GameState::new(self.config.game.clone());
        state.players.insert(
            0,
            Player::new(0, self.config.player_name.clone(), NodeRole::Master, None),
        );

        guard.roles.reset();
        guard.roles.self_id = Some(0);
        guard.roles.self_role = Some(NodeRole::Master);
        guard.roles.master = Some(0);
        guard.roles.started = true;
        guard.roles.next_peer_id = 1;
        *guard.state = Some(state);

        if !self.roles.simulation().spawn(guard.authoritative_mut(), 0) {
            warn!("No room for our own snake");
        }
        self.outbound.set_local_id(Some(0));
        info!("Hosting a new session on {}", self.local_addr);

        for event in [
            NodeEvent::GameStarted,
            NodeEvent::RoleChanged(NodeRole::Master),
            NodeEvent::MasterChanged(Some(0)),
        ] {
            let _ = self.events.send(event);
        }
    }

    /// Asks the master of `session` to let us in. The outcome arrives as
    /// `GameStarted` or `ConnectionFailed`.
    pub async fn connect(&self, session: &SessionInfo, only_view: bool) -> Result<(), NodeError> {
        self.leave_current().await;

        let attempt = {
            let mut guard = self.session.lock().await;
            let attempt = guard.roles.attempt + 1;
            guard.roles.reset();
            guard.roles.attempt = attempt;
            guard.roles.self_role = Some(if only_view {
                NodeRole::Viewer
            } else {
                NodeRole::Normal
            });
            guard.roles.master = Some(session.master_id);
            guard.roles.deputy = session.deputy_id;
            *guard.state = None;
            attempt
        };
        self.outbound.set_local_id(None);

        self.links.link(session.master_id, session.addr);
        let join = self.outbound.envelope(
            Some(session.master_id),
            Message::Join {
                player_name: self.config.player_name.clone(),
                only_view,
            },
        );
        self.outbound.send(join, session.addr)?;
        info!(
            "Joining {}'s session at {}",
            session.master_name, session.addr
        );

        let role_events = self.role_events.clone();
        let timeout = self.config.connect_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = role_events.send(RoleEvent::ConnectTimeout { attempt });
        });
        Ok(())
    }

    /// Requests a new direction for our snake.
    pub async fn steer(&self, direction: Direction) -> Result<(), NodeError> {
        let guard = self.session.lock().await;
        let roles = &guard.roles;
        if matches!(roles.self_role, None | Some(NodeRole::Viewer)) || !roles.started {
            return Ok(());
        }
        if *self.last_direction() == Some(direction) {
            return Ok(());
        }

        if roles.is_master() {
            if let Some(me) = roles.self_id {
                self.inputs.push(me, direction);
            }
            *self.last_direction() = Some(direction);
            return Ok(());
        }

        let Some(master) = roles.master else {
            warn!("No master to steer through");
            return Ok(());
        };
        let confirmed = guard
            .state
            .as_ref()
            .and_then(|state| state.players.get(&master))
            .filter(|player| player.role == NodeRole::Master)
            .and_then(|player| player.addr);
        let Some(addr) = confirmed else {
            warn!("Master {} not confirmed yet, steer dropped", master);
            return Ok(());
        };

        let envelope = self
            .outbound
            .envelope(Some(master), Message::Steer { direction });
        self.outbound.send(envelope, addr)?;
        *self.last_direction() = Some(direction);
        Ok(())
    }

    /// Leaves the current session, handing it over first when hosting.
    pub async fn leave(&self) {
        self.roles.handle(RoleEvent::Exit).await;
        self.inputs.clear();
        *self.last_direction() = None;
    }

    /// Stops the node at once, without telling anybody.
    pub fn shutdown(self) {}
}

impl Drop for Node {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
