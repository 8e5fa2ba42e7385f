//! The master's simulation tick.

use crate::game::Simulation;
use crate::roles::{RoleEvent, RoleManager};
use crate::session::{NodeEvent, Session};
use crate::transport::Outbound;
use log::{debug, warn};
use shared::{Direction, Message, NodeRole, PeerId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Latest requested direction per player, consumed once per tick.
#[derive(Debug, Default)]
pub struct InputQueue {
    pending: Mutex<HashMap<PeerId, Direction>>,
}

impl InputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, Direction>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, player: PeerId, direction: Direction) {
        self.lock().insert(player, direction);
    }

    pub fn take(&self) -> HashMap<PeerId, Direction> {
        std::mem::take(&mut *self.lock())
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

pub struct StateLoop {
    session: Arc<Session>,
    outbound: Outbound,
    roles: Arc<RoleManager>,
    sim: Arc<dyn Simulation>,
    inputs: Arc<InputQueue>,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl StateLoop {
    pub fn new(
        session: Arc<Session>,
        outbound: Outbound,
        roles: Arc<RoleManager>,
        sim: Arc<dyn Simulation>,
        inputs: Arc<InputQueue>,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> Self {
        Self {
            session,
            outbound,
            roles,
            sim,
            inputs,
            events,
        }
    }

    /// Runs one tick if the local peer is MASTER. Returns the new order.
    pub async fn tick(&self) -> Option<u64> {
        let mut guard = self.session.lock().await;
        if !guard.roles.is_master() || guard.state.is_none() {
            self.inputs.clear();
            return None;
        }

        let inputs = self.inputs.take();
        let me = guard.roles.self_id;
        let state = guard.authoritative_mut();
        let mut advance = self.sim.advance(state, &inputs);
        advance.state.order = state.order + 1;
        *state = advance.state;

        let order = state.order;
        for player in state.players.values() {
            if Some(player.id) == me {
                continue;
            }
            let Some(addr) = player.addr else {
                continue;
            };
            let envelope = self.outbound.envelope(
                Some(player.id),
                Message::State {
                    state: state.clone(),
                },
            );
            if let Err(e) = self.outbound.send(envelope, addr) {
                warn!("Failed to send state {} to peer {}: {}", order, player.id, e);
            }
        }
        debug!("Tick {} published", order);
        let _ = self.events.send(NodeEvent::StateChanged(order));

        if !advance.eliminated.is_empty() {
            self.roles
                .handle_locked(&mut guard, RoleEvent::Eliminated(advance.eliminated));
        }

        // A deputy is only chosen once it has been sent a state to take over with.
        let candidate = guard.state.as_ref().map_or(false, |state| {
            state
                .players
                .values()
                .any(|player| player.role == NodeRole::Normal && player.addr.is_some())
        });
        if guard.roles.is_master() && guard.roles.deputy.is_none() && candidate {
            self.roles.handle_locked(&mut guard, RoleEvent::DeputyVacancy);
        }

        Some(order)
    }

    /// Tick period of the session being hosted, if any.
    async fn session_period(&self) -> Option<Duration> {
        let guard = self.session.lock().await;
        guard
            .state
            .as_ref()
            .map(|state| Duration::from_millis(state.config.state_delay_ms.max(1)))
    }

    /// Ticks every `fallback` until a session is hosted, then at that
    /// session's own state delay.
    pub async fn run(self: Arc<Self>, fallback: Duration) {
        let mut period = fallback;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.tick().await;

            let wanted = self.session_period().await.unwrap_or(fallback);
            if wanted != period {
                debug!("Tick period now {:?}", wanted);
                period = wanted;
                ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            }
        }
    }
}
