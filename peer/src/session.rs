//! The two pieces of state shared between network handling and the tick loop.
//!
//! [`RoleView`] is the local peer's view of who holds which role;
//! the `Option<GameState>` is the authoritative snapshot (or the latest copy
//! of it). Each sits behind its own lock. Code that needs both must take them
//! through [`Session::lock`], which acquires the role view first and the state
//! second; no code path acquires them in the other order.

use shared::{GameConfig, GameState, NodeRole, PeerId};
use std::net::SocketAddr;
use tokio::sync::{Mutex, MutexGuard};

/// Local view of the session's roles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoleView {
    pub self_id: Option<PeerId>,
    pub self_role: Option<NodeRole>,
    pub master: Option<PeerId>,
    pub deputy: Option<PeerId>,
    /// Set once the join handshake completed or an own session was started.
    pub started: bool,
    /// Next id a master hands out on join; never reused within a session.
    pub next_peer_id: PeerId,
    /// Bumped on every connect so stale connect timeouts can be recognised.
    pub attempt: u64,
}

impl RoleView {
    pub fn is_master(&self) -> bool {
        self.self_role == Some(NodeRole::Master)
    }

    pub fn in_session(&self) -> bool {
        self.self_role.is_some()
    }

    /// A connect that has not been acknowledged yet.
    pub fn is_joining(&self) -> bool {
        !self.started && self.master.is_some()
    }

    /// Forgets the session, keeping only the connect attempt counter.
    pub fn reset(&mut self) {
        *self = RoleView {
            attempt: self.attempt,
            ..RoleView::default()
        };
    }
}

/// Both session locks, taken in the mandated order.
pub struct SessionGuard<'a> {
    pub roles: MutexGuard<'a, RoleView>,
    pub state: MutexGuard<'a, Option<GameState>>,
}

#[derive(Default)]
pub struct Session {
    roles: Mutex<RoleView>,
    state: Mutex<Option<GameState>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> SessionGuard<'_> {
        let roles = self.roles.lock().await;
        let state = self.state.lock().await;
        SessionGuard { roles, state }
    }

    /// Role view alone. Do not take the state lock while holding it; use
    /// [`Session::lock`] instead.
    pub async fn roles(&self) -> MutexGuard<'_, RoleView> {
        self.roles.lock().await
    }

    pub async fn snapshot(&self) -> (RoleView, Option<GameState>) {
        let guard = self.lock().await;
        (guard.roles.clone(), guard.state.clone())
    }
}

impl SessionGuard<'_> {
    /// The authoritative state, for mutation by the master only.
    ///
    /// # Panics
    ///
    /// Panics when the local peer is not MASTER or holds no state. Callers
    /// gate on the role first, so reaching either is a broken invariant.
    pub fn authoritative_mut(&mut self) -> &mut GameState {
        assert!(
            self.roles.is_master(),
            "attempted to mutate authoritative state while {:?}",
            self.roles.self_role
        );
        match self.state.as_mut() {
            Some(state) => state,
            None => panic!("MASTER without an authoritative state"),
        }
    }
}

/// An open session seen through its announcement.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub master_id: PeerId,
    pub master_name: String,
    pub deputy_id: Option<PeerId>,
    pub addr: SocketAddr,
    pub width: i32,
    pub height: i32,
    pub players: usize,
    pub can_join: bool,
    pub config: GameConfig,
}

/// Asynchronous notifications surfaced to whoever drives the node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    GameStarted,
    StateChanged(u64),
    MasterChanged(Option<PeerId>),
    RoleChanged(NodeRole),
    YouDied,
    SessionDiscovered(SessionInfo),
    Info(String),
    ConnectionFailed,
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Player;

    #[test]
    fn test_reset_keeps_attempt_counter() {
        let mut view = RoleView {
            self_id: Some(2),
            self_role: Some(NodeRole::Normal),
            master: Some(0),
            deputy: Some(1),
            started: true,
            next_peer_id: 3,
            attempt: 4,
        };
        view.reset();
        assert_eq!(
            view,
            RoleView {
                attempt: 4,
                ..RoleView::default()
            }
        );
    }

    #[test]
    fn test_joining_until_started() {
        let mut view = RoleView {
            master: Some(0),
            self_role: Some(NodeRole::Normal),
            ..RoleView::default()
        };
        assert!(view.is_joining());
        view.started = true;
        assert!(!view.is_joining());
    }

    #[tokio::test]
    async fn test_master_may_mutate_state() {
        let session = Session::new();
        let mut guard = session.lock().await;
        guard.roles.self_role = Some(NodeRole::Master);
        *guard.state = Some(GameState::new(GameConfig::default()));

        guard
            .authoritative_mut()
            .players
            .insert(0, Player::new(0, "host", NodeRole::Master, None));
        assert_eq!(guard.state.as_ref().unwrap().players.len(), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "attempted to mutate authoritative state")]
    async fn test_non_master_mutation_panics() {
        let session = Session::new();
        let mut guard = session.lock().await;
        guard.roles.self_role = Some(NodeRole::Deputy);
        *guard.state = Some(GameState::new(GameConfig::default()));

        guard.authoritative_mut().order += 1;
    }
}
