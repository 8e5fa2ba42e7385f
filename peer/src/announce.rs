//! Session advertisement and discovery.

use crate::session::{Session, SessionInfo};
use crate::transport::Outbound;
use log::{debug, warn};
use shared::{Envelope, GameState, Message, NodeRole, PeerId};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

/// ANNOUNCEMENT body describing `state`.
pub fn announcement(state: &GameState) -> Message {
    Message::Announcement {
        players: state.players.values().cloned().collect(),
        config: state.config.clone(),
        can_join: true,
    }
}

/// Reads an ANNOUNCEMENT received from `addr`. Returns `None` for anything
/// else or for an announcement that names no master.
pub fn session_info(envelope: &Envelope, addr: SocketAddr) -> Option<SessionInfo> {
    let Message::Announcement {
        players,
        config,
        can_join,
    } = &envelope.message
    else {
        return None;
    };

    let master = players
        .iter()
        .find(|player| player.role == NodeRole::Master)?;
    let deputy_id: Option<PeerId> = players
        .iter()
        .find(|player| player.role == NodeRole::Deputy)
        .map(|player| player.id);

    Some(SessionInfo {
        master_id: master.id,
        master_name: master.name.clone(),
        deputy_id,
        addr,
        width: config.width,
        height: config.height,
        players: players
            .iter()
            .filter(|player| player.role != NodeRole::Viewer)
            .count(),
        can_join: *can_join,
        config: config.clone(),
    })
}

/// Multicasts an announcement every `period` while the local peer is MASTER.
pub async fn run(session: Arc<Session>, outbound: Outbound, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let message = {
            let guard = session.lock().await;
            if !guard.roles.is_master() {
                continue;
            }
            match guard.state.as_ref() {
                Some(state) => announcement(state),
                None => continue,
            }
        };

        match outbound.multicast(outbound.envelope(None, message)) {
            Ok(Some(_)) => debug!("Session announced"),
            Ok(None) => {}
            Err(e) => warn!("Failed to announce session: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{decode, GameConfig, Player};

    fn hosted_state() -> GameState {
        let mut state = GameState::new(GameConfig::default());
        state
            .players
            .insert(0, Player::new(0, "host", NodeRole::Master, None));
        state
            .players
            .insert(1, Player::new(1, "second", NodeRole::Deputy, None));
        state
            .players
            .insert(2, Player::new(2, "watcher", NodeRole::Viewer, None));
        state
    }

    #[test]
    fn test_session_info_from_announcement() {
        let envelope = Envelope {
            seq: 1,
            sender: Some(0),
            receiver: None,
            message: announcement(&hosted_state()),
        };
        let source: SocketAddr = "10.0.0.5:4000".parse().unwrap();

        let info = session_info(&envelope, source).unwrap();

        assert_eq!(info.master_id, 0);
        assert_eq!(info.master_name, "host");
        assert_eq!(info.deputy_id, Some(1));
        assert_eq!(info.addr, source);
        assert_eq!((info.width, info.height), (40, 30));
        assert_eq!(info.players, 2);
        assert!(info.can_join);
    }

    #[test]
    fn test_announcement_without_master_is_ignored() {
        let mut state = hosted_state();
        state.players.remove(&0);
        let envelope = Envelope {
            seq: 1,
            sender: Some(1),
            receiver: None,
            message: announcement(&state),
        };
        assert!(session_info(&envelope, "10.0.0.5:4000".parse().unwrap()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_master_announces() {
        let group: SocketAddr = "239.192.0.4:9192".parse().unwrap();
        let (outbound, _feeds, mut wire) = Outbound::channel(Some(group));
        let session = Arc::new(Session::new());
        tokio::spawn(run(
            Arc::clone(&session),
            outbound,
            Duration::from_millis(1000),
        ));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(wire.try_recv().is_err());

        {
            let mut guard = session.lock().await;
            guard.roles.self_role = Some(NodeRole::Master);
            *guard.state = Some(hosted_state());
        }
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let (bytes, to) = wire.try_recv().unwrap();
        assert_eq!(to, group);
        assert!(matches!(
            decode(&bytes).unwrap().message,
            Message::Announcement { .. }
        ));
    }
}
