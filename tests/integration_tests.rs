//! Integration tests for the peer over real loopback sockets
//!
//! A hosting or joining [`Node`] is driven from the other side by a raw
//! socket that speaks the wire format by hand.

mod common;

use common::{collect_events, host, loopback_config, session_at, wait_for, RawPeer};
use peer::dispatch::{NOT_A_MASTER, NO_PLACE};
use peer::game::{Advance, Simulation};
use peer::{Node, NodeEvent};
use shared::{Direction, Envelope, GameConfig, GameState, Message, NodeRole, PeerId, Player};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// RELIABLE DELIVERY TESTS
mod delivery_tests {
    use super::*;

    /// A steer sent to the master is acknowledged and applied on a later tick
    #[tokio::test]
    async fn steer_is_acknowledged_and_applied() {
        let (master, _events) = host("host").await;
        let master_addr = master.local_addr();
        let mut player = RawPeer::bind().await;
        let id = player.join("player", master_addr).await.unwrap();

        let seen = player.drain_acking(Duration::from_millis(500)).await;
        let heading = seen
            .iter()
            .rev()
            .find_map(|(envelope, _)| match &envelope.message {
                Message::State { state } => state.snakes.get(&id).map(|snake| snake.direction),
                _ => None,
            })
            .expect("no state carrying our snake");
        let turn = Direction::ALL
            .into_iter()
            .find(|d| *d != heading && *d != heading.opposite())
            .unwrap();

        let steer = player
            .send_message(Some(0), Message::Steer { direction: turn }, master_addr)
            .await;
        let seen = player.drain_acking(Duration::from_millis(600)).await;

        assert!(seen.iter().any(|(envelope, _)| {
            envelope.message == Message::Ack
                && envelope.seq == steer.seq
                && envelope.sender == Some(0)
                && envelope.receiver == Some(id)
        }));
        let latest = seen
            .iter()
            .rev()
            .find_map(|(envelope, _)| match &envelope.message {
                Message::State { state } => Some(state.clone()),
                _ => None,
            })
            .unwrap();
        if let Some(snake) = latest.snakes.get(&id) {
            assert_eq!(snake.direction, turn);
        }
    }

    /// Nothing the receiver acknowledged in time is sent a second time
    #[tokio::test]
    async fn acknowledged_sends_are_not_retransmitted() {
        let (master, _events) = host("host").await;
        let mut player = RawPeer::bind().await;
        player.join("player", master.local_addr()).await.unwrap();

        let seen = player.drain_acking(Duration::from_millis(1000)).await;

        let mut seqs = HashSet::new();
        for (envelope, _) in seen.iter().filter(|(e, _)| e.message.requires_ack()) {
            assert!(
                seqs.insert(envelope.seq),
                "{} #{} arrived twice",
                envelope.message.name(),
                envelope.seq
            );
        }
        assert!(seen
            .iter()
            .any(|(e, _)| matches!(e.message, Message::State { .. })));
    }

    /// A send nobody acknowledges keeps coming back under the same sequence number
    #[tokio::test]
    async fn unacknowledged_sends_are_retransmitted() {
        let (master, _events) = host("host").await;
        let mut player = RawPeer::bind().await;
        player.join("player", master.local_addr()).await.unwrap();

        let mut counts: HashMap<u64, usize> = HashMap::new();
        while let Some((envelope, _)) = player.recv(Duration::from_millis(350)).await {
            if envelope.message.requires_ack() {
                *counts.entry(envelope.seq).or_default() += 1;
            }
            if counts.values().any(|count| *count > 1) {
                break;
            }
        }
        assert!(counts.values().any(|count| *count > 1));
    }

    /// A peer that stops answering is dropped from the roster and left alone
    #[tokio::test]
    async fn silent_player_is_removed() {
        let (master, _events) = host("host").await;
        let mut player = RawPeer::bind().await;
        let id = player.join("player", master.local_addr()).await.unwrap();
        player.drain_acking(Duration::from_millis(300)).await;

        // Stay silent past the node timeout without reading anything.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let state = master.state().await.unwrap();
        assert!(!state.players.contains_key(&id));

        // Flush whatever queued up while we slept, then expect quiet.
        while player.recv(Duration::from_millis(50)).await.is_some() {}
        assert!(player.recv(Duration::from_millis(500)).await.is_none());
    }
}

/// STATE HANDLING TESTS
mod state_tests {
    use super::*;

    fn roster(joiner_addr: std::net::SocketAddr, order: u64) -> GameState {
        let mut state = GameState::new(GameConfig::default());
        state.order = order;
        state
            .players
            .insert(0, Player::new(0, "host", NodeRole::Master, None));
        state
            .players
            .insert(1, Player::new(1, "joiner", NodeRole::Normal, Some(joiner_addr)));
        state
    }

    /// Answers the joiner's JOIN as master 0, assigning id 1
    async fn accept_join(master: &mut RawPeer) -> std::net::SocketAddr {
        loop {
            let (envelope, from) = master.recv(Duration::from_secs(2)).await.unwrap();
            if matches!(envelope.message, Message::Join { .. }) {
                master.id = Some(0);
                master.send(&envelope.ack(Some(0), Some(1)), from).await;
                return from;
            }
        }
    }

    /// The same STATE delivered twice is applied once but acknowledged both times
    #[tokio::test]
    async fn duplicate_state_is_applied_once() {
        let mut master = RawPeer::bind().await;
        let (joiner, mut events) = Node::start(loopback_config("joiner")).await.unwrap();
        joiner
            .connect(&session_at(master.addr(), 0), false)
            .await
            .unwrap();
        let joiner_addr = accept_join(&mut master).await;
        assert!(wait_for(&mut events, Duration::from_secs(1), |e| *e == NodeEvent::GameStarted).await);

        let state = Envelope {
            seq: master.next_seq(),
            sender: Some(0),
            receiver: Some(1),
            message: Message::State {
                state: roster(joiner_addr, 1),
            },
        };
        master.send(&state, joiner_addr).await;
        master.send(&state, joiner_addr).await;
        // Same order under a fresh sequence number is stale.
        master
            .send_message(
                Some(1),
                Message::State {
                    state: roster(joiner_addr, 1),
                },
                joiner_addr,
            )
            .await;

        let events = collect_events(&mut events, Duration::from_millis(300)).await;
        let applied = events
            .iter()
            .filter(|e| matches!(e, NodeEvent::StateChanged(_)))
            .count();
        assert_eq!(applied, 1);

        let acks = master
            .drain_acking(Duration::from_millis(200))
            .await
            .into_iter()
            .filter(|(e, _)| e.message == Message::Ack && e.seq == state.seq)
            .count();
        assert_eq!(acks, 2);

        let held = joiner.state().await.unwrap();
        assert_eq!(held.order, 1);
        assert_eq!(held.players[&0].addr, Some(master.addr()));
    }
}

/// JOIN HANDSHAKE TESTS
mod join_tests {
    use super::*;

    /// Never finds room for a snake
    struct FullField;

    impl Simulation for FullField {
        fn spawn(&self, _state: &mut GameState, _player: PeerId) -> bool {
            false
        }

        fn advance(&self, state: &GameState, _inputs: &HashMap<PeerId, Direction>) -> Advance {
            Advance {
                state: state.clone(),
                eliminated: Vec::new(),
            }
        }
    }

    #[tokio::test]
    async fn duplicate_name_is_refused() {
        let (master, _events) = host("host").await;
        let mut player = RawPeer::bind().await;

        let refusal = player.join("host", master.local_addr()).await.unwrap_err();
        assert!(refusal.contains("already used"));
        assert_eq!(master.state().await.unwrap().players.len(), 1);
    }

    #[tokio::test]
    async fn full_field_is_refused() {
        let (master, _events) = Node::start_with(loopback_config("host"), Arc::new(FullField))
            .await
            .unwrap();
        master.start_own_game().await;
        let mut player = RawPeer::bind().await;

        let refusal = player.join("player", master.local_addr()).await.unwrap_err();
        assert_eq!(refusal, NO_PLACE);
    }

    #[tokio::test]
    async fn non_master_refuses_join() {
        let (idle, _events) = Node::start(loopback_config("idle")).await.unwrap();
        let mut player = RawPeer::bind().await;

        let refusal = player.join("player", idle.local_addr()).await.unwrap_err();
        assert_eq!(refusal, NOT_A_MASTER);
    }

    /// An ERROR answer to our JOIN ends the attempt
    #[tokio::test]
    async fn refused_join_reports_failure() {
        let master = RawPeer::bind().await;
        let (joiner, mut events) = Node::start(loopback_config("joiner")).await.unwrap();
        joiner
            .connect(&session_at(master.addr(), 0), false)
            .await
            .unwrap();

        let (join, from) = master.recv(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(join.message, Message::Join { .. }));
        master.send(&join.error(Some(0), "go away"), from).await;

        let events = collect_events(&mut events, Duration::from_millis(300)).await;
        assert!(events.contains(&NodeEvent::Info("go away".to_string())));
        assert!(events.contains(&NodeEvent::ConnectionFailed));
        assert_eq!(joiner.role().await, None);
    }

    /// Two nodes complete the handshake and the joiner becomes deputy
    #[tokio::test]
    async fn node_joins_node_and_becomes_deputy() {
        let (master, _master_events) = host("host").await;
        let (joiner, mut events) = Node::start(loopback_config("joiner")).await.unwrap();
        joiner
            .connect(&session_at(master.local_addr(), 0), false)
            .await
            .unwrap();

        assert!(wait_for(&mut events, Duration::from_secs(2), |e| {
            *e == NodeEvent::RoleChanged(NodeRole::Deputy)
        })
        .await);
        assert!(wait_for(&mut events, Duration::from_secs(1), |e| {
            matches!(e, NodeEvent::StateChanged(_))
        })
        .await);

        let view = joiner.view().await;
        assert_eq!(view.self_id, Some(1));
        assert_eq!(view.master, Some(0));
        let hosted = master.state().await.unwrap();
        assert_eq!(hosted.players[&1].role, NodeRole::Deputy);
    }
}
