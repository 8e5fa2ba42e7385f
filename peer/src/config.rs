//! Construction-time configuration for a peer.
//!
//! The core never reads files or the environment; the binary fills a
//! [`NodeConfig`] from command-line arguments and hands it over.

use crate::error::NodeError;
use serde::{Deserialize, Serialize};
use shared::GameConfig;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_MULTICAST_GROUP: &str = "239.192.0.4:9192";
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub player_name: String,
    /// Unicast socket address; port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,
    /// Announcement group. `None` disables multicast entirely.
    pub multicast_group: Option<SocketAddr>,
    /// Rules and timings of sessions this peer hosts.
    pub game: GameConfig,
    /// How long an ack-required send waits before it is retransmitted.
    pub retry_interval: Duration,
    pub announce_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let game = GameConfig::default();
        Self {
            player_name: "SnakePlayer".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            multicast_group: DEFAULT_MULTICAST_GROUP.parse().ok(),
            retry_interval: Duration::from_millis(game.ping_delay_ms),
            game,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl NodeConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.game.state_delay_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.game.ping_delay_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.game.node_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        let game = &self.game;
        if game.width <= 0 || game.height <= 0 {
            return Err(NodeError::Config(format!(
                "field size {}x{} must be positive",
                game.width, game.height
            )));
        }
        if game.state_delay_ms == 0 || game.ping_delay_ms == 0 || self.retry_interval.is_zero() {
            return Err(NodeError::Config(
                "tick, ping and retry intervals must be non-zero".to_string(),
            ));
        }
        if game.node_timeout_ms <= game.ping_delay_ms {
            return Err(NodeError::Config(format!(
                "inactivity timeout {}ms must exceed ping interval {}ms",
                game.node_timeout_ms, game.ping_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&game.dead_food_prob) {
            return Err(NodeError::Config(format!(
                "dead food probability {} is outside [0, 1]",
                game.dead_food_prob
            )));
        }
        if let Some(group) = self.multicast_group {
            if !group.ip().is_multicast() {
                return Err(NodeError::Config(format!("{} is not a multicast address", group)));
            }
        }
        Ok(())
    }
}
