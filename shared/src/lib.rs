use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use thiserror::Error;

pub const DEFAULT_FIELD_WIDTH: i32 = 40;
pub const DEFAULT_FIELD_HEIGHT: i32 = 30;
pub const DEFAULT_FOOD_STATIC: u32 = 1;
pub const DEFAULT_FOOD_PER_PLAYER: f32 = 1.0;
pub const DEFAULT_DEAD_FOOD_PROB: f32 = 0.1;
pub const DEFAULT_STATE_DELAY_MS: u64 = 200;
pub const DEFAULT_PING_DELAY_MS: u64 = 100;
pub const DEFAULT_NODE_TIMEOUT_MS: u64 = 800;

/// Largest payload a single UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Identifier of a session participant, assigned by the master on join.
pub type PeerId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    Master,
    Deputy,
    Normal,
    Viewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }

    fn offset(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Coord {
    pub x: i32,
    pub y: i32,
}

impl Coord {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Moves one cell in `direction`, wrapping around the field edges.
    pub fn step(self, direction: Direction, width: i32, height: i32) -> Coord {
        let (dx, dy) = direction.offset();
        Coord {
            x: (self.x + dx).rem_euclid(width),
            y: (self.y + dy).rem_euclid(height),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub id: PeerId,
    pub name: String,
    pub role: NodeRole,
    /// Unicast address of the peer. `None` for the peer that owns the snapshot
    /// until a receiver fills it in from the datagram source.
    pub addr: Option<SocketAddr>,
    pub score: u32,
}

impl Player {
    pub fn new(id: PeerId, name: impl Into<String>, role: NodeRole, addr: Option<SocketAddr>) -> Self {
        Self {
            id,
            name: name.into(),
            role,
            addr,
            score: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snake {
    /// Body cells, head first.
    pub body: Vec<Coord>,
    pub direction: Direction,
    /// Set once the owning player has left; the snake keeps moving straight.
    pub zombie: bool,
}

impl Snake {
    pub fn new(body: Vec<Coord>, direction: Direction) -> Self {
        Self {
            body,
            direction,
            zombie: false,
        }
    }

    pub fn head(&self) -> Option<Coord> {
        self.body.first().copied()
    }

    /// Changes direction unless it would turn the snake back into itself.
    pub fn steer(&mut self, direction: Direction) {
        if self.body.len() > 1 && direction == self.direction.opposite() {
            return;
        }
        self.direction = direction;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameConfig {
    pub width: i32,
    pub height: i32,
    pub food_static: u32,
    pub food_per_player: f32,
    pub dead_food_prob: f32,
    pub state_delay_ms: u64,
    pub ping_delay_ms: u64,
    pub node_timeout_ms: u64,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_FIELD_WIDTH,
            height: DEFAULT_FIELD_HEIGHT,
            food_static: DEFAULT_FOOD_STATIC,
            food_per_player: DEFAULT_FOOD_PER_PLAYER,
            dead_food_prob: DEFAULT_DEAD_FOOD_PROB,
            state_delay_ms: DEFAULT_STATE_DELAY_MS,
            ping_delay_ms: DEFAULT_PING_DELAY_MS,
            node_timeout_ms: DEFAULT_NODE_TIMEOUT_MS,
        }
    }
}

/// The authoritative simulation snapshot. Only the master mutates it; every
/// other peer holds a read-only copy replaced by strictly newer orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    pub order: u64,
    pub players: BTreeMap<PeerId, Player>,
    pub snakes: BTreeMap<PeerId, Snake>,
    pub food: Vec<Coord>,
    pub config: GameConfig,
}

impl GameState {
    pub fn new(config: GameConfig) -> Self {
        Self {
            order: 0,
            players: BTreeMap::new(),
            snakes: BTreeMap::new(),
            food: Vec::new(),
            config,
        }
    }

    /// First player holding `role`, in id order.
    pub fn player_with_role(&self, role: NodeRole) -> Option<&Player> {
        self.players.values().find(|player| player.role == role)
    }

    pub fn supersedes(&self, held: &GameState) -> bool {
        self.order > held.order
    }

    pub fn active_players(&self) -> usize {
        self.players
            .values()
            .filter(|player| player.role != NodeRole::Viewer)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Ack,
    Join {
        player_name: String,
        only_view: bool,
    },
    Ping,
    Error {
        reason: String,
    },
    State {
        state: GameState,
    },
    Steer {
        direction: Direction,
    },
    Announcement {
        players: Vec<Player>,
        config: GameConfig,
        can_join: bool,
    },
    RoleChange {
        sender_role: Option<NodeRole>,
        receiver_role: Option<NodeRole>,
    },
}

impl Message {
    pub fn requires_ack(&self) -> bool {
        !matches!(
            self,
            Message::Ack | Message::Error { .. } | Message::Announcement { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Ack => "ACK",
            Message::Join { .. } => "JOIN",
            Message::Ping => "PING",
            Message::Error { .. } => "ERROR",
            Message::State { .. } => "STATE",
            Message::Steer { .. } => "STEER",
            Message::Announcement { .. } => "ANNOUNCEMENT",
            Message::RoleChange { .. } => "ROLE_CHANGE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Monotonic per sender; doubles as idempotency and ack-correlation key.
    pub seq: u64,
    pub sender: Option<PeerId>,
    pub receiver: Option<PeerId>,
    pub message: Message,
}

impl Envelope {
    /// Acknowledgement of `self`. The acknowledging peer signs it with its own
    /// id (the receiver id of the original) so the sender can correlate it.
    pub fn ack(&self, acker: Option<PeerId>, assigned: Option<PeerId>) -> Envelope {
        Envelope {
            seq: self.seq,
            sender: acker,
            receiver: assigned,
            message: Message::Ack,
        }
    }

    pub fn error(&self, sender: Option<PeerId>, reason: impl Into<String>) -> Envelope {
        Envelope {
            seq: self.seq,
            sender,
            receiver: self.sender,
            message: Message::Error {
                reason: reason.into(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode envelope: {0}")]
    Decode(#[source] bincode::Error),
    #[error("encoded envelope is {0} bytes, larger than a datagram")]
    TooLarge(usize),
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let bytes = bincode::serialize(envelope).map_err(CodecError::Encode)?;
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(CodecError::TooLarge(bytes.len()));
    }
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    bincode::deserialize(bytes).map_err(CodecError::Decode)
}
