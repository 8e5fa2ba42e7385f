//! # Snake Peer Library
//!
//! This library implements a peer of the multiplayer snake game. There is no
//! dedicated server: one peer hosts each session as MASTER and the others
//! join it over UDP. Any peer can take over when the host disappears.
//!
//! ## Core Responsibilities
//!
//! ### Reliable Delivery
//! Every game message except ACK, ERROR and ANNOUNCEMENT has to be
//! acknowledged. Unacknowledged sends are retransmitted every ping interval
//! until an ACK arrives or the destination is dropped. Receivers suppress
//! the duplicates this produces and always ack them again.
//!
//! ### Liveness
//! Each peer keeps its links warm with PING when it has had nothing else to
//! say for a ping interval. A peer silent for the node timeout is reported
//! inactive exactly once.
//!
//! ### Role Succession
//! Sessions have one MASTER and at most one DEPUTY. When the master fails,
//! the deputy promotes itself and tells everyone. When the deputy fails,
//! the master elects a new one. Every role change flows through a single
//! transition table so that cascades of failures are handled one at a time.
//!
//! ## Architecture Design
//!
//! ### Task Per Concern
//! Each concern runs as its own tokio task fed by unbounded channels: the
//! socket reader and writer, the retransmission timer, the ping timer, the
//! liveness timer, the dispatcher, the role manager, the tick loop and the
//! announcer. Timers share one [`scheduler::DeadlineScheduler`] design.
//!
//! ### Shared Session
//! Roles and the game state live behind one [`session::Session`]. Roles are
//! always locked before the state, and only the MASTER may obtain the
//! state mutably.
//!
//! ## Module Organization
//!
//! ### Transport (`transport`)
//! UDP and multicast sockets, sequence numbering, and the feeds that tell
//! the other components what was sent.
//!
//! ### Delivery, Pinger and Liveness (`delivery`, `pinger`, `liveness`)
//! The retransmission, keep-alive and failure detection timers.
//!
//! ### Links (`links`)
//! Per-peer bookkeeping: whitelist, duplicate suppression and the join log.
//!
//! ### Roles and Session (`roles`, `session`)
//! The role transition table and the state it guards.
//!
//! ### Dispatch (`dispatch`)
//! Decodes every inbound datagram and routes it by message type.
//!
//! ### Game and State Loop (`game`, `state_loop`)
//! The snake rules and the master's tick.
//!
//! ### Node (`node`)
//! Wires everything together behind [`Node`].

pub mod announce;
pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod game;
pub mod links;
pub mod liveness;
pub mod node;
pub mod pinger;
pub mod roles;
pub mod scheduler;
pub mod session;
pub mod state_loop;
pub mod transport;

pub use config::NodeConfig;
pub use error::NodeError;
pub use node::Node;
pub use session::{NodeEvent, RoleView, SessionInfo};
