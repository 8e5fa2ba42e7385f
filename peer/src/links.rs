//! Per-session bookkeeping about remote peers.
//!
//! Linking a peer makes it a retransmission target, a ping target and a
//! liveness-tracked peer in one step, and whitelists its address. The
//! duplicate-suppression history lives here too, since it is scoped to the
//! same session and must be forgotten with it.

use crate::delivery::DeliveryController;
use crate::liveness::LivenessDetector;
use crate::pinger::Pinger;
use log::debug;
use shared::PeerId;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

/// How many recent sequence numbers are remembered per sender.
pub const DEDUP_WINDOW: usize = 256;

#[derive(Debug, Default)]
struct SeqWindow {
    order: VecDeque<u64>,
    seen: HashSet<u64>,
}

impl SeqWindow {
    /// Returns false when `seq` is already in the window.
    fn insert(&mut self, seq: u64) -> bool {
        if !self.seen.insert(seq) {
            return false;
        }
        self.order.push_back(seq);
        if self.order.len() > DEDUP_WINDOW {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

#[derive(Debug, Default)]
struct History {
    handled: HashMap<PeerId, SeqWindow>,
    joins: HashMap<SocketAddr, (u64, PeerId)>,
    steers: HashMap<PeerId, u64>,
    whitelist: HashSet<SocketAddr>,
}

pub struct Links {
    delivery: Arc<DeliveryController>,
    pinger: Arc<Pinger>,
    liveness: Arc<LivenessDetector>,
    history: Mutex<History>,
}

impl Links {
    pub fn new(
        delivery: Arc<DeliveryController>,
        pinger: Arc<Pinger>,
        liveness: Arc<LivenessDetector>,
    ) -> Self {
        Self {
            delivery,
            pinger,
            liveness,
            history: Mutex::new(History::default()),
        }
    }

    fn history(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn link(&self, peer: PeerId, addr: SocketAddr) {
        debug!("Linking peer {} at {}", peer, addr);
        let now = Instant::now();
        self.allow(addr);
        self.delivery.add_target(peer);
        self.pinger.add_target(peer, addr, now);
        self.liveness.observe(peer, now);
    }

    pub fn unlink(&self, peer: PeerId) {
        debug!("Unlinking peer {}", peer);
        self.delivery.remove_target(peer);
        self.pinger.remove_target(peer);
        self.liveness.forget(peer);
    }

    /// Drops every link and all session history.
    pub fn reset(&self) {
        self.delivery.clear();
        self.pinger.clear();
        self.liveness.clear();
        *self.history() = History::default();
    }

    pub fn allow(&self, addr: SocketAddr) {
        self.history().whitelist.insert(addr);
    }

    pub fn is_allowed(&self, addr: &SocketAddr) -> bool {
        self.history().whitelist.contains(addr)
    }

    /// Records `(sender, seq)` as handled. Returns false for a repeat.
    pub fn first_delivery(&self, sender: PeerId, seq: u64) -> bool {
        self.history().handled.entry(sender).or_default().insert(seq)
    }

    /// Accepts a steer only when it is newer than the last one applied.
    pub fn accept_steer(&self, sender: PeerId, seq: u64) -> bool {
        let mut history = self.history();
        match history.steers.get(&sender) {
            Some(last) if *last >= seq => false,
            _ => {
                history.steers.insert(sender, seq);
                true
            }
        }
    }

    /// The `(seq, id)` of the join last accepted from `addr`.
    pub fn join_record(&self, addr: &SocketAddr) -> Option<(u64, PeerId)> {
        self.history().joins.get(addr).copied()
    }

    pub fn record_join(&self, addr: SocketAddr, seq: u64, peer: PeerId) {
        self.history().joins.insert(addr, (seq, peer));
    }

    pub fn is_linked(&self, peer: PeerId) -> bool {
        self.delivery.is_target(peer)
    }
}
