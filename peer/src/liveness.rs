//! Inbound-driven failure detection.
//!
//! Every peer that sent us anything is tracked with a deadline at
//! `last_received + inactivity_timeout`. When the deadline passes the peer
//! is dropped from tracking and its id is pushed onto the inactive queue,
//! once per continuous silence.

use crate::scheduler::DeadlineScheduler;
use log::info;
use shared::PeerId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Notice that a datagram from `peer` was received.
#[derive(Debug, Clone, Copy)]
pub struct InboundActivity {
    pub peer: PeerId,
    pub received_at: Instant,
}

/// Flags peers that have gone silent.
///
/// - A peer is tracked from the first datagram it is seen sending
/// - Silence longer than `timeout` puts it on the inactive queue once
/// - A reported peer stays untracked until it is heard from again
pub struct LivenessDetector {
    timeout: Duration,
    peers: Mutex<HashMap<PeerId, Instant>>,
    deadlines: DeadlineScheduler<PeerId>,
    inactive_tx: mpsc::UnboundedSender<PeerId>,
}

impl LivenessDetector {
    /// Returns the detector and the consumer end of its inactive-peer queue.
    pub fn new(timeout: Duration) -> (Self, mpsc::UnboundedReceiver<PeerId>) {
        let (inactive_tx, inactive_rx) = mpsc::unbounded_channel();
        let detector = Self {
            timeout,
            peers: Mutex::new(HashMap::new()),
            deadlines: DeadlineScheduler::new(),
            inactive_tx,
        };
        (detector, inactive_rx)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, Instant>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records traffic from `peer`, starting to track it on first contact.
    pub fn observe(&self, peer: PeerId, received_at: Instant) {
        let mut peers = self.lock();
        let last_received = peers.entry(peer).or_insert(received_at);
        if received_at > *last_received {
            *last_received = received_at;
        }
        self.deadlines.schedule(peer, *last_received + self.timeout);
    }

    /// Stops watching `peer` without reporting it.
    pub fn forget(&self, peer: PeerId) {
        self.lock().remove(&peer);
        self.deadlines.cancel(&peer);
    }

    /// Stops watching everyone.
    pub fn clear(&self) {
        self.lock().clear();
        self.deadlines.clear();
    }

    pub fn is_tracked(&self, peer: PeerId) -> bool {
        self.lock().contains_key(&peer)
    }

    fn on_deadline(&self, peer: PeerId) {
        let mut peers = self.lock();
        let Some(last_received) = peers.get(&peer).copied() else {
            return;
        };
        // Traffic observed after the deadline was drained keeps the peer.
        if last_received + self.timeout > Instant::now() {
            self.deadlines.schedule(peer, last_received + self.timeout);
            return;
        }

        peers.remove(&peer);
        info!(
            "Peer {} silent for {:?}, reporting inactive",
            peer, self.timeout
        );
        let _ = self.inactive_tx.send(peer);
    }

    /// Consumes inbound activity and reports peers whose deadline passes.
    pub async fn run(self: Arc<Self>, mut activity_rx: mpsc::UnboundedReceiver<InboundActivity>) {
        loop {
            tokio::select! {
                biased;

                activity = activity_rx.recv() => match activity {
                    Some(activity) => self.observe(activity.peer, activity.received_at),
                    None => break,
                },
                due = self.deadlines.next_due() => {
                    for (peer, _) in due {
                        self.on_deadline(peer);
                    }
                }
            }
        }
    }
}
