//! Reliable delivery on top of the lossy transport.
//!
//! Every ack-required send becomes a [`PendingDelivery`] keyed by
//! `(sequence, receiver)` and a deadline `ack_timeout` later. A matching ack
//! clears both. When a deadline fires the exact same envelope is sent again,
//! but only while its receiver is still a registered target; there is no retry
//! counter. Targets are deregistered when the liveness detector gives up on a
//! peer, which is what finally bounds retransmission.

use crate::scheduler::DeadlineScheduler;
use crate::transport::{Outbound, SentDatagram};
use log::{debug, warn};
use shared::{Envelope, PeerId};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Correlates an acknowledgement with the send it confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckKey {
    pub seq: u64,
    pub peer: PeerId,
}

/// An ack-required send that has not been confirmed yet.
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    /// Resent verbatim, sequence number included.
    pub envelope: Envelope,
    pub addr: SocketAddr,
    /// Time of the latest (re)transmission.
    pub sent_at: Instant,
}

#[derive(Default)]
struct Deliveries {
    pending: HashMap<AckKey, PendingDelivery>,
    targets: HashSet<PeerId>,
}

/// Retransmits ack-required sends until they are acknowledged.
///
/// - Only sends to peers registered with [`add_target`](Self::add_target) are tracked
/// - Each pending send is resent once per `ack_timeout` without an ack
/// - Removing a target drops everything still pending for it
pub struct DeliveryController {
    ack_timeout: Duration,
    outbound: Outbound,
    deliveries: Mutex<Deliveries>,
    deadlines: DeadlineScheduler<AckKey>,
}

impl DeliveryController {
    /// Retransmissions go out through `outbound` every `ack_timeout`.
    pub fn new(ack_timeout: Duration, outbound: Outbound) -> Self {
        Self {
            ack_timeout,
            outbound,
            deliveries: Mutex::new(Deliveries::default()),
            deadlines: DeadlineScheduler::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Deliveries> {
        self.deliveries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts tracking ack-required sends to `peer`.
    pub fn add_target(&self, peer: PeerId) {
        self.lock().targets.insert(peer);
    }

    /// Stops retransmitting to `peer` and discards everything still pending for it.
    pub fn remove_target(&self, peer: PeerId) {
        let mut deliveries = self.lock();
        deliveries.targets.remove(&peer);

        let dropped: Vec<AckKey> = deliveries
            .pending
            .keys()
            .filter(|key| key.peer == peer)
            .copied()
            .collect();
        for key in dropped {
            deliveries.pending.remove(&key);
            self.deadlines.cancel(&key);
        }
    }

    /// Forgets every target and every pending send.
    pub fn clear(&self) {
        let mut deliveries = self.lock();
        deliveries.pending.clear();
        deliveries.targets.clear();
        self.deadlines.clear();
    }

    pub fn is_target(&self, peer: PeerId) -> bool {
        self.lock().targets.contains(&peer)
    }

    pub fn is_pending(&self, key: &AckKey) -> bool {
        self.lock().pending.contains_key(key)
    }

    /// Number of sends still waiting for an ack.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Starts tracking an ack-required send.
    pub fn register(&self, sent: SentDatagram) {
        let Some(peer) = sent.envelope.receiver else {
            debug!(
                "{} #{} has no receiver id, cannot correlate an ack",
                sent.envelope.message.name(),
                sent.envelope.seq
            );
            return;
        };

        let key = AckKey {
            seq: sent.envelope.seq,
            peer,
        };
        let deadline = sent.sent_at + self.ack_timeout;
        self.lock().pending.insert(
            key,
            PendingDelivery {
                envelope: sent.envelope,
                addr: sent.addr,
                sent_at: sent.sent_at,
            },
        );
        self.deadlines.schedule(key, deadline);
    }

    /// Returns true when the ack matched an outstanding delivery.
    pub fn acknowledge(&self, key: AckKey) -> bool {
        let removed = self.lock().pending.remove(&key).is_some();
        if removed {
            self.deadlines.cancel(&key);
        }
        removed
    }

    fn on_deadline(&self, key: AckKey) {
        let mut deliveries = self.lock();

        // An ack may have landed after the deadline was drained.
        let Some(pending) = deliveries.pending.get(&key).cloned() else {
            return;
        };

        if !deliveries.targets.contains(&key.peer) {
            deliveries.pending.remove(&key);
            debug!("Dropping #{} for peer {}: no longer a target", key.seq, key.peer);
            return;
        }

        match self
            .outbound
            .send_without_ack(pending.envelope.clone(), pending.addr)
        {
            Ok(sent) => {
                debug!(
                    "Resent {} #{} to peer {}",
                    pending.envelope.message.name(),
                    key.seq,
                    key.peer
                );
                if let Some(entry) = deliveries.pending.get_mut(&key) {
                    entry.sent_at = sent.sent_at;
                }
                self.deadlines.schedule(key, sent.sent_at + self.ack_timeout);
            }
            Err(e) => {
                warn!("Failed to resend #{} to peer {}: {}", key.seq, key.peer, e);
                deliveries.pending.remove(&key);
            }
        }
    }

    /// Consumes ack-required sends and received acks, retransmitting on timeout.
    pub async fn run(
        self: Arc<Self>,
        mut sent_rx: mpsc::UnboundedReceiver<SentDatagram>,
        mut ack_rx: mpsc::UnboundedReceiver<AckKey>,
    ) {
        loop {
            tokio::select! {
                // Registrations first: an ack can never overtake its own send.
                biased;

                sent = sent_rx.recv() => match sent {
                    Some(sent) => self.register(sent),
                    None => break,
                },
                ack = ack_rx.recv() => match ack {
                    Some(key) => {
                        if !self.acknowledge(key) {
                            debug!("Ack #{} from peer {} matched nothing", key.seq, key.peer);
                        }
                    }
                    None => break,
                },
                due = self.deadlines.next_due() => {
                    for (key, _) in due {
                        self.on_deadline(key);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{decode, Direction, Message};

    const ACK_TIMEOUT: Duration = Duration::from_millis(100);

    struct Harness {
        outbound: Outbound,
        controller: Arc<DeliveryController>,
        ack_tx: mpsc::UnboundedSender<AckKey>,
        wire: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
    }

    fn harness() -> Harness {
        let (outbound, feeds, wire) = Outbound::channel(None);
        let controller = Arc::new(DeliveryController::new(ACK_TIMEOUT, outbound.clone()));
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        tokio::spawn(Arc::clone(&controller).run(feeds.ack_required, ack_rx));
        Harness {
            outbound,
            controller,
            ack_tx,
            wire,
        }
    }

    fn master_addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn drain(wire: &mut mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        while let Ok((bytes, _)) = wire.try_recv() {
            envelopes.push(decode(&bytes).unwrap());
        }
        envelopes
    }

    #[tokio::test(start_paused = true)]
    async fn test_acked_steer_is_never_resent() {
        let mut h = harness();
        h.controller.add_target(1);
        h.outbound.set_local_id(Some(5));

        let steer = Envelope {
            seq: 10,
            sender: Some(5),
            receiver: Some(1),
            message: Message::Steer {
                direction: Direction::Left,
            },
        };
        h.outbound.send(steer, master_addr()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.controller.is_pending(&AckKey { seq: 10, peer: 1 }));

        h.ack_tx.send(AckKey { seq: 10, peer: 1 }).unwrap();
        tokio::time::sleep(ACK_TIMEOUT * 5).await;

        assert_eq!(h.controller.pending_len(), 0);
        let sent = drain(&mut h.wire);
        assert_eq!(sent.len(), 1, "only the original transmission goes out");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_message_is_resent_unchanged() {
        let mut h = harness();
        h.controller.add_target(1);

        let ping = h.outbound.envelope(Some(1), Message::Ping);
        let seq = ping.seq;
        h.outbound.send(ping, master_addr()).unwrap();

        tokio::time::sleep(ACK_TIMEOUT * 3 + Duration::from_millis(10)).await;

        let sent = drain(&mut h.wire);
        assert!(sent.len() >= 3);
        assert!(sent.iter().all(|envelope| envelope.seq == seq));
        assert!(h.controller.is_pending(&AckKey { seq, peer: 1 }));

        h.ack_tx.send(AckKey { seq, peer: 1 }).unwrap();
        tokio::time::sleep(ACK_TIMEOUT * 3).await;
        assert!(drain(&mut h.wire).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_target_stops_retransmission() {
        let mut h = harness();
        h.controller.add_target(2);

        let state_change = h.outbound.envelope(
            Some(2),
            Message::RoleChange {
                sender_role: None,
                receiver_role: Some(shared::NodeRole::Deputy),
            },
        );
        h.outbound.send(state_change, master_addr()).unwrap();
        tokio::time::sleep(ACK_TIMEOUT + Duration::from_millis(10)).await;
        assert_eq!(drain(&mut h.wire).len(), 2);

        h.controller.remove_target(2);
        assert_eq!(h.controller.pending_len(), 0);

        tokio::time::sleep(ACK_TIMEOUT * 4).await;
        assert!(drain(&mut h.wire).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_receiver_is_discarded_at_deadline() {
        let mut h = harness();

        h.outbound
            .send(h.outbound.envelope(Some(3), Message::Ping), master_addr())
            .unwrap();
        tokio::time::sleep(ACK_TIMEOUT * 2).await;

        assert_eq!(drain(&mut h.wire).len(), 1);
        assert_eq!(h.controller.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_key_includes_peer() {
        let h = harness();
        h.controller.add_target(1);
        h.controller.add_target(2);

        let envelope = h.outbound.envelope(Some(1), Message::Ping);
        let seq = envelope.seq;
        h.outbound.send(envelope, master_addr()).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(!h.controller.acknowledge(AckKey { seq, peer: 2 }));
        assert!(h.controller.acknowledge(AckKey { seq, peer: 1 }));
        assert!(!h.controller.acknowledge(AckKey { seq, peer: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_envelope_without_receiver_is_not_tracked() {
        let h = harness();
        h.outbound
            .send(h.outbound.envelope(None, Message::Ping), master_addr())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.controller.pending_len(), 0);
    }
}
