//! Keeps quiet links alive.
//!
//! Each target gets a deadline at `last_sent + ping_interval`. Any outbound
//! envelope addressed to a target pushes its deadline back, so pings are only
//! sent on links with no real traffic.

use crate::scheduler::DeadlineScheduler;
use crate::transport::{Outbound, SentDatagram};
use log::{debug, warn};
use shared::{Message, PeerId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct SendActivity {
    addr: SocketAddr,
    last_sent: Instant,
}

/// Keeps quiet links alive.
///
/// - Every target gets a PING once nothing was sent to it for `ping_interval`
/// - Any other send to a target pushes its next PING back
pub struct Pinger {
    ping_interval: Duration,
    outbound: Outbound,
    targets: Mutex<HashMap<PeerId, SendActivity>>,
    deadlines: DeadlineScheduler<PeerId>,
}

impl Pinger {
    /// Pings go out through `outbound`.
    pub fn new(ping_interval: Duration, outbound: Outbound) -> Self {
        Self {
            ping_interval,
            outbound,
            targets: Mutex::new(HashMap::new()),
            deadlines: DeadlineScheduler::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, SendActivity>> {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts pinging `peer`, or updates its address if already a target.
    pub fn add_target(&self, peer: PeerId, addr: SocketAddr, last_sent: Instant) {
        let mut targets = self.lock();
        let activity = targets.entry(peer).or_insert(SendActivity { addr, last_sent });
        activity.addr = addr;
        if last_sent > activity.last_sent {
            activity.last_sent = last_sent;
        }
        self.deadlines
            .schedule(peer, activity.last_sent + self.ping_interval);
    }

    /// Stops pinging `peer`.
    pub fn remove_target(&self, peer: PeerId) {
        self.lock().remove(&peer);
        self.deadlines.cancel(&peer);
    }

    /// Drops every target.
    pub fn clear(&self) {
        self.lock().clear();
        self.deadlines.clear();
    }

    pub fn is_target(&self, peer: PeerId) -> bool {
        self.lock().contains_key(&peer)
    }

    /// Defers the next ping to a target that just had real traffic.
    pub fn observe(&self, sent: &SentDatagram) {
        let Some(peer) = sent.envelope.receiver else {
            return;
        };
        let mut targets = self.lock();
        if let Some(activity) = targets.get_mut(&peer) {
            if sent.sent_at > activity.last_sent {
                activity.last_sent = sent.sent_at;
                self.deadlines.schedule(peer, sent.sent_at + self.ping_interval);
            }
        }
    }

    fn on_deadline(&self, peer: PeerId) {
        let addr = match self.lock().get(&peer) {
            Some(activity) => activity.addr,
            None => return,
        };

        let ping = self.outbound.envelope(Some(peer), Message::Ping);
        let seq = ping.seq;
        match self.outbound.send(ping, addr) {
            Ok(sent) => {
                debug!("Pinged peer {} (#{})", peer, seq);
                if let Some(activity) = self.lock().get_mut(&peer) {
                    activity.last_sent = sent.sent_at;
                    self.deadlines.schedule(peer, sent.sent_at + self.ping_interval);
                }
            }
            Err(e) => warn!("Failed to ping peer {}: {}", peer, e),
        }
    }

    /// Consumes the send feed and pings targets whose link went quiet.
    pub async fn run(self: Arc<Self>, mut sent_rx: mpsc::UnboundedReceiver<SentDatagram>) {
        loop {
            tokio::select! {
                biased;

                sent = sent_rx.recv() => match sent {
                    Some(sent) => self.observe(&sent),
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

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{decode, Direction, Envelope};

    const PING_INTERVAL: Duration = Duration::from_millis(100);

    fn addr() -> SocketAddr {
        "127.0.0.1:9100".parse().unwrap()
    }

    fn setup() -> (
        Outbound,
        Arc<Pinger>,
        mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
    ) {
        let (outbound, feeds, wire) = Outbound::channel(None);
        let pinger = Arc::new(Pinger::new(PING_INTERVAL, outbound.clone()));
        tokio::spawn(Arc::clone(&pinger).run(feeds.sent));
        (outbound, pinger, wire)
    }

    fn pings(wire: &mut mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>) -> Vec<Envelope> {
        let mut sent = Vec::new();
        while let Ok((bytes, _)) = wire.try_recv() {
            let envelope = decode(&bytes).unwrap();
            if envelope.message == Message::Ping {
                sent.push(envelope);
            }
        }
        sent
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_target_is_pinged_every_interval() {
        let (_outbound, pinger, mut wire) = setup();
        pinger.add_target(1, addr(), Instant::now());

        tokio::time::sleep(PING_INTERVAL * 3 + Duration::from_millis(5)).await;

        let sent = pings(&mut wire);
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|ping| ping.receiver == Some(1)));
        assert!(sent.windows(2).all(|pair| pair[1].seq > pair[0].seq));
    }

    #[tokio::test(start_paused = true)]
    async fn test_real_traffic_defers_ping() {
        let (outbound, pinger, mut wire) = setup();
        pinger.add_target(1, addr(), Instant::now());

        for _ in 0..5 {
            tokio::time::sleep(PING_INTERVAL / 2).await;
            let steer = outbound.envelope(
                Some(1),
                Message::Steer {
                    direction: Direction::Up,
                },
            );
            outbound.send(steer, addr()).unwrap();
        }

        assert!(pings(&mut wire).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_target_is_not_pinged() {
        let (_outbound, pinger, mut wire) = setup();
        pinger.add_target(1, addr(), Instant::now());
        pinger.remove_target(1);

        tokio::time::sleep(PING_INTERVAL * 3).await;

        assert!(pings(&mut wire).is_empty());
        assert!(!pinger.is_target(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_to_untracked_peer_is_ignored() {
        let (outbound, pinger, mut wire) = setup();

        outbound
            .send(outbound.envelope(Some(7), Message::Ack), addr())
            .unwrap();
        tokio::time::sleep(PING_INTERVAL * 2).await;

        assert!(!pinger.is_target(7));
        assert!(pings(&mut wire).is_empty());
    }
}
