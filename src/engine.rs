//! Agreement engine (C3): per-peer role, peer set, faulty flag, in-round
//! tallies, and the oral-messages state machine that relays a primary's
//! order to every secondary and reports back the majority each secondary
//! sees.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, Notify, RwLock};

use crate::error::{EngineError, MembershipError, TransportError};
use crate::transport::Transport;
use crate::wire::{majority, Action, Frame, Order, PeerId};

/// The part of a peer's state the membership controller (C4) mutates:
/// `peers` (including self) and `primary_id`. Kept in its own lock, separate
/// from the round-state lock, so the membership controller can reshape the
/// peer set without taking the lock the engine's message handlers hold
/// while tallying a round.
#[derive(Clone)]
pub struct Membership {
    pub peers: BTreeMap<PeerId, SocketAddr>,
    pub primary_id: PeerId,
}

/// The part of a peer's state guarded by the single exclusive lock: the
/// in-flight round's tally and, at the primary, whether that round is still
/// open.
struct RoundState {
    received: HashMap<PeerId, Order>,
    round_active: bool,
}

pub struct Engine {
    id: PeerId,
    listen_addr: SocketAddr,
    faulty: AtomicBool,
    ready: AtomicBool,
    transport: Arc<Transport>,
    membership: RwLock<Membership>,
    round: Mutex<RoundState>,
    round_done: Notify,
    /// Held for the whole duration of `handle_client_order`; this is how
    /// overlapping client orders at one primary are serialized instead of
    /// being rejected or allowed to corrupt each other's tally.
    client_round_gate: Mutex<()>,
}

impl Engine {
    pub fn new(
        id: PeerId,
        listen_addr: SocketAddr,
        peers: BTreeMap<PeerId, SocketAddr>,
        primary_id: PeerId,
    ) -> Arc<Engine> {
        Arc::new(Engine {
            id,
            listen_addr,
            faulty: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            transport: Transport::new(listen_addr),
            membership: RwLock::new(Membership { peers, primary_id }),
            round: Mutex::new(RoundState {
                received: HashMap::new(),
                round_active: false,
            }),
            round_done: Notify::new(),
            client_round_gate: Mutex::new(()),
        })
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_faulty(&self) -> bool {
        // Simple atomic, no locking: a flip racing an outgoing send may tear
        // across a handful of sends, but each send only samples the flag
        // once, so there's nothing to corrupt.
        self.faulty.load(Ordering::Relaxed)
    }

    pub fn set_faulty(&self, faulty: bool) {
        self.faulty.store(faulty, Ordering::Relaxed);
    }

    pub async fn is_primary(&self) -> bool {
        self.membership.read().await.primary_id == self.id
    }

    pub async fn primary_id(&self) -> PeerId {
        self.membership.read().await.primary_id.clone()
    }

    pub async fn peer_count(&self) -> usize {
        self.membership.read().await.peers.len()
    }

    /// Lifecycle: bind the transport and dial every currently known peer.
    pub async fn start(self: &Arc<Self>) {
        self.ready.store(false, Ordering::Release);
        let peers = self.membership.read().await.peers.clone();
        for (peer, addr) in peers {
            self.transport.connect_peer(peer, addr).await;
        }
        self.transport.clone().serve(self.clone());
        self.ready.store(true, Ordering::Release);
    }

    /// Lifecycle: close every outbound channel. The transport's listener
    /// task is left to be dropped with the engine's last `Arc` handle.
    pub async fn stop(&self) {
        self.ready.store(false, Ordering::Release);
        let peers: Vec<PeerId> = self.membership.read().await.peers.keys().cloned().collect();
        for peer in peers {
            self.transport.disconnect_peer(&peer).await;
        }
    }

    /// A non-faulty peer forwards the value unchanged; a faulty one picks
    /// attack/retreat independently on every call, regardless of the input.
    /// Applied both to relays of the primary's order and to a secondary's
    /// own majority report back to the primary, so a faulty secondary can
    /// lie about what it tallied as well as about what it forwarded.
    fn faulty_filter(&self, v: Order) -> Order {
        if self.is_faulty() {
            if rand::thread_rng().gen_bool(0.5) {
                Order::Attack
            } else {
                Order::Retreat
            }
        } else {
            v
        }
    }

    /// Dispatches one inbound frame to the right handler. Returns the reply
    /// frame to write back on the same connection, if any.
    pub async fn handle_frame(&self, frame: Frame) -> Option<Frame> {
        match frame.action {
            Action::ClientOrder => {
                let value = match frame.decode_order_value() {
                    Ok(v) => v,
                    Err(err) => {
                        log::warn!("{} dropping malformed client_order: {}", self.id, err);
                        return None;
                    }
                };
                match self.handle_client_order(value).await {
                    Ok(votes) => match Frame::response(self.id.clone(), &votes) {
                        Ok(reply) => Some(reply),
                        Err(err) => {
                            log::error!("{} failed to encode response: {}", self.id, err);
                            None
                        }
                    },
                    Err(err) => {
                        log::warn!("{} rejected client_order: {}", self.id, err);
                        None
                    }
                }
            }
            Action::Order => {
                if frame.sender.is_client() {
                    log::warn!("{} dropping order frame from the client sentinel", self.id);
                    return None;
                }
                let value = match frame.decode_order_value() {
                    Ok(v) => v,
                    Err(err) => {
                        log::warn!("{} dropping malformed order frame: {}", self.id, err);
                        return None;
                    }
                };
                self.handle_order(frame.sender, value).await;
                None
            }
            Action::Response => {
                // Only the client stub consumes response frames.
                log::trace!("{} ignoring response frame, not the client", self.id);
                None
            }
        }
    }

    /// Entry point for the primary: broadcast the client's order to every
    /// secondary, then wait for the round to close before answering with
    /// the aggregated votes.
    pub async fn handle_client_order(
        &self,
        value: Order,
    ) -> Result<BTreeMap<PeerId, Order>, EngineError> {
        let _gate = self.client_round_gate.lock().await;

        if !self.is_primary().await {
            return Err(EngineError::NotPrimary(self.id.clone()));
        }
        if value == Order::Undecided {
            return Err(EngineError::InvalidClientOrder);
        }

        let primary_id = self.primary_id().await;
        let targets: Vec<(PeerId, SocketAddr)> = {
            let m = self.membership.read().await;
            m.peers
                .iter()
                .filter(|(pid, _)| **pid != self.id && **pid != primary_id)
                .map(|(pid, addr)| (pid.clone(), *addr))
                .collect()
        };

        {
            let mut round = self.round.lock().await;
            round.received.clear();
            round.round_active = !targets.is_empty();
        }

        for (pid, _addr) in &targets {
            let frame = Frame::order(self.id.clone(), self.faulty_filter(value));
            if let Err(err) = self.transport.send(pid, frame).await {
                log::warn!("{} failed to broadcast order to {}: {}", self.id, pid, err);
            }
        }

        // Wait for the round to close: a Notify wakeup layered over a short
        // poll, so a missed notification (notify_waiters only reaches
        // already-queued waiters) still resolves promptly instead of
        // hanging.
        loop {
            let done = { !self.round.lock().await.round_active };
            if done {
                break;
            }
            let _ = tokio::time::timeout(Duration::from_millis(20), self.round_done.notified()).await;
        }

        let mut round = self.round.lock().await;
        let mut votes = std::mem::take(&mut round.received);
        round.received.clear();
        votes.insert(self.id.clone(), value);
        Ok(votes)
    }

    /// Handles an `order` frame from peer `sender`: records its vote, and if
    /// the vote came from the primary, relays it to every other secondary.
    async fn handle_order(&self, sender: PeerId, value: Order) {
        let (primary_id, relay_targets) = {
            let m = self.membership.read().await;
            let relay_targets: Vec<(PeerId, SocketAddr)> = m
                .peers
                .iter()
                .filter(|(pid, _)| **pid != self.id && **pid != m.primary_id)
                .map(|(pid, addr)| (pid.clone(), *addr))
                .collect();
            (m.primary_id.clone(), relay_targets)
        };

        let is_from_primary = sender == primary_id;

        if let Err(err) = self.register_vote(sender, value).await {
            log::warn!("{} failed reporting majority to primary: {}", self.id, err);
        }

        if is_from_primary {
            for (pid, _addr) in relay_targets {
                let frame = Frame::order(self.id.clone(), self.faulty_filter(value));
                if let Err(err) = self.transport.send(&pid, frame).await {
                    log::warn!("{} failed to relay order to {}: {}", self.id, pid, err);
                }
            }
        }
    }

    /// Shared bookkeeping for both a normal vote arriving over the wire and
    /// the synthetic `Undecided` vote `remove_node` injects for a peer that
    /// is removed while this peer's round is still waiting on its vote.
    async fn register_vote(&self, voter: PeerId, value: Order) -> Result<(), TransportError> {
        let (is_primary_role, primary_id, expected) = {
            let m = self.membership.read().await;
            (
                self.id == m.primary_id,
                m.primary_id.clone(),
                m.peers.len().saturating_sub(1),
            )
        };

        let mut report = None;
        let mut closed = false;
        {
            let mut round = self.round.lock().await;
            round.received.insert(voter, value);
            if round.received.len() >= expected {
                if is_primary_role {
                    if round.round_active {
                        round.round_active = false;
                        closed = true;
                    }
                } else {
                    report = Some(majority(round.received.values().copied()));
                    round.received.clear();
                }
            }
        }

        if closed {
            self.round_done.notify_waiters();
        }

        if let Some(m) = report {
            // The report itself passes through faulty_filter too, not just
            // relays — see the note on faulty_filter.
            let frame = Frame::order(self.id.clone(), self.faulty_filter(m));
            self.transport.send(&primary_id, frame).await?;
        }

        Ok(())
    }

    /// C4 primitive, applied to one peer: register a newly joined peer and
    /// open an outbound channel to it.
    pub async fn add_node(&self, new_id: PeerId, new_addr: SocketAddr) -> Result<(), MembershipError> {
        self.ready.store(false, Ordering::Release);
        {
            let mut m = self.membership.write().await;
            if m.peers.contains_key(&new_id) {
                self.ready.store(true, Ordering::Release);
                return Err(MembershipError::DuplicatePeer(new_id));
            }
            m.peers.insert(new_id.clone(), new_addr);
        }
        self.transport.connect_peer(new_id, new_addr).await;
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// C4 primitive, applied to one peer: drop the outbound channel to the
    /// removed peer and elect a new primary if it was the one removed.
    /// Returns whether this peer had to elect a new primary as a result.
    pub async fn remove_node(&self, target_id: &PeerId) -> Result<bool, MembershipError> {
        {
            let m = self.membership.read().await;
            if !m.peers.contains_key(target_id) {
                return Err(MembershipError::UnknownPeer(target_id.clone()));
            }
        }

        // If this peer's own round is still waiting on `target_id`'s vote,
        // record a synthetic `Undecided` on its behalf so the round can
        // still close once it's pulled out of the peer set. A round is in
        // progress at the primary while `round_active` is set; a secondary
        // has no such flag, so it's judged to be mid-round whenever it is
        // already holding votes for the current round (it clears `received`
        // the moment it reports its own majority, which is also the moment
        // it stops waiting on anyone).
        let is_primary_role = self.is_primary().await;
        let needs_synthetic_vote = {
            let round = self.round.lock().await;
            let round_in_progress = if is_primary_role {
                round.round_active
            } else {
                !round.received.is_empty()
            };
            round_in_progress && !round.received.contains_key(target_id)
        };
        if needs_synthetic_vote {
            if let Err(err) = self.register_vote(target_id.clone(), Order::Undecided).await {
                log::warn!(
                    "{} failed to report synthetic undecided vote for removed peer {}: {}",
                    self.id,
                    target_id,
                    err
                );
            }
        }

        let became_new_primary;
        {
            let mut m = self.membership.write().await;
            m.peers.remove(target_id);
            if &m.primary_id == target_id {
                m.primary_id = m.peers.keys().min().cloned().unwrap_or_else(|| self.id.clone());
                became_new_primary = true;
            } else {
                became_new_primary = false;
            }
        }
        self.transport.disconnect_peer(target_id).await;
        Ok(became_new_primary)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn single_node_cluster_closes_round_immediately() {
        let id = PeerId::from("G1");
        let mut peers = BTreeMap::new();
        peers.insert(id.clone(), addr(20001));
        let engine = Engine::new(id.clone(), addr(20001), peers, id.clone());
        engine.start().await;

        let votes = engine.handle_client_order(Order::Attack).await.unwrap();
        assert_eq!(votes.get(&id), Some(&Order::Attack));
        assert_eq!(votes.len(), 1);
    }

    #[tokio::test]
    async fn client_order_rejects_undecided() {
        let id = PeerId::from("G1");
        let mut peers = BTreeMap::new();
        peers.insert(id.clone(), addr(20002));
        let engine = Engine::new(id.clone(), addr(20002), peers, id.clone());
        engine.start().await;

        let err = engine.handle_client_order(Order::Undecided).await.unwrap_err();
        assert_matches!(err, EngineError::InvalidClientOrder);
    }

    #[tokio::test]
    async fn non_primary_rejects_client_order() {
        let id = PeerId::from("G2");
        let primary = PeerId::from("G1");
        let mut peers = BTreeMap::new();
        peers.insert(id.clone(), addr(20003));
        peers.insert(primary.clone(), addr(20004));
        let engine = Engine::new(id, addr(20003), peers, primary);
        engine.start().await;

        let err = engine.handle_client_order(Order::Attack).await.unwrap_err();
        assert_matches!(err, EngineError::NotPrimary(_));
    }

    #[tokio::test]
    async fn remove_primary_elects_minimum_remaining_id() {
        let g1 = PeerId::from("G1");
        let g2 = PeerId::from("G2");
        let g3 = PeerId::from("G3");
        let mut peers = BTreeMap::new();
        peers.insert(g1.clone(), addr(20010));
        peers.insert(g2.clone(), addr(20011));
        peers.insert(g3.clone(), addr(20012));

        let engine = Engine::new(g2.clone(), addr(20011), peers, g1.clone());
        engine.start().await;

        let became_primary = engine.remove_node(&g1).await.unwrap();
        assert!(became_primary);
        assert_eq!(engine.primary_id().await, g2);
    }

    #[tokio::test]
    async fn add_then_remove_restores_peer_count() {
        let g1 = PeerId::from("G1");
        let g2 = PeerId::from("G2");
        let mut peers = BTreeMap::new();
        peers.insert(g1.clone(), addr(20020));
        peers.insert(g2.clone(), addr(20021));

        let engine = Engine::new(g1.clone(), addr(20020), peers, g1.clone());
        engine.start().await;

        let before = engine.peer_count().await;
        engine.add_node(PeerId::from("G3"), addr(20022)).await.unwrap();
        engine.remove_node(&PeerId::from("G3")).await.unwrap();
        assert_eq!(engine.peer_count().await, before);
    }

    #[tokio::test]
    async fn remove_node_on_secondary_mid_round_synthesizes_the_missing_vote() {
        let g0 = PeerId::from("G0");
        let g1 = PeerId::from("G1");
        let g2 = PeerId::from("G2");
        let g3 = PeerId::from("G3");
        let mut peers = BTreeMap::new();
        peers.insert(g0.clone(), addr(20040));
        peers.insert(g1.clone(), addr(20041));
        peers.insert(g2.clone(), addr(20042));
        peers.insert(g3.clone(), addr(20043));

        let engine0 = Engine::new(g0.clone(), addr(20040), peers.clone(), g0.clone());
        let engine1 = Engine::new(g1.clone(), addr(20041), peers.clone(), g0.clone());
        let engine2 = Engine::new(g2.clone(), addr(20042), peers.clone(), g0.clone());
        let engine3 = Engine::new(g3.clone(), addr(20043), peers, g0.clone());
        engine0.start().await;
        engine1.start().await;
        engine2.start().await;
        engine3.start().await;

        // G1 (a secondary) has tallied the primary's own order and G2's
        // relay of it, but G3's vote hasn't arrived -- the secondary-side
        // equivalent of a round still being in progress.
        engine1.handle_order(g0.clone(), Order::Attack).await;
        engine1.handle_order(g2.clone(), Order::Attack).await;

        let became_new_primary = engine1.remove_node(&g3).await.unwrap();
        assert!(!became_new_primary);

        // the synthetic undecided vote recorded for G3 completed G1's
        // tally, so it reported its majority to the primary and cleared its
        // own round state instead of waiting forever on a vote that will
        // never arrive.
        assert!(engine1.round.lock().await.received.is_empty());
    }

    #[tokio::test]
    async fn duplicate_add_is_rejected_without_mutation() {
        let g1 = PeerId::from("G1");
        let g2 = PeerId::from("G2");
        let mut peers = BTreeMap::new();
        peers.insert(g1.clone(), addr(20030));
        peers.insert(g2.clone(), addr(20031));

        let engine = Engine::new(g1.clone(), addr(20030), peers, g1.clone());
        engine.start().await;

        let before = engine.peer_count().await;
        let err = engine.add_node(g2.clone(), addr(20031)).await.unwrap_err();
        assert_matches!(err, MembershipError::DuplicatePeer(_));
        assert_eq!(engine.peer_count().await, before);
    }
}
