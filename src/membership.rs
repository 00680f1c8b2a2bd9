//! Membership controller (C4): applies `add_node`/`remove_node` across
//! every live peer, mirroring `examples/original_source/main.py`'s
//! module-level `add_node`/`remove_node` functions, which loop over
//! `generals.items()` calling the per-peer primitive on each one.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::cli::Args;
use crate::client::ClientStub;
use crate::engine::Engine;
use crate::error::MembershipError;
use crate::wire::{Order, PeerId};

pub struct Cluster {
    pub engines: BTreeMap<PeerId, Arc<Engine>>,
    pub client: ClientStub,
    pub faulty: BTreeSet<PeerId>,
    host: String,
    next_port: u16,
    next_ordinal: usize,
}

impl Cluster {
    /// Mirrors `examples/original_source/main.py`'s startup block: mint
    /// `N` peer ids/ports, start every general, point the client stub at
    /// the lexicographically smallest id.
    pub async fn bootstrap(args: &Args) -> anyhow::Result<Cluster> {
        let mut peers = BTreeMap::new();
        for i in 0..args.generals {
            let id = PeerId::from(format!("G{i}"));
            let addr: SocketAddr = format!("{}:{}", args.host, args.base_port + i as u16).parse()?;
            peers.insert(id, addr);
        }
        let primary_id = peers.keys().min().cloned().expect("generals must be > 0");

        let mut engines = BTreeMap::new();
        for (id, addr) in &peers {
            let engine = Engine::new(id.clone(), *addr, peers.clone(), primary_id.clone());
            engine.start().await;
            engines.insert(id.clone(), engine);
        }

        let primary_addr = peers[&primary_id];
        Ok(Cluster {
            engines,
            client: ClientStub::new(primary_id, primary_addr),
            faulty: BTreeSet::new(),
            host: args.host.clone(),
            next_port: args.base_port + args.generals as u16,
            next_ordinal: args.generals,
        })
    }

    /// `g-add <k>`: mint `k` fresh peers and apply `add_node` to the whole
    /// live cluster.
    pub async fn add_nodes(&mut self, count: usize) {
        for _ in 0..count {
            self.add_one_node().await;
        }
    }

    async fn add_one_node(&mut self) {
        let id = PeerId::from(format!("G{}", self.next_ordinal));
        let addr: SocketAddr = format!("{}:{}", self.host, self.next_port)
            .parse()
            .expect("host:port must be valid");
        self.next_ordinal += 1;
        self.next_port += 1;

        for engine in self.engines.values() {
            if let Err(err) = engine.add_node(id.clone(), addr).await {
                log::warn!("add_node({}) failed on {}: {}", id, engine.id(), err);
            }
        }

        let primary_id = match self.engines.values().next() {
            Some(engine) => engine.primary_id().await,
            None => id.clone(),
        };

        let peers: BTreeMap<PeerId, SocketAddr> = {
            let mut m = BTreeMap::new();
            for (pid, engine) in &self.engines {
                m.insert(pid.clone(), engine.listen_addr());
            }
            m.insert(id.clone(), addr);
            m
        };

        let new_engine = Engine::new(id.clone(), addr, peers, primary_id);
        new_engine.start().await;
        self.engines.insert(id, new_engine);
    }

    /// `g-kill <id>`: apply `remove_node` to every surviving peer, stop the
    /// removed peer, and re-point the client stub if the primary moved.
    pub async fn remove_node(&mut self, target: &PeerId) -> Result<(), MembershipError> {
        if !self.engines.contains_key(target) {
            return Err(MembershipError::UnknownPeer(target.clone()));
        }

        for (id, engine) in self.engines.iter() {
            if id == target {
                continue;
            }
            if let Err(err) = engine.remove_node(target).await {
                log::warn!("remove_node({}) failed on {}: {}", target, id, err);
            }
        }

        if let Some(engine) = self.engines.remove(target) {
            engine.stop().await;
        }
        self.faulty.remove(target);

        if let Some(new_primary_id) = self.engines.keys().min().cloned() {
            if new_primary_id != self.client.primary().await.0 {
                let addr = self.engines[&new_primary_id].listen_addr();
                self.client.set_primary(new_primary_id, addr).await;
            }
        }

        Ok(())
    }

    /// `g-state <id> <Faulty|Non-faulty>`.
    pub async fn set_state(&mut self, target: &PeerId, faulty: bool) -> Result<(), MembershipError> {
        let engine = self
            .engines
            .get(target)
            .ok_or_else(|| MembershipError::UnknownPeer(target.clone()))?;
        engine.set_faulty(faulty);
        if faulty {
            self.faulty.insert(target.clone());
        } else {
            self.faulty.remove(target);
        }
        Ok(())
    }

    /// Whenever `3*|faulty| + 1 > |peers|` the Byzantine bound no longer
    /// holds for this cluster, and agreement can no longer be guaranteed.
    pub fn quorum_warning(&self) -> Option<String> {
        let f = self.faulty.len();
        let n = self.engines.len();
        if 3 * f + 1 > n {
            Some(format!(
                "quorum bound violated: 3*{f}+1 > {n}, agreement is no longer guaranteed"
            ))
        } else {
            None
        }
    }

    /// Mirrors `examples/original_source/main.py`'s `print_system()`.
    pub async fn print_system(&self) {
        let primary_id = self.client.primary().await.0;
        for (id, _engine) in &self.engines {
            let role = if *id == primary_id { "primary" } else { "secondary" };
            let state = if self.faulty.contains(id) { "F" } else { "NF" };
            println!("{id} {state} {role}");
        }
    }

    pub async fn send_order(&self, value: Order) -> anyhow::Result<(Order, BTreeMap<PeerId, Order>)> {
        Ok(self.client.send_order(value).await?)
    }
}
