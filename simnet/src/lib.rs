//! A deterministic in-process network simulator.
//!
//! The simulator owns a directed topology graph whose edges carry a latency and a delivery
//! reliability, a registry of port-exclusive listeners, a connection registry with lifecycle
//! states, and a connection pool. Every probabilistic decision is drawn from one seedable RNG in
//! call order, so a test's delivery schedule is a function of the seed and the sequence of
//! operations alone — no wall clock, no OS scheduler. Timing runs on tokio's clock, so tests may
//! pause and step virtual time.
//!
//! Nothing here knows anything about any particular protocol: the simulator moves opaque
//! datagrams between virtual endpoints. Higher layers decide what the bytes mean.

mod connection;
mod listener;
mod node;
mod pool;

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use tokio::sync::watch;
use tokio::time::Duration;

pub use crate::connection::Connection;
pub use crate::connection::ConnectionRegistry;
pub use crate::connection::ConnectionState;
pub use crate::listener::Datagram;
pub use crate::listener::Listener;
pub use crate::node::SimNode;
pub use crate::pool::ConnectionPool;
pub use crate::pool::PoolConfig;

/// A virtual network address.
pub type Address = String;

/// A virtual `(address, port)` endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub address: Address,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<Address>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// The properties of a directed edge in the topology graph.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NetworkEdge {
    latency: Duration,
    reliability: f64,
}

impl NetworkEdge {
    /// Create a new edge with the given delivery latency and reliability in `[0.0, 1.0]`.
    pub fn new(latency: Duration, reliability: f64) -> Self {
        Self {
            latency,
            reliability: reliability.clamp(0.0, 1.0),
        }
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    pub fn reliability(&self) -> f64 {
        self.reliability
    }
}

/// Error variants from simulator operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SimError {
    /// There is no route to the target, or nothing is listening at the target endpoint.
    #[error("no route or listener for the target endpoint")]
    Unreachable,
    /// The operation did not complete within its deadline, or was abandoned by a simulator
    /// `stop()`/`reset()` while still pending.
    #[error("the operation timed out")]
    Timeout,
    /// The port is already bound by another listener at this address.
    #[error("port {0} is already bound")]
    PortInUse(u16),
    /// The simulator is not running.
    #[error("the simulator is not running")]
    NotRunning,
}

#[derive(Default)]
struct Topology {
    nodes: HashSet<Address>,
    edges: HashMap<(Address, Address), NetworkEdge>,
}

pub(crate) struct SimInner {
    topology: Mutex<Topology>,
    rng: Mutex<StdRng>,
    running: Mutex<bool>,
    /// Bumped on every `stop()`/`reset()`; pending timed operations watch it and abandon.
    epoch: watch::Sender<u64>,
    pub(crate) listeners: Arc<listener::ListenerRegistry>,
    pub(crate) connections: Arc<ConnectionRegistry>,
    pool: ConnectionPool,
}

/// The deterministic network simulator.
///
/// Cheap to clone; all clones share the same topology and registries.
#[derive(Clone)]
pub struct NetworkSimulator {
    inner: Arc<SimInner>,
}

impl Default for NetworkSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkSimulator {
    /// Create a new simulator with an arbitrary seed. Call `seed_rng` for reproducible runs.
    pub fn new() -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            inner: Arc::new(SimInner {
                topology: Mutex::new(Topology::default()),
                rng: Mutex::new(StdRng::from_entropy()),
                running: Mutex::new(false),
                epoch,
                listeners: Arc::new(listener::ListenerRegistry::new()),
                connections: Arc::new(ConnectionRegistry::new()),
                pool: ConnectionPool::new(),
            }),
        }
    }

    /// Re-seed the simulator's RNG; every subsequent reliability draw follows from the seed.
    pub fn seed_rng(&self, seed: u64) {
        *self.inner.rng.lock().unwrap() = StdRng::seed_from_u64(seed);
    }

    /// Enable the simulation.
    pub fn start(&self) {
        *self.inner.running.lock().unwrap() = true;
    }

    /// Disable the simulation.
    ///
    /// Scheduled deliveries are cancelled, pending connects are failed with `SimError::Timeout`,
    /// and every listener is closed (releasing its port).
    pub fn stop(&self) {
        *self.inner.running.lock().unwrap() = false;
        let _ = self.inner.epoch.send_modify(|epoch| *epoch += 1);
        self.inner.listeners.close_all();
        self.inner.connections.close_all();
        self.inner.pool.clear();
    }

    /// Stop the simulation and additionally clear all topology state.
    pub fn reset(&self) {
        self.stop();
        let mut topology = self.inner.topology.lock().unwrap();
        topology.nodes.clear();
        topology.edges.clear();
    }

    /// Check if the simulation is running.
    pub fn is_running(&self) -> bool {
        *self.inner.running.lock().unwrap()
    }

    /// Add a node to the topology. Idempotent.
    pub fn add_node(&self, address: impl Into<Address>) {
        let mut topology = self.inner.topology.lock().unwrap();
        topology.nodes.insert(address.into());
    }

    /// Remove a node from the topology.
    ///
    /// Removal cascades: all incident edges are removed, and every listener and connection at
    /// the address is closed.
    pub fn remove_node(&self, address: &str) {
        {
            let mut topology = self.inner.topology.lock().unwrap();
            topology.nodes.remove(address);
            topology.edges.retain(|(from, to), _| from != address && to != address);
        }
        self.inner.listeners.close_at(address);
        self.inner.connections.close_at(address);
    }

    /// Check if the given node exists in the topology.
    pub fn has_node(&self, address: &str) -> bool {
        self.inner.topology.lock().unwrap().nodes.contains(address)
    }

    /// Add a directed edge to the topology, creating its endpoints if they do not exist.
    ///
    /// Re-adding an existing edge overwrites its properties: last writer wins.
    pub fn add_edge(&self, from: impl Into<Address>, to: impl Into<Address>, edge: NetworkEdge) {
        let (from, to) = (from.into(), to.into());
        let mut topology = self.inner.topology.lock().unwrap();
        topology.nodes.insert(from.clone());
        topology.nodes.insert(to.clone());
        topology.edges.insert((from, to), edge);
    }

    /// Remove a directed edge from the topology.
    pub fn remove_edge(&self, from: &str, to: &str) {
        let mut topology = self.inner.topology.lock().unwrap();
        topology.edges.remove(&(from.to_string(), to.to_string()));
    }

    /// Check if the given directed edge exists.
    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.inner.topology.lock().unwrap().edges.contains_key(&(from.to_string(), to.to_string()))
    }

    /// Get the properties of the given directed edge.
    pub fn get_edge(&self, from: &str, to: &str) -> Option<NetworkEdge> {
        self.inner.topology.lock().unwrap().edges.get(&(from.to_string(), to.to_string())).copied()
    }

    /// Draw from the RNG against the given edge's reliability.
    ///
    /// Returns false — the message is to be dropped — when the draw exceeds the edge's
    /// reliability, or when the edge does not exist.
    pub fn check_reliability(&self, from: &str, to: &str) -> bool {
        let reliability = match self.get_edge(from, to) {
            Some(edge) => edge.reliability(),
            None => return false,
        };
        let draw: f64 = self.inner.rng.lock().unwrap().gen();
        draw < reliability
    }

    /// Create a handle for the given address, registering it in the topology.
    ///
    /// Handles for the same address are interchangeable: they bind against the same listener
    /// registry and route through the same edges.
    pub fn create_node(&self, address: impl Into<Address>) -> SimNode {
        let address = address.into();
        self.add_node(address.clone());
        SimNode::new(address, self.inner.clone())
    }

    /// Get a handle to the simulator's connection pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// Get a handle to the simulator's connection registry.
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.inner.connections
    }

    /// Check whether the given port is free at the given address.
    pub fn is_port_available(&self, address: &str, port: u16) -> bool {
        !self.inner.listeners.is_bound(&Endpoint::new(address, port))
    }
}

impl SimInner {
    pub(crate) fn edge(&self, from: &str, to: &str) -> Option<NetworkEdge> {
        self.topology.lock().unwrap().edges.get(&(from.to_string(), to.to_string())).copied()
    }

    pub(crate) fn is_running(&self) -> bool {
        *self.running.lock().unwrap()
    }

    pub(crate) fn draw(&self) -> f64 {
        self.rng.lock().unwrap().gen()
    }

    pub(crate) fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }
}
