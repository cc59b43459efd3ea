//! Connection lifecycle tracking.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use crate::Endpoint;

/// The lifecycle state of a simulated connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closing,
    Closed,
    Error,
}

struct ConnectionEntry {
    local: Endpoint,
    peer: Endpoint,
    state: ConnectionState,
}

/// The registry tracking the state of every connection created through the simulator.
///
/// Entries for closed or errored connections are removed by `cleanup`, so long-running tests do
/// not accumulate stale tracking state.
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register(self: &Arc<Self>, local: Endpoint, peer: Endpoint) -> Connection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap().insert(id, ConnectionEntry {
            local: local.clone(),
            peer: peer.clone(),
            state: ConnectionState::Connecting,
        });
        Connection {
            id,
            local,
            peer,
            registry: self.clone(),
        }
    }

    pub(crate) fn set_state(&self, id: u64, state: ConnectionState) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&id) {
            entry.state = state;
        }
    }

    pub(crate) fn state_of(&self, id: u64) -> ConnectionState {
        self.entries.lock().unwrap().get(&id).map(|entry| entry.state).unwrap_or(ConnectionState::Closed)
    }

    /// Close every connection with an end at the given address.
    pub(crate) fn close_at(&self, address: &str) {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.values_mut() {
            if entry.local.address == address || entry.peer.address == address {
                entry.state = ConnectionState::Closed;
            }
        }
    }

    /// Close every tracked connection.
    pub(crate) fn close_all(&self) {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.values_mut() {
            entry.state = ConnectionState::Closed;
        }
    }

    /// The number of tracked connections, including closed ones awaiting cleanup.
    pub fn tracked(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// The number of tracked connections currently in the given state.
    pub fn count_in_state(&self, state: ConnectionState) -> usize {
        self.entries.lock().unwrap().values().filter(|entry| entry.state == state).count()
    }

    /// Drop tracking entries for connections which are closed or errored.
    pub fn cleanup(&self) {
        self.entries
            .lock()
            .unwrap()
            .retain(|_, entry| !matches!(entry.state, ConnectionState::Closed | ConnectionState::Error));
    }
}

/// A handle to a simulated connection.
///
/// Clones share lifecycle state through the registry.
#[derive(Clone)]
pub struct Connection {
    id: u64,
    local: Endpoint,
    peer: Endpoint,
    registry: Arc<ConnectionRegistry>,
}

impl Connection {
    /// The registry id of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The local endpoint of this connection.
    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    /// The remote endpoint of this connection.
    pub fn peer(&self) -> &Endpoint {
        &self.peer
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.registry.state_of(self.id)
    }

    /// Check if this connection is open for traffic.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub(crate) fn mark_connected(&self) {
        self.registry.set_state(self.id, ConnectionState::Connected);
    }

    /// Mark the connection as failed; `cleanup` on the registry removes its tracking entry.
    pub fn mark_error(&self) {
        self.registry.set_state(self.id, ConnectionState::Error);
    }

    /// Close the connection.
    pub fn close(&self) {
        self.registry.set_state(self.id, ConnectionState::Closing);
        self.registry.set_state(self.id, ConnectionState::Closed);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}
