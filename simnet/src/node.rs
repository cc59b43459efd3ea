//! The per-address node handle.

use std::sync::Arc;

use tokio::time::sleep;
use tokio::time::timeout;
use tokio::time::Duration;

use crate::Connection;
use crate::Datagram;
use crate::Endpoint;
use crate::Listener;
use crate::SimError;
use crate::SimInner;

/// A handle to a virtual node: the entry point for binding listeners, initiating connections,
/// and sending datagrams from this node's address.
#[derive(Clone)]
pub struct SimNode {
    address: String,
    sim: Arc<SimInner>,
}

impl SimNode {
    pub(crate) fn new(address: String, sim: Arc<SimInner>) -> Self {
        Self { address, sim }
    }

    /// The address of this node.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Bind a listener on the given port. Ports are exclusive per address.
    pub fn bind(&self, port: u16) -> Result<Listener, SimError> {
        self.sim.listeners.bind(Endpoint::new(self.address.clone(), port))
    }

    /// Send a datagram from `from_port` on this node to the target endpoint.
    ///
    /// The send resolves as soon as the message is handed to the network: a message lost to an
    /// unreliable edge still reports success, matching real lossy networks. Only a missing edge
    /// or a missing listener fails the send with `Unreachable`.
    pub fn send(&self, from_port: u16, to: Endpoint, payload: Vec<u8>) -> Result<(), SimError> {
        if !self.sim.is_running() {
            return Err(SimError::NotRunning);
        }
        let edge = match self.sim.edge(&self.address, &to.address) {
            Some(edge) => edge,
            None => return Err(SimError::Unreachable),
        };
        if !self.sim.listeners.is_bound(&to) {
            return Err(SimError::Unreachable);
        }

        // The reliability draw happens at send time, in call order, so a seeded run always
        // drops the same messages.
        if self.sim.draw() >= edge.reliability() {
            tracing::trace!(from=%self.address, to=%to, "datagram dropped by reliability draw");
            return Ok(());
        }

        let datagram = Datagram {
            from: Endpoint::new(self.address.clone(), from_port),
            to,
            payload,
        };
        let sim = self.sim.clone();
        let mut epoch = self.sim.subscribe_epoch();
        let latency = edge.latency();
        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(latency) => sim.listeners.deliver(datagram),
                // A stop()/reset() drains scheduled deliveries by cancelling them.
                _ = epoch.changed() => (),
            }
        });
        Ok(())
    }

    /// Establish a connection to the target endpoint within the given timeout.
    ///
    /// The connect honors the same edge checks as a send. If the target is unreachable at the
    /// moment of connect the attempt fails immediately; if the (latency-delayed) handshake does
    /// not complete within `timeout`, or the simulator is stopped while the attempt is pending,
    /// the attempt fails with `Timeout`.
    pub async fn connect(&self, to_address: &str, to_port: u16, deadline: Duration) -> Result<Connection, SimError> {
        if !self.sim.is_running() {
            return Err(SimError::NotRunning);
        }
        let to = Endpoint::new(to_address, to_port);
        let edge = match self.sim.edge(&self.address, to_address) {
            Some(edge) => edge,
            None => return Err(SimError::Unreachable),
        };
        if !self.sim.listeners.is_bound(&to) {
            return Err(SimError::Unreachable);
        }

        let local = Endpoint::new(self.address.clone(), 0);
        let connection = self.sim.connections.register(local, to);

        // An unreliable edge can swallow the handshake; the attempt then runs out its deadline.
        let handshake_delivered = self.sim.draw() < edge.reliability();
        let mut epoch = self.sim.subscribe_epoch();

        let handshake = async {
            if !handshake_delivered {
                // Nothing is coming back; hold until the deadline cancels us.
                std::future::pending::<()>().await;
            }
            sleep(edge.latency()).await;
        };

        let res = timeout(deadline, async {
            tokio::select! {
                _ = handshake => Ok(()),
                _ = epoch.changed() => Err(SimError::Timeout),
            }
        })
        .await;

        match res {
            Ok(Ok(())) => {
                connection.mark_connected();
                Ok(connection)
            }
            Ok(Err(err)) => {
                connection.mark_error();
                self.sim.connections.cleanup();
                Err(err)
            }
            Err(_elapsed) => {
                connection.mark_error();
                self.sim.connections.cleanup();
                Err(SimError::Timeout)
            }
        }
    }
}
