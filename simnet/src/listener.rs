//! Listener registry & the listener handle.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::Endpoint;
use crate::SimError;

/// A datagram delivered to a listener.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    /// The endpoint the datagram was sent from.
    pub from: Endpoint,
    /// The endpoint the datagram was addressed to.
    pub to: Endpoint,
    /// The opaque payload.
    pub payload: Vec<u8>,
}

struct Inbox {
    /// Distinguishes successive listeners on the same port, so a stale handle closing late
    /// cannot release a port rebound in the meantime.
    listener_id: u64,
    tx: mpsc::UnboundedSender<Datagram>,
}

pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    inboxes: Mutex<HashMap<Endpoint, Inbox>>,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            inboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Bind the endpoint, failing if the port is already held. Ports are exclusive.
    pub(crate) fn bind(self: &Arc<Self>, endpoint: Endpoint) -> Result<Listener, SimError> {
        let mut inboxes = self.inboxes.lock().unwrap();
        if inboxes.contains_key(&endpoint) {
            return Err(SimError::PortInUse(endpoint.port));
        }
        let listener_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        inboxes.insert(endpoint.clone(), Inbox { listener_id, tx });
        Ok(Listener {
            endpoint,
            listener_id,
            rx,
            registry: self.clone(),
        })
    }

    pub(crate) fn is_bound(&self, endpoint: &Endpoint) -> bool {
        self.inboxes.lock().unwrap().contains_key(endpoint)
    }

    fn is_bound_by(&self, endpoint: &Endpoint, listener_id: u64) -> bool {
        self.inboxes
            .lock()
            .unwrap()
            .get(endpoint)
            .map(|inbox| inbox.listener_id == listener_id)
            .unwrap_or(false)
    }

    /// Deliver a datagram to the listener at the target endpoint, if one is bound.
    pub(crate) fn deliver(&self, datagram: Datagram) {
        let inboxes = self.inboxes.lock().unwrap();
        if let Some(inbox) = inboxes.get(&datagram.to) {
            // A receiver dropped without closing raced this delivery; the datagram is lost,
            // exactly as it would be on a real network.
            let _ = inbox.tx.send(datagram);
        }
    }

    /// Release the port held by the given listener. The release is immediate: a subsequent bind
    /// on the same port succeeds.
    fn close(&self, endpoint: &Endpoint, listener_id: u64) {
        let mut inboxes = self.inboxes.lock().unwrap();
        if let Some(inbox) = inboxes.get(endpoint) {
            if inbox.listener_id == listener_id {
                inboxes.remove(endpoint);
            }
        }
    }

    /// Close every listener at the given address.
    pub(crate) fn close_at(&self, address: &str) {
        self.inboxes.lock().unwrap().retain(|endpoint, _| endpoint.address != address);
    }

    /// Close every listener.
    pub(crate) fn close_all(&self) {
        self.inboxes.lock().unwrap().clear();
    }
}

/// A bound listener receiving datagrams addressed to its endpoint.
///
/// Dropping the listener releases its port immediately.
pub struct Listener {
    endpoint: Endpoint,
    listener_id: u64,
    rx: mpsc::UnboundedReceiver<Datagram>,
    registry: Arc<ListenerRegistry>,
}

impl Listener {
    /// The endpoint this listener is bound to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Check if this listener still holds its port.
    ///
    /// A simulator `stop()` or a topology removal of this listener's node closes listeners out
    /// from under their handles.
    pub fn is_listening(&self) -> bool {
        self.registry.is_bound_by(&self.endpoint, self.listener_id)
    }

    /// Receive the next datagram.
    ///
    /// Returns `None` once the listener has been closed and all delivered datagrams drained.
    pub async fn recv(&mut self) -> Option<Datagram> {
        self.rx.recv().await
    }

    /// Close the listener, releasing its port immediately.
    pub fn close(&self) {
        self.registry.close(&self.endpoint, self.listener_id);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.registry.close(&self.endpoint, self.listener_id);
    }
}
