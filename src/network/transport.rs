//! Transport Seam
//!
//! The session only needs two primitives from the connection: subscribe to
//! a destination and publish a body to one. [`Transport`] is that seam;
//! [`StompTransport`](crate::network::stomp::StompTransport) is the real
//! implementation and tests use an in-memory one.
//!
//! The connection may not exist yet when a session is created. The owner
//! keeps a [`TransportSlot`] and fills it once connected; sessions hold a
//! [`TransportHandle`] and are woken when the slot is filled.

use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Stream of raw message bodies from one subscribed destination.
pub type Subscription = mpsc::Receiver<String>;

/// Publish/subscribe primitives over a persistent connection.
pub trait Transport: Send + Sync {
    /// Start receiving messages published to `destination`.
    fn subscribe(&self, destination: &str) -> Result<Subscription, TransportError>;

    /// Send `body` to `destination`. Fire-and-forget.
    fn publish(&self, destination: &str, body: String) -> Result<(), TransportError>;
}

type SharedTransport = Arc<dyn Transport>;

/// Owner side of the readiness notification.
pub struct TransportSlot {
    tx: watch::Sender<Option<SharedTransport>>,
}

impl TransportSlot {
    /// Empty slot.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Publish a connected transport to every handle.
    pub fn fill(&self, transport: SharedTransport) {
        self.tx.send_replace(Some(transport));
    }

    /// Connection lost; handles see no transport until the next `fill`.
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    /// Is a transport available right now?
    pub fn is_filled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Reader side for a session.
    pub fn handle(&self) -> TransportHandle {
        TransportHandle { rx: self.tx.subscribe() }
    }
}

impl Default for TransportSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransportSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSlot").field("filled", &self.is_filled()).finish()
    }
}

/// Session side of the readiness notification.
#[derive(Clone)]
pub struct TransportHandle {
    rx: watch::Receiver<Option<SharedTransport>>,
}

impl TransportHandle {
    /// Handle that is ready immediately (tests, pre-connected transports).
    pub fn ready_with(transport: SharedTransport) -> Self {
        let (_tx, rx) = watch::channel(Some(transport));
        Self { rx }
    }

    /// Transport if connected, without waiting.
    pub fn current(&self) -> Option<SharedTransport> {
        self.rx.borrow().clone()
    }

    /// Like [`current`](Self::current), but an error when not connected.
    pub fn get(&self) -> Result<SharedTransport, TransportError> {
        self.current().ok_or(TransportError::NotConnected)
    }

    /// Wait until a transport is available.
    pub async fn ready(&mut self) -> Result<SharedTransport, TransportError> {
        loop {
            if let Some(transport) = self.rx.borrow_and_update().clone() {
                return Ok(transport);
            }
            if self.rx.changed().await.is_err() {
                // Slot dropped; a last fill may still be visible.
                return self.rx.borrow().clone().ok_or(TransportError::Closed);
            }
        }
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("connected", &self.rx.borrow().is_some())
            .finish()
    }
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No connection yet.
    #[error("Transport not connected")]
    NotConnected,

    /// Connection gone and no longer coming back.
    #[error("Transport closed")]
    Closed,

    /// Subscription refused.
    #[error("Subscribe to {destination} failed: {reason}")]
    Subscribe {
        /// Destination requested.
        destination: String,
        /// Why.
        reason: String,
    },

    /// Publish refused.
    #[error("Publish to {destination} failed: {reason}")]
    Publish {
        /// Destination requested.
        destination: String,
        /// Why.
        reason: String,
    },
}
