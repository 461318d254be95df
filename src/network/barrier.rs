//! Initialization Barrier
//!
//! One-time startup gate scoped to a session. Until the bootstrap message
//! has been applied, every other inbound message is stalled here in arrival
//! order; opening the gate hands them back for replay. Once open the gate
//! lets everything through.
//!
//! The queue is bounded. When it is full the incoming message is refused
//! and handed back; what is already queued keeps its order.

use std::collections::VecDeque;
use tokio::sync::watch;

use crate::config::DEFAULT_MAX_STALLED_MESSAGES;
use crate::network::protocol::InboundMessage;

/// Outcome of offering a message to the barrier.
#[derive(Debug)]
pub enum Admission {
    /// Process now.
    Deliver(InboundMessage),
    /// Queued until the session is initialized.
    Stalled,
    /// Queue full; the message was not kept.
    Overflow(InboundMessage),
}

/// Per-session initialization gate.
#[derive(Debug)]
pub struct InitBarrier {
    stalled: VecDeque<InboundMessage>,
    capacity: usize,
    initialized: watch::Sender<bool>,
}

impl InitBarrier {
    /// Closed barrier with the default queue capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_STALLED_MESSAGES)
    }

    /// Closed barrier holding at most `capacity` messages.
    pub fn with_capacity(capacity: usize) -> Self {
        let (initialized, _) = watch::channel(false);
        Self {
            stalled: VecDeque::new(),
            capacity,
            initialized,
        }
    }

    /// Queue capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Has the bootstrap been applied?
    pub fn is_open(&self) -> bool {
        *self.initialized.borrow()
    }

    /// Messages waiting for the bootstrap.
    pub fn stalled_len(&self) -> usize {
        self.stalled.len()
    }

    /// Offer a message. The bootstrap always passes.
    pub fn admit(&mut self, message: InboundMessage) -> Admission {
        if self.is_open() || message.is_bootstrap() {
            Admission::Deliver(message)
        } else if self.stalled.len() >= self.capacity {
            Admission::Overflow(message)
        } else {
            self.stalled.push_back(message);
            Admission::Stalled
        }
    }

    /// Open the gate and take the stalled messages, oldest first.
    ///
    /// Opening twice is harmless; the second call returns nothing.
    pub fn open(&mut self) -> Vec<InboundMessage> {
        self.initialized.send_replace(true);
        self.stalled.drain(..).collect()
    }

    /// Watch the initialized flag.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.initialized.subscribe()
    }
}

impl Default for InitBarrier {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait until the flag watched by `rx` turns true.
///
/// Returns false if the barrier was dropped while still closed.
pub async fn wait_open(mut rx: watch::Receiver<bool>) -> bool {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return *rx.borrow();
        }
    }
    true
}
