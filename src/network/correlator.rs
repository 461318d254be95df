//! Request Correlator
//!
//! Turns the one-way event stream into request/response: each outbound
//! command gets a fresh [`RequestId`] and a oneshot completion, resolved by
//! the inbound result that echoes the id.
//!
//! Every wait has a deadline. A waiter that times out or is dropped removes
//! its own entry and leaves the id behind as abandoned, so a late result can
//! still be recognised as ours and applied exactly once.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use crate::network::protocol::{InteractionResult, RequestId};

type PendingTx = oneshot::Sender<InteractionResult>;

/// Abandoned ids remembered for late results.
const ABANDONED_CAPACITY: usize = 64;

#[derive(Default)]
struct Table {
    pending: HashMap<RequestId, PendingTx>,
    abandoned: VecDeque<RequestId>,
}

impl Table {
    fn abandon(&mut self, id: RequestId) {
        if self.abandoned.len() == ABANDONED_CAPACITY {
            self.abandoned.pop_front();
        }
        self.abandoned.push_back(id);
    }

    fn take_abandoned(&mut self, id: &RequestId) -> bool {
        match self.abandoned.iter().position(|a| a == id) {
            Some(at) => self.abandoned.remove(at).is_some(),
            None => false,
        }
    }
}

/// What [`RequestCorrelator::resolve`] did with a result.
#[derive(Debug)]
pub enum Resolution {
    /// Handed to the waiting caller.
    Delivered,
    /// Our request, but nobody waits for it any more. Handed back once.
    Abandoned(InteractionResult),
    /// Not a request we know of, or already resolved.
    Unknown,
}

/// Table of in-flight requests.
#[derive(Clone, Default)]
pub struct RequestCorrelator {
    table: Arc<Mutex<Table>>,
}

impl RequestCorrelator {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new request under a fresh id.
    pub fn register(&self) -> PendingRequest {
        let id = RequestId::generate();
        let (tx, rx) = oneshot::channel();
        self.table().pending.insert(id.clone(), tx);

        PendingRequest {
            id,
            rx,
            correlator: self.clone(),
        }
    }

    /// Complete the request `id`.
    pub fn resolve(&self, id: &RequestId, result: InteractionResult) -> Resolution {
        let mut table = self.table();
        let Some(tx) = table.pending.remove(id) else {
            if table.take_abandoned(id) {
                debug!(request_id = %id, "Result for abandoned request");
                return Resolution::Abandoned(result);
            }
            debug!(request_id = %id, "No pending request for result");
            return Resolution::Unknown;
        };
        match tx.send(result) {
            Ok(()) => Resolution::Delivered,
            Err(result) => Resolution::Abandoned(result),
        }
    }

    /// Drop the entry for `id` without completing it.
    pub fn cancel(&self, id: &RequestId) -> bool {
        let mut table = self.table();
        if table.pending.remove(id).is_none() {
            return false;
        }
        table.abandon(id.clone());
        true
    }

    /// Number of requests still waiting.
    pub fn pending_count(&self) -> usize {
        self.table().pending.len()
    }
}

/// Caller's side of a registered request.
pub struct PendingRequest {
    id: RequestId,
    rx: oneshot::Receiver<InteractionResult>,
    correlator: RequestCorrelator,
}

impl PendingRequest {
    /// Correlation id to put on the outbound command.
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the result, at most `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<InteractionResult, CorrelatorError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(CorrelatorError::Cancelled(self.id.clone())),
            Err(_) => {
                // Resolved between the deadline and here.
                if !self.correlator.cancel(&self.id) {
                    if let Ok(result) = self.rx.try_recv() {
                        return Ok(result);
                    }
                }
                Err(CorrelatorError::TimedOut {
                    id: self.id.clone(),
                    timeout,
                })
            }
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.correlator.cancel(&self.id);
    }
}

/// Reasons a correlated request produced no result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelatorError {
    /// No result within the deadline.
    #[error("Request {id} timed out after {timeout:?}")]
    TimedOut {
        /// Request that timed out.
        id: RequestId,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// Entry removed before a result arrived.
    #[error("Request {0} was cancelled")]
    Cancelled(RequestId),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::player::PlayerId;
    use crate::network::protocol::{InteractionInfo, InteractionKind};

    fn hide_success() -> InteractionResult {
        InteractionResult {
            kind: InteractionKind::HideSuccess,
            info: InteractionInfo {
                player_id: PlayerId::new("me"),
                object_id: Some("bush-1".to_string()),
                found_player_id: None,
                catch_count: 0,
            },
        }
    }

    #[tokio::test]
    async fn test_resolve_completes_waiter() {
        let correlator = RequestCorrelator::new();
        let pending = correlator.register();
        let id = pending.id().clone();
        assert_eq!(correlator.pending_count(), 1);

        assert!(matches!(correlator.resolve(&id, hide_success()), Resolution::Delivered));
        let result = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.kind, InteractionKind::HideSuccess);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_resolves_at_most_once() {
        let correlator = RequestCorrelator::new();
        let pending = correlator.register();
        let id = pending.id().clone();

        assert!(matches!(correlator.resolve(&id, hide_success()), Resolution::Delivered));
        assert!(matches!(correlator.resolve(&id, hide_success()), Resolution::Unknown));
        assert!(pending.wait(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_timeout_removes_entry() {
        let correlator = RequestCorrelator::new();
        let pending = correlator.register();
        let id = pending.id().clone();

        let err = pending.wait(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, CorrelatorError::TimedOut { id: ref timed_out, .. } if *timed_out == id));
        assert_eq!(correlator.pending_count(), 0);

        // The late result comes back once, then the id is forgotten.
        match correlator.resolve(&id, hide_success()) {
            Resolution::Abandoned(result) => assert_eq!(result, hide_success()),
            other => panic!("Expected abandoned, got {:?}", other),
        }
        assert!(matches!(correlator.resolve(&id, hide_success()), Resolution::Unknown));
    }

    #[test]
    fn test_unregistered_id_is_unknown() {
        let correlator = RequestCorrelator::new();
        let resolution = correlator.resolve(&RequestId::from("someone-else"), hide_success());
        assert!(matches!(resolution, Resolution::Unknown));
    }

    #[test]
    fn test_abandoned_ids_are_bounded() {
        let correlator = RequestCorrelator::new();
        let first = correlator.register();
        let first_id = first.id().clone();
        drop(first);
        for _ in 0..ABANDONED_CAPACITY {
            drop(correlator.register());
        }

        assert!(matches!(correlator.resolve(&first_id, hide_success()), Resolution::Unknown));
        assert_eq!(correlator.table().abandoned.len(), ABANDONED_CAPACITY);
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let correlator = RequestCorrelator::new();
        let pending = correlator.register();
        let id = pending.id().clone();

        assert!(correlator.cancel(&id));
        let err = pending.wait(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, CorrelatorError::Cancelled(id));
    }

    #[test]
    fn test_dropped_request_is_removed() {
        let correlator = RequestCorrelator::new();
        let a = correlator.register();
        let b = correlator.register();
        assert_ne!(a.id(), b.id());
        assert_eq!(correlator.pending_count(), 2);

        drop(a);
        assert_eq!(correlator.pending_count(), 1);
    }
}
