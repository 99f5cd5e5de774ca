//! # Request Manager
//!
//! Correlates replies with the callers waiting on `AddressRouter::request`.
//!
//! Every request gets a fresh id and a oneshot channel. The sender half stays in
//! the pending table until the request is resolved, so whoever removes the entry
//! first (a reply, an explicit failure, the timeout, or `cancel_waiting_requests`)
//! decides the outcome. Later attempts find nothing and become no-ops.

use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use super::router::{RouterError, RouterResult};

/// Type alias for request correlation identifiers
pub type RequestId = String;

pub(crate) type ReplyOutcome = RouterResult<Value>;

/// A request that has been dispatched but not yet resolved.
struct PendingRequest {
    /// Channel for delivering the outcome back to the requester
    sender: oneshot::Sender<ReplyOutcome>,
    /// Target address, kept for logging and cancellation errors
    address: String,
}

#[derive(Default)]
pub struct RequestManager {
    pending_requests: DashMap<RequestId, PendingRequest>,
}

impl RequestManager {
    pub fn new() -> Self {
        Default::default()
    }

    /// Allocates a request id and registers it as pending.
    pub fn register(&self, address: &str) -> (RequestId, oneshot::Receiver<ReplyOutcome>) {
        let (tx, rx) = oneshot::channel();
        let request_id = Uuid::new_v4().to_string();
        self.pending_requests.insert(
            request_id.clone(),
            PendingRequest {
                sender: tx,
                address: address.to_string(),
            },
        );
        trace!("Registered request {} for {}", request_id, address);
        (request_id, rx)
    }

    /// Resolves a pending request. Returns `false` when the request was already
    /// resolved, timed out or cancelled.
    pub fn complete(&self, request_id: &str, outcome: ReplyOutcome) -> bool {
        match self.pending_requests.remove(request_id) {
            Some((_, pending)) => {
                trace!("Completing request {} for {}", request_id, pending.address);
                // the waiting side may have been dropped; the request is resolved either way
                let _ = pending.sender.send(outcome);
                true
            }
            None => {
                debug!("Ignoring resolution of settled request {}", request_id);
                false
            }
        }
    }

    /// Drops a pending request without resolving it.
    pub fn discard(&self, request_id: &str) {
        self.pending_requests.remove(request_id);
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending_requests.contains_key(request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending_requests.len()
    }

    /// Waits for the outcome of `request_id` until `timeout` elapses.
    ///
    /// Dropping the returned future removes the pending entry, so an abandoned
    /// request never leaks.
    #[instrument(skip(self, rx))]
    pub async fn await_reply(
        &self,
        request_id: RequestId,
        address: &str,
        timeout: Duration,
        mut rx: oneshot::Receiver<ReplyOutcome>,
    ) -> ReplyOutcome {
        let _guard = PendingGuard {
            manager: self,
            request_id: &request_id,
        };
        // far-future timeouts are clamped by tokio
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        tokio::select! {
            result = &mut rx => match result {
                Ok(outcome) => outcome,
                // sender is only dropped after the entry is removed, which always sends first
                Err(_) => Err(RouterError::RouterClosed),
            },
            _ = &mut sleep => {
                if self.pending_requests.remove(&request_id).is_none() {
                    // a resolution raced the deadline; it has already been sent
                    if let Ok(outcome) = rx.try_recv() {
                        return outcome;
                    }
                }
                debug!("Request {} to {} timed out", request_id, address);
                Err(RouterError::Timeout {
                    address: address.to_string(),
                    request_id: request_id.clone(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Fails every pending request. Returns how many were cancelled.
    pub fn cancel_waiting_requests(&self, failure_message: &str) -> usize {
        let ids: Vec<RequestId> = self
            .pending_requests
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut cancelled = 0;
        for request_id in ids {
            if let Some((_, pending)) = self.pending_requests.remove(&request_id) {
                debug!(
                    "Cancelling request {} to {}: {}",
                    request_id, pending.address, failure_message
                );
                let _ = pending.sender.send(Err(RouterError::RouterClosed));
                cancelled += 1;
            }
        }
        cancelled
    }
}

struct PendingGuard<'a> {
    manager: &'a RequestManager,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.manager.discard(self.request_id);
    }
}
