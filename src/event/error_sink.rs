//! Where isolated handler failures go.
//!
//! A failing handler never aborts sibling deliveries; the router describes the
//! failure as a [`DeliveryFailure`] and hands it to the configured [`ErrorSink`].

use chrono::{DateTime, Utc};
use strum::Display;
use tokio::sync::broadcast;
use tracing::warn;

use super::message::DeliveryKind;
use super::router::{RouterError, RouterResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// The handler returned `Err`.
    Error,
    /// The handler panicked.
    Panic,
    /// The registration's queue was full, the message was dropped.
    QueueFull,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryFailure {
    pub address: String,
    pub registration_id: String,
    pub delivery: DeliveryKind,
    pub kind: FailureKind,
    pub cause: String,
    pub occurred_at: DateTime<Utc>,
}

impl DeliveryFailure {
    pub fn new(
        address: &str,
        registration_id: &str,
        delivery: DeliveryKind,
        kind: FailureKind,
        cause: impl Into<String>,
    ) -> Self {
        Self {
            address: address.to_string(),
            registration_id: registration_id.to_string(),
            delivery,
            kind,
            cause: cause.into(),
            occurred_at: Utc::now(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait ErrorSink: Send + Sync {
    fn report(&self, failure: DeliveryFailure);
}

/// Default sink: logs every failure.
#[derive(Debug, Default, Clone)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, failure: DeliveryFailure) {
        warn!(
            address = %failure.address,
            registration_id = %failure.registration_id,
            delivery = %failure.delivery,
            kind = %failure.kind,
            "Delivery failed: {}",
            failure.cause
        );
    }
}

/// Fans failures out on a broadcast channel so several observers can follow them.
pub struct ChannelErrorSink {
    sender: broadcast::Sender<DeliveryFailure>,
    /// Internal receiver to keep the channel open without subscribers
    _internal_receiver: broadcast::Receiver<DeliveryFailure>,
}

impl ChannelErrorSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            _internal_receiver: receiver,
        }
    }

    pub fn subscribe(&self) -> ErrorReceiver {
        ErrorReceiver::new(self.sender.subscribe())
    }

    pub fn subscribers_size(&self) -> usize {
        // the internal receiver is not an observer
        self.sender.receiver_count().saturating_sub(1)
    }
}

impl ErrorSink for ChannelErrorSink {
    fn report(&self, failure: DeliveryFailure) {
        TracingErrorSink.report(failure.clone());
        // cannot fail while the internal receiver is alive
        let _ = self.sender.send(failure);
    }
}

pub struct ErrorReceiver {
    receiver: broadcast::Receiver<DeliveryFailure>,
}

impl ErrorReceiver {
    fn new(receiver: broadcast::Receiver<DeliveryFailure>) -> Self {
        Self { receiver }
    }

    /// Receives the next failure. A lagged receiver is resubscribed and the
    /// number of skipped failures is returned as an error.
    pub async fn recv(&mut self) -> RouterResult<DeliveryFailure> {
        match self.receiver.recv().await {
            Ok(failure) => Ok(failure),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                self.receiver = self.receiver.resubscribe();
                Err(RouterError::Lagged { count: n })
            }
            Err(e) => Err(RouterError::ReceiveFailed {
                message: e.to_string(),
            }),
        }
    }
}
