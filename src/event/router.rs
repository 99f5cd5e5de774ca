//! # Address Router
//!
//! Keeps the address -> registrations table and implements the three delivery
//! semantics:
//!
//! - **publish**: every registration at the address gets the message
//! - **send**: one registration, picked round-robin
//! - **request**: a send carrying a [`ReplyChannel`]; the caller awaits the reply
//!
//! ## Dispatch
//!
//! Each registration owns a bounded queue drained by its own worker task, so a
//! dispatch never waits on a handler and a slow handler only delays its own
//! messages. Every invocation is spawned separately, which turns a panic into a
//! reported failure instead of a dead worker.
//!
//! A dispatch reads the registration list once, under the table's shard lock,
//! so concurrent subscribe/unsubscribe calls are seen either entirely or not at all.

use std::{
    any::Any,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
    task::{Context, Poll},
};

use dashmap::DashMap;
use futures::Stream;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use super::error_sink::{DeliveryFailure, ErrorSink, FailureKind, TracingErrorSink};
use super::handler::{BoxedHandler, MessageHandler};
use super::message::{DeliveryKind, DeliveryOptions, Message, ReplyChannel};
use super::request_manager::RequestManager;
use crate::config::RouterConfig;

pub type RegistrationId = String;

type HandlerSlot = Arc<RwLock<BoxedHandler>>;

/// Table-side view of a registration: where to push its messages.
struct Registration {
    id: RegistrationId,
    sender: mpsc::Sender<Message>,
}

#[derive(Default)]
struct AddressEntry {
    registrations: Vec<Arc<Registration>>,
    /// Round-robin position for send/request
    cursor: AtomicUsize,
}

struct RouterInner {
    table: DashMap<String, AddressEntry>,
    requests: Arc<RequestManager>,
    error_sink: Arc<dyn ErrorSink>,
    config: RouterConfig,
    closed: AtomicBool,
}

/// # AddressRouter
///
/// In-process message router. Cloning is cheap and every clone routes through
/// the same table.
///
/// Registering handlers spawns worker tasks, so `subscribe` and
/// `subscribe_stream` must be called from within a Tokio runtime.
///
/// ## Example
///
/// ```rust,no_run
/// use busline::config::RouterConfig;
/// use busline::event::{sync_handler, AddressRouter};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let router = AddressRouter::new(RouterConfig::default());
/// router.subscribe(
///     "example.address",
///     sync_handler(|message| {
///         message.reply(format!("{} is processed", message.body()));
///         Ok(())
///     }),
/// );
///
/// router.publish("example.address", "publish to all subscribers")?;
/// router.send("example.address", "send to a single subscriber")?;
/// let reply = router.request("example.address", "request a reply").await?;
/// println!("Received reply: {}", reply);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct AddressRouter {
    inner: Arc<RouterInner>,
}

impl Default for AddressRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

impl AddressRouter {
    /// Creates a router that logs handler failures with `tracing`.
    pub fn new(config: RouterConfig) -> Self {
        Self::with_error_sink(config, Arc::new(TracingErrorSink))
    }

    pub fn with_error_sink(config: RouterConfig, error_sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                table: DashMap::new(),
                requests: Arc::new(RequestManager::new()),
                error_sink,
                config,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    /// Registers `handler` at `address`.
    ///
    /// Never fails: on an empty address or a closed router the returned handle
    /// is simply inactive (`is_registered()` is `false`).
    #[instrument(skip(self, handler))]
    pub fn subscribe<H>(&self, address: &str, handler: H) -> RegistrationHandle
    where
        H: MessageHandler + 'static,
    {
        let slot: HandlerSlot = Arc::new(RwLock::new(Arc::new(handler)));
        let (handle, receiver) = self.register(address, Some(slot.clone()));
        if let Some(receiver) = receiver {
            tokio::spawn(run_worker(
                handle.id().to_string(),
                address.to_string(),
                slot,
                receiver,
                self.inner.error_sink.clone(),
            ));
        }
        handle
    }

    /// Registers a consumer whose messages are read as a stream. Dropping the
    /// stream unsubscribes it.
    #[instrument(skip(self))]
    pub fn subscribe_stream(&self, address: &str) -> MessageStream {
        let (handle, receiver) = self.register(address, None);
        let receiver = receiver.unwrap_or_else(|| {
            // inactive registration: a stream that ends immediately
            let (_, rx) = mpsc::channel(1);
            rx
        });
        MessageStream {
            inner: ReceiverStream::new(receiver),
            handle,
        }
    }

    fn register(
        &self,
        address: &str,
        handler: Option<HandlerSlot>,
    ) -> (RegistrationHandle, Option<mpsc::Receiver<Message>>) {
        let id = Uuid::new_v4().to_string();
        let shared = Arc::new(RegistrationShared {
            id: id.clone(),
            address: address.to_string(),
            handler,
            registered: AtomicBool::new(false),
            router: Arc::downgrade(&self.inner),
        });
        let handle = RegistrationHandle { shared };

        if address.is_empty() {
            warn!("Ignoring registration on an empty address");
            return (handle, None);
        }
        if self.is_closed() {
            warn!("Ignoring registration on {}: router is closed", address);
            return (handle, None);
        }

        // an unvalidated config may carry a zero capacity
        let capacity = self.inner.config.handler_queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let registration = Arc::new(Registration {
            id: id.clone(),
            sender,
        });
        handle.shared.registered.store(true, Ordering::SeqCst);
        self.inner
            .table
            .entry(address.to_string())
            .or_default()
            .registrations
            .push(registration);

        // close() may have cleared the table between the check above and the push
        if self.is_closed() {
            self.unlink(address, &id);
            handle.shared.registered.store(false, Ordering::SeqCst);
            return (handle, None);
        }

        debug!("Registered {} at {}", id, address);
        (handle, Some(receiver))
    }

    /// Removes the registration. Returns `false` if it was already removed.
    ///
    /// Messages already queued for the registration are still handled.
    #[instrument(skip(self, handle), fields(id = %handle.id(), address = %handle.address()))]
    pub fn unsubscribe(&self, handle: &RegistrationHandle) -> bool {
        if !handle.shared.registered.swap(false, Ordering::SeqCst) {
            return false;
        }
        // close() already dropped every registration
        if self.is_closed() {
            return false;
        }
        self.unlink(handle.address(), handle.id());
        debug!("Unregistered {} from {}", handle.id(), handle.address());
        true
    }

    fn unlink(&self, address: &str, id: &str) {
        if let Some(mut entry) = self.inner.table.get_mut(address) {
            entry.registrations.retain(|registration| registration.id != id);
        }
        self.inner
            .table
            .remove_if(address, |_, entry| entry.registrations.is_empty());
    }

    /// Delivers `body` to every handler registered at `address`. Returns how
    /// many registrations the message was queued for; zero handlers is not an error.
    pub fn publish(&self, address: &str, body: impl Into<Value>) -> RouterResult<usize> {
        self.publish_with_options(address, body, DeliveryOptions::default())
    }

    #[instrument(skip(self, body, options))]
    pub fn publish_with_options(
        &self,
        address: &str,
        body: impl Into<Value>,
        options: DeliveryOptions,
    ) -> RouterResult<usize> {
        self.check_address(address)?;
        let targets: Vec<Arc<Registration>> = self
            .inner
            .table
            .get(address)
            .map(|entry| entry.registrations.clone())
            .unwrap_or_default();

        let message = Message::new(
            address,
            body.into(),
            options.headers,
            DeliveryKind::Publish,
            None,
        );

        let mut delivered = 0;
        for target in targets {
            match target.sender.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.inner.error_sink.report(DeliveryFailure::new(
                        address,
                        &target.id,
                        DeliveryKind::Publish,
                        FailureKind::QueueFull,
                        "delivery queue is full",
                    ));
                }
                // unsubscribed while we were dispatching
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        trace!("Published to {} handlers at {}", delivered, address);
        Ok(delivered)
    }

    /// Delivers `body` to exactly one handler at `address`.
    pub fn send(&self, address: &str, body: impl Into<Value>) -> RouterResult<()> {
        self.send_with_options(address, body, DeliveryOptions::default())
    }

    #[instrument(skip(self, body, options))]
    pub fn send_with_options(
        &self,
        address: &str,
        body: impl Into<Value>,
        options: DeliveryOptions,
    ) -> RouterResult<()> {
        self.check_address(address)?;
        let target = self.select_target(address)?;
        let message = Message::new(address, body.into(), options.headers, DeliveryKind::Send, None);
        deliver(&target, address, message)
    }

    /// Sends `body` to one handler and waits for its reply, up to the
    /// configured `default_request_timeout`.
    pub async fn request(&self, address: &str, body: impl Into<Value>) -> RouterResult<Value> {
        self.request_with_options(address, body, DeliveryOptions::default())
            .await
    }

    #[instrument(skip(self, body, options))]
    pub async fn request_with_options(
        &self,
        address: &str,
        body: impl Into<Value>,
        options: DeliveryOptions,
    ) -> RouterResult<Value> {
        self.check_address(address)?;
        let timeout = options
            .timeout
            .unwrap_or(self.inner.config.default_request_timeout);
        let target = self.select_target(address)?;

        let requests = &self.inner.requests;
        let (request_id, rx) = requests.register(address);
        let reply = ReplyChannel::new(request_id.clone(), address, requests.clone());
        let message = Message::new(
            address,
            body.into(),
            options.headers,
            DeliveryKind::Request,
            Some(reply),
        );

        if let Err(e) = deliver(&target, address, message) {
            requests.discard(&request_id);
            return Err(e);
        }

        requests.await_reply(request_id, address, timeout, rx).await
    }

    /// Picks the next registration at `address`, rotating through the list.
    fn select_target(&self, address: &str) -> RouterResult<Arc<Registration>> {
        let entry = self.inner.table.get(address);
        let entry = match entry {
            Some(entry) if !entry.registrations.is_empty() => entry,
            _ => {
                return Err(RouterError::NoHandlerRegistered {
                    address: address.to_string(),
                })
            }
        };
        let index = entry.cursor.fetch_add(1, Ordering::Relaxed) % entry.registrations.len();
        Ok(entry.registrations[index].clone())
    }

    fn check_address(&self, address: &str) -> RouterResult<()> {
        if self.is_closed() {
            return Err(RouterError::RouterClosed);
        }
        if address.is_empty() {
            return Err(RouterError::InvalidAddress);
        }
        Ok(())
    }

    pub fn handler_count(&self, address: &str) -> usize {
        self.inner
            .table
            .get(address)
            .map(|entry| entry.registrations.len())
            .unwrap_or(0)
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .inner
            .table
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        addresses.sort();
        addresses
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.requests.pending_count()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Drops every registration and fails all pending requests with
    /// `RouterClosed`. Queued messages are still handled by their workers.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.table.clear();
        let cancelled = self.inner.requests.cancel_waiting_requests("router closed");
        debug!("Router closed, {} pending requests cancelled", cancelled);
    }
}

fn deliver(target: &Registration, address: &str, message: Message) -> RouterResult<()> {
    target.sender.try_send(message).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => RouterError::QueueFull {
            address: address.to_string(),
        },
        mpsc::error::TrySendError::Closed(_) => RouterError::NoHandlerRegistered {
            address: address.to_string(),
        },
    })
}

async fn run_worker(
    registration_id: RegistrationId,
    address: String,
    slot: HandlerSlot,
    mut receiver: mpsc::Receiver<Message>,
    error_sink: Arc<dyn ErrorSink>,
) {
    while let Some(message) = receiver.recv().await {
        let handler = slot.read().await.clone();
        let delivery = message.kind();
        let reply = message.reply_channel().cloned();

        let result = tokio::spawn(async move { handler.handle(message).await }).await;
        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some((FailureKind::Error, format!("{:#}", e))),
            Err(e) if e.is_panic() => Some((FailureKind::Panic, panic_message(e.into_panic()))),
            Err(e) => Some((FailureKind::Error, e.to_string())),
        };

        if let Some((kind, cause)) = failure {
            if let Some(reply) = reply {
                reply.resolve(Err(RouterError::HandlerFailed {
                    address: address.clone(),
                    message: cause.clone(),
                }));
            }
            error_sink.report(DeliveryFailure::new(
                &address,
                &registration_id,
                delivery,
                kind,
                cause,
            ));
        }
    }
    trace!("Worker for {} at {} stopped", registration_id, address);
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

struct RegistrationShared {
    id: RegistrationId,
    address: String,
    handler: Option<HandlerSlot>,
    registered: AtomicBool,
    router: Weak<RouterInner>,
}

/// Owned by the subscriber; identifies one registration.
#[derive(Clone)]
pub struct RegistrationHandle {
    shared: Arc<RegistrationShared>,
}

impl RegistrationHandle {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn is_registered(&self) -> bool {
        self.shared.registered.load(Ordering::SeqCst)
            && self
                .shared
                .router
                .upgrade()
                .is_some_and(|router| !router.closed.load(Ordering::SeqCst))
    }

    /// Same as `AddressRouter::unsubscribe`.
    pub fn unsubscribe(&self) -> bool {
        match self.shared.router.upgrade() {
            Some(inner) => AddressRouter { inner }.unsubscribe(self),
            None => {
                self.shared.registered.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Swaps the handler used for deliveries that have not started yet.
    pub async fn replace_handler<H>(&self, handler: H) -> RouterResult<()>
    where
        H: MessageHandler + 'static,
    {
        let slot = self
            .shared
            .handler
            .as_ref()
            .ok_or_else(|| RouterError::StreamRegistration {
                id: self.id().to_string(),
            })?;
        *slot.write().await = Arc::new(handler);
        debug!("Replaced handler of {} at {}", self.id(), self.address());
        Ok(())
    }
}

impl std::fmt::Debug for RegistrationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationHandle")
            .field("id", &self.shared.id)
            .field("address", &self.shared.address)
            .field("registered", &self.is_registered())
            .finish()
    }
}

/// Messages of a stream registration, in delivery order.
pub struct MessageStream {
    inner: ReceiverStream<Message>,
    handle: RegistrationHandle,
}

impl MessageStream {
    pub fn handle(&self) -> &RegistrationHandle {
        &self.handle
    }
}

impl Stream for MessageStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouterError {
    #[error("No handler registered at address: {address}")]
    NoHandlerRegistered { address: String },

    #[error("Request {request_id} to {address} timed out after {timeout_ms}ms")]
    Timeout {
        address: String,
        request_id: String,
        timeout_ms: u64,
    },

    #[error("Recipient at {address} failed the request ({code}): {message}")]
    RecipientFailure {
        address: String,
        code: i32,
        message: String,
    },

    #[error("Handler at {address} failed: {message}")]
    HandlerFailed { address: String, message: String },

    #[error("Delivery queue full at address: {address}")]
    QueueFull { address: String },

    #[error("Address must not be empty")]
    InvalidAddress,

    #[error("Router is closed")]
    RouterClosed,

    #[error("Registration {id} is a stream and has no handler")]
    StreamRegistration { id: String },

    #[error("Error receiver lagged: {count}")]
    Lagged { count: u64 },

    #[error("Error receive failed: {message}")]
    ReceiveFailed { message: String },
}

pub type RouterResult<T> = Result<T, RouterError>;
