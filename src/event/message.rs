use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::Value;
use strum::Display;

use super::request_manager::{ReplyOutcome, RequestId, RequestManager};
use super::router::RouterError;

/// How a message reached its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryKind {
    Publish,
    Send,
    Request,
}

/// Per-call delivery settings.
///
/// `timeout` only applies to requests; when unset the router's
/// `default_request_timeout` is used.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryOptions {
    pub headers: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

impl DeliveryOptions {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// # Message
///
/// Immutable envelope handed to a handler. Cloning is cheap; the body and
/// headers are shared.
///
/// Only messages delivered through `request` carry a reply channel, and only
/// the first `reply`/`fail` on any clone of that message has an effect.
#[derive(Clone)]
pub struct Message {
    address: Arc<str>,
    body: Arc<Value>,
    headers: Arc<HashMap<String, String>>,
    kind: DeliveryKind,
    reply: Option<ReplyChannel>,
    sent_at: DateTime<Utc>,
}

impl Message {
    pub(crate) fn new(
        address: &str,
        body: Value,
        headers: HashMap<String, String>,
        kind: DeliveryKind,
        reply: Option<ReplyChannel>,
    ) -> Self {
        Self {
            address: Arc::from(address),
            body: Arc::new(body),
            headers: Arc::new(headers),
            kind,
            reply,
            sent_at: Utc::now(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn kind(&self) -> DeliveryKind {
        self.kind
    }

    /// `true` for point-to-point deliveries (`send` and `request`).
    pub fn is_send(&self) -> bool {
        self.kind != DeliveryKind::Publish
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }

    pub fn reply_channel(&self) -> Option<&ReplyChannel> {
        self.reply.as_ref()
    }

    /// Replies to the requester. Returns `false` when the message carries no
    /// reply channel or the request is already settled.
    pub fn reply(&self, body: impl Into<Value>) -> bool {
        match &self.reply {
            Some(reply) => reply.reply(body),
            None => false,
        }
    }

    /// Fails the request with an application-level code and message.
    pub fn fail(&self, code: i32, message: &str) -> bool {
        match &self.reply {
            Some(reply) => reply.fail(code, message),
            None => false,
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("address", &self.address)
            .field("body", &self.body)
            .field("headers", &self.headers)
            .field("kind", &self.kind)
            .field("request_id", &self.reply.as_ref().map(|r| r.request_id()))
            .finish()
    }
}

/// Single-use handle correlated with one outstanding request.
#[derive(Clone)]
pub struct ReplyChannel {
    request_id: RequestId,
    address: Arc<str>,
    manager: Arc<RequestManager>,
}

impl ReplyChannel {
    pub(crate) fn new(request_id: RequestId, address: &str, manager: Arc<RequestManager>) -> Self {
        Self {
            request_id,
            address: Arc::from(address),
            manager,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn reply(&self, body: impl Into<Value>) -> bool {
        self.resolve(Ok(body.into()))
    }

    pub fn fail(&self, code: i32, message: &str) -> bool {
        self.resolve(Err(RouterError::RecipientFailure {
            address: self.address.to_string(),
            code,
            message: message.to_string(),
        }))
    }

    /// `false` once the request has been resolved, timed out or cancelled.
    pub fn is_pending(&self) -> bool {
        self.manager.is_pending(&self.request_id)
    }

    pub(crate) fn resolve(&self, outcome: ReplyOutcome) -> bool {
        self.manager.complete(&self.request_id, outcome)
    }
}

impl fmt::Debug for ReplyChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyChannel")
            .field("request_id", &self.request_id)
            .field("address", &self.address)
            .finish()
    }
}
