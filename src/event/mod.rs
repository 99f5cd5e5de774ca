//! # Addressed Messaging
//!
//! Components talk to each other through named addresses instead of direct
//! references. A handler subscribes to an address; a producer delivers to the
//! address without knowing who is listening.
//!
//! ## Components
//!
//! - **AddressRouter**: registration table and the three delivery semantics
//! - **RequestManager**: correlates replies with waiting requesters, with timeouts
//! - **MessageHandler**: async handler trait, plus closure adapters
//! - **ErrorSink**: receives failures of individual handlers
//!
//! ## Delivery
//!
//! ```text
//!               publish                      send / request
//! ┌─────────┐          ┌──────────┐      ┌─────────┐          ┌──────────┐
//! │Producer │─────────▶│Handler 1 │      │Producer │─────────▶│Handler 1 │ (1st)
//! └─────────┘    │     └──────────┘      └─────────┘    ╎     └──────────┘
//!                │     ┌──────────┐                     ╎     ┌──────────┐
//!                └────▶│Handler 2 │                     └╌╌╌╌▶│Handler 2 │ (2nd)
//!                      └──────────┘                           └──────────┘
//! ```
//!
//! `publish` reaches every handler registered at the time of the call. `send`
//! reaches exactly one, rotating through the registrations. `request` is a
//! `send` whose message carries a reply channel:
//!
//! ```text
//! ┌─────────┐   request   ┌──────────────┐   message   ┌─────────┐
//! │Requester│────────────▶│AddressRouter │────────────▶│Handler  │
//! └────▲────┘             └──────────────┘             └────┬────┘
//!      │              RequestManager (by request id)        │
//!      └────────────────────────────────────────────────────┘
//!                              reply
//! ```
//!
//! The first `reply` (or `fail`) settles the request; anything after that,
//! including a reply arriving after the timeout, is ignored.
//!
//! ## Request-Reply Example
//!
//! ```rust,no_run
//! # use busline::config::RouterConfig;
//! # use busline::event::{sync_handler, AddressRouter, RouterError};
//! # async fn example() {
//! let router = AddressRouter::new(RouterConfig::default());
//! router.subscribe(
//!     "example.address",
//!     sync_handler(|message| {
//!         message.reply(format!("{} is processed", message.body()));
//!         Ok(())
//!     }),
//! );
//!
//! match router.request("example.address", "hello").await {
//!     Ok(reply) => println!("Received reply: {}", reply),
//!     Err(RouterError::Timeout { .. }) => println!("No reply in time"),
//!     Err(e) => println!("Request failed: {}", e),
//! }
//! # }
//! ```

pub mod error_sink;
pub mod handler;
pub mod message;
pub mod request_manager;
pub mod router;

pub use error_sink::{
    ChannelErrorSink, DeliveryFailure, ErrorReceiver, ErrorSink, FailureKind, TracingErrorSink,
};
pub use handler::{handler_fn, sync_handler, BoxedHandler, MessageHandler};
pub use message::{DeliveryKind, DeliveryOptions, Message, ReplyChannel};
pub use request_manager::{RequestId, RequestManager};
pub use router::{
    AddressRouter, MessageStream, RegistrationHandle, RegistrationId, RouterError, RouterResult,
};
