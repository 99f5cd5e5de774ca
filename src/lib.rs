//! # busline
//!
//! In-process addressed messaging: handlers subscribe to string addresses and
//! producers reach them with publish (fan-out), send (one handler, round-robin)
//! or request (send plus a correlated reply).
//!
//! See [`event`] for the routing model and [`config`] for router settings.

pub mod config;
pub mod error;
pub mod event;

// Re-exports
pub use config::RouterConfig;
pub use error::*;
pub use event::{AddressRouter, Message, RouterError, RouterResult};
pub use serde_json::Value;
