//! freeq-pool: one logical chat client over many capped connections.
//!
//! The service limits how many channels one connection may join, so
//! [`ChatClient`] keeps a pool of [`Connection`]s:
//! - channels are spread so no connection exceeds the ceiling
//! - a closed connection's channels are rejoined on the others
//! - `WHISPER`s, delivered to every connection, are forwarded once
//! - mixins attach rate limiting and state tracking to every connection

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod irc;
pub mod mixin;
pub mod mixins;
mod operations;
pub mod pool;
pub mod transport;
pub mod validation;

pub use client::{ChatClient, JoinResults};
pub use config::{ClientConfig, ConnectionRateLimits};
pub use connection::{Connection, ConnectionId, Lifecycle};
pub use error::{Error, ErrorKind, Result};
pub use event::{ClientEvent, ConnectionEvent, EventBus, Subscription};
pub use irc::Message;
pub use mixin::{ClientMixin, ConnectionMixin};
pub use transport::{Connector, MemoryConnector, TcpConnector};
