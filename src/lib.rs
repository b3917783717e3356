#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # httpchan
//!
//! httpchan manages the lifecycle of HTTP client and server connections on
//! top of an asynchronous byte-channel abstraction: it turns a freshly
//! established channel into a protocol-aware, reference-counted connection
//! object, picks HTTP/1.1 or HTTP/2 from the negotiated ALPN protocol, and
//! tears everything down cleanly on shutdown.
//!
//! ## What lives here
//!
//! - [`client::connect`] starts one outbound connection and reports the
//!   outcome through a setup callback.
//! - [`server::Server`] owns a listening socket, promotes accepted channels
//!   to connections, and tracks every live child until teardown.
//! - [`Connection`] is the handle both sides hold: cloning acquires a
//!   reference, dropping the last one shuts the underlying channel down.
//!
//! ## What stays outside
//!
//! The HTTP/1 encoder and decoder, the HTTP/2 frame layer, TLS, and the
//! socket machinery are external collaborators, consumed through the narrow
//! interfaces in [`channel`] and [`bootstrap`]. httpchan never parses HTTP
//! wire syntax and never owns a socket.

pub use crate::conn::{Connection, Http2Connection};
pub use crate::error::{Error, Result};

pub mod bootstrap;
pub mod channel;
pub mod client;
pub mod conn;
mod error;
mod hooks;
#[cfg(test)]
mod mock;
pub mod server;
