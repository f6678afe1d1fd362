//! # Broadcast Chat Server Library
//!
//! This library provides the server side of a real-time text broadcast service.
//! Clients hold open duplex connections; any line one client sends is fanned
//! out to every client connected at that moment, the sender included.
//!
//! ## Architecture Design
//!
//! ### Single-Owner Broadcast Hub
//! The [`hub::BroadcastHub`] is an actor. One control loop task owns the set of
//! subscriber outboxes and is the only code that mutates it. Subscribe,
//! unsubscribe and publish requests reach it through bounded queues, so no
//! locks guard the subscriber set and a full queue pushes back on its callers.
//!
//! ### One Bridge Per Connection
//! A [`bridge::ConnectionBridge`] couples one client stream to the hub. Its
//! reader flow publishes every received request; its writer flow forwards
//! every message arriving in the connection's outbox. Each connection
//! subscribes once and unsubscribes once, however it ends.
//!
//! ### Cancellation Tree
//! A root `CancellationToken` stops the accept loop and the hub. Every
//! connection runs under a child token, so root shutdown also unwinds each
//! bridge.
//!
//! ## Module Organization
//!
//! ### Hub Module (`hub`)
//! - Subscriber registration with acknowledgement
//! - Sequential fan-out from a single shared inbound queue
//! - Shutdown that closes every remaining outbox once
//!
//! ### Bridge Module (`bridge`)
//! - Identity resolution from connection metadata
//! - Reader and writer flows sharing the connection token
//! - Guaranteed unsubscribe on every exit path
//!
//! ### Network Module (`network`)
//! - TCP listener and accept loop
//! - `Hello` handshake with a deadline
//! - Per-connection task spawning
//!
//! ## Ordering
//!
//! Every publish funnels through one FIFO queue, so all subscribers observe
//! messages in the same relative order and each sender's messages keep the
//! order in which that sender issued them. The order in which distinct
//! subscribers are served within one dispatch is unspecified.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{Server, ServerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let shutdown = CancellationToken::new();
//!     let server = Server::bind("127.0.0.1:8080", ServerConfig::default(), shutdown.clone()).await?;
//!
//!     let ctrl_c = shutdown.clone();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         ctrl_c.cancel();
//!     });
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod error;
pub mod hub;
pub mod network;

pub use bridge::{resolve_identity, ConnectionBridge};
pub use error::{BridgeError, HubError};
pub use hub::{BroadcastHub, HubConfig, HubState, Outbox, SubscriberId};
pub use network::{Server, ServerConfig};
