//! # Broadcast Chat Client Library
//!
//! Terminal client for the broadcast chat server. It connects over TCP,
//! identifies itself once with a `Hello` frame carrying the `x-user` metadata,
//! then runs two flows until either ends:
//!
//! - every line read from the input is sent as a `Request`
//! - every `Response` broadcast by the server is printed as `user: text`
//!
//! The server echoes a client's own messages back to it, so each line typed
//! shows up once it has been broadcast.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! Connection setup, handshake and the send/receive flows.
//!
//! ### Input Module (`input`)
//! Line-oriented input with terminators stripped.
//!
//! ### Display Module (`display`)
//! Formatting of received messages.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::input::LineInput;
//! use client::network::ChatClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ChatClient::connect("127.0.0.1:8080", "userA").await?;
//!     client.run(LineInput::stdin(), tokio::io::stdout()).await
//! }
//! ```

pub mod display;
pub mod input;
pub mod network;
