//! Real-time WebSocket Chat Relay Library
//!
//! Clients connect over WebSocket, claim a unique username, exchange direct
//! messages and receive live presence updates.
//!
//! # Protocol
//! - First client message (within 5 seconds): `{"username": "alice"}`
//! - Afterwards, any number of `{"toUsername": "bob", "content": "hi"}`
//! - Server pushes `CHAT` and `BROADCAST` messages, each carrying `type`,
//!   `fromUsername`, `toUsername`, `content`, `timestamp` and `users`
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `Registry` is the single owner of the username → session map
//! - `HandshakeGate` waits for the username claim and emits a join
//! - Each `Session` has a reader task and a writer task draining a bounded mailbox
//! - No locks needed - all registry access goes through message passing
//!
//! # Example
//! ```ignore
//! use chat_relay::{ChatServer, Config};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = ChatServer::bind(Config::default()).await.unwrap();
//!     server
//!         .run(async { tokio::signal::ctrl_c().await.unwrap() })
//!         .await
//!         .unwrap();
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;
pub mod types;

// Re-export main types for convenience
pub use config::Config;
pub use connection::Connection;
pub use error::{AppError, ConfigError, ConnectionError, DeliveryError};
pub use handshake::HandshakeGate;
pub use message::{ClaimUsernameRequest, ForwardMessageRequest, ServerMessage};
pub use registry::{Registry, RegistryCommand, RegistryHandle};
pub use server::ChatServer;
pub use session::{Session, SessionSettings, SessionState};
pub use types::{SessionId, Username};
