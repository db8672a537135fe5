//! Distributed WebSocket Relay Server Library
//!
//! A WebSocket server for real-time messaging between users who may be
//! connected to different processes or hosts. Processes find each other
//! only through a publish/subscribe relay (Redis, or an in-process bus).
//!
//! # Features
//! - JWT-authenticated WebSocket handshake
//! - Tag-based dispatch of JSON envelopes to registered handlers
//! - One live connection per user, reconnects replace the old one
//! - Ping/pong heartbeat evicting unresponsive connections
//! - Cross-process delivery over Redis pub/sub
//! - Cluster mode supervising one worker per CPU
//!
//! # Architecture
//! - `RelayServer` is the context object owning registry, dispatch table
//!   and relay publisher; handlers receive it as an argument
//! - Each connection runs a read task and a write task joined by an
//!   `mpsc` channel
//! - The relay bridge feeds frames from other processes into the local
//!   registry
//!
//! # Example
//! ```ignore
//! use socket_relay::{bind, Config, RelayBackend, RelayServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), socket_relay::AppError> {
//!     let config = Config::from_env()?;
//!     let backend = RelayBackend::from_config(&config)?;
//!     let listener = bind(&config).await?;
//!
//!     let server = RelayServer::builder(config)
//!         .on("m", |server, _conn, envelope| {
//!             if let Some(relay) = envelope.relay() {
//!                 let _ = server.deliver(relay);
//!             }
//!         })
//!         .build();
//!
//!     server.serve(listener, backend, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     }).await
//! }
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod message;
pub mod registry;
pub mod relay;
pub mod server;
pub mod supervisor;
pub mod types;

// Re-export main types for convenience
pub use auth::{Authenticator, Identity};
pub use config::Config;
pub use connection::{Connection, Outbound};
pub use dispatch::DispatchTable;
pub use error::{AppError, AuthError, ConfigError, DecodeError, RelayError, SendError};
pub use handler::handle_connection;
pub use message::{Codec, Envelope, Recipient, RelayEnvelope, TagField};
pub use registry::SessionRegistry;
pub use relay::{LocalBus, RelayBackend, RelayPublisher};
pub use server::{bind, RelayServer, ServerBuilder, Shutdown, ShutdownSignal};
pub use types::{ConnectionId, Tag, UserId};
