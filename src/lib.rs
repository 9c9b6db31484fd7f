//! # netwire
//!
//! Message-oriented TCP/UDP client-server networking: a framing and
//! dispatch engine. Raw byte streams and datagrams become *commands*
//! with payloads; oversized payloads fragment into chunks and reassemble
//! on the far side; completed messages dispatch to per-command handlers
//! with request/response correlation.
//!
//! ## Architecture
//!
//! - **Protocol** (`protocol`): 7-byte header + optional chunk/response
//!   fields, folded byte-sum checksum, optional LZ4, TCP sentinel with
//!   in-ring resynchronization
//! - **Engines** (`server`, `client`): accept/receive loops, reserved
//!   command handling (PING/CONNECT/DISCONNECT), per-peer in-order
//!   dispatch off the receive path
//! - **Plumbing** (`pool`, `ring`, `writer`, `reassembly`, `registry`,
//!   `response`, `clients`): pooled buffers, per-peer rings, batched
//!   writer tasks, chunk reassembly, and the three shared tables
//!
//! ## Example
//!
//! ```ignore
//! use netwire::{client::Client, server::Server};
//! use std::time::Duration;
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Hello { name: String }
//!
//! #[tokio::main]
//! async fn main() -> netwire::Result<()> {
//!     let server = Server::builder().build();
//!     server.add_command::<Hello>(&[1])?;
//!     server.add_data_received(1, |msg, hello: &Hello| {
//!         println!("{} from {}", hello.name, msg.peer);
//!         true
//!     })?;
//!     let addr = server.run("127.0.0.1:0".parse().unwrap()).await?;
//!
//!     let client = Client::connect(addr, Duration::from_secs(5)).await?;
//!     client.send_value(1, &Hello { name: "netwire".into() }).await.unwrap();
//!     client.ping().await.unwrap();
//!     client.dispose().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod clients;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod reassembly;
pub mod registry;
pub mod response;
pub mod ring;
pub mod server;
pub mod writer;

pub use client::{Client, ClientBuilder, ClientConfig};
pub use error::{
    DisconnectReason, FramingError, NetwireError, RequestError, Result, SendError,
};
pub use pool::{BytePool, PooledBuf};
pub use protocol::{commands, CompressionMode, USER_COMMAND_LIMIT};
pub use registry::{CommandRegistry, HandlerId, InboundMessage};
pub use server::{Server, ServerBuilder, ServerConfig};
