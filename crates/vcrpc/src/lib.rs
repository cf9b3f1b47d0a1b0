//! Client-side RPC connection layer for a version-control server.
//!
//! Layers, bottom up: `vcrpc-transport` obtains the byte streams (direct
//! socket, pooled socket, or subprocess pipe, with optional TLS),
//! `vcrpc-wire` frames and marshals packets, and this crate's
//! [`Connection`] ties them together with shared stats, a one-shot gzip
//! upgrade, and unified teardown.
//!
//! ```no_run
//! use std::sync::Arc;
//! use vcrpc::{Connection, ConnectionConfig, ConnectionStats, Packet};
//!
//! # fn main() -> vcrpc::Result<()> {
//! let config = ConnectionConfig::new("vcs.example.com", 1666);
//! let mut conn = Connection::connect(&config, Arc::new(ConnectionStats::new()))?;
//!
//! conn.put_rpc_packet(&Packet::new("user-info"))?;
//! let reply = conn.get_rpc_packet()?;
//! println!("server replied with {:?}", reply.function_name());
//!
//! conn.disconnect()?;
//! # Ok(())
//! # }
//! ```

mod compress;
pub mod config;
pub mod connection;
pub mod error;
pub mod stats;

pub use config::ConnectionConfig;
pub use connection::Connection;
pub use error::{Error, Result};
pub use stats::ConnectionStats;

pub use vcrpc_transport::{
    ConnectionError, ReleaseHook, SecurityError, SimpleSocketPool, SocketPool, TlsSessionFacts,
};
pub use vcrpc_wire::{
    DecodedPacket, EnvBlock, FieldRule, FilterCallback, Packet, ProgrammingError, ProtocolError,
    SessionEnv, TextCodec, Utf8Codec, Value,
};
