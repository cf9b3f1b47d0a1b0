//! Connection establishment for the vcrpc protocol layer.
//!
//! Three strategies yield the same shape of byte-stream pair: a freshly
//! dialed TCP socket (optionally TLS), a socket leased from an external
//! pool, or the stdin/stdout of a launched subprocess. Teardown is unified
//! behind a per-variant shutdown resource that is released exactly once.

pub mod connect;
pub mod error;
pub mod pool;
pub mod stream;
pub mod tls;

pub use connect::{
    socket_recv_buffer_size, socket_send_buffer_size, ConnectionHandle, ShutdownResource,
    TransportStrategy,
};
pub use error::{ConnectionError, Result, SecurityError};
pub use pool::{ReleaseHook, SimpleSocketPool, SocketPool};
pub use stream::{StreamReader, StreamWriter};
pub use tls::{check_validity, session_facts, TlsSessionFacts};
