use vcrpc_transport::{ConnectionError, SecurityError};
use vcrpc_wire::{ProgrammingError, ProtocolError};

/// Unified error for connection-level operations.
///
/// Each variant carries one layer's taxonomy: transport failures,
/// TLS/certificate failures, wire-format violations, and caller misuse.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Programming(#[from] ProgrammingError),
}

impl Error {
    /// Lift a transport error, unnesting TLS failures so callers match on
    /// [`Error::Security`] regardless of where the failure surfaced.
    pub(crate) fn from_transport(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Security(e) => Self::Security(e),
            other => Self::Connection(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
