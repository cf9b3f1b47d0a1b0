/// Errors that can occur while establishing or tearing down a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Hostname lookup failed before any connect was attempted.
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        source: std::io::Error,
    },

    /// The host resolved but no address accepted the connection.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to spawn the subprocess carrying the byte streams.
    #[error("failed to launch subprocess {command:?}: {source}")]
    Subprocess {
        command: String,
        source: std::io::Error,
    },

    /// The socket pool could not produce a connection.
    #[error("socket pool acquire failed: {0}")]
    Pool(std::io::Error),

    /// An I/O error occurred on the connection's byte streams.
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A write on a secure connection timed out. The server-side send
    /// limit may need raising.
    #[error("secure connection write timed out (consider raising the server send limit): {0}")]
    SecureWriteTimeout(std::io::Error),

    /// The peer closed the stream in the middle of a packet.
    #[error("connection unexpectedly closed by peer")]
    UnexpectedClose,

    /// The connection was already disconnected.
    #[error("connection already disconnected")]
    AlreadyDisconnected,

    /// TLS negotiation failed during establishment.
    #[error(transparent)]
    Security(#[from] SecurityError),
}

/// Errors raised by TLS negotiation and peer-certificate inspection.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    /// The host string is not usable as a TLS server name.
    #[error("invalid TLS server name {host:?}: {source}")]
    InvalidServerName {
        host: String,
        source: rustls::pki_types::InvalidDnsNameError,
    },

    /// Building the client configuration failed.
    #[error("TLS configuration error: {0}")]
    Config(rustls::Error),

    /// The TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] rustls::Error),

    /// I/O failure while driving the handshake.
    #[error("TLS handshake I/O error: {0}")]
    HandshakeIo(std::io::Error),

    /// The server presented no certificate chain.
    #[error("server presented no certificate")]
    NoPeerCertificate,

    /// The leaf certificate could not be parsed.
    #[error("failed to parse server certificate: {0}")]
    CertificateParse(String),

    /// The leaf certificate's validity window has passed.
    #[error("server certificate expired at unix time {not_after}")]
    CertificateExpired { not_after: i64 },

    /// The leaf certificate's validity window has not started.
    #[error("server certificate not valid until unix time {not_before}")]
    CertificateNotYetValid { not_before: i64 },
}

pub type Result<T> = std::result::Result<T, ConnectionError>;
