use std::sync::Arc;

use vcrpc_transport::{SocketPool, TransportStrategy};
use vcrpc_wire::{DEFAULT_MAX_PAYLOAD_SIZE, INITIAL_SEND_BUFFER_SIZE, SEND_BUFFER_GROWTH_INCREMENT};

/// Connection construction parameters.
///
/// One value object with builder-style setters; all the knobs default
/// sensibly so the common case is `ConnectionConfig::new(host, port)`.
#[derive(Clone)]
pub struct ConnectionConfig {
    host: String,
    port: u16,
    secure: bool,
    rsh_command: Option<String>,
    pool: Option<Arc<dyn SocketPool>>,
    unicode: bool,
    send_buffer_initial: usize,
    send_buffer_growth: usize,
    max_payload_size: usize,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secure: false,
            rsh_command: None,
            pool: None,
            unicode: false,
            send_buffer_initial: INITIAL_SEND_BUFFER_SIZE,
            send_buffer_growth: SEND_BUFFER_GROWTH_INCREMENT,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Negotiate TLS on the socket. Ignored for subprocess transports.
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Use a launched shell command's stdin/stdout instead of a socket.
    /// Takes precedence over the pool and direct dialing.
    pub fn rsh_command(mut self, command: impl Into<String>) -> Self {
        self.rsh_command = Some(command.into());
        self
    }

    /// Lease the socket from `pool` instead of dialing.
    pub fn pool(mut self, pool: Arc<dyn SocketPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Whether the server runs in unicode mode (text fields are UTF-8).
    pub fn unicode(mut self, unicode: bool) -> Self {
        self.unicode = unicode;
        self
    }

    /// Tune the marshaling buffer's initial size and growth increment.
    pub fn send_buffer(mut self, initial: usize, growth: usize) -> Self {
        self.send_buffer_initial = initial;
        self.send_buffer_growth = growth;
        self
    }

    /// Largest inbound payload the receive path will allocate for.
    pub fn max_payload_size(mut self, max: usize) -> Self {
        self.max_payload_size = max;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_unicode(&self) -> bool {
        self.unicode
    }

    pub(crate) fn send_buffer_initial(&self) -> usize {
        self.send_buffer_initial
    }

    pub(crate) fn send_buffer_growth(&self) -> usize {
        self.send_buffer_growth
    }

    pub(crate) fn max_payload(&self) -> usize {
        self.max_payload_size
    }

    pub(crate) fn strategy(&self) -> TransportStrategy {
        if let Some(command) = &self.rsh_command {
            return TransportStrategy::SubprocessPipe {
                shell_command: command.clone(),
            };
        }
        if let Some(pool) = &self.pool {
            return TransportStrategy::PooledSocket {
                pool: Arc::clone(pool),
                host: self.host.clone(),
                tls: self.secure,
            };
        }
        TransportStrategy::DirectSocket {
            host: self.host.clone(),
            port: self.port,
            tls: self.secure,
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("rsh_command", &self.rsh_command)
            .field("pooled", &self.pool.is_some())
            .field("unicode", &self.unicode)
            .finish_non_exhaustive()
    }
}
