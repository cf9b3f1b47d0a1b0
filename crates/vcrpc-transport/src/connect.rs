use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{ConnectionError, Result};
use crate::pool::{ReleaseHook, SocketPool};
use crate::stream::{StreamReader, StreamWriter};
use crate::tls::{self, TlsSessionFacts};

/// How the byte streams to the server are obtained.
pub enum TransportStrategy {
    /// Dial a fresh TCP socket, optionally negotiating TLS on it.
    DirectSocket { host: String, port: u16, tls: bool },
    /// Lease a socket from an external pool, optionally negotiating TLS on
    /// it; disconnect returns the lease.
    PooledSocket {
        pool: Arc<dyn SocketPool>,
        host: String,
        tls: bool,
    },
    /// Launch a shell command and use its stdin/stdout as the streams.
    SubprocessPipe { shell_command: String },
}

/// The per-variant resource that must be released exactly once on
/// disconnect.
pub enum ShutdownResource {
    Socket(TcpStream),
    PoolLease {
        pool: Arc<dyn SocketPool>,
        socket: TcpStream,
    },
    Child(Child),
}

impl ShutdownResource {
    /// Release the underlying resource, running `hook` exactly once.
    ///
    /// Sockets are shut down and closed; pool leases are handed back (the
    /// pool runs the hook before the socket becomes leasable again);
    /// subprocess children are reaped. Callers must drop the stream halves
    /// first so a pipe child sees EOF and exits.
    pub fn release(self, hook: Option<ReleaseHook>) -> Result<()> {
        match self {
            Self::Socket(socket) => {
                if let Some(hook) = hook {
                    hook();
                }
                // Already-reset sockets report NotConnected here; the
                // descriptor closes on drop either way.
                let _ = socket.shutdown(Shutdown::Both);
                Ok(())
            }
            Self::PoolLease { pool, socket } => {
                pool.release(socket, hook);
                Ok(())
            }
            Self::Child(mut child) => {
                if let Some(hook) = hook {
                    hook();
                }
                child.wait().map_err(ConnectionError::Io)?;
                Ok(())
            }
        }
    }
}

/// An established connection: the stream pair, teardown resource, and the
/// facts captured at connect time.
pub struct ConnectionHandle {
    pub reader: StreamReader,
    pub writer: StreamWriter,
    pub shutdown: ShutdownResource,
    /// Peer address as `ip:port` (IPv6 bracketed), or `"unknown"` for pipes.
    pub server_ip_port: String,
    /// Local address as `ip:port`, or `"unknown"` for pipes.
    pub client_ip_port: String,
    /// Present only when TLS was negotiated.
    pub tls_facts: Option<TlsSessionFacts>,
    /// Clone of the underlying socket for option queries; `None` for pipes.
    pub socket: Option<TcpStream>,
}

// The stream halves are opaque trait objects, so derive is unavailable.
impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("server_ip_port", &self.server_ip_port)
            .field("client_ip_port", &self.client_ip_port)
            .field("tls", &self.tls_facts.is_some())
            .finish_non_exhaustive()
    }
}

impl TransportStrategy {
    /// Establish the connection and hand over the streams.
    pub fn establish(self) -> Result<ConnectionHandle> {
        match self {
            Self::DirectSocket { host, port, tls } => establish_direct(&host, port, tls),
            Self::PooledSocket { pool, host, tls } => establish_pooled(pool, &host, tls),
            Self::SubprocessPipe { shell_command } => establish_subprocess(&shell_command),
        }
    }
}

fn establish_direct(host: &str, port: u16, tls: bool) -> Result<ConnectionHandle> {
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|source| ConnectionError::Resolve {
            host: host.to_string(),
            source,
        })?
        .collect();
    if addrs.is_empty() {
        return Err(ConnectionError::Resolve {
            host: host.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "hostname yielded no addresses"),
        });
    }

    let mut last_err: Option<(String, io::Error)> = None;
    let mut socket = None;
    for addr in &addrs {
        match TcpStream::connect(addr) {
            Ok(s) => {
                socket = Some(s);
                break;
            }
            Err(e) => last_err = Some((addr.to_string(), e)),
        }
    }
    let socket = match (socket, last_err) {
        (Some(s), _) => s,
        (None, Some((addr, source))) => return Err(ConnectionError::Connect { addr, source }),
        (None, None) => unreachable!("addrs is non-empty"),
    };

    if let Err(e) = socket.set_nodelay(true) {
        debug!(error = %e, "failed to set TCP_NODELAY");
    }

    // SocketAddr's Display brackets IPv6, matching the wire-level display
    // convention.
    let server_ip_port = socket.peer_addr().map(|a| a.to_string())?;
    let client_ip_port = socket.local_addr().map(|a| a.to_string())?;
    let sockopt_clone = socket.try_clone()?;
    let shutdown_clone = socket.try_clone()?;

    let (reader, writer, tls_facts) = if tls {
        let (reader, writer, facts) = tls::negotiate(socket, host)?;
        (reader, writer, Some(facts))
    } else {
        let reader: StreamReader = Box::new(socket.try_clone()?);
        let writer: StreamWriter = Box::new(socket);
        (reader, writer, None)
    };

    info!(server = %server_ip_port, tls, "connected");
    Ok(ConnectionHandle {
        reader,
        writer,
        shutdown: ShutdownResource::Socket(shutdown_clone),
        server_ip_port,
        client_ip_port,
        tls_facts,
        socket: Some(sockopt_clone),
    })
}

fn establish_pooled(pool: Arc<dyn SocketPool>, host: &str, tls: bool) -> Result<ConnectionHandle> {
    let socket = pool.acquire().map_err(ConnectionError::Pool)?;

    let server_ip_port = socket.peer_addr().map(|a| a.to_string())?;
    let client_ip_port = socket.local_addr().map(|a| a.to_string())?;
    let sockopt_clone = socket.try_clone()?;
    let lease_clone = socket.try_clone()?;

    // A secure lease negotiates on the leased socket exactly like a fresh
    // dial would. On handshake failure the socket is dropped rather than
    // returned, since the peer's TLS state is unknown.
    let (reader, writer, tls_facts) = if tls {
        let (reader, writer, facts) = tls::negotiate(socket, host)?;
        (reader, writer, Some(facts))
    } else {
        let reader: StreamReader = Box::new(socket.try_clone()?);
        let writer: StreamWriter = Box::new(socket);
        (reader, writer, None)
    };

    info!(server = %server_ip_port, tls, "leased pooled connection");
    Ok(ConnectionHandle {
        reader,
        writer,
        shutdown: ShutdownResource::PoolLease {
            pool,
            socket: lease_clone,
        },
        server_ip_port,
        client_ip_port,
        tls_facts,
        socket: Some(sockopt_clone),
    })
}

fn establish_subprocess(shell_command: &str) -> Result<ConnectionHandle> {
    let mut child = shell(shell_command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|source| ConnectionError::Subprocess {
            command: shell_command.to_string(),
            source,
        })?;

    let stdin = child.stdin.take().ok_or_else(|| ConnectionError::Subprocess {
        command: shell_command.to_string(),
        source: io::Error::new(io::ErrorKind::BrokenPipe, "child stdin not captured"),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| ConnectionError::Subprocess {
        command: shell_command.to_string(),
        source: io::Error::new(io::ErrorKind::BrokenPipe, "child stdout not captured"),
    })?;

    info!(command = shell_command, "launched subprocess transport");
    Ok(ConnectionHandle {
        reader: Box::new(stdout),
        writer: Box::new(stdin),
        shutdown: ShutdownResource::Child(child),
        server_ip_port: "unknown".to_string(),
        client_ip_port: "unknown".to_string(),
        tls_facts: None,
        socket: None,
    })
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd.exe");
    cmd.arg("/c").arg(command);
    cmd
}

/// System send-buffer size (`SO_SNDBUF`) of the socket, or 0 if the query
/// is unsupported or fails.
pub fn socket_send_buffer_size(socket: &TcpStream) -> usize {
    #[cfg(unix)]
    {
        socket_buffer_size(socket, libc::SO_SNDBUF)
    }
    #[cfg(not(unix))]
    {
        let _ = socket;
        0
    }
}

/// System receive-buffer size (`SO_RCVBUF`) of the socket, or 0 if the
/// query is unsupported or fails.
pub fn socket_recv_buffer_size(socket: &TcpStream) -> usize {
    #[cfg(unix)]
    {
        socket_buffer_size(socket, libc::SO_RCVBUF)
    }
    #[cfg(not(unix))]
    {
        let _ = socket;
        0
    }
}

#[cfg(unix)]
fn socket_buffer_size(socket: &TcpStream, option: libc::c_int) -> usize {
    use std::os::fd::AsRawFd;

    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;

    // SAFETY: `value` and `len` are valid writable pointers for the provided
    // sizes, and the descriptor is an open socket owned by this process.
    let rc = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            option,
            (&mut value as *mut libc::c_int).cast::<libc::c_void>(),
            &mut len,
        )
    };

    if rc == 0 && value > 0 {
        value as usize
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn direct_socket_connects_and_captures_addresses() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let echo = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).unwrap();
            sock.write_all(&buf).unwrap();
        });

        let strategy = TransportStrategy::DirectSocket {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
            tls: false,
        };
        let mut handle = strategy.establish().unwrap();
        assert_eq!(handle.server_ip_port, addr.to_string());
        assert!(handle.client_ip_port.starts_with("127.0.0.1:"));
        assert!(handle.tls_facts.is_none());
        let rendered = format!("{handle:?}");
        assert!(rendered.contains("ConnectionHandle"));
        assert!(rendered.contains(&handle.server_ip_port));

        handle.writer.write_all(b"hello").unwrap();
        handle.writer.flush().unwrap();
        let mut buf = [0u8; 5];
        handle.reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        echo.join().unwrap();
        drop(handle.reader);
        drop(handle.writer);
        handle.shutdown.release(None).unwrap();
    }

    #[test]
    fn resolution_failure_is_distinct_from_refusal() {
        let err = TransportStrategy::DirectSocket {
            host: "no-such-host.invalid".to_string(),
            port: 1,
            tls: false,
        }
        .establish()
        .unwrap_err();
        assert!(matches!(err, ConnectionError::Resolve { .. }));

        // Bind then drop to get a port nothing is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TransportStrategy::DirectSocket {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
            tls: false,
        }
        .establish()
        .unwrap_err();
        assert!(matches!(err, ConnectionError::Connect { .. }));
    }

    #[test]
    fn socket_buffer_sizes_are_nonzero_on_real_sockets() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accepter = std::thread::spawn(move || {
            let _held = listener.accept().unwrap();
        });

        let socket = TcpStream::connect(addr).unwrap();
        if cfg!(unix) {
            assert!(socket_send_buffer_size(&socket) > 0);
            assert!(socket_recv_buffer_size(&socket) > 0);
        } else {
            assert_eq!(socket_send_buffer_size(&socket), 0);
        }
        accepter.join().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn subprocess_pipe_round_trips_bytes() {
        let mut handle = TransportStrategy::SubprocessPipe {
            shell_command: "cat".to_string(),
        }
        .establish()
        .unwrap();
        assert_eq!(handle.server_ip_port, "unknown");
        assert!(handle.socket.is_none());

        handle.writer.write_all(b"ping").unwrap();
        handle.writer.flush().unwrap();
        let mut buf = [0u8; 4];
        handle.reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        // Close stdin so the child exits, then reap it.
        drop(handle.writer);
        drop(handle.reader);
        handle.shutdown.release(None).unwrap();
    }

    #[test]
    fn pooled_socket_releases_back_to_pool() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accepter = std::thread::spawn(move || {
            let _held = listener.accept().unwrap();
            std::thread::sleep(std::time::Duration::from_millis(200));
        });

        let pool = Arc::new(crate::pool::SimpleSocketPool::new(addr.to_string()));
        let handle = TransportStrategy::PooledSocket {
            pool: Arc::clone(&pool) as Arc<dyn SocketPool>,
            host: "127.0.0.1".to_string(),
            tls: false,
        }
        .establish()
        .unwrap();
        assert_eq!(handle.server_ip_port, addr.to_string());
        assert!(handle.tls_facts.is_none());

        drop(handle.reader);
        drop(handle.writer);
        handle.shutdown.release(None).unwrap();
        assert_eq!(pool.idle_count(), 1);
        accepter.join().unwrap();
    }

    #[test]
    fn pooled_socket_negotiates_tls_when_asked() {
        let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2099, 1, 1);
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        let cert_der = cert.der().clone().into_owned();
        let key_der =
            rustls::pki_types::PrivateKeyDer::try_from(key.serialize_der()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let server_config = rustls::ServerConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .unwrap();

            let (mut sock, _) = listener.accept().unwrap();
            let mut conn = rustls::ServerConnection::new(Arc::new(server_config)).unwrap();
            while conn.is_handshaking() {
                conn.complete_io(&mut sock).unwrap();
            }

            let mut stream = rustls::StreamOwned::new(conn, sock);
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let pool = Arc::new(crate::pool::SimpleSocketPool::new(addr.to_string()));
        let mut handle = TransportStrategy::PooledSocket {
            pool: Arc::clone(&pool) as Arc<dyn SocketPool>,
            host: "localhost".to_string(),
            tls: true,
        }
        .establish()
        .unwrap();
        assert!(handle.tls_facts.is_some());

        handle.writer.write_all(b"ping").unwrap();
        handle.writer.flush().unwrap();
        let mut buf = [0u8; 4];
        handle.reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        server.join().unwrap();
        drop(handle.reader);
        drop(handle.writer);
        handle.shutdown.release(None).unwrap();
        assert_eq!(pool.idle_count(), 1);
    }
}
