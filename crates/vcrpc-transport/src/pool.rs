use std::io;
use std::net::TcpStream;
use std::sync::Mutex;

use tracing::debug;

/// A callback run when a pooled connection is handed back.
pub type ReleaseHook = Box<dyn FnOnce() + Send>;

/// External socket pool boundary.
///
/// A pool owns the sockets; the connection leases one for its lifetime and
/// hands it back on disconnect instead of closing it. Eviction and health
/// checking belong to the pool implementation.
pub trait SocketPool: Send + Sync {
    /// Lease a connected socket.
    fn acquire(&self) -> io::Result<TcpStream>;

    /// Return a leased socket. `hook` is the caller's shutdown callback and
    /// must run exactly once, before the socket becomes leasable again.
    fn release(&self, socket: TcpStream, hook: Option<ReleaseHook>);
}

/// Minimal pool: a locked stack of idle sockets, refilled by connecting to
/// a fixed address when empty.
pub struct SimpleSocketPool {
    addr: String,
    idle: Mutex<Vec<TcpStream>>,
}

impl SimpleSocketPool {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Number of idle sockets currently held.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|v| v.len()).unwrap_or(0)
    }
}

impl SocketPool for SimpleSocketPool {
    fn acquire(&self) -> io::Result<TcpStream> {
        if let Ok(mut idle) = self.idle.lock() {
            if let Some(socket) = idle.pop() {
                debug!(addr = %self.addr, "reusing pooled socket");
                return Ok(socket);
            }
        }
        debug!(addr = %self.addr, "pool empty, dialing");
        TcpStream::connect(&self.addr)
    }

    fn release(&self, socket: TcpStream, hook: Option<ReleaseHook>) {
        if let Some(hook) = hook {
            hook();
        }
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(socket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn released_socket_is_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accepter = std::thread::spawn(move || {
            // At most one accept: the second acquire must reuse.
            let _held = listener.accept().unwrap();
            std::thread::sleep(std::time::Duration::from_millis(200));
        });

        let pool = SimpleSocketPool::new(addr.to_string());
        let first = pool.acquire().unwrap();
        let first_local = first.local_addr().unwrap();
        pool.release(first, None);
        assert_eq!(pool.idle_count(), 1);

        let second = pool.acquire().unwrap();
        assert_eq!(second.local_addr().unwrap(), first_local);
        assert_eq!(pool.idle_count(), 0);
        accepter.join().unwrap();
    }

    #[test]
    fn release_runs_hook_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accepter = std::thread::spawn(move || {
            let _held = listener.accept().unwrap();
        });

        let pool = SimpleSocketPool::new(addr.to_string());
        let socket = pool.acquire().unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_hook = Arc::clone(&calls);
        pool.release(
            socket,
            Some(Box::new(move || {
                calls_in_hook.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        accepter.join().unwrap();
    }
}
