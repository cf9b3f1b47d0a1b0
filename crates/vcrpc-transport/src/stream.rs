use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use rustls::{ClientConnection, StreamOwned};

/// Owned reading side of an established connection's byte stream.
pub type StreamReader = Box<dyn Read + Send>;

/// Owned writing side of an established connection's byte stream.
pub type StreamWriter = Box<dyn Write + Send>;

/// Shared handle to a blocking TLS stream.
///
/// rustls streams are full-duplex but single-object; the two halves below
/// share one under a mutex so the reader and writer can be owned separately.
/// Callers serialize packet I/O anyway, so the lock is uncontended.
pub(crate) type SharedTlsStream = Arc<Mutex<StreamOwned<ClientConnection, TcpStream>>>;

fn lock_poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "tls stream lock poisoned")
}

/// Read half of a [`SharedTlsStream`].
pub(crate) struct TlsReadHalf(pub(crate) SharedTlsStream);

impl Read for TlsReadHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self.0.lock().map_err(|_| lock_poisoned())?;
        stream.read(buf)
    }
}

/// Write half of a [`SharedTlsStream`].
pub(crate) struct TlsWriteHalf(pub(crate) SharedTlsStream);

impl Write for TlsWriteHalf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut stream = self.0.lock().map_err(|_| lock_poisoned())?;
        stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut stream = self.0.lock().map_err(|_| lock_poisoned())?;
        stream.flush()
    }
}
