use std::io::{self, Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use vcrpc_transport::{StreamReader, StreamWriter};

/// The connection's owned byte-stream pair.
///
/// Starts `Raw`; the one-shot compression upgrade replaces it with gzip
/// wrappers around the same streams. There is no way back to `Raw`.
pub(crate) enum StreamPair {
    Raw {
        reader: StreamReader,
        writer: StreamWriter,
    },
    Compressed {
        reader: LazyGzDecoder,
        writer: GzEncoder<StreamWriter>,
    },
}

/// Gzip reader whose inner decoder is built on the first read.
///
/// `GzDecoder::new` eagerly reads the gzip header off the stream, but at
/// upgrade time the peer has not sent any compressed bytes yet, so eager
/// construction would block inside the upgrade call. Deferring it to the
/// first read means the header is consumed only once a reply is expected.
pub(crate) struct LazyGzDecoder {
    raw: Option<StreamReader>,
    decoder: Option<GzDecoder<StreamReader>>,
}

impl LazyGzDecoder {
    fn new(raw: StreamReader) -> Self {
        Self {
            raw: Some(raw),
            decoder: None,
        }
    }
}

impl Read for LazyGzDecoder {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(raw) = self.raw.take() {
            self.decoder = Some(GzDecoder::new(raw));
        }
        match self.decoder.as_mut() {
            Some(decoder) => decoder.read(buf),
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                "gzip reader not initialized",
            )),
        }
    }
}

impl StreamPair {
    pub(crate) fn reader(&mut self) -> &mut dyn Read {
        match self {
            Self::Raw { reader, .. } => reader,
            Self::Compressed { reader, .. } => reader,
        }
    }

    pub(crate) fn writer(&mut self) -> &mut dyn Write {
        match self {
            Self::Raw { writer, .. } => writer,
            Self::Compressed { writer, .. } => writer,
        }
    }

    pub(crate) fn is_compressed(&self) -> bool {
        matches!(self, Self::Compressed { .. })
    }

    /// Wrap both directions in gzip. Idempotent.
    pub(crate) fn upgrade(self) -> Self {
        match self {
            Self::Raw { reader, writer } => Self::Compressed {
                reader: LazyGzDecoder::new(reader),
                writer: GzEncoder::new(writer, Compression::default()),
            },
            compressed => compressed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn upgrade_is_one_way_and_idempotent() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let pair = StreamPair::Raw {
            reader: Box::new(io::empty()),
            writer: Box::new(SharedSink(Arc::clone(&sink))),
        };
        assert!(!pair.is_compressed());

        let pair = pair.upgrade();
        assert!(pair.is_compressed());
        let pair = pair.upgrade();
        assert!(pair.is_compressed());
    }

    /// Reader that records whether it was ever read from.
    struct TrackingReader {
        touched: Arc<std::sync::atomic::AtomicBool>,
    }

    impl Read for TrackingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            self.touched
                .store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(0)
        }
    }

    #[test]
    fn upgrade_does_not_read_from_the_stream() {
        let touched = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let pair = StreamPair::Raw {
            reader: Box::new(TrackingReader {
                touched: Arc::clone(&touched),
            }),
            writer: Box::new(io::sink()),
        };

        let pair = pair.upgrade();
        assert!(pair.is_compressed());
        assert!(
            !touched.load(std::sync::atomic::Ordering::SeqCst),
            "upgrade must not consume bytes before a reply is expected"
        );
    }

    #[test]
    fn lazy_reader_decodes_on_first_read() {
        let mut gzipped = Vec::new();
        {
            let mut enc = GzEncoder::new(&mut gzipped, Compression::default());
            enc.write_all(b"deferred header").unwrap();
            enc.finish().unwrap();
        }

        let mut pair = StreamPair::Raw {
            reader: Box::new(io::Cursor::new(gzipped)),
            writer: Box::new(io::sink()),
        }
        .upgrade();

        let mut out = vec![0u8; b"deferred header".len()];
        pair.reader().read_exact(&mut out).unwrap();
        assert_eq!(out.as_slice(), b"deferred header");
    }

    #[test]
    fn compressed_writes_decode_after_sync_flush() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut pair = StreamPair::Raw {
            reader: Box::new(io::empty()),
            writer: Box::new(SharedSink(Arc::clone(&sink))),
        }
        .upgrade();

        pair.writer().write_all(b"compressible payload").unwrap();
        pair.writer().flush().unwrap();

        let wire = sink.lock().unwrap().clone();
        assert_ne!(wire.as_slice(), b"compressible payload");

        let mut decoder = GzDecoder::new(wire.as_slice());
        let mut out = vec![0u8; b"compressible payload".len()];
        decoder.read_exact(&mut out).unwrap();
        assert_eq!(out.as_slice(), b"compressible payload");
    }
}
