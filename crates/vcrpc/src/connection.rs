use std::io::{self, Read};
use std::net::TcpStream;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};
use vcrpc_transport::{
    socket_recv_buffer_size, socket_send_buffer_size, ConnectionError, ReleaseHook,
    ShutdownResource, StreamReader, StreamWriter, TlsSessionFacts,
};
use vcrpc_wire::{
    DecodedPacket, FieldRule, FilterCallback, Packet, PacketAssembler, Preamble, ProtocolError,
    TextCodec, Utf8Codec, COMPRESS_FUNCTION, DEFAULT_MAX_PAYLOAD_SIZE, PREAMBLE_SIZE,
};

use crate::compress::StreamPair;
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::stats::ConnectionStats;

/// A single logical RPC connection to the server.
///
/// All packet I/O takes `&mut self`: the connection is one byte stream and
/// concurrent use would interleave frames. The shared [`ConnectionStats`]
/// are atomic so other threads can observe traffic while I/O is in flight.
///
/// Lifecycle is `Open`, optionally upgraded (one way) to compressed, then
/// `Closed` by [`disconnect`](Self::disconnect) or by a fatal stream error.
/// Every operation on a closed connection fails with
/// [`ConnectionError::AlreadyDisconnected`].
pub struct Connection {
    streams: Option<StreamPair>,
    shutdown: Option<ShutdownResource>,
    socket: Option<TcpStream>,
    stats: Arc<ConnectionStats>,
    codec: Arc<dyn TextCodec>,
    assembler: PacketAssembler,
    server_ip_port: String,
    client_ip_port: String,
    tls_facts: Option<TlsSessionFacts>,
    secure: bool,
    max_payload_size: usize,
}

enum FrameReadError {
    Closed,
    Eof,
    Io(io::Error),
    Protocol(ProtocolError),
}

impl Connection {
    /// Establish a connection per `config`, with UTF-8 text conversion.
    pub fn connect(config: &ConnectionConfig, stats: Arc<ConnectionStats>) -> Result<Self> {
        Self::connect_with_codec(config, stats, Arc::new(Utf8Codec))
    }

    /// Establish a connection with an explicit text codec for non-unicode
    /// charset sessions.
    pub fn connect_with_codec(
        config: &ConnectionConfig,
        stats: Arc<ConnectionStats>,
        codec: Arc<dyn TextCodec>,
    ) -> Result<Self> {
        let handle = config
            .strategy()
            .establish()
            .map_err(Error::from_transport)?;
        stats.inc_connections();

        Ok(Self {
            streams: Some(StreamPair::Raw {
                reader: handle.reader,
                writer: handle.writer,
            }),
            shutdown: Some(handle.shutdown),
            socket: handle.socket,
            stats,
            codec,
            assembler: PacketAssembler::with_capacity(
                config.send_buffer_initial(),
                config.send_buffer_growth(),
            ),
            server_ip_port: handle.server_ip_port,
            client_ip_port: handle.client_ip_port,
            tls_facts: handle.tls_facts,
            secure: config.is_secure(),
            max_payload_size: config.max_payload(),
        })
    }

    /// Build a connection directly from a stream pair, with no teardown
    /// resource behind it. A seam for tests that stub the transport.
    pub fn from_parts(
        reader: StreamReader,
        writer: StreamWriter,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.inc_connections();
        Self {
            streams: Some(StreamPair::Raw { reader, writer }),
            shutdown: None,
            socket: None,
            stats,
            codec: Arc::new(Utf8Codec),
            assembler: PacketAssembler::new(),
            server_ip_port: "unknown".to_string(),
            client_ip_port: "unknown".to_string(),
            tls_facts: None,
            secure: false,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Receive the next packet.
    pub fn get_rpc_packet(&mut self) -> Result<DecodedPacket> {
        self.get_rpc_packet_filtered(None, None)
    }

    /// Receive the next packet with per-field hooks: `rule` can suppress
    /// text conversion, `filter` can drop fields during parsing.
    pub fn get_rpc_packet_filtered(
        &mut self,
        rule: Option<&mut dyn FieldRule>,
        filter: Option<&mut dyn FilterCallback>,
    ) -> Result<DecodedPacket> {
        let payload = match self.read_frame() {
            Ok(payload) => payload,
            Err(FrameReadError::Closed) => {
                return Err(ConnectionError::AlreadyDisconnected.into())
            }
            Err(FrameReadError::Eof) => {
                warn!(server = %self.server_ip_port, "peer closed mid-packet");
                self.fatal_close();
                return Err(ConnectionError::UnexpectedClose.into());
            }
            Err(FrameReadError::Io(e)) => {
                self.fatal_close();
                return Err(ConnectionError::Io(e).into());
            }
            Err(FrameReadError::Protocol(e)) => {
                // A bad preamble means the stream is no longer framed; there
                // is no way to resynchronize.
                self.fatal_close();
                return Err(e.into());
            }
        };

        self.stats
            .record_received((PREAMBLE_SIZE + payload.len()) as u64);

        // Field-level parse errors leave the connection open: the frame
        // boundary was intact, so the next read starts at a preamble.
        let packet = DecodedPacket::parse(payload, self.codec.as_ref(), rule, filter)?;
        Ok(packet)
    }

    fn read_frame(&mut self) -> std::result::Result<Bytes, FrameReadError> {
        let Self {
            streams,
            stats,
            max_payload_size,
            ..
        } = self;
        let streams = streams.as_mut().ok_or(FrameReadError::Closed)?;
        let reader = streams.reader();

        let mut preamble_buf = [0u8; PREAMBLE_SIZE];
        read_fully(reader, &mut preamble_buf, stats, false)?;
        let preamble = Preamble::decode(&preamble_buf).map_err(FrameReadError::Protocol)?;

        // A checksum-valid length is still untrusted; refuse to allocate
        // past the configured limit.
        if preamble.payload_size as usize > *max_payload_size {
            return Err(FrameReadError::Protocol(ProtocolError::OversizedPayload {
                size: preamble.payload_size,
                max: *max_payload_size,
            }));
        }

        let mut payload = vec![0u8; preamble.payload_size as usize];
        read_fully(reader, &mut payload, stats, true)?;
        Ok(Bytes::from(payload))
    }

    /// Marshal and send one packet. Returns the number of bytes put on the
    /// wire, preamble included.
    pub fn put_rpc_packet(&mut self, packet: &Packet) -> Result<u64> {
        let (len, write_result) = {
            let Self {
                streams,
                stats,
                assembler,
                codec,
                ..
            } = self;
            let streams = streams
                .as_mut()
                .ok_or(ConnectionError::AlreadyDisconnected)?;

            let wire = assembler.assemble(packet, codec.as_ref(), || stats.inc_buffer_compacts())?;
            stats.inc_stream_sends();
            let writer = streams.writer();
            let result = writer.write_all(wire).and_then(|()| writer.flush());
            (wire.len() as u64, result)
        };

        match write_result {
            Ok(()) => {
                self.stats.record_sent(len);
                Ok(len)
            }
            Err(e) => {
                let secure = self.secure;
                self.fatal_close();
                let err = if secure
                    && matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
                {
                    ConnectionError::SecureWriteTimeout(e)
                } else {
                    ConnectionError::Io(e)
                };
                Err(err.into())
            }
        }
    }

    /// Send several packets strictly in order. Aborts on the first failure;
    /// the return value on success is the total bytes written, and on error
    /// nothing reports how many packets made it out.
    pub fn put_rpc_packets(&mut self, packets: &[Packet]) -> Result<u64> {
        let mut total = 0u64;
        for packet in packets {
            total += self.put_rpc_packet(packet)?;
        }
        Ok(total)
    }

    /// Switch the connection to gzip compression.
    ///
    /// Announces the switch to the server with an uncompressed
    /// `compress2` packet, then wraps both stream directions. Idempotent;
    /// there is no way to switch back.
    pub fn use_connection_compression(&mut self) -> Result<()> {
        match &self.streams {
            None => return Err(ConnectionError::AlreadyDisconnected.into()),
            Some(pair) if pair.is_compressed() => return Ok(()),
            Some(_) => {}
        }

        // put_rpc_packet flushes, so the announcement fully leaves the raw
        // writer before the gzip wrapper takes over.
        self.put_rpc_packet(&Packet::new(COMPRESS_FUNCTION))?;

        let Some(pair) = self.streams.take() else {
            return Err(ConnectionError::AlreadyDisconnected.into());
        };
        self.streams = Some(pair.upgrade());
        debug!(server = %self.server_ip_port, "connection compression enabled");
        Ok(())
    }

    /// Tear the connection down.
    pub fn disconnect(&mut self) -> Result<()> {
        self.disconnect_with(None)
    }

    /// Tear the connection down, running `hook` exactly once during the
    /// release (for pooled connections the pool invokes it before the
    /// socket becomes leasable again).
    ///
    /// A second disconnect fails with `AlreadyDisconnected` and does not
    /// run the hook.
    pub fn disconnect_with(&mut self, hook: Option<ReleaseHook>) -> Result<()> {
        let Some(mut pair) = self.streams.take() else {
            return Err(ConnectionError::AlreadyDisconnected.into());
        };

        let _ = pair.writer().flush();
        // Drop the stream halves before releasing so a subprocess transport
        // sees stdin EOF and can exit.
        drop(pair);
        self.socket = None;

        let result = match self.shutdown.take() {
            Some(resource) => resource.release(hook).map_err(Error::from_transport),
            None => {
                if let Some(hook) = hook {
                    hook();
                }
                Ok(())
            }
        };
        info!(server = %self.server_ip_port, "disconnected");
        result
    }

    /// Release everything after an unrecoverable stream error. No hook
    /// runs; teardown failures are logged and swallowed since the caller
    /// already has the primary error.
    fn fatal_close(&mut self) {
        self.streams = None;
        self.socket = None;
        if let Some(resource) = self.shutdown.take() {
            if let Err(e) = resource.release(None) {
                debug!(error = %e, "teardown after fatal error failed");
            }
        }
    }

    /// Whether the connection is still usable.
    pub fn is_connected(&self) -> bool {
        self.streams.is_some()
    }

    /// Whether the compression upgrade has happened.
    pub fn is_compressed(&self) -> bool {
        self.streams
            .as_ref()
            .is_some_and(StreamPair::is_compressed)
    }

    /// Peer address as `ip:port`, or `"unknown"` for pipe transports.
    pub fn server_ip_port(&self) -> &str {
        &self.server_ip_port
    }

    /// Local address as `ip:port`, or `"unknown"` for pipe transports.
    pub fn client_ip_port(&self) -> &str {
        &self.client_ip_port
    }

    /// Facts about the negotiated TLS session, when TLS is in use.
    pub fn tls_session_facts(&self) -> Option<&TlsSessionFacts> {
        self.tls_facts.as_ref()
    }

    /// Kernel send-buffer size of the underlying socket, or 0 when no
    /// socket exists.
    pub fn system_send_buffer_size(&self) -> usize {
        self.socket.as_ref().map_or(0, socket_send_buffer_size)
    }

    /// Kernel receive-buffer size of the underlying socket, or 0 when no
    /// socket exists.
    pub fn system_recv_buffer_size(&self) -> usize {
        self.socket.as_ref().map_or(0, socket_recv_buffer_size)
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }
}

/// Fill `buf` from `reader`, retrying interrupted and short reads.
///
/// `Ok(0)` from the reader means the peer closed mid-frame.
fn read_fully(
    reader: &mut dyn Read,
    buf: &mut [u8],
    stats: &ConnectionStats,
    count_incomplete: bool,
) -> std::result::Result<(), FrameReadError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(FrameReadError::Eof),
            Ok(n) => {
                stats.inc_stream_recvs();
                filled += n;
                if count_incomplete && filled < buf.len() {
                    stats.inc_incomplete_reads();
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FrameReadError::Io(e)),
        }
    }
    Ok(())
}
