//! Length-prefixed packet framing and field marshaling for the vcrpc wire
//! protocol.
//!
//! Every packet on the wire is framed with:
//! - A 4-byte little-endian payload length
//! - A 4-byte little-endian CRC32 checksum of the length bytes
//!
//! followed by a flat sequence of fields, each shaped
//! `[name] 0x00 [len u32 LE] [value] 0x00`. The function name travels as an
//! ordinary field keyed `func`, always marshaled last.

pub mod error;
pub mod field;
pub mod packet;
pub mod preamble;

pub use error::{ProgrammingError, ProtocolError, Result};
pub use field::{marshal_field, read_field, FieldRule, TextCodec, Utf8Codec, Value};
pub use packet::{
    DecodedPacket, EnvBlock, FilterCallback, Packet, PacketAssembler, SessionEnv,
    COMPRESS_FUNCTION, FUNCTION2_KEY, FUNCTION_KEY, INITIAL_SEND_BUFFER_SIZE,
    SEND_BUFFER_GROWTH_INCREMENT,
};
pub use preamble::{Preamble, DEFAULT_MAX_PAYLOAD_SIZE, PREAMBLE_SIZE};
