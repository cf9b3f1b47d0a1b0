use crate::error::{ProtocolError, Result};

/// Preamble size: payload length (4) + checksum (4) = 8 bytes.
pub const PREAMBLE_SIZE: usize = 8;

/// Default upper bound on a single payload's size. A checksum-valid length
/// is still attacker-controlled input; receivers refuse to allocate past
/// their configured limit.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// The fixed-size frame header carrying the payload length and a checksum
/// over the length bytes.
///
/// Wire format:
/// ```text
/// ┌────────────────────┬────────────────────┬──────────────────────┐
/// │ Payload size       │ Checksum           │ Payload              │
/// │ (4B LE)            │ (4B LE, CRC-32 of  │ (payload-size bytes) │
/// │                    │  the length bytes) │                      │
/// └────────────────────┴────────────────────┴──────────────────────┘
/// ```
///
/// A decoded preamble is always checksum-valid; frames that fail validation
/// never produce a `Preamble` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    /// Number of payload bytes following the preamble. Always positive.
    pub payload_size: u32,
}

impl Preamble {
    /// Encode a preamble for a payload of the given size.
    pub fn encode(payload_size: u32) -> [u8; PREAMBLE_SIZE] {
        let len_bytes = payload_size.to_le_bytes();
        let checksum = checksum_of(&len_bytes);

        let mut out = [0u8; PREAMBLE_SIZE];
        out[..4].copy_from_slice(&len_bytes);
        out[4..].copy_from_slice(&checksum.to_le_bytes());
        out
    }

    /// Decode and validate a preamble from the first `PREAMBLE_SIZE` bytes
    /// of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PREAMBLE_SIZE {
            return Err(ProtocolError::ShortPreamble {
                len: bytes.len(),
                need: PREAMBLE_SIZE,
            });
        }

        let len_bytes: [u8; 4] = bytes[..4].try_into().expect("slice length checked");
        let found = u32::from_le_bytes(bytes[4..8].try_into().expect("slice length checked"));
        let expected = checksum_of(&len_bytes);

        if found != expected {
            return Err(ProtocolError::BadChecksum { expected, found });
        }

        let payload_size = u32::from_le_bytes(len_bytes);
        if payload_size == 0 {
            return Err(ProtocolError::BadPayloadSize { size: payload_size });
        }

        Ok(Self { payload_size })
    }
}

fn checksum_of(len_bytes: &[u8; 4]) -> u32 {
    crc32fast::hash(len_bytes)
}
