use bytes::{Buf, Bytes};

use crate::error::{ProtocolError, Result};

/// Length in bytes of the value-length prefix inside a marshaled field.
pub const LENGTH_FIELD_SIZE: usize = 4;

/// One field value as it exists on the wire: either session-charset text or
/// raw bytes (typically file content) that must not be charset-translated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// The value's byte representation under the given codec.
    pub fn to_wire_bytes(&self, codec: &dyn TextCodec) -> Vec<u8> {
        match self {
            Value::Text(text) => codec.encode(text),
            Value::Bytes(bytes) => bytes.clone(),
        }
    }

    /// Borrow the text content, if any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            Value::Bytes(_) => None,
        }
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Text(text.to_string())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Text(text)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

/// Charset seam between wire bytes and session strings.
///
/// The full locale translation tables live outside this layer; sessions to a
/// Unicode-enabled peer use [`Utf8Codec`], and other charsets plug in here.
pub trait TextCodec: Send + Sync {
    /// Encode session text into wire bytes.
    fn encode(&self, text: &str) -> Vec<u8>;

    /// Decode wire bytes into session text, or `None` if the bytes are not
    /// representable (the value is then kept as raw bytes).
    fn decode(&self, bytes: &[u8]) -> Option<String>;
}

/// Strict UTF-8 codec, the wire charset of Unicode-enabled peers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl TextCodec for Utf8Codec {
    fn encode(&self, text: &str) -> Vec<u8> {
        text.as_bytes().to_vec()
    }

    fn decode(&self, bytes: &[u8]) -> Option<String> {
        std::str::from_utf8(bytes).ok().map(str::to_string)
    }
}

/// Per-field hook controlling charset conversion on the receive path.
///
/// The rule is fed every field name in payload order and may mark stretches
/// of fields whose values must stay raw bytes. The selection logic itself is
/// a caller concern; this layer only consults the flag.
pub trait FieldRule {
    /// Observe the next field name (or `None` for a positional field).
    fn update(&mut self, name: Option<&str>);

    /// Whether the current field's value must skip text conversion.
    fn skip_conversion(&self) -> bool;
}

/// Marshal one field into its wire form:
/// `[name bytes] 0x00 [value-length LE] [value bytes] 0x00`.
///
/// `name` is omitted (leading NUL only) for positional fields. The value
/// length excludes the trailing NUL.
pub fn marshal_field(name: Option<&str>, value: &Value, codec: &dyn TextCodec) -> Vec<u8> {
    let name_bytes = name.map(|n| codec.encode(n));
    let value_bytes = value.to_wire_bytes(codec);

    let name_len = name_bytes.as_ref().map_or(0, Vec::len);
    let mut out = Vec::with_capacity(name_len + 2 + LENGTH_FIELD_SIZE + value_bytes.len());

    if let Some(name_bytes) = name_bytes {
        out.extend_from_slice(&name_bytes);
    }
    out.push(0);
    out.extend_from_slice(&(value_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&value_bytes);
    out.push(0);
    out
}

/// Read one field off the front of `buf`, advancing it past the field.
///
/// Returns the optional field name and its value. Text conversion is applied
/// through `codec` unless the `rule` marks the field as raw.
pub fn read_field(
    buf: &mut Bytes,
    codec: &dyn TextCodec,
    rule: Option<&mut dyn FieldRule>,
) -> Result<(Option<String>, Value)> {
    let name_end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::UnterminatedFieldName)?;

    let name = if name_end > 0 {
        let name_bytes = buf.split_to(name_end);
        Some(
            codec
                .decode(&name_bytes)
                .ok_or(ProtocolError::UndecodableFieldName)?,
        )
    } else {
        None
    };
    buf.advance(1); // name terminator

    if buf.remaining() < LENGTH_FIELD_SIZE {
        return Err(ProtocolError::TruncatedField {
            need: LENGTH_FIELD_SIZE,
            remaining: buf.remaining(),
        });
    }
    let value_len = buf.get_u32_le() as usize;

    // Value bytes plus the trailing NUL.
    if buf.remaining() < value_len + 1 {
        return Err(ProtocolError::TruncatedField {
            need: value_len + 1,
            remaining: buf.remaining(),
        });
    }
    let value_bytes = buf.split_to(value_len);
    buf.advance(1); // value terminator

    let skip_conversion = match rule {
        Some(rule) => {
            rule.update(name.as_deref());
            rule.skip_conversion()
        }
        None => false,
    };

    let value = if skip_conversion {
        Value::Bytes(value_bytes.to_vec())
    } else {
        match codec.decode(&value_bytes) {
            Some(text) => Value::Text(text),
            None => Value::Bytes(value_bytes.to_vec()),
        }
    };

    Ok((name, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_field_roundtrip() {
        let wire = marshal_field(Some("client"), &Value::from("ws-main"), &Utf8Codec);
        let mut buf = Bytes::from(wire);

        let (name, value) = read_field(&mut buf, &Utf8Codec, None).unwrap();
        assert_eq!(name.as_deref(), Some("client"));
        assert_eq!(value, Value::from("ws-main"));
        assert!(buf.is_empty());
    }

    #[test]
    fn positional_field_roundtrip() {
        let wire = marshal_field(None, &Value::from("//depot/..."), &Utf8Codec);
        assert_eq!(wire[0], 0); // no name, leading terminator only

        let mut buf = Bytes::from(wire);
        let (name, value) = read_field(&mut buf, &Utf8Codec, None).unwrap();
        assert_eq!(name, None);
        assert_eq!(value, Value::from("//depot/..."));
    }

    #[test]
    fn empty_value_roundtrip() {
        let wire = marshal_field(Some("tag"), &Value::from(""), &Utf8Codec);
        let mut buf = Bytes::from(wire);

        let (name, value) = read_field(&mut buf, &Utf8Codec, None).unwrap();
        assert_eq!(name.as_deref(), Some("tag"));
        assert_eq!(value, Value::from(""));
    }

    #[test]
    fn binary_value_kept_as_bytes() {
        let payload = vec![0xFF, 0xFE, 0x00, 0x01];
        let wire = marshal_field(Some("data"), &Value::Bytes(payload.clone()), &Utf8Codec);
        let mut buf = Bytes::from(wire);

        let (_, value) = read_field(&mut buf, &Utf8Codec, None).unwrap();
        assert_eq!(value, Value::Bytes(payload));
    }

    #[test]
    fn value_length_excludes_terminator() {
        let wire = marshal_field(Some("k"), &Value::from("abc"), &Utf8Codec);
        // name(1) + NUL(1), then the 4-byte length prefix
        let len = u32::from_le_bytes(wire[2..6].try_into().unwrap());
        assert_eq!(len, 3);
    }

    #[test]
    fn unterminated_name_rejected() {
        let mut buf = Bytes::from_static(b"never-terminated");
        let err = read_field(&mut buf, &Utf8Codec, None).unwrap_err();
        assert!(matches!(err, ProtocolError::UnterminatedFieldName));
    }

    #[test]
    fn truncated_length_rejected() {
        let mut wire = marshal_field(Some("k"), &Value::from("abc"), &Utf8Codec);
        wire.truncate(4); // into the length prefix
        let mut buf = Bytes::from(wire);
        let err = read_field(&mut buf, &Utf8Codec, None).unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedField { .. }));
    }

    #[test]
    fn truncated_value_rejected() {
        let mut wire = marshal_field(Some("k"), &Value::from("abcdef"), &Utf8Codec);
        let cut = wire.len() - 3;
        wire.truncate(cut);
        let mut buf = Bytes::from(wire);
        let err = read_field(&mut buf, &Utf8Codec, None).unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedField { .. }));
    }

    #[test]
    fn field_rule_forces_raw_bytes() {
        struct RawEverything;
        impl FieldRule for RawEverything {
            fn update(&mut self, _name: Option<&str>) {}
            fn skip_conversion(&self) -> bool {
                true
            }
        }

        let wire = marshal_field(Some("depotFile"), &Value::from("//depot/a"), &Utf8Codec);
        let mut buf = Bytes::from(wire);
        let mut rule = RawEverything;

        let (_, value) = read_field(&mut buf, &Utf8Codec, Some(&mut rule)).unwrap();
        assert_eq!(value, Value::Bytes(b"//depot/a".to_vec()));
    }
}
