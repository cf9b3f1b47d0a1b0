use std::collections::HashMap;

use bytes::Bytes;
use tracing::debug;

use crate::error::{ProgrammingError, Result};
use crate::field::{marshal_field, read_field, FieldRule, TextCodec, Value};
use crate::preamble::{Preamble, PREAMBLE_SIZE};

/// Reserved field name carrying the packet's function. Always marshaled last.
pub const FUNCTION_KEY: &str = "func";

/// Reserved field name a proxy may duplicate; only the first value counts.
pub const FUNCTION2_KEY: &str = "func2";

/// Function name of the compression-switch announcement packet.
pub const COMPRESS_FUNCTION: &str = "compress2";

/// Initial send-buffer allocation for packet marshaling. A guessed
/// compromise between over-allocation and frequent resizing.
pub const INITIAL_SEND_BUFFER_SIZE: usize = 2048;

/// How much larger than the overflowing field each reallocated send buffer
/// grows beyond the current size.
pub const SEND_BUFFER_GROWTH_INCREMENT: usize = 1024;

/// One outgoing protocol message: a function invocation with named
/// arguments, positional arguments, and an optional client environment
/// block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Packet {
    function_name: String,
    map_args: Vec<(String, Value)>,
    str_args: Vec<Option<String>>,
    env: Option<EnvBlock>,
}

impl Packet {
    /// Create a packet for the named function.
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            ..Self::default()
        }
    }

    /// Append a named argument. Insertion order is preserved on the wire.
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.map_args.push((name.into(), value.into()));
        self
    }

    /// Append a positional argument. `None` entries are skipped on the wire.
    pub fn str_arg(mut self, value: Option<&str>) -> Self {
        self.str_args.push(value.map(str::to_string));
        self
    }

    /// Attach the client environment block.
    pub fn env(mut self, env: EnvBlock) -> Self {
        self.env = Some(env);
        self
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn map_args(&self) -> &[(String, Value)] {
        &self.map_args
    }

    pub fn str_args(&self) -> &[Option<String>] {
        &self.str_args
    }

    pub fn env_block(&self) -> Option<&EnvBlock> {
        self.env.as_ref()
    }
}

/// Opaque client-environment bytes appended verbatim to the packet body,
/// between the positional arguments and the function-name field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvBlock(Vec<u8>);

impl EnvBlock {
    /// Wrap pre-marshaled environment bytes.
    pub fn from_raw(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Marshal name/value pairs into an environment block.
    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
        codec: &dyn TextCodec,
    ) -> Self {
        let mut bytes = Vec::new();
        for (name, value) in pairs {
            bytes.extend_from_slice(&marshal_field(Some(name), &Value::from(value), codec));
        }
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The client state sent alongside the initial command of a session.
#[derive(Debug, Clone, Default)]
pub struct SessionEnv {
    pub user: String,
    pub client: String,
    pub cwd: String,
    pub host: String,
    pub os: String,
}

impl SessionEnv {
    /// Marshal this environment into an [`EnvBlock`].
    pub fn to_env_block(&self, codec: &dyn TextCodec) -> EnvBlock {
        EnvBlock::from_pairs(
            [
                ("user", self.user.as_str()),
                ("client", self.client.as_str()),
                ("cwd", self.cwd.as_str()),
                ("host", self.host.as_str()),
                ("os", self.os.as_str()),
            ],
            codec,
        )
    }
}

/// Receive-path hook allowing the caller to drop fields during parsing.
///
/// Protocol bookkeeping fields (`func`, `func2`) and any keys the callback
/// lists as must-keep are never offered for skipping.
pub trait FilterCallback {
    /// Keys that must survive filtering in addition to the protocol keys.
    fn must_keep(&self, _name: &str) -> bool {
        false
    }

    /// Decide whether to drop this field. Setting `skip_subsequent` drops
    /// every later skippable field without further callbacks.
    fn skip(&mut self, name: Option<&str>, value: &Value, skip_subsequent: &mut bool) -> bool;

    /// Called once after the packet is fully parsed.
    fn reset(&mut self);
}

/// Marshals packets into framed wire bytes, growing its send buffer as
/// fields are appended.
///
/// The preamble slot is reserved at offset 0 before marshaling and
/// back-patched once the payload length is known. Whenever the remaining
/// capacity is no larger than the next field, the buffer is reallocated to
/// `current + field + growth_increment` and the written prefix copied over,
/// which bounds reallocations to O(log(final/initial)) rather than
/// one-per-field.
#[derive(Debug)]
pub struct PacketAssembler {
    buf: Vec<u8>,
    pos: usize,
    growth_increment: usize,
}

impl Default for PacketAssembler {
    fn default() -> Self {
        Self::with_capacity(INITIAL_SEND_BUFFER_SIZE, SEND_BUFFER_GROWTH_INCREMENT)
    }
}

impl PacketAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an assembler with explicit initial capacity and growth
    /// increment (tuning knobs; the defaults suit typical command traffic).
    pub fn with_capacity(initial: usize, growth_increment: usize) -> Self {
        Self {
            buf: vec![0u8; initial.max(PREAMBLE_SIZE)],
            pos: 0,
            growth_increment,
        }
    }

    /// Marshal `packet` into a complete frame and return the wire bytes.
    ///
    /// `on_grow` is invoked once per buffer reallocation so the caller can
    /// keep its buffer-compact counter.
    pub fn assemble(
        &mut self,
        packet: &Packet,
        codec: &dyn TextCodec,
        mut on_grow: impl FnMut(),
    ) -> std::result::Result<&[u8], ProgrammingError> {
        if packet.function_name().is_empty() {
            return Err(ProgrammingError::EmptyFunctionName);
        }

        // Skip over the preamble slot; it is filled in last.
        self.pos = PREAMBLE_SIZE;

        // Fixed wire order: map args, positional args, environment block,
        // function name last.
        for (name, value) in packet.map_args() {
            let field = marshal_field(Some(name), value, codec);
            self.append(&field, &mut on_grow);
        }
        for arg in packet.str_args() {
            if let Some(arg) = arg {
                let field = marshal_field(None, &Value::from(arg.as_str()), codec);
                self.append(&field, &mut on_grow);
            }
        }
        if let Some(env) = packet.env_block() {
            self.append(env.as_bytes(), &mut on_grow);
        }
        let func_field = marshal_field(
            Some(FUNCTION_KEY),
            &Value::from(packet.function_name()),
            codec,
        );
        self.append(&func_field, &mut on_grow);

        let payload_size = (self.pos - PREAMBLE_SIZE) as u32;
        self.buf[..PREAMBLE_SIZE].copy_from_slice(&Preamble::encode(payload_size));

        Ok(&self.buf[..self.pos])
    }

    fn append(&mut self, field: &[u8], on_grow: &mut impl FnMut()) {
        if self.buf.len() - self.pos <= field.len() {
            on_grow();
            let new_len = self.buf.len() + field.len() + self.growth_increment;
            debug!(
                from = self.buf.len(),
                to = new_len,
                "growing packet send buffer"
            );
            let mut new_buf = vec![0u8; new_len];
            new_buf[..self.pos].copy_from_slice(&self.buf[..self.pos]);
            self.buf = new_buf;
        }

        self.buf[self.pos..self.pos + field.len()].copy_from_slice(field);
        self.pos += field.len();
    }
}

/// One inbound protocol message: the flat field sequence off the wire plus
/// the extracted function name.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    fields: Vec<(Option<String>, Value)>,
    function_name: Option<String>,
    payload_size: usize,
}

impl DecodedPacket {
    /// Parse a frame payload into a packet.
    ///
    /// `rule` and `filter` are caller-supplied pass-through hooks; see
    /// [`FieldRule`] and [`FilterCallback`].
    pub fn parse(
        payload: Bytes,
        codec: &dyn TextCodec,
        mut rule: Option<&mut dyn FieldRule>,
        mut filter: Option<&mut dyn FilterCallback>,
    ) -> Result<Self> {
        let payload_size = payload.len();
        let mut buf = payload;
        let mut fields = Vec::new();
        let mut skip_subsequent = false;

        while !buf.is_empty() {
            // Reborrow the hooks each iteration; handing the originals to
            // read_field would pin them for the rest of the loop.
            let rule_reborrow = match rule.as_mut() {
                Some(rule) => Some(&mut **rule as &mut dyn FieldRule),
                None => None,
            };
            let (name, value) = read_field(&mut buf, codec, rule_reborrow)?;

            if let Some(filter) = filter.as_mut() {
                let filter: &mut dyn FilterCallback = &mut **filter;
                let protected = name
                    .as_deref()
                    .is_some_and(|n| is_protocol_key(n) || filter.must_keep(n));
                if !protected {
                    if skip_subsequent {
                        continue;
                    }
                    if filter.skip(name.as_deref(), &value, &mut skip_subsequent) {
                        continue;
                    }
                }
            }

            fields.push((name, value));
        }

        if let Some(filter) = filter {
            filter.reset();
        }

        let function_name = fields
            .iter()
            .find(|(name, _)| {
                name.as_deref()
                    .is_some_and(|n| n.eq_ignore_ascii_case(FUNCTION_KEY))
            })
            .and_then(|(_, value)| value.as_text().map(str::to_string));

        Ok(Self {
            fields,
            function_name,
            payload_size,
        })
    }

    /// The function named by this packet, if any.
    pub fn function_name(&self) -> Option<&str> {
        self.function_name.as_deref()
    }

    /// All fields in payload order.
    pub fn fields(&self) -> &[(Option<String>, Value)] {
        &self.fields
    }

    /// Named fields excluding the function key, in payload order.
    pub fn named_args(&self) -> impl Iterator<Item = (&str, &Value)> + '_ {
        self.fields.iter().filter_map(|(name, value)| match name {
            Some(name) if !name.eq_ignore_ascii_case(FUNCTION_KEY) => {
                Some((name.as_str(), value))
            }
            _ => None,
        })
    }

    /// Positional (unnamed) fields in payload order.
    pub fn positional_args(&self) -> impl Iterator<Item = &Value> + '_ {
        self.fields
            .iter()
            .filter_map(|(name, value)| name.is_none().then_some(value))
    }

    /// Payload length of the frame this packet was parsed from, excluding
    /// the preamble.
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Total frame length including the preamble.
    pub fn packet_size(&self) -> usize {
        self.payload_size + PREAMBLE_SIZE
    }

    /// The dispatcher-facing view of the named fields.
    ///
    /// Repeated names get numeric suffixes (`change`, `change0`, `change1`,
    /// ...) as some commands legitimately repeat fields; a repeated `func2`
    /// keeps only its first value, as proxies are known to duplicate it.
    pub fn results_map(&self) -> HashMap<String, Value> {
        let mut map: HashMap<String, Value> = HashMap::with_capacity(self.fields.len());

        for (name, value) in &self.fields {
            let Some(name) = name else { continue };

            if name.eq_ignore_ascii_case(FUNCTION2_KEY) {
                map.entry(name.clone()).or_insert_with(|| value.clone());
                continue;
            }

            if map.contains_key(name) {
                let mut suffix = 0usize;
                while map.contains_key(&format!("{name}{suffix}")) {
                    suffix += 1;
                }
                map.insert(format!("{name}{suffix}"), value.clone());
            } else {
                map.insert(name.clone(), value.clone());
            }
        }

        map
    }
}

fn is_protocol_key(name: &str) -> bool {
    name.eq_ignore_ascii_case(FUNCTION_KEY) || name.eq_ignore_ascii_case(FUNCTION2_KEY)
}
