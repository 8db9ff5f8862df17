use chrono::{DateTime, Utc};
use std::fmt;

use crate::error::MessageError;
use crate::ids::MAX_ID;

pub type SourceId = u8;
pub type ChannelId = u8;

/// Type tag carried by every message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataKind {
    Error,
    Undefined,
    Float,
    Timestamp,
    Bytes,
    String,
    StringArray,
    FloatArray,
}

impl DataKind {
    pub fn name(&self) -> &'static str {
        match self {
            DataKind::Error => "error",
            DataKind::Undefined => "undefined",
            DataKind::Float => "float",
            DataKind::Timestamp => "timestamp",
            DataKind::Bytes => "bytes",
            DataKind::String => "string",
            DataKind::StringArray => "string_array",
            DataKind::FloatArray => "float_array",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Message payload. The active variant always matches the message's kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Error report, carrying the offending value
    Error(f32),
    Undefined,
    Float(f32),
    /// Milliseconds, either since the Unix epoch or since an arbitrary
    /// source-local reference depending on the channel
    Timestamp(u64),
    Bytes(Vec<u8>),
    String(String),
    StringArray(Vec<String>),
    FloatArray(Vec<f32>),
}

impl Payload {
    pub fn kind(&self) -> DataKind {
        match self {
            Payload::Error(_) => DataKind::Error,
            Payload::Undefined => DataKind::Undefined,
            Payload::Float(_) => DataKind::Float,
            Payload::Timestamp(_) => DataKind::Timestamp,
            Payload::Bytes(_) => DataKind::Bytes,
            Payload::String(_) => DataKind::String,
            Payload::StringArray(_) => DataKind::StringArray,
            Payload::FloatArray(_) => DataKind::FloatArray,
        }
    }

    /// Element count: bytes, characters or array entries. Scalars count as one.
    pub fn len(&self) -> usize {
        match self {
            Payload::Undefined => 0,
            Payload::Error(_) | Payload::Float(_) | Payload::Timestamp(_) => 1,
            Payload::Bytes(b) => b.len(),
            Payload::String(s) => s.len(),
            Payload::StringArray(a) => a.len(),
            Payload::FloatArray(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deterministic text form used by the data log and the state file
    pub fn render(&self) -> String {
        match self {
            Payload::Error(v) | Payload::Float(v) => format!("{:.6}", v),
            Payload::Undefined => String::new(),
            Payload::Timestamp(ms) => render_millis(*ms),
            Payload::Bytes(b) => to_hex(b),
            Payload::String(s) => s.clone(),
            Payload::StringArray(a) => a.join(","),
            Payload::FloatArray(a) => a
                .iter()
                .map(|v| format!("{:.6}", v))
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// One timestamped data item from one (source, channel) pair
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    source: SourceId,
    channel: ChannelId,
    kind: DataKind,
    timestamp: DateTime<Utc>,
    payload: Payload,
}

impl Message {
    /// Build a message, checking that `payload` is the variant `kind` names
    /// and that both ids fit in 7 bits.
    pub fn new(
        source: SourceId,
        channel: ChannelId,
        kind: DataKind,
        payload: Payload,
    ) -> Result<Self, MessageError> {
        if payload.kind() != kind {
            return Err(MessageError::InvalidMessage {
                kind,
                payload: payload.kind(),
            });
        }
        if source > MAX_ID {
            return Err(MessageError::InvalidId(source));
        }
        if channel > MAX_ID {
            return Err(MessageError::InvalidId(channel));
        }
        Ok(Self {
            source,
            channel,
            kind,
            timestamp: Utc::now(),
            payload,
        })
    }

    // The typed constructors cannot mismatch kind and payload. Ids are
    // compile-time constants or validated configuration, so a wide id is a
    // bug: debug builds panic, release builds mask to 7 bits.
    fn typed(source: SourceId, channel: ChannelId, payload: Payload) -> Self {
        debug_assert!(source <= MAX_ID, "source id {:#04x} exceeds 7 bits", source);
        debug_assert!(channel <= MAX_ID, "channel id {:#04x} exceeds 7 bits", channel);
        Self {
            source: source & MAX_ID,
            channel: channel & MAX_ID,
            kind: payload.kind(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn float(source: SourceId, channel: ChannelId, value: f32) -> Self {
        Self::typed(source, channel, Payload::Float(value))
    }

    pub fn error(source: SourceId, channel: ChannelId, value: f32) -> Self {
        Self::typed(source, channel, Payload::Error(value))
    }

    pub fn undefined(source: SourceId, channel: ChannelId) -> Self {
        Self::typed(source, channel, Payload::Undefined)
    }

    pub fn timestamp(source: SourceId, channel: ChannelId, millis: u64) -> Self {
        Self::typed(source, channel, Payload::Timestamp(millis))
    }

    pub fn bytes(source: SourceId, channel: ChannelId, data: Vec<u8>) -> Self {
        Self::typed(source, channel, Payload::Bytes(data))
    }

    pub fn string(source: SourceId, channel: ChannelId, text: impl Into<String>) -> Self {
        Self::typed(source, channel, Payload::String(text.into()))
    }

    pub fn string_array(source: SourceId, channel: ChannelId, items: Vec<String>) -> Self {
        Self::typed(source, channel, Payload::StringArray(items))
    }

    pub fn float_array(source: SourceId, channel: ChannelId, values: Vec<f32>) -> Self {
        Self::typed(source, channel, Payload::FloatArray(values))
    }

    /// Replace the arrival time, used when replaying recorded data
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn kind(&self) -> DataKind {
        self.kind
    }

    pub fn timestamp_utc(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn length(&self) -> usize {
        self.payload.len()
    }

    pub fn as_float(&self) -> Option<f32> {
        match self.payload {
            Payload::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<u64> {
        match self.payload {
            Payload::Timestamp(ms) => Some(ms),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.payload {
            Payload::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match &self.payload {
            Payload::StringArray(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_floats(&self) -> Option<&[f32]> {
        match &self.payload {
            Payload::FloatArray(a) => Some(a),
            _ => None,
        }
    }

    pub fn render_payload(&self) -> String {
        self.payload.render()
    }

    /// Arrival time as seconds since the epoch with millisecond precision
    pub fn render_timestamp(&self) -> String {
        render_millis(self.timestamp.timestamp_millis().max(0) as u64)
    }
}

/// Log record form: tab separated timestamp, source, channel, kind and payload.
impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{:#04x}\t{:#04x}\t{}\t{}",
            self.render_timestamp(),
            self.source,
            self.channel,
            self.kind,
            self.payload.render()
        )
    }
}

fn render_millis(ms: u64) -> String {
    format!("{}.{:03}", ms / 1000, ms % 1000)
}

fn to_hex(data: &[u8]) -> String {
    use fmt::Write;
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        let _ = write!(out, "{:02x}", b);
    }
    out
}
