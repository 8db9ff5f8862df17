//! NMEA 0183 sentence framing
//!
//! Sentences start with `$` (or `!` for encapsulated data), carry an
//! optional `*HH` XOR checksum and end with CR LF. Some USB gateways send
//! LF LF at startup, so any LF closes a sentence and trailing CR/LF bytes are
//! stripped.

use chrono::{DateTime, NaiveDate, Utc};

use crate::error::ProtocolError;

pub const START_BYTE: u8 = b'$';
pub const ENCAPSULATED_START_BYTE: u8 = b'!';
pub const CHECKSUM_MARK: u8 = b'*';
pub const CR: u8 = b'\r';
pub const LF: u8 = b'\n';

/// Maximum sentence length including start byte and CR LF
pub const MAX_SENTENCE_LEN: usize = 82;

/// A validated sentence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NmeaSentence {
    pub encapsulated: bool,
    /// Two letter talker, or four characters for proprietary (`P`) sentences
    pub talker: String,
    pub message_type: String,
    pub fields: Vec<String>,
}

impl NmeaSentence {
    pub fn new(talker: &str, message_type: &str, fields: Vec<String>) -> Self {
        Self {
            encapsulated: false,
            talker: talker.to_string(),
            message_type: message_type.to_string(),
            fields,
        }
    }

    pub fn is_type(&self, message_type: &str) -> bool {
        self.message_type == message_type
    }

    /// Text between the start byte and the checksum mark
    pub fn body(&self) -> String {
        let mut body = format!("{}{}", self.talker, self.message_type);
        for field in &self.fields {
            body.push(',');
            body.push_str(field);
        }
        body
    }

    pub fn checksum(&self) -> u8 {
        checksum(self.body().as_bytes())
    }

    /// Wire form, always with checksum and CR LF
    pub fn to_bytes(&self) -> Vec<u8> {
        let start = if self.encapsulated { '!' } else { '$' };
        let body = self.body();
        format!("{}{}*{:02X}\r\n", start, body, checksum(body.as_bytes())).into_bytes()
    }

    /// Talker, type and fields as one flat list
    pub fn to_strings(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.fields.len() + 2);
        out.push(self.talker.clone());
        out.push(self.message_type.clone());
        out.extend(self.fields.iter().cloned());
        out
    }

    /// UTC date and time from a ZDA sentence. The local zone fields only
    /// describe the sender's zone and are ignored.
    pub fn zda_datetime(&self) -> Option<DateTime<Utc>> {
        if !self.is_type("ZDA") || self.fields.len() < 4 {
            return None;
        }
        let time = &self.fields[0];
        if time.len() < 6 || !time.is_char_boundary(6) {
            return None;
        }
        let hour: u32 = time[0..2].parse().ok()?;
        let minute: u32 = time[2..4].parse().ok()?;
        let second: f64 = time[4..].parse().ok()?;
        let day: u32 = self.fields[1].parse().ok()?;
        let month: u32 = self.fields[2].parse().ok()?;
        let year: i32 = self.fields[3].parse().ok()?;

        let millis = (second.fract() * 1000.0).round() as u32;
        let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_milli_opt(
            hour,
            minute,
            second.trunc() as u32,
            millis.min(999),
        )?;

        Some(naive.and_utc())
    }
}

/// XOR of all bytes
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc ^ b)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Reading,
}

/// Byte stream decoder for NMEA 0183 sentences
pub struct NmeaDecoder {
    state: State,
    buffer: Vec<u8>,
    require_checksum: bool,
}

impl NmeaDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            buffer: Vec::with_capacity(MAX_SENTENCE_LEN),
            require_checksum: false,
        }
    }

    /// Reject sentences without a `*HH` checksum
    pub fn with_required_checksum(mut self, required: bool) -> Self {
        self.require_checksum = required;
        self
    }

    /// Push received bytes and collect every sentence (or dropped frame)
    /// completed by them.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<NmeaSentence, ProtocolError>> {
        data.iter().filter_map(|&b| self.push_byte(b)).collect()
    }

    pub fn push_byte(&mut self, byte: u8) -> Option<Result<NmeaSentence, ProtocolError>> {
        match self.state {
            State::Idle => {
                if byte == START_BYTE || byte == ENCAPSULATED_START_BYTE {
                    self.buffer.clear();
                    self.buffer.push(byte);
                    self.state = State::Reading;
                }
                None
            }
            State::Reading => {
                if byte == START_BYTE || byte == ENCAPSULATED_START_BYTE {
                    let dropped = self.buffer.len();
                    self.buffer.clear();
                    self.buffer.push(byte);
                    return Some(Err(ProtocolError::FrameError(format!(
                        "new sentence started after {} bytes without terminator",
                        dropped
                    ))));
                }
                if byte == LF {
                    self.state = State::Idle;
                    while matches!(self.buffer.last(), Some(&CR) | Some(&LF)) {
                        self.buffer.pop();
                    }
                    let frame = std::mem::take(&mut self.buffer);
                    return Some(self.parse(&frame));
                }
                self.buffer.push(byte);
                // The LF still to come must fit as well
                if self.buffer.len() >= MAX_SENTENCE_LEN {
                    self.reset();
                    return Some(Err(ProtocolError::FrameTooLong {
                        limit: MAX_SENTENCE_LEN,
                    }));
                }
                None
            }
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = State::Idle;
    }

    fn parse(&self, frame: &[u8]) -> Result<NmeaSentence, ProtocolError> {
        let encapsulated = frame.first() == Some(&ENCAPSULATED_START_BYTE);
        let body = &frame[1.min(frame.len())..];

        let payload = match body.iter().position(|&b| b == CHECKSUM_MARK) {
            Some(pos) => {
                let expected = parse_hex_byte(&body[pos + 1..])?;
                let actual = checksum(&body[..pos]);
                if expected != actual {
                    return Err(ProtocolError::ChecksumMismatch { expected, actual });
                }
                &body[..pos]
            }
            None if self.require_checksum => return Err(ProtocolError::MissingChecksum),
            None => body,
        };

        let text = std::str::from_utf8(payload)
            .map_err(|_| ProtocolError::Malformed("sentence is not ASCII".to_string()))?;
        if !text.is_ascii() {
            return Err(ProtocolError::Malformed("sentence is not ASCII".to_string()));
        }

        let mut parts = text.split(',');
        let header = parts.next().unwrap_or_default();
        if !header.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ProtocolError::Malformed(format!("invalid header {:?}", header)));
        }
        let talker_len = if header.starts_with('P') { 4 } else { 2 };
        if header.len() <= talker_len || header.len() > talker_len + 3 {
            return Err(ProtocolError::Malformed(format!("invalid header {:?}", header)));
        }
        let (talker, message_type) = header.split_at(talker_len);

        Ok(NmeaSentence {
            encapsulated,
            talker: talker.to_string(),
            message_type: message_type.to_string(),
            fields: parts.map(str::to_string).collect(),
        })
    }
}

impl Default for NmeaDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_hex_byte(digits: &[u8]) -> Result<u8, ProtocolError> {
    let text = String::from_utf8_lossy(digits);
    if digits.len() != 2 {
        return Err(ProtocolError::InvalidHex(text.into_owned()));
    }
    u8::from_str_radix(&text, 16).map_err(|_| ProtocolError::InvalidHex(text.into_owned()))
}
