//! Actisense serial framing for NMEA2000 messages
//!
//! Frames travel as `ESC SOT <stuffed body> ESC EOT`. Inside the body a
//! literal `ESC` is sent twice. The destuffed body is
//! `[command, length, payload..., checksum]`, where `length` counts the
//! payload bytes and the checksum makes the byte sum of the whole body zero
//! modulo 256.
//!
//! For N2K messages (command 0x93) the payload is
//!
//! | offset | size | field                       |
//! |--------|------|-----------------------------|
//! | 0      | 1    | priority                    |
//! | 1      | 3    | PGN, little endian          |
//! | 4      | 1    | destination address         |
//! | 5      | 1    | source address              |
//! | 6      | 4    | gateway timestamp, LE, ms   |
//! | 10     | 1    | data length                 |
//! | 11     | n    | data                        |

use crate::error::ProtocolError;

pub const ESC: u8 = 0x10;
pub const SOT: u8 = 0x02;
pub const EOT: u8 = 0x03;

/// N2K message received from the bus
pub const CMD_N2K_RECEIVED: u8 = 0x93;
/// Gateway (BEM) response
pub const CMD_BEM: u8 = 0xA0;

/// Largest destuffed body accepted before the frame is dropped
pub const MAX_FRAME_LEN: usize = 512;

const N2K_HEADER_LEN: usize = 11;

/// Checksum that brings the sum of `body` plus itself to zero modulo 256
pub fn checksum(body: &[u8]) -> u8 {
    let sum = body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0u8.wrapping_sub(sum)
}

/// Double every `ESC` byte
pub fn stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 4);
    for &b in data {
        out.push(b);
        if b == ESC {
            out.push(ESC);
        }
    }
    out
}

/// Inverse of [`stuff`]. Any `ESC` not followed by another `ESC` is an error.
pub fn destuff(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&b) = iter.next() {
        if b == ESC {
            match iter.next() {
                Some(&ESC) => out.push(ESC),
                Some(&other) => {
                    return Err(ProtocolError::FrameError(format!(
                        "bad escape sequence ESC {:#04x}",
                        other
                    )));
                }
                None => {
                    return Err(ProtocolError::FrameError("trailing escape".to_string()));
                }
            }
        } else {
            out.push(b);
        }
    }
    Ok(out)
}

/// A checksum-verified frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActisenseFrame {
    pub command: u8,
    pub payload: Vec<u8>,
}

impl ActisenseFrame {
    pub fn is_n2k(&self) -> bool {
        self.command == CMD_N2K_RECEIVED
    }

    /// Destuffed body: command, length, payload and checksum. The length
    /// field is one byte, so payloads over 255 bytes have no encoding.
    pub fn body(&self) -> Result<Vec<u8>, ProtocolError> {
        let length = u8::try_from(self.payload.len()).map_err(|_| {
            ProtocolError::Malformed(format!(
                "payload of {} bytes does not fit the length field",
                self.payload.len()
            ))
        })?;
        let mut body = Vec::with_capacity(self.payload.len() + 3);
        body.push(self.command);
        body.push(length);
        body.extend_from_slice(&self.payload);
        body.push(checksum(&body));
        Ok(body)
    }

    /// Complete wire form including start and end markers
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = vec![ESC, SOT];
        out.extend(stuff(&self.body()?));
        out.extend_from_slice(&[ESC, EOT]);
        Ok(out)
    }

    fn from_body(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < 3 {
            return Err(ProtocolError::FrameError(format!(
                "frame too short ({} bytes)",
                body.len()
            )));
        }
        let (content, stated) = body.split_at(body.len() - 1);
        let expected = checksum(content);
        if expected != stated[0] {
            return Err(ProtocolError::FrameError(format!(
                "checksum mismatch: expected {:#04x}, got {:#04x}",
                expected, stated[0]
            )));
        }
        let length = content[1] as usize;
        if length != content.len() - 2 {
            return Err(ProtocolError::FrameError(format!(
                "length field {} does not match {} payload bytes",
                length,
                content.len() - 2
            )));
        }
        Ok(Self {
            command: content[0],
            payload: content[2..].to_vec(),
        })
    }
}

/// Decoded N2K message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct N2kFrame {
    pub priority: u8,
    pub pgn: u32,
    pub destination: u8,
    pub source: u8,
    /// Gateway timestamp in milliseconds
    pub timestamp: u32,
    pub data: Vec<u8>,
}

impl N2kFrame {
    pub fn from_frame(frame: &ActisenseFrame) -> Result<Self, ProtocolError> {
        if !frame.is_n2k() {
            return Err(ProtocolError::FrameError(format!(
                "command {:#04x} is not an N2K message",
                frame.command
            )));
        }
        let p = &frame.payload;
        if p.len() < N2K_HEADER_LEN {
            return Err(ProtocolError::FrameError(format!(
                "N2K header truncated ({} bytes)",
                p.len()
            )));
        }
        let data_len = p[10] as usize;
        if p.len() - N2K_HEADER_LEN != data_len {
            return Err(ProtocolError::FrameError(format!(
                "data length {} does not match {} data bytes",
                data_len,
                p.len() - N2K_HEADER_LEN
            )));
        }
        Ok(Self {
            priority: p[0],
            pgn: u32::from_le_bytes([p[1], p[2], p[3], 0]),
            destination: p[4],
            source: p[5],
            timestamp: u32::from_le_bytes([p[6], p[7], p[8], p[9]]),
            data: p[N2K_HEADER_LEN..].to_vec(),
        })
    }

    pub fn to_frame(&self) -> Result<ActisenseFrame, ProtocolError> {
        let data_len = u8::try_from(self.data.len()).map_err(|_| {
            ProtocolError::Malformed(format!(
                "{} data bytes do not fit the N2K length field",
                self.data.len()
            ))
        })?;
        let mut payload = Vec::with_capacity(N2K_HEADER_LEN + self.data.len());
        payload.push(self.priority);
        payload.extend_from_slice(&self.pgn.to_le_bytes()[..3]);
        payload.push(self.destination);
        payload.push(self.source);
        payload.extend_from_slice(&self.timestamp.to_le_bytes());
        payload.push(data_len);
        payload.extend_from_slice(&self.data);
        Ok(ActisenseFrame {
            command: CMD_N2K_RECEIVED,
            payload,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitStart,
    /// ESC seen outside a frame, SOT would open one
    StartEscape,
    Reading,
    EscapeNext,
}

/// Byte stream decoder for Actisense frames
pub struct ActisenseDecoder {
    state: State,
    buffer: Vec<u8>,
}

impl ActisenseDecoder {
    pub fn new() -> Self {
        Self {
            state: State::WaitStart,
            buffer: Vec::with_capacity(64),
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<ActisenseFrame, ProtocolError>> {
        data.iter().filter_map(|&b| self.push_byte(b)).collect()
    }

    pub fn push_byte(&mut self, byte: u8) -> Option<Result<ActisenseFrame, ProtocolError>> {
        match self.state {
            State::WaitStart => {
                if byte == ESC {
                    self.state = State::StartEscape;
                }
                None
            }
            State::StartEscape => {
                self.state = match byte {
                    SOT => {
                        self.buffer.clear();
                        State::Reading
                    }
                    ESC => State::StartEscape,
                    _ => State::WaitStart,
                };
                None
            }
            State::Reading => {
                if byte == ESC {
                    self.state = State::EscapeNext;
                    return None;
                }
                self.push_data(byte)
            }
            State::EscapeNext => match byte {
                ESC => {
                    self.state = State::Reading;
                    self.push_data(ESC)
                }
                EOT => {
                    self.state = State::WaitStart;
                    let body = std::mem::take(&mut self.buffer);
                    Some(ActisenseFrame::from_body(&body))
                }
                SOT => {
                    // A new frame starts here, the partial one is lost
                    let dropped = self.buffer.len();
                    self.buffer.clear();
                    self.state = State::Reading;
                    Some(Err(ProtocolError::FrameError(format!(
                        "start marker inside frame after {} bytes",
                        dropped
                    ))))
                }
                other => {
                    self.reset();
                    Some(Err(ProtocolError::FrameError(format!(
                        "bad escape sequence ESC {:#04x}",
                        other
                    ))))
                }
            },
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = State::WaitStart;
    }

    fn push_data(&mut self, byte: u8) -> Option<Result<ActisenseFrame, ProtocolError>> {
        self.buffer.push(byte);
        if self.buffer.len() > MAX_FRAME_LEN {
            self.reset();
            return Some(Err(ProtocolError::FrameTooLong {
                limit: MAX_FRAME_LEN,
            }));
        }
        None
    }
}

impl Default for ActisenseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> N2kFrame {
        N2kFrame {
            priority: 2,
            pgn: 127250,
            destination: 255,
            source: 0x10,
            timestamp: 0x0010_0203,
            data: vec![0xFF, 0x10, 0x02, 0x03, 0x10, 0x00, 0x7F, 0xFF],
        }
    }

    #[test]
    fn test_stuff_destuff_identity() {
        let inputs: Vec<Vec<u8>> = vec![
            vec![],
            vec![ESC],
            vec![ESC, ESC, ESC],
            vec![ESC, SOT, ESC, EOT],
            (0..=255).collect(),
        ];
        for input in inputs {
            assert_eq!(destuff(&stuff(&input)).unwrap(), input);
        }
    }

    #[test]
    fn test_stuff_only_doubles_escape() {
        assert_eq!(stuff(&[SOT, ESC, EOT]), vec![SOT, ESC, ESC, EOT]);
        assert!(destuff(&[0x01, ESC, SOT]).is_err());
        assert!(destuff(&[0x01, ESC]).is_err());
    }

    #[test]
    fn test_checksum_zeroes_sum() {
        let body = [CMD_N2K_RECEIVED, 3, 0x10, 0xFF, 0x20];
        let cs = checksum(&body);
        let total = body.iter().fold(cs, |acc, b| acc.wrapping_add(*b));
        assert_eq!(total, 0);
        assert_eq!(checksum(&[]), 0);
    }

    #[test]
    fn test_decode_n2k_frame() {
        let frame = sample();
        let mut decoder = ActisenseDecoder::new();
        let results = decoder.feed(&frame.to_frame().unwrap().to_bytes().unwrap());
        assert_eq!(results.len(), 1);
        let raw = results[0].as_ref().unwrap();
        assert!(raw.is_n2k());
        assert_eq!(raw.payload.len(), 11 + frame.data.len());
        assert_eq!(N2kFrame::from_frame(raw).unwrap(), frame);
    }

    #[test]
    fn test_wire_layout() {
        let frame = N2kFrame {
            priority: 6,
            pgn: 0x01F80D,
            destination: 0xFF,
            source: 0x23,
            timestamp: 1,
            data: vec![0xAA],
        };
        let bytes = frame.to_frame().unwrap().to_bytes().unwrap();
        assert_eq!(&bytes[..4], &[ESC, SOT, CMD_N2K_RECEIVED, 12]);
        assert_eq!(&bytes[4..8], &[6, 0x0D, 0xF8, 0x01]);
        assert_eq!(&bytes[bytes.len() - 2..], &[ESC, EOT]);
    }

    #[test]
    fn test_corrupted_byte_is_detected() {
        let bytes = sample().to_frame().unwrap().to_bytes().unwrap();
        // Flip a data byte that is not part of an escape pair
        let pos = bytes.len() - 4;
        let mut corrupt = bytes.clone();
        corrupt[pos] ^= 0x01;
        let mut decoder = ActisenseDecoder::new();
        let results = decoder.feed(&corrupt);
        assert_eq!(results.len(), 1);
        match &results[0] {
            Err(ProtocolError::FrameError(msg)) => assert!(msg.contains("checksum")),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_resync_after_bad_frame() {
        let good = sample().to_frame().unwrap().to_bytes().unwrap();
        let mut stream = vec![0x55, 0xAA, ESC];
        stream.extend_from_slice(&good[..8]);
        // Unexpected start marker mid-frame, then a full frame
        stream.extend_from_slice(&good);
        stream.extend_from_slice(&good);
        let mut decoder = ActisenseDecoder::new();
        let results = decoder.feed(&stream);
        assert_eq!(results.len(), 3);
        assert!(matches!(results[0], Err(ProtocolError::FrameError(_))));
        assert!(results[1].is_ok());
        assert!(results[2].is_ok());
    }

    #[test]
    fn test_bad_escape_drops_frame() {
        let mut stream = vec![ESC, SOT, CMD_N2K_RECEIVED, ESC, 0x55];
        stream.extend(sample().to_frame().unwrap().to_bytes().unwrap());
        let mut decoder = ActisenseDecoder::new();
        let results = decoder.feed(&stream);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert!(results[1].is_ok());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut body = vec![CMD_N2K_RECEIVED, 5, 1, 2];
        body.push(checksum(&body));
        let mut stream = vec![ESC, SOT];
        stream.extend(stuff(&body));
        stream.extend_from_slice(&[ESC, EOT]);
        let results = ActisenseDecoder::new().feed(&stream);
        assert!(matches!(&results[0], Err(ProtocolError::FrameError(m)) if m.contains("length")));
    }

    #[test]
    fn test_overlong_frame() {
        let mut stream = vec![ESC, SOT];
        stream.extend(std::iter::repeat(0x01).take(MAX_FRAME_LEN + 1));
        let results = ActisenseDecoder::new().feed(&stream);
        assert_eq!(
            results,
            vec![Err(ProtocolError::FrameTooLong {
                limit: MAX_FRAME_LEN
            })]
        );
    }

    #[test]
    fn test_non_n2k_command() {
        let frame = ActisenseFrame {
            command: CMD_BEM,
            payload: vec![0x11, 0x01],
        };
        let results = ActisenseDecoder::new().feed(&frame.to_bytes().unwrap());
        let decoded = results[0].as_ref().unwrap();
        assert!(!decoded.is_n2k());
        assert!(N2kFrame::from_frame(decoded).is_err());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let frame = ActisenseFrame {
            command: CMD_BEM,
            payload: vec![0x01; 300],
        };
        assert!(matches!(frame.body(), Err(ProtocolError::Malformed(_))));
        assert!(frame.to_bytes().is_err());

        let largest = ActisenseFrame {
            command: CMD_BEM,
            payload: vec![0x01; 255],
        };
        assert_eq!(largest.body().unwrap()[1], 255);
    }

    #[test]
    fn test_oversized_n2k_data_rejected() {
        let mut frame = sample();
        frame.data = vec![0x00; 256];
        assert!(matches!(frame.to_frame(), Err(ProtocolError::Malformed(_))));
    }
}
