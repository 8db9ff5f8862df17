//! Marine logger protocol library
//!
//! This library provides the pieces every logger source shares:
//! - The typed [`Message`] carried from a source to the dispatcher
//! - Reserved source and channel identifiers
//! - Stream decoders for NMEA 0183, Actisense framed NMEA2000 and Datawell HXV
//!
//! Decoders are pure state machines. They are fed raw bytes as they arrive
//! from a transport and hand back complete records (or the error that caused
//! a frame to be dropped), so they can be tested without any I/O.
//!
//! # Example
//!
//! ```
//! use marine_proto::nmea0183::NmeaDecoder;
//!
//! let mut decoder = NmeaDecoder::new();
//! let results = decoder.feed(b"$GPZDA,120000.00,01,02,2024,00,00*62\r\n");
//! assert_eq!(results.len(), 1);
//! ```

pub mod actisense;
pub mod datawell;
pub mod error;
pub mod ids;
pub mod message;
pub mod nmea0183;

pub use error::{MessageError, ProtocolError};
pub use message::{ChannelId, DataKind, Message, Payload, SourceId};
