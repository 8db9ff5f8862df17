//! Reserved source and channel identifiers.
//!
//! Source ids are grouped in families: each device type owns a contiguous
//! block starting at its base id. Channel ids are only unique within a
//! source, so anything that stores per-channel data keys on the
//! `(source, channel)` pair.

use crate::message::{ChannelId, SourceId};

/// Highest valid source or channel id (ids are 7 bit).
pub const MAX_ID: u8 = 0x7F;

pub mod sources {
    use super::SourceId;

    /// Messages generated by the logger itself
    pub const LOCAL: SourceId = 0x00;
    /// Messages generated by conversion tools
    pub const CONVERSION: SourceId = 0x01;
    /// Software timer
    pub const TIMER: SourceId = 0x02;
    pub const GPS: SourceId = 0x10;
    pub const ADC: SourceId = 0x20;
    pub const NMEA: SourceId = 0x30;
    pub const N2K: SourceId = 0x38;
    pub const I2C: SourceId = 0x40;
    /// Network sources, including Datawell receivers
    pub const EXTERNAL: SourceId = 0x60;
    pub const MQTT: SourceId = 0x68;
    /// Serial devices with MessagePack output
    pub const MESSAGE_PACK: SourceId = 0x70;

    /// Last id belonging to the family that starts at `base`.
    pub fn family_end(base: SourceId) -> SourceId {
        match base {
            LOCAL..=0x0F => 0x0F,
            GPS..=0x1F => 0x1F,
            ADC..=0x2F => 0x2F,
            NMEA..=0x37 => 0x37,
            N2K..=0x3F => 0x3F,
            I2C..=0x5F => 0x5F,
            EXTERNAL..=0x67 => 0x67,
            MQTT..=0x6F => 0x6F,
            _ => super::MAX_ID,
        }
    }

    /// Ids owned by the logger process (the whole local family) and never
    /// assignable to a device.
    pub fn is_reserved(id: SourceId) -> bool {
        id < GPS
    }
}

pub mod channels {
    use super::ChannelId;

    /// Source name
    pub const NAME: ChannelId = 0x00;
    /// Channel name map broadcast
    pub const MAP: ChannelId = 0x01;
    /// Source local timestamp, milliseconds
    pub const TIMESTAMP: ChannelId = 0x02;
    /// Raw device data
    pub const RAW: ChannelId = 0x03;
    pub const INFO: ChannelId = 0x7D;
    pub const WARNING: ChannelId = 0x7E;
    pub const ERROR: ChannelId = 0x7F;

    /// Channels every source carries with the same meaning.
    pub fn is_reserved(id: ChannelId) -> bool {
        id <= RAW || id >= INFO
    }

    /// Default names for the reserved channels, indexed by id.
    pub fn reserved_name(id: ChannelId) -> Option<&'static str> {
        match id {
            NAME => Some("Name"),
            MAP => Some("Channels"),
            TIMESTAMP => Some("Timestamp"),
            RAW => Some("Raw Data"),
            INFO => Some("Information"),
            WARNING => Some("Warning"),
            ERROR => Some("Errors"),
            _ => None,
        }
    }
}
