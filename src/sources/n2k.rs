use marine_proto::actisense::{ActisenseDecoder, ActisenseFrame, N2kFrame};
use marine_proto::ids::channels;
use marine_proto::{ChannelId, Message, SourceId};
use tracing::{debug, warn};

use crate::channel_map::ChannelInfo;
use crate::config::SourceFilterConfig;
use crate::driver::standard_channels;
use crate::error::QueueError;
use crate::queue::QueueProducer;
use crate::sources::StreamHandler;

pub const CHANNEL_HEADER: ChannelId = 4;
pub const CHANNEL_DATA: ChannelId = 5;

/// Turns Actisense framed NMEA 2000 messages into messages.
///
/// PGN specific decoding is left to offline tools; each frame is logged as
/// a numeric header, the gateway timestamp and the data bytes. The
/// timestamp gets its own integer message since a u32 millisecond count
/// does not survive an f32.
pub struct N2kHandler {
    source: SourceId,
    tag: String,
    raw: bool,
    filter: SourceFilterConfig,
    decoder: ActisenseDecoder,
    frames: u64,
    dropped: u64,
    filtered: u64,
}

impl N2kHandler {
    pub fn new(source: SourceId, tag: &str, raw: bool, filter: SourceFilterConfig) -> Self {
        Self {
            source,
            tag: tag.to_string(),
            raw,
            filter,
            decoder: ActisenseDecoder::new(),
            frames: 0,
            dropped: 0,
            filtered: 0,
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn filtered(&self) -> u64 {
        self.filtered
    }

    fn handle_frame(&mut self, frame: ActisenseFrame, out: &QueueProducer) -> Result<(), QueueError> {
        if !frame.is_n2k() {
            debug!("[{}] Ignoring gateway command {:#04x}", self.tag, frame.command);
            return Ok(());
        }
        let n2k = match N2kFrame::from_frame(&frame) {
            Ok(n2k) => n2k,
            Err(e) => {
                self.dropped += 1;
                warn!("[{}] Dropped frame: {}", self.tag, e);
                return Ok(());
            }
        };
        if !self.filter.should_accept(n2k.pgn, n2k.source) {
            self.filtered += 1;
            debug!("[{}] Filtered PGN {} from source {}", self.tag, n2k.pgn, n2k.source);
            return Ok(());
        }

        self.frames += 1;
        if self.raw {
            match frame.to_bytes() {
                Ok(wire) => out.push(Message::bytes(self.source, channels::RAW, wire))?,
                Err(e) => warn!("[{}] Raw frame not logged: {}", self.tag, e),
            }
        }
        out.push(Message::float_array(
            self.source,
            CHANNEL_HEADER,
            vec![
                n2k.pgn as f32,
                n2k.priority as f32,
                n2k.source as f32,
                n2k.destination as f32,
            ],
        ))?;
        out.push(Message::timestamp(self.source, channels::TIMESTAMP, u64::from(n2k.timestamp)))?;
        out.push(Message::bytes(self.source, CHANNEL_DATA, n2k.data))
    }
}

impl StreamHandler for N2kHandler {
    fn channels(&self) -> Vec<(ChannelId, ChannelInfo)> {
        let mut list = standard_channels(self.raw);
        list.push((
            CHANNEL_HEADER,
            ChannelInfo::new("Header").with_description("PGN, priority, source, destination"),
        ));
        list.push((
            channels::TIMESTAMP,
            ChannelInfo::new("Timestamp").with_description("Gateway clock, milliseconds"),
        ));
        list.push((CHANNEL_DATA, ChannelInfo::new("Data")));
        list
    }

    fn handle(&mut self, data: &[u8], out: &QueueProducer) -> Result<(), QueueError> {
        for result in self.decoder.feed(data) {
            match result {
                Ok(frame) => self.handle_frame(frame, out)?,
                Err(e) => {
                    self.dropped += 1;
                    warn!("[{}] Dropped frame: {}", self.tag, e);
                }
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.decoder.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::test_support::{drain, producer};

    fn position_frame(source: u8) -> N2kFrame {
        N2kFrame {
            priority: 2,
            pgn: 129025,
            destination: 255,
            source,
            timestamp: 1000,
            // 0x10 in the data exercises escaping
            data: vec![0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80],
        }
    }

    #[test]
    fn test_frame_becomes_header_and_data() {
        let mut handler = N2kHandler::new(0x38, "N2K:test", false, SourceFilterConfig::default());
        let (queue, out) = producer();
        handler.handle(&position_frame(22).to_frame().unwrap().to_bytes().unwrap(), &out).unwrap();
        let messages = drain(&queue, out);

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].channel(), CHANNEL_HEADER);
        assert_eq!(messages[0].as_floats().unwrap(), &[129025.0, 2.0, 22.0, 255.0]);
        assert_eq!(messages[1].channel(), channels::TIMESTAMP);
        assert_eq!(messages[1].as_timestamp(), Some(1000));
        assert_eq!(messages[2].channel(), CHANNEL_DATA);
        assert_eq!(messages[2].as_bytes().unwrap()[0], 0x10);
        assert_eq!(handler.frames(), 1);
    }

    #[test]
    fn test_timestamp_keeps_every_millisecond() {
        let mut handler = N2kHandler::new(0x38, "N2K:test", false, SourceFilterConfig::default());
        let (queue, out) = producer();
        // 2^24 + 1 is the first count an f32 cannot hold
        for timestamp in [16_777_217, u32::MAX] {
            let mut frame = position_frame(22);
            frame.timestamp = timestamp;
            handler.handle(&frame.to_frame().unwrap().to_bytes().unwrap(), &out).unwrap();
        }
        let messages = drain(&queue, out);
        assert_eq!(messages[1].as_timestamp(), Some(16_777_217));
        assert_eq!(messages[4].as_timestamp(), Some(u64::from(u32::MAX)));
    }

    #[test]
    fn test_timestamp_channel_declared() {
        let handler = N2kHandler::new(0x38, "N2K:test", false, SourceFilterConfig::default());
        let ids: Vec<ChannelId> = handler.channels().into_iter().map(|(id, _)| id).collect();
        assert!(ids.contains(&channels::TIMESTAMP));
        assert!(ids.contains(&CHANNEL_HEADER));
    }

    #[test]
    fn test_raw_frame_is_restuffed() {
        let mut handler = N2kHandler::new(0x38, "N2K:test", true, SourceFilterConfig::default());
        let (queue, out) = producer();
        let wire = position_frame(22).to_frame().unwrap().to_bytes().unwrap();
        handler.handle(&wire, &out).unwrap();
        let messages = drain(&queue, out);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].channel(), channels::RAW);
        assert_eq!(messages[0].as_bytes(), Some(wire.as_slice()));
    }

    #[test]
    fn test_source_filter() {
        let mut filter = SourceFilterConfig::default();
        filter.pgn_source_map.insert(129025, 22);
        let mut handler = N2kHandler::new(0x38, "N2K:test", false, filter);
        let (queue, out) = producer();

        let mut stream = position_frame(10).to_frame().unwrap().to_bytes().unwrap();
        stream.extend(position_frame(22).to_frame().unwrap().to_bytes().unwrap());
        handler.handle(&stream, &out).unwrap();
        let messages = drain(&queue, out);

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].as_floats().unwrap()[2], 22.0);
        assert_eq!(handler.filtered(), 1);
    }

    #[test]
    fn test_corrupt_frame_dropped_and_stream_resumes() {
        let mut handler = N2kHandler::new(0x38, "N2K:test", false, SourceFilterConfig::default());
        let (queue, out) = producer();

        let mut bad = position_frame(22).to_frame().unwrap().to_bytes().unwrap();
        let last_data = bad.len() - 4;
        bad[last_data] ^= 0x01;
        let mut stream = bad;
        stream.extend(position_frame(23).to_frame().unwrap().to_bytes().unwrap());
        handler.handle(&stream, &out).unwrap();
        let messages = drain(&queue, out);

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].as_floats().unwrap()[2], 23.0);
        assert_eq!(handler.dropped(), 1);
    }

    #[test]
    fn test_non_n2k_command_ignored() {
        let mut handler = N2kHandler::new(0x38, "N2K:test", false, SourceFilterConfig::default());
        let (queue, out) = producer();
        let bem = ActisenseFrame {
            command: 0xA0,
            payload: vec![0x01, 0x02],
        };
        handler.handle(&bem.to_bytes().unwrap(), &out).unwrap();
        assert!(drain(&queue, out).is_empty());
        assert_eq!(handler.dropped(), 0);
    }
}
