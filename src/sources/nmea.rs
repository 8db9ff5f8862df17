use marine_proto::ids::channels;
use marine_proto::nmea0183::{NmeaDecoder, NmeaSentence};
use marine_proto::{ChannelId, Message, SourceId};
use tracing::{debug, warn};

use crate::channel_map::ChannelInfo;
use crate::driver::standard_channels;
use crate::error::QueueError;
use crate::queue::QueueProducer;
use crate::sources::StreamHandler;

pub const CHANNEL_EPOCH: ChannelId = 4;
pub const CHANNEL_SENTENCE: ChannelId = 5;

/// Turns NMEA 0183 sentences into messages.
///
/// ZDA sentences become an epoch timestamp, everything else is logged as
/// `[talker, type, fields...]`.
pub struct NmeaHandler {
    source: SourceId,
    tag: String,
    raw: bool,
    decoder: NmeaDecoder,
    sentences: u64,
    dropped: u64,
}

impl NmeaHandler {
    pub fn new(source: SourceId, tag: &str, raw: bool, require_checksum: bool) -> Self {
        Self {
            source,
            tag: tag.to_string(),
            raw,
            decoder: NmeaDecoder::new().with_required_checksum(require_checksum),
            sentences: 0,
            dropped: 0,
        }
    }

    pub fn sentences(&self) -> u64 {
        self.sentences
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn to_message(&self, sentence: &NmeaSentence) -> Message {
        match sentence.zda_datetime() {
            Some(time) => Message::timestamp(self.source, CHANNEL_EPOCH, time.timestamp_millis().max(0) as u64),
            None => Message::string_array(self.source, CHANNEL_SENTENCE, sentence.to_strings()),
        }
    }
}

impl StreamHandler for NmeaHandler {
    fn channels(&self) -> Vec<(ChannelId, ChannelInfo)> {
        let mut list = standard_channels(self.raw);
        list.push((
            CHANNEL_EPOCH,
            ChannelInfo::new("Epoch").with_unit("ms").with_description("UTC time from ZDA sentences"),
        ));
        list.push((CHANNEL_SENTENCE, ChannelInfo::new("Sentence")));
        list
    }

    fn handle(&mut self, data: &[u8], out: &QueueProducer) -> Result<(), QueueError> {
        for result in self.decoder.feed(data) {
            match result {
                Ok(sentence) => {
                    self.sentences += 1;
                    if self.sentences % 1000 == 0 {
                        debug!("[{}] {} sentences received", self.tag, self.sentences);
                    }
                    if self.raw {
                        out.push(Message::bytes(self.source, channels::RAW, sentence.to_bytes()))?;
                    }
                    out.push(self.to_message(&sentence))?;
                }
                Err(e) => {
                    self.dropped += 1;
                    warn!("[{}] Dropped sentence: {}", self.tag, e);
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

    const GGA: &[u8] = b"$GPGGA,120000,5000.0000,N,00500.0000,W,1,08,0.9,10.0,M,50.0,M,,*66\r\n";
    const ZDA: &[u8] = b"$GPZDA,120000.00,01,02,2024,00,00*62\r\n";

    #[test]
    fn test_sentence_becomes_string_array() {
        let mut handler = NmeaHandler::new(0x30, "NMEA:test", false, false);
        let (queue, out) = producer();
        handler.handle(GGA, &out).unwrap();
        let messages = drain(&queue, out);

        assert_eq!(messages.len(), 1);
        let fields = messages[0].as_strings().unwrap();
        assert_eq!(messages[0].channel(), CHANNEL_SENTENCE);
        assert_eq!(fields[0], "GP");
        assert_eq!(fields[1], "GGA");
        assert_eq!(fields[2], "120000");
        assert_eq!(fields.len(), 16);
    }

    #[test]
    fn test_corrupted_checksum_emits_nothing() {
        let mut corrupted = GGA.to_vec();
        let star = corrupted.iter().position(|&b| b == b'*').unwrap();
        corrupted[star + 2] = b'7';

        let mut handler = NmeaHandler::new(0x30, "NMEA:test", false, false);
        let (queue, out) = producer();
        handler.handle(&corrupted, &out).unwrap();
        assert!(drain(&queue, out).is_empty());
        assert_eq!(handler.dropped(), 1);
        assert_eq!(handler.sentences(), 0);
    }

    #[test]
    fn test_zda_becomes_epoch() {
        let mut handler = NmeaHandler::new(0x30, "NMEA:test", false, false);
        let (queue, out) = producer();
        handler.handle(ZDA, &out).unwrap();
        let messages = drain(&queue, out);

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].channel(), CHANNEL_EPOCH);
        assert_eq!(messages[0].as_timestamp(), Some(1_706_788_800_000));
    }

    #[test]
    fn test_raw_copy_and_split_input() {
        let mut handler = NmeaHandler::new(0x31, "NMEA:test", true, false);
        let (queue, out) = producer();
        let (first, second) = GGA.split_at(20);
        handler.handle(first, &out).unwrap();
        handler.handle(second, &out).unwrap();
        let messages = drain(&queue, out);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].channel(), channels::RAW);
        assert_eq!(messages[0].as_bytes(), Some(GGA));
        assert_eq!(messages[1].source(), 0x31);
    }

    #[test]
    fn test_reset_discards_partial_sentence() {
        let mut handler = NmeaHandler::new(0x30, "NMEA:test", false, false);
        let (queue, out) = producer();
        handler.handle(&GGA[..30], &out).unwrap();
        handler.reset();
        handler.handle(&GGA[30..], &out).unwrap();
        handler.handle(ZDA, &out).unwrap();
        let messages = drain(&queue, out);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].channel(), CHANNEL_EPOCH);
    }

    #[test]
    fn test_declared_channels() {
        let handler = NmeaHandler::new(0x30, "NMEA:test", true, false);
        let ids: Vec<ChannelId> = handler.channels().into_iter().map(|(id, _)| id).collect();
        assert!(ids.contains(&channels::RAW));
        assert!(ids.contains(&CHANNEL_EPOCH));
        assert!(ids.contains(&CHANNEL_SENTENCE));
    }
}
