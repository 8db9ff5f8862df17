use marine_proto::ids::channels;
use marine_proto::{ChannelId, Message, SourceId};
use tracing::debug;

use crate::channel_map::ChannelInfo;
use crate::driver::standard_channels;
use crate::error::QueueError;
use crate::queue::QueueProducer;
use crate::sources::StreamHandler;

/// Logs an undecoded byte stream in chunks on the raw channel
pub struct RawHandler {
    source: SourceId,
    tag: String,
    min_bytes: usize,
    max_bytes: usize,
    buffer: Vec<u8>,
    chunks: u64,
}

impl RawHandler {
    pub fn new(source: SourceId, tag: &str, min_bytes: usize, max_bytes: usize) -> Self {
        Self {
            source,
            tag: tag.to_string(),
            min_bytes,
            max_bytes: max_bytes.max(min_bytes),
            buffer: Vec::with_capacity(max_bytes),
            chunks: 0,
        }
    }

    fn push_chunk(&mut self, len: usize, out: &QueueProducer) -> Result<(), QueueError> {
        let chunk: Vec<u8> = self.buffer.drain(..len).collect();
        self.chunks += 1;
        if self.chunks % 1000 == 0 {
            debug!("[{}] {} chunks logged", self.tag, self.chunks);
        }
        out.push(Message::bytes(self.source, channels::RAW, chunk))
    }
}

impl StreamHandler for RawHandler {
    fn channels(&self) -> Vec<(ChannelId, ChannelInfo)> {
        standard_channels(true)
    }

    fn handle(&mut self, data: &[u8], out: &QueueProducer) -> Result<(), QueueError> {
        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= self.max_bytes {
            self.push_chunk(self.max_bytes, out)?;
        }
        if self.buffer.len() >= self.min_bytes {
            self.push_chunk(self.buffer.len(), out)?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }

    fn finish(&mut self, out: &QueueProducer) -> Result<(), QueueError> {
        if !self.buffer.is_empty() {
            self.push_chunk(self.buffer.len(), out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::test_support::{drain, producer};

    #[test]
    fn test_waits_for_min_bytes() {
        let mut handler = RawHandler::new(0x70, "Serial:test", 4, 16);
        let (queue, out) = producer();
        handler.handle(b"ab", &out).unwrap();
        handler.handle(b"cd", &out).unwrap();
        handler.handle(b"e", &out).unwrap();
        handler.finish(&out).unwrap();
        let messages = drain(&queue, out);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].as_bytes(), Some(&b"abcd"[..]));
        assert_eq!(messages[1].as_bytes(), Some(&b"e"[..]));
        assert!(messages.iter().all(|m| m.channel() == channels::RAW));
    }

    #[test]
    fn test_splits_at_max_bytes() {
        let mut handler = RawHandler::new(0x70, "Serial:test", 2, 4);
        let (queue, out) = producer();
        handler.handle(b"0123456789", &out).unwrap();
        let messages = drain(&queue, out);

        let chunks: Vec<&[u8]> = messages.iter().map(|m| m.as_bytes().unwrap()).collect();
        assert_eq!(chunks, vec![&b"0123"[..], &b"4567"[..], &b"89"[..]]);
    }

    #[test]
    fn test_reset_drops_partial_chunk() {
        let mut handler = RawHandler::new(0x70, "Serial:test", 8, 16);
        let (queue, out) = producer();
        handler.handle(b"abc", &out).unwrap();
        handler.reset();
        handler.finish(&out).unwrap();
        assert!(drain(&queue, out).is_empty());
    }
}
