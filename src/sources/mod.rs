//! Source drivers.
//!
//! Stream based sources (NMEA, N2K, Datawell, raw serial/network) share one
//! read loop in [`StreamSource`] and only differ in their
//! [`StreamHandler`]. The timer source has no transport and implements
//! [`DeviceDriver`] directly.

pub mod datawell;
pub mod n2k;
pub mod nmea;
pub mod raw;
pub mod timer;

use std::time::{Duration, Instant};

use marine_proto::ids::channels;
use marine_proto::{ChannelId, Message, SourceId};
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::channel_map::ChannelInfo;
use crate::config::{SourceConfig, SourceType};
use crate::driver::DeviceDriver;
use crate::error::{ConfigError, QueueError, SourceError};
use crate::queue::QueueProducer;
use crate::transport::{self, Endpoint, ReadOutcome, RetryPolicy, RetryState, Transport};

const READ_BUFFER_LEN: usize = 1024;

/// Protocol specific half of a stream source
pub trait StreamHandler: Send {
    fn channels(&self) -> Vec<(ChannelId, ChannelInfo)>;

    /// Decode newly received bytes and push the results
    fn handle(&mut self, data: &[u8], out: &QueueProducer) -> Result<(), QueueError>;

    /// Discard partial state after a reconnect
    fn reset(&mut self) {}

    /// Called after each read timeout with no data
    fn idle(&mut self, _out: &QueueProducer) -> Result<(), QueueError> {
        Ok(())
    }

    /// Called once when the loop ends, to push anything still buffered
    fn finish(&mut self, _out: &QueueProducer) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Generic driver for anything that reads bytes from an [`Endpoint`]
pub struct StreamSource<H: StreamHandler> {
    tag: String,
    name: String,
    source: SourceId,
    endpoint: Endpoint,
    timeout: Duration,
    retry: RetryPolicy,
    retry_state: RetryState,
    transport: Option<Transport>,
    handler: H,
}

impl<H: StreamHandler> StreamSource<H> {
    pub fn new(tag: String, name: String, source: SourceId, endpoint: Endpoint, timeout: Duration, handler: H) -> Self {
        Self {
            tag,
            name,
            source,
            endpoint,
            timeout,
            retry: RetryPolicy::default(),
            retry_state: RetryState::new(),
            transport: None,
            handler,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    fn connected(&self, out: &QueueProducer) -> Result<(), QueueError> {
        out.push(Message::string(
            self.source,
            channels::INFO,
            format!("Connected to {}", self.endpoint),
        ))
    }

    fn disconnect(&mut self, out: &QueueProducer, reason: String) -> Result<(), QueueError> {
        warn!("[{}] {}", self.tag, reason);
        self.transport = None;
        self.retry_state.disconnected(&self.retry);
        self.handler.reset();
        out.push(Message::string(self.source, channels::WARNING, reason))
    }
}

impl<H: StreamHandler> DeviceDriver for StreamSource<H> {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn source_id(&self) -> SourceId {
        self.source
    }

    fn start(&mut self) -> Result<(), SourceError> {
        let transport = self.endpoint.open()?;
        info!("[{}] Opened {} as source {:#04x}", self.tag, self.endpoint, self.source);
        self.retry_state.connected();
        self.transport = Some(transport);
        Ok(())
    }

    fn run(&mut self, out: &QueueProducer, cancel: &CancelToken) -> Result<(), SourceError> {
        let mut buf = [0u8; READ_BUFFER_LEN];
        let mut last_data = Instant::now();
        if self.transport.is_some() {
            self.connected(out)?;
        }

        while !cancel.is_cancelled() {
            if self.transport.is_none() {
                match transport::open_with_retry(&self.endpoint, &self.retry, &mut self.retry_state, cancel, &self.tag)? {
                    Some(t) => {
                        self.transport = Some(t);
                        last_data = Instant::now();
                        self.connected(out)?;
                    }
                    None => break,
                }
            }
            let Some(transport) = self.transport.as_mut() else {
                continue;
            };

            match transport.read_chunk(&mut buf) {
                Ok(ReadOutcome::Data(n)) => {
                    last_data = Instant::now();
                    self.handler.handle(&buf[..n], out)?;
                }
                Ok(ReadOutcome::Idle) => {
                    self.handler.idle(out)?;
                    if last_data.elapsed() >= self.timeout {
                        let reason = format!("No data for {} s, reconnecting", self.timeout.as_secs());
                        self.disconnect(out, reason)?;
                    }
                }
                Ok(ReadOutcome::Eof) => {
                    info!("[{}] End of input", self.tag);
                    break;
                }
                Err(e) => {
                    if !self.endpoint.is_reconnectable() {
                        self.handler.finish(out)?;
                        return Err(e.into());
                    }
                    self.disconnect(out, e.to_string())?;
                }
            }
        }

        self.handler.finish(out)?;
        Ok(())
    }

    fn channels(&self) -> Vec<(ChannelId, ChannelInfo)> {
        self.handler.channels()
    }

    fn stop(&mut self) {
        if self.transport.take().is_some() {
            info!("[{}] Closed {}", self.tag, self.endpoint);
        }
    }
}

/// Build the driver for one configured source
pub fn build_driver(section: &str, config: &SourceConfig) -> Result<Box<dyn DeviceDriver>, ConfigError> {
    let source = config.validate(section)?;
    let endpoint = config.endpoint(section)?;
    let tag = format!("{}:{}", config.source_type.label(), section);
    let name = config.display_name(section);
    let timeout = config.timeout();

    let driver: Box<dyn DeviceDriver> = match config.source_type {
        SourceType::Nmea => {
            let handler = nmea::NmeaHandler::new(source, &tag, config.raw, config.require_checksum);
            Box::new(StreamSource::new(tag, name, source, endpoint, timeout, handler))
        }
        SourceType::N2k => {
            let handler = n2k::N2kHandler::new(source, &tag, config.raw, config.pgn_source_filter.clone());
            Box::new(StreamSource::new(tag, name, source, endpoint, timeout, handler))
        }
        SourceType::Datawell => {
            let handler = datawell::DatawellHandler::new(source, &tag, config.raw, config.spectrum);
            Box::new(StreamSource::new(tag, name, source, endpoint, timeout, handler))
        }
        SourceType::Serial | SourceType::Network => {
            let (min, max) = config.chunk_limits(section)?;
            let handler = raw::RawHandler::new(source, &tag, min, max);
            Box::new(StreamSource::new(tag, name, source, endpoint, timeout, handler))
        }
    };
    Ok(driver)
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use test_support::{drain, producer};

    use crate::error::ConnectionError;

    struct Echo {
        reset_count: usize,
    }

    impl StreamHandler for Echo {
        fn channels(&self) -> Vec<(ChannelId, ChannelInfo)> {
            vec![(4, ChannelInfo::new("Echo"))]
        }

        fn handle(&mut self, data: &[u8], out: &QueueProducer) -> Result<(), QueueError> {
            out.push(Message::bytes(0x60, 4, data.to_vec()))
        }

        fn reset(&mut self) {
            self.reset_count += 1;
        }
    }

    #[test]
    fn test_stream_source_replays_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"payload").unwrap();
        let endpoint = Endpoint::File {
            path: file.path().to_path_buf(),
        };
        let mut driver = StreamSource::new(
            "Test:echo".to_string(),
            "echo".to_string(),
            0x60,
            endpoint,
            Duration::from_secs(60),
            Echo { reset_count: 0 },
        );
        driver.start().unwrap();

        let (queue, out) = producer();
        driver.run(&out, &CancelToken::new()).unwrap();
        driver.stop();
        let messages = drain(&queue, out);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].channel(), channels::INFO);
        assert!(messages[0].as_str().unwrap().starts_with("Connected to"));
        assert_eq!(messages[1].as_bytes(), Some(&b"payload"[..]));
        assert_eq!(driver.handler().reset_count, 0);
    }

    #[test]
    fn test_flapping_link_runs_out_of_attempts() {
        // Accepts and immediately drops every connection
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            for stream in listener.incoming().take(3) {
                drop(stream);
            }
        });

        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_attempts: Some(3),
            stable_after: Duration::from_secs(60),
        };
        let mut driver = StreamSource::new(
            "Test:echo".to_string(),
            "echo".to_string(),
            0x60,
            Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port,
            },
            Duration::from_secs(60),
            Echo { reset_count: 0 },
        )
        .with_retry(policy);
        driver.start().unwrap();

        let (queue, out) = producer();
        let result = driver.run(&out, &CancelToken::new());
        driver.stop();
        server.join().unwrap();
        assert!(matches!(
            result,
            Err(SourceError::Connection(ConnectionError::RetriesExhausted { attempts: 3, .. }))
        ));
        assert_eq!(driver.handler().reset_count, 3);
        let warnings = drain(&queue, out)
            .iter()
            .filter(|m| m.channel() == channels::WARNING)
            .count();
        assert_eq!(warnings, 3);
    }

    #[test]
    fn test_start_fails_for_missing_device() {
        let mut driver = StreamSource::new(
            "Test:echo".to_string(),
            "echo".to_string(),
            0x60,
            Endpoint::File {
                path: "/nonexistent/input".into(),
            },
            Duration::from_secs(60),
            Echo { reset_count: 0 },
        );
        assert!(matches!(driver.start(), Err(SourceError::Connection(_))));
    }

    #[test]
    fn test_build_driver() {
        let config: SourceConfig =
            serde_json::from_str(r#"{ "type": "nmea", "file": "capture.nmea", "name": "Bridge GPS" }"#).unwrap();
        let driver = build_driver("gps", &config).unwrap();
        assert_eq!(driver.tag(), "NMEA:gps");
        assert_eq!(driver.name(), "Bridge GPS");
        assert_eq!(driver.source_id(), 0x30);

        let config: SourceConfig = serde_json::from_str(r#"{ "type": "serial" }"#).unwrap();
        assert!(build_driver("raw", &config).is_err());
    }
}
