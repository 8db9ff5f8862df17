use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use marine_proto::{Message, Payload};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::queue::{MessageQueue, PopResult};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// JSON form of one message on the monitor feed
#[derive(Debug, Serialize)]
struct MonitorRecord<'a> {
    source: u8,
    channel: u8,
    kind: &'static str,
    /// Arrival time, seconds since the epoch
    timestamp: f64,
    value: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

/// Live monitor sink
///
/// Drains its own queue from the fan-out and sends every message as a JSON
/// datagram to the configured destination. Losing datagrams is acceptable;
/// the data log is the record.
pub struct LiveMonitor {
    queue: Arc<MessageQueue>,
    socket: Option<UdpSocket>,
    destination: String,
    error_count: u64,
    message_count: u64,
}

impl LiveMonitor {
    /// `destination` e.g. "192.168.1.255:40200"
    pub fn new(queue: Arc<MessageQueue>, destination: String) -> Self {
        let socket = match Self::create_socket(&destination) {
            Ok(sock) => {
                debug!("Live monitor initialized: {}", destination);
                Some(sock)
            }
            Err(e) => {
                error!("Failed to create UDP socket: {}. Live monitor disabled.", e);
                None
            }
        };

        Self {
            queue,
            socket,
            destination,
            error_count: 0,
            message_count: 0,
        }
    }

    fn create_socket(destination: &str) -> Result<UdpSocket, std::io::Error> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;

        if destination.contains(".255") {
            socket.set_broadcast(true)?;
        }

        socket.set_nonblocking(true)?;

        Ok(socket)
    }

    /// Forward until the queue closes. The queue is drained even when the
    /// socket could not be created so producers are never held back.
    pub fn run(mut self) -> (u64, u64) {
        info!("Live monitor sending to {}", self.destination);
        loop {
            match self.queue.pop_timeout(POLL_INTERVAL) {
                PopResult::Message(message) => self.send(&message),
                PopResult::Empty => {}
                PopResult::Closed => break,
            }
        }
        info!(
            "Live monitor stopped: {} sent, {} errors",
            self.message_count, self.error_count
        );
        (self.message_count, self.error_count)
    }

    fn send(&mut self, message: &Message) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };

        let json = match serde_json::to_string(&to_record(message)) {
            Ok(j) => j,
            Err(e) => {
                if self.error_count < 10 {
                    warn!("Failed to convert message to JSON: {}", e);
                }
                self.error_count += 1;
                return;
            }
        };

        match socket.send_to(json.as_bytes(), &self.destination) {
            Ok(_) => {
                self.message_count += 1;
                if self.message_count % 1000 == 0 {
                    debug!("Sent {} messages to live monitor", self.message_count);
                }
            }
            Err(e) => {
                if self.error_count < 10 {
                    warn!("Failed to send UDP packet: {}", e);
                }
                self.error_count += 1;
            }
        }
    }
}

fn to_record(message: &Message) -> MonitorRecord<'_> {
    let value = match message.payload() {
        Payload::Error(v) | Payload::Float(v) => serde_json::json!(v),
        Payload::Undefined => serde_json::Value::Null,
        Payload::Timestamp(ms) => serde_json::json!(ms),
        Payload::Bytes(_) => serde_json::json!(message.render_payload()),
        Payload::String(s) => serde_json::json!(s),
        Payload::StringArray(a) => serde_json::json!(a),
        Payload::FloatArray(a) => serde_json::json!(a),
    };
    MonitorRecord {
        source: message.source(),
        channel: message.channel(),
        kind: message.kind().name(),
        timestamp: message.timestamp_utc().timestamp_millis() as f64 / 1000.0,
        value,
        name: message.as_str().filter(|_| message.channel() == marine_proto::ids::channels::NAME),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Fanout;

    #[test]
    fn test_record_fields() {
        let message = Message::float(0x60, 13, 1.5);
        let json = serde_json::to_value(to_record(&message)).unwrap();
        assert_eq!(json["source"], 0x60);
        assert_eq!(json["channel"], 13);
        assert_eq!(json["kind"], "float");
        assert_eq!(json["value"], 1.5);
        assert!(json.get("name").is_none());
    }

    #[test]
    fn test_record_bytes_as_hex() {
        let message = Message::bytes(0x70, 3, vec![0xde, 0xad]);
        let json = serde_json::to_value(to_record(&message)).unwrap();
        assert_eq!(json["value"], "dead");
    }

    #[test]
    fn test_record_source_name() {
        let message = Message::string(0x30, 0, "GPS");
        let json = serde_json::to_value(to_record(&message)).unwrap();
        assert_eq!(json["name"], "GPS");
    }

    #[test]
    fn test_sends_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let destination = receiver.local_addr().unwrap().to_string();

        let queue = Arc::new(MessageQueue::new());
        let mut fanout = Fanout::new();
        fanout.add_sink(Arc::clone(&queue));
        let producer = fanout.register().unwrap();
        producer.push(Message::timestamp(0x02, 2, 1234)).unwrap();
        drop(producer);

        let (sent, errors) = LiveMonitor::new(queue, destination).run();
        assert_eq!((sent, errors), (1, 0));

        let mut buf = [0u8; 1024];
        let n = receiver.recv(&mut buf).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(json["kind"], "timestamp");
        assert_eq!(json["value"], 1234);
    }
}
