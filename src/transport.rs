use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::error::ConnectionError;

/// Upper bound on a single blocking read, so cancellation is seen promptly
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a source reads its bytes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Serial { device: String, baud: u32 },
    Tcp { host: String, port: u16 },
    /// Replay of a captured stream. Ends at end of file.
    File { path: PathBuf },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Serial { device, baud } => write!(f, "{} ({} baud)", device, baud),
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::File { path } => write!(f, "{}", path.display()),
        }
    }
}

impl Endpoint {
    /// Streams that can be reopened after an error. Files are read once.
    pub fn is_reconnectable(&self) -> bool {
        !matches!(self, Endpoint::File { .. })
    }

    pub fn open(&self) -> Result<Transport, ConnectionError> {
        let inner = match self {
            Endpoint::Serial { device, baud } => {
                let port = serialport::new(device, *baud)
                    .data_bits(DataBits::Eight)
                    .parity(Parity::None)
                    .stop_bits(StopBits::One)
                    .flow_control(FlowControl::None)
                    .timeout(READ_TIMEOUT)
                    .open()
                    .map_err(|e| ConnectionError::Open {
                        endpoint: self.to_string(),
                        reason: e.to_string(),
                    })?;
                Inner::Serial(port)
            }
            Endpoint::Tcp { host, port } => {
                let stream = connect_tcp(host, *port).map_err(|e| ConnectionError::Open {
                    endpoint: self.to_string(),
                    reason: e.to_string(),
                })?;
                Inner::Tcp(stream)
            }
            Endpoint::File { path } => {
                let file = File::open(path).map_err(|e| ConnectionError::Open {
                    endpoint: self.to_string(),
                    reason: e.to_string(),
                })?;
                Inner::File(file)
            }
        };
        Ok(Transport {
            label: self.to_string(),
            inner,
        })
    }
}

fn connect_tcp(host: &str, port: u16) -> io::Result<TcpStream> {
    let mut last_error = io::Error::new(io::ErrorKind::NotFound, "host did not resolve");
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                stream.set_read_timeout(Some(READ_TIMEOUT))?;
                return Ok(stream);
            }
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

enum Inner {
    Serial(Box<dyn SerialPort>),
    Tcp(TcpStream),
    File(File),
}

/// Result of one bounded read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    /// Timed out with nothing to read
    Idle,
    /// End of a replayed file
    Eof,
}

/// An open byte stream with a bounded read timeout
pub struct Transport {
    label: String,
    inner: Inner,
}

impl Transport {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, ConnectionError> {
        let result = match &mut self.inner {
            Inner::Serial(port) => port.read(buf),
            Inner::Tcp(stream) => stream.read(buf),
            Inner::File(file) => file.read(buf),
        };
        match result {
            Ok(0) => match self.inner {
                Inner::File(_) => Ok(ReadOutcome::Eof),
                Inner::Serial(_) => Ok(ReadOutcome::Idle),
                Inner::Tcp(_) => Err(ConnectionError::Closed {
                    endpoint: self.label.clone(),
                }),
            },
            Ok(n) => Ok(ReadOutcome::Data(n)),
            // A read timeout is expected and just means no data yet
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(ReadOutcome::Idle)
            }
            Err(source) => Err(ConnectionError::Io {
                endpoint: self.label.clone(),
                source,
            }),
        }
    }
}

/// Reconnection policy with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
    /// A connection that lasts this long clears the failure count
    pub stable_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(10),
            stable_after: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1 based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }
}

/// Consecutive connection failures of one endpoint.
///
/// Failed opens and connections lost before `stable_after` both count, so
/// a link that keeps connecting and dropping still runs out of attempts.
#[derive(Debug, Default)]
pub struct RetryState {
    failures: u32,
    connected_at: Option<Instant>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn connected(&mut self) {
        self.connected_at = Some(Instant::now());
    }

    pub fn disconnected(&mut self, policy: &RetryPolicy) {
        match self.connected_at.take() {
            Some(at) if at.elapsed() >= policy.stable_after => self.failures = 0,
            _ => self.failures += 1,
        }
    }
}

/// Open an endpoint, retrying with backoff on failure. Failures already
/// recorded in `state` count against the policy's attempt limit.
///
/// Returns `Ok(None)` if cancelled while waiting.
pub fn open_with_retry(
    endpoint: &Endpoint,
    policy: &RetryPolicy,
    state: &mut RetryState,
    cancel: &CancelToken,
    tag: &str,
) -> Result<Option<Transport>, ConnectionError> {
    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        if policy.exhausted(state.failures) {
            return Err(ConnectionError::RetriesExhausted {
                endpoint: endpoint.to_string(),
                attempts: state.failures,
            });
        }
        match endpoint.open() {
            Ok(transport) => {
                info!("[{}] Opened {}", tag, endpoint);
                state.connected();
                return Ok(Some(transport));
            }
            Err(e) => {
                warn!("[{}] {}", tag, e);
                if !endpoint.is_reconnectable() {
                    return Err(e);
                }
                state.failures += 1;
                if policy.exhausted(state.failures) {
                    continue;
                }
                let wait = policy.delay(state.failures);
                warn!("[{}] Retrying in {} ms...", tag, wait.as_millis());
                if !cancel.sleep(wait) {
                    return Ok(None);
                }
            }
        }
    }
}
