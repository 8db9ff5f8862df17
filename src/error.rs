use std::io;

/// Configuration problems. Fatal for required sources, logged and skipped
/// for optional ones.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unable to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("[{section}] missing parameter '{parameter}'")]
    Missing {
        section: String,
        parameter: &'static str,
    },

    #[error("[{section}] invalid value for '{parameter}': {reason}")]
    Invalid {
        section: String,
        parameter: &'static str,
        reason: String,
    },

    #[error("Source id {id:#04x} is used by both [{first}] and [{second}]")]
    DuplicateSource { id: u8, first: String, second: String },
}

/// Transport open and read failures
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Unable to open {endpoint}: {reason}")]
    Open { endpoint: String, reason: String },

    #[error("I/O error on {endpoint}: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("Connection to {endpoint} closed by peer")]
    Closed { endpoint: String },

    #[error("Gave up on {endpoint} after {attempts} attempts")]
    RetriesExhausted { endpoint: String, attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is closed")]
    Closed,

    /// Memory exhausted while growing the queue. Not recoverable.
    #[error("Unable to allocate queue storage")]
    Allocation,
}

/// Everything a device driver can fail with
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl SourceError {
    /// Errors after which the whole process has to stop
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Queue(QueueError::Allocation))
    }
}

/// Checkpoint write failures. Logged and retried on the next interval.
#[derive(Debug, thiserror::Error)]
pub enum StateWriteError {
    #[error("State file I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("State file format error: {0}")]
    Format(#[from] serde_json::Error),
}
