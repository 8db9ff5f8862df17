use std::time::{Duration, Instant};
use tracing::info;

/// Dispatcher-level counters for what was consumed and written
/// (not to be confused with the per-channel statistics in the state file)
pub struct AppMetrics {
    /// Number of messages popped from the queue
    pub messages_logged: u64,
    /// Bytes appended to the data and variable files
    pub bytes_written: u64,
    /// Number of failed log writes
    pub write_errors: u64,
    /// Number of state snapshots written
    pub checkpoints_written: u64,
    /// Number of failed state snapshot writes
    pub checkpoint_errors: u64,
    pub rotations: u64,
    /// Number of failed rotation attempts
    pub rotation_errors: u64,
}

impl AppMetrics {
    /// Create a new AppMetrics instance with all counters at zero
    pub fn new() -> Self {
        Self {
            messages_logged: 0,
            bytes_written: 0,
            write_errors: 0,
            checkpoints_written: 0,
            checkpoint_errors: 0,
            rotations: 0,
            rotation_errors: 0,
        }
    }

    /// Reset all counters to zero
    pub fn reset(&mut self) {
        self.messages_logged = 0;
        self.bytes_written = 0;
        self.write_errors = 0;
        self.checkpoints_written = 0;
        self.checkpoint_errors = 0;
        self.rotations = 0;
        self.rotation_errors = 0;
    }

    /// Log current metrics to the info log
    pub fn log(&self, queue_depth: usize) {
        info!(
            "[Metrics] Messages: {}, Bytes written: {}, Write errors: {}, Checkpoints: {}/{} failed, Rotations: {}/{} failed, Queue depth: {}",
            self.messages_logged,
            self.bytes_written,
            self.write_errors,
            self.checkpoints_written,
            self.checkpoint_errors,
            self.rotations,
            self.rotation_errors,
            queue_depth
        );
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Manages periodic logging of application metrics
pub struct MetricsLogger {
    last_log: Instant,
    log_interval: Duration,
}

impl MetricsLogger {
    /// Create a new MetricsLogger with the specified logging interval
    pub fn new(log_interval: Duration) -> Self {
        Self {
            last_log: Instant::now(),
            log_interval,
        }
    }

    /// Check if it's time to log metrics, and if so, log them and reset
    /// Returns true if metrics were logged
    pub fn check_and_log(&mut self, metrics: &mut AppMetrics, queue_depth: usize) -> bool {
        if self.last_log.elapsed() >= self.log_interval {
            metrics.log(queue_depth);
            metrics.reset();
            self.last_log = Instant::now();
            true
        } else {
            false
        }
    }
}
