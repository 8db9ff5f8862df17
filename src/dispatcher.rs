use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use marine_proto::Message;
use tracing::{debug, error, info, warn};

use crate::app_metrics::{AppMetrics, MetricsLogger};
use crate::channel_map::ChannelMap;
use crate::channel_stats::{ChannelStats, StateSnapshot};
use crate::checkpoint::StateCheckpoint;
use crate::config::Config;
use crate::log_writer::LogWriter;
use crate::queue::{MessageQueue, PopResult};

/// Longest wait for a message before housekeeping runs
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const METRICS_INTERVAL: Duration = Duration::from_secs(60);
const PUBLISH_INTERVAL: Duration = Duration::from_secs(1);
/// Buffered log lines reach the disk at least this often
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Wait before a failed daily rotation is attempted again
const ROTATION_RETRY: Duration = Duration::from_secs(60);
/// Only the first few write errors of each metrics interval are logged
const MAX_LOGGED_WRITE_ERRORS: u64 = 10;

/// Latest statistics snapshot, shared with the web API
pub type SharedSnapshot = Arc<RwLock<Option<StateSnapshot>>>;

/// Requests from the signal handler to the dispatcher.
///
/// Cloning shares the flags. A rotation requested while logging is paused
/// stays pending until logging resumes.
#[derive(Debug, Clone, Default)]
pub struct LogControl {
    rotate: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
}

impl LogControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_rotation(&self) {
        self.rotate.store(true, Ordering::SeqCst);
    }

    pub fn rotation_pending(&self) -> bool {
        self.rotate.load(Ordering::SeqCst)
    }

    fn take_rotation(&self) -> bool {
        self.rotate.swap(false, Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub data_prefix: String,
    pub rotate_daily: bool,
    /// `None` disables state checkpoints
    pub state_file: Option<PathBuf>,
    pub state_interval: Duration,
    pub flush_interval: Duration,
}

impl DispatcherSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            data_prefix: config.data_prefix.clone(),
            rotate_daily: config.rotate,
            state_file: config.save_state.then(|| PathBuf::from(&config.state_file)),
            state_interval: config.state_interval(),
            flush_interval: FLUSH_INTERVAL,
        }
    }
}

/// Single consumer of the log queue.
///
/// Owns the data files and the channel statistics; nothing else writes to
/// either, so neither needs a lock.
pub struct Dispatcher {
    queue: Arc<MessageQueue>,
    channel_map: Arc<ChannelMap>,
    stats: ChannelStats,
    writer: LogWriter,
    checkpoint: Option<StateCheckpoint>,
    rotate_daily: bool,
    /// Set while a failed rotation waits to be retried
    rotation_retry_at: Option<Instant>,
    control: LogControl,
    flush_interval: Duration,
    last_flush: Instant,
    published: SharedSnapshot,
    last_publish: Instant,
    metrics: AppMetrics,
    metrics_logger: MetricsLogger,
}

impl Dispatcher {
    /// Open the first data file. Failing to open it is fatal for the logger.
    pub fn new(
        settings: &DispatcherSettings,
        queue: Arc<MessageQueue>,
        channel_map: Arc<ChannelMap>,
        control: LogControl,
        published: SharedSnapshot,
    ) -> io::Result<Self> {
        let writer = LogWriter::open(&settings.data_prefix, today())?;
        Ok(Self {
            queue,
            channel_map,
            stats: ChannelStats::new(),
            writer,
            checkpoint: settings
                .state_file
                .as_ref()
                .map(|path| StateCheckpoint::new(path, settings.state_interval)),
            rotate_daily: settings.rotate_daily,
            rotation_retry_at: None,
            control,
            flush_interval: settings.flush_interval,
            last_flush: Instant::now(),
            published,
            last_publish: Instant::now(),
            metrics: AppMetrics::new(),
            metrics_logger: MetricsLogger::new(METRICS_INTERVAL),
        })
    }

    /// Seed statistics from a previous run
    pub fn restore(&mut self, snapshot: &StateSnapshot) {
        self.stats.restore(snapshot);
        info!("Restored statistics for {} channels", snapshot.channels.len());
        self.publish();
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    pub fn data_path(&self) -> PathBuf {
        self.writer.data_path().to_path_buf()
    }

    /// Drain the queue until every producer has gone, then flush and write
    /// a final checkpoint.
    pub fn run(mut self) -> ChannelStats {
        info!("Dispatcher started, logging to {}", self.writer.data_path().display());
        loop {
            if self.control.is_paused() {
                self.wait_while_paused();
            }
            match self.queue.pop_timeout(POLL_INTERVAL) {
                PopResult::Message(message) => self.handle(message),
                PopResult::Empty => {}
                PopResult::Closed => break,
            }
            self.housekeeping();
        }
        self.shutdown();
        self.stats
    }

    /// Messages stay queued while paused; producers are not blocked
    fn wait_while_paused(&mut self) {
        info!("Logging paused");
        self.flush();
        while self.control.is_paused() {
            std::thread::sleep(POLL_INTERVAL);
        }
        info!("Logging resumed");
    }

    fn handle(&mut self, message: Message) {
        self.metrics.messages_logged += 1;
        self.stats.update(&message);
        self.channel_map.update_from_message(&message);
        self.write(&message);
    }

    fn write(&mut self, message: &Message) {
        match self.writer.write(message) {
            Ok(n) => self.metrics.bytes_written += n as u64,
            Err(e) => {
                self.metrics.write_errors += 1;
                if self.metrics.write_errors <= MAX_LOGGED_WRITE_ERRORS {
                    error!("Failed to write to {}: {}", self.writer.data_path().display(), e);
                }
            }
        }
    }

    fn housekeeping(&mut self) {
        self.housekeeping_at(today());
    }

    fn housekeeping_at(&mut self, date: NaiveDate) {
        let requested = self.control.take_rotation();
        let backing_off = self.rotation_retry_at.is_some_and(|at| Instant::now() < at);
        let daily = self.rotate_daily && self.writer.needs_rotation(date) && !backing_off;
        if requested || daily {
            self.rotate(date);
        }

        // The data file is always at least as current as the state file
        let checkpoint_due = self.checkpoint.as_ref().is_some_and(StateCheckpoint::is_due);
        if checkpoint_due || self.last_flush.elapsed() >= self.flush_interval {
            self.flush();
        }

        if let Some(checkpoint) = self.checkpoint.as_mut() {
            let stats = &self.stats;
            let channel_map = &self.channel_map;
            match checkpoint.check_and_save(|| stats.snapshot(channel_map)) {
                Some(Ok(())) => self.metrics.checkpoints_written += 1,
                Some(Err(e)) => {
                    self.metrics.checkpoint_errors += 1;
                    warn!("Failed to save state to {}: {}", checkpoint.path().display(), e);
                }
                None => {}
            }
        }

        if self.last_publish.elapsed() >= PUBLISH_INTERVAL {
            self.publish();
        }

        self.metrics_logger.check_and_log(&mut self.metrics, self.queue.len());
    }

    /// Start new data files and repeat the channel map at their head
    fn rotate(&mut self, date: NaiveDate) {
        if let Err(e) = self.writer.rotate(date) {
            self.metrics.rotation_errors += 1;
            if self.rotation_retry_at.is_none() {
                error!(
                    "Log rotation failed, continuing with {} and retrying in {:?}: {}",
                    self.writer.data_path().display(),
                    ROTATION_RETRY,
                    e
                );
            } else {
                debug!("Log rotation failed again: {}", e);
            }
            self.rotation_retry_at = Some(Instant::now() + ROTATION_RETRY);
            return;
        }
        if self.rotation_retry_at.take().is_some() {
            info!("Log rotation recovered");
        }
        self.metrics.rotations += 1;
        for message in self.channel_map.all_broadcast_messages() {
            self.write(&message);
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            self.metrics.write_errors += 1;
            if self.metrics.write_errors <= MAX_LOGGED_WRITE_ERRORS {
                error!("Failed to flush {}: {}", self.writer.data_path().display(), e);
            }
        }
        self.last_flush = Instant::now();
    }

    fn publish(&mut self) {
        let snapshot = self.stats.snapshot(&self.channel_map);
        *self.published.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
        self.last_publish = Instant::now();
    }

    fn shutdown(&mut self) {
        debug!("Queue closed, shutting down dispatcher");
        self.flush();
        if let Some(checkpoint) = self.checkpoint.as_mut() {
            match checkpoint.save(&self.stats.snapshot(&self.channel_map)) {
                Ok(()) => info!("Final state saved to {}", checkpoint.path().display()),
                Err(e) => warn!("Failed to save final state: {}", e),
            }
        }
        self.publish();
        self.metrics.log(0);
        info!(
            "Dispatcher stopped after {} channels, {} bytes in current file",
            self.stats.len(),
            self.writer.bytes_written()
        );
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}
