use std::time::{Duration, Instant};

use chrono::Utc;
use marine_proto::ids::{channels, sources};
use marine_proto::{ChannelId, Message, SourceId};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::channel_map::ChannelInfo;
use crate::driver::{DeviceDriver, standard_channels};
use crate::error::SourceError;
use crate::queue::QueueProducer;

pub const CHANNEL_EPOCH: ChannelId = 4;
/// Missed deadlines logged individually before switching to a summary
const MAX_LOGGED_MISSES: u64 = 10;
const MISS_SUMMARY_EVERY: u64 = 1000;

/// Built-in clock source.
///
/// Pushes a monotonic millisecond count on the timestamp channel at a fixed
/// rate, and the Unix time once per second, so that other sources can be
/// aligned against a common reference.
pub struct TimerSource {
    frequency: u32,
    started: Instant,
    missed: u64,
}

impl TimerSource {
    pub fn new(frequency: u32) -> Self {
        Self {
            frequency: frequency.max(1),
            started: Instant::now(),
            missed: 0,
        }
    }

    pub fn missed_deadlines(&self) -> u64 {
        self.missed
    }

    fn period(&self) -> Duration {
        Duration::from_secs(1) / self.frequency
    }

    fn monotonic_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Count a missed deadline. Returns true if it was logged.
    fn record_miss(&mut self) -> bool {
        self.missed += 1;
        if self.missed <= MAX_LOGGED_MISSES {
            warn!("[{}] Deadline missed", self.tag());
            if self.missed == MAX_LOGGED_MISSES {
                warn!("[{}] Further missed deadlines are only summarised", self.tag());
            }
            true
        } else if self.missed % MISS_SUMMARY_EVERY == 0 {
            debug!("[{}] {} deadlines missed so far", self.tag(), self.missed);
            true
        } else {
            false
        }
    }
}

impl DeviceDriver for TimerSource {
    fn tag(&self) -> &str {
        "Timer:internal"
    }

    fn name(&self) -> &str {
        "Internal"
    }

    fn source_id(&self) -> SourceId {
        sources::TIMER
    }

    fn start(&mut self) -> Result<(), SourceError> {
        self.started = Instant::now();
        info!("[{}] Running at {} Hz", self.tag(), self.frequency);
        Ok(())
    }

    fn run(&mut self, out: &QueueProducer, cancel: &CancelToken) -> Result<(), SourceError> {
        let period = self.period();
        let mut last_second = None;
        let mut next = Instant::now();

        while !cancel.is_cancelled() {
            out.push(Message::timestamp(sources::TIMER, channels::TIMESTAMP, self.monotonic_ms()))?;

            let now = Utc::now();
            let second = now.timestamp();
            if last_second != Some(second) {
                out.push(Message::timestamp(sources::TIMER, CHANNEL_EPOCH, (second.max(0) as u64) * 1000))?;
                last_second = Some(second);
            }

            next += period;
            let current = Instant::now();
            if next <= current {
                self.record_miss();
                next = current;
                continue;
            }
            if !cancel.sleep(next - current) {
                break;
            }
        }
        Ok(())
    }

    fn channels(&self) -> Vec<(ChannelId, ChannelInfo)> {
        let mut list: Vec<(ChannelId, ChannelInfo)> = standard_channels(false);
        list.push((
            channels::TIMESTAMP,
            ChannelInfo::new("Timestamp").with_unit("ms").with_description("Monotonic, arbitrary reference"),
        ));
        list.push((CHANNEL_EPOCH, ChannelInfo::new("Epoch").with_unit("ms")));
        list
    }

    fn stop(&mut self) {
        info!("[{}] Stopped, {} deadlines missed", self.tag(), self.missed_deadlines());
    }
}
