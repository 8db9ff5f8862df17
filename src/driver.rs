use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use marine_proto::ids::channels;
use marine_proto::{ChannelId, SourceId};
use serde::Serialize;

use crate::cancel::CancelToken;
use crate::channel_map::ChannelInfo;
use crate::error::SourceError;
use crate::queue::QueueProducer;

/// Contract every source type implements.
///
/// The orchestrator calls `start` once on the main thread, then moves the
/// driver to its own thread and calls `run` until it returns. `run` must
/// check `cancel` at least once per read timeout. `stop` releases the
/// device and is called after `run` returns or when `start` failed.
pub trait DeviceDriver: Send {
    /// Log prefix, e.g. `NMEA:gps`
    fn tag(&self) -> &str;

    fn name(&self) -> &str;

    fn source_id(&self) -> SourceId;

    /// Open the device. Failure here is what `required` applies to.
    fn start(&mut self) -> Result<(), SourceError>;

    /// Read, decode and push until cancelled or the input ends
    fn run(&mut self, out: &QueueProducer, cancel: &CancelToken) -> Result<(), SourceError>;

    /// Every channel this source can produce
    fn channels(&self) -> Vec<(ChannelId, ChannelInfo)>;

    fn stop(&mut self);
}

/// Reserved channels shared by all sources. The raw channel is only listed
/// when the source logs raw data.
pub fn standard_channels(raw: bool) -> Vec<(ChannelId, ChannelInfo)> {
    let mut ids = vec![channels::NAME, channels::MAP];
    if raw {
        ids.push(channels::RAW);
    }
    ids.extend([channels::INFO, channels::WARNING, channels::ERROR]);
    ids.into_iter()
        .filter_map(|id| channels::reserved_name(id).map(|name| (id, ChannelInfo::new(name))))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Starting,
    Running,
    /// Optional source that failed to start
    Skipped,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source: SourceId,
    pub tag: String,
    pub name: String,
    pub required: bool,
    pub state: SourceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle state of every configured source, shared with the web API
#[derive(Default)]
pub struct SourceRegistry {
    entries: RwLock<BTreeMap<SourceId, SourceStatus>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, driver: &dyn DeviceDriver, required: bool) {
        let status = SourceStatus {
            source: driver.source_id(),
            tag: driver.tag().to_string(),
            name: driver.name().to_string(),
            required,
            state: SourceState::Starting,
            error: None,
            updated_at: Utc::now(),
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(status.source, status);
    }

    pub fn set_state(&self, source: SourceId, state: SourceState, error: Option<String>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(status) = entries.get_mut(&source) {
            status.state = state;
            status.error = error;
            status.updated_at = Utc::now();
        }
    }

    pub fn get(&self, source: SourceId) -> Option<SourceStatus> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&source)
            .cloned()
    }

    pub fn all(&self) -> Vec<SourceStatus> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.state == SourceState::Running)
            .count()
    }
}
