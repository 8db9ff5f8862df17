use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use marine_proto::{ChannelId, Message, SourceId};
use serde::{Deserialize, Serialize};

use crate::channel_map::ChannelMap;

/// Longest rendered value kept per channel
const MAX_VALUE_LEN: usize = 128;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStat {
    pub count: u64,
    pub last_value: String,
    pub last_timestamp: DateTime<Utc>,
}

/// One channel in a state snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatEntry {
    pub source: SourceId,
    pub channel: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub count: u64,
    pub last_value: String,
    pub last_timestamp: DateTime<Utc>,
}

/// Point-in-time copy of all channel statistics, as written to the state
/// file and served by the web API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub channels: Vec<StatEntry>,
}

/// Per `(source, channel)` message statistics. Owned and mutated by the
/// dispatcher thread only.
#[derive(Debug, Default)]
pub struct ChannelStats {
    entries: BTreeMap<(SourceId, ChannelId), ChannelStat>,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, message: &Message) {
        let value = truncate(message.render_payload());
        let timestamp = message.timestamp_utc();
        self.entries
            .entry((message.source(), message.channel()))
            .and_modify(|stat| {
                stat.count += 1;
                stat.last_value = value.clone();
                stat.last_timestamp = timestamp;
            })
            .or_insert_with(|| ChannelStat {
                count: 1,
                last_value: value,
                last_timestamp: timestamp,
            });
    }

    pub fn get(&self, source: SourceId, channel: ChannelId) -> Option<&ChannelStat> {
        self.entries.get(&(source, channel))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_count(&self) -> u64 {
        self.entries.values().map(|s| s.count).sum()
    }

    pub fn snapshot(&self, channel_map: &ChannelMap) -> StateSnapshot {
        StateSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            channels: self
                .entries
                .iter()
                .map(|(&(source, channel), stat)| StatEntry {
                    source,
                    channel,
                    name: channel_map.get(source, channel).map(|info| info.name),
                    count: stat.count,
                    last_value: stat.last_value.clone(),
                    last_timestamp: stat.last_timestamp,
                })
                .collect(),
        }
    }

    /// Warm restart from a previous snapshot. Existing entries are kept.
    pub fn restore(&mut self, snapshot: &StateSnapshot) {
        for entry in &snapshot.channels {
            self.entries
                .entry((entry.source, entry.channel))
                .or_insert_with(|| ChannelStat {
                    count: entry.count,
                    last_value: entry.last_value.clone(),
                    last_timestamp: entry.last_timestamp,
                });
        }
    }
}

fn truncate(mut value: String) -> String {
    if value.len() > MAX_VALUE_LEN {
        let mut end = MAX_VALUE_LEN;
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        value.truncate(end);
    }
    value
}
