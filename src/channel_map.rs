use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use marine_proto::ids::channels;
use marine_proto::{ChannelId, Message, SourceId};
use serde::{Deserialize, Serialize};

/// Human readable description of one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChannelInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unit: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl ChannelInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = unit.to_string();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

/// Flat view of one map entry, as exported to the web API
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelEntry {
    pub source: SourceId,
    pub source_name: Option<String>,
    pub channel: ChannelId,
    #[serde(flatten)]
    pub info: ChannelInfo,
}

#[derive(Default)]
struct Inner {
    sources: BTreeMap<SourceId, String>,
    channels: BTreeMap<(SourceId, ChannelId), ChannelInfo>,
}

/// Resolution table from `(source, channel)` to names.
///
/// Channel ids repeat across sources, so every lookup uses the pair.
/// Entries are only ever added or renamed, never removed.
#[derive(Default)]
pub struct ChannelMap {
    inner: RwLock<Inner>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source's declared channels
    pub fn declare(&self, source: SourceId, source_name: &str, declared: &[(ChannelId, ChannelInfo)]) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.sources.insert(source, source_name.to_string());
        for (channel, info) in declared {
            inner.channels.insert((source, *channel), info.clone());
        }
    }

    pub fn set_source_name(&self, source: SourceId, name: &str) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.sources.insert(source, name.to_string());
    }

    /// Rename a channel, keeping any unit and description already known
    pub fn set_channel_name(&self, source: SourceId, channel: ChannelId, name: &str) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner
            .channels
            .entry((source, channel))
            .and_modify(|info| info.name = name.to_string())
            .or_insert_with(|| ChannelInfo::new(name));
    }

    /// Apply an in-band naming message: a string on channel 0 names the
    /// source, a string array on channel 1 names channels by index.
    /// Returns true if the message was a naming message.
    pub fn update_from_message(&self, message: &Message) -> bool {
        match message.channel() {
            channels::NAME => match message.as_str() {
                Some(name) => {
                    self.set_source_name(message.source(), name);
                    true
                }
                None => false,
            },
            channels::MAP => match message.as_strings() {
                Some(names) => {
                    for (index, name) in names.iter().enumerate() {
                        if name.is_empty() || index > marine_proto::ids::MAX_ID as usize {
                            continue;
                        }
                        self.set_channel_name(message.source(), index as ChannelId, name);
                    }
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    pub fn get(&self, source: SourceId, channel: ChannelId) -> Option<ChannelInfo> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.channels.get(&(source, channel)).cloned()
    }

    pub fn source_name(&self, source: SourceId) -> Option<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.sources.get(&source).cloned()
    }

    pub fn sources(&self) -> Vec<(SourceId, String)> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.sources.iter().map(|(id, name)| (*id, name.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).channels.len()
    }

    pub fn entries(&self) -> Vec<ChannelEntry> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .channels
            .iter()
            .map(|(&(source, channel), info)| ChannelEntry {
                source,
                source_name: inner.sources.get(&source).cloned(),
                channel,
                info: info.clone(),
            })
            .collect()
    }

    /// Name and channel-map messages for one source. Log channels
    /// (125 and up) are left out of the map.
    pub fn broadcast_messages(&self, source: SourceId) -> Vec<Message> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = Vec::with_capacity(2);
        if let Some(name) = inner.sources.get(&source) {
            out.push(Message::string(source, channels::NAME, name.clone()));
        }

        let names: BTreeMap<ChannelId, &str> = inner
            .channels
            .range((source, 0)..(source, channels::INFO))
            .map(|(&(_, channel), info)| (channel, info.name.as_str()))
            .collect();
        if let Some(&highest) = names.keys().next_back() {
            let map = (0..=highest)
                .map(|channel| names.get(&channel).map(|n| n.to_string()).unwrap_or_default())
                .collect();
            out.push(Message::string_array(source, channels::MAP, map));
        }
        out
    }

    /// Broadcast messages for every known source
    pub fn all_broadcast_messages(&self) -> Vec<Message> {
        let sources: Vec<SourceId> = self.sources().into_iter().map(|(id, _)| id).collect();
        sources
            .into_iter()
            .flat_map(|source| self.broadcast_messages(source))
            .collect()
    }
}
