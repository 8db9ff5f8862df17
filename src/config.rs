use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::time::Duration;

use marine_proto::SourceId;
use marine_proto::ids::{self, sources};

use crate::error::ConfigError;
use crate::transport::Endpoint;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data files are named `<data_prefix><YYYYMMDD><NN>.dat`
    #[serde(default = "default_data_prefix")]
    pub data_prefix: String,
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default = "default_true")]
    pub save_state: bool,
    #[serde(default = "default_state_interval_seconds")]
    pub state_interval_seconds: u64,
    /// Start new data files at midnight UTC
    #[serde(default = "default_true")]
    pub rotate: bool,
    /// Timer source rate in Hz. Zero disables the timer source.
    #[serde(default = "default_timer_frequency")]
    pub timer_frequency: u32,
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub web: WebConfig,
    /// One entry per configured source, keyed by section tag
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

fn default_data_prefix() -> String {
    "./data/log".to_string()
}

fn default_state_file() -> String {
    "./data/logger.state".to_string()
}

fn default_true() -> bool {
    true
}

fn default_state_interval_seconds() -> u64 {
    30
}

fn default_timer_frequency() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory where log files will be stored
    pub directory: String,
    /// Log file name prefix (date will be appended)
    pub file_prefix: String,
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: "./logs".to_string(),
            file_prefix: "marine_logger".to_string(),
            level: "info".to_string(),
        }
    }
}

/// UDP live monitor feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub enabled: bool,
    /// UDP destination address (e.g., "192.168.1.255:40200")
    pub destination: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            destination: "127.0.0.1:40200".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Nmea,
    N2k,
    Datawell,
    Serial,
    Network,
}

impl SourceType {
    /// First id of this type's source family
    pub fn base_id(&self) -> SourceId {
        match self {
            SourceType::Nmea => sources::NMEA,
            SourceType::N2k => sources::N2K,
            SourceType::Datawell | SourceType::Network => sources::EXTERNAL,
            SourceType::Serial => sources::MESSAGE_PACK,
        }
    }

    pub fn default_port(&self) -> Option<u16> {
        match self {
            SourceType::Datawell => Some(1180),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SourceType::Nmea => "NMEA",
            SourceType::N2k => "N2K",
            SourceType::Datawell => "DW",
            SourceType::Serial => "Serial",
            SourceType::Network => "Network",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct SourceFilterConfig {
    /// Map of PGN to allowed source address
    /// If a PGN is present in this map, only messages from the specified source will be accepted
    /// If a PGN is not in the map, all sources are accepted
    pub pgn_source_map: HashMap<u32, u8>,
}

impl SourceFilterConfig {
    /// Check if a message should be accepted based on its PGN and source
    /// Returns true if:
    /// - No filter is configured for this PGN (accept all sources)
    /// - A filter is configured and the source matches
    pub fn should_accept(&self, pgn: u32, source: u8) -> bool {
        match self.pgn_source_map.get(&pgn) {
            Some(&allowed_source) => source == allowed_source,
            None => true,
        }
    }
}

/// One configured source. The transport is selected by whichever of
/// `device`, `host` or `file` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    #[serde(default)]
    pub name: Option<String>,
    /// Offset from the type's base id when below 10, absolute otherwise
    #[serde(default)]
    pub source_num: Option<u8>,
    /// A required source that fails to start stops the logger
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub baud: Option<u32>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default = "default_timeout_seconds", alias = "timeout")]
    pub timeout_seconds: u64,
    /// Also log the received bytes on the raw channel
    #[serde(default)]
    pub raw: bool,
    #[serde(default)]
    pub spectrum: bool,
    #[serde(default)]
    pub min_bytes: Option<usize>,
    #[serde(default)]
    pub max_bytes: Option<usize>,
    #[serde(default)]
    pub require_checksum: bool,
    #[serde(default)]
    pub pgn_source_filter: SourceFilterConfig,
}

fn default_timeout_seconds() -> u64 {
    60
}

pub const DEFAULT_BAUD: u32 = 115_200;
pub const DEFAULT_MIN_BYTES: usize = 10;
pub const DEFAULT_MAX_BYTES: usize = 1024;

impl SourceConfig {
    pub fn new(source_type: SourceType) -> Self {
        Self {
            source_type,
            name: None,
            source_num: None,
            required: true,
            device: None,
            baud: None,
            host: None,
            port: None,
            file: None,
            timeout_seconds: default_timeout_seconds(),
            raw: false,
            spectrum: false,
            min_bytes: None,
            max_bytes: None,
            require_checksum: false,
            pgn_source_filter: SourceFilterConfig::default(),
        }
    }

    pub fn display_name(&self, section: &str) -> String {
        self.name.clone().unwrap_or_else(|| section.to_string())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn source_id(&self, section: &str) -> Result<SourceId, ConfigError> {
        let base = self.source_type.base_id();
        let id = match self.source_num {
            None => base,
            Some(n) if n < 10 => base + n,
            Some(n) => n,
        };
        if id > ids::MAX_ID {
            return Err(ConfigError::Invalid {
                section: section.to_string(),
                parameter: "source_num",
                reason: format!("{:#04x} is above the maximum of {:#04x}", id, ids::MAX_ID),
            });
        }
        if sources::is_reserved(id) {
            return Err(ConfigError::Invalid {
                section: section.to_string(),
                parameter: "source_num",
                reason: format!("{:#04x} is reserved for the logger", id),
            });
        }
        Ok(id)
    }

    pub fn endpoint(&self, section: &str) -> Result<Endpoint, ConfigError> {
        let given = [self.device.is_some(), self.host.is_some(), self.file.is_some()]
            .iter()
            .filter(|g| **g)
            .count();
        if given > 1 {
            return Err(ConfigError::Invalid {
                section: section.to_string(),
                parameter: "device",
                reason: "only one of device, host or file may be given".to_string(),
            });
        }

        if let Some(device) = &self.device {
            let baud = self.baud.unwrap_or(DEFAULT_BAUD);
            if baud == 0 {
                return Err(ConfigError::Invalid {
                    section: section.to_string(),
                    parameter: "baud",
                    reason: "must be greater than zero".to_string(),
                });
            }
            return Ok(Endpoint::Serial {
                device: device.clone(),
                baud,
            });
        }
        if let Some(host) = &self.host {
            let port = self
                .port
                .or(self.source_type.default_port())
                .ok_or_else(|| ConfigError::Missing {
                    section: section.to_string(),
                    parameter: "port",
                })?;
            return Ok(Endpoint::Tcp {
                host: host.clone(),
                port,
            });
        }
        if let Some(file) = &self.file {
            return Ok(Endpoint::File { path: file.into() });
        }

        Err(ConfigError::Missing {
            section: section.to_string(),
            parameter: match self.source_type {
                SourceType::Datawell | SourceType::Network => "host",
                _ => "device",
            },
        })
    }

    /// Chunk limits for raw sources as `(min, max)`
    pub fn chunk_limits(&self, section: &str) -> Result<(usize, usize), ConfigError> {
        let min = self.min_bytes.unwrap_or(DEFAULT_MIN_BYTES);
        let max = self.max_bytes.unwrap_or(DEFAULT_MAX_BYTES);
        if min == 0 {
            return Err(ConfigError::Invalid {
                section: section.to_string(),
                parameter: "min_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }
        if max < min {
            return Err(ConfigError::Invalid {
                section: section.to_string(),
                parameter: "max_bytes",
                reason: format!("{} is smaller than min_bytes ({})", max, min),
            });
        }
        Ok((min, max))
    }

    /// Check everything the driver will need at start
    pub fn validate(&self, section: &str) -> Result<SourceId, ConfigError> {
        let id = self.source_id(section)?;
        self.endpoint(section)?;
        if self.timeout_seconds == 0 {
            return Err(ConfigError::Invalid {
                section: section.to_string(),
                parameter: "timeout_seconds",
                reason: "must be greater than zero".to_string(),
            });
        }
        if matches!(self.source_type, SourceType::Serial | SourceType::Network) {
            self.chunk_limits(section)?;
        }
        Ok(id)
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Create default configuration with no sources
    pub fn default() -> Self {
        Config {
            data_prefix: default_data_prefix(),
            state_file: default_state_file(),
            save_state: true,
            state_interval_seconds: default_state_interval_seconds(),
            rotate: true,
            timer_frequency: default_timer_frequency(),
            logging: LogConfig::default(),
            monitor: MonitorConfig::default(),
            web: WebConfig::default(),
            sources: BTreeMap::new(),
        }
    }

    pub fn state_interval(&self) -> Duration {
        Duration::from_secs(self.state_interval_seconds)
    }

    /// Check the whole configuration. Hard errors are returned; problems
    /// that still allow the logger to run are returned as warnings.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        let mut warnings = Vec::new();
        let mut seen: BTreeMap<SourceId, &str> = BTreeMap::new();

        if self.state_interval_seconds == 0 {
            return Err(ConfigError::Invalid {
                section: "global".to_string(),
                parameter: "state_interval_seconds",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.timer_frequency > 1000 {
            return Err(ConfigError::Invalid {
                section: "global".to_string(),
                parameter: "timer_frequency",
                reason: format!("{} Hz is above the 1000 Hz limit", self.timer_frequency),
            });
        }

        for (section, source) in &self.sources {
            let id = source.validate(section)?;
            if let Some(first) = seen.insert(id, section) {
                return Err(ConfigError::DuplicateSource {
                    id,
                    first: first.to_string(),
                    second: section.clone(),
                });
            }

            let base = source.source_type.base_id();
            if id < base || id > sources::family_end(base) {
                warnings.push(format!(
                    "[{}] source id {:#04x} is outside the {} range {:#04x}-{:#04x}",
                    section,
                    id,
                    source.source_type.label(),
                    base,
                    sources::family_end(base)
                ));
            }
            if source.spectrum && source.source_type != SourceType::Datawell {
                warnings.push(format!("[{}] 'spectrum' only applies to datawell sources", section));
            }
        }

        if self.sources.is_empty() {
            warnings.push("No sources configured".to_string());
        }
        Ok(warnings)
    }
}
