use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::channel_stats::StateSnapshot;
use crate::error::StateWriteError;

/// Writes channel statistics snapshots to disk.
///
/// Snapshots go to `<path>.tmp` first, are synced and then renamed over
/// the state file, so readers only ever see a complete file.
pub struct StateCheckpoint {
    path: PathBuf,
    interval: Duration,
    last_save: Instant,
}

impl StateCheckpoint {
    pub fn new<P: AsRef<Path>>(path: P, interval: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            interval,
            last_save: Instant::now(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    pub fn is_due(&self) -> bool {
        self.last_save.elapsed() >= self.interval
    }

    /// Write a snapshot now
    pub fn save(&mut self, snapshot: &StateSnapshot) -> Result<(), StateWriteError> {
        // Retry on the next interval whatever happens
        self.last_save = Instant::now();

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let temp = self.temp_path();
        let json = serde_json::to_vec_pretty(snapshot)?;
        {
            let mut file = File::create(&temp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        debug!("State saved to {} ({} channels)", self.path.display(), snapshot.channels.len());
        Ok(())
    }

    /// Save if the interval has elapsed.
    /// Returns `None` if it was not yet time to save.
    pub fn check_and_save(
        &mut self,
        snapshot: impl FnOnce() -> StateSnapshot,
    ) -> Option<Result<(), StateWriteError>> {
        if self.is_due() {
            Some(self.save(&snapshot()))
        } else {
            None
        }
    }

    /// Read a previous snapshot for a warm restart. A missing file or one
    /// written by an incompatible version gives `None`; a corrupt one is an
    /// error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Option<StateSnapshot>, StateWriteError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No previous state file at {}", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: StateSnapshot = serde_json::from_str(&contents)?;
        if snapshot.version != crate::channel_stats::SNAPSHOT_VERSION {
            warn!(
                "State file {} has version {}, expected {}",
                path.display(),
                snapshot.version,
                crate::channel_stats::SNAPSHOT_VERSION
            );
            return Ok(None);
        }
        Ok(Some(snapshot))
    }
}
