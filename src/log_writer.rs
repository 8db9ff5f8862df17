use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use marine_proto::Message;
use marine_proto::ids::channels;
use tracing::info;

/// Highest serial number tried for one day
const MAX_SERIAL: u32 = 99;

/// Append-only writer for the `.dat` message log and its `.var` companion.
///
/// Each message is written as one tab separated text line. The `.var` file
/// only receives source names and channel maps so that ids can be resolved
/// without scanning the full log.
pub struct LogWriter {
    prefix: String,
    date: NaiveDate,
    data_path: PathBuf,
    data: BufWriter<File>,
    variables: BufWriter<File>,
    bytes_written: u64,
}

impl LogWriter {
    /// Open the first unused `<prefix><YYYYMMDD><NN>.dat` for `date`.
    /// Existing files are never opened for writing.
    pub fn open(prefix: &str, date: NaiveDate) -> io::Result<Self> {
        if let Some(parent) = Path::new(prefix).parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let stem_base = format!("{}{}", prefix, date.format("%Y%m%d"));
        for serial in 0..=MAX_SERIAL {
            let stem = format!("{}{:02}", stem_base, serial);
            let data_path = PathBuf::from(format!("{}.dat", stem));
            let data = match OpenOptions::new().write(true).create_new(true).open(&data_path) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            };
            let variables = OpenOptions::new()
                .append(true)
                .create(true)
                .open(format!("{}.var", stem))?;

            info!("Logging to {}", data_path.display());
            return Ok(Self {
                prefix: prefix.to_string(),
                date,
                data_path,
                data: BufWriter::new(data),
                variables: BufWriter::new(variables),
                bytes_written: 0,
            });
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free log file serial number for {}", stem_base),
        ))
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Append one message. Returns the number of bytes written.
    pub fn write(&mut self, message: &Message) -> io::Result<usize> {
        let line = format!("{}\n", message);
        self.data.write_all(line.as_bytes())?;
        let mut written = line.len();
        if message.channel() == channels::NAME || message.channel() == channels::MAP {
            self.variables.write_all(line.as_bytes())?;
            written += line.len();
        }
        self.bytes_written += written as u64;
        Ok(written)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.data.flush()?;
        self.variables.flush()
    }

    pub fn needs_rotation(&self, today: NaiveDate) -> bool {
        today != self.date
    }

    /// Close the current files and open the next free pair for `date`
    pub fn rotate(&mut self, date: NaiveDate) -> io::Result<()> {
        self.flush()?;
        let next = Self::open(&self.prefix, date)?;
        info!("Rotated log from {} to {}", self.data_path.display(), next.data_path.display());
        *self = next;
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, d).unwrap()
    }

    fn prefix(dir: &tempfile::TempDir) -> String {
        format!("{}/log", dir.path().display())
    }

    #[test]
    fn test_open_picks_first_free_serial() {
        let dir = tempfile::tempdir().unwrap();
        let first = LogWriter::open(&prefix(&dir), day(1)).unwrap();
        assert!(first.data_path().ends_with("log2024020100.dat"));
        let second = LogWriter::open(&prefix(&dir), day(1)).unwrap();
        assert!(second.data_path().ends_with("log2024020101.dat"));
    }

    #[test]
    fn test_names_go_to_variable_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = LogWriter::open(&prefix(&dir), day(1)).unwrap();
        writer.write(&Message::string(0x30, 0, "GPS")).unwrap();
        writer.write(&Message::float(0x30, 4, 1.5)).unwrap();
        writer.flush().unwrap();

        let data = std::fs::read_to_string(dir.path().join("log2024020100.dat")).unwrap();
        let vars = std::fs::read_to_string(dir.path().join("log2024020100.var")).unwrap();
        assert_eq!(data.lines().count(), 2);
        assert_eq!(vars.lines().count(), 1);
        assert!(vars.contains("\t0x30\t0x00\tstring\tGPS"));
        assert!(data.lines().nth(1).unwrap().ends_with("\tfloat\t1.500000"));
        assert_eq!(writer.bytes_written(), (data.len() + vars.len()) as u64);
    }

    #[test]
    fn test_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = LogWriter::open(&prefix(&dir), day(1)).unwrap();
        assert!(!writer.needs_rotation(day(1)));
        assert!(writer.needs_rotation(day(2)));

        writer.write(&Message::float(0x30, 4, 1.0)).unwrap();
        writer.rotate(day(2)).unwrap();
        assert_eq!(writer.date(), day(2));
        assert!(writer.data_path().ends_with("log2024020200.dat"));
        assert_eq!(writer.bytes_written(), 0);

        let old = std::fs::read_to_string(dir.path().join("log2024020100.dat")).unwrap();
        assert_eq!(old.lines().count(), 1);
    }

    #[test]
    fn test_open_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = format!("{}/data/run/log", dir.path().display());
        let writer = LogWriter::open(&nested, day(1)).unwrap();
        assert!(writer.data_path().exists());
    }
}
