//! Append-only daily log files: `logs/<epoch_day>.txt`, one JSON array per
//! line. Station records carry program, station, duration and end time (plus
//! GPM on flow-sensing setups); everything else is a tagged record.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::json;

/// Record tags for non-station entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTag {
    Sensor1,
    RainDelay,
    WaterLevel,
    FlowSense,
    Sensor2,
    Current,
}

impl LogTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sensor1 => "s1",
            Self::RainDelay => "rd",
            Self::WaterLevel => "wl",
            Self::FlowSense => "fl",
            Self::Sensor2 => "s2",
            Self::Current => "cu",
        }
    }
}

pub struct DataLog {
    log_dir: PathBuf,
}

impl DataLog {
    /// `data_dir` is the directory holding the `.dat` files; logs go into a
    /// `logs/` subdirectory beside them.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            log_dir: data_dir.join("logs"),
        }
    }

    fn day_file(&self, end_time: i64) -> PathBuf {
        self.log_dir.join(format!("{}.txt", end_time / 86_400))
    }

    fn append(&self, end_time: i64, line: &str) -> Result<()> {
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("failed to create {}", self.log_dir.display()))?;
        let path = self.day_file(end_time);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("failed to append {}", path.display()))
    }

    /// `[pid, sid, duration, end]`, with GPM appended on flow setups.
    pub fn station(
        &self,
        pid: u8,
        sid: usize,
        duration: i64,
        end_time: i64,
        gpm: Option<f64>,
    ) -> Result<()> {
        let line = match gpm {
            Some(gpm) => json!([pid, sid, duration, end_time, (gpm * 100.0).round() / 100.0]),
            None => json!([pid, sid, duration, end_time]),
        };
        self.append(end_time, &line.to_string())
    }

    /// `[count, "tag", value, end]`. `count` is only meaningful for flow
    /// records and is written as 0 otherwise.
    pub fn tagged(&self, tag: LogTag, count: u64, value: i64, end_time: i64) -> Result<()> {
        let line = json!([count, tag.as_str(), value, end_time]);
        self.append(end_time, &line.to_string())
    }

    /// Delete one day file, or the whole log directory when `day` is `None`.
    pub fn delete(&self, day: Option<i64>) -> Result<()> {
        match day {
            Some(day) => {
                let path = self.log_dir.join(format!("{day}.txt"));
                if path.exists() {
                    fs::remove_file(&path)
                        .with_context(|| format!("failed to remove {}", path.display()))?;
                }
            }
            None => {
                if self.log_dir.exists() {
                    fs::remove_dir_all(&self.log_dir)
                        .with_context(|| format!("failed to remove {}", self.log_dir.display()))?;
                }
            }
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn datalog() -> (TempDir, DataLog) {
        let dir = TempDir::new().unwrap();
        let log = DataLog::new(dir.path());
        (dir, log)
    }

    fn read_day(log: &DataLog, end_time: i64) -> Vec<String> {
        fs::read_to_string(log.day_file(end_time))
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn station_record_format() {
        let (_dir, log) = datalog();
        log.station(1, 0, 60, 1_700_000_061, None).unwrap();
        assert_eq!(read_day(&log, 1_700_000_061), vec!["[1,0,60,1700000061]"]);
    }

    #[test]
    fn station_record_with_gpm() {
        let (_dir, log) = datalog();
        log.station(99, 4, 120, 1_700_000_000, Some(2.504)).unwrap();
        let lines = read_day(&log, 1_700_000_000);
        assert_eq!(lines, vec!["[99,4,120,1700000000,2.5]"]);
    }

    #[test]
    fn tagged_record_format() {
        let (_dir, log) = datalog();
        log.tagged(LogTag::RainDelay, 0, 3600, 1_700_000_000).unwrap();
        log.tagged(LogTag::FlowSense, 42, 600, 1_700_000_000).unwrap();
        let lines = read_day(&log, 1_700_000_000);
        assert_eq!(lines[0], r#"[0,"rd",3600,1700000000]"#);
        assert_eq!(lines[1], r#"[42,"fl",600,1700000000]"#);
    }

    #[test]
    fn records_split_by_epoch_day() {
        let (_dir, log) = datalog();
        let day1 = 86_400 * 100 + 10;
        let day2 = 86_400 * 101 + 10;
        log.station(1, 0, 5, day1, None).unwrap();
        log.station(1, 0, 5, day2, None).unwrap();
        assert_eq!(read_day(&log, day1).len(), 1);
        assert_eq!(read_day(&log, day2).len(), 1);
    }

    #[test]
    fn delete_single_day_and_all() {
        let (_dir, log) = datalog();
        let t = 86_400 * 7;
        log.station(1, 0, 5, t, None).unwrap();
        log.delete(Some(7)).unwrap();
        assert!(!log.day_file(t).exists());

        log.station(1, 0, 5, t, None).unwrap();
        log.delete(None).unwrap();
        assert!(!log.log_dir.exists());
        // deleting an absent file is fine
        log.delete(Some(7)).unwrap();
    }
}
