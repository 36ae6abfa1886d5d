//! Durable (id, exectime, numruns, lasttime) history, written atomically via
//! write-to-sibling-then-rename and read back with per-line error tolerance
//! (spec.md §4.7, §6). Grounded on the original `ncron`'s `get_history` /
//! `save_stack` pair: `<id>=<exectime>:<numruns>|<lasttime>` per line.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use log::{debug, warn};

use crate::error::HistoryError;
use crate::{JobId, Seconds};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRecord {
    pub id: JobId,
    pub exectime: Seconds,
    pub numruns: u32,
    pub lasttime: Seconds,
}

impl HistoryRecord {
    fn to_line(self) -> String {
        format!(
            "{}={}:{}|{}\n",
            self.id, self.exectime, self.numruns, self.lasttime
        )
    }

    /// Parses one line of `<id>=<exectime>:<numruns>|<lasttime>`. Malformed
    /// lines are the caller's concern to log and skip; this just reports
    /// `None` on any parse failure.
    fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\n', '\r']);
        let (id_part, rest) = line.split_once('=')?;
        let (exectime_part, rest) = rest.split_once(':')?;
        let (numruns_part, lasttime_part) = rest.split_once('|')?;

        Some(Self {
            id: id_part.parse().ok()?,
            exectime: exectime_part.parse().ok()?,
            numruns: numruns_part.parse().ok()?,
            lasttime: lasttime_part.parse().ok()?,
        })
    }
}

/// Outcome of `HistoryStore::load`, distinguishing records that parsed from
/// lines that were skipped, matching the original's per-line `debug!`
/// logging granularity (spec.md §6's "HistoryStore additionally returns the
/// count of matched vs. skipped records").
#[derive(Debug, Default)]
pub struct LoadResult {
    pub records: Vec<HistoryRecord>,
    pub skipped: usize,
}

pub struct HistoryStore;

impl HistoryStore {
    /// Reads `path`, tolerating malformed lines (spec.md §6: "lines that do
    /// not match are skipped"). A missing file is not an error: a fresh
    /// daemon has no history yet.
    pub fn load(path: &Path) -> Result<LoadResult, HistoryError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no history file at {}; starting fresh", path.display());
                return Ok(LoadResult::default());
            }
            Err(source) => {
                return Err(HistoryError::Open {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        let mut result = LoadResult::default();
        for line in BufReader::new(file).lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => {
                    result.skipped += 1;
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match HistoryRecord::parse_line(&line) {
                Some(record) => {
                    debug!("loaded history record for job {}", record.id);
                    result.records.push(record);
                }
                None => {
                    warn!("skipping malformed history line: {line:?}");
                    result.skipped += 1;
                }
            }
        }
        Ok(result)
    }

    /// Writes `records` to `path` atomically: a sibling temp file (`path`
    /// plus `~`) is written in full, then renamed over `path`. On any
    /// failure the temp file is removed and the error is returned; the
    /// Dispatcher retains `pending_save` and retries on the next tick
    /// (spec.md §4.7, §7).
    pub fn save(path: &Path, records: &[HistoryRecord]) -> Result<(), HistoryError> {
        let tmp_path = sibling_tmp_path(path);

        let write_result = (|| -> Result<(), HistoryError> {
            let mut file = File::create(&tmp_path).map_err(|source| HistoryError::Open {
                path: tmp_path.display().to_string(),
                source,
            })?;
            for record in records {
                file.write_all(record.to_line().as_bytes())
                    .map_err(|source| HistoryError::Write {
                        path: path.display().to_string(),
                        source,
                    })?;
            }
            file.sync_all().map_err(|source| HistoryError::Write {
                path: path.display().to_string(),
                source,
            })
        })();

        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        fs::rename(&tmp_path, path).map_err(|source| {
            let _ = fs::remove_file(&tmp_path);
            HistoryError::Rename {
                path: path.display().to_string(),
                tmp_path: tmp_path.display().to_string(),
                source,
            }
        })
    }
}

fn sibling_tmp_path(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push("~");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history");

        let records = vec![
            HistoryRecord {
                id: 1,
                exectime: 1000,
                numruns: 2,
                lasttime: 940,
            },
            HistoryRecord {
                id: 7,
                exectime: 1500,
                numruns: 4,
                lasttime: 1440,
            },
        ];

        HistoryStore::save(&path, &records).unwrap();
        let loaded = HistoryStore::load(&path).unwrap();
        assert_eq!(loaded.skipped, 0);
        assert_eq!(loaded.records, records);
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist");
        let loaded = HistoryStore::load(&path).unwrap();
        assert!(loaded.records.is_empty());
        assert_eq!(loaded.skipped, 0);
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history");
        fs::write(&path, "7=1500:4|1440\nnot a valid line\n1=oops:x|y\n").unwrap();

        let loaded = HistoryStore::load(&path).unwrap();
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.records[0].id, 7);
        assert_eq!(loaded.skipped, 2);
    }

    #[test]
    fn parse_line_matches_the_canonical_format() {
        let record = HistoryRecord::parse_line("42=100:3|90").unwrap();
        assert_eq!(
            record,
            HistoryRecord {
                id: 42,
                exectime: 100,
                numruns: 3,
                lasttime: 90,
            }
        );
    }
}
