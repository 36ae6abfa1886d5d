//! Parses the crontab text file into a `JobTable` plus seeded `RunQueue`,
//! and overlays the history file onto matching jobs. Grounded on the
//! original `ncron`'s `parse_config`/`get_history`/`add_to_ipair_list`/
//! `parse_interval`/`parse_command_key`: a line-oriented `key=value` format,
//! single `=` split, malformed optional fields logged and skipped, missing
//! required fields fatal with the offending line number (spec.md §4.6, §6).

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use chrono::TimeZone;
use log::{debug, warn};

use crate::constraint::Category;
use crate::error::ConfigError;
use crate::history::HistoryStore;
use crate::job::{Job, Rlimits};
use crate::queue::RunQueue;
use crate::table::JobTable;
use crate::{JobId, Seconds};

/// Result of a full `ConfigLoader::load`: every job, owned by id, and the
/// live/dead queues seeded from it (spec.md §4.6 pass 4).
pub struct LoadOutcome {
    pub table: JobTable<Job>,
    pub queue: RunQueue,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load<Tz: TimeZone>(
        crontab_path: &Path,
        history_path: &Path,
        tz: &Tz,
        now: Seconds,
    ) -> Result<LoadOutcome, ConfigError> {
        let text = fs::read_to_string(crontab_path).map_err(|source| ConfigError::Io {
            path: crontab_path.display().to_string(),
            source,
        })?;

        // Pass 1: pre-size the job table by counting `!<id>` headers.
        let estimated = text
            .lines()
            .filter(|l| {
                let l = l.trim_start();
                l.strip_prefix('!')
                    .is_some_and(|rest| rest.chars().next().is_some_and(|c| c.is_ascii_digit()))
            })
            .count();

        // Pass 2: stream the crontab, building one Job per `!<id>` record.
        let path_str = crontab_path.display().to_string();
        let mut table: JobTable<Job> = JobTable::with_capacity(estimated);
        let mut seen_ids: HashSet<JobId> = HashSet::with_capacity(estimated);
        let mut noexectime: HashSet<JobId> = HashSet::new();

        let mut current: Option<Draft> = None;
        for (lineno, raw_line) in text.lines().enumerate() {
            let line_no = lineno + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('!') {
                if let Some(draft) = current.take() {
                    let job = draft.finish(&path_str, &mut seen_ids)?;
                    table.insert(job.id, job);
                }
                let id: u32 = rest.trim().parse().map_err(|_| ConfigError::InvalidId {
                    path: path_str.clone(),
                    line: line_no,
                    id: rest.trim().to_string(),
                })?;
                if id == 0 {
                    return Err(ConfigError::InvalidId {
                        path: path_str.clone(),
                        line: line_no,
                        id: "0".to_string(),
                    });
                }
                current = Some(Draft::new(id, line_no));
                continue;
            }

            let Some(draft) = current.as_mut() else {
                warn!("{path_str}:{line_no}: key=value line before any `!<id>` header, ignored");
                continue;
            };

            let Some((key, value)) = line.split_once('=') else {
                warn!("{path_str}:{line_no}: malformed line, ignored: {line:?}");
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            draft.apply_key(key, value, &path_str, line_no, &mut noexectime)?;
        }
        if let Some(draft) = current.take() {
            let job = draft.finish(&path_str, &mut seen_ids)?;
            table.insert(job.id, job);
        }

        // Pass 3: overlay the history file, then seed exectime.
        let history = HistoryStore::load(history_path)?;
        let mut matched = 0usize;
        for record in &history.records {
            let Some(job) = table.get_mut(record.id) else {
                debug!("history record for unknown job {} dropped", record.id);
                continue;
            };
            matched += 1;
            job.numruns = record.numruns;
            job.lasttime = record.lasttime;
            if !job.runat && !noexectime.contains(&job.id) {
                job.exectime = record.exectime;
            }
        }
        debug!(
            "history: {matched} record(s) matched a loaded job, {} skipped",
            history.skipped
        );

        for job in table.values_mut() {
            if job.runat {
                continue;
            }
            job.set_initial_exectime(tz, now);
        }

        // Pass 4: seed the live/dead queues.
        let mut queue = RunQueue::new();
        for job in table.values() {
            let alive = if job.runat {
                job.numruns == 0
            } else {
                (job.maxruns == 0 || job.numruns < job.maxruns) && job.exectime != 0
            };
            if alive {
                queue.insert_live(job.id, job.exectime);
            } else {
                queue.insert_dead(job.id, job.exectime);
            }
        }

        Ok(LoadOutcome { table, queue })
    }
}

/// Accumulates `key=value` lines for one `!<id>` record before validation
/// and conversion into a `Job`.
struct Draft {
    id: JobId,
    header_line: usize,
    command: Option<String>,
    command_set_twice: bool,
    args: String,
    interval: Seconds,
    runat: Option<Seconds>,
    maxruns: u32,
    journal: bool,
    constraints: crate::constraint::ConstraintSet,
    last_hour_range: Option<(i32, i32)>,
    chroot: Option<String>,
    user: Option<String>,
    group: Option<String>,
    rlimits: Rlimits,
}

impl Draft {
    fn new(id: JobId, header_line: usize) -> Self {
        Self {
            id,
            header_line,
            command: None,
            command_set_twice: false,
            args: String::new(),
            interval: 0,
            runat: None,
            maxruns: 0,
            journal: false,
            constraints: crate::constraint::ConstraintSet::new(),
            last_hour_range: None,
            chroot: None,
            user: None,
            group: None,
            rlimits: Rlimits::default(),
        }
    }

    fn apply_key(
        &mut self,
        key: &str,
        value: &str,
        path: &str,
        line: usize,
        noexectime: &mut HashSet<JobId>,
    ) -> Result<(), ConfigError> {
        match key {
            "command" => {
                if self.command.is_some() {
                    self.command_set_twice = true;
                }
                let (command, args) = parse_command_value(value);
                self.command = Some(command);
                self.args = args;
            }
            "interval" => match parse_interval(value) {
                Some(secs) => self.interval = secs,
                None => warn!("{path}:{line}: malformed `interval` value {value:?}, ignored"),
            },
            "runat" => match value.parse::<Seconds>() {
                Ok(t) => {
                    self.runat = Some(t);
                    self.maxruns = 1;
                    self.journal = true;
                }
                Err(_) => warn!("{path}:{line}: malformed `runat` value {value:?}, ignored"),
            },
            "maxruns" => match value.parse::<u32>() {
                Ok(n) => self.maxruns = n,
                Err(_) => warn!("{path}:{line}: malformed `maxruns` value {value:?}, ignored"),
            },
            "journal" => self.journal = true,
            "noexectime" => {
                noexectime.insert(self.id);
            }
            "month" => self.apply_range(Category::Month, value, path, line, "month"),
            "day" => self.apply_range(Category::MonthDay, value, path, line, "day"),
            "weekday" => self.apply_range(Category::WeekDay, value, path, line, "weekday"),
            "hour" => {
                if let Some((lo, hi)) = parse_pair(value) {
                    if self.constraints.add_hour_range(lo, hi) {
                        self.last_hour_range = Some((lo, hi));
                    } else {
                        warn!("{path}:{line}: out-of-range `hour` value {value:?}, ignored");
                    }
                } else {
                    warn!("{path}:{line}: malformed `hour` value {value:?}, ignored");
                }
            }
            "minute" => {
                let Some((lo, hi)) = parse_pair(value) else {
                    warn!("{path}:{line}: malformed `minute` value {value:?}, ignored");
                    return Ok(());
                };
                match self.last_hour_range {
                    Some((hour_lo, hour_hi)) => {
                        for hour in hour_range(hour_lo, hour_hi) {
                            self.constraints.add_minute_range_within_hour(hour, lo, hi);
                        }
                    }
                    None => {
                        self.constraints.add_minute_range_all_hours(lo, hi);
                    }
                }
            }
            "chroot" => self.chroot = Some(value.to_string()),
            "user" => self.user = Some(value.to_string()),
            "group" => self.group = Some(value.to_string()),
            "l_cpu" => self.rlimits.cpu = parse_rlimit_pair(value),
            "l_fsize" => self.rlimits.fsize = parse_rlimit_pair(value),
            "l_data" => self.rlimits.data = parse_rlimit_pair(value),
            "l_stack" => self.rlimits.stack = parse_rlimit_pair(value),
            "l_core" => self.rlimits.core = parse_rlimit_pair(value),
            "l_rss" => self.rlimits.rss = parse_rlimit_pair(value),
            "l_nproc" => self.rlimits.nproc = parse_rlimit_pair(value),
            "l_nofile" => self.rlimits.nofile = parse_rlimit_pair(value),
            "l_memlock" => self.rlimits.memlock = parse_rlimit_pair(value),
            "l_as" => self.rlimits.address_space = parse_rlimit_pair(value),
            _ => warn!("{path}:{line}: unknown key `{key}`, ignored"),
        }
        Ok(())
    }

    fn apply_range(
        &mut self,
        category: Category,
        value: &str,
        path: &str,
        line: usize,
        name: &str,
    ) {
        match parse_pair(value) {
            Some((lo, hi)) => {
                if !self.constraints.add_range(category, lo, hi) {
                    warn!("{path}:{line}: out-of-range `{name}` value {value:?}, ignored");
                }
            }
            None => warn!("{path}:{line}: malformed `{name}` value {value:?}, ignored"),
        }
    }

    fn finish(self, path: &str, seen_ids: &mut HashSet<JobId>) -> Result<Job, ConfigError> {
        if !seen_ids.insert(self.id) {
            return Err(ConfigError::DuplicateId {
                path: path.to_string(),
                line: self.header_line,
                id: self.id,
            });
        }
        if self.command_set_twice {
            return Err(ConfigError::DuplicateCommand {
                path: path.to_string(),
                line: self.header_line,
                id: self.id,
            });
        }
        let command = self.command.ok_or_else(|| ConfigError::MissingCommand {
            path: path.to_string(),
            line: self.header_line,
            id: self.id,
        })?;
        if command.is_empty() {
            return Err(ConfigError::MissingCommand {
                path: path.to_string(),
                line: self.header_line,
                id: self.id,
            });
        }

        let runat = self.runat.is_some();
        if runat && self.interval > 0 {
            return Err(ConfigError::RunatWithInterval {
                path: path.to_string(),
                line: self.header_line,
                id: self.id,
            });
        }
        if !runat && self.interval == 0 {
            return Err(ConfigError::NoSchedule {
                path: path.to_string(),
                line: self.header_line,
                id: self.id,
            });
        }

        let mut job = Job::new(self.id, command);
        job.args = self.args;
        job.interval = self.interval;
        job.maxruns = self.maxruns;
        job.journal = self.journal;
        job.runat = runat;
        job.exectime = self.runat.unwrap_or(0);
        job.constraints = self.constraints;
        job.chroot = self.chroot;
        job.user = self.user;
        job.group = self.group;
        job.rlimits = self.rlimits;
        Ok(job)
    }
}

fn hour_range(lo: i32, hi: i32) -> Box<dyn Iterator<Item = i32>> {
    if lo <= hi {
        Box::new(lo..=hi)
    } else {
        Box::new((lo..=23).chain(0..=hi))
    }
}

/// `lo[,hi]`: a bare value means `lo == hi`.
fn parse_pair(value: &str) -> Option<(i32, i32)> {
    match value.split_once(',') {
        Some((lo, hi)) => Some((lo.trim().parse().ok()?, hi.trim().parse().ok()?)),
        None => {
            let v: i32 = value.trim().parse().ok()?;
            Some((v, v))
        }
    }
}

/// `<soft>[,<hard>]`; a bare value applies to both soft and hard limits.
fn parse_rlimit_pair(value: &str) -> Option<(u64, u64)> {
    match value.split_once(',') {
        Some((soft, hard)) => Some((soft.trim().parse().ok()?, hard.trim().parse().ok()?)),
        None => {
            let v: u64 = value.trim().parse().ok()?;
            Some((v, v))
        }
    }
}

/// Sums unit-suffixed terms (`s`,`m`,`h`,`d`,`w`); a bare number is seconds.
fn parse_interval(value: &str) -> Option<Seconds> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(bare) = value.parse::<Seconds>() {
        return Some(bare);
    }

    let mut total: Seconds = 0;
    let mut digits = String::new();
    let mut any = false;
    for c in value.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86_400,
            'w' => 604_800,
            _ => return None,
        };
        let n: Seconds = digits.parse().ok()?;
        digits.clear();
        total += n * unit;
        any = true;
    }
    if !digits.is_empty() || !any {
        return None;
    }
    Some(total)
}

/// Splits a `command` value into the program path and its argument tail,
/// honoring `\ ` and `\\` escapes inside the path (spec.md §6).
fn parse_command_value(value: &str) -> (String, String) {
    let bytes = value.as_bytes();
    let mut command = String::new();
    let mut i = 0;
    let mut split_at = None;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == '\\' && i + 1 < bytes.len() {
            let next = bytes[i + 1] as char;
            if next == ' ' || next == '\\' {
                command.push(next);
                i += 2;
                continue;
            }
        }
        if c == ' ' {
            split_at = Some(i);
            break;
        }
        command.push(c);
        i += 1;
    }
    let args = match split_at {
        Some(i) => value[i + 1..].trim().to_string(),
        None => String::new(),
    };
    (command, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn write_crontab(dir: &Path, contents: &str) -> std::path::PathBuf {
        let path = dir.join("crontab");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn simple_periodic_job_loads() {
        let dir = tempfile::tempdir().unwrap();
        let crontab = write_crontab(dir.path(), "!1\ncommand=/bin/true\ninterval=60s\n");
        let history = dir.path().join("history-missing");

        let outcome = ConfigLoader::load(&crontab, &history, &Utc, 1000).unwrap();
        let job = &outcome.table[1];
        assert_eq!(job.command, "/bin/true");
        assert_eq!(job.interval, 60);
        assert_eq!(job.exectime, 1000);
        assert!(!outcome.queue.is_empty_live());
    }

    #[test]
    fn runat_with_interval_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let crontab = write_crontab(
            dir.path(),
            "!1\ncommand=/bin/x\nrunat=1700000000\ninterval=60\n",
        );
        let history = dir.path().join("history-missing");
        let err = ConfigLoader::load(&crontab, &history, &Utc, 0).unwrap_err();
        assert!(matches!(err, ConfigError::RunatWithInterval { .. }));
    }

    #[test]
    fn duplicate_id_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let crontab = write_crontab(
            dir.path(),
            "!1\ncommand=/bin/x\ninterval=1\n!1\ncommand=/bin/y\ninterval=1\n",
        );
        let history = dir.path().join("history-missing");
        let err = ConfigLoader::load(&crontab, &history, &Utc, 0).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateId { .. }));
    }

    #[test]
    fn missing_command_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let crontab = write_crontab(dir.path(), "!1\ninterval=60\n");
        let history = dir.path().join("history-missing");
        let err = ConfigLoader::load(&crontab, &history, &Utc, 0).unwrap_err();
        assert!(matches!(err, ConfigError::MissingCommand { .. }));
    }

    #[test]
    fn history_overlay_recovers_numruns_and_lasttime() {
        let dir = tempfile::tempdir().unwrap();
        let crontab = write_crontab(dir.path(), "!7\ncommand=/bin/x\ninterval=60\n");
        let history_path = dir.path().join("history");
        fs::write(&history_path, "7=1500:4|1440\n").unwrap();

        let outcome = ConfigLoader::load(&crontab, &history_path, &Utc, 1440).unwrap();
        let job = &outcome.table[7];
        assert_eq!(job.numruns, 4);
        assert_eq!(job.lasttime, 1440);
        assert!(job.exectime >= 1500);
    }

    #[test]
    fn hour_and_minute_combine_to_refine_hhmm() {
        let dir = tempfile::tempdir().unwrap();
        let crontab = write_crontab(
            dir.path(),
            "!1\ncommand=/bin/x\ninterval=60\nhour=9,10\nminute=15,30\n",
        );
        let history = dir.path().join("history-missing");
        let outcome = ConfigLoader::load(&crontab, &history, &Utc, 0).unwrap();
        let job = &outcome.table[1];
        assert!(job.constraints.is_minute_admitted(9 * 60 + 20));
        assert!(!job.constraints.is_minute_admitted(9 * 60 + 0));
        assert!(job.constraints.is_minute_admitted(10 * 60 + 15));
    }

    #[test]
    fn parse_interval_sums_unit_suffixed_terms() {
        assert_eq!(parse_interval("90"), Some(90));
        assert_eq!(parse_interval("1h30m"), Some(5400));
        assert_eq!(parse_interval("1d12h"), Some(129_600));
        assert_eq!(parse_interval("bogus"), None);
    }

    #[test]
    fn parse_command_value_handles_escaped_spaces() {
        let (command, args) = parse_command_value(r"/opt/my\ app/bin arg1 arg2");
        assert_eq!(command, "/opt/my app/bin");
        assert_eq!(args, "arg1 arg2");
    }
}
