//! A single scheduled task: identity, command, interval, run-count
//! bookkeeping, and the `ConstraintSet` that restricts when it may fire.
//! `constrain_time`/`set_initial_exectime`/`advance` are the only operations
//! that touch `exectime`/`lasttime`/`numruns`; everything else is read-only
//! bookkeeping the `ConfigLoader` fills in once at load time.

use chrono::{Datelike, LocalResult, NaiveDate, NaiveTime, TimeZone};

use crate::constraint::{clamp_to_valid_date, BrokenDownTime, ConstraintSet};
use crate::{JobId, Seconds};

/// Upper bound on `constrain_time`'s fixed-point search, matching the
/// original daemon's `COUNT_THRESH`. A job whose constraints can never be
/// simultaneously satisfied (e.g. `day=31` combined with `month=2`) is
/// declared unschedulable rather than looping forever.
const COUNT_THRESH: u32 = 500;

/// A soft/hard rlimit pair, `None` meaning the key was never set. `0` means
/// `RLIM_INFINITY`, the original's convention, preserved verbatim here; the
/// core never interprets these, only carries them for the spawn collaborator.
pub type RlimitPair = Option<(u64, u64)>;

/// POSIX resource limits applied to a spawned child, parsed from the
/// `l_*` crontab keys. Entirely inert from the core's point of view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rlimits {
    pub cpu: RlimitPair,
    pub fsize: RlimitPair,
    pub data: RlimitPair,
    pub stack: RlimitPair,
    pub core: RlimitPair,
    pub rss: RlimitPair,
    pub nproc: RlimitPair,
    pub nofile: RlimitPair,
    pub memlock: RlimitPair,
    pub address_space: RlimitPair,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub args: String,
    pub interval: Seconds,
    pub exectime: Seconds,
    pub lasttime: Seconds,
    pub numruns: u32,
    pub maxruns: u32,
    pub journal: bool,
    pub runat: bool,
    pub constraints: ConstraintSet,
    /// `chroot`/`user`/`group`/rlimit data: parsed by `ConfigLoader`, never
    /// read by anything else in this crate's library target. The binary's
    /// spawn collaborator consults these before `exec`.
    pub chroot: Option<String>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub rlimits: Rlimits,
}

impl Job {
    pub fn new(id: JobId, command: impl Into<String>) -> Self {
        Self {
            id,
            command: command.into(),
            args: String::new(),
            interval: 0,
            exectime: 0,
            lasttime: 0,
            numruns: 0,
            maxruns: 0,
            journal: false,
            runat: false,
            constraints: ConstraintSet::new(),
            chroot: None,
            user: None,
            group: None,
            rlimits: Rlimits::default(),
        }
    }

    pub fn is_retired(&self) -> bool {
        (self.maxruns > 0 && self.numruns >= self.maxruns) || self.exectime == 0
    }

    /// Earliest `t' >= t` admitted by `self.constraints`, decomposed in
    /// `tz`'s local time (spec.md §4.2). Returns `0` ("unschedulable") if no
    /// such time is found within `COUNT_THRESH` iterations — the caller must
    /// then retire the job to the dead queue.
    pub fn constrain_time<Tz: TimeZone>(&self, tz: &Tz, t: Seconds) -> Seconds {
        if self.constraints.is_unrestricted() {
            return t;
        }

        let mut candidate = t;
        for _ in 0..COUNT_THRESH {
            let dt = match tz.timestamp_opt(candidate, 0) {
                LocalResult::Single(dt) => dt,
                LocalResult::Ambiguous(dt, _) => dt,
                LocalResult::None => return 0,
            };
            let bdt = BrokenDownTime::from_datetime(&dt);
            let date = dt.date_naive();

            // Step 1: minute window. If the current minute-of-day isn't
            // admitted, jump to the next admitted one today, or to midnight
            // tomorrow if today has none left.
            if !self.constraints.is_minute_admitted(bdt.minute_of_day()) {
                candidate = match self
                    .constraints
                    .next_admitted_minute_of_day(bdt.minute_of_day())
                {
                    Some(m) => to_epoch(tz, date, m as u32 / 60, m as u32 % 60),
                    None => to_epoch(tz, date.succ_opt().expect("date in range"), 0, 0),
                };
                continue;
            }

            // Step 2: day-of-month.
            if !self.constraints.is_month_day_admitted(bdt.month_day) {
                let clamped = clamp_to_valid_date(bdt.year, bdt.month, bdt.month_day + 1);
                let next_date = if clamped.day() == bdt.month_day {
                    // day+1 overflowed the month; the clamp above pinned it
                    // back to the month's last day, so roll a full day
                    // forward from the real date to land in the next month.
                    date.succ_opt().expect("date in range")
                } else {
                    clamped
                };
                candidate = to_epoch(tz, next_date, 0, 0);
                continue;
            }

            // Step 3: day-of-week, independent of step 2.
            if !self.constraints.is_week_day_admitted(bdt.week_day) {
                candidate = to_epoch(tz, date.succ_opt().expect("date in range"), 0, 0);
                continue;
            }

            // Step 4: month.
            if !self.constraints.is_month_admitted(bdt.month) {
                let (next_year, next_month) = if bdt.month == 12 {
                    (bdt.year + 1, 1)
                } else {
                    (bdt.year, bdt.month + 1)
                };
                let next_date = NaiveDate::from_ymd_opt(next_year, next_month, 1)
                    .expect("day 1 is always valid");
                candidate = to_epoch(tz, next_date, 0, 0);
                continue;
            }

            // Step 5: year. No explicit constraint; accepted unconditionally.
            return candidate;
        }

        0
    }

    /// Called once per job at load, after history overlay, for non-`runat`
    /// jobs (spec.md §4.3).
    pub fn set_initial_exectime<Tz: TimeZone>(&mut self, tz: &Tz, now: Seconds) {
        debug_assert!(!self.runat);
        let mut candidate = self.constrain_time(tz, now);
        if candidate == 0 {
            self.exectime = 0;
            return;
        }
        if candidate - self.lasttime < self.interval {
            let pushed = candidate + (self.interval - (candidate - self.lasttime));
            candidate = self.constrain_time(tz, pushed);
        }
        self.exectime = candidate;
    }

    /// Post-dispatch bookkeeping (spec.md §4.4). Returns `true` if the job
    /// should move to the dead queue.
    pub fn advance<Tz: TimeZone>(&mut self, tz: &Tz, now: Seconds) -> bool {
        self.numruns += 1;
        self.lasttime = now;

        let next = self.constrain_time(tz, now + self.interval);
        self.exectime = if next > now { next } else { 0 };

        (self.maxruns > 0 && self.numruns >= self.maxruns) || self.exectime == 0
    }
}

fn to_epoch<Tz: TimeZone>(tz: &Tz, date: NaiveDate, hour: u32, minute: u32) -> Seconds {
    let naive = date.and_time(NaiveTime::from_hms_opt(hour, minute, 0).expect("valid time"));
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.timestamp(),
        LocalResult::Ambiguous(dt, _) => dt.timestamp(),
        // A DST gap swallowed this wall-clock instant; nudge forward in
        // minute-sized steps until we land on a representable one.
        LocalResult::None => {
            let mut probe = naive;
            for _ in 0..120 {
                probe += chrono::Duration::minutes(1);
                if let LocalResult::Single(dt) = tz.from_local_datetime(&probe) {
                    return dt.timestamp();
                }
            }
            naive.and_utc().timestamp()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::Category;
    use chrono::Utc;

    fn epoch(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Seconds {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
            .and_utc()
            .timestamp()
    }

    #[test]
    fn unrestricted_job_returns_candidate_unchanged() {
        let job = Job::new(1, "/bin/true");
        let t = epoch(2024, 6, 1, 12, 0);
        assert_eq!(job.constrain_time(&Utc, t), t);
    }

    #[test]
    fn hour_window_advances_to_next_admitted_hour() {
        let mut job = Job::new(2, "/bin/x");
        job.constraints.add_hour_range(9, 17);
        let t = epoch(2024, 6, 1, 8, 30);
        let got = job.constrain_time(&Utc, t);
        assert_eq!(got, epoch(2024, 6, 1, 9, 0));
    }

    #[test]
    fn hour_window_skips_to_next_day_after_close() {
        let mut job = Job::new(2, "/bin/x");
        job.constraints.add_hour_range(9, 17);
        let t = epoch(2024, 6, 1, 18, 0);
        let got = job.constrain_time(&Utc, t);
        assert_eq!(got, epoch(2024, 6, 2, 9, 0));
    }

    #[test]
    fn wrap_month_range_skips_forward() {
        let mut job = Job::new(3, "/bin/x");
        job.constraints.add_range(Category::Month, 11, 2);
        let t = epoch(2024, 3, 15, 0, 0);
        let got = job.constrain_time(&Utc, t);
        assert_eq!(got, epoch(2024, 11, 1, 0, 0));
    }

    #[test]
    fn set_initial_exectime_respects_interval_since_lasttime() {
        let mut job = Job::new(6, "/bin/x");
        job.interval = 60;
        job.lasttime = 1440;
        let now = 1450;
        job.set_initial_exectime(&Utc, now);
        // candidate = constrain_time(now) = 1450; 1450 - 1440 = 10 < 60, so
        // push forward by the remaining 50 seconds: 1500.
        assert_eq!(job.exectime, 1500);
    }

    #[test]
    fn advance_increments_numruns_and_sets_lasttime() {
        let mut job = Job::new(5, "/bin/x");
        job.interval = 1;
        job.maxruns = 3;
        let retired = job.advance(&Utc, 0);
        assert!(!retired);
        assert_eq!(job.numruns, 1);
        assert_eq!(job.lasttime, 0);
        assert_eq!(job.exectime, 1);

        let retired = job.advance(&Utc, 1);
        assert!(!retired);
        assert_eq!(job.numruns, 2);

        let retired = job.advance(&Utc, 2);
        assert!(retired);
        assert_eq!(job.numruns, 3);
    }

    #[test]
    fn runat_job_is_marked_retired_after_single_run() {
        let mut job = Job::new(4, "/bin/once");
        job.runat = true;
        job.maxruns = 1;
        job.exectime = epoch(2024, 1, 1, 0, 0);
        job.journal = true;
        assert!(!job.is_retired());
        let retired = job.advance(&Utc, job.exectime);
        assert!(retired);
        assert_eq!(job.numruns, 1);
    }
}
