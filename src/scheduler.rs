//! The top-level dispatch loop: sleeps until the head of the `RunQueue` is
//! due, fires every job that has become due (in time order), reinserts or
//! retires each, and tracks whether history needs to be persisted. This is
//! "owned by a single Scheduler object" per spec.md §9's redesign flag: one
//! `Scheduler` holds the `JobTable`, the `RunQueue`, and `pending_save`,
//! and exposes `run_once` so the binary can drive it one decision at a time
//! without the core depending on process spawning, signals, or I/O beyond
//! what the `Spawn` and history interfaces require (spec.md §1, §4.8).

use chrono::TimeZone;
use log::{debug, warn};
use std::path::Path;

use crate::error::HistoryError;
use crate::history::{HistoryRecord, HistoryStore};
use crate::job::Job;
use crate::queue::RunQueue;
use crate::table::JobTable;
use crate::{JobId, Seconds};

/// The external "spawn this job" collaborator (spec.md §1). Implemented by
/// the binary using `std::process::Command`; the core only ever calls
/// through this trait, so it carries no process-spawning dependency itself.
pub trait Spawn {
    /// Attempts to start `job.command` with `job.args`. Returns whether the
    /// spawn succeeded; a failure is logged by the caller and the job still
    /// advances (spec.md §7's "spawn failure" handling).
    fn spawn(&mut self, job: &Job) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchedJob {
    pub id: JobId,
    pub retired: bool,
}

/// The result of one `Scheduler::run_once` call: exactly one decision, per
/// spec.md §7's step-function framing of the dispatch loop.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// No live jobs remain. The caller should perform a final save and
    /// terminate (spec.md §4.8 step 3f).
    QueueEmpty,
    /// The head of the live queue isn't due yet; sleep until this
    /// wall-clock instant (spec.md §4.8 step 2).
    SleepUntil(Seconds),
    /// One or more jobs were due and have been dispatched, in time order.
    Dispatched(Vec<DispatchedJob>),
}

pub struct Scheduler {
    table: JobTable<Job>,
    queue: RunQueue,
    pending_save: bool,
    /// `--journal`: force a history save after every dispatch, regardless
    /// of each job's own `journal` flag (spec.md §6's CLI surface).
    journal_all: bool,
}

impl Scheduler {
    pub fn new(table: JobTable<Job>, queue: RunQueue, journal_all: bool) -> Self {
        Self {
            table,
            queue,
            pending_save: false,
            journal_all,
        }
    }

    pub fn table(&self) -> &JobTable<Job> {
        &self.table
    }

    pub fn is_empty_live(&self) -> bool {
        self.queue.is_empty_live()
    }

    pub fn pending_save(&self) -> bool {
        self.pending_save
    }

    pub fn mark_pending_save(&mut self) {
        self.pending_save = true;
    }

    /// Advances the dispatch loop by exactly one decision (spec.md §4.8
    /// steps 2-3). Does not itself sleep or touch the filesystem; the
    /// caller is expected to act on the returned outcome (sleep, or loop
    /// again immediately after a `Dispatched` result, since more jobs may
    /// now be due).
    pub fn run_once<Tz: TimeZone>(
        &mut self,
        tz: &Tz,
        now: Seconds,
        spawn: &mut dyn Spawn,
    ) -> DispatchOutcome {
        let Some((_, wake_at)) = self.queue.peek_head_live() else {
            return DispatchOutcome::QueueEmpty;
        };
        if wake_at > now {
            return DispatchOutcome::SleepUntil(wake_at);
        }

        let mut dispatched = Vec::new();
        while let Some((id, exectime)) = self.queue.peek_head_live() {
            if exectime > now {
                break;
            }
            self.queue.pop_head_live();

            let job = self
                .table
                .get_mut(id)
                .expect("run queue referenced a job not present in the table");

            if !spawn.spawn(job) {
                warn!("job {id} failed to spawn `{}`", job.command);
            }
            let retired = job.advance(tz, now);

            if job.journal || self.journal_all {
                self.pending_save = true;
            }
            if retired {
                self.queue.insert_dead(id, job.exectime);
                debug!("job {id} retired (numruns={})", job.numruns);
            } else {
                self.queue.insert_live(id, job.exectime);
            }
            dispatched.push(DispatchedJob { id, retired });
        }

        if self.queue.is_empty_live() {
            self.pending_save = true;
        }
        DispatchOutcome::Dispatched(dispatched)
    }

    /// `HistoryStore.save` over every job in the table (spec.md §4.7: "one
    /// line per Job in live then in dead, in their queue order"). Clears
    /// `pending_save` on success; leaves it set on failure so the next tick
    /// retries (spec.md §7's transient-runtime handling).
    pub fn save(&mut self, path: &Path) -> Result<(), HistoryError> {
        let mut records = Vec::with_capacity(self.table.len());
        for (id, exectime) in self.queue.sorted_live() {
            records.push(self.record_for(id, exectime));
        }
        for (id, exectime) in self.queue.sorted_dead() {
            records.push(self.record_for(id, exectime));
        }
        HistoryStore::save(path, &records)?;
        self.pending_save = false;
        Ok(())
    }

    fn record_for(&self, id: JobId, exectime: Seconds) -> HistoryRecord {
        let job = &self.table[id];
        HistoryRecord {
            id,
            exectime,
            numruns: job.numruns,
            lasttime: job.lasttime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    struct RecordingSpawn {
        calls: Vec<String>,
        succeed: bool,
    }

    impl Spawn for RecordingSpawn {
        fn spawn(&mut self, job: &Job) -> bool {
            self.calls.push(job.command.clone());
            self.succeed
        }
    }

    fn dispatcher_with(jobs: Vec<Job>) -> Scheduler {
        let mut table = JobTable::new();
        let mut queue = RunQueue::new();
        for job in jobs {
            queue.insert_live(job.id, job.exectime);
            table.insert(job.id, job);
        }
        Scheduler::new(table, queue, false)
    }

    #[test]
    fn sleeps_when_head_is_not_yet_due() {
        let mut job = Job::new(1, "/bin/x");
        job.interval = 60;
        job.exectime = 5000;
        let mut dispatcher = dispatcher_with(vec![job]);

        let mut spawn = RecordingSpawn {
            calls: vec![],
            succeed: true,
        };
        match dispatcher.run_once(&Utc, 1000, &mut spawn) {
            DispatchOutcome::SleepUntil(t) => assert_eq!(t, 5000),
            other => panic!("expected SleepUntil, got {other:?}"),
        }
        assert!(spawn.calls.is_empty());
    }

    #[test]
    fn dispatches_due_job_and_reinserts_it() {
        let mut job = Job::new(1, "/bin/x");
        job.interval = 60;
        job.exectime = 1000;
        let mut dispatcher = dispatcher_with(vec![job]);

        let mut spawn = RecordingSpawn {
            calls: vec![],
            succeed: true,
        };
        match dispatcher.run_once(&Utc, 1000, &mut spawn) {
            DispatchOutcome::Dispatched(jobs) => {
                assert_eq!(jobs.len(), 1);
                assert!(!jobs[0].retired);
            }
            other => panic!("expected Dispatched, got {other:?}"),
        }
        assert_eq!(spawn.calls, vec!["/bin/x".to_string()]);
        assert_eq!(dispatcher.table()[1].numruns, 1);
        assert_eq!(dispatcher.table()[1].exectime, 1060);
    }

    #[test]
    fn journal_flag_marks_pending_save() {
        let mut job = Job::new(1, "/bin/x");
        job.interval = 1;
        job.exectime = 0;
        job.journal = true;
        let mut dispatcher = dispatcher_with(vec![job]);

        let mut spawn = RecordingSpawn {
            calls: vec![],
            succeed: true,
        };
        dispatcher.run_once(&Utc, 0, &mut spawn);
        assert!(dispatcher.pending_save());
    }

    #[test]
    fn maxruns_retirement_moves_job_to_dead_and_empties_live() {
        let mut job = Job::new(5, "/bin/x");
        job.interval = 1;
        job.maxruns = 1;
        job.exectime = 0;
        let mut dispatcher = dispatcher_with(vec![job]);

        let mut spawn = RecordingSpawn {
            calls: vec![],
            succeed: true,
        };
        dispatcher.run_once(&Utc, 0, &mut spawn);
        assert!(dispatcher.is_empty_live());
        assert!(dispatcher.pending_save());
    }

    #[test]
    fn spawn_failure_still_advances_the_job() {
        let mut job = Job::new(1, "/bin/does-not-exist");
        job.interval = 60;
        job.exectime = 1000;
        let mut dispatcher = dispatcher_with(vec![job]);

        let mut spawn = RecordingSpawn {
            calls: vec![],
            succeed: false,
        };
        dispatcher.run_once(&Utc, 1000, &mut spawn);
        assert_eq!(dispatcher.table()[1].numruns, 1);
    }

    #[test]
    fn empty_queue_reports_queue_empty() {
        let mut dispatcher = dispatcher_with(vec![]);
        let mut spawn = RecordingSpawn {
            calls: vec![],
            succeed: true,
        };
        assert!(matches!(
            dispatcher.run_once(&Utc, 0, &mut spawn),
            DispatchOutcome::QueueEmpty
        ));
    }
}
