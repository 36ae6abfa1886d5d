//! Fatal-at-load and transient-runtime error types. Skippable-at-load
//! conditions (unknown keys, malformed history lines, unparseable ranges)
//! are logged in place and never constructed as errors here; see
//! `config::ConfigLoader` for where those are handled.

use thiserror::Error;

/// A load-time error that aborts startup, always tied to the line in the
/// crontab file that caused it.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: job id must be a positive integer, got `{id}`")]
    InvalidId { path: String, line: usize, id: String },
    #[error("{path}:{line}: duplicate job id {id}")]
    DuplicateId {
        path: String,
        line: usize,
        id: u32,
    },
    #[error("{path}:{line}: job {id} has no `command`")]
    MissingCommand { path: String, line: usize, id: u32 },
    #[error("{path}:{line}: job {id} has neither `interval` nor `runat`/`exectime`")]
    NoSchedule { path: String, line: usize, id: u32 },
    #[error("{path}:{line}: job {id} sets both `runat` and `interval`, which are mutually exclusive")]
    RunatWithInterval { path: String, line: usize, id: u32 },
    #[error("{path}:{line}: job {id} duplicates `command`")]
    DuplicateCommand { path: String, line: usize, id: u32 },
    #[error("failed to read history file: {0}")]
    History(#[from] HistoryError),
}

/// A transient failure writing the history file. The dispatcher logs this
/// and retains `pending_save` so the next tick retries; it never aborts the
/// daemon.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("failed to open {path} for write: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write record to {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to replace {path} with {tmp_path}: {source}")]
    Rename {
        path: String,
        tmp_path: String,
        #[source]
        source: std::io::Error,
    },
}
