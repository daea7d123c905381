use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that abort a run. Everything recoverable is a [`Warning`] instead.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("session directory {} is unusable: {reason}", path.display())]
    FatalInput { path: PathBuf, reason: String },
    #[error("invalid configuration in {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },
    #[error("invalid pricing file {}: {reason}", path.display())]
    Pricing { path: PathBuf, reason: String },
    #[error("export failed: {reason}")]
    Export { reason: String },
    #[error("i/o error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MonitorError {
    pub fn fatal_input(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FatalInput {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_fatal_input(&self) -> bool {
        matches!(self, Self::FatalInput { .. })
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;

/// Non-fatal conditions collected during a run and surfaced in report footers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    ParseWarning {
        file: PathBuf,
        line: u64,
        reason: String,
    },
    UnknownModel {
        model_id: String,
    },
    OrphanAgent {
        session_id: String,
        parent_id: String,
    },
    CycleDetected {
        session_ids: Vec<String>,
    },
    TransientReadError {
        path: PathBuf,
        reason: String,
    },
    PersistentFailure {
        consecutive_failures: u32,
        reason: String,
    },
}

impl Warning {
    pub fn label(&self) -> &'static str {
        match self {
            Self::ParseWarning { .. } => "parse",
            Self::UnknownModel { .. } => "unknown-model",
            Self::OrphanAgent { .. } => "orphan-agent",
            Self::CycleDetected { .. } => "cycle",
            Self::TransientReadError { .. } => "read",
            Self::PersistentFailure { .. } => "persistent-failure",
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ParseWarning { file, line, reason } => {
                write!(f, "skipped record {}:{line}: {reason}", file.display())
            }
            Self::UnknownModel { model_id } => {
                write!(f, "no pricing for model `{model_id}`; cost is estimated")
            }
            Self::OrphanAgent {
                session_id,
                parent_id,
            } => write!(
                f,
                "sub-agent session {session_id} references missing parent {parent_id}; grouped as its own workflow"
            ),
            Self::CycleDetected { session_ids } => write!(
                f,
                "parent cycle between sessions {}; chain broken",
                session_ids.join(" -> ")
            ),
            Self::TransientReadError { path, reason } => {
                write!(f, "could not read {}: {reason}", path.display())
            }
            Self::PersistentFailure {
                consecutive_failures,
                reason,
            } => write!(
                f,
                "{consecutive_failures} consecutive refresh failures (last: {reason}); showing stale data"
            ),
        }
    }
}

/// Result kinds surfaced to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    NoData,
    FatalInput,
}

impl RunStatus {
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::FatalInput => 1,
            Self::NoData => 2,
        }
    }
}
