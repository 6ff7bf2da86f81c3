use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CadenceError;

/// What a base task's body is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskKind {
    /// SQL text executed in a transaction.
    Sql,
    /// External executable; parameters become argv.
    Program,
    /// Named entry in the local task registry.
    Builtin,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskKind::Sql => "SQL",
            TaskKind::Program => "PROGRAM",
            TaskKind::Builtin => "BUILTIN",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskKind {
    type Err = CadenceError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "SQL" => Ok(TaskKind::Sql),
            // Older schemas call program tasks SHELL.
            "PROGRAM" | "SHELL" => Ok(TaskKind::Program),
            "BUILTIN" => Ok(TaskKind::Builtin),
            other => Err(CadenceError::UnknownVariant {
                kind: "task kind",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for TaskKind {
    type Error = CadenceError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

/// Persisted state of one chain run (`timetable.run_status.execution_status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    Started,
    Done,
    Failed,
    /// Left `STARTED` by a scheduler that died; only crash recovery writes it.
    Crashed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Started => "STARTED",
            RunState::Done => "DONE",
            RunState::Failed => "FAILED",
            RunState::Crashed => "CRASHED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Started)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunState {
    type Err = CadenceError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "STARTED" => Ok(RunState::Started),
            "DONE" => Ok(RunState::Done),
            "FAILED" => Ok(RunState::Failed),
            "CRASHED" => Ok(RunState::Crashed),
            other => Err(CadenceError::UnknownVariant {
                kind: "run state",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for RunState {
    type Error = CadenceError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

/// Severity of a row in `timetable.log`, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Notice,
    Log,
    Error,
    Panic,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Notice => "NOTICE",
            LogLevel::Log => "LOG",
            LogLevel::Error => "ERROR",
            LogLevel::Panic => "PANIC",
        }
    }

    /// Whether a message at this level is written to the store.
    ///
    /// Non-verbose schedulers only persist `ERROR` and `PANIC`.
    pub fn is_persisted(&self, verbose: bool) -> bool {
        verbose || *self >= LogLevel::Error
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = CadenceError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "DEBUG" => Ok(LogLevel::Debug),
            "NOTICE" => Ok(LogLevel::Notice),
            "LOG" => Ok(LogLevel::Log),
            "ERROR" => Ok(LogLevel::Error),
            "PANIC" => Ok(LogLevel::Panic),
            other => Err(CadenceError::UnknownVariant {
                kind: "log level",
                value: other.to_string(),
            }),
        }
    }
}

/// Destination for leveled operational log messages.
///
/// Implemented by the store-backed logger; built-in tasks and the engine only
/// see this trait so they can be exercised without a database.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn log(&self, level: LogLevel, message: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_is_an_alias_for_program() {
        assert_eq!("SHELL".parse::<TaskKind>().unwrap(), TaskKind::Program);
        assert_eq!("PROGRAM".parse::<TaskKind>().unwrap(), TaskKind::Program);
        assert_eq!(TaskKind::Program.to_string(), "PROGRAM");
    }

    #[test]
    fn task_kind_is_case_sensitive() {
        assert!("sql".parse::<TaskKind>().is_err());
    }

    #[test]
    fn only_started_is_non_terminal() {
        assert!(!RunState::Started.is_terminal());
        assert!(RunState::Done.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Crashed.is_terminal());
    }

    #[test]
    fn non_verbose_persists_errors_only() {
        let persisted: Vec<_> = [
            LogLevel::Debug,
            LogLevel::Notice,
            LogLevel::Log,
            LogLevel::Error,
            LogLevel::Panic,
        ]
        .into_iter()
        .filter(|l| l.is_persisted(false))
        .collect();
        assert_eq!(persisted, vec![LogLevel::Error, LogLevel::Panic]);
    }

    #[test]
    fn verbose_persists_everything() {
        assert!(LogLevel::Debug.is_persisted(true));
        assert!(LogLevel::Notice.is_persisted(true));
    }

    #[test]
    fn log_level_round_trips_through_text() {
        for level in ["DEBUG", "NOTICE", "LOG", "ERROR", "PANIC"] {
            assert_eq!(level.parse::<LogLevel>().unwrap().as_str(), level);
        }
        assert!("WARN".parse::<LogLevel>().is_err());
    }
}
