//! Fakes shared by the unit tests.

use std::sync::Mutex;

use async_trait::async_trait;

use cadence_core::{LogLevel, LogSink};

use crate::error::{Result, TaskError};
use crate::registry::BuiltinTask;

pub struct NullSink;

#[async_trait]
impl LogSink for NullSink {
    async fn log(&self, _level: LogLevel, _message: &str) {}
}

#[derive(Default)]
pub struct RecordingSink {
    entries: Mutex<Vec<(LogLevel, String)>>,
}

impl RecordingSink {
    pub fn entries(&self) -> Vec<(LogLevel, String)> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogSink for RecordingSink {
    async fn log(&self, level: LogLevel, message: &str) {
        self.entries
            .lock()
            .unwrap()
            .push((level, message.to_string()));
    }
}

/// Records every value it is called with; optionally fails on one.
#[derive(Default)]
pub struct RecordingTask {
    calls: Mutex<Vec<String>>,
    fail_on: Option<String>,
}

impl RecordingTask {
    pub fn failing_on(value: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_on: Some(value.to_string()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuiltinTask for RecordingTask {
    async fn run(&self, value: &str) -> Result<()> {
        self.calls.lock().unwrap().push(value.to_string());
        if self.fail_on.as_deref() == Some(value) {
            return Err(TaskError::Failed {
                task: "Recorder",
                reason: format!("refused {value}"),
            });
        }
        Ok(())
    }
}
