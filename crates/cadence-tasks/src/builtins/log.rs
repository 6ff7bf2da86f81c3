use std::sync::Arc;

use async_trait::async_trait;

use cadence_core::{LogLevel, LogSink};

use crate::error::Result;
use crate::registry::BuiltinTask;

/// Does nothing; the value is echoed at `DEBUG`.
pub struct NoOpTask {
    sink: Arc<dyn LogSink>,
}

impl NoOpTask {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl BuiltinTask for NoOpTask {
    async fn run(&self, value: &str) -> Result<()> {
        self.sink
            .log(LogLevel::Debug, &format!("NoOp task called with value: {value}"))
            .await;
        Ok(())
    }
}

/// Writes the value to the leveled log at `LOG`.
pub struct LogTask {
    sink: Arc<dyn LogSink>,
}

impl LogTask {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl BuiltinTask for LogTask {
    async fn run(&self, value: &str) -> Result<()> {
        self.sink.log(LogLevel::Log, value).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;

    #[tokio::test]
    async fn log_task_writes_at_log_level() {
        let sink = Arc::new(RecordingSink::default());
        LogTask::new(sink.clone()).run("hello").await.unwrap();
        assert_eq!(sink.entries(), vec![(LogLevel::Log, "hello".to_string())]);
    }

    #[tokio::test]
    async fn noop_logs_at_debug_and_succeeds() {
        let sink = Arc::new(RecordingSink::default());
        NoOpTask::new(sink.clone()).run("").await.unwrap();
        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, LogLevel::Debug);
    }
}
