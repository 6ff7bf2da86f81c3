use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use cadence_core::LogSink;

use crate::builtins::{
    download::DownloadTask,
    log::{LogTask, NoOpTask},
    mail::{MailRouter, MailTransport, SendMailTask},
    sleep::SleepTask,
};
use crate::error::{Result, TaskError};

/// A task body executed in-process, once per parameter value.
#[async_trait]
pub trait BuiltinTask: Send + Sync {
    async fn run(&self, value: &str) -> Result<()>;
}

/// Lookup table from stable, case-sensitive names to built-in tasks.
///
/// Built once at startup and then shared read-only (`Arc<TaskRegistry>`).
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn BuiltinTask>>,
}

impl TaskRegistry {
    /// An empty registry. Most callers want [`TaskRegistry::with_builtins`].
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// The standard set: `NoOp`, `Sleep`, `Log`, `SendMail`, `Download`.
    ///
    /// `SendMail` goes through the message's SMTP server, or the local
    /// sendmail when none is named.
    pub fn with_builtins(sink: Arc<dyn LogSink>) -> Self {
        Self::with_mail_transport(sink, Arc::new(MailRouter::default()))
    }

    pub fn with_mail_transport(sink: Arc<dyn LogSink>, mail: Arc<dyn MailTransport>) -> Self {
        let mut registry = Self::new();
        registry.register("NoOp", Arc::new(NoOpTask::new(Arc::clone(&sink))));
        registry.register("Sleep", Arc::new(SleepTask::new(Arc::clone(&sink))));
        registry.register("Log", Arc::new(LogTask::new(Arc::clone(&sink))));
        registry.register("SendMail", Arc::new(SendMailTask::new(mail)));
        registry.register("Download", Arc::new(DownloadTask::new(reqwest::Client::new())));
        registry
    }

    /// Register (or replace) a task under `name`.
    pub fn register(&mut self, name: impl Into<String>, task: Arc<dyn BuiltinTask>) {
        let name = name.into();
        debug!(task = %name, "built-in task registered");
        self.tasks.insert(name, task);
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run `name` once per value, in order, stopping at the first error.
    ///
    /// An empty list runs the task once with an empty string.
    pub async fn execute(&self, name: &str, param_values: &[String]) -> Result<()> {
        let task = self.tasks.get(name).ok_or_else(|| TaskError::NotFound {
            name: name.to_string(),
        })?;

        debug!(task = name, values = param_values.len(), "executing built-in task");

        if param_values.is_empty() {
            return task.run("").await;
        }
        for value in param_values {
            task.run(value).await?;
        }
        Ok(())
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{NullSink, RecordingTask};

    #[tokio::test]
    async fn noop_with_no_values_runs_once() {
        let mut registry = TaskRegistry::with_builtins(Arc::new(NullSink));
        let recorder = Arc::new(RecordingTask::default());
        registry.register("NoOp", recorder.clone());

        registry.execute("NoOp", &[]).await.unwrap();
        assert_eq!(recorder.calls(), vec![String::new()]);
    }

    #[tokio::test]
    async fn builtin_noop_succeeds_without_values() {
        let registry = TaskRegistry::with_builtins(Arc::new(NullSink));
        assert!(registry.execute("NoOp", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn values_run_in_order() {
        let mut registry = TaskRegistry::new();
        let recorder = Arc::new(RecordingTask::default());
        registry.register("Recorder", recorder.clone());

        let values = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        registry.execute("Recorder", &values).await.unwrap();
        assert_eq!(recorder.calls(), values);
    }

    #[tokio::test]
    async fn first_error_stops_the_fan_out() {
        let mut registry = TaskRegistry::new();
        let recorder = Arc::new(RecordingTask::failing_on("bad"));
        registry.register("Recorder", recorder.clone());

        let values = vec!["ok".to_string(), "bad".to_string(), "never".to_string()];
        let err = registry.execute("Recorder", &values).await.unwrap_err();
        assert!(matches!(err, TaskError::Failed { .. }));
        assert_eq!(recorder.calls(), vec!["ok".to_string(), "bad".to_string()]);
    }

    #[tokio::test]
    async fn unknown_name_is_a_typed_error() {
        let registry = TaskRegistry::with_builtins(Arc::new(NullSink));
        let err = registry.execute("noop", &[]).await.unwrap_err();
        assert!(matches!(err, TaskError::NotFound { ref name } if name == "noop"));
    }

    #[test]
    fn standard_names_are_registered() {
        let registry = TaskRegistry::with_builtins(Arc::new(NullSink));
        assert_eq!(
            registry.names(),
            vec!["Download", "Log", "NoOp", "SendMail", "Sleep"]
        );
    }
}
