use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use cadence_core::{LogLevel, LogSink};

use crate::error::{Result, TaskError};
use crate::registry::BuiltinTask;

/// Suspends the calling chain for a whole number of seconds.
pub struct SleepTask {
    sink: Arc<dyn LogSink>,
}

impl SleepTask {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }
}

/// Parse a sleep value. Only non-negative integers are accepted.
pub fn parse_seconds(value: &str) -> Result<u64> {
    let secs: i64 = value
        .trim()
        .parse()
        .map_err(|e| TaskError::InvalidParameter {
            task: "Sleep",
            reason: format!("'{value}' is not a number of seconds: {e}"),
        })?;
    u64::try_from(secs).map_err(|_| TaskError::InvalidParameter {
        task: "Sleep",
        reason: format!("negative duration {secs}"),
    })
}

#[async_trait]
impl BuiltinTask for SleepTask {
    async fn run(&self, value: &str) -> Result<()> {
        let secs = parse_seconds(value)?;
        self.sink
            .log(LogLevel::Debug, &format!("Sleep task called for {secs} seconds"))
            .await;
        tokio::time::sleep(Duration::from_secs(secs)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::NullSink;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn sleeps_for_the_requested_seconds() {
        let task = SleepTask::new(Arc::new(NullSink));
        let started = Instant::now();
        task.run("1").await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn unparsable_value_fails_without_sleeping() {
        let task = SleepTask::new(Arc::new(NullSink));
        let started = Instant::now();
        let err = task.run("abc").await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidParameter { task: "Sleep", .. }));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[test]
    fn negative_and_blank_values_are_rejected() {
        assert!(parse_seconds("-5").is_err());
        assert!(parse_seconds("").is_err());
        assert_eq!(parse_seconds(" 3 ").unwrap(), 3);
    }
}
