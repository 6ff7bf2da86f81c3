//! Sequential execution of a chain's elements.
//!
//! The ordering and failure rules live here, apart from any store access, so
//! they can be exercised with a fake [`StepExecutor`].

use async_trait::async_trait;

use cadence_core::{LogLevel, LogSink};
use cadence_pgengine::ChainElement;

use crate::error::{Result, SchedulerError};

/// Executes one chain element. Implemented by the engine's chain run.
#[async_trait]
pub trait StepExecutor: Send {
    async fn execute(&mut self, element: &ChainElement) -> Result<()>;
}

/// How a chain run ended.
#[derive(Debug)]
pub enum ChainOutcome {
    Done,
    Failed {
        /// `chain_id` of the element that stopped the chain.
        element: i64,
        task_name: String,
        error: SchedulerError,
    },
}

impl ChainOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, ChainOutcome::Done)
    }

    /// Text stored in `run_status.error`.
    pub fn error_detail(&self) -> Option<String> {
        match self {
            ChainOutcome::Done => None,
            ChainOutcome::Failed {
                element,
                task_name,
                error,
            } => Some(format!("element {element} ({task_name}) failed: {error}")),
        }
    }
}

/// Run `elements` in ascending `step_order`.
///
/// A failure stops the chain unless the element has `ignore_error` set, in
/// which case it is logged at `ERROR` and the next element runs. Losing the
/// store connection always stops the chain.
pub async fn run_steps<E>(
    executor: &mut E,
    elements: &[ChainElement],
    log: &dyn LogSink,
) -> ChainOutcome
where
    E: StepExecutor + ?Sized,
{
    let mut ordered: Vec<&ChainElement> = elements.iter().collect();
    ordered.sort_by_key(|e| e.step_order);

    for element in ordered {
        let Err(error) = executor.execute(element).await else {
            continue;
        };

        if element.ignore_error && !error.is_connection_lost() {
            log.log(
                LogLevel::Error,
                &format!(
                    "Ignoring failure of element {} ({}): {error}",
                    element.chain_id, element.task_name
                ),
            )
            .await;
            continue;
        }

        return ChainOutcome::Failed {
            element: element.chain_id,
            task_name: element.task_name.clone(),
            error,
        };
    }
    ChainOutcome::Done
}
