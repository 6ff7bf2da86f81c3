//! `PROGRAM` steps: run an executable once per parameter value.

use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, SchedulerError};

/// Output kept from one run, in characters. The middle of longer output is
/// dropped.
const MAX_OUTPUT_CHARS: usize = 8_000;

/// Parse one parameter value into argv. Blank values yield `None`.
pub fn parse_arguments(index: usize, value: &str) -> Result<Option<Vec<String>>> {
    if value.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str::<Vec<String>>(value)
        .map(Some)
        .map_err(|e| {
            SchedulerError::InvalidProgram(format!(
                "parameter value #{index} is not a JSON array of strings: {e}"
            ))
        })
}

/// Run `command` once per parameter value, in order.
///
/// Without usable values the command runs once with no arguments. The first
/// non-zero exit stops the remaining runs. Returns the captured output of each
/// successful run.
pub async fn execute_program(command: &str, param_values: &[String]) -> Result<Vec<String>> {
    let command = command.trim();
    if command.is_empty() {
        return Err(SchedulerError::InvalidProgram(
            "program command cannot be empty".to_string(),
        ));
    }

    let mut argv_sets = Vec::with_capacity(param_values.len());
    for (index, value) in param_values.iter().enumerate() {
        if let Some(args) = parse_arguments(index, value)? {
            argv_sets.push(args);
        }
    }
    if argv_sets.is_empty() {
        argv_sets.push(Vec::new());
    }

    let mut outputs = Vec::with_capacity(argv_sets.len());
    for args in &argv_sets {
        outputs.push(run_once(command, args).await?);
    }
    Ok(outputs)
}

async fn run_once(command: &str, args: &[String]) -> Result<String> {
    debug!(command, ?args, "spawning program step");

    let output = Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    let combined = truncate_output(combined.trim(), MAX_OUTPUT_CHARS);

    if output.status.success() {
        Ok(combined)
    } else {
        Err(SchedulerError::Program {
            command: command.to_string(),
            // Killed by a signal.
            exit_code: output.status.code().unwrap_or(-1),
            output: combined,
        })
    }
}

fn truncate_output(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let keep = max_chars / 2;
    let head: String = text.chars().take(keep).collect();
    let tail: String = text.chars().skip(total - keep).collect();
    format!("{head}\n... [{} characters omitted] ...\n{tail}", total - 2 * keep)
}
