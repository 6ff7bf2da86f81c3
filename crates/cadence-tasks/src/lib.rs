//! In-process built-in tasks for cadence chains.
//!
//! A chain step of kind `BUILTIN` names one of the tasks registered in a
//! [`TaskRegistry`]; the engine hands it the step's parameter values and the
//! task runs once per value.

pub mod builtins;
pub mod error;
pub mod registry;

#[cfg(test)]
mod testing;

pub use builtins::download::DownloadRequest;
pub use builtins::mail::{
    Delivery, MailMessage, MailRouter, MailTransport, SendmailTransport, SmtpTransport,
};
pub use error::{Result, TaskError};
pub use registry::{BuiltinTask, TaskRegistry};
