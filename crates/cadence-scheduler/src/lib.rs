//! `cadence-scheduler` — chain execution engine.
//!
//! # Overview
//!
//! The [`engine::SchedulerEngine`] polls the store for chain configs that are
//! due for this client, claims a run for each eligible one and executes its
//! elements in order inside a single local transaction.
//!
//! # Element kinds
//!
//! | Kind      | Executed by                                                   |
//! |-----------|---------------------------------------------------------------|
//! | `SQL`     | the chain transaction (savepoint per step) or a remote target |
//! | `PROGRAM` | an external process, once per parameter value                 |
//! | `BUILTIN` | the in-process task registry                                  |

pub mod active;
pub mod eligibility;
pub mod engine;
pub mod error;
pub mod program;
pub mod steps;

pub use active::ActiveRuns;
pub use engine::{run_chain_config, EngineContext, SchedulerEngine};
pub use error::{Result, SchedulerError};
pub use steps::{run_steps, ChainOutcome, StepExecutor};
