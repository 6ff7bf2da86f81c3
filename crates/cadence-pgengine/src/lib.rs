//! `cadence-pgengine` — everything that talks to PostgreSQL.
//!
//! # Overview
//!
//! | Module       | Responsibility                                              |
//! |--------------|-------------------------------------------------------------|
//! | `store`      | pooled connection to the configuration store                |
//! | `logger`     | leveled log rows in `timetable.log`                         |
//! | `lock`       | advisory lock claiming the scheduler's client identity      |
//! | `chain`      | due configs, chain elements, parameters, execution log      |
//! | `run_status` | `STARTED` → `DONE`/`FAILED`/`CRASHED` bookkeeping           |
//! | `command`    | validated SQL execution with JSON positional parameters     |
//! | `remote`     | per-step connections to remote targets and role switching   |
//! | `recovery`   | closing runs left behind by a dead scheduler                |

pub mod chain;
pub mod command;
pub mod error;
pub mod lock;
pub mod logger;
pub mod recovery;
pub mod remote;
pub mod retry;
pub mod run_status;
pub mod store;
pub mod types;

pub use error::{PgEngineError, Result};
pub use lock::IdentityLock;
pub use logger::DbLogger;
pub use retry::RetryPolicy;
pub use store::Store;
pub use types::{ChainConfig, ChainElement, ExecutionRecord, RunStatusRow};
