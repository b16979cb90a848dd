//! `drumline-exec` — execution lifecycle management.
//!
//! An [`Execution`](types::Execution) is one submission of a materialized
//! query to the backend. The [`manager::ExecutionManager`] drives its state
//! machine:
//!
//! ```text
//! pending --submit(ok)-------------------> running
//! running --poll(terminal success)-------> succeeded
//! running --poll(terminal failure)-------> failed
//! pending --submit(retries exhausted)----> failed
//! running --poll budget exhausted--------> failed (poll timeout)
//! ```
//!
//! Terminal rows are written exactly once; re-polling after a terminal state
//! is a no-op, and an externally cancelled execution is never overwritten by
//! a later poll result.

pub mod db;
pub mod error;
pub mod manager;
pub mod store;
pub mod types;

pub use error::{ExecError, Result};
pub use manager::{ExecutionHandle, ExecutionManager};
pub use store::{ExecutionStore, TemplateStore};
pub use types::{Execution, ExecutionStatus, WorkflowTemplate};
