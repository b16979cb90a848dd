//! `drumline-core` — configuration, shared error type, and query tracing.
//!
//! Leaf crate of the drumline workspace: everything here is consumed by the
//! templating, backend, execution and scheduler crates, and depends on none
//! of them.

pub mod config;
pub mod error;
pub mod trace;
pub mod types;

pub use config::DrumlineConfig;
pub use error::{CoreError, Result};
pub use trace::{QueryTrace, Stage};
pub use types::TargetContext;
