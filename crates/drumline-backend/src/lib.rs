//! `drumline-backend` — async query backend client and retry policy.
//!
//! The backend accepts SQL-like queries over HTTP with submit/poll semantics:
//! a submission returns a backend-assigned execution id, and status is polled
//! until a terminal state. Every call is made through [`retry::RetryPolicy`],
//! which distinguishes transient failures (429/5xx, connection trouble) from
//! permanent ones and honours server-provided `Retry-After` hints.

pub mod client;
pub mod error;
pub mod retry;

pub use client::{
    BackendQueryStatus, HttpQueryBackend, QueryBackend, ResultMetadata, StatusResponse,
    SubmitResponse,
};
pub use error::BackendError;
pub use retry::RetryPolicy;
