//! `drumline-scheduler` — distributed schedule claiming and the engine loop.
//!
//! # Overview
//!
//! Schedules are persisted to SQLite. Any number of scheduler processes poll
//! for due schedules; each due tick is claimed through a conditional update
//! on `next_run_at` (optimistic concurrency), so exactly one process creates
//! the [`types::ScheduleRun`] for that tick and executes the workflow. Losing
//! the claim race is an expected outcome, not an error — the loser simply
//! moves on.
//!
//! # Trigger variants
//!
//! | Variant    | Behaviour                                                |
//! |------------|----------------------------------------------------------|
//! | `Cron`     | 5- or 6-field cron expression, evaluated in the schedule's IANA timezone |
//! | `Interval` | Every N days at a fixed local time                       |
//!
//! Next fire times are computed in the schedule's timezone and stored as UTC;
//! local times that do not exist across a DST transition are skipped.

pub mod cron;
pub mod db;
pub mod engine;
pub mod error;
pub mod store;
pub mod types;

pub use engine::SchedulerEngine;
pub use error::{Result, SchedulerError};
pub use store::{NewSchedule, ScheduleStore};
pub use types::{RunStatus, Schedule, ScheduleRun, Trigger};
