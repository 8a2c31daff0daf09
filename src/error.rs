//! Crate-wide error taxonomy.
//!
//! Each subsystem gets its own `thiserror` enum at its boundary (matching the
//! teacher's `MetricsError`/`JobStoreError` pattern); [`OrchestratorError`]
//! composes them for callers that cross subsystem boundaries, such as
//! `SchedulerCore`.

use thiserror::Error;

/// Validation failures raised synchronously at schedule-mutation time.
///
/// Per §7, these never panic and never mutate engine state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid cron expression `{0}`: {1}")]
    InvalidCron(String, String),

    #[error("invalid time HH:MM `{0}`")]
    InvalidTime(String),

    #[error("unknown IANA timezone `{0}`")]
    InvalidTimezone(String),

    #[error("time window has no days of week set")]
    EmptyDaysOfWeek,

    #[error("priority {0} out of range [0, 100]")]
    PriorityOutOfRange(u8),

    #[error("retry policy maxAttempts must be >= 0 (negative value supplied)")]
    NegativeMaxAttempts,

    #[error("dependency cycle detected: {0}")]
    DependencyCycle(String),

    #[error("{0}")]
    Other(String),
}

/// Errors raised by [`crate::scheduler::SchedulerCore`] operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("schedule not found: {0}")]
    NotFound(String),

    #[error("dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("executor submission failed: {0}")]
    Executor(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors raised by [`crate::dependency::DependencyTracker`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DependencyError {
    #[error("timed out waiting on dependency {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,
}

/// Errors raised by a [`crate::traits::ScheduleStore`] implementation.
///
/// Per §7, these are logged and swallowed by the engine — in-memory state
/// remains authoritative — but the type exists so stores can report detail
/// to their own logs / metrics.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by the [`crate::carbon::CarbonProvider`] boundary.
#[derive(Debug, Error, Clone)]
pub enum CarbonProviderError {
    #[error("unknown zone `{0}`")]
    UnknownZone(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// Top-level crate error, composing the subsystem errors.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Carbon(#[from] CarbonProviderError),

    #[error("internal error: {0}")]
    Internal(String),
}
