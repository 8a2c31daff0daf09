//! Retry Manager (§4.G).
//!
//! Owns `retryAttempts` exclusively (§3 Ownership, §5 Locks — backed here
//! by `DashMap`, one shard-lock per key rather than one coarse `RwLock`,
//! matching the teacher's use of `DashMap` for per-key scheduler state).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::models::{BackoffStrategy, JobTemplate, RetryAttempt, RetryHistoryEntry, RetryPolicy};
use crate::traits::{JobExecutor, RetryNotifier};

/// `fib(1)=1, fib(2)=1, fib(3)=2, fib(4)=3, fib(5)=5, ...` — the GLOSSARY /
/// §4.G convention. See SPEC_FULL.md §5 Open Question 1 for why
/// `RetryManager` and `RetryPolicy::calculate_backoff` both use
/// `fib(attempt)` rather than an offset variant.
fn fib(n: u32) -> u64 {
    if n == 0 {
        return 0;
    }
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 1..n {
        let next = a + b;
        a = b;
        b = next;
    }
    a
}

/// Compute the backoff delay for `attempt` (1-based) under `policy`,
/// clamped to `policy.max_delay` (§4.G, §8.3).
pub fn calculate_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let initial = policy.initial_delay;
    let delay = match policy.strategy {
        BackoffStrategy::Linear => initial.saturating_mul(attempt),
        BackoffStrategy::Exponential => {
            let exponent = attempt.saturating_sub(1);
            let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
            initial.saturating_mul(factor.min(u32::MAX as u64) as u32)
        }
        BackoffStrategy::Fibonacci => {
            let factor = fib(attempt).min(u32::MAX as u64) as u32;
            initial.saturating_mul(factor)
        }
        BackoffStrategy::Constant => initial,
    };
    delay.min(policy.max_delay)
}

/// Per-job-ID retry bookkeeping, backoff computation and reschedule (§4.G).
pub struct RetryManager {
    attempts: DashMap<String, RetryAttempt>,
    clock: Arc<dyn Clock>,
    notifier: Option<Arc<dyn RetryNotifier>>,
}

impl RetryManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            attempts: DashMap::new(),
            clock,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn RetryNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// `false` if no policy, if `currentAttempts >= maxAttempts`, or if
    /// `retryOnErrors` is non-empty and no pattern is a substring of the
    /// error text (§4.G).
    pub fn should_retry(&self, job_id: &str, policy: Option<&RetryPolicy>, err: &str) -> bool {
        let Some(policy) = policy else {
            return false;
        };
        let current_attempts = self.attempts.get(job_id).map(|a| a.attempt).unwrap_or(0);
        if current_attempts >= policy.max_attempts {
            return false;
        }
        if !policy.retry_on_errors.is_empty()
            && !policy.retry_on_errors.iter().any(|pattern| err.contains(pattern.as_str()))
        {
            return false;
        }
        true
    }

    /// Increment the attempt counter, compute delay, record history, fire
    /// the retry notifier asynchronously, and launch a deferred execution
    /// that calls `executor.submit_job`. On success the retry state is
    /// cleared; on failure `should_retry` is consulted once more.
    pub fn schedule_retry(
        self: Arc<Self>,
        job_id: String,
        name: String,
        template: JobTemplate,
        policy: RetryPolicy,
        err: String,
        executor: Arc<dyn JobExecutor>,
    ) {
        let now = self.clock.now();
        let attempt = {
            let mut entry = self.attempts.entry(job_id.clone()).or_default();
            entry.attempt += 1;
            entry.last_error = Some(err.clone());
            entry.attempt
        };

        let delay = calculate_backoff(&policy, attempt);
        let next_retry = now + chrono::Duration::from_std(delay).unwrap_or_default();

        {
            let mut entry = self.attempts.get_mut(&job_id).expect("just inserted above");
            entry.next_retry = Some(next_retry);
            entry.history.push(RetryHistoryEntry {
                attempt,
                timestamp: now,
                error: err.clone(),
                delay,
            });
        }

        if let Some(notifier) = self.notifier.clone() {
            let job_id = job_id.clone();
            let name = name.clone();
            let max_attempts = policy.max_attempts;
            tokio::spawn(async move {
                notifier.notify_retry(&job_id, &name, attempt, max_attempts, next_retry);
            });
        }

        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match executor.submit_job(&template).await {
                Ok(_run_id) => {
                    manager.attempts.remove(&job_id);
                }
                Err(next_err) => {
                    if manager.should_retry(&job_id, Some(&policy), &next_err) {
                        manager.schedule_retry(job_id, name, template, policy, next_err, executor);
                    } else {
                        tracing::warn!(job_id, "retry attempts exhausted: {next_err}");
                    }
                }
            }
        });
    }

    pub fn retry_history(&self, job_id: &str) -> Vec<RetryHistoryEntry> {
        self.attempts
            .get(job_id)
            .map(|a| a.history.clone())
            .unwrap_or_default()
    }

    pub fn current_attempt(&self, job_id: &str) -> u32 {
        self.attempts.get(job_id).map(|a| a.attempt).unwrap_or(0)
    }

    pub fn clear(&self, job_id: &str) {
        self.attempts.remove(job_id);
    }

    pub fn in_flight_count(&self) -> usize {
        self.attempts.len()
    }

    pub fn next_retry_time(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.attempts.get(job_id).and_then(|a| a.next_retry)
    }
}
