//! Dependency Tracker (§4.F).
//!
//! Owns `jobStates` and `waitingJobs` exclusively; every other component
//! reaches this state only through these methods (§3 Ownership, §5 Locks).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::clock::Clock;
use crate::error::DependencyError;
use crate::models::{DependencySpec, JobState, RequiredState};

/// Fired asynchronously whenever a job's recorded state changes
/// (§4.L state-change callback; fire-and-forget per §5).
pub type StateChangeCallback = Arc<dyn Fn(&str, RequiredState, Option<&str>) + Send + Sync>;

/// The minimal shape `CheckDependencies`/`WaitForDependencies` need from a
/// job definition: its declared dependency list.
pub trait HasDependencies {
    fn dependencies(&self) -> &[DependencySpec];
}

impl HasDependencies for Vec<DependencySpec> {
    fn dependencies(&self) -> &[DependencySpec] {
        self
    }
}

struct Waiter {
    notify: Arc<Notify>,
}

/// Poll interval for `WaitForDependencies` (§4.F: "polls every 5s").
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Tracks recorded job states and notifies waiters on change (§4.F).
pub struct DependencyTracker {
    job_states: DashMap<String, JobState>,
    waiting: DashMap<String, Vec<Waiter>>,
    clock: Arc<dyn Clock>,
    on_state_change: Option<StateChangeCallback>,
}

impl DependencyTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            job_states: DashMap::new(),
            waiting: DashMap::new(),
            clock,
            on_state_change: None,
        }
    }

    pub fn with_state_change_callback(mut self, cb: StateChangeCallback) -> Self {
        self.on_state_change = Some(cb);
        self
    }

    /// Pure read against `jobStates`. For each declared dependency, verify
    /// its recorded state matches `requiredState` ("any" accepts completed
    /// or failed); if a `timeoutSeconds > 0` is declared, also verify
    /// `now - completedAt <= timeout`.
    pub fn check_dependencies(&self, deps: &[DependencySpec]) -> (bool, String) {
        for dep in deps {
            let Some(state) = self.job_states.get(&dep.job_id) else {
                return (false, format!("dependency {} has no recorded state", dep.job_id));
            };

            let satisfied_state = match dep.required_state {
                RequiredState::Any => matches!(
                    state.state,
                    RequiredState::Completed | RequiredState::Failed
                ),
                want => state.state == want,
            };
            if !satisfied_state {
                return (
                    false,
                    format!(
                        "dependency {} is {:?}, required {:?}",
                        dep.job_id, state.state, dep.required_state
                    ),
                );
            }

            if dep.timeout_seconds > 0 {
                if let Some(completed_at) = state.completed_at {
                    let elapsed = self.clock.now() - completed_at;
                    if elapsed > ChronoDuration::seconds(dep.timeout_seconds as i64) {
                        return (
                            false,
                            format!("dependency {} satisfied but stale (elapsed {elapsed})", dep.job_id),
                        );
                    }
                }
            }
        }
        (true, String::new())
    }

    /// Register as a waiter on each dependency, poll every 5s, react to
    /// wake-ups from `update_job_state`. Returns `Ok(())` once satisfied,
    /// `Err(DependencyError::Cancelled)` if `cancel` fires, or
    /// `Err(DependencyError::Timeout)` once any dependency's declared
    /// wait-timeout elapses since wait-start.
    pub async fn wait_for_dependencies(
        &self,
        deps: &[DependencySpec],
        cancel: Arc<Notify>,
    ) -> Result<(), DependencyError> {
        let (satisfied, _) = self.check_dependencies(deps);
        if satisfied {
            return Ok(());
        }

        let notify = Arc::new(Notify::new());
        for dep in deps {
            self.waiting
                .entry(dep.job_id.clone())
                .or_default()
                .push(Waiter {
                    notify: notify.clone(),
                });
        }

        let wait_start = self.clock.now();
        let mut ticker = tokio::time::interval(POLL_INTERVAL);

        let result = loop {
            tokio::select! {
                _ = cancel.notified() => break Err(DependencyError::Cancelled),
                _ = notify.notified() => {
                    let (satisfied, _) = self.check_dependencies(deps);
                    if satisfied {
                        break Ok(());
                    }
                }
                _ = ticker.tick() => {
                    let (satisfied, _) = self.check_dependencies(deps);
                    if satisfied {
                        break Ok(());
                    }
                    if let Some(timed_out) = self.timed_out_dependency(deps, wait_start) {
                        break Err(DependencyError::Timeout(timed_out));
                    }
                }
            }
        };

        self.remove_waiter(deps, &notify);
        result
    }

    fn timed_out_dependency(&self, deps: &[DependencySpec], wait_start: DateTime<Utc>) -> Option<String> {
        let elapsed = self.clock.now() - wait_start;
        deps.iter()
            .find(|d| d.timeout_seconds > 0 && elapsed > ChronoDuration::seconds(d.timeout_seconds as i64))
            .map(|d| d.job_id.clone())
    }

    fn remove_waiter(&self, deps: &[DependencySpec], notify: &Arc<Notify>) {
        for dep in deps {
            if let Some(mut list) = self.waiting.get_mut(&dep.job_id) {
                list.retain(|w| !Arc::ptr_eq(&w.notify, notify));
            }
        }
    }

    /// Record a job's state, fire the state-change callback asynchronously,
    /// and wake every waiter registered on `job_id` whose dependency set is
    /// now satisfied.
    pub fn update_job_state(&self, job_id: &str, state: RequiredState, error: Option<String>) {
        let completed_at = Some(self.clock.now());
        self.job_states.insert(
            job_id.to_string(),
            JobState {
                job_id: job_id.to_string(),
                state,
                completed_at,
                error: error.clone(),
            },
        );

        if let Some(cb) = self.on_state_change.clone() {
            let job_id = job_id.to_string();
            let error = error.clone();
            tokio::spawn(async move {
                cb(&job_id, state, error.as_deref());
            });
        }

        if let Some(waiters) = self.waiting.get(job_id) {
            for waiter in waiters.iter() {
                waiter.notify.notify_waiters();
            }
        }
    }

    /// GC states older than `max_age`. Returns the number of entries
    /// removed (supplemented introspection per SPEC_FULL.md §3).
    pub fn clear_old_states(&self, max_age: Duration) -> usize {
        let now = self.clock.now();
        let Ok(cutoff) = ChronoDuration::from_std(max_age) else {
            return 0;
        };
        let mut removed = 0;
        self.job_states.retain(|_, state| {
            let keep = state
                .completed_at
                .map(|t| now - t <= cutoff)
                .unwrap_or(true);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn get_state(&self, job_id: &str) -> Option<JobState> {
        self.job_states.get(job_id).map(|r| r.clone())
    }

    pub fn tracked_count(&self) -> usize {
        self.job_states.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.iter().map(|r| r.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tracker() -> DependencyTracker {
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        DependencyTracker::new(clock)
    }

    fn dep(job_id: &str, required: RequiredState, timeout: u64) -> DependencySpec {
        DependencySpec {
            job_id: job_id.to_string(),
            required_state: required,
            timeout_seconds: timeout,
        }
    }

    /// §8.5: UpdateJobState(J, ...) followed by CheckDependencies where
    /// job.dependsOn = [{J, "any", 0}] returns satisfied=true.
    #[test]
    fn s8_5_any_accepts_completed_or_failed() {
        let tracker = tracker();
        tracker.update_job_state("J", RequiredState::Completed, None);
        let (satisfied, _) = tracker.check_dependencies(&[dep("J", RequiredState::Any, 0)]);
        assert!(satisfied);

        tracker.update_job_state("K", RequiredState::Failed, Some("boom".into()));
        let (satisfied, _) = tracker.check_dependencies(&[dep("K", RequiredState::Any, 0)]);
        assert!(satisfied);
    }

    #[test]
    fn unknown_dependency_is_unsatisfied_not_a_crash() {
        let tracker = tracker();
        let (satisfied, reason) = tracker.check_dependencies(&[dep("missing", RequiredState::Completed, 0)]);
        assert!(!satisfied);
        assert!(reason.contains("no recorded state"));
    }

    #[test]
    fn required_state_mismatch_is_unsatisfied() {
        let tracker = tracker();
        tracker.update_job_state("J", RequiredState::Failed, Some("err".into()));
        let (satisfied, _) = tracker.check_dependencies(&[dep("J", RequiredState::Completed, 0)]);
        assert!(!satisfied);
    }

    #[tokio::test]
    async fn wait_for_dependencies_returns_immediately_when_satisfied() {
        let tracker = tracker();
        tracker.update_job_state("J", RequiredState::Completed, None);
        let cancel = Arc::new(Notify::new());
        let result = tokio::time::timeout(
            Duration::from_millis(200),
            tracker.wait_for_dependencies(&[dep("J", RequiredState::Completed, 0)], cancel),
        )
        .await
        .expect("should not hang");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn wait_for_dependencies_wakes_on_update() {
        let tracker = Arc::new(tracker());
        let cancel = Arc::new(Notify::new());
        let waiter_tracker = tracker.clone();
        let waiter_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            waiter_tracker
                .wait_for_dependencies(&[dep("J", RequiredState::Completed, 0)], waiter_cancel)
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tracker.update_job_state("J", RequiredState::Completed, None);

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("should wake promptly")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn wait_for_dependencies_cancels() {
        let tracker = tracker();
        let cancel = Arc::new(Notify::new());
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel2.notify_waiters();
        });
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            tracker.wait_for_dependencies(&[dep("never", RequiredState::Completed, 0)], cancel),
        )
        .await
        .expect("should not hang");
        assert_eq!(result, Err(DependencyError::Cancelled));
    }

    #[test]
    fn clear_old_states_gc() {
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let tracker = DependencyTracker::new(clock.clone());
        tracker.update_job_state("old", RequiredState::Completed, None);
        clock.advance(chrono::Duration::hours(2));
        tracker.update_job_state("new", RequiredState::Completed, None);

        let removed = tracker.clear_old_states(Duration::from_secs(3600));
        assert_eq!(removed, 1);
        assert!(tracker.get_state("old").is_none());
        assert!(tracker.get_state("new").is_some());
    }

    #[tokio::test]
    async fn state_change_callback_fires() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let tracker = DependencyTracker::new(clock).with_state_change_callback(Arc::new(move |_, _, _| {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        tracker.update_job_state("J", RequiredState::Completed, None);
        // Callback dispatch is fire-and-forget; give the spawned task a turn.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
