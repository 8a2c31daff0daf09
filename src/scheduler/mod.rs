//! Scheduler Core (§4.J).
//!
//! Owns the schedule table and cron bindings under a single lock (§5:
//! "each component owns exactly one RWMutex"). Drives the submission
//! pipeline described in §2's Flow diagram for both cron-fired and
//! `TriggerNow`-triggered runs: Dependency Tracker (F) → Time-Window/
//! Condition Gate (H) → Priority Queue (E) → Executor Adapter (K). See
//! DESIGN.md for how this reconciles with §4.J's three-line
//! `executeScheduledJob` pseudocode, which elides the F/H/E stages that
//! `AdvancedScheduleConfig` would otherwise have nowhere to apply.
//!
//! Each fire is a single non-blocking pass through the pipeline: an unmet
//! dependency, a closed time window, or a failed condition skips this fire
//! rather than parking the task, so a later cron tick or `TriggerNow` is
//! what re-checks and actually dispatches — the engine never holds a
//! background task blocked on `DependencyTracker::wait_for_dependencies`
//! (that method remains available to callers who want blocking semantics
//! directly).
//!
//! Background tasks need a `'static` owned handle back to this struct
//! (to fire cron ticks, drain the queue, and dispatch runs). Rather than
//! require every caller to juggle an external `Arc<SchedulerCore>`
//! (the teacher's `CronScheduler` instead clones out individually
//! `Arc`-wrapped fields — not an option here, since the schedule table
//! itself is the thing that needs sharing), this stores a `Weak` back
//! to itself via `Arc::new_cyclic` and upgrades it wherever a spawn
//! needs one.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;

use crate::clock::Clock;
use crate::cron::CronEvaluator;
use crate::dependency::DependencyTracker;
use crate::error::{SchedulerError, ValidationError};
use crate::gate::evaluate_conditions;
use crate::models::{AdvancedScheduleConfig, JobTemplate, RequiredState, ScheduleEntry};
use crate::queue::PriorityQueue;
use crate::retry::RetryManager;
use crate::traits::{JobExecutor, ScheduleStore};

/// Configuration for [`SchedulerCore`] (§2.3 of SPEC_FULL.md).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the tick loop checks for due cron entries and drains the
    /// priority queue.
    pub tick_interval: Duration,
    /// Global cap on concurrently-dispatched runs, passed to the
    /// [`PriorityQueue`].
    pub max_concurrent_jobs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            max_concurrent_jobs: 50,
        }
    }
}

/// Optional partial update applied by `update_scheduled_job` (§4.J): only
/// `Some` fields are applied, matching "apply non-empty field updates".
#[derive(Debug, Default)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub schedule: Option<String>,
    pub job_template: Option<JobTemplate>,
    pub enabled: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub advanced_config: Option<Option<AdvancedScheduleConfig>>,
}

struct ScheduleBinding {
    entry: ScheduleEntry,
    cron: Option<CronEvaluator>,
}

/// Snapshot returned by `get_schedule_stats` (§3 supplemented feature).
#[derive(Debug, Clone, Default)]
pub struct ScheduleStats {
    pub total: usize,
    pub enabled: usize,
    pub disabled: usize,
    pub bound: usize,
    pub earliest_next_run: Option<DateTime<Utc>>,
}

struct PendingRun {
    schedule_id: String,
    template: JobTemplate,
    advanced_config: Option<AdvancedScheduleConfig>,
}

/// Owns the schedule table, cron bindings, and execution dispatch (§4.J).
pub struct SchedulerCore {
    weak_self: Weak<SchedulerCore>,
    table: RwLock<HashMap<String, ScheduleBinding>>,
    pending: DashMap<String, PendingRun>,
    run_to_schedule: DashMap<String, String>,
    in_flight_schedules: DashMap<String, ()>,
    queue: Mutex<PriorityQueue>,
    executor: Arc<dyn JobExecutor>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn ScheduleStore>>,
    dependencies: Arc<DependencyTracker>,
    retry: Arc<RetryManager>,
    config: SchedulerConfig,
    running: AtomicBool,
    shutdown: Arc<Notify>,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl SchedulerCore {
    pub fn new(
        config: SchedulerConfig,
        executor: Arc<dyn JobExecutor>,
        clock: Arc<dyn Clock>,
        store: Option<Arc<dyn ScheduleStore>>,
        dependencies: Arc<DependencyTracker>,
        retry: Arc<RetryManager>,
    ) -> Arc<Self> {
        let max_slots = config.max_concurrent_jobs;
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            table: RwLock::new(HashMap::new()),
            pending: DashMap::new(),
            run_to_schedule: DashMap::new(),
            in_flight_schedules: DashMap::new(),
            queue: Mutex::new(PriorityQueue::new(max_slots)),
            executor,
            clock,
            store,
            dependencies,
            retry,
            config,
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
            started_at: Mutex::new(None),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak_self
            .upgrade()
            .expect("SchedulerCore is only ever reached through its own Arc")
    }

    /// Start the cron tick loop (§4.J `Start`). Idempotent: calling twice
    /// while already running is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.started_at.lock() = Some(self.clock.now());
        let scheduler = self.arc();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.config.tick_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !scheduler.running.load(Ordering::SeqCst) {
                            break;
                        }
                        scheduler.tick().await;
                    }
                    _ = scheduler.shutdown.notified() => {
                        tracing::info!("scheduler tick loop shutting down");
                        break;
                    }
                }
            }
        });
    }

    /// Stop the cron loop (§4.J `Stop`). In-flight tick handlers are
    /// spawned tasks and are not awaited here, matching the engine's
    /// fire-and-forget dispatch discipline (§5).
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    async fn tick(&self) {
        let now = self.clock.now();
        let due: Vec<String> = {
            let table = self.table.read();
            table
                .iter()
                .filter(|(_, b)| b.entry.enabled && b.entry.next_run.map(|t| t <= now).unwrap_or(false))
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in due {
            let scheduler = self.arc();
            let id2 = id.clone();
            tokio::spawn(async move {
                scheduler.execute_scheduled_job(&id2).await;
            });
            // Advance next_run immediately so a slow execution doesn't
            // re-fire the same tick twice (§5 Ordering guarantees).
            self.advance_next_run(&id, now);
        }
        self.drain_queue().await;
    }

    fn advance_next_run(&self, id: &str, after: DateTime<Utc>) {
        let mut table = self.table.write();
        if let Some(binding) = table.get_mut(id) {
            if let Some(cron) = &binding.cron {
                binding.entry.next_run = cron.next_after(after);
            }
        }
    }

    /// Drain as much of the priority queue as current capacity allows,
    /// dispatching each popped run to the executor.
    async fn drain_queue(&self) {
        loop {
            let run_id = {
                let mut queue = self.queue.lock();
                queue.get_next()
            };
            let Some(run_id) = run_id else { break };
            let Some((_, pending)) = self.pending.remove(&run_id) else {
                continue;
            };
            let scheduler = self.arc();
            tokio::spawn(async move {
                scheduler.dispatch(run_id, pending).await;
            });
        }
    }

    async fn dispatch(&self, run_id: String, pending: PendingRun) {
        match self.executor.submit_job(&pending.template).await {
            Ok(_submission_id) => {
                // Submit-acceptance is not completion (§4.K): the executor's
                // provider work proceeds asynchronously, and whatever drives
                // it reports Completed back through `update_job_state` on
                // its own. The scheduler does not synthesize it here.
            }
            Err(err) => {
                let policy = pending
                    .advanced_config
                    .as_ref()
                    .and_then(|c| c.retry_policy.clone());
                if self.retry.should_retry(&pending.template.id, policy.as_ref(), &err) {
                    self.retry.clone().schedule_retry(
                        pending.template.id.clone(),
                        pending.template.name.clone(),
                        pending.template.clone(),
                        policy.expect("should_retry implies a policy"),
                        err,
                        self.executor.clone(),
                    );
                } else {
                    self.dependencies.update_job_state(&pending.template.id, RequiredState::Failed, Some(err));
                }
            }
        }
        self.complete_run(&run_id, &pending.schedule_id);
    }

    fn complete_run(&self, run_id: &str, schedule_id: &str) {
        self.queue.lock().complete(run_id);
        self.run_to_schedule.remove(run_id);
        self.in_flight_schedules.remove(schedule_id);
    }

    /// `executeScheduledJob` (§4.J), reconciled with §2's Flow diagram: runs
    /// the dependency/gate/queue pipeline before handing off to the
    /// executor, rather than calling it directly.
    async fn execute_scheduled_job(&self, schedule_id: &str) {
        let Some(entry) = self.table.read().get(schedule_id).map(|b| b.entry.clone()) else {
            return;
        };

        let advanced = entry.advanced_config.clone();
        if advanced.as_ref().map(|c| c.skip_if_running).unwrap_or(false)
            && self.in_flight_schedules.contains_key(schedule_id)
        {
            tracing::debug!(schedule_id, "skip_if_running: previous run still in flight");
            return;
        }

        let now = self.clock.now();
        let mut job_def = entry.job_template.clone();
        job_def.id = format!("{}-{}", entry.id, now.timestamp());
        job_def.name = format!("{} (scheduled)", entry.job_template.name);

        if let Some(cfg) = &advanced {
            if !cfg.depends_on.is_empty() {
                let (satisfied, reason) = self.dependencies.check_dependencies(&cfg.depends_on);
                if !satisfied {
                    tracing::debug!(schedule_id, reason, "dependencies not satisfied; skipping this fire");
                    return;
                }
            }
            if !cfg.time_windows.is_empty() {
                let in_any_window = cfg.time_windows.iter().any(|w| w.is_in_time_window(now));
                if !in_any_window {
                    tracing::debug!(schedule_id, "outside all configured time windows; skipping this fire");
                    return;
                }
            }
            if !cfg.conditions.is_empty() && !evaluate_conditions(&cfg.conditions, now) {
                tracing::debug!(schedule_id, "a condition was not met; skipping this fire");
                return;
            }
        }

        let priority = entry.priority();
        self.in_flight_schedules.insert(schedule_id.to_string(), ());
        self.run_to_schedule.insert(job_def.id.clone(), schedule_id.to_string());
        self.pending.insert(
            job_def.id.clone(),
            PendingRun {
                schedule_id: schedule_id.to_string(),
                template: job_def.clone(),
                advanced_config: advanced,
            },
        );
        self.queue.lock().add(job_def.id.clone(), priority);
        self.drain_queue().await;

        self.record_fire(schedule_id, now);
    }

    fn record_fire(&self, schedule_id: &str, now: DateTime<Utc>) {
        let store = {
            let mut table = self.table.write();
            let Some(binding) = table.get_mut(schedule_id) else {
                return;
            };
            binding.entry.last_run = Some(now);
            binding.entry.run_count += 1;
            binding.entry.updated_at = now;
            self.store.clone().map(|s| (s, binding.entry.clone()))
        };
        if let Some((store, entry)) = store {
            tokio::spawn(async move {
                if let Err(e) = store.update_schedule(&entry).await {
                    tracing::warn!(error = %e, "failed to persist schedule run stats");
                }
            });
        }
    }

    /// `TriggerNow(id)` (§4.J): launches execution without waiting for it,
    /// even if a retry for this schedule is already in flight (§9 Open
    /// Question 4 — a second in-flight submission is allowed by design).
    pub fn trigger_now(&self, id: &str) -> Result<(), SchedulerError> {
        if !self.table.read().contains_key(id) {
            return Err(SchedulerError::NotFound(id.to_string()));
        }
        let scheduler = self.arc();
        let id = id.to_string();
        tokio::spawn(async move {
            scheduler.execute_scheduled_job(&id).await;
        });
        Ok(())
    }

    /// `LoadSchedules()` (§4.J): per-entry failures are counted but do not
    /// abort the whole load (§9 "All or none" re-architecture).
    pub async fn load_schedules(&self) -> Result<(usize, usize), SchedulerError> {
        let Some(store) = self.store.clone() else {
            return Ok((0, 0));
        };
        let entries = store.list_schedules(false).await.map_err(SchedulerError::Store)?;
        let mut loaded = 0;
        let mut failed = 0;
        for entry in entries {
            match self.insert_binding(entry) {
                Ok(()) => loaded += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load one schedule entry; continuing");
                    failed += 1;
                }
            }
        }
        Ok((loaded, failed))
    }

    fn insert_binding(&self, mut entry: ScheduleEntry) -> Result<(), SchedulerError> {
        let cron = if entry.enabled {
            let evaluator = CronEvaluator::parse(&entry.schedule).map_err(SchedulerError::Validation)?;
            entry.next_run = evaluator.next_after(self.clock.now());
            Some(evaluator)
        } else {
            None
        };
        self.table.write().insert(entry.id.clone(), ScheduleBinding { entry, cron });
        Ok(())
    }

    /// `AddScheduledJob(entry)` (§4.J): validates cron and advanced config
    /// synchronously; on error the table is left unmodified (§8 invariant
    /// 6). Runs a best-effort dependency-cycle check (§9 Open Question 5)
    /// before inserting.
    pub async fn add_scheduled_job(&self, mut entry: ScheduleEntry) -> Result<(), SchedulerError> {
        CronEvaluator::parse(&entry.schedule).map_err(SchedulerError::Validation)?;
        if let Some(cfg) = &entry.advanced_config {
            cfg.validate().map_err(SchedulerError::Validation)?;
            self.check_for_cycle(&entry.id, cfg)?;
        }

        let now = self.clock.now();
        entry.created_at = now;
        entry.updated_at = now;

        self.insert_binding(entry.clone())?;
        self.persist_best_effort(entry).await;
        Ok(())
    }

    /// Best-effort DAG check: walks `dependsOn` edges starting at every
    /// other schedule whose own `jobID` (taken as its `job_template.id`)
    /// appears in `new_entry`'s dependency list, looking for a path back to
    /// `new_entry`. Does not protect against cycles introduced later via
    /// `UpdateScheduledJob` (documented limitation, §9 Open Question 5).
    fn check_for_cycle(&self, new_id: &str, cfg: &AdvancedScheduleConfig) -> Result<(), SchedulerError> {
        let table = self.table.read();
        let mut stack: Vec<String> = cfg.depends_on.iter().map(|d| d.job_id.clone()).collect();
        let mut visited = std::collections::HashSet::new();
        while let Some(job_id) = stack.pop() {
            if job_id == new_id {
                return Err(SchedulerError::Validation(ValidationError::DependencyCycle(format!(
                    "schedule {new_id} depends (transitively) on itself via {job_id}"
                ))));
            }
            if !visited.insert(job_id.clone()) {
                continue;
            }
            if let Some(binding) = table.values().find(|b| b.entry.job_template.id == job_id) {
                if let Some(cfg) = &binding.entry.advanced_config {
                    stack.extend(cfg.depends_on.iter().map(|d| d.job_id.clone()));
                }
            }
        }
        Ok(())
    }

    async fn persist_best_effort(&self, entry: ScheduleEntry) {
        if let Some(store) = self.store.clone() {
            if let Err(e) = store.save_schedule(&entry).await {
                tracing::warn!(error = %e, "failed to persist schedule; in-memory state retained");
            }
        }
    }

    /// `RemoveScheduledJob(id)` (§4.J).
    pub async fn remove_scheduled_job(&self, id: &str) -> Result<(), SchedulerError> {
        let removed = self.table.write().remove(id);
        if removed.is_none() {
            return Err(SchedulerError::NotFound(id.to_string()));
        }
        if let Some(store) = self.store.clone() {
            if let Err(e) = store.delete_schedule(id).await {
                tracing::warn!(error = %e, "failed to delete persisted schedule");
            }
        }
        Ok(())
    }

    /// `UpdateScheduledJob(id, updates)` (§4.J): removes any existing
    /// binding, applies non-empty updates, re-binds if now enabled.
    pub async fn update_scheduled_job(&self, id: &str, updates: ScheduleUpdate) -> Result<(), SchedulerError> {
        let mut entry = {
            let mut table = self.table.write();
            let binding = table.get_mut(id).ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
            binding.cron = None;
            binding.entry.clone()
        };

        if let Some(name) = updates.name {
            entry.name = name;
        }
        if let Some(description) = updates.description {
            entry.description = description;
        }
        if let Some(schedule) = updates.schedule {
            CronEvaluator::parse(&schedule).map_err(SchedulerError::Validation)?;
            entry.schedule = schedule;
        }
        if let Some(template) = updates.job_template {
            entry.job_template = template;
        }
        if let Some(enabled) = updates.enabled {
            entry.enabled = enabled;
        }
        if let Some(tags) = updates.tags {
            entry.tags = tags;
        }
        if let Some(advanced_config) = updates.advanced_config {
            if let Some(cfg) = &advanced_config {
                cfg.validate().map_err(SchedulerError::Validation)?;
            }
            entry.advanced_config = advanced_config;
        }
        entry.updated_at = self.clock.now();

        self.insert_binding(entry.clone())?;
        self.persist_best_effort(entry).await;
        Ok(())
    }

    /// `EnableScheduledJob(id)` (§4.J): idempotent.
    pub async fn enable_scheduled_job(&self, id: &str) -> Result<(), SchedulerError> {
        self.update_scheduled_job(
            id,
            ScheduleUpdate {
                enabled: Some(true),
                ..Default::default()
            },
        )
        .await
    }

    /// `DisableScheduledJob(id)` (§4.J): idempotent.
    pub async fn disable_scheduled_job(&self, id: &str) -> Result<(), SchedulerError> {
        self.update_scheduled_job(
            id,
            ScheduleUpdate {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
    }

    /// `ListScheduledJobs()` (§4.J): write-locks to refresh `next_run` from
    /// the live cron binding before returning (display-only refresh).
    pub fn list_scheduled_jobs(&self) -> Vec<ScheduleEntry> {
        let now = self.clock.now();
        let mut table = self.table.write();
        table
            .values_mut()
            .map(|binding| {
                if let Some(cron) = &binding.cron {
                    binding.entry.next_run = cron.next_after(now);
                }
                binding.entry.clone()
            })
            .collect()
    }

    pub fn get_schedule(&self, id: &str) -> Option<ScheduleEntry> {
        self.table.read().get(id).map(|b| b.entry.clone())
    }

    /// `GetScheduleStats()` (§4.J / §3 supplemented detail).
    pub fn get_schedule_stats(&self) -> ScheduleStats {
        let table = self.table.read();
        let mut stats = ScheduleStats {
            total: table.len(),
            ..Default::default()
        };
        for binding in table.values() {
            if binding.entry.enabled {
                stats.enabled += 1;
            } else {
                stats.disabled += 1;
            }
            if binding.cron.is_some() {
                stats.bound += 1;
            }
            if binding.entry.enabled {
                stats.earliest_next_run = match (stats.earliest_next_run, binding.entry.next_run) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (None, Some(b)) => Some(b),
                    (a, None) => a,
                };
            }
        }
        stats
    }

    /// Pending (not-yet-dispatched) runs sitting in the priority queue
    /// (§4.E) — exposed for the metrics snapshot (§2.4 of SPEC_FULL.md).
    pub fn queue_pending_count(&self) -> usize {
        self.queue.lock().size()
    }

    /// Runs currently occupying a concurrency slot.
    pub fn queue_running_count(&self) -> usize {
        self.queue.lock().running_count()
    }

    /// Configured concurrency cap.
    pub fn max_concurrent_jobs(&self) -> usize {
        self.config.max_concurrent_jobs
    }

    /// Seconds since `start()` was called, or 0 if not yet started.
    pub fn uptime_seconds(&self) -> u64 {
        match *self.started_at.lock() {
            Some(started) => (self.clock.now() - started).num_seconds().max(0) as u64,
            None => 0,
        }
    }
}
