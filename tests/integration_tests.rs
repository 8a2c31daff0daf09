//! End-to-end integration tests for the orchestration engine.
//!
//! Exercises the wired-up `Orchestrator` facade rather than individual
//! components in isolation, covering cross-module interactions that the
//! per-module unit tests don't: dependency-gated firing, schedule
//! persistence across a simulated restart, and the metrics snapshot
//! reflecting live state changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use vmbackup_orchestrator::models::{
    AdvancedScheduleConfig, DependencySpec, ExportFormat, ForecastPoint, GridStatus, JobTemplate,
    RequiredState, ScheduleEntry,
};
use vmbackup_orchestrator::{
    CarbonGateConfig, CarbonProvider, CarbonProviderError, Clock, FakeClock, JobExecutor,
    Orchestrator, SchedulerConfig,
};

struct RecordingExecutor {
    calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl JobExecutor for RecordingExecutor {
    async fn submit_job(&self, def: &JobTemplate) -> Result<String, String> {
        self.calls.lock().unwrap().push(def.id.clone());
        Ok(format!("run-{}", def.id))
    }
}

struct AlwaysCleanProvider;

#[async_trait]
impl CarbonProvider for AlwaysCleanProvider {
    async fn get_current_intensity(&self, _zone: &str) -> Result<f64, CarbonProviderError> {
        Ok(50.0)
    }

    async fn get_forecast(
        &self,
        _zone: &str,
        _hours_ahead: u32,
    ) -> Result<Vec<ForecastPoint>, CarbonProviderError> {
        Ok(vec![])
    }

    async fn get_grid_status(
        &self,
        zone: &str,
        _threshold: f64,
    ) -> Result<GridStatus, CarbonProviderError> {
        Ok(GridStatus {
            current: vmbackup_orchestrator::models::CarbonIntensity {
                zone: zone.to_string(),
                intensity_gco2_per_kwh: 50.0,
                fossil_free_percent: 90.0,
                timestamp: Utc::now(),
                source: "mock".into(),
            },
            optimal_for_backup: true,
            next_optimal_time: None,
            forecast: vec![],
        })
    }
}

fn template(id: &str) -> JobTemplate {
    JobTemplate {
        id: id.to_string(),
        name: id.to_string(),
        vm_id: "vm-1".into(),
        destination: "s3://bucket".into(),
        format: ExportFormat::Qcow2,
        provider: "vsphere".into(),
        credentials: None,
        metadata: HashMap::new(),
    }
}

fn entry(id: &str, schedule: &str) -> ScheduleEntry {
    let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    ScheduleEntry {
        id: id.to_string(),
        name: id.to_string(),
        description: String::new(),
        schedule: schedule.to_string(),
        job_template: template(id),
        enabled: true,
        created_at: now,
        updated_at: now,
        next_run: None,
        last_run: None,
        run_count: 0,
        tags: vec![],
        advanced_config: None,
    }
}

fn build_orchestrator(calls: Arc<Mutex<Vec<String>>>) -> (Orchestrator, Arc<dyn Clock>) {
    let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    ));
    let executor: Arc<dyn JobExecutor> = Arc::new(RecordingExecutor { calls });
    let provider: Arc<dyn CarbonProvider> = Arc::new(AlwaysCleanProvider);
    let orchestrator = Orchestrator::new(
        SchedulerConfig::default(),
        CarbonGateConfig {
            enabled: false,
            ..Default::default()
        },
        executor,
        provider,
        None,
        clock.clone(),
    );
    (orchestrator, clock)
}

/// A schedule with an unmet dependency never reaches the executor; once the
/// dependency is recorded as completed, a fresh trigger goes through.
#[tokio::test]
async fn dependency_gate_blocks_then_admits_after_state_update() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let (orchestrator, _clock) = build_orchestrator(calls.clone());

    let mut gated = entry("nightly-backup", "0 0 * * *");
    gated.advanced_config = Some(AdvancedScheduleConfig {
        depends_on: vec![DependencySpec {
            job_id: "snapshot-job".to_string(),
            required_state: RequiredState::Completed,
            timeout_seconds: 0,
        }],
        ..Default::default()
    });
    orchestrator
        .scheduler
        .add_scheduled_job(gated)
        .await
        .unwrap();

    orchestrator.scheduler.trigger_now("nightly-backup").unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(
        calls.lock().unwrap().is_empty(),
        "executor must not see a submission while the dependency is unmet"
    );

    orchestrator
        .dependencies
        .update_job_state("snapshot-job", RequiredState::Completed, None);

    orchestrator.scheduler.trigger_now("nightly-backup").unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(
        calls.lock().unwrap().len(),
        1,
        "once the dependency is satisfied the next trigger should reach the executor"
    );
}

/// Schedules saved through a `SqliteScheduleStore` survive a fresh
/// `SchedulerCore` built against the same store, mirroring a process restart.
#[cfg(feature = "sqlite-store")]
#[tokio::test]
async fn schedules_persist_across_simulated_restart() {
    use vmbackup_orchestrator::scheduler::SchedulerCore;
    use vmbackup_orchestrator::store::SqliteScheduleStore;
    use vmbackup_orchestrator::{DependencyTracker, RetryManager, ScheduleStore};

    let store: Arc<dyn ScheduleStore> = Arc::new(SqliteScheduleStore::open_in_memory().unwrap());
    let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    ));
    let calls = Arc::new(Mutex::new(Vec::new()));
    let executor: Arc<dyn JobExecutor> = Arc::new(RecordingExecutor { calls });

    let first = SchedulerCore::new(
        SchedulerConfig::default(),
        executor.clone(),
        clock.clone(),
        Some(store.clone()),
        Arc::new(DependencyTracker::new(clock.clone())),
        Arc::new(RetryManager::new(clock.clone())),
    );
    first
        .add_scheduled_job(entry("weekly-archive", "0 3 * * 0"))
        .await
        .unwrap();

    // A brand new SchedulerCore, as if the process had just restarted,
    // sharing only the backing store.
    let second = SchedulerCore::new(
        SchedulerConfig::default(),
        executor,
        clock.clone(),
        Some(store),
        Arc::new(DependencyTracker::new(clock.clone())),
        Arc::new(RetryManager::new(clock)),
    );
    assert!(second.get_schedule("weekly-archive").is_none());
    let (loaded, failed) = second.load_schedules().await.unwrap();
    assert_eq!(loaded, 1);
    assert_eq!(failed, 0);
    assert!(second.get_schedule("weekly-archive").is_some());
}

/// The metrics snapshot tracks schedule-table mutations and queue activity
/// together as the engine actually runs, not just at a single point in time.
#[tokio::test]
async fn metrics_snapshot_tracks_schedule_and_retry_state() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let (orchestrator, clock) = build_orchestrator(calls);

    orchestrator
        .scheduler
        .add_scheduled_job(entry("daily", "0 1 * * *"))
        .await
        .unwrap();
    orchestrator
        .scheduler
        .add_scheduled_job(entry("weekly", "0 2 * * 0"))
        .await
        .unwrap();
    orchestrator.scheduler.disable_scheduled_job("weekly").await.unwrap();

    let snapshot = orchestrator.metrics_snapshot(clock.now());
    assert_eq!(snapshot.scheduler.total_schedules, 2);
    assert_eq!(snapshot.scheduler.enabled_schedules, 1);
    assert_eq!(snapshot.scheduler.disabled_schedules, 1);
    assert_eq!(snapshot.scheduler.bound_schedules, 1);
    assert_eq!(snapshot.retry.in_flight, 0);
    assert_eq!(snapshot.dependencies.tracked_states, 0);
}
