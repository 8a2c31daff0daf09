//! External interfaces the core consumes (§6): persistent store, executor
//! adapter, carbon provider, and notifier callbacks. Implementations of
//! these traits live outside this crate's scope (§1 non-goals) — adapters
//! for vSphere/AWS/Azure/GCP/Hyper-V, the carbon-intensity data source,
//! webhook/metrics sinks.

use async_trait::async_trait;

use crate::error::{CarbonProviderError, StoreError};
use crate::models::{GridStatus, JobTemplate, ScheduleEntry};

/// `JobExecutor` (§4.K / §6.2): the only path from the scheduler to
/// provider adapters. The scheduler never waits on completion; progress is
/// reported back through `DependencyTracker::update_job_state` by whatever
/// drives provider progress (outside this crate's core).
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn submit_job(&self, def: &JobTemplate) -> Result<String, String>;
}

/// `ScheduleStore` (§4.C / §6.1): persistent CRUD for schedules. The engine
/// is authoritative in-memory; store errors are logged and swallowed by the
/// caller (§7 Persistence) — never block or fail the originating call.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn save_schedule(&self, entry: &ScheduleEntry) -> Result<(), StoreError>;
    async fn update_schedule(&self, entry: &ScheduleEntry) -> Result<(), StoreError>;
    async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleEntry>, StoreError>;
    async fn list_schedules(&self, enabled_only: bool) -> Result<Vec<ScheduleEntry>, StoreError>;
    async fn delete_schedule(&self, id: &str) -> Result<(), StoreError>;
}

/// `CarbonProvider` (§4.I / §6.3): the external carbon-intensity data
/// source. Only the interface is in scope; the data source itself is a
/// non-goal (§1).
#[async_trait]
pub trait CarbonProvider: Send + Sync {
    async fn get_current_intensity(&self, zone: &str) -> Result<f64, CarbonProviderError>;
    async fn get_forecast(
        &self,
        zone: &str,
        hours_ahead: u32,
    ) -> Result<Vec<crate::models::ForecastPoint>, CarbonProviderError>;
    async fn get_grid_status(
        &self,
        zone: &str,
        threshold_gco2_per_kwh: f64,
    ) -> Result<GridStatus, CarbonProviderError>;
}

/// `RetryNotifier` (§4.L): fired asynchronously when a retry is scheduled.
/// Must not block the scheduler (§5).
pub trait RetryNotifier: Send + Sync {
    fn notify_retry(
        &self,
        job_id: &str,
        name: &str,
        attempt: u32,
        max_attempts: u32,
        next_retry: chrono::DateTime<chrono::Utc>,
    );
}
