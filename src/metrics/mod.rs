//! Metrics collection and export for the job orchestration engine (§2.4 of
//! SPEC_FULL.md).
//!
//! Supports multiple export backends:
//! - **File**: JSON snapshots written atomically to disk (always available)
//! - **OTLP**: OpenTelemetry Protocol export via gRPC or HTTP (requires the
//!   `metrics-otlp` feature)
//!
//! Multiple backends can run simultaneously via [`CompositeExporter`].
//!
//! The snapshot shape is repointed at the engine's own counters (queue
//! depth, running-slot occupancy, retry attempts in flight, dependency
//! waiters, carbon-gate submission outcomes) rather than at a host's
//! resource usage — there is no metering interface in scope (§1 non-goals)
//! to report CPU/memory against.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub mod file;

#[cfg(feature = "metrics-otlp")]
pub mod otlp;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics export failed: {0}")]
    ExportFailed(String),

    #[error("metrics configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("metrics shutdown failed: {0}")]
    ShutdownFailed(String),
}

// ---------------------------------------------------------------------------
// Configuration types
// ---------------------------------------------------------------------------

/// OTLP transport protocol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtlpProtocol {
    /// gRPC (default port 4317).
    #[default]
    Grpc,
    /// HTTP with protobuf encoding (default port 4318).
    HttpBinary,
    /// HTTP with JSON encoding (default port 4318).
    HttpJson,
}

/// OTLP exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtlpConfig {
    /// OTLP endpoint URL (e.g. `http://localhost:4317` for gRPC).
    pub endpoint: String,

    /// Transport protocol.
    #[serde(default)]
    pub protocol: OtlpProtocol,

    /// Export timeout in seconds.
    #[serde(default = "default_otlp_timeout")]
    pub timeout_seconds: u64,

    /// Additional headers sent with each export request.
    /// Applied to HTTP transport; for gRPC use `OTEL_EXPORTER_OTLP_HEADERS` env var.
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
}

fn default_otlp_timeout() -> u64 {
    10
}

/// File-based metrics exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetricsConfig {
    /// Path to the output JSON file.
    pub path: PathBuf,

    /// Pretty-print JSON output.
    #[serde(default = "default_pretty_print")]
    pub pretty_print: bool,
}

fn default_pretty_print() -> bool {
    true
}

impl Default for FileMetricsConfig {
    fn default() -> Self {
        Self {
            path: std::env::temp_dir().join("vmbackup_orchestrator_metrics.json"),
            pretty_print: true,
        }
    }
}

/// Top-level metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics collection and export.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Export interval in seconds.
    #[serde(default = "default_export_interval")]
    pub export_interval_seconds: u64,

    /// Service name reported to backends.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Service namespace reported to backends.
    #[serde(default = "default_service_namespace")]
    pub service_namespace: String,

    /// OTLP exporter configuration (requires the `metrics-otlp` feature).
    pub otlp: Option<OtlpConfig>,

    /// File exporter configuration.
    pub file: Option<FileMetricsConfig>,
}

fn default_enabled() -> bool {
    true
}

fn default_export_interval() -> u64 {
    60
}

fn default_service_name() -> String {
    "vmbackup-orchestrator".to_string()
}

fn default_service_namespace() -> String {
    "vmbackup".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            export_interval_seconds: 60,
            service_name: default_service_name(),
            service_namespace: default_service_namespace(),
            otlp: None,
            file: Some(FileMetricsConfig::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// Point-in-time snapshot of all engine metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Unix timestamp (seconds) when the snapshot was taken.
    pub timestamp: u64,
    /// Schedule-table metrics (§4.J / §8 invariant 1).
    pub scheduler: SchedulerMetrics,
    /// Priority queue occupancy (§4.E).
    pub queue: QueueMetrics,
    /// Retry manager in-flight bookkeeping (§4.G).
    pub retry: RetryMetrics,
    /// Dependency tracker state (§4.F).
    pub dependencies: DependencyMetrics,
    /// Carbon gate submission outcomes (§4.I).
    pub carbon: CarbonMetrics,
}

/// Schedule-table counters and gauges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    pub total_schedules: usize,
    pub enabled_schedules: usize,
    pub disabled_schedules: usize,
    /// Count currently bound to a live cron entry — independently checks
    /// the §8 invariant 1 `enabled ⇔ bound` relationship.
    pub bound_schedules: usize,
    pub uptime_seconds: u64,
    /// Seconds until the next scheduled fire across all enabled entries,
    /// if any are enabled and armed.
    pub seconds_to_next_run: Option<i64>,
}

/// Priority queue occupancy (§4.E).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub pending: usize,
    pub running: usize,
    pub max_slots: usize,
}

/// Retry manager in-flight bookkeeping (§4.G).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryMetrics {
    pub in_flight: usize,
}

/// Dependency tracker state (§4.F).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencyMetrics {
    pub tracked_states: usize,
    pub waiting: usize,
}

/// Carbon gate submission outcomes (§4.I).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CarbonMetrics {
    pub immediate: u64,
    pub deferred: u64,
    pub fallback: u64,
    pub forwarded_no_window: u64,
}

// ---------------------------------------------------------------------------
// Exporter trait
// ---------------------------------------------------------------------------

/// Trait for metrics export backends.
#[async_trait]
pub trait MetricsExporter: Send + Sync {
    /// Export a metrics snapshot to the backend.
    async fn export(&self, snapshot: &MetricsSnapshot) -> Result<(), MetricsError>;

    /// Flush pending data and release resources.
    async fn shutdown(&self) -> Result<(), MetricsError>;
}

// ---------------------------------------------------------------------------
// Composite exporter
// ---------------------------------------------------------------------------

/// Combines multiple exporters into a single exporter.
///
/// All backends are called on every export; individual failures are logged
/// but do not prevent other backends from running.
pub struct CompositeExporter {
    exporters: Vec<Arc<dyn MetricsExporter>>,
}

impl CompositeExporter {
    pub fn new(exporters: Vec<Arc<dyn MetricsExporter>>) -> Self {
        Self { exporters }
    }
}

#[async_trait]
impl MetricsExporter for CompositeExporter {
    async fn export(&self, snapshot: &MetricsSnapshot) -> Result<(), MetricsError> {
        let mut last_error: Option<MetricsError> = None;
        for exporter in &self.exporters {
            if let Err(e) = exporter.export(snapshot).await {
                tracing::warn!("metrics exporter failed: {e}");
                last_error = Some(e);
            }
        }
        if self.exporters.len() == 1 {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), MetricsError> {
        let mut last_error: Option<MetricsError> = None;
        for exporter in &self.exporters {
            if let Err(e) = exporter.shutdown().await {
                tracing::warn!("metrics exporter shutdown failed: {e}");
                last_error = Some(e);
            }
        }
        if self.exporters.len() == 1 {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build an exporter (or composite) from configuration.
pub fn create_exporter(config: &MetricsConfig) -> Result<Arc<dyn MetricsExporter>, MetricsError> {
    let mut exporters: Vec<Arc<dyn MetricsExporter>> = Vec::new();

    // File exporter (always available).
    if let Some(ref file_cfg) = config.file {
        let file_exporter = file::FileExporter::new(file_cfg.clone())?;
        exporters.push(Arc::new(file_exporter));
    }

    // OTLP exporter (requires the `metrics-otlp` feature).
    #[cfg(feature = "metrics-otlp")]
    if let Some(ref otlp_cfg) = config.otlp {
        let export_interval = std::time::Duration::from_secs(config.export_interval_seconds);
        let otlp_exporter = otlp::OtlpExporter::new(
            otlp_cfg.clone(),
            &config.service_name,
            &config.service_namespace,
            export_interval,
        )?;
        exporters.push(Arc::new(otlp_exporter));
    }

    #[cfg(not(feature = "metrics-otlp"))]
    if config.otlp.is_some() {
        tracing::warn!(
            "OTLP metrics configuration provided but the `metrics-otlp` feature is not enabled; \
             OTLP exporter will not be created"
        );
    }

    if exporters.is_empty() {
        return Err(MetricsError::ConfigError(
            "no metrics exporters configured (enable at least `file` or `otlp`)".to_string(),
        ));
    }

    if exporters.len() == 1 {
        Ok(exporters.remove(0))
    } else {
        Ok(Arc::new(CompositeExporter::new(exporters)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
