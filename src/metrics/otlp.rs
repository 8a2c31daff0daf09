//! OpenTelemetry OTLP metrics exporter.
//!
//! Records engine metrics as OpenTelemetry gauge instruments and exports
//! them via gRPC or HTTP to any OTLP-compatible collector (e.g. Prometheus,
//! Grafana Alloy, Datadog, New Relic).

use super::{MetricsError, MetricsExporter, MetricsSnapshot, OtlpConfig, OtlpProtocol};
use async_trait::async_trait;
use opentelemetry::metrics::{Gauge, MeterProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use std::time::Duration;

/// Holds all OpenTelemetry gauge instruments.
struct Instruments {
    // Scheduler / schedule table
    total_schedules: Gauge<f64>,
    enabled_schedules: Gauge<f64>,
    disabled_schedules: Gauge<f64>,
    bound_schedules: Gauge<f64>,
    uptime_seconds: Gauge<f64>,
    // Priority queue
    queue_pending: Gauge<f64>,
    queue_running: Gauge<f64>,
    queue_max_slots: Gauge<f64>,
    // Retry manager
    retry_in_flight: Gauge<f64>,
    // Dependency tracker
    dependencies_tracked: Gauge<f64>,
    dependencies_waiting: Gauge<f64>,
    // Carbon gate
    carbon_immediate: Gauge<f64>,
    carbon_deferred: Gauge<f64>,
    carbon_fallback: Gauge<f64>,
    carbon_forwarded_no_window: Gauge<f64>,
}

/// Exports metrics via OpenTelemetry OTLP protocol.
pub struct OtlpExporter {
    provider: SdkMeterProvider,
    instruments: Instruments,
}

impl OtlpExporter {
    /// Create a new OTLP exporter from configuration.
    pub fn new(
        config: OtlpConfig,
        service_name: &str,
        service_namespace: &str,
        export_interval: Duration,
    ) -> Result<Self, MetricsError> {
        use opentelemetry::KeyValue;
        use opentelemetry_otlp::MetricExporter;
        use opentelemetry_sdk::metrics::PeriodicReader;
        use opentelemetry_sdk::Resource;

        let timeout = Duration::from_secs(config.timeout_seconds);

        let metric_exporter = match config.protocol {
            OtlpProtocol::Grpc => MetricExporter::builder()
                .with_tonic()
                .with_endpoint(&config.endpoint)
                .with_timeout(timeout)
                .build()
                .map_err(|e| {
                    MetricsError::ConfigError(format!("failed to build gRPC OTLP exporter: {e}"))
                })?,
            OtlpProtocol::HttpBinary | OtlpProtocol::HttpJson => MetricExporter::builder()
                .with_http()
                .with_endpoint(&config.endpoint)
                .with_timeout(timeout)
                .build()
                .map_err(|e| {
                    MetricsError::ConfigError(format!("failed to build HTTP OTLP exporter: {e}"))
                })?,
        };

        let reader = PeriodicReader::builder(metric_exporter)
            .with_interval(export_interval)
            .build();

        let resource = Resource::builder()
            .with_service_name(service_name.to_string())
            .with_attribute(KeyValue::new(
                "service.namespace",
                service_namespace.to_string(),
            ))
            .build();

        let provider = SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(resource)
            .build();

        let meter = provider.meter("vmbackup_orchestrator.engine");

        let instruments = Instruments {
            total_schedules: meter
                .f64_gauge("scheduler.total_schedules")
                .with_description("Total number of schedule entries in the table")
                .build(),
            enabled_schedules: meter
                .f64_gauge("scheduler.enabled_schedules")
                .with_description("Number of enabled schedule entries")
                .build(),
            disabled_schedules: meter
                .f64_gauge("scheduler.disabled_schedules")
                .with_description("Number of disabled schedule entries")
                .build(),
            bound_schedules: meter
                .f64_gauge("scheduler.bound_schedules")
                .with_description("Number of schedules currently bound to a live cron entry")
                .build(),
            uptime_seconds: meter
                .f64_gauge("scheduler.uptime_seconds")
                .with_description("Engine uptime in seconds")
                .build(),
            queue_pending: meter
                .f64_gauge("queue.pending")
                .with_description("Pending runs waiting for a free slot")
                .build(),
            queue_running: meter
                .f64_gauge("queue.running")
                .with_description("Runs currently occupying a concurrency slot")
                .build(),
            queue_max_slots: meter
                .f64_gauge("queue.max_slots")
                .with_description("Configured concurrency cap")
                .build(),
            retry_in_flight: meter
                .f64_gauge("retry.in_flight")
                .with_description("Job IDs with an outstanding retry timer")
                .build(),
            dependencies_tracked: meter
                .f64_gauge("dependencies.tracked_states")
                .with_description("Job IDs with a recorded dependency state")
                .build(),
            dependencies_waiting: meter
                .f64_gauge("dependencies.waiting")
                .with_description("Waiters currently blocked on WaitForDependencies")
                .build(),
            carbon_immediate: meter
                .f64_gauge("carbon.immediate")
                .with_description("Carbon-aware submissions forwarded immediately")
                .build(),
            carbon_deferred: meter
                .f64_gauge("carbon.deferred")
                .with_description("Carbon-aware submissions deferred to an optimal window")
                .build(),
            carbon_fallback: meter
                .f64_gauge("carbon.fallback")
                .with_description("Carbon-aware submissions that fell back on a provider error")
                .build(),
            carbon_forwarded_no_window: meter
                .f64_gauge("carbon.forwarded_no_window")
                .with_description("Submissions forwarded immediately for lack of an acceptable window")
                .build(),
        };

        tracing::info!(
            endpoint = %config.endpoint,
            protocol = ?config.protocol,
            "OTLP metrics exporter initialized"
        );

        Ok(Self {
            provider,
            instruments,
        })
    }
}

#[async_trait]
impl MetricsExporter for OtlpExporter {
    async fn export(&self, snapshot: &MetricsSnapshot) -> Result<(), MetricsError> {
        let i = &self.instruments;

        i.total_schedules
            .record(snapshot.scheduler.total_schedules as f64, &[]);
        i.enabled_schedules
            .record(snapshot.scheduler.enabled_schedules as f64, &[]);
        i.disabled_schedules
            .record(snapshot.scheduler.disabled_schedules as f64, &[]);
        i.bound_schedules
            .record(snapshot.scheduler.bound_schedules as f64, &[]);
        i.uptime_seconds
            .record(snapshot.scheduler.uptime_seconds as f64, &[]);

        i.queue_pending.record(snapshot.queue.pending as f64, &[]);
        i.queue_running.record(snapshot.queue.running as f64, &[]);
        i.queue_max_slots
            .record(snapshot.queue.max_slots as f64, &[]);

        i.retry_in_flight
            .record(snapshot.retry.in_flight as f64, &[]);

        i.dependencies_tracked
            .record(snapshot.dependencies.tracked_states as f64, &[]);
        i.dependencies_waiting
            .record(snapshot.dependencies.waiting as f64, &[]);

        i.carbon_immediate
            .record(snapshot.carbon.immediate as f64, &[]);
        i.carbon_deferred
            .record(snapshot.carbon.deferred as f64, &[]);
        i.carbon_fallback
            .record(snapshot.carbon.fallback as f64, &[]);
        i.carbon_forwarded_no_window
            .record(snapshot.carbon.forwarded_no_window as f64, &[]);

        tracing::trace!("recorded metrics snapshot to OTLP gauges");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), MetricsError> {
        self.provider
            .shutdown()
            .map_err(|e| MetricsError::ShutdownFailed(format!("OTLP meter provider shutdown failed: {e}")))
    }
}
