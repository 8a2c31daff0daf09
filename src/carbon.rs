//! Carbon Gate / `CarbonAwareScheduler` (§4.I).
//!
//! Wraps a [`JobExecutor`] and, for jobs opted into `carbon_aware`
//! metadata, defers or enriches the submission based on grid carbon
//! intensity reported by a [`CarbonProvider`].

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::models::{CarbonIntensity, GridStatus, JobTemplate, MetaValue};
use crate::traits::{CarbonProvider, JobExecutor};

/// Assumed energy draw per gigabyte transferred, for the auxiliary
/// reporting helpers. This is a documented estimate (no metering interface
/// is in scope per §1) rather than a measured value.
const ENERGY_KWH_PER_GB: f64 = 0.06;

/// Per-job and global defaults for the carbon gate (§4.I step 2).
#[derive(Debug, Clone)]
pub struct CarbonGateConfig {
    /// Globally disables the gate; when `false`, every submission passes
    /// straight through to the wrapped executor regardless of metadata.
    pub enabled: bool,
    pub default_max_intensity_gco2_per_kwh: f64,
    pub default_max_delay: Duration,
    pub default_zone: String,
    pub fallback_on_error: bool,
}

impl Default for CarbonGateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_max_intensity_gco2_per_kwh: 200.0,
            default_max_delay: Duration::from_secs(4 * 3600),
            default_zone: "US-CAL-CISO".to_string(),
            fallback_on_error: true,
        }
    }
}

/// Submission-outcome counters, surfaced through the metrics snapshot.
#[derive(Debug, Default)]
pub struct CarbonGateMetrics {
    pub immediate: AtomicU64,
    pub deferred: AtomicU64,
    pub fallback: AtomicU64,
    pub forwarded_no_window: AtomicU64,
}

impl CarbonGateMetrics {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.immediate.load(Ordering::Relaxed),
            self.deferred.load(Ordering::Relaxed),
            self.fallback.load(Ordering::Relaxed),
            self.forwarded_no_window.load(Ordering::Relaxed),
        )
    }
}

/// Wraps an executor with carbon-aware admission/deferral (§4.I).
pub struct CarbonAwareScheduler {
    inner: Arc<dyn JobExecutor>,
    provider: Arc<dyn CarbonProvider>,
    config: CarbonGateConfig,
    clock: Arc<dyn Clock>,
    pub metrics: Arc<CarbonGateMetrics>,
}

impl CarbonAwareScheduler {
    pub fn new(
        inner: Arc<dyn JobExecutor>,
        provider: Arc<dyn CarbonProvider>,
        config: CarbonGateConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner,
            provider,
            config,
            clock,
            metrics: Arc::new(CarbonGateMetrics::default()),
        }
    }

    fn effective_settings(&self, def: &JobTemplate) -> (f64, Duration, String) {
        let max_intensity = def
            .metadata_f64("carbon_max_intensity")
            .unwrap_or(self.config.default_max_intensity_gco2_per_kwh);
        let max_delay = def
            .metadata_f64("carbon_max_delay")
            .map(|nanos| Duration::from_nanos(nanos.max(0.0) as u64))
            .unwrap_or(self.config.default_max_delay);
        let zone = def
            .metadata_str("carbon_zone")
            .map(String::from)
            .unwrap_or_else(|| self.config.default_zone.clone());
        (max_intensity, max_delay, zone)
    }

    /// Auxiliary query (§4.I): current grid status for `zone` at `threshold`.
    pub async fn get_carbon_status(
        &self,
        zone: &str,
        threshold: f64,
    ) -> Result<GridStatus, crate::error::CarbonProviderError> {
        self.provider.get_grid_status(zone, threshold).await
    }

    /// Auxiliary query (§4.I): estimate energy/emissions for a completed or
    /// planned job, using the current intensity reading as the
    /// representative value for `[start, end)` (no historical intensity
    /// query is in scope — §1 non-goals).
    pub async fn generate_carbon_report(
        &self,
        job_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        data_gb: f64,
        zone: &str,
    ) -> Result<CarbonReport, crate::error::CarbonProviderError> {
        let intensity = self.provider.get_current_intensity(zone).await?;
        let energy_kwh = data_gb * ENERGY_KWH_PER_GB;
        let emissions_kg = energy_kwh * intensity / 1000.0;
        Ok(CarbonReport {
            job_id: job_id.to_string(),
            zone: zone.to_string(),
            start,
            end,
            energy_kwh,
            emissions_kg,
            intensity_gco2_per_kwh: intensity,
        })
    }

    /// Auxiliary query (§4.I): current vs. best-forecast emissions for a
    /// hypothetical transfer of `data_gb` over `duration_h` hours.
    pub async fn estimate_carbon_savings(
        &self,
        zone: &str,
        data_gb: f64,
        duration_h: f64,
    ) -> Result<CarbonSavingsEstimate, crate::error::CarbonProviderError> {
        let current = self.provider.get_current_intensity(zone).await?;
        let forecast = self.provider.get_forecast(zone, duration_h.ceil().max(1.0) as u32).await?;
        let best = forecast
            .iter()
            .map(|f| f.intensity_gco2_per_kwh)
            .fold(current, f64::min);

        let energy_kwh = data_gb * ENERGY_KWH_PER_GB;
        let current_emissions_kg = energy_kwh * current / 1000.0;
        let best_emissions_kg = energy_kwh * best / 1000.0;
        let savings_kg = (current_emissions_kg - best_emissions_kg).max(0.0);
        let savings_percent = if current_emissions_kg > 0.0 {
            (savings_kg / current_emissions_kg) * 100.0
        } else {
            0.0
        };

        let recommendation = if savings_percent > 20.0 {
            "Defer this job to the forecasted low-carbon window for significant savings.".to_string()
        } else if savings_percent > 0.0 {
            "Modest savings available by deferring; proceed now if urgency outweighs savings.".to_string()
        } else {
            "Grid is already near its cleanest; no benefit to deferring.".to_string()
        };

        Ok(CarbonSavingsEstimate {
            current_emissions_kg,
            best_emissions_kg,
            savings_kg,
            savings_percent,
            recommendation,
        })
    }
}

#[async_trait]
impl JobExecutor for CarbonAwareScheduler {
    async fn submit_job(&self, def: &JobTemplate) -> Result<String, String> {
        // Step 1: globally disabled or not opted-in -> forward unchanged.
        if !self.config.enabled || def.metadata_bool("carbon_aware") != Some(true) {
            return self.inner.submit_job(def).await;
        }

        // Step 2: effective settings (per-job overrides or config defaults).
        let (max_intensity, max_delay, zone) = self.effective_settings(def);

        // Step 3: query grid status.
        let status = match self.provider.get_grid_status(&zone, max_intensity).await {
            Ok(status) => status,
            Err(e) => {
                if self.config.fallback_on_error {
                    self.metrics.fallback.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(zone, error = %e, "carbon provider error; falling back to direct submission");
                    return self.inner.submit_job(def).await;
                }
                return Err(format!("carbon provider error: {e}"));
            }
        };

        // Step 4: grid is clean now -> submit immediately, enriched.
        if status.optimal_for_backup {
            self.metrics.immediate.fetch_add(1, Ordering::Relaxed);
            let enriched = enrich_immediate(def, &status, &zone);
            return self.inner.submit_job(&enriched).await;
        }

        // Step 5: an optimal window arrives within maxDelay -> defer.
        if let Some(next_optimal) = status.next_optimal_time {
            let delay = next_optimal - self.clock.now();
            let max_delay_chrono =
                ChronoDuration::from_std(max_delay).unwrap_or(ChronoDuration::hours(24 * 365));
            if delay > ChronoDuration::zero() && delay <= max_delay_chrono {
                self.metrics.deferred.fetch_add(1, Ordering::Relaxed);
                let id = format!(
                    "carbon-delayed-{}",
                    self.clock.now().timestamp_nanos_opt().unwrap_or_default()
                );

                let inner = self.inner.clone();
                let provider = self.provider.clone();
                let def_owned = def.clone();
                let zone_owned = zone.clone();
                let sleep_for = delay.to_std().unwrap_or(Duration::ZERO);

                tokio::spawn(async move {
                    tokio::time::sleep(sleep_for).await;
                    let submit_intensity = provider.get_current_intensity(&zone_owned).await.ok();
                    let enriched =
                        enrich_delayed(&def_owned, next_optimal, submit_intensity, delay);
                    if let Err(e) = inner.submit_job(&enriched).await {
                        tracing::warn!(error = %e, "carbon-delayed submission failed");
                    }
                });

                return Ok(id);
            }
        }

        // Step 6: no acceptable optimal time -> submit now with a warning.
        self.metrics.forwarded_no_window.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(zone, "no acceptable low-carbon window within max_delay; submitting now");
        let enriched = enrich_immediate(def, &status, &zone);
        self.inner.submit_job(&enriched).await
    }
}

fn enrich_immediate(def: &JobTemplate, status: &GridStatus, zone: &str) -> JobTemplate {
    let mut enriched = def.clone();
    enriched.metadata.insert(
        "carbon_intensity_at_submit".to_string(),
        MetaValue::Number(status.current.intensity_gco2_per_kwh),
    );
    enriched.metadata.insert(
        "carbon_renewable_percent".to_string(),
        MetaValue::Number(status.current.fossil_free_percent),
    );
    enriched
        .metadata
        .insert("carbon_zone".to_string(), MetaValue::Text(zone.to_string()));
    enriched.metadata.insert(
        "carbon_timestamp".to_string(),
        MetaValue::Text(status.current.timestamp.to_rfc3339()),
    );
    enriched
}

fn enrich_delayed(
    def: &JobTemplate,
    optimal_time: DateTime<Utc>,
    submit_intensity: Option<f64>,
    delay: ChronoDuration,
) -> JobTemplate {
    let mut enriched = def.clone();
    enriched
        .metadata
        .insert("carbon_delayed".to_string(), MetaValue::Bool(true));
    enriched.metadata.insert(
        "carbon_optimal_time".to_string(),
        MetaValue::Text(optimal_time.to_rfc3339()),
    );
    if let Some(intensity) = submit_intensity {
        enriched.metadata.insert(
            "carbon_submit_intensity".to_string(),
            MetaValue::Number(intensity),
        );
    }
    enriched.metadata.insert(
        "carbon_delay_duration".to_string(),
        MetaValue::Number(delay.num_seconds() as f64),
    );
    enriched
}

#[derive(Debug, Clone)]
pub struct CarbonReport {
    pub job_id: String,
    pub zone: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub energy_kwh: f64,
    pub emissions_kg: f64,
    pub intensity_gco2_per_kwh: f64,
}

#[derive(Debug, Clone)]
pub struct CarbonSavingsEstimate {
    pub current_emissions_kg: f64,
    pub best_emissions_kg: f64,
    pub savings_kg: f64,
    pub savings_percent: f64,
    pub recommendation: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::error::CarbonProviderError;
    use crate::models::{ExportFormat, ForecastPoint};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct RecordingExecutor {
        calls: Arc<Mutex<Vec<JobTemplate>>>,
    }

    #[async_trait]
    impl JobExecutor for RecordingExecutor {
        async fn submit_job(&self, def: &JobTemplate) -> Result<String, String> {
            self.calls.lock().unwrap().push(def.clone());
            Ok(format!("direct-{}", def.id))
        }
    }

    struct MockProvider {
        current: f64,
        optimal: bool,
        next_optimal_in: Option<chrono::Duration>,
        fail: bool,
    }

    #[async_trait]
    impl CarbonProvider for MockProvider {
        async fn get_current_intensity(&self, _zone: &str) -> Result<f64, CarbonProviderError> {
            if self.fail {
                return Err(CarbonProviderError::UnknownZone("bad".into()));
            }
            Ok(self.current)
        }

        async fn get_forecast(
            &self,
            _zone: &str,
            _hours_ahead: u32,
        ) -> Result<Vec<ForecastPoint>, CarbonProviderError> {
            Ok(vec![ForecastPoint {
                timestamp: Utc::now(),
                intensity_gco2_per_kwh: self.current / 2.0,
            }])
        }

        async fn get_grid_status(
            &self,
            zone: &str,
            _threshold: f64,
        ) -> Result<GridStatus, CarbonProviderError> {
            if self.fail {
                return Err(CarbonProviderError::UnknownZone(zone.to_string()));
            }
            Ok(GridStatus {
                current: CarbonIntensity {
                    zone: zone.to_string(),
                    intensity_gco2_per_kwh: self.current,
                    fossil_free_percent: 60.0,
                    timestamp: Utc::now(),
                    source: "mock".into(),
                },
                optimal_for_backup: self.optimal,
                next_optimal_time: self.next_optimal_in.map(|d| Utc::now() + d),
                forecast: vec![],
            })
        }
    }

    fn template(carbon_aware: bool) -> JobTemplate {
        let mut metadata = HashMap::new();
        if carbon_aware {
            metadata.insert("carbon_aware".to_string(), MetaValue::Bool(true));
        }
        JobTemplate {
            id: "job-1".into(),
            name: "job-1".into(),
            vm_id: "vm-1".into(),
            destination: "s3://bucket".into(),
            format: ExportFormat::Qcow2,
            provider: "vsphere".into(),
            credentials: None,
            metadata,
        }
    }

    fn gate(provider: MockProvider, config: CarbonGateConfig) -> (CarbonAwareScheduler, Arc<Mutex<Vec<JobTemplate>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let executor = Arc::new(RecordingExecutor { calls: calls.clone() });
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        (
            CarbonAwareScheduler::new(executor, Arc::new(provider), config, clock),
            calls,
        )
    }

    /// S6: globally disabled; executor sees exactly one submission, no delay.
    #[tokio::test]
    async fn s6_globally_disabled_passes_through() {
        let (gate, calls) = gate(
            MockProvider { current: 999.0, optimal: false, next_optimal_in: None, fail: false },
            CarbonGateConfig { enabled: false, ..Default::default() },
        );
        let id = gate.submit_job(&template(true)).await.unwrap();
        assert!(!id.starts_with("carbon-delayed-"));
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    /// S7: clean grid -> immediate submission with enriched metadata.
    #[tokio::test]
    async fn s7_clean_grid_submits_immediately_enriched() {
        let (gate, calls) = gate(
            MockProvider { current: 100.0, optimal: true, next_optimal_in: None, fail: false },
            CarbonGateConfig::default(),
        );
        gate.submit_job(&template(true)).await.unwrap();
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].metadata.contains_key("carbon_intensity_at_submit"));
    }

    /// S8: dirty grid, acceptable delay -> deferred; 0 synchronous
    /// submissions; ID begins with carbon-delayed-.
    #[tokio::test]
    async fn s8_dirty_grid_with_acceptable_delay_defers() {
        let (gate, calls) = gate(
            MockProvider {
                current: 900.0,
                optimal: false,
                next_optimal_in: Some(chrono::Duration::minutes(10)),
                fail: false,
            },
            CarbonGateConfig::default(),
        );
        let id = gate.submit_job(&template(true)).await.unwrap();
        assert!(id.starts_with("carbon-delayed-"));
        assert_eq!(calls.lock().unwrap().len(), 0);
    }

    /// S9: fallback on provider error for an invalid zone -> one submission.
    #[tokio::test]
    async fn s9_fallback_on_provider_error() {
        let (gate, calls) = gate(
            MockProvider { current: 0.0, optimal: false, next_optimal_in: None, fail: true },
            CarbonGateConfig { fallback_on_error: true, ..Default::default() },
        );
        let mut tmpl = template(true);
        tmpl.metadata
            .insert("carbon_zone".to_string(), MetaValue::Text("INVALID-ZONE".into()));
        gate.submit_job(&tmpl).await.unwrap();
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn not_opted_in_bypasses_gate_entirely() {
        let (gate, calls) = gate(
            MockProvider { current: 900.0, optimal: false, next_optimal_in: None, fail: false },
            CarbonGateConfig::default(),
        );
        gate.submit_job(&template(false)).await.unwrap();
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_acceptable_window_submits_now_with_enrichment() {
        let (gate, calls) = gate(
            MockProvider {
                current: 900.0,
                optimal: false,
                next_optimal_in: Some(chrono::Duration::hours(48)),
                fail: false,
            },
            CarbonGateConfig::default(),
        );
        gate.submit_job(&template(true)).await.unwrap();
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].metadata.contains_key("carbon_intensity_at_submit"));
    }
}
