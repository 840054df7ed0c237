//! OpenTelemetry integration for activity-sync
//!
//! This module provides observability through OpenTelemetry, including
//! tracing and sync metrics exported to OTLP endpoints, plus the local
//! structured log output.

use crate::config::OtelConfig;
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter, MeterProvider as _},
    trace::TracerProvider as TracerProviderTrait,
    KeyValue,
};
use opentelemetry_sdk::{metrics::SdkMeterProvider, trace::TracerProvider, Resource};
use std::time::Duration;
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// OpenTelemetry error types
#[derive(Debug, Error)]
pub enum OtelError {
    /// Failed to initialize tracer
    #[error("Failed to initialize tracer: {0}")]
    TracerInit(String),

    /// Failed to initialize meter
    #[error("Failed to initialize meter: {0}")]
    MeterInit(String),

    /// Failed to shutdown
    #[error("Failed to shutdown: {0}")]
    Shutdown(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// OpenTelemetry provider for activity-sync
///
/// Manages tracing and metrics providers with OTLP export capability.
pub struct OtelProvider {
    tracer_provider: Option<TracerProvider>,
    meter_provider: SdkMeterProvider,
    config: OtelConfig,
}

impl OtelProvider {
    /// Create a new OtelProvider with the given configuration
    pub fn new(config: &OtelConfig) -> Result<Self, OtelError> {
        let resource = Resource::new(vec![KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]);

        let (tracer_provider, meter_provider) = if config.enabled {
            let endpoint = config.endpoint.as_ref().ok_or_else(|| {
                OtelError::Config("OTLP endpoint is required when enabled".into())
            })?;

            let tracer_provider = Self::init_tracer_provider(endpoint, &resource)?;
            let meter_provider = Self::init_meter_provider(endpoint, &resource)?;

            (Some(tracer_provider), meter_provider)
        } else {
            // No reader attached, instruments record into nothing
            let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
            (None, meter_provider)
        };

        if let Some(ref tp) = tracer_provider {
            global::set_tracer_provider(tp.clone());
        }

        Ok(Self {
            tracer_provider,
            meter_provider,
            config: config.clone(),
        })
    }

    fn init_tracer_provider(
        endpoint: &str,
        resource: &Resource,
    ) -> Result<TracerProvider, OtelError> {
        use opentelemetry_otlp::WithExportConfig;
        use opentelemetry_sdk::runtime;
        use opentelemetry_sdk::trace::{Config, Sampler};

        let exporter = opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(endpoint)
            .build_span_exporter()
            .map_err(|e| OtelError::TracerInit(e.to_string()))?;

        let trace_config = Config::default()
            .with_sampler(Sampler::AlwaysOn)
            .with_resource(resource.clone());

        Ok(TracerProvider::builder()
            .with_batch_exporter(exporter, runtime::Tokio)
            .with_config(trace_config)
            .build())
    }

    fn init_meter_provider(
        endpoint: &str,
        resource: &Resource,
    ) -> Result<SdkMeterProvider, OtelError> {
        use opentelemetry_otlp::{MetricsExporterBuilder, WithExportConfig};
        use opentelemetry_sdk::metrics::reader::{
            DefaultAggregationSelector, DefaultTemporalitySelector,
        };
        use opentelemetry_sdk::{metrics::PeriodicReader, runtime};

        let exporter = MetricsExporterBuilder::from(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .build_metrics_exporter(
            Box::new(DefaultTemporalitySelector::new()),
            Box::new(DefaultAggregationSelector::new()),
        )
        .map_err(|e| OtelError::MeterInit(e.to_string()))?;

        let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();

        Ok(SdkMeterProvider::builder()
            .with_resource(resource.clone())
            .with_reader(reader)
            .build())
    }

    /// Get a tracer from the provider
    pub fn tracer(&self, name: &'static str) -> opentelemetry_sdk::trace::Tracer {
        match self.tracer_provider {
            Some(ref tp) => tp.tracer(name),
            None => TracerProvider::builder().build().tracer(name),
        }
    }

    /// Get the meter for creating metrics
    pub fn meter(&self) -> Meter {
        self.meter_provider.meter(self.config.service_name.clone())
    }

    /// Check if OpenTelemetry is enabled
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Shutdown the OpenTelemetry providers gracefully
    pub fn shutdown(&self) -> Result<(), OtelError> {
        if let Err(e) = self.meter_provider.shutdown() {
            return Err(OtelError::Shutdown(format!(
                "Meter shutdown failed: {:?}",
                e
            )));
        }

        if let Some(ref tp) = self.tracer_provider {
            for result in tp.force_flush() {
                if let Err(e) = result {
                    return Err(OtelError::Shutdown(format!("Tracer flush failed: {:?}", e)));
                }
            }
        }

        Ok(())
    }
}

impl Drop for OtelProvider {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Metrics emitted by the sync pipeline
#[derive(Clone)]
pub struct SyncMetrics {
    /// Upstream requests by status code
    pub requests_total: Counter<u64>,

    /// Activities written to the database
    pub records_upserted_total: Counter<u64>,

    /// Activities that failed to persist and were skipped
    pub record_persist_failures_total: Counter<u64>,

    /// Activities whose zones were stored
    pub enrichment_synced_total: Counter<u64>,

    /// 429 responses received
    pub rate_limited_total: Counter<u64>,

    /// Retries scheduled by the request loop
    pub request_retries_total: Counter<u64>,

    /// Upstream request duration in seconds
    pub request_duration: Histogram<f64>,
}

impl SyncMetrics {
    /// Create new metrics with the given meter
    pub fn new(meter: &Meter) -> Self {
        let requests_total = meter
            .u64_counter("activity_sync_requests_total")
            .with_description("Upstream requests by status code")
            .init();

        let records_upserted_total = meter
            .u64_counter("activity_sync_records_upserted_total")
            .with_description("Activities written to the database")
            .init();

        let record_persist_failures_total = meter
            .u64_counter("activity_sync_record_persist_failures_total")
            .with_description("Activities that failed to persist")
            .init();

        let enrichment_synced_total = meter
            .u64_counter("activity_sync_enrichment_synced_total")
            .with_description("Activities whose zone data was stored")
            .init();

        let rate_limited_total = meter
            .u64_counter("activity_sync_rate_limited_total")
            .with_description("Rate limited responses received")
            .init();

        let request_retries_total = meter
            .u64_counter("activity_sync_request_retries_total")
            .with_description("Request retries scheduled")
            .init();

        let request_duration = meter
            .f64_histogram("activity_sync_request_duration_seconds")
            .with_description("Upstream request duration in seconds")
            .init();

        Self {
            requests_total,
            records_upserted_total,
            record_persist_failures_total,
            enrichment_synced_total,
            rate_limited_total,
            request_retries_total,
            request_duration,
        }
    }

    /// Record a completed upstream request
    pub fn record_request(&self, elapsed: Duration, status: u16) {
        let attrs = [KeyValue::new("status", i64::from(status))];
        self.requests_total.add(1, &attrs);
        self.request_duration.record(elapsed.as_secs_f64(), &attrs);
    }

    pub fn record_retry(&self) {
        self.request_retries_total.add(1, &[]);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited_total.add(1, &[]);
    }

    pub fn record_upserted(&self, count: u64) {
        self.records_upserted_total.add(count, &[]);
    }

    pub fn record_persist_failure(&self) {
        self.record_persist_failures_total.add(1, &[]);
    }

    pub fn record_enrichment_synced(&self) {
        self.enrichment_synced_total.add(1, &[]);
    }
}

/// Pick the effective log level
///
/// `-v` forces debug and `-vv` forces trace; otherwise the configured level applies.
pub fn effective_log_level(configured: &str, verbosity: u8) -> Level {
    match verbosity {
        0 => parse_level(configured),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn parse_level(log_level: &str) -> Level {
    match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize tracing subscriber with OpenTelemetry integration
///
/// `format` selects `json` (default) or `pretty` console output. Directives in
/// `RUST_LOG` are layered over `level`.
pub fn init_tracing(otel: &OtelProvider, level: Level, format: &str) -> Result<(), OtelError> {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::from_level(level).into())
        .from_env_lossy();

    let json = !format.eq_ignore_ascii_case("pretty");
    let json_layer = json.then(|| tracing_subscriber::fmt::layer().json());
    let pretty_layer = (!json).then(|| tracing_subscriber::fmt::layer());

    let otel_layer = otel
        .is_enabled()
        .then(|| tracing_opentelemetry::layer().with_tracer(otel.tracer("activity-sync")));

    tracing_subscriber::registry()
        .with(filter)
        .with(otel_layer)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
        .map_err(|e| OtelError::TracerInit(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled_config() -> OtelConfig {
        OtelConfig {
            enabled: false,
            endpoint: None,
            insecure: false,
            service_name: "test-service".to_string(),
        }
    }

    // Test 1: OtelProvider initialization with disabled config
    #[test]
    fn test_otel_provider_disabled() {
        let provider = OtelProvider::new(&disabled_config()).unwrap();

        assert!(!provider.is_enabled());
        assert!(provider.tracer_provider.is_none());
    }

    // Test 2: OtelProvider requires endpoint when enabled
    #[test]
    fn test_otel_provider_requires_endpoint_when_enabled() {
        let config = OtelConfig {
            enabled: true,
            ..disabled_config()
        };

        match OtelProvider::new(&config) {
            Err(OtelError::Config(msg)) => {
                assert!(msg.contains("endpoint is required"));
            }
            _ => panic!("Expected OtelError::Config"),
        }
    }

    // Test 3: Sync metrics record without panicking
    #[test]
    fn test_sync_metrics_recording() {
        let provider = OtelProvider::new(&OtelConfig::default()).unwrap();
        let metrics = SyncMetrics::new(&provider.meter());

        metrics.record_request(Duration::from_millis(120), 200);
        metrics.record_request(Duration::from_millis(80), 429);
        metrics.record_retry();
        metrics.record_rate_limited();
        metrics.record_upserted(25);
        metrics.record_persist_failure();
        metrics.record_enrichment_synced();

        // Clones share the same instruments
        let cloned = metrics.clone();
        cloned.record_retry();
    }

    // Test 4: Provider shutdown
    #[test]
    fn test_otel_provider_shutdown() {
        let provider = OtelProvider::new(&disabled_config()).unwrap();
        assert!(provider.shutdown().is_ok());
    }

    // Test 5: Verbosity overrides the configured level
    #[test]
    fn test_effective_log_level() {
        assert_eq!(effective_log_level("warn", 0), Level::WARN);
        assert_eq!(effective_log_level("bogus", 0), Level::INFO);
        assert_eq!(effective_log_level("warn", 1), Level::DEBUG);
        assert_eq!(effective_log_level("info", 2), Level::TRACE);
        assert_eq!(effective_log_level("info", 5), Level::TRACE);
    }

    // Test 6: OtelError display
    #[test]
    fn test_otel_error_display() {
        let err = OtelError::Config("test error".to_string());
        assert_eq!(err.to_string(), "Configuration error: test error");

        let err = OtelError::Shutdown("shutdown error".to_string());
        assert_eq!(err.to_string(), "Failed to shutdown: shutdown error");
    }
}
