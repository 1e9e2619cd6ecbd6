/*!
Observability infrastructure for Tidemark.

This module provides:
- Structured logging setup (human-readable or JSON)
- Prometheus metrics for backups, restores, migrations and remote uploads
  (behind the `metrics` feature)
- An operation timer usable with or without metrics
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{Result, TidemarkError};

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<LifecycleMetrics> = OnceLock::new();

/// Lifecycle events counted by the metrics registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    BackupCreated { bytes: u64 },
    BackupFailed,
    BackupDeleted,
    RestoreCompleted,
    RestoreFailed,
    MigrationApplied,
    MigrationFailed,
    RemoteUploaded,
    RemoteUploadFailed,
}

/// Metrics collection for lifecycle operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct LifecycleMetrics {
    pub backups_created_total: Counter,
    pub backups_failed_total: Counter,
    pub backups_deleted_total: Counter,
    pub restores_total: Counter,
    pub restores_failed_total: Counter,
    pub migrations_applied_total: Counter,
    pub migrations_failed_total: Counter,
    pub remote_uploads_total: Counter,
    pub remote_upload_errors_total: Counter,

    pub archive_size_bytes: Histogram,
    pub operation_latency_seconds: Histogram,

    // Prometheus registry for scraping
    registry: Registry,
}

#[cfg(feature = "metrics")]
impl LifecycleMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<Counter> {
            let counter = Counter::new(name, help).map_err(|e| {
                TidemarkError::storage(format!("Failed to create {name} metric: {e}"))
            })?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(|e| TidemarkError::storage(format!("Failed to register {name}: {e}")))?;
            Ok(counter)
        };

        let backups_created_total =
            counter("tidemark_backups_created_total", "Backups created and persisted")?;
        let backups_failed_total =
            counter("tidemark_backups_failed_total", "Backup attempts that failed")?;
        let backups_deleted_total =
            counter("tidemark_backups_deleted_total", "Backup archives deleted")?;
        let restores_total = counter("tidemark_restores_total", "Completed rollbacks")?;
        let restores_failed_total =
            counter("tidemark_restores_failed_total", "Rollbacks that failed")?;
        let migrations_applied_total =
            counter("tidemark_migrations_applied_total", "Migration steps applied")?;
        let migrations_failed_total =
            counter("tidemark_migrations_failed_total", "Migration steps that failed")?;
        let remote_uploads_total =
            counter("tidemark_remote_uploads_total", "Archives uploaded to remote storage")?;
        let remote_upload_errors_total = counter(
            "tidemark_remote_upload_errors_total",
            "Remote archive uploads that failed",
        )?;

        let histogram = |opts: HistogramOpts| -> Result<Histogram> {
            let name = opts.common_opts.name.clone();
            let histogram = Histogram::with_opts(opts).map_err(|e| {
                TidemarkError::storage(format!("Failed to create {name} metric: {e}"))
            })?;
            registry
                .register(Box::new(histogram.clone()))
                .map_err(|e| TidemarkError::storage(format!("Failed to register {name}: {e}")))?;
            Ok(histogram)
        };

        let archive_size_bytes = histogram(
            HistogramOpts::new("tidemark_archive_size_bytes", "Size of created backup archives")
                .buckets(prometheus::exponential_buckets(1024.0, 4.0, 12).unwrap_or_default()),
        )?;
        let operation_latency_seconds = histogram(HistogramOpts::new(
            "tidemark_operation_latency_seconds",
            "Duration of lifecycle operations in seconds",
        ))?;

        Ok(Self {
            backups_created_total,
            backups_failed_total,
            backups_deleted_total,
            restores_total,
            restores_failed_total,
            migrations_applied_total,
            migrations_failed_total,
            remote_uploads_total,
            remote_upload_errors_total,
            archive_size_bytes,
            operation_latency_seconds,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    ///
    /// Returns `None` only if the registry could not be built, which is
    /// logged once per call.
    pub fn global() -> Option<&'static LifecycleMetrics> {
        if let Some(metrics) = METRICS.get() {
            return Some(metrics);
        }
        match Self::new() {
            Ok(metrics) => {
                let _ = METRICS.set(metrics);
                METRICS.get()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Tidemark metrics unavailable");
                None
            }
        }
    }

    pub fn record(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::BackupCreated { bytes } => {
                self.backups_created_total.inc();
                self.archive_size_bytes.observe(bytes as f64);
            }
            LifecycleEvent::BackupFailed => self.backups_failed_total.inc(),
            LifecycleEvent::BackupDeleted => self.backups_deleted_total.inc(),
            LifecycleEvent::RestoreCompleted => self.restores_total.inc(),
            LifecycleEvent::RestoreFailed => self.restores_failed_total.inc(),
            LifecycleEvent::MigrationApplied => self.migrations_applied_total.inc(),
            LifecycleEvent::MigrationFailed => self.migrations_failed_total.inc(),
            LifecycleEvent::RemoteUploaded => self.remote_uploads_total.inc(),
            LifecycleEvent::RemoteUploadFailed => self.remote_upload_errors_total.inc(),
        }
    }

    pub fn record_latency(&self, duration: Duration) {
        self.operation_latency_seconds.observe(duration.as_secs_f64());
    }

    /// Gather metrics in Prometheus format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| TidemarkError::storage(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer).map_err(|e| {
            TidemarkError::storage(format!("Failed to convert metrics to string: {e}"))
        })
    }
}

/// Count a lifecycle event
#[cfg(feature = "metrics")]
pub fn record_event(event: LifecycleEvent) {
    if let Some(metrics) = LifecycleMetrics::global() {
        metrics.record(event);
    }
}

/// Count a lifecycle event; a no-op without the `metrics` feature
#[cfg(not(feature = "metrics"))]
pub fn record_event(_event: LifecycleEvent) {}

/// Render all metrics in the Prometheus text format
///
/// Empty when the `metrics` feature is off.
pub fn gather_metrics() -> Result<String> {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = LifecycleMetrics::global() {
        return metrics.gather_metrics();
    }
    Ok(String::new())
}

/// Timer helper for measuring operation durations
pub struct OperationTimer {
    start: Instant,
    operation: &'static str,
}

impl OperationTimer {
    /// Start a new timer for the given operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Complete the timer, recording latency, and return the elapsed time
    pub fn finish(self) -> Duration {
        let elapsed = self.start.elapsed();
        #[cfg(feature = "metrics")]
        if let Some(metrics) = LifecycleMetrics::global() {
            metrics.record_latency(elapsed);
        }
        tracing::trace!(
            operation = self.operation,
            elapsed_ms = elapsed.as_millis() as u64,
            "Operation finished"
        );
        elapsed
    }
}

/// Initialize the global tracing subscriber
///
/// # Arguments
/// * `json` - Emit one JSON object per event instead of human-readable lines
/// * `default_level` - Level for `tidemark` targets when `RUST_LOG` is unset
pub fn init_observability(json: bool, default_level: &str) -> Result<()> {
    #[cfg(feature = "metrics")]
    LifecycleMetrics::global();

    let directive = format!("tidemark={default_level}")
        .parse()
        .map_err(|e| TidemarkError::validation(format!("Invalid log level {default_level:?}: {e}")))?;
    let filter = EnvFilter::from_default_env().add_directive(directive);

    let result = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    };
    result.map_err(|e| {
        TidemarkError::storage(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("Tidemark observability initialized");
    Ok(())
}

/// Initialize observability with default settings
pub fn init_default_observability() -> Result<()> {
    init_observability(false, "info")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_measures_elapsed() {
        let timer = OperationTimer::start("test_operation");
        assert_eq!(timer.operation(), "test_operation");
        std::thread::sleep(Duration::from_millis(2));
        assert!(timer.finish() >= Duration::from_millis(2));
    }

    #[test]
    fn test_record_event_never_panics() {
        record_event(LifecycleEvent::BackupCreated { bytes: 2048 });
        record_event(LifecycleEvent::RemoteUploadFailed);
        assert!(gather_metrics().is_ok());
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics_gathering() {
        let metrics = LifecycleMetrics::global().unwrap();
        metrics.record(LifecycleEvent::MigrationApplied);
        metrics.record(LifecycleEvent::BackupDeleted);

        let text = gather_metrics().unwrap();
        assert!(text.contains("tidemark_migrations_applied_total"));
        assert!(text.contains("tidemark_backups_deleted_total"));
    }
}
