//! Prometheus metrics for the collection pipeline.
//!
//! Metrics are registered against an injected [`Registry`] rather than a
//! process-global; tests hand each engine its own registry.

use prometheus::{Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry};

/// Metrics observed by fetcher workers and the job controller.
///
/// All members use interior mutability and the struct is cheap to clone;
/// every worker holds its own handle.
#[derive(Debug, Clone)]
pub struct DiagnosticsMetrics {
    /// Elapsed seconds of each endpoint GET, labeled by path and HTTP status.
    http_fetch_seconds: HistogramVec,

    /// Elapsed seconds of each whole collection job.
    bundle_creation_time: Histogram,

    /// Elapsed seconds of the most recent collection job.
    bundle_creation_time_gauge: Gauge,
}

impl DiagnosticsMetrics {
    /// Create the metric families and register them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any family fails to register (e.g. duplicate
    /// name in the registry).
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let http_fetch_seconds = HistogramVec::new(
            HistogramOpts::new("http_fetch_seconds", "Time taken to fetch an endpoint"),
            &["path", "status_code"],
        )?;
        registry.register(Box::new(http_fetch_seconds.clone()))?;

        let bundle_creation_time = Histogram::with_opts(HistogramOpts::new(
            "bundle_creation_time_seconds",
            "Time taken to create a bundle",
        ))?;
        registry.register(Box::new(bundle_creation_time.clone()))?;

        let bundle_creation_time_gauge = Gauge::with_opts(Opts::new(
            "bundle_creation_time_seconds_gauge",
            "Time taken to create a bundle",
        ))?;
        registry.register(Box::new(bundle_creation_time_gauge.clone()))?;

        Ok(Self {
            http_fetch_seconds,
            bundle_creation_time,
            bundle_creation_time_gauge,
        })
    }

    /// Record one endpoint GET.
    pub fn observe_fetch(&self, path: &str, status_code: u16, seconds: f64) {
        self.http_fetch_seconds
            .with_label_values(&[path, &status_code.to_string()])
            .observe(seconds);
    }

    /// Record one finished collection job.
    pub fn observe_bundle_creation(&self, seconds: f64) {
        self.bundle_creation_time.observe(seconds);
        self.bundle_creation_time_gauge.set(seconds);
    }

    /// The per-fetch histogram, for handing to workers.
    #[must_use]
    pub fn fetch_histogram(&self) -> HistogramVec {
        self.http_fetch_seconds.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_fetch_labels_by_path_and_status() {
        let registry = Registry::new();
        let metrics = DiagnosticsMetrics::new(&registry).unwrap();

        metrics.observe_fetch("/ping", 200, 0.01);
        metrics.observe_fetch("/ping", 200, 0.02);
        metrics.observe_fetch("/err", 500, 0.5);

        let sampled = metrics
            .http_fetch_seconds
            .get_metric_with_label_values(&["/ping", "200"])
            .unwrap();
        assert_eq!(sampled.get_sample_count(), 2);
    }

    #[test]
    fn test_bundle_creation_updates_histogram_and_gauge() {
        let registry = Registry::new();
        let metrics = DiagnosticsMetrics::new(&registry).unwrap();

        metrics.observe_bundle_creation(1.5);
        metrics.observe_bundle_creation(2.5);

        assert_eq!(metrics.bundle_creation_time.get_sample_count(), 2);
        assert!((metrics.bundle_creation_time_gauge.get() - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        let _first = DiagnosticsMetrics::new(&registry).unwrap();
        assert!(DiagnosticsMetrics::new(&registry).is_err());
    }
}
