/// Prometheus metrics for template renderings and generation jobs.
///
/// Everything registers into one process-wide registry; `METRICS.encode()`
/// produces the text exposition format for whatever endpoint embeds the
/// crate.
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use prometheus_client::encoding::{EncodeLabelSet, text::encode};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Global metrics registry instance
pub static METRICS: Lazy<Arc<MetricsCollector>> = Lazy::new(|| Arc::new(MetricsCollector::new()));

/// Terminal state of a job
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// "completed", "failed" or "cancelled"
    pub outcome: String,
}

/// Failure family, see `ErrorCode::category`
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CategoryLabels {
    pub category: String,
}

/// Rendering strategy
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ModeLabels {
    /// "memory" or "streaming"
    pub mode: String,
}

pub struct MetricsCollector {
    registry: RwLock<Registry>,

    pub jobs_submitted_total: Counter,

    pub jobs_finished_total: Family<OutcomeLabels, Counter>,

    pub jobs_failed_total: Family<CategoryLabels, Counter>,

    /// Jobs currently pending or running
    pub jobs_active: Gauge,

    pub rows_rendered_total: Family<ModeLabels, Counter>,

    pub render_duration_seconds: Histogram,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let jobs_submitted_total = Counter::default();
        registry.register(
            "xlsx_template_jobs_submitted",
            "Total number of generation jobs submitted",
            jobs_submitted_total.clone(),
        );

        let jobs_finished_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "xlsx_template_jobs_finished",
            "Total number of generation jobs that reached a terminal state",
            jobs_finished_total.clone(),
        );

        let jobs_failed_total = Family::<CategoryLabels, Counter>::default();
        registry.register(
            "xlsx_template_jobs_failed",
            "Failed generation jobs by error category",
            jobs_failed_total.clone(),
        );

        let jobs_active = Gauge::default();
        registry.register(
            "xlsx_template_jobs_active",
            "Generation jobs currently pending or running",
            jobs_active.clone(),
        );

        let rows_rendered_total = Family::<ModeLabels, Counter>::default();
        registry.register(
            "xlsx_template_rows_rendered",
            "Total number of worksheet rows rendered",
            rows_rendered_total.clone(),
        );

        // Buckets: 5ms .. ~100s
        let render_duration_seconds = Histogram::new(exponential_buckets(0.005, 3.0, 10));
        registry.register(
            "xlsx_template_render_duration_seconds",
            "Wall time of one rendering in seconds",
            render_duration_seconds.clone(),
        );

        Self {
            registry: RwLock::new(registry),
            jobs_submitted_total,
            jobs_finished_total,
            jobs_failed_total,
            jobs_active,
            rows_rendered_total,
            render_duration_seconds,
        }
    }

    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        let registry = self.registry.read();
        encode(&mut buffer, &registry).expect("encoding metrics should succeed");
        buffer
    }

    pub fn record_render(&self, mode: &str, rows: u64, duration: Duration) {
        self.rows_rendered_total
            .get_or_create(&ModeLabels {
                mode: mode.to_string(),
            })
            .inc_by(rows);
        self.render_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_job_submitted(&self) {
        self.jobs_submitted_total.inc();
        self.jobs_active.inc();
    }

    pub fn record_job_finished(&self, outcome: &str) {
        self.jobs_finished_total
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc();
        self.jobs_active.dec();
    }

    pub fn record_job_failure(&self, category: &str) {
        self.jobs_failed_total
            .get_or_create(&CategoryLabels {
                category: category.to_string(),
            })
            .inc();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Times one rendering and records it when finished.
///
/// A timer dropped without [`RenderTimer::finish`] records nothing: failed
/// and cancelled renderings only show up in the job outcome counters.
pub struct RenderTimer {
    start: Instant,
}

impl RenderTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn finish(self, mode: &str, rows: u64) -> Duration {
        let elapsed = self.start.elapsed();
        METRICS.record_render(mode, rows, elapsed);
        elapsed
    }
}
