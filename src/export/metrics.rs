use anyhow::{Context, Result};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

const NAMESPACE: &str = "cltiming";

/// Prometheus metrics describing the timing pipeline itself.
///
/// All metrics use the "cltiming" namespace and live in a private registry
/// so several pipelines in one process do not collide.
pub struct PipelineMetrics {
    registry: Registry,

    /// Operations currently awaiting completion.
    pub pending: Gauge,
    /// Completed samples delivered to statistics and sinks.
    pub samples: Counter,
    /// Completed operations whose profiling counters could not be read.
    pub counter_failures: Counter,
    /// Pending operations the driver no longer recognized.
    pub invalid_handles: Counter,
    /// Operations the driver reported as terminated abnormally.
    pub failed_commands: Counter,
    /// Producer calls that handed over a null handle.
    pub null_handles: Counter,
    /// Samples anchored on the issue-time host estimate.
    pub estimate_fallbacks: Counter,
    /// Sink delivery and flush errors by sink.
    pub sink_errors: CounterVec,
    /// Wall time of one drain pass (10us-100ms buckets).
    pub drain_duration: Histogram,
}

impl PipelineMetrics {
    /// Creates a new metrics instance with all metrics registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let pending = Gauge::with_opts(
            Opts::new("pending_operations", "Operations awaiting completion.")
                .namespace(NAMESPACE),
        )?;
        let samples = Counter::with_opts(
            Opts::new("samples_total", "Completed device samples recorded.").namespace(NAMESPACE),
        )?;
        let counter_failures = Counter::with_opts(
            Opts::new(
                "counter_query_failures_total",
                "Completed operations whose profiling counters could not be read.",
            )
            .namespace(NAMESPACE),
        )?;
        let invalid_handles = Counter::with_opts(
            Opts::new(
                "invalid_handles_total",
                "Pending operations the driver no longer recognized.",
            )
            .namespace(NAMESPACE),
        )?;
        let failed_commands = Counter::with_opts(
            Opts::new(
                "failed_commands_total",
                "Operations reported as terminated abnormally.",
            )
            .namespace(NAMESPACE),
        )?;
        let null_handles = Counter::with_opts(
            Opts::new(
                "null_handles_total",
                "Asynchronous calls that produced no completion handle.",
            )
            .namespace(NAMESPACE),
        )?;
        let estimate_fallbacks = Counter::with_opts(
            Opts::new(
                "estimate_fallbacks_total",
                "Samples anchored on the issue-time host estimate.",
            )
            .namespace(NAMESPACE),
        )?;
        let sink_errors = CounterVec::new(
            Opts::new("sink_errors_total", "Sink delivery and flush errors by sink.")
                .namespace(NAMESPACE),
            &["sink"],
        )?;
        let drain_duration = Histogram::with_opts(
            HistogramOpts::new(
                "drain_duration_seconds",
                "Wall time of one completion drain pass.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.00001, 0.0001, 0.001, 0.01, 0.1]),
        )?;

        registry.register(Box::new(pending.clone()))?;
        registry.register(Box::new(samples.clone()))?;
        registry.register(Box::new(counter_failures.clone()))?;
        registry.register(Box::new(invalid_handles.clone()))?;
        registry.register(Box::new(failed_commands.clone()))?;
        registry.register(Box::new(null_handles.clone()))?;
        registry.register(Box::new(estimate_fallbacks.clone()))?;
        registry.register(Box::new(sink_errors.clone()))?;
        registry.register(Box::new(drain_duration.clone()))?;

        Ok(Self {
            registry,
            pending,
            samples,
            counter_failures,
            invalid_handles,
            failed_commands,
            null_handles,
            estimate_fallbacks,
            sink_errors,
            drain_duration,
        })
    }

    /// Returns the underlying registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("encoding metrics")?;

        String::from_utf8(buffer).context("converting metrics to string")
    }
}
