mod poller;

use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{ClockCorrelator, HostClock};
use crate::config::{Config, ReportConfig};
use crate::driver::{DeviceId, DriverAccess, OperationHandle, QueueId};
use crate::export::PipelineMetrics;
use crate::sink::{
    ChromeTraceSink, InstrumentationSink, SampleSink, SinkDispatcher, TimelineLogSink,
    TracingInstrumentation,
};
use crate::stats::report::render_scope;
use crate::stats::{Scope, ScopeReport, StatsAggregator, TimingStats};
use crate::tracker::{EventTracker, IssuedOperation, RecordOutcome};

pub use poller::DrainSummary;
use poller::Poller;

/// Report heading for host call timing.
pub const HOST_HEADING: &str = "Host Performance Timing Results";

/// Mutable pipeline state, guarded by one lock.
struct State {
    tracker: EventTracker,
    stats: StatsAggregator,
    sinks: SinkDispatcher,
}

/// Correlates asynchronous operations with their device timing and
/// aggregates per-call-site statistics.
///
/// Every public method takes the state lock for its whole duration, so
/// producers on many threads may record while another thread drains. The
/// lock is never held across file I/O: sink log output is collected under
/// it and emitted afterwards. Clock baselines sit behind their own lock,
/// always taken after the state lock.
///
/// Dropping a pipeline that was never finished flushes its sinks but writes
/// no report.
pub struct Pipeline {
    driver: Arc<dyn DriverAccess>,
    clocks: ClockCorrelator,
    state: Mutex<State>,
    metrics: PipelineMetrics,
    drift_threshold_ns: u64,
    host_report: bool,
    device_report: bool,
    report: ReportConfig,
}

impl Pipeline {
    /// Build a pipeline with the sinks enabled in `cfg`.
    pub fn new(cfg: &Config, driver: Arc<dyn DriverAccess>, host: Arc<dyn HostClock>) -> Result<Self> {
        cfg.validate().context("validating config")?;
        let metrics = PipelineMetrics::new().context("creating pipeline metrics")?;

        let mut sinks = SinkDispatcher::new();
        if cfg.chrome_trace.enabled {
            sinks.push(Box::new(ChromeTraceSink::new(
                &cfg.chrome_trace,
                host.now_ns(),
                epoch_micros(),
            )));
        }
        if cfg.instrumentation.enabled {
            sinks.push(Box::new(InstrumentationSink::new(
                TracingInstrumentation::new(),
                &cfg.instrumentation.domain,
            )));
        }
        if cfg.timing.device_timeline_logging {
            sinks.push(Box::new(TimelineLogSink::new()));
        }

        info!(
            sinks = ?sinks.names(),
            drift_threshold = ?cfg.timing.drift_threshold,
            "timing pipeline ready"
        );

        Ok(Self {
            clocks: ClockCorrelator::new(),
            state: Mutex::new(State {
                tracker: EventTracker::new(Arc::clone(&driver), host),
                stats: StatsAggregator::new(),
                sinks,
            }),
            driver,
            metrics,
            drift_threshold_ns: cfg.timing.drift_threshold_ns(),
            host_report: cfg.timing.host_report,
            device_report: cfg.timing.device_report,
            report: cfg.report.clone(),
        })
    }

    /// Register an additional sink after the configured ones.
    pub fn add_sink(&self, sink: Box<dyn SampleSink>) {
        self.state.lock().sinks.push(sink);
    }

    /// Track a just-issued asynchronous operation until it completes.
    ///
    /// Never fails: a null handle or a refused retain is logged and the
    /// operation is simply not timed.
    pub fn record_pending(
        &self,
        device: DeviceId,
        handle: OperationHandle,
        tag: &str,
        queue: QueueId,
        sequence: u64,
    ) -> RecordOutcome {
        let mut state = self.state.lock();
        let outcome = state.tracker.record(
            &self.clocks,
            IssuedOperation {
                device,
                handle,
                tag,
                queue,
                sequence,
            },
        );

        if outcome == RecordOutcome::NullHandle {
            self.metrics.null_handles.inc();
        }
        self.metrics.pending.set(state.tracker.len() as f64);
        outcome
    }

    /// Retire every pending operation that has finished.
    ///
    /// Performs one non-blocking status query per pending entry. Entries
    /// still in flight stay for a later call.
    pub fn drain(&self) -> DrainSummary {
        let mut state = self.state.lock();
        if state.tracker.is_empty() {
            return DrainSummary::default();
        }

        let start = Instant::now();
        let State {
            tracker,
            stats,
            sinks,
        } = &mut *state;

        let summary = Poller {
            driver: self.driver.as_ref(),
            stats,
            sinks: &mut *sinks,
            metrics: &self.metrics,
            drift_threshold_ns: self.drift_threshold_ns,
        }
        .drain(tracker);

        let mut logs = Vec::new();
        sinks.take_logs(&mut logs);

        self.metrics
            .drain_duration
            .observe(start.elapsed().as_secs_f64());
        self.metrics.pending.set(tracker.len() as f64);
        drop(state);

        for log in &logs {
            log.emit();
        }

        if summary.retired() > 0 {
            debug!(
                completed = summary.completed,
                counter_failures = summary.counter_failures,
                invalid = summary.invalid,
                failed = summary.failed,
                still_pending = summary.still_pending,
                "drained pending operations"
            );
        }
        summary
    }

    /// Fold a caller-measured host call duration into the host statistics.
    pub fn update_host_timing(&self, tag: &str, elapsed_ns: u64) -> TimingStats {
        self.state.lock().stats.update(Scope::Host, tag, elapsed_ns)
    }

    /// Statistics for one tag.
    pub fn stats(&self, scope: Scope, tag: &str) -> Option<TimingStats> {
        self.state.lock().stats.get(scope, tag)
    }

    /// Tag-sorted statistics for one scope.
    pub fn scope_report(&self, scope: Scope) -> ScopeReport {
        self.state.lock().stats.report(scope)
    }

    /// Operations still awaiting completion.
    pub fn pending_len(&self) -> usize {
        self.state.lock().tracker.len()
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Drain, then write the timing report to `out`.
    pub fn write_report<W: Write>(&self, out: &mut W) -> io::Result<()> {
        self.drain();
        let text = self.render_report();
        out.write_all(text.as_bytes())?;
        out.flush()
    }

    /// Drain, then write the timing report to every configured output.
    ///
    /// An output that cannot be opened or written is logged and skipped;
    /// the remaining outputs are still written.
    pub fn write_configured_report(&self) {
        self.drain();
        let text = self.render_report();
        if text.is_empty() {
            return;
        }

        if self.report.to_stderr {
            let mut stderr = io::stderr().lock();
            if let Err(e) = stderr.write_all(text.as_bytes()) {
                warn!(error = %e, "failed to write timing report to stderr");
            }
        }

        if let Some(path) = &self.report.file {
            let written = File::create(path)
                .with_context(|| format!("opening report file {}", path.display()))
                .and_then(|mut f| {
                    f.write_all(text.as_bytes())
                        .with_context(|| format!("writing report file {}", path.display()))
                });
            match written {
                Ok(()) => info!(path = %path.display(), "wrote timing report"),
                Err(e) => warn!(error = %format!("{e:#}"), "skipping report output"),
            }
        }
    }

    /// Final drain, report, and sink flush.
    ///
    /// Sinks are detached before they flush, so samples completing after
    /// this call still update statistics but reach no sink.
    pub fn finish(&self) {
        self.write_configured_report();

        let sinks = self.state.lock().sinks.take();
        flush_detached(sinks, &self.metrics);

        let pending = self.pending_len();
        if pending > 0 {
            info!(pending, "operations still pending at finish");
        }
    }

    /// Render the report text under the state lock.
    fn render_report(&self) -> String {
        let state = self.state.lock();
        let mut out = String::new();

        if self.host_report {
            render_scope(&mut out, HOST_HEADING, &state.stats.report(Scope::Host));
        }

        if self.device_report {
            for device in state.stats.devices() {
                let name = self
                    .driver
                    .device_name(device)
                    .unwrap_or_else(|| device.to_string());
                let heading = format!("Device Performance Timing Results for {name}");
                render_scope(&mut out, &heading, &state.stats.report(Scope::Device(device)));
            }
        }

        out
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let sinks = &mut self.state.get_mut().sinks;
        if sinks.is_empty() {
            return;
        }

        warn!(
            sinks = ?sinks.names(),
            "pipeline dropped before finish, flushing sinks without a report"
        );
        let sinks = sinks.take();
        flush_detached(sinks, &self.metrics);
    }
}

/// Flush sinks already taken out of the shared state, then emit whatever
/// log output they still hold.
fn flush_detached(mut sinks: SinkDispatcher, metrics: &PipelineMetrics) {
    sinks.flush(metrics);

    let mut logs = Vec::new();
    sinks.take_logs(&mut logs);
    for log in &logs {
        log.emit();
    }
}

fn epoch_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
