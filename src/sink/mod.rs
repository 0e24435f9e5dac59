pub mod chrome;
pub mod instrumentation;
pub mod timeline;

use anyhow::Result;
use tracing::{info, trace, warn};

use crate::clock::Anchor;
use crate::driver::{DeviceId, OperationHandle, QueueId};
use crate::export::PipelineMetrics;
use crate::stats::TimingStats;

pub use chrome::ChromeTraceSink;
pub use instrumentation::{InstrumentationApi, InstrumentationSink, NameId, TracingInstrumentation};
pub use timeline::TimelineLogSink;

/// One completed device operation with host-timeline timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample<'a> {
    pub tag: &'a str,
    pub device: DeviceId,
    pub queue: QueueId,
    pub handle: OperationHandle,
    pub sequence: u64,
    pub queued_ns: u64,
    pub submitted_ns: u64,
    pub started_ns: u64,
    pub ended_ns: u64,
    pub anchor: Anchor,
}

impl Sample<'_> {
    /// Device execution time.
    pub fn elapsed_ns(&self) -> u64 {
        self.ended_ns.saturating_sub(self.started_ns)
    }
}

/// Log output a sink produced while the pipeline lock was held.
///
/// Sinks buffer these from `handle_sample`; the pipeline collects them
/// with [`SampleSink::take_logs`] and emits them once the lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkLog {
    Timeline {
        device: DeviceId,
        anchor: Anchor,
        line: String,
    },
    TaskBegin {
        domain: String,
        task_id: u64,
        task: String,
        at_ns: u64,
    },
    TaskEnd {
        domain: String,
        task_id: u64,
        at_ns: u64,
    },
}

impl SinkLog {
    pub fn emit(&self) {
        match self {
            SinkLog::Timeline {
                device,
                anchor,
                line,
            } => info!(
                target: "cltiming::timeline",
                device = %device,
                anchor = anchor.as_str(),
                "{line}"
            ),
            SinkLog::TaskBegin {
                domain,
                task_id,
                task,
                at_ns,
            } => trace!(
                target: "cltiming::instrumentation",
                domain = domain.as_str(),
                task_id,
                task = task.as_str(),
                at_ns,
                "task begin"
            ),
            SinkLog::TaskEnd {
                domain,
                task_id,
                at_ns,
            } => trace!(
                target: "cltiming::instrumentation",
                domain = domain.as_str(),
                task_id,
                at_ns,
                "task end"
            ),
        }
    }
}

/// Sink consumes completed samples and exports them.
///
/// Sinks are pure consumers. An error from one sink is logged and never
/// stops delivery to the others.
pub trait SampleSink: Send {
    /// Returns the sink's name for logging and metrics.
    fn name(&self) -> &str;

    /// Process one sample together with the statistics for its tag after
    /// the sample was folded in.
    fn handle_sample(&mut self, sample: &Sample<'_>, stats: &TimingStats) -> Result<()>;

    /// Persist anything buffered.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Move buffered log output into `out`.
    fn take_logs(&mut self, _out: &mut Vec<SinkLog>) {}
}

/// Offers every sample to each registered sink in registration order.
#[derive(Default)]
pub struct SinkDispatcher {
    sinks: Vec<Box<dyn SampleSink>>,
}

impl SinkDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Box<dyn SampleSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Deliver one sample to every sink.
    pub fn dispatch(&mut self, sample: &Sample<'_>, stats: &TimingStats, metrics: &PipelineMetrics) {
        for sink in &mut self.sinks {
            if let Err(e) = sink.handle_sample(sample, stats) {
                warn!(
                    sink = sink.name(),
                    tag = sample.tag,
                    error = %e,
                    "sink failed to handle sample"
                );
                metrics.sink_errors.with_label_values(&[sink.name()]).inc();
            }
        }
    }

    /// Flush every sink, logging failures.
    pub fn flush(&mut self, metrics: &PipelineMetrics) {
        for sink in &mut self.sinks {
            if let Err(e) = sink.flush() {
                warn!(sink = sink.name(), error = %format!("{e:#}"), "sink flush failed");
                metrics.sink_errors.with_label_values(&[sink.name()]).inc();
            }
        }
    }

    /// Collect buffered log output from every sink, in registration order.
    pub fn take_logs(&mut self, out: &mut Vec<SinkLog>) {
        for sink in &mut self.sinks {
            sink.take_logs(out);
        }
    }

    /// Move every sink out, leaving the dispatcher empty.
    pub fn take(&mut self) -> SinkDispatcher {
        SinkDispatcher {
            sinks: std::mem::take(&mut self.sinks),
        }
    }
}
