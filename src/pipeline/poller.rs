use tracing::{debug, warn};

use crate::clock::{normalize, Anchor};
use crate::driver::{CommandStatus, DeviceCounters, DriverAccess};
use crate::export::PipelineMetrics;
use crate::sink::{Sample, SinkDispatcher};
use crate::stats::{Scope, StatsAggregator};
use crate::tracker::{Disposition, EventTracker, PendingEntry};

/// Outcome counts for one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    /// Entries whose status was queried.
    pub visited: usize,
    /// Samples delivered to statistics and sinks.
    pub completed: usize,
    /// Completed entries retired because their counters could not be read.
    pub counter_failures: usize,
    /// Entries dropped because the driver no longer knew the handle.
    pub invalid: usize,
    /// Entries retired because the command terminated abnormally.
    pub failed: usize,
    /// Entries left for a later drain.
    pub still_pending: usize,
}

impl DrainSummary {
    /// Entries removed from the pending list by this pass.
    pub fn retired(&self) -> usize {
        self.completed + self.counter_failures + self.invalid + self.failed
    }
}

/// Everything one drain pass reads or writes.
pub(crate) struct Poller<'a> {
    pub driver: &'a dyn DriverAccess,
    pub stats: &'a mut StatsAggregator,
    pub sinks: &'a mut SinkDispatcher,
    pub metrics: &'a PipelineMetrics,
    pub drift_threshold_ns: u64,
}

impl Poller<'_> {
    /// Query every pending entry once, in issue order, and retire the ones
    /// that are done. Never blocks on a device.
    pub fn drain(&mut self, tracker: &mut EventTracker) -> DrainSummary {
        let mut summary = DrainSummary::default();

        tracker.poll(|entry| {
            summary.visited += 1;
            let disposition = self.visit(entry, &mut summary);
            if disposition == Disposition::Keep {
                summary.still_pending += 1;
            }
            disposition
        });

        summary
    }

    fn visit(&mut self, entry: &PendingEntry, summary: &mut DrainSummary) -> Disposition {
        let handle = entry.handle();

        match self.driver.query_status(handle) {
            CommandStatus::Queued | CommandStatus::Submitted | CommandStatus::Running => {
                Disposition::Keep
            }
            CommandStatus::Complete => {
                match self.driver.query_counters(handle) {
                    Ok(raw) => {
                        self.complete(entry, &raw);
                        summary.completed += 1;
                    }
                    Err(e) => {
                        warn!(
                            %handle,
                            tag = %entry.tag,
                            error = %e,
                            "profiling counters unavailable, sample dropped"
                        );
                        self.metrics.counter_failures.inc();
                        summary.counter_failures += 1;
                    }
                }
                Disposition::Retire
            }
            CommandStatus::InvalidHandle => {
                warn!(
                    %handle,
                    tag = %entry.tag,
                    sequence = entry.sequence,
                    "pending handle no longer valid, dropping without release"
                );
                self.metrics.invalid_handles.inc();
                summary.invalid += 1;
                Disposition::Invalidate
            }
            CommandStatus::Failed(code) => {
                warn!(
                    %handle,
                    tag = %entry.tag,
                    code,
                    "command terminated abnormally, sample dropped"
                );
                self.metrics.failed_commands.inc();
                summary.failed += 1;
                Disposition::Retire
            }
        }
    }

    fn complete(&mut self, entry: &PendingEntry, raw: &DeviceCounters) {
        let times = normalize(raw, entry.issue_host_ns, entry.offset_ns, self.drift_threshold_ns);
        if times.anchor == Anchor::Estimate {
            self.metrics.estimate_fallbacks.inc();
        }

        let sample = Sample {
            tag: &entry.tag,
            device: entry.device,
            queue: entry.queue,
            handle: entry.handle(),
            sequence: entry.sequence,
            queued_ns: times.queued,
            submitted_ns: times.submitted,
            started_ns: times.started,
            ended_ns: times.ended,
            anchor: times.anchor,
        };

        let elapsed = sample.elapsed_ns();
        let stats = self.stats.update(Scope::Device(entry.device), &entry.tag, elapsed);
        debug!(
            handle = %sample.handle,
            tag = sample.tag,
            elapsed_ns = elapsed,
            anchor = times.anchor.as_str(),
            "sample completed"
        );

        self.sinks.dispatch(&sample, &stats, self.metrics);
        self.metrics.samples.inc();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::{ClockCorrelator, ManualClock};
    use crate::driver::scripted::ScriptedDriver;
    use crate::driver::{DeviceId, DriverError, OperationHandle, QueueId};
    use crate::sink::test_support::RecordingSink;
    use crate::tracker::IssuedOperation;

    const GPU: DeviceId = DeviceId(1);

    struct Fixture {
        driver: Arc<ScriptedDriver>,
        tracker: EventTracker,
        clocks: ClockCorrelator,
        stats: StatsAggregator,
        sinks: SinkDispatcher,
        metrics: PipelineMetrics,
    }

    impl Fixture {
        fn new() -> Self {
            let driver = Arc::new(ScriptedDriver::new());
            driver.add_device(GPU, "gpu", None);
            Self {
                tracker: EventTracker::new(driver.clone(), Arc::new(ManualClock::new(1_000))),
                driver,
                clocks: ClockCorrelator::new(),
                stats: StatsAggregator::new(),
                sinks: SinkDispatcher::new(),
                metrics: PipelineMetrics::new().expect("metrics"),
            }
        }

        fn record(&mut self, raw: u64, status: &[CommandStatus]) -> OperationHandle {
            let handle = OperationHandle(raw);
            self.driver.script_status(handle, status);
            self.tracker.record(
                &self.clocks,
                IssuedOperation {
                    device: GPU,
                    handle,
                    tag: "K",
                    queue: QueueId(1),
                    sequence: raw,
                },
            );
            handle
        }

        fn drain(&mut self) -> DrainSummary {
            Poller {
                driver: self.driver.as_ref(),
                stats: &mut self.stats,
                sinks: &mut self.sinks,
                metrics: &self.metrics,
                drift_threshold_ns: 1_000_000_000,
            }
            .drain(&mut self.tracker)
        }
    }

    #[test]
    fn test_failed_command_retired_with_release() {
        let mut fx = Fixture::new();
        let (sink, seen) = RecordingSink::new("rec", false);
        fx.sinks.push(Box::new(sink));
        let h = fx.record(0x1, &[CommandStatus::Failed(-5)]);

        let summary = fx.drain();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.retired(), 1);
        assert!(fx.tracker.is_empty());
        assert_eq!(fx.driver.release_count(h), 1);
        assert!(seen.lock().samples.is_empty());
        assert_eq!(fx.stats.get(Scope::Device(GPU), "K"), None);
        assert_eq!(fx.metrics.failed_commands.get(), 1.0);
    }

    #[test]
    fn test_mixed_statuses_summarized() {
        let mut fx = Fixture::new();
        let done = fx.record(0x1, &[CommandStatus::Complete]);
        fx.driver.set_counters(
            done,
            DeviceCounters {
                queued: 100,
                submitted: 120,
                started: 150,
                ended: 400,
            },
        );
        let broken = fx.record(0x2, &[CommandStatus::Complete]);
        fx.driver
            .fail_counters(broken, DriverError::ProfilingUnavailable(broken));
        let gone = fx.record(0x3, &[CommandStatus::InvalidHandle]);
        let busy = fx.record(0x4, &[CommandStatus::Running]);

        let summary = fx.drain();

        assert_eq!(
            summary,
            DrainSummary {
                visited: 4,
                completed: 1,
                counter_failures: 1,
                invalid: 1,
                failed: 0,
                still_pending: 1,
            }
        );
        assert_eq!(fx.driver.release_count(done), 1);
        assert_eq!(fx.driver.release_count(broken), 1);
        assert_eq!(fx.driver.release_count(gone), 0);
        assert_eq!(fx.driver.release_count(busy), 0);
        assert!(fx.tracker.is_pending(busy));

        let stats = fx.stats.get(Scope::Device(GPU), "K").expect("stats");
        assert_eq!((stats.count, stats.sum_ns), (1, 250));
        assert_eq!(fx.metrics.estimate_fallbacks.get(), 1.0);
    }
}
