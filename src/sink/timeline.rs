use anyhow::Result;

use super::{Sample, SampleSink, SinkLog};
use crate::stats::TimingStats;

/// Logs one line per device sample with its four host-timeline timestamps.
///
/// Lines are buffered and logged by the pipeline after it releases its lock.
#[derive(Debug, Default)]
pub struct TimelineLogSink {
    pending: Vec<SinkLog>,
}

impl TimelineLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(sample: &Sample<'_>) -> String {
        format!(
            "Device Timeline for {} (enqueue {}) = {} ns (queued), {} ns (submit), {} ns (start), {} ns (end)",
            sample.tag,
            sample.sequence,
            sample.queued_ns,
            sample.submitted_ns,
            sample.started_ns,
            sample.ended_ns,
        )
    }
}

impl SampleSink for TimelineLogSink {
    fn name(&self) -> &str {
        "device_timeline"
    }

    fn handle_sample(&mut self, sample: &Sample<'_>, _stats: &TimingStats) -> Result<()> {
        self.pending.push(SinkLog::Timeline {
            device: sample.device,
            anchor: sample.anchor,
            line: Self::line(sample),
        });
        Ok(())
    }

    fn take_logs(&mut self, out: &mut Vec<SinkLog>) {
        out.append(&mut self.pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Anchor;
    use crate::driver::DeviceId;
    use crate::sink::test_support::sample;

    #[test]
    fn test_timeline_line_format() {
        let s = sample("vector_add", 150, 400);
        assert_eq!(
            TimelineLogSink::line(&s),
            "Device Timeline for vector_add (enqueue 1) = 100 ns (queued), 120 ns (submit), 150 ns (start), 400 ns (end)"
        );
    }

    #[test]
    fn test_lines_buffered_until_taken() {
        let mut sink = TimelineLogSink::new();
        let stats = TimingStats::first(1);
        sink.handle_sample(&sample("A", 150, 400), &stats).expect("handle");
        sink.handle_sample(&sample("B", 1, 2), &stats).expect("handle");

        let mut logs = Vec::new();
        sink.take_logs(&mut logs);
        assert_eq!(logs.len(), 2);
        assert_eq!(
            logs[0],
            SinkLog::Timeline {
                device: DeviceId(1),
                anchor: Anchor::Estimate,
                line: TimelineLogSink::line(&sample("A", 150, 400)),
            }
        );

        let mut again = Vec::new();
        sink.take_logs(&mut again);
        assert!(again.is_empty());
    }
}
