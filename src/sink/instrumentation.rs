use std::collections::HashMap;

use anyhow::Result;

use super::{Sample, SampleSink, SinkLog};
use crate::stats::TimingStats;

/// Interned task name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NameId(pub u32);

/// Task-annotation backend that device samples are replayed into.
pub trait InstrumentationApi: Send {
    /// Create a task name. Called once per distinct name.
    fn create_name(&mut self, name: &str) -> NameId;

    /// Open task `task_id` at host time `at_ns`.
    fn task_begin(&mut self, domain: &str, task_id: u64, name: NameId, at_ns: u64) -> Result<()>;

    /// Close task `task_id` at host time `at_ns`.
    fn task_end(&mut self, domain: &str, task_id: u64, at_ns: u64) -> Result<()>;

    /// Move log output buffered by the backend into `out`.
    fn take_logs(&mut self, _out: &mut Vec<SinkLog>) {}
}

/// Backend that reports tasks as `tracing` events under the
/// `cltiming::instrumentation` target, once the pipeline releases its lock.
#[derive(Debug, Default)]
pub struct TracingInstrumentation {
    names: Vec<String>,
    pending: Vec<SinkLog>,
}

impl TracingInstrumentation {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, name: NameId) -> &str {
        self.names
            .get(name.0 as usize)
            .map(String::as_str)
            .unwrap_or("<unknown>")
    }
}

impl InstrumentationApi for TracingInstrumentation {
    fn create_name(&mut self, name: &str) -> NameId {
        self.names.push(name.to_string());
        NameId(self.names.len() as u32 - 1)
    }

    fn task_begin(&mut self, domain: &str, task_id: u64, name: NameId, at_ns: u64) -> Result<()> {
        let task = self.lookup(name).to_string();
        self.pending.push(SinkLog::TaskBegin {
            domain: domain.to_string(),
            task_id,
            task,
            at_ns,
        });
        Ok(())
    }

    fn task_end(&mut self, domain: &str, task_id: u64, at_ns: u64) -> Result<()> {
        self.pending.push(SinkLog::TaskEnd {
            domain: domain.to_string(),
            task_id,
            at_ns,
        });
        Ok(())
    }

    fn take_logs(&mut self, out: &mut Vec<SinkLog>) {
        out.append(&mut self.pending);
    }
}

/// Replays each device sample as a named task spanning its execution.
///
/// Tasks are keyed by the operation handle. Names are interned so the
/// backend sees each distinct tag created exactly once.
pub struct InstrumentationSink<A: InstrumentationApi> {
    api: A,
    domain: String,
    names: HashMap<String, NameId>,
}

impl<A: InstrumentationApi> InstrumentationSink<A> {
    pub fn new(api: A, domain: &str) -> Self {
        Self {
            api,
            domain: domain.to_string(),
            names: HashMap::new(),
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    fn intern(&mut self, tag: &str) -> NameId {
        if let Some(id) = self.names.get(tag) {
            return *id;
        }
        let id = self.api.create_name(tag);
        self.names.insert(tag.to_string(), id);
        id
    }
}

impl<A: InstrumentationApi> SampleSink for InstrumentationSink<A> {
    fn name(&self) -> &str {
        "instrumentation"
    }

    fn handle_sample(&mut self, sample: &Sample<'_>, _stats: &TimingStats) -> Result<()> {
        let name = self.intern(sample.tag);
        let task_id = sample.handle.0;
        self.api
            .task_begin(&self.domain, task_id, name, sample.started_ns)?;
        self.api.task_end(&self.domain, task_id, sample.ended_ns)
    }

    fn take_logs(&mut self, out: &mut Vec<SinkLog>) {
        self.api.take_logs(out);
    }
}

#[cfg(test)]
mod tests {
    use anyhow::bail;

    use super::*;
    use crate::sink::test_support::sample;

    #[derive(Debug, Default)]
    struct RecordingApi {
        created: Vec<String>,
        calls: Vec<String>,
        fail_begin: bool,
    }

    impl InstrumentationApi for RecordingApi {
        fn create_name(&mut self, name: &str) -> NameId {
            self.created.push(name.to_string());
            NameId(self.created.len() as u32 - 1)
        }

        fn task_begin(&mut self, domain: &str, task_id: u64, name: NameId, at_ns: u64) -> Result<()> {
            if self.fail_begin {
                bail!("backend unavailable");
            }
            self.calls
                .push(format!("begin {domain} {task_id:#x} {} {at_ns}", name.0));
            Ok(())
        }

        fn task_end(&mut self, domain: &str, task_id: u64, at_ns: u64) -> Result<()> {
            self.calls.push(format!("end {domain} {task_id:#x} {at_ns}"));
            Ok(())
        }
    }

    #[test]
    fn test_task_spans_execution() {
        let mut sink = InstrumentationSink::new(RecordingApi::default(), "gpu");
        sink.handle_sample(&sample("K", 150, 400), &TimingStats::first(250))
            .expect("handle");

        assert_eq!(
            sink.api().calls,
            vec!["begin gpu 0x100 0 150", "end gpu 0x100 400"]
        );
    }

    #[test]
    fn test_names_created_once() {
        let mut sink = InstrumentationSink::new(RecordingApi::default(), "gpu");
        let stats = TimingStats::first(1);
        for tag in ["A", "B", "A", "A", "B"] {
            sink.handle_sample(&sample(tag, 1, 2), &stats).expect("handle");
        }

        assert_eq!(sink.api().created, vec!["A", "B"]);
        assert!(sink.api().calls[4].starts_with("begin gpu 0x100 0"));
    }

    #[test]
    fn test_backend_error_propagates() {
        let api = RecordingApi {
            fail_begin: true,
            ..Default::default()
        };
        let mut sink = InstrumentationSink::new(api, "gpu");
        assert!(sink
            .handle_sample(&sample("K", 1, 2), &TimingStats::first(1))
            .is_err());
        assert!(sink.api().calls.is_empty());
    }

    #[test]
    fn test_tracing_backend_interns_names() {
        let mut api = TracingInstrumentation::new();
        let a = api.create_name("A");
        let b = api.create_name("B");
        assert_ne!(a, b);
        assert_eq!(api.lookup(b), "B");
        assert_eq!(api.lookup(NameId(9)), "<unknown>");
    }

    #[test]
    fn test_tracing_backend_buffers_until_taken() {
        let mut sink = InstrumentationSink::new(TracingInstrumentation::new(), "gpu");
        sink.handle_sample(&sample("K", 150, 400), &TimingStats::first(250))
            .expect("handle");

        let mut logs = Vec::new();
        sink.take_logs(&mut logs);
        assert_eq!(
            logs,
            vec![
                SinkLog::TaskBegin {
                    domain: "gpu".to_string(),
                    task_id: 0x100,
                    task: "K".to_string(),
                    at_ns: 150,
                },
                SinkLog::TaskEnd {
                    domain: "gpu".to_string(),
                    task_id: 0x100,
                    at_ns: 400,
                },
            ]
        );

        let mut again = Vec::new();
        sink.take_logs(&mut again);
        assert!(again.is_empty());
    }
}
