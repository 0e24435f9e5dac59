use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::{Sample, SampleSink};
use crate::config::ChromeTraceConfig;
use crate::driver::{DeviceId, QueueId};
use crate::stats::TimingStats;

/// Name of the metadata record carrying the trace epoch.
pub const START_TIME_METADATA: &str = "cltiming_start_time";

/// One record in the Chrome trace event format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub ph: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cat: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dur: Option<f64>,
    pub pid: u32,
    pub tid: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
}

impl TraceEvent {
    fn metadata(name: &str, pid: u32, tid: i64, args: serde_json::Value) -> Self {
        Self {
            ph: "M".to_string(),
            name: name.to_string(),
            cat: None,
            ts: None,
            dur: None,
            pid,
            tid,
            args: Some(args),
        }
    }

    pub fn is_metadata(&self) -> bool {
        self.ph == "M"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TrackKey {
    Queue(DeviceId, QueueId),
    Kernel(String),
}

/// Accumulates device samples as Chrome trace events and writes them as a
/// JSON array on flush.
///
/// Every queue (or every kernel name, in per-kernel mode) gets its own
/// track, numbered in order of first appearance and shown with a negative
/// thread id so device tracks sort apart from host threads. Timestamps are
/// microseconds since the sink was created.
pub struct ChromeTraceSink {
    path: PathBuf,
    per_kernel: bool,
    in_stages: bool,
    pid: u32,
    origin_ns: u64,
    tracks: HashMap<TrackKey, u32>,
    events: Vec<TraceEvent>,
}

impl ChromeTraceSink {
    /// Create a sink whose timeline starts at host time `origin_ns`, which
    /// corresponds to `start_time_us` microseconds since the Unix epoch.
    pub fn new(cfg: &ChromeTraceConfig, origin_ns: u64, start_time_us: u64) -> Self {
        let pid = std::process::id();
        let process_name = cfg.process_name.clone().unwrap_or_else(default_process_name);

        let events = vec![
            TraceEvent::metadata("process_name", pid, 0, json!({ "name": process_name })),
            TraceEvent::metadata(
                START_TIME_METADATA,
                pid,
                0,
                json!({ "start_time": start_time_us }),
            ),
        ];

        Self {
            path: cfg.file.clone(),
            per_kernel: cfg.per_kernel,
            in_stages: cfg.in_stages,
            pid,
            origin_ns,
            tracks: HashMap::new(),
            events,
        }
    }

    /// Events accumulated so far, metadata included.
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Track number for a sample, registering the track on first use.
    fn track_for(&mut self, sample: &Sample<'_>) -> u32 {
        let key = if self.per_kernel {
            TrackKey::Kernel(sample.tag.to_string())
        } else {
            TrackKey::Queue(sample.device, sample.queue)
        };

        if let Some(track) = self.tracks.get(&key) {
            return *track;
        }

        let track = self.tracks.len() as u32 + 1;
        let label = match &key {
            TrackKey::Queue(device, queue) => format!("Queue {:#x} on {device}", queue.0),
            TrackKey::Kernel(tag) => tag.clone(),
        };
        let tid = -i64::from(track);
        self.events.push(TraceEvent::metadata(
            "thread_name",
            self.pid,
            tid,
            json!({ "name": label }),
        ));
        self.events.push(TraceEvent::metadata(
            "thread_sort_index",
            self.pid,
            tid,
            json!({ "sort_index": track }),
        ));
        self.tracks.insert(key, track);
        track
    }

    /// Samples anchored before the origin land at negative times.
    fn micros_since_origin(&self, ns: u64) -> f64 {
        (i128::from(ns) - i128::from(self.origin_ns)) as f64 / 1_000.0
    }

    fn complete_event(
        &self,
        name: String,
        cat: &str,
        tid: i64,
        (from_ns, to_ns): (u64, u64),
        sample: &Sample<'_>,
    ) -> TraceEvent {
        TraceEvent {
            ph: "X".to_string(),
            name,
            cat: Some(cat.to_string()),
            ts: Some(self.micros_since_origin(from_ns)),
            dur: Some(to_ns.saturating_sub(from_ns) as f64 / 1_000.0),
            pid: self.pid,
            tid,
            args: Some(json!({
                "id": sample.sequence,
                "anchor": sample.anchor.as_str(),
            })),
        }
    }

    /// Serialize the accumulated events as a JSON array, one event per line.
    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_all(b"[\n")?;
        for (i, event) in self.events.iter().enumerate() {
            if i > 0 {
                out.write_all(b",\n")?;
            }
            serde_json::to_writer(&mut *out, event)?;
        }
        out.write_all(b"\n]\n")?;
        Ok(())
    }
}

impl SampleSink for ChromeTraceSink {
    fn name(&self) -> &str {
        "chrome_trace"
    }

    fn handle_sample(&mut self, sample: &Sample<'_>, _stats: &TimingStats) -> Result<()> {
        let tid = -i64::from(self.track_for(sample));

        if self.in_stages {
            let stages = [
                ("Queued", sample.queued_ns, sample.submitted_ns),
                ("Submitted", sample.submitted_ns, sample.started_ns),
                ("Execution", sample.started_ns, sample.ended_ns),
            ];
            for (stage, from, to) in stages {
                let name = format!("{} ({stage})", sample.tag);
                let event = self.complete_event(name, stage, tid, (from, to), sample);
                self.events.push(event);
            }
        } else {
            let event = self.complete_event(
                sample.tag.to_string(),
                "Device",
                tid,
                (sample.started_ns, sample.ended_ns),
                sample,
            );
            self.events.push(event);
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let file = File::create(&self.path)
            .with_context(|| format!("creating trace file {}", self.path.display()))?;
        let mut out = BufWriter::new(file);
        self.write_to(&mut out)
            .with_context(|| format!("writing trace file {}", self.path.display()))?;
        out.flush()
            .with_context(|| format!("flushing trace file {}", self.path.display()))?;

        info!(
            path = %self.path.display(),
            events = self.events.len(),
            "wrote chrome trace"
        );
        Ok(())
    }
}

fn default_process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "cltiming".to_string())
}
