use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::info;

use crate::sink::chrome::START_TIME_METADATA;

/// One Chrome trace loaded for combining.
#[derive(Debug, Clone)]
pub struct LoadedTrace {
    pub path: PathBuf,
    /// Trace epoch in microseconds since the Unix epoch.
    pub start_time_us: u64,
    pub events: Vec<Value>,
}

/// Read a trace file and its start-time metadata.
pub fn load_trace(path: &Path) -> Result<LoadedTrace> {
    let file = File::open(path).with_context(|| format!("opening trace {}", path.display()))?;
    let parsed: Value = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing trace {}", path.display()))?;

    let events = match parsed {
        Value::Array(events) => events,
        Value::Object(mut obj) => match obj.remove("traceEvents") {
            Some(Value::Array(events)) => events,
            _ => bail!("trace {} has no traceEvents array", path.display()),
        },
        _ => bail!("trace {} is not a JSON array", path.display()),
    };

    let Some(start_time_us) = events.iter().find_map(start_time_of) else {
        bail!("start_time not found in trace {}", path.display());
    };

    Ok(LoadedTrace {
        path: path.to_path_buf(),
        start_time_us,
        events,
    })
}

fn start_time_of(event: &Value) -> Option<u64> {
    if event.get("ph")?.as_str()? != "M" || event.get("name")?.as_str()? != START_TIME_METADATA {
        return None;
    }
    match event.get("args")?.get("start_time")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Merge several traces onto the earliest trace's epoch.
///
/// Each trace's timestamps are shifted by the distance between its own
/// start time and the common epoch, and its start-time metadata is
/// rewritten to the epoch. With `filters`, only metadata and events whose
/// name contains one of the filters are kept.
pub fn combine_traces(traces: &[LoadedTrace], filters: &[String]) -> Result<Vec<Value>> {
    if traces.len() < 2 {
        bail!("at least two traces are required, got {}", traces.len());
    }

    let epoch = traces
        .iter()
        .map(|t| t.start_time_us)
        .min()
        .unwrap_or_default();

    let mut combined = Vec::new();
    for trace in traces {
        let shift = (trace.start_time_us - epoch) as f64;
        for event in &trace.events {
            if !keep_event(event, filters) {
                continue;
            }
            combined.push(rebase_event(event.clone(), shift, epoch));
        }
    }
    Ok(combined)
}

fn keep_event(event: &Value, filters: &[String]) -> bool {
    if filters.is_empty() || event.get("ph").and_then(Value::as_str) == Some("M") {
        return true;
    }
    let name = event.get("name").and_then(Value::as_str).unwrap_or_default();
    filters.iter().any(|f| name.contains(f.as_str()))
}

fn rebase_event(mut event: Value, shift_us: f64, epoch: u64) -> Value {
    if start_time_of(&event).is_some() {
        event["args"]["start_time"] = Value::from(epoch);
        return event;
    }
    if let Some(ts) = event.get("ts").and_then(Value::as_f64) {
        let shifted = ts + shift_us;
        event["ts"] = serde_json::Number::from_f64(shifted)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    event
}

/// Load, merge and write the combined trace to `output`.
pub fn combine_files(inputs: &[PathBuf], filters: &[String], output: &Path) -> Result<usize> {
    let traces = inputs
        .iter()
        .map(|p| load_trace(p))
        .collect::<Result<Vec<_>>>()?;
    let combined = combine_traces(&traces, filters)?;

    let file =
        File::create(output).with_context(|| format!("creating output {}", output.display()))?;
    let mut out = BufWriter::new(file);
    out.write_all(b"[\n")?;
    for (i, event) in combined.iter().enumerate() {
        if i > 0 {
            out.write_all(b",\n")?;
        }
        serde_json::to_writer(&mut out, event)?;
    }
    out.write_all(b"\n]\n")?;
    out.flush()
        .with_context(|| format!("writing output {}", output.display()))?;

    info!(
        inputs = inputs.len(),
        events = combined.len(),
        output = %output.display(),
        "combined traces"
    );
    Ok(combined.len())
}
