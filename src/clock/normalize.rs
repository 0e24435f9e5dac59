use crate::driver::DeviceCounters;

/// Which reference point a sample's timestamps were hung from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// Device counters mapped through the per-sample clock offset.
    Profiling,
    /// Host clock reading captured when the command was issued.
    Estimate,
}

impl Anchor {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Profiling => "profiling",
            Self::Estimate => "estimate",
        }
    }
}

/// Device counters mapped onto the host timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedTimes {
    pub queued: u64,
    pub submitted: u64,
    pub started: u64,
    pub ended: u64,
    pub anchor: Anchor,
}

/// Map raw device counters onto the host timeline.
///
/// The queued anchor is the profiling-derived host time when an offset is
/// available and it lands within `drift_threshold_ns` of the issue-time
/// host reading; otherwise the issue-time reading itself. Submitted,
/// started and ended keep their device-reported distance from queued.
/// `ended` never precedes `started`.
pub fn normalize(
    raw: &DeviceCounters,
    issue_host_ns: u64,
    offset_ns: Option<i64>,
    drift_threshold_ns: u64,
) -> NormalizedTimes {
    let estimate = i128::from(issue_host_ns);

    let (anchor, kind) = match offset_ns {
        Some(offset) => {
            let profiled = i128::from(raw.queued) + i128::from(offset);
            let drift = (profiled - estimate).unsigned_abs();
            if drift < u128::from(drift_threshold_ns) {
                (profiled, Anchor::Profiling)
            } else {
                (estimate, Anchor::Estimate)
            }
        }
        None => (estimate, Anchor::Estimate),
    };

    let at = |raw_ts: u64| -> u64 {
        let delta = i128::from(raw_ts) - i128::from(raw.queued);
        clamp_u64(anchor + delta)
    };

    let started = at(raw.started);
    let ended = at(raw.ended).max(started);

    NormalizedTimes {
        queued: clamp_u64(anchor),
        submitted: at(raw.submitted),
        started,
        ended,
        anchor: kind,
    }
}

fn clamp_u64(v: i128) -> u64 {
    v.clamp(0, i128::from(u64::MAX)) as u64
}
