use std::fmt::Write as _;

use super::ScopeReport;

const NAME_HEADER: &str = "Function Name";

/// Render one scope's statistics as a comma-separated text table.
///
/// Empty scopes render nothing.
pub fn render_scope(out: &mut String, heading: &str, report: &ScopeReport) {
    if report.is_empty() {
        return;
    }

    let width = report
        .entries
        .iter()
        .map(|(tag, _)| tag.len())
        .max()
        .unwrap_or(0)
        .max(NAME_HEADER.len());

    // Writing into a String cannot fail.
    let _ = writeln!(out, "{heading}:");
    let _ = writeln!(out);
    let _ = writeln!(out, "Total Time (ns): {}", report.total_ns);
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{NAME_HEADER:>width$}, {:>6}, {:>13}, {:>8}, {:>13}, {:>13}, {:>13}",
        "Calls", "Time (ns)", "Time (%)", "Average (ns)", "Min (ns)", "Max (ns)",
    );

    for (tag, stats) in &report.entries {
        let _ = writeln!(
            out,
            "{tag:>width$}, {:>6}, {:>13}, {:>7.2}%, {:>13}, {:>13}, {:>13}",
            stats.count,
            stats.sum_ns,
            report.percent_of_total(stats),
            stats.average_ns(),
            stats.min_ns,
            stats.max_ns,
        );
    }
    let _ = writeln!(out);
}
