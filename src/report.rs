use crate::error::Result;
use crate::metrics::MetricsSnapshot;
use crate::stage::{Role, Stage};
use crate::tracker::{WorkerId, WorkerStats};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;
use tracing::info;

/// Default filename for the pipeline DOT graph.
pub const PIPELINE_GRAPH_FILE: &str = "pipeline.dot";

/// How the simulation results are presented once the pipeline drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Presentation {
    /// No output; used by tests
    #[default]
    None,
    /// Fixed-width tabular summary plus blocked-time histograms on stdout
    Console,
    /// DOT files: the pipeline graph and one histogram file per interior stage
    Graph,
}

/// Everything the reporters need to know about one stage, captured after the
/// pipeline has drained.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub name: String,
    pub role: Role,
    pub worker_count: usize,
    pub buffer_capacity: usize,
    pub metrics: MetricsSnapshot,
    pub blocked: BTreeMap<WorkerId, WorkerStats>,
}

/// Capture a report row for every stage, in pipeline order.
pub fn collect<T: Send + 'static>(stages: &[Stage<T>]) -> Vec<StageReport> {
    stages
        .iter()
        .map(|stage| StageReport {
            name: stage.name().to_owned(),
            role: stage.role(),
            worker_count: stage.config().worker_count,
            buffer_capacity: stage.config().buffer_capacity,
            metrics: stage.metrics().snapshot(),
            blocked: stage.tracker().snapshot(),
        })
        .collect()
}

pub(crate) fn render(reports: &[StageReport], choice: Presentation) -> Result<()> {
    match choice {
        Presentation::None => Ok(()),
        Presentation::Console => {
            print!("{}", render_table(reports));
            for report in reports.iter().filter(|r| r.role == Role::Interior) {
                print!("{}", render_blocked_histogram(report));
            }
            Ok(())
        }
        Presentation::Graph => {
            std::fs::write(PIPELINE_GRAPH_FILE, pipeline_dot(reports))?;
            info!(file = PIPELINE_GRAPH_FILE, "pipeline graph written");
            for report in reports.iter().filter(|r| r.role == Role::Interior) {
                let filename = format!("{}_blocked.dot", report.name);
                std::fs::write(&filename, blocked_histogram_dot(report))?;
                info!(file = %filename, "blocked-time histogram written");
            }
            Ok(())
        }
    }
}

/// Percentage deltas against the previous row, as display strings.
///
/// Deltas are suppressed (`-`) on the generator row, the sink row, and any
/// row adjacent to them: those stages count on different denominators and a
/// comparison would mislead.
fn compute_deltas(prev: Option<&StageReport>, curr: &StageReport) -> (String, String) {
    let mut proc_diff = "-".to_owned();
    let mut thru_diff = "-".to_owned();

    let prev = match prev {
        Some(prev) => prev,
        None => return (proc_diff, thru_diff),
    };
    if curr.role != Role::Interior || prev.role != Role::Interior {
        return (proc_diff, thru_diff);
    }

    if prev.metrics.processed_items > 0 {
        let diff = (curr.metrics.processed_items as f64 - prev.metrics.processed_items as f64)
            / prev.metrics.processed_items as f64
            * 100.0;
        proc_diff = format!("{diff:+.2}");
    }
    if prev.metrics.throughput > 0.0 {
        let diff =
            (curr.metrics.throughput - prev.metrics.throughput) / prev.metrics.throughput * 100.0;
        thru_diff = format!("{diff:+.2}");
    }

    (proc_diff, thru_diff)
}

/// Render the fixed-width console summary table.
pub fn render_table(reports: &[StageReport]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "\n{:<20} {:>12} {:>12} {:>12} {:>12} {:>12} {:>12} {:>12}",
        "Stage", "Processed", "Output", "Throughput", "Dropped", "Drop Rate %", "Proc Δ%", "Thru Δ%"
    );
    let _ = writeln!(out, "{}", "-".repeat(114));

    let mut prev: Option<&StageReport> = None;
    for report in reports {
        let (proc_diff, thru_diff) = compute_deltas(prev, report);
        let _ = writeln!(
            out,
            "{:<20} {:>12} {:>12} {:>12.2} {:>12} {:>12.2} {:>12} {:>12}",
            report.name,
            report.metrics.processed_items,
            report.metrics.output_items,
            report.metrics.throughput,
            report.metrics.dropped_items,
            report.metrics.drop_rate * 100.0,
            proc_diff,
            thru_diff,
        );
        prev = Some(report);
    }

    out
}

/// Render the pipeline graph in DOT notation: one box per stage colored by
/// role, one edge per adjacent pair.
pub fn pipeline_dot(reports: &[StageReport]) -> String {
    let mut out = String::new();
    out.push_str("digraph Pipeline {\n");
    out.push_str("  rankdir=LR;\n");
    out.push_str("  node [shape=box, style=filled, fontname=\"Arial\", fontsize=10];\n");
    out.push_str("  edge [fontname=\"Arial\", fontsize=8];\n\n");

    let mut prev: Option<&StageReport> = None;
    for (i, report) in reports.iter().enumerate() {
        let (proc_diff, thru_diff) = compute_deltas(prev, report);
        prev = Some(report);

        let color = match report.role {
            Role::Generator => "lightgreen",
            Role::Sink => "lightcoral",
            Role::Interior => "lightblue",
        };

        let label = format!(
            "{}\\nWorkers: {}\\nBuffer: {}\\nProcessed: {} ({})\\nDropped: {}\\nOutput: {}\\nThroughput: {:.2} ({})",
            report.name,
            report.worker_count,
            report.buffer_capacity,
            report.metrics.processed_items,
            proc_diff,
            report.metrics.dropped_items,
            report.metrics.output_items,
            report.metrics.throughput,
            thru_diff,
        );

        let _ = writeln!(
            out,
            "  stage_{i} [label=\"{label}\", style=filled, fillcolor={color}];"
        );
    }

    out.push('\n');
    for i in 0..reports.len().saturating_sub(1) {
        let _ = writeln!(out, "  stage_{} -> stage_{};", i, i + 1);
    }
    out.push_str("}\n");

    out
}

// Logarithmic buckets for the blocked-time histograms. A per-worker,
// per-site total lands in the first bucket whose bound exceeds it.
const BUCKETS: [(&str, Duration); 7] = [
    ("<10us", Duration::from_micros(10)),
    ("<100us", Duration::from_micros(100)),
    ("<1ms", Duration::from_millis(1)),
    ("<10ms", Duration::from_millis(10)),
    ("<100ms", Duration::from_millis(100)),
    ("<1s", Duration::from_secs(1)),
    (">=1s", Duration::MAX),
];

fn bucket_index(elapsed: Duration) -> usize {
    BUCKETS
        .iter()
        .position(|(_, bound)| elapsed < *bound)
        .unwrap_or(BUCKETS.len() - 1)
}

#[derive(Debug, Default)]
struct SiteSummary {
    workers: usize,
    total: Duration,
    max: Duration,
    buckets: [usize; BUCKETS.len()],
}

impl SiteSummary {
    fn mean(&self) -> Duration {
        if self.workers == 0 {
            Duration::ZERO
        } else {
            self.total / self.workers as u32
        }
    }
}

fn summarize_sites(blocked: &BTreeMap<WorkerId, WorkerStats>) -> BTreeMap<String, SiteSummary> {
    let mut sites: BTreeMap<String, SiteSummary> = BTreeMap::new();
    for stats in blocked.values() {
        for (site, elapsed) in &stats.by_site {
            let summary = sites.entry(site.clone()).or_default();
            summary.workers += 1;
            summary.total += *elapsed;
            summary.max = summary.max.max(*elapsed);
            summary.buckets[bucket_index(*elapsed)] += 1;
        }
    }
    sites
}

/// Render one stage's blocked-time histogram for the console: per site, a
/// distribution of per-worker blocked totals across logarithmic buckets.
pub fn render_blocked_histogram(report: &StageReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\nBlocked time: {}", report.name);

    let sites = summarize_sites(&report.blocked);
    if sites.is_empty() {
        let _ = writeln!(out, "  (no blocking recorded)");
        return out;
    }

    for (site, summary) in &sites {
        let _ = writeln!(
            out,
            "  {site}  workers={} total={:?} mean={:?} max={:?}",
            summary.workers,
            summary.total,
            summary.mean(),
            summary.max,
        );
        for (i, count) in summary.buckets.iter().enumerate() {
            if *count == 0 {
                continue;
            }
            let _ = writeln!(
                out,
                "    {:>7} {} {}",
                BUCKETS[i].0,
                "#".repeat((*count).min(50)),
                count
            );
        }
    }

    out
}

/// Render one stage's blocked-time histogram in DOT notation: a summary node
/// per site with one node per occupied bucket hanging off it.
pub fn blocked_histogram_dot(report: &StageReport) -> String {
    let mut out = String::new();
    out.push_str("digraph BlockedTime {\n");
    out.push_str("  rankdir=LR;\n");
    out.push_str("  node [shape=box, style=filled, fontname=\"Arial\", fontsize=10];\n");
    let _ = writeln!(out, "  label=\"{} blocked time\";\n", report.name);

    for (site_idx, (site, summary)) in summarize_sites(&report.blocked).iter().enumerate() {
        let _ = writeln!(
            out,
            "  site_{site_idx} [label=\"{}\\nworkers: {}\\ntotal: {:?}\\nmean: {:?}\\nmax: {:?}\", fillcolor=lightyellow];",
            site,
            summary.workers,
            summary.total,
            summary.mean(),
            summary.max,
        );
        for (i, count) in summary.buckets.iter().enumerate() {
            if *count == 0 {
                continue;
            }
            let _ = writeln!(
                out,
                "  site_{site_idx}_bucket_{i} [label=\"{}\\n{} workers\", fillcolor=white];",
                BUCKETS[i].0, count
            );
            let _ = writeln!(out, "  site_{site_idx} -> site_{site_idx}_bucket_{i};");
        }
    }

    out.push_str("}\n");
    out
}
