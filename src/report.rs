use std::time::Duration;

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

/// Latency distribution summary, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub mean: f64,
    pub median: f64,
    pub p95: f64,
    pub p99: f64,
    pub p999: f64,
    pub max: f64,
}

impl LatencySummary {
    /// Summarises a histogram of nanosecond values.
    pub fn from_nanos(histogram: &Histogram<u64>) -> Self {
        if histogram.is_empty() {
            return Self::default();
        }
        let ms = |ns: u64| ns as f64 / 1_000_000.0;
        Self {
            mean: histogram.mean() / 1_000_000.0,
            median: ms(histogram.value_at_quantile(0.5)),
            p95: ms(histogram.value_at_quantile(0.95)),
            p99: ms(histogram.value_at_quantile(0.99)),
            p999: ms(histogram.value_at_quantile(0.999)),
            max: ms(histogram.max()),
        }
    }
}

/// One line of live progress, produced every reporting interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalReport {
    /// Operations completed since the run started.
    pub total_ops: u64,
    pub op_rate: f64,
    pub partition_rate: f64,
    pub row_rate: f64,
    /// Response time over this interval.
    pub latency: LatencySummary,
    /// Seconds since the run started.
    pub elapsed: f64,
    /// Relative standard error of the mean op rate so far.
    pub stderr: Option<f64>,
}

/// Summary of one completed run. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub threads: usize,
    pub total_ops: u64,
    pub total_partitions: u64,
    pub total_rows: u64,
    pub elapsed: Duration,
    pub op_rate: f64,
    pub partition_rate: f64,
    pub row_rate: f64,
    /// Completion minus intended start.
    pub response: LatencySummary,
    /// Completion minus actual dispatch.
    pub service: LatencySummary,
    pub intervals: usize,
    pub uncertainty: Option<f64>,
    pub success: bool,
}

/// Every trial of an adaptive search, ordered by thread count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSummary {
    pub trials: Vec<RunResult>,
}

impl SearchSummary {
    pub fn new(mut trials: Vec<RunResult>) -> Self {
        trials.sort_by_key(|t| t.threads);
        Self { trials }
    }

    /// Trial with the highest op rate.
    pub fn best(&self) -> Option<&RunResult> {
        self.trials
            .iter()
            .max_by(|a, b| a.op_rate.total_cmp(&b.op_rate))
    }
}

/// Sink for everything a stress action tells its user.
///
/// All methods default to doing nothing, so a reporter only overrides what it
/// cares about. Reporters are shared between the aggregator and the
/// orchestrator and must be cheap to call.
///
/// # Example
/// ```rust
/// use pacebench::{Reporter, report::IntervalReport};
///
/// struct OpRateOnly;
///
/// impl Reporter for OpRateOnly {
///     fn interval(&self, report: &IntervalReport) {
///         println!("{:.0} op/s", report.op_rate);
///     }
/// }
/// ```
pub trait Reporter: Send + Sync {
    fn message(&self, _line: &str) {}

    /// Called once per run, before its first interval.
    fn interval_header(&self) {}

    fn interval(&self, _report: &IntervalReport) {}

    fn summary(&self, _result: &RunResult) {}

    fn search_summary(&self, _summary: &SearchSummary) {}

    /// Terminal marker. A failed action never reports a summary.
    fn outcome(&self, _success: bool) {}
}

/// Discards everything. Used for warmup.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentReporter;

impl Reporter for SilentReporter {}

/// Column-formatted console output.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutReporter;

const COLUMNS: [&str; 12] = [
    "total ops", "op/s", "pk/s", "row/s", "mean", "med", ".95", ".99", ".999", "max", "time",
    "stderr",
];

impl StdoutReporter {
    fn format_interval(report: &IntervalReport) -> String {
        let l = &report.latency;
        let stderr = report
            .stderr
            .map(|e| format!("{e:.5}"))
            .unwrap_or_else(|| "0.00000".to_string());
        format!(
            "{:>10},{:>8.0},{:>8.0},{:>8.0},{:>8.1},{:>8.1},{:>8.1},{:>8.1},{:>8.1},{:>8.1},{:>7.1},{:>8}",
            report.total_ops,
            report.op_rate,
            report.partition_rate,
            report.row_rate,
            l.mean,
            l.median,
            l.p95,
            l.p99,
            l.p999,
            l.max,
            report.elapsed,
            stderr,
        )
    }

    fn format_summary(result: &RunResult) -> Vec<String> {
        let r = &result.response;
        let secs = result.elapsed.as_secs();
        vec![
            "Results:".to_string(),
            format!("op rate                   : {:.0}", result.op_rate),
            format!("partition rate            : {:.0}", result.partition_rate),
            format!("row rate                  : {:.0}", result.row_rate),
            format!("latency mean              : {:.1} ms", r.mean),
            format!("latency median            : {:.1} ms", r.median),
            format!("latency 95th percentile   : {:.1} ms", r.p95),
            format!("latency 99th percentile   : {:.1} ms", r.p99),
            format!("latency 99.9th percentile : {:.1} ms", r.p999),
            format!("latency max               : {:.1} ms", r.max),
            format!("total operations          : {}", result.total_ops),
            format!(
                "total operation time      : {:02}:{:02}:{:02}",
                secs / 3600,
                (secs / 60) % 60,
                secs % 60
            ),
        ]
    }
}

impl Reporter for StdoutReporter {
    fn message(&self, line: &str) {
        println!("{line}");
    }

    fn interval_header(&self) {
        println!(
            "{:>10},{:>8},{:>8},{:>8},{:>8},{:>8},{:>8},{:>8},{:>8},{:>8},{:>7},{:>8}",
            COLUMNS[0],
            COLUMNS[1],
            COLUMNS[2],
            COLUMNS[3],
            COLUMNS[4],
            COLUMNS[5],
            COLUMNS[6],
            COLUMNS[7],
            COLUMNS[8],
            COLUMNS[9],
            COLUMNS[10],
            COLUMNS[11],
        );
    }

    fn interval(&self, report: &IntervalReport) {
        println!("{}", Self::format_interval(report));
    }

    fn summary(&self, result: &RunResult) {
        println!();
        for line in Self::format_summary(result) {
            println!("{line}");
        }
        println!();
    }

    fn search_summary(&self, summary: &SearchSummary) {
        println!(
            "{:>8},{:>10},{:>10},{:>10},{:>8},{:>8},{:>8},{:>8},{:>8},{:>8}",
            "threads", "op/s", "pk/s", "row/s", "mean", "med", ".95", ".99", ".999", "max"
        );
        for t in &summary.trials {
            let r = &t.response;
            println!(
                "{:>8},{:>10.0},{:>10.0},{:>10.0},{:>8.1},{:>8.1},{:>8.1},{:>8.1},{:>8.1},{:>8.1}",
                t.threads,
                t.op_rate,
                t.partition_rate,
                t.row_rate,
                r.mean,
                r.median,
                r.p95,
                r.p99,
                r.p999,
                r.max
            );
        }
    }

    fn outcome(&self, success: bool) {
        println!("{}", if success { "END" } else { "FAILURE" });
    }
}

/// One JSON object per line, keyed by event kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonReporter;

impl JsonReporter {
    fn emit(&self, kind: &str, value: impl Serialize) {
        match serde_json::to_value(value) {
            Ok(value) => {
                let mut event = serde_json::Map::new();
                event.insert(kind.to_string(), value);
                println!("{}", serde_json::Value::Object(event));
            }
            Err(e) => tracing::warn!("Failed to serialize {kind} event: {e}"),
        }
    }
}

impl Reporter for JsonReporter {
    fn message(&self, line: &str) {
        self.emit("message", line);
    }

    fn interval(&self, report: &IntervalReport) {
        self.emit("interval", report);
    }

    fn summary(&self, result: &RunResult) {
        self.emit("summary", result);
    }

    fn search_summary(&self, summary: &SearchSummary) {
        self.emit("search", summary);
    }

    fn outcome(&self, success: bool) {
        self.emit("outcome", if success { "END" } else { "FAILURE" });
    }
}

/// Records every event, for assertions in tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    pub struct Recording {
        pub messages: Mutex<Vec<String>>,
        pub intervals: Mutex<Vec<IntervalReport>>,
        pub summaries: Mutex<Vec<RunResult>>,
        pub searches: Mutex<Vec<SearchSummary>>,
        pub outcomes: Mutex<Vec<bool>>,
    }

    pub fn result(threads: usize, op_rate: f64) -> RunResult {
        RunResult {
            threads,
            total_ops: 0,
            total_partitions: 0,
            total_rows: 0,
            elapsed: Duration::from_secs(1),
            op_rate,
            partition_rate: op_rate,
            row_rate: op_rate,
            response: LatencySummary::default(),
            service: LatencySummary::default(),
            intervals: 1,
            uncertainty: None,
            success: true,
        }
    }

    impl Reporter for Recording {
        fn message(&self, line: &str) {
            self.messages.lock().push(line.to_string());
        }
        fn interval(&self, report: &IntervalReport) {
            self.intervals.lock().push(report.clone());
        }
        fn summary(&self, result: &RunResult) {
            self.summaries.lock().push(result.clone());
        }
        fn search_summary(&self, summary: &SearchSummary) {
            self.searches.lock().push(summary.clone());
        }
        fn outcome(&self, success: bool) {
            self.outcomes.lock().push(success);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{testing::result, *};

    #[test]
    fn latency_summary_in_millis() {
        let mut h = Histogram::<u64>::new(3).unwrap();
        for ms in 1..=100u64 {
            h.record(ms * 1_000_000).unwrap();
        }
        let s = LatencySummary::from_nanos(&h);
        assert!((s.median - 50.0).abs() < 0.1);
        assert!((s.p95 - 95.0).abs() < 0.1);
        assert!((s.max - 100.0).abs() < 0.1);
        assert!((s.mean - 50.5).abs() < 0.1);
    }

    #[test]
    fn empty_histogram_summarises_to_zero() {
        let h = Histogram::<u64>::new(3).unwrap();
        assert_eq!(LatencySummary::from_nanos(&h), LatencySummary::default());
    }

    #[test]
    fn search_summary_orders_by_threads() {
        let summary = SearchSummary::new(vec![result(8, 10.0), result(1, 5.0), result(4, 12.0)]);
        let threads: Vec<_> = summary.trials.iter().map(|t| t.threads).collect();
        assert_eq!(threads, vec![1, 4, 8]);
        assert_eq!(summary.best().map(|b| b.threads), Some(4));
    }

    #[test]
    fn interval_line_has_every_column() {
        let line = StdoutReporter::format_interval(&IntervalReport {
            total_ops: 1234,
            op_rate: 100.0,
            partition_rate: 100.0,
            row_rate: 300.0,
            latency: LatencySummary::default(),
            elapsed: 1.0,
            stderr: Some(0.01),
        });
        assert_eq!(line.split(',').count(), COLUMNS.len());
        assert!(line.trim_start().starts_with("1234,"));
    }

    #[test]
    fn summary_reports_total_time() {
        let mut r = result(4, 1000.0);
        r.elapsed = Duration::from_secs(3723);
        let lines = StdoutReporter::format_summary(&r);
        assert_eq!(lines.last().unwrap(), "total operation time      : 01:02:03");
    }
}
