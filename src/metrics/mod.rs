//! Interval sampling, reporting and convergence for a single run.
//!
//! The [`MetricsAggregator`] owns a sampling task that wakes every `interval`,
//! drains every registered [`Timer`] into one interval sample, folds it into the
//! run totals, reports it and appends a [`ConvergenceSample`]. Callers wait on
//! those samples with [`MetricsAggregator::wait_until_converges`].
//!
//! Cancellation is distinct from stopping: a cancelled run stops reporting
//! and must be treated as a total failure by whoever started it.
pub mod convergence;
pub mod log;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

pub use convergence::{Convergence, ConvergenceCriteria, ConvergenceSample};
use self::log::{LogEntry, LogSender};

use crate::{
    error::Result,
    report::{IntervalReport, LatencySummary, Reporter, RunResult},
    timer::{IntervalSample, Timer, TimerHandle, new_histogram},
};

#[derive(Debug, Clone, Copy)]
pub struct MetricsConfig {
    pub interval: Duration,
    pub threads: usize,
    /// Trailing window for uncertainty. `None` uses the whole run.
    pub window: Option<usize>,
}

/// Where interval histograms go, if anywhere.
#[derive(Debug, Clone)]
pub struct LogSinks {
    pub response: Option<LogSender>,
    pub service: Option<LogSender>,
    /// Instant the log offsets are measured from.
    pub base: Instant,
}

impl LogSinks {
    pub fn none() -> Self {
        Self {
            response: None,
            service: None,
            base: Instant::now(),
        }
    }
}

#[derive(Debug)]
struct Totals {
    response: Histogram<u64>,
    service: Histogram<u64>,
    operations: u64,
    partitions: u64,
    rows: u64,
    started: Instant,
    last_sample: Instant,
}

struct Shared {
    config: MetricsConfig,
    timers: Mutex<Vec<TimerHandle>>,
    totals: Mutex<Totals>,
    samples: Mutex<Vec<ConvergenceSample>>,
    cancelled: AtomicBool,
    /// Bumped on every new sample and on cancellation.
    updates: watch::Sender<u64>,
    reporter: Arc<dyn Reporter>,
    logs: LogSinks,
}

impl Shared {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) -> bool {
        let first = !self.cancelled.swap(true, Ordering::AcqRel);
        if first {
            tracing::warn!("Run cancelled");
            self.updates.send_modify(|n| *n += 1);
        }
        first
    }

    fn push_sample(&self, sample: ConvergenceSample) -> Option<f64> {
        let uncertainty = {
            let mut samples = self.samples.lock();
            samples.push(sample);
            self.criteria_window(&samples)
        };
        self.updates.send_modify(|n| *n += 1);
        uncertainty
    }

    fn criteria_window(&self, samples: &[ConvergenceSample]) -> Option<f64> {
        ConvergenceCriteria {
            target_uncertainty: 0.0,
            min_samples: 0,
            max_samples: usize::MAX,
            window: self.config.window,
        }
        .uncertainty(samples)
    }

    /// Drains all timers into one interval ending at `now`. The closing flush
    /// of a run reports the partial interval but does not feed convergence.
    fn sample(&self, now: Instant, closing: bool) -> Result<()> {
        let mut interval = IntervalSample::new()?;
        for timer in self.timers.lock().iter() {
            timer.snapshot_and_reset(&mut interval)?;
        }

        let (from, length, total_ops, elapsed) = {
            let mut totals = self.totals.lock();
            let from = totals.last_sample;
            totals.last_sample = now;
            totals.response.add(&interval.response).map_err(histogram_error)?;
            totals.service.add(&interval.service).map_err(histogram_error)?;
            totals.operations += interval.operations;
            totals.partitions += interval.partitions;
            totals.rows += interval.rows;
            (
                from,
                now.saturating_duration_since(from),
                totals.operations,
                now.saturating_duration_since(totals.started),
            )
        };

        if closing && length.is_zero() {
            return Ok(());
        }

        let secs = length.as_secs_f64();
        let rate = |n: u64| if secs > 0.0 { n as f64 / secs } else { 0.0 };
        let op_rate = rate(interval.operations);

        let stderr = if closing {
            self.criteria_window(&self.samples.lock())
        } else {
            self.push_sample(ConvergenceSample {
                at: elapsed,
                op_rate,
            })
        };

        self.reporter.interval(&IntervalReport {
            total_ops,
            op_rate,
            partition_rate: rate(interval.partitions),
            row_rate: rate(interval.rows),
            latency: LatencySummary::from_nanos(&interval.response),
            elapsed: elapsed.as_secs_f64(),
            stderr,
        });

        let start = from.saturating_duration_since(self.logs.base);
        for (sink, histogram) in [
            (&self.logs.response, interval.response),
            (&self.logs.service, interval.service),
        ] {
            if let Some(sink) = sink {
                let entry = LogEntry {
                    start,
                    length,
                    histogram,
                };
                if let Err(e) = sink.write(entry) {
                    tracing::warn!("Dropping interval histogram: {e}");
                }
            }
        }
        Ok(())
    }
}

fn histogram_error(e: impl std::fmt::Debug) -> crate::Error {
    crate::Error::Histogram(format!("{e:?}"))
}

/// Lets workers abort the run they belong to.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    /// Marks the run as cancelled. Returns `true` for the first call only.
    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

pub struct MetricsAggregator {
    shared: Arc<Shared>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<Result<()>>>,
}

impl MetricsAggregator {
    pub fn new(config: MetricsConfig, reporter: Arc<dyn Reporter>, logs: LogSinks) -> Result<Self> {
        let now = Instant::now();
        let (updates, _) = watch::channel(0);
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                timers: Mutex::new(Vec::with_capacity(config.threads)),
                totals: Mutex::new(Totals {
                    response: new_histogram()?,
                    service: new_histogram()?,
                    operations: 0,
                    partitions: 0,
                    rows: 0,
                    started: now,
                    last_sample: now,
                }),
                samples: Mutex::new(vec![]),
                cancelled: AtomicBool::new(false),
                updates,
                reporter,
                logs,
            }),
            stop_tx,
            task: None,
        })
    }

    /// Creates a timer whose samples this aggregator will collect.
    pub fn new_timer(&self, worker: usize, pending_capacity: usize) -> Result<Timer> {
        let timer = Timer::new(worker, pending_capacity)?;
        self.shared.timers.lock().push(timer.handle());
        Ok(timer)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Starts the clock and the sampling task.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        let now = Instant::now();
        {
            let mut totals = self.shared.totals.lock();
            totals.started = now;
            totals.last_sample = now;
        }
        self.shared.reporter.interval_header();

        let shared = Arc::clone(&self.shared);
        let stop = self.stop_tx.subscribe();
        self.task = Some(tokio::spawn(sampling_task(shared, stop, now)));
    }

    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }

    pub fn was_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Resolves once the run is cancelled.
    pub async fn cancelled(&self) {
        let mut updates = self.shared.updates.subscribe();
        while !self.shared.is_cancelled() {
            if updates.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn samples(&self) -> Vec<ConvergenceSample> {
        self.shared.samples.lock().clone()
    }

    /// Waits until the relative standard error of the interval throughput is
    /// below `target_uncertainty` after at least `min_samples` intervals, or
    /// until `max_samples` intervals have passed, or until cancelled.
    pub async fn wait_until_converges(
        &self,
        target_uncertainty: f64,
        min_samples: usize,
        max_samples: usize,
    ) -> Convergence {
        let criteria = ConvergenceCriteria {
            target_uncertainty,
            min_samples,
            max_samples,
            window: self.shared.config.window,
        };

        let mut updates = self.shared.updates.subscribe();
        let mut checked = 0;
        loop {
            if self.shared.is_cancelled() {
                return Convergence::Cancelled;
            }
            // every prefix is judged, so coalesced wakeups cannot skip a sample
            let verdict = {
                let samples = self.shared.samples.lock();
                let mut verdict = None;
                while verdict.is_none() && checked < samples.len() {
                    checked += 1;
                    verdict = criteria.evaluate(&samples[..checked]);
                }
                verdict
            };
            if let Some(v) = verdict {
                tracing::debug!("Convergence wait ended: {v:?}");
                return v;
            }
            if updates.changed().await.is_err() {
                return Convergence::Cancelled;
            }
        }
    }

    /// Flushes the last partial interval and ends the sampling task.
    pub async fn stop(&mut self) -> Result<()> {
        let _ = self.stop_tx.send(true);
        match self.task.take() {
            Some(task) => task.await?,
            None => Ok(()),
        }
    }

    /// Totals for the whole run.
    pub fn summarise(&self) -> RunResult {
        let totals = self.shared.totals.lock();
        let samples = self.shared.samples.lock();
        let elapsed = totals.last_sample.saturating_duration_since(totals.started);
        let secs = elapsed.as_secs_f64();
        let rate = |n: u64| if secs > 0.0 { n as f64 / secs } else { 0.0 };
        RunResult {
            threads: self.shared.config.threads,
            total_ops: totals.operations,
            total_partitions: totals.partitions,
            total_rows: totals.rows,
            elapsed,
            op_rate: rate(totals.operations),
            partition_rate: rate(totals.partitions),
            row_rate: rate(totals.rows),
            response: LatencySummary::from_nanos(&totals.response),
            service: LatencySummary::from_nanos(&totals.service),
            intervals: samples.len(),
            uncertainty: self.shared.criteria_window(&samples),
            success: !self.shared.is_cancelled(),
        }
    }
}

async fn sampling_task(
    shared: Arc<Shared>,
    mut stop: watch::Receiver<bool>,
    started: Instant,
) -> Result<()> {
    let period = shared.config.interval;
    let mut ticker = tokio::time::interval_at(started + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::debug!("Sampling every {period:?}");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if shared.is_cancelled() {
                    break;
                }
                shared.sample(Instant::now(), false)?;
            }
            _ = stop.wait_for(|s| *s) => {
                if !shared.is_cancelled() {
                    shared.sample(Instant::now(), true)?;
                }
                break;
            }
        }
    }
    tracing::debug!("Sampling task finished");
    Ok(())
}
