//! Per-worker latency capture.
//!
//! Each worker owns a [`Timer`]. It records two latencies per operation into
//! HDR histograms:
//!
//! - **response time**: completion minus the *intended* start handed out by
//!   the pacer. This is the coordinated-omission-free figure.
//! - **service time**: completion minus the actual dispatch.
//!
//! The aggregator holds a [`TimerHandle`] to the same interval state and
//! drains it with [`TimerHandle::snapshot_and_reset`]. Both sides go through
//! one short critical section so a sample lands in exactly one interval.
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{
    error::{Error, Result},
    operation::Outcome,
};

/// Significant decimal digits kept by every latency histogram.
pub const SIGNIFICANT_DIGITS: u8 = 3;

/// Default bound on operations registered but not yet completed.
pub const DEFAULT_PENDING_CAPACITY: usize = 64;

/// Values recorded during one reporting interval. Latencies are in nanoseconds.
#[derive(Debug, Clone)]
pub struct IntervalSample {
    pub response: Histogram<u64>,
    pub service: Histogram<u64>,
    pub operations: u64,
    pub partitions: u64,
    pub rows: u64,
}

impl IntervalSample {
    pub fn new() -> Result<Self> {
        Ok(Self {
            response: new_histogram()?,
            service: new_histogram()?,
            operations: 0,
            partitions: 0,
            rows: 0,
        })
    }

    pub fn record(&mut self, response: Duration, service: Duration, outcome: Outcome) {
        self.response.saturating_record(as_nanos(response));
        self.service.saturating_record(as_nanos(service));
        self.operations += 1;
        self.partitions += outcome.partitions;
        self.rows += outcome.rows;
    }

    pub fn merge(&mut self, other: &IntervalSample) -> Result<()> {
        self.response.add(&other.response).map_err(histogram_error)?;
        self.service.add(&other.service).map_err(histogram_error)?;
        self.operations += other.operations;
        self.partitions += other.partitions;
        self.rows += other.rows;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.response.reset();
        self.service.reset();
        self.operations = 0;
        self.partitions = 0;
        self.rows = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.operations == 0
    }
}

pub(crate) fn new_histogram() -> Result<Histogram<u64>> {
    Histogram::new(SIGNIFICANT_DIGITS).map_err(histogram_error)
}

fn histogram_error(e: impl std::fmt::Debug) -> Error {
    Error::Histogram(format!("{e:?}"))
}

fn as_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[derive(Debug)]
struct Shared {
    interval: Mutex<IntervalSample>,
    closed: AtomicBool,
}

/// Worker-side recorder.
#[derive(Debug)]
pub struct Timer {
    worker: usize,
    pending: VecDeque<Instant>,
    capacity: usize,
    dispatched_at: Option<Instant>,
    shared: Arc<Shared>,
}

impl Timer {
    pub fn new(worker: usize, capacity: usize) -> Result<Self> {
        let capacity = capacity.max(1);
        Ok(Self {
            worker,
            pending: VecDeque::with_capacity(capacity),
            capacity,
            dispatched_at: None,
            shared: Arc::new(Shared {
                interval: Mutex::new(IntervalSample::new()?),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    /// A handle the aggregator uses to drain this timer.
    pub fn handle(&self) -> TimerHandle {
        TimerHandle {
            worker: self.worker,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Registers the scheduled start of the next operation.
    pub fn expected_start(&mut self, at: Instant) -> Result<()> {
        if self.pending.len() >= self.capacity {
            return Err(Error::TimerBacklog {
                capacity: self.capacity,
            });
        }
        self.pending.push_back(at);
        Ok(())
    }

    /// Marks the oldest pending operation as dispatched.
    pub fn start(&mut self, at: Instant) {
        self.dispatched_at = Some(at);
    }

    /// Completes the oldest pending operation, returning its
    /// `(response, service)` times.
    pub fn stop(&mut self, at: Instant, outcome: Outcome) -> Result<(Duration, Duration)> {
        let intended = self.pending.pop_front().ok_or(Error::TimerUnderflow)?;
        let dispatched = self.dispatched_at.take().unwrap_or(intended);
        let response = at.saturating_duration_since(intended);
        let service = at.saturating_duration_since(dispatched);
        self.record(response, service, outcome);
        Ok((response, service))
    }

    pub fn record(&mut self, response: Duration, service: Duration, outcome: Outcome) {
        self.shared
            .interval
            .lock()
            .record(response, service, outcome);
    }

    /// Operations registered but not yet completed.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Marks the timer as finished. Samples already recorded stay available to
    /// the aggregator until drained.
    pub fn close(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Aggregator-side view of a [`Timer`].
#[derive(Debug, Clone)]
pub struct TimerHandle {
    worker: usize,
    shared: Arc<Shared>,
}

impl TimerHandle {
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Moves everything recorded since the previous call into `target` and
    /// leaves the timer's interval empty.
    pub fn snapshot_and_reset(&self, target: &mut IntervalSample) -> Result<()> {
        let mut interval = self.shared.interval.lock();
        target.merge(&interval)?;
        interval.reset();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}
