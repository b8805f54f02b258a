//! Pacebench: an open-loop load generator for database benchmarks.
//!
//! Pacebench issues operations on a pre-planned schedule instead of waiting
//! for the previous one to finish, so a slow response never suppresses the
//! requests that should have followed it. Every operation carries the time it
//! *should* have started, and latency is measured from there (coordinated
//! omission free). Service time, measured from the actual dispatch, is kept
//! alongside for comparison.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`WorkManager`]: hands out operation indices, either a fixed count or
//!   continuously until stopped.
//! - [`Pacer`]: releases one worker's share of the target rate, catching up
//!   after a stall at no more than a bounded multiple of that rate.
//! - [`Timer`]: records response and service time into HDR histograms and
//!   hands complete intervals to the aggregator.
//! - [`executor`]: workers and the single-run orchestration around them.
//! - [`metrics`]: the interval aggregator, its convergence check and the
//!   HdrHistogram interval logs.
//! - [`search`]: the adaptive thread-count search over successive runs.
//! - [`Reporter`]: receives interval lines, summaries and the final
//!   `END`/`FAILURE` marker.
//! - [`Stress`]: glues it all together from a [`StressConfig`].
//!
//! The benchmarked system stays behind two traits: an [`OperationFactory`]
//! building the payload for each index and a [`Client`] executing it. Any
//! client error fails the whole run, since a tainted run would misrepresent
//! what the target can sustain.
//!
//! # Feature flags
//! - `internals`: expose the worker type and other unstable execution helpers
//!
//! # Where to start
//!
//! Implement [`Client`] for your driver, pick a [`StressConfig`] and call
//! [`Stress::run`]. The `in_memory` demo shows the whole flow.

/// Configuration types
pub mod config;
/// Crate error type
pub mod error;
/// Worker loops and single-run orchestration
pub mod executor;
/// Interval aggregation, convergence and histogram logs
pub mod metrics;
/// Operation descriptors and the seams to the system under test
pub mod operation;
/// Per-worker rate control
pub mod pacer;
/// Reports and Reporters
pub mod report;
/// Adaptive thread-count search
pub mod search;
/// The top-level benchmark action
pub mod stress;
/// Latency recording
pub mod timer;
/// Shared work accounting
pub mod work;

pub use config::{StopCondition, StressConfig, ThreadMode, Warmup};
pub use error::{BoxError, Error, Result};
pub use operation::{Client, FnFactory, Operation, OperationFactory, Outcome};
pub use pacer::Pacer;
pub use report::{JsonReporter, Reporter, SilentReporter, StdoutReporter};
pub use stress::{Stress, StressResult};
pub use timer::Timer;
pub use work::WorkManager;
