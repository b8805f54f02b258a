//! The machinery of a single run.
//!
//! A run spawns one tokio task per worker. Each worker owns a [`Pacer`]
//! releasing its share of the global target rate and a [`Timer`] recording
//! response and service time. All workers draw indices from one shared
//! [`WorkManager`]. The [`MetricsAggregator`] samples their timers on a fixed
//! interval while [`run`] waits for the stop condition:
//!
//! - `Count(n)`: the work manager hands out exactly `n` indices.
//! - `Duration(d)`: the orchestrator sleeps `d`, then stops the work.
//! - `Uncertainty { .. }`: the orchestrator waits for the aggregator to
//!   converge or to give up after `max_samples` intervals.
//!
//! Joining every worker handle is the completion barrier. The run succeeds
//! only if no worker failed and nothing cancelled it.
//!
//! [`Pacer`]: crate::Pacer
//! [`Timer`]: crate::Timer
//! [`WorkManager`]: crate::WorkManager
//! [`MetricsAggregator`]: crate::metrics::MetricsAggregator
mod run;
mod worker;

pub use run::{RunPlan, run};
pub use worker::WorkerState;

#[cfg(feature = "internals")]
pub use worker::{Worker, WorkerReport};
