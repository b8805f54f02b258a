use std::{sync::Arc, time::Duration};

use futures::future::join_all;

use crate::{
    config::{StopCondition, StressConfig, Warmup},
    error::{Error, Result},
    metrics::{Convergence, LogSinks, MetricsAggregator, MetricsConfig},
    operation::{Client, OperationFactory},
    pacer::{Pacer, UNLIMITED_RATE},
    report::{Reporter, RunResult},
    work::WorkManager,
};

use super::worker::{Worker, WorkerState};

/// Everything a single run needs to know.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunPlan {
    pub threads: usize,
    /// Global target rate in operations per second, split evenly across
    /// workers.
    pub rate: f64,
    pub catch_up_multiple: f64,
    pub stop: StopCondition,
    pub interval: Duration,
    pub window: Option<usize>,
    pub pending_capacity: usize,
}

impl RunPlan {
    pub fn new(config: &StressConfig, threads: usize) -> Self {
        Self {
            threads,
            rate: config.effective_rate(),
            catch_up_multiple: config.catch_up_multiple,
            stop: config.stop,
            interval: config.interval,
            window: config.convergence_window,
            pending_capacity: config.pending_capacity,
        }
    }

    /// Unlimited-rate fixed-count run used to warm the target up.
    pub fn warmup(config: &StressConfig, warmup: Warmup) -> Self {
        Self {
            threads: warmup.threads,
            rate: UNLIMITED_RATE,
            stop: StopCondition::Count(warmup.iterations),
            ..Self::new(config, warmup.threads)
        }
    }

    fn per_worker_rate(&self) -> f64 {
        self.rate / self.threads.max(1) as f64
    }
}

/// Runs `plan.threads` workers until the plan's stop condition is met.
///
/// Success requires every worker to finish cleanly and the run not to be
/// cancelled. A failed run reports nothing beyond its intervals and returns
/// the first worker error.
pub async fn run<F, C>(
    plan: &RunPlan,
    factory: Arc<F>,
    client: Arc<C>,
    reporter: Arc<dyn Reporter>,
    logs: LogSinks,
) -> Result<RunResult>
where
    F: OperationFactory,
    C: Client<F::Payload>,
{
    let work = Arc::new(match plan.stop {
        StopCondition::Count(n) => WorkManager::fixed(n),
        _ => WorkManager::continuous(),
    });
    let mut metrics = MetricsAggregator::new(
        MetricsConfig {
            interval: plan.interval,
            threads: plan.threads,
            window: plan.window,
        },
        Arc::clone(&reporter),
        logs,
    )?;

    let banner = format!(
        "Running {} with {} threads {}",
        factory.describe(),
        plan.threads,
        plan.stop.describe()
    );
    tracing::info!("{banner}");
    reporter.message(&banner);

    let rate = plan.per_worker_rate();
    let mut workers = Vec::with_capacity(plan.threads);
    for id in 0..plan.threads {
        workers.push(Worker::new(
            id,
            Pacer::new(rate, plan.catch_up_multiple),
            metrics.new_timer(id, plan.pending_capacity)?,
            Arc::clone(&work),
            Arc::clone(&factory),
            Arc::clone(&client),
            metrics.cancel_handle(),
        ));
    }

    tracing::info!("Spawning {} workers...", plan.threads);
    metrics.start();
    let handles: Vec<_> = workers
        .into_iter()
        .map(|w| tokio::spawn(w.run()))
        .collect();

    match plan.stop {
        // workers end on their own once the count is exhausted
        StopCondition::Count(_) => {}
        StopCondition::Duration(d) => {
            tokio::select! {
                _ = tokio::time::sleep(d) => {}
                _ = metrics.cancelled() => {}
            }
        }
        StopCondition::Uncertainty {
            target,
            min_samples,
            max_samples,
        } => match metrics
            .wait_until_converges(target, min_samples, max_samples)
            .await
        {
            Convergence::Converged { samples } => {
                tracing::info!("Converged after {samples} intervals");
            }
            Convergence::Exhausted { samples } => {
                tracing::info!("Stopping after {samples} intervals without converging");
            }
            Convergence::Cancelled => {}
        },
    }

    tracing::info!("Stopping workers...");
    work.stop();
    let mut failure = None;
    for joined in join_all(handles).await {
        match joined {
            Ok(report) if report.state == WorkerState::Failed => {
                tracing::debug!(
                    "Worker {} failed after {} operations",
                    report.worker,
                    report.completed
                );
                if failure.is_none() {
                    failure = report.error;
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("Worker panicked with error: {e}");
                metrics.cancel();
                if failure.is_none() {
                    failure = Some(Error::Join(e));
                }
            }
        }
    }
    metrics.stop().await?;

    if let Some(e) = failure {
        return Err(e);
    }
    if metrics.was_cancelled() {
        return Err(Error::Cancelled);
    }

    let result = metrics.summarise();
    reporter.summary(&result);
    Ok(result)
}
