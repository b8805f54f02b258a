use std::{io::Write, sync::Arc, time::SystemTime};

use tokio::time::Instant;
use typed_builder::TypedBuilder;

use crate::{
    config::{StopCondition, StressConfig, ThreadMode},
    error::Result,
    executor::{RunPlan, run},
    metrics::{
        LogSinks,
        log::{HistogramLog, RESPONSE_TIME_COMMENT, SERVICE_TIME_COMMENT},
    },
    operation::{Client, OperationFactory},
    report::{Reporter, RunResult, SearchSummary, SilentReporter, StdoutReporter},
    search::{SearchPlan, run_multi},
};

const UNCERTAINTY_WARNING: &str = "WARNING: uncertainty mode (err<) results in uneven workload \
     between thread runs, so should be used for high level analysis only";

/// What a successful stress action produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StressResult {
    Run(RunResult),
    Search(SearchSummary),
}

/// A complete benchmark: optional warmup, a pause, then either one run or an
/// adaptive thread-count search, ending with `END` or `FAILURE`.
///
/// # Example
/// ```rust,no_run
/// use pacebench::{BoxError, Client, Operation, Outcome, Stress, StressConfig, StopCondition};
///
/// struct Noop;
///
/// impl Client<u64> for Noop {
///     async fn execute(&self, _: &Operation<u64>) -> Result<Outcome, BoxError> {
///         Ok(Outcome::new(1, 1))
///     }
/// }
///
/// # async fn demo() -> pacebench::Result<()> {
/// Stress::builder()
///     .config(StressConfig::builder().stop(StopCondition::Count(1_000)).build())
///     .factory(|i: u64| i)
///     .client(Noop)
///     .build()
///     .run()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(TypedBuilder)]
pub struct Stress<F, C>
where
    F: OperationFactory,
    C: Client<F::Payload>,
{
    #[builder(default)]
    pub config: StressConfig,
    pub factory: F,
    pub client: C,
    #[builder(default = Arc::new(StdoutReporter) as Arc<dyn Reporter>)]
    pub reporter: Arc<dyn Reporter>,
    /// Destination of the response-time interval log.
    #[builder(default, setter(strip_option))]
    pub response_log: Option<Box<dyn Write + Send>>,
    /// Destination of the service-time interval log.
    #[builder(default, setter(strip_option))]
    pub service_log: Option<Box<dyn Write + Send>>,
}

impl<F, C> Stress<F, C>
where
    F: OperationFactory,
    C: Client<F::Payload>,
{
    pub async fn run(self) -> Result<StressResult> {
        let reporter = Arc::clone(&self.reporter);
        let result = self.execute().await;
        if let Err(e) = &result {
            tracing::error!("Stress action failed: {e}");
        }
        reporter.outcome(result.is_ok());
        result
    }

    async fn execute(self) -> Result<StressResult> {
        let Self {
            config,
            factory,
            client,
            reporter,
            response_log,
            service_log,
        } = self;
        config.validate()?;
        let factory = Arc::new(factory);
        let client = Arc::new(client);

        if let Some(warmup) = config.warmup {
            reporter.message(&format!(
                "Warming up {} with {} iterations...",
                factory.describe(),
                warmup.iterations
            ));
            let plan = RunPlan::warmup(&config, warmup);
            let silent: Arc<dyn Reporter> = Arc::new(SilentReporter);
            if let Err(e) = run(&plan, factory.clone(), client.clone(), silent, LogSinks::none()).await
            {
                tracing::warn!("Warmup failed, continuing: {e}");
            }
        }

        let pause = config.pause_before_measure;
        if !pause.is_zero() {
            reporter.message(&format!("Sleeping {}s...", pause.as_secs()));
            tokio::time::sleep(pause).await;
        }

        // one base time for both logs and every trial
        let base = Instant::now();
        let wall = SystemTime::now();
        let response = response_log
            .map(|w| HistogramLog::open(w, RESPONSE_TIME_COMMENT, wall))
            .transpose()?;
        let service = service_log
            .map(|w| HistogramLog::open(w, SERVICE_TIME_COMMENT, wall))
            .transpose()?;
        let logs = LogSinks {
            response: response.as_ref().map(HistogramLog::sender),
            service: service.as_ref().map(HistogramLog::sender),
            base,
        };

        let outcome = match SearchPlan::new(&config) {
            None => {
                let threads = match config.threads {
                    ThreadMode::Fixed(n) => n,
                    ThreadMode::Range { min, .. } => min,
                };
                let plan = RunPlan::new(&config, threads);
                run(&plan, factory, client, Arc::clone(&reporter), logs)
                    .await
                    .map(StressResult::Run)
            }
            Some(search) => {
                if matches!(config.stop, StopCondition::Uncertainty { .. }) {
                    reporter.message(UNCERTAINTY_WARNING);
                }
                let summary = run_multi(&search, reporter.as_ref(), |threads| {
                    let plan = RunPlan::new(&config, threads);
                    let factory = Arc::clone(&factory);
                    let client = Arc::clone(&client);
                    let reporter = Arc::clone(&reporter);
                    let logs = logs.clone();
                    async move { run(&plan, factory, client, reporter, logs).await }
                })
                .await;
                // the logs only close once every sender is gone
                drop(logs);
                summary.map(StressResult::Search)
            }
        };

        for log in [response, service].into_iter().flatten() {
            if let Err(e) = log.close().await {
                tracing::warn!("Failed to close histogram log: {e}");
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BoxError, Error,
        operation::{Operation, Outcome},
        report::testing::Recording,
    };

    struct Noop;

    impl Client<u64> for Noop {
        async fn execute(&self, _: &Operation<u64>) -> std::result::Result<Outcome, BoxError> {
            tokio::task::yield_now().await;
            Ok(Outcome::new(1, 1))
        }
    }

    #[tokio::test]
    async fn invalid_config_reports_failure() {
        let reporter = Arc::new(Recording::default());
        let result = Stress::builder()
            .config(StressConfig::builder().threads(ThreadMode::Fixed(0)).build())
            .factory(|i: u64| i)
            .client(Noop)
            .reporter(reporter.clone())
            .build()
            .run()
            .await;

        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(*reporter.outcomes.lock(), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn announces_warmup_and_pause() {
        let reporter = Arc::new(Recording::default());
        let config = StressConfig::builder()
            .threads(ThreadMode::Fixed(2))
            .stop(StopCondition::Count(10))
            .warmup(Some(crate::config::Warmup {
                iterations: 100,
                threads: 4,
            }))
            .build();
        let result = Stress::builder()
            .config(config)
            .factory(|i: u64| i)
            .client(Noop)
            .reporter(reporter.clone())
            .build()
            .run()
            .await
            .unwrap();

        let StressResult::Run(run) = result else {
            panic!("expected a single run");
        };
        // warmup operations are not part of the measured run
        assert_eq!(run.total_ops, 10);

        let messages = reporter.messages.lock();
        assert!(messages[0].starts_with("Warming up"));
        assert!(messages[0].ends_with("with 100 iterations..."));
        assert_eq!(messages[1], "Sleeping 2s...");
        assert_eq!(*reporter.outcomes.lock(), vec![true]);
        assert_eq!(reporter.summaries.lock().len(), 1);
    }
}
