//! Adaptive thread-count search.
//!
//! Trials run at growing thread counts (doubling below 16, then ×1.5) until
//! the count passes `max`, or in automatic mode until throughput plateaus.
//! The plateau check is a pure function of the trial history: the mean
//! relative improvement over the last 3 trials is at most the floor AND the
//! mean over the last 5 is below the target uncertainty.
use std::{future::Future, time::Duration};

use crate::{
    config::{StressConfig, ThreadMode},
    error::{Error, Result},
    report::{Reporter, RunResult, SearchSummary},
};

/// Thread count at which growth switches from doubling to ×1.5.
const DOUBLING_LIMIT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchPlan {
    pub min_threads: usize,
    pub max_threads: usize,
    /// Stop early on a throughput plateau.
    pub auto: bool,
    pub improvement_floor: f64,
    pub target_uncertainty: f64,
    /// Pause between trials, for mutating workloads.
    pub settle_delay: Option<Duration>,
}

impl SearchPlan {
    /// `None` unless the config asks for a thread range.
    pub fn new(config: &StressConfig) -> Option<Self> {
        match config.threads {
            ThreadMode::Fixed(_) => None,
            ThreadMode::Range { min, max, auto } => Some(Self {
                min_threads: min,
                max_threads: max,
                auto,
                improvement_floor: config.improvement_floor,
                target_uncertainty: config.target_uncertainty,
                settle_delay: config.mutating.then_some(config.settle_delay),
            }),
        }
    }
}

pub fn next_thread_count(threads: usize) -> usize {
    if threads < DOUBLING_LIMIT {
        threads * 2
    } else {
        (threads as f64 * 1.5) as usize
    }
}

/// Mean relative improvement of the last `count` trials over their
/// predecessors. `None` without `count + 1` trials or with a zero rate.
pub fn average_improvement(rates: &[f64], count: usize) -> Option<f64> {
    if count == 0 || rates.len() < count + 1 {
        return None;
    }
    let tail = &rates[rates.len() - count - 1..];
    let mut total = 0.0;
    for pair in tail.windows(2) {
        let (prev, cur) = (pair[0], pair[1]);
        if !(prev > 0.0) {
            return None;
        }
        total += (cur - prev) / prev;
    }
    Some(total / count as f64)
}

pub fn has_plateaued(rates: &[f64], improvement_floor: f64, target_uncertainty: f64) -> bool {
    match (average_improvement(rates, 3), average_improvement(rates, 5)) {
        (Some(short), Some(long)) => short <= improvement_floor && long < target_uncertainty,
        _ => false,
    }
}

/// Runs trials through `trial` until the plan says stop.
///
/// A failed trial aborts the whole search; earlier trials are not reported as
/// a partial success.
pub async fn run_multi<T, Fut>(
    plan: &SearchPlan,
    reporter: &dyn Reporter,
    mut trial: T,
) -> Result<SearchSummary>
where
    T: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<RunResult>>,
{
    let mut threads = plan.min_threads;
    let mut prev = None;
    let mut results: Vec<RunResult> = vec![];

    loop {
        reporter.message(&format!("Running with {threads} threads"));
        let result = trial(threads).await.map_err(|e| {
            tracing::error!("Trial with {threads} threads failed: {e}");
            Error::Trial {
                threads,
                source: Box::new(e),
            }
        })?;
        results.push(result);

        let rates: Vec<f64> = results.iter().map(|r| r.op_rate).collect();
        if let (Some(p), Some(improvement)) = (prev, average_improvement(&rates, 1)) {
            reporter.message(&format!(
                "Improvement over {p} threads: {:.0}%",
                100.0 * improvement
            ));
        }

        prev = Some(threads);
        threads = next_thread_count(threads);
        if threads > plan.max_threads {
            tracing::info!("Next thread count {threads} exceeds {}", plan.max_threads);
            break;
        }

        if let Some(delay) = plan.settle_delay {
            reporter.message(&format!("Sleeping for {}s", delay.as_secs()));
            tokio::time::sleep(delay).await;
        }

        if plan.auto
            && has_plateaued(&rates, plan.improvement_floor, plan.target_uncertainty)
        {
            tracing::info!("Throughput plateaued after {} trials", results.len());
            break;
        }
    }

    let summary = SearchSummary::new(results);
    reporter.search_summary(&summary);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::testing::{Recording, result};

    fn plan(min: usize, max: usize, auto: bool) -> SearchPlan {
        SearchPlan {
            min_threads: min,
            max_threads: max,
            auto,
            improvement_floor: 0.0,
            target_uncertainty: 0.02,
            settle_delay: None,
        }
    }

    #[test]
    fn thread_growth_doubles_then_scales() {
        let mut n = 1;
        let mut seen = vec![n];
        while n < 100 {
            n = next_thread_count(n);
            seen.push(n);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 24, 36, 54, 81, 121]);
    }

    #[test]
    fn improvement_over_trailing_trials() {
        let rates = [100.0, 200.0, 300.0];
        assert_eq!(average_improvement(&rates, 1), Some(0.5));
        assert_eq!(average_improvement(&rates, 2), Some(0.75));
        assert_eq!(average_improvement(&rates, 3), None);
        assert_eq!(average_improvement(&[0.0, 10.0], 1), None);
    }

    #[test]
    fn plateau_needs_both_windows() {
        // flat over the last 3, but the last 5 still include the jump
        assert!(!has_plateaued(&[10.0, 100.0, 100.0, 100.0, 100.0, 100.0], 0.0, 0.02));
        assert!(has_plateaued(&[10.0, 100.0, 100.0, 100.0, 100.0, 100.0, 100.0], 0.0, 0.02));
        assert!(!has_plateaued(&[100.0, 100.0, 100.0, 100.0, 110.0, 120.0, 130.0], 0.0, 0.02));
        assert!(!has_plateaued(&[100.0, 100.0, 100.0], 0.0, 0.02));
    }

    #[tokio::test]
    async fn stops_at_the_thread_cap_with_every_trial_recorded() {
        let rates = [
            (1, 100.0),
            (2, 195.0),
            (4, 220.0),
            (8, 225.0),
            (16, 226.0),
            (24, 226.2),
        ];
        let reporter = Recording::default();
        let mut asked = vec![];
        let summary = run_multi(&plan(1, 24, true), &reporter, |threads| {
            asked.push(threads);
            let rate = rates.iter().find(|(t, _)| *t == threads).map(|(_, r)| *r);
            async move { Ok(result(threads, rate.unwrap_or(0.0))) }
        })
        .await
        .unwrap();

        assert_eq!(asked, vec![1, 2, 4, 8, 16, 24]);
        let threads: Vec<_> = summary.trials.iter().map(|t| t.threads).collect();
        assert_eq!(threads, vec![1, 2, 4, 8, 16, 24]);
        assert_eq!(reporter.searches.lock().len(), 1);

        let messages = reporter.messages.lock();
        assert!(messages.contains(&"Improvement over 1 threads: 95%".to_string()));
        assert!(messages.contains(&"Running with 24 threads".to_string()));
    }

    #[tokio::test]
    async fn slowing_growth_is_not_yet_a_plateau() {
        let rates = [100.0, 195.0, 220.0, 225.0, 226.0, 226.2];
        let short = average_improvement(&rates, 3).unwrap();
        assert!((short - 0.00935).abs() < 1e-4, "{short}");
        assert!(!has_plateaued(&rates, 0.0, 0.02));

        // past 24 threads the rate stays flat, so the last 3 trials settle at 81
        let reporter = Recording::default();
        let summary = run_multi(&plan(1, 1024, true), &reporter, |threads| {
            let rate = [1, 2, 4, 8, 16]
                .iter()
                .position(|t| *t == threads)
                .map_or(226.2, |i| rates[i]);
            async move { Ok(result(threads, rate)) }
        })
        .await
        .unwrap();

        let threads: Vec<_> = summary.trials.iter().map(|t| t.threads).collect();
        assert_eq!(threads, vec![1, 2, 4, 8, 16, 24, 36, 54, 81]);
    }

    #[tokio::test]
    async fn auto_mode_stops_on_plateau() {
        let reporter = Recording::default();
        let summary = run_multi(&plan(1, 1024, true), &reporter, |threads| async move {
            let rate = if threads < 4 { 50.0 * threads as f64 } else { 200.0 };
            Ok(result(threads, rate))
        })
        .await
        .unwrap();

        // flat from 4 threads on; the 5-trial window clears the jump at 54
        let threads: Vec<_> = summary.trials.iter().map(|t| t.threads).collect();
        assert_eq!(threads, vec![1, 2, 4, 8, 16, 24, 36, 54]);
    }

    #[tokio::test]
    async fn failed_trial_aborts_the_search() {
        let reporter = Recording::default();
        let err = run_multi(&plan(1, 64, false), &reporter, |threads| async move {
            if threads == 4 {
                Err(Error::Cancelled)
            } else {
                Ok(result(threads, 10.0))
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Trial { threads: 4, .. }));
        assert!(reporter.searches.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn settle_delay_between_mutating_trials() {
        let reporter = Recording::default();
        let mut plan = plan(1, 4, false);
        plan.settle_delay = Some(Duration::from_secs(15));
        let started = tokio::time::Instant::now();

        run_multi(&plan, &reporter, |threads| async move { Ok(result(threads, 1.0)) })
            .await
            .unwrap();

        // settles after trials 1 and 2, not after the last
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(31));
        let sleeps = reporter
            .messages
            .lock()
            .iter()
            .filter(|m| *m == "Sleeping for 15s")
            .count();
        assert_eq!(sleeps, 2);
    }
}
