use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    pacer::{DEFAULT_CATCH_UP_MULTIPLE, UNLIMITED_RATE},
    timer::DEFAULT_PENDING_CAPACITY,
};

/// How many workers to run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadMode {
    /// A single run with exactly this many workers.
    Fixed(usize),
    /// Successive runs growing the thread count from `min` up to `max`.
    /// With `auto`, the search also stops once throughput plateaus.
    Range { min: usize, max: usize, auto: bool },
}

/// When a run ends.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCondition {
    /// After exactly this many operations.
    Count(u64),
    /// After this much wall-clock time.
    Duration(Duration),
    /// Once the relative standard error of the interval throughput drops
    /// below `target`, measured over at least `min_samples` intervals and at
    /// most `max_samples`.
    Uncertainty {
        target: f64,
        min_samples: usize,
        max_samples: usize,
    },
}

impl StopCondition {
    pub(crate) fn describe(&self) -> String {
        match self {
            StopCondition::Count(n) => format!("for {n} iterations"),
            StopCondition::Duration(d) => format!("for {d:?}"),
            StopCondition::Uncertainty { target, .. } => {
                format!("until stderr of mean < {target}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Warmup {
    pub iterations: u64,
    pub threads: usize,
}

impl Default for Warmup {
    fn default() -> Self {
        Self {
            iterations: 50_000,
            threads: 20,
        }
    }
}

/// Full configuration of a stress action.
///
/// Every field has a default, so `StressConfig::builder().build()` is a valid
/// uncertainty-bounded run on one worker per CPU.
#[derive(Debug, Clone, PartialEq, TypedBuilder, Serialize, Deserialize)]
#[serde(default)]
pub struct StressConfig {
    #[builder(default = ThreadMode::Fixed(num_cpus::get()))]
    pub threads: ThreadMode,
    /// Global target rate in operations per second. `None` means unlimited.
    #[builder(default, setter(strip_option))]
    pub rate: Option<f64>,
    #[builder(default = DEFAULT_CATCH_UP_MULTIPLE)]
    pub catch_up_multiple: f64,
    #[builder(default = StopCondition::Uncertainty { target: 0.02, min_samples: 30, max_samples: 200 })]
    pub stop: StopCondition,
    /// Trailing window for the convergence check. `None` uses every sample of
    /// the run.
    #[builder(default, setter(strip_option))]
    pub convergence_window: Option<usize>,
    /// Reporting and sampling interval.
    #[builder(default = Duration::from_secs(1))]
    pub interval: Duration,
    #[builder(default = Some(Warmup::default()))]
    pub warmup: Option<Warmup>,
    #[builder(default = Duration::from_secs(2))]
    pub pause_before_measure: Duration,
    /// Whether operations mutate the target. Enables the settle delay between
    /// search trials.
    #[builder(default)]
    pub mutating: bool,
    #[builder(default = Duration::from_secs(15))]
    pub settle_delay: Duration,
    /// Minimum mean improvement over the last 3 trials to keep searching.
    #[builder(default = 0.0)]
    pub improvement_floor: f64,
    /// Minimum mean improvement over the last 5 trials to keep searching.
    #[builder(default = 0.02)]
    pub target_uncertainty: f64,
    #[builder(default = DEFAULT_PENDING_CAPACITY)]
    pub pending_capacity: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl StressConfig {
    pub fn validate(&self) -> Result<()> {
        match self.threads {
            ThreadMode::Fixed(0) => return invalid("thread count must be positive"),
            ThreadMode::Range { min, max, .. } if min == 0 || min > max => {
                return invalid(format!("invalid thread range {min}..={max}"));
            }
            _ => {}
        }
        if let Some(rate) = self.rate {
            if !(rate.is_finite() && rate > 0.0) {
                return invalid(format!("rate must be positive, got {rate}"));
            }
        }
        if !(self.catch_up_multiple.is_finite() && self.catch_up_multiple >= 1.0) {
            return invalid(format!(
                "catch-up multiple must be at least 1, got {}",
                self.catch_up_multiple
            ));
        }
        if self.interval.is_zero() {
            return invalid("interval must be non-zero");
        }
        if self.convergence_window == Some(0) {
            return invalid("convergence window must be non-zero");
        }
        match self.stop {
            StopCondition::Duration(d) if d.is_zero() => return invalid("duration must be non-zero"),
            StopCondition::Uncertainty {
                target,
                min_samples,
                max_samples,
            } => {
                if !(target > 0.0) {
                    return invalid(format!("target uncertainty must be positive, got {target}"));
                }
                if min_samples == 0 || min_samples > max_samples {
                    return invalid(format!(
                        "invalid sample bounds {min_samples}..={max_samples}"
                    ));
                }
            }
            _ => {}
        }
        if let Some(warmup) = self.warmup {
            if warmup.threads == 0 {
                return invalid("warmup thread count must be positive");
            }
        }
        Ok(())
    }

    /// Target rate in operations per second, unlimited when unset.
    pub fn effective_rate(&self) -> f64 {
        self.rate.unwrap_or(UNLIMITED_RATE)
    }
}

fn invalid<T>(msg: impl Into<String>) -> Result<T> {
    Err(Error::Config(msg.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = StressConfig::default();
        config.validate().unwrap();
        assert_eq!(config.catch_up_multiple, 3.0);
        assert_eq!(config.effective_rate(), UNLIMITED_RATE);
        assert_eq!(config.warmup, Some(Warmup::default()));
    }

    #[test]
    fn rejects_bad_thread_range() {
        let config = StressConfig::builder()
            .threads(ThreadMode::Range {
                min: 8,
                max: 4,
                auto: true,
            })
            .build();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_inverted_sample_bounds() {
        let config = StressConfig::builder()
            .stop(StopCondition::Uncertainty {
                target: 0.02,
                min_samples: 10,
                max_samples: 5,
            })
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_positive_rate() {
        let config = StressConfig::builder().rate(0.0).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: StressConfig = serde_json::from_str(
            r#"{ "threads": { "range": { "min": 1, "max": 64, "auto": true } }, "rate": 5000.0, "mutating": true }"#,
        )
        .unwrap();
        assert_eq!(
            config.threads,
            ThreadMode::Range {
                min: 1,
                max: 64,
                auto: true
            }
        );
        assert_eq!(config.rate, Some(5000.0));
        assert!(config.mutating);
        assert_eq!(config.settle_delay, Duration::from_secs(15));
        config.validate().unwrap();
    }
}
