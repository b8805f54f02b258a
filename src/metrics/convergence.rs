//! Stopping rules over interval throughput samples.
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Throughput observed over one reporting interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceSample {
    /// End of the interval, relative to the run start.
    pub at: Duration,
    pub op_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceCriteria {
    pub target_uncertainty: f64,
    pub min_samples: usize,
    pub max_samples: usize,
    /// Trailing window length. `None` uses every sample.
    pub window: Option<usize>,
}

/// Why a wait for convergence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    /// Uncertainty fell below target after this many samples.
    Converged { samples: usize },
    /// `max_samples` reached first.
    Exhausted { samples: usize },
    Cancelled,
}

/// Relative standard error of the mean: `(stddev / sqrt(n)) / mean`.
///
/// `None` for fewer than two values or a non-positive mean.
pub fn relative_standard_error(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let nf = n as f64;
    let mean = values.iter().sum::<f64>() / nf;
    if !(mean > 0.0) {
        return None;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (nf - 1.0);
    Some((variance / nf).sqrt() / mean)
}

impl ConvergenceCriteria {
    /// The samples the uncertainty is computed over.
    pub fn window<'a>(&self, samples: &'a [ConvergenceSample]) -> &'a [ConvergenceSample] {
        match self.window {
            Some(w) if w < samples.len() => &samples[samples.len() - w..],
            _ => samples,
        }
    }

    pub fn uncertainty(&self, samples: &[ConvergenceSample]) -> Option<f64> {
        let rates: Vec<f64> = self.window(samples).iter().map(|s| s.op_rate).collect();
        relative_standard_error(&rates)
    }

    /// Evaluates the first `samples.len()` samples. `None` means keep waiting.
    pub fn evaluate(&self, samples: &[ConvergenceSample]) -> Option<Convergence> {
        let n = samples.len();
        if n >= self.min_samples {
            if let Some(u) = self.uncertainty(samples) {
                if u < self.target_uncertainty {
                    return Some(Convergence::Converged { samples: n });
                }
            }
        }
        if n >= self.max_samples {
            return Some(Convergence::Exhausted { samples: n });
        }
        None
    }
}
