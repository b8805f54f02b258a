//! Open-loop rate control for a single worker.
//!
//! A [`Pacer`] releases units at a fixed target rate measured from a reference
//! instant, so the intended start of unit `n` never depends on how long
//! previous units took. When the owner falls behind (a slow call, a scheduler
//! pause), the pacer does not release the whole backlog at once: it catches up
//! at no more than `catch_up_multiple` times the target rate, starting from the
//! moment it noticed it was late.
//!
//! ```text
//! expected(n) = initial_start + n / rate
//! catch_up(n) = catch_up_start + (n - n_at_catch_up_start) / (rate * multiple)
//! ```
use std::time::Duration;

use tokio::time::Instant;

/// Catch-up never exceeds this multiple of the target rate unless configured.
pub const DEFAULT_CATCH_UP_MULTIPLE: f64 = 3.0;

/// Rate used when no target rate is set. Large enough to never be the bottleneck.
pub const UNLIMITED_RATE: f64 = 100_000_000_000.0;

#[derive(Debug, Clone)]
pub struct Pacer {
    initial_start_time: Instant,
    throughput_per_nsec: f64,
    units_completed: u64,

    caught_up: bool,
    catch_up_start_time: Instant,
    units_completed_at_catch_up_start: u64,
    catch_up_throughput_per_nsec: f64,
}

impl Pacer {
    /// Creates a pacer releasing `units_per_sec` units per second.
    ///
    /// A non-finite or non-positive rate (or multiple) falls back to
    /// [`UNLIMITED_RATE`] (or [`DEFAULT_CATCH_UP_MULTIPLE`]).
    pub fn new(units_per_sec: f64, catch_up_rate_multiple: f64) -> Self {
        let rate = if units_per_sec.is_finite() && units_per_sec > 0.0 {
            units_per_sec
        } else {
            UNLIMITED_RATE
        };
        let multiple = if catch_up_rate_multiple.is_finite() && catch_up_rate_multiple > 0.0 {
            catch_up_rate_multiple
        } else {
            DEFAULT_CATCH_UP_MULTIPLE
        };
        let throughput_per_nsec = rate / 1_000_000_000.0;
        let now = Instant::now();
        Self {
            initial_start_time: now,
            throughput_per_nsec,
            units_completed: 0,
            caught_up: true,
            catch_up_start_time: now,
            units_completed_at_catch_up_start: 0,
            catch_up_throughput_per_nsec: throughput_per_nsec * multiple,
        }
    }

    /// Re-anchors the schedule. Called by the owning worker right before its
    /// first release so setup time is not counted as lateness.
    pub fn set_initial_start_time(&mut self, at: Instant) {
        self.initial_start_time = at;
        self.catch_up_start_time = at;
    }

    pub fn units_completed(&self) -> u64 {
        self.units_completed
    }

    /// Intended start of the next unit on the normal schedule.
    pub fn expected_start_time(&self) -> Instant {
        self.initial_start_time + units_to_duration(self.units_completed, self.throughput_per_nsec)
    }

    /// How long to wait before the next unit may be released.
    pub fn time_to_next_release(&mut self) -> Duration {
        self.time_to_next_release_at(Instant::now())
    }

    /// [`time_to_next_release`](Self::time_to_next_release) against an explicit
    /// clock reading. Updates the catch-up state.
    pub fn time_to_next_release_at(&mut self, now: Instant) -> Duration {
        let next = self.expected_start_time();
        if next > now {
            self.caught_up = true;
            return next - now;
        }

        if self.caught_up {
            // first time behind since last on pace
            self.caught_up = false;
            self.catch_up_start_time = now;
            self.units_completed_at_catch_up_start = self.units_completed;
        }

        let since_catch_up = self.units_completed - self.units_completed_at_catch_up_start;
        let next = self.catch_up_start_time
            + units_to_duration(since_catch_up, self.catch_up_throughput_per_nsec);
        next.saturating_duration_since(now)
    }

    /// Waits until `unit_count` more units may be released, then accounts for
    /// them. Only the owning worker calls this.
    pub async fn acquire(&mut self, unit_count: u64) {
        let wait = self.time_to_next_release();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        self.complete(unit_count);
    }

    fn complete(&mut self, unit_count: u64) {
        self.units_completed += unit_count;
    }
}

fn units_to_duration(units: u64, per_nsec: f64) -> Duration {
    // f64 -> u64 casts saturate
    Duration::from_nanos((units as f64 / per_nsec) as u64)
}
