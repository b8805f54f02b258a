//! The seams to the benchmarked system.
//!
//! The engine knows nothing about what an operation does. An
//! [`OperationFactory`] builds a payload for each logical index, a [`Client`]
//! executes it, and the engine keeps the timestamps around the call.
use std::{future::Future, marker::PhantomData, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::BoxError;

/// A single unit of work as seen by the engine.
#[derive(Debug, Clone)]
pub struct Operation<P> {
    /// Logical index handed out by the [`crate::WorkManager`].
    pub index: u64,
    /// When the operation should have started according to the pacer.
    pub intended_start: Instant,
    /// When it was actually handed to the client.
    pub dispatched_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    pub payload: P,
}

impl<P> Operation<P> {
    pub fn new(index: u64, intended_start: Instant, payload: P) -> Self {
        Self {
            index,
            intended_start,
            dispatched_at: None,
            completed_at: None,
            payload,
        }
    }

    /// Completion minus intended start. `None` until completed.
    pub fn response_time(&self) -> Option<Duration> {
        self.completed_at
            .map(|done| done.saturating_duration_since(self.intended_start))
    }

    /// Completion minus dispatch. `None` until completed.
    pub fn service_time(&self) -> Option<Duration> {
        let dispatched = self.dispatched_at.unwrap_or(self.intended_start);
        self.completed_at
            .map(|done| done.saturating_duration_since(dispatched))
    }
}

/// What a successful operation touched, used for key and row rates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub partitions: u64,
    pub rows: u64,
}

impl Outcome {
    pub fn new(partitions: u64, rows: u64) -> Self {
        Self { partitions, rows }
    }
}

/// Builds the payload for a logical operation index.
///
/// Called once per released unit. The engine drops the payload once the
/// operation completes.
pub trait OperationFactory: Send + Sync + 'static {
    type Payload: Send + Sync + 'static;

    fn create(&self, index: u64) -> Self::Payload;

    /// Short description used in run banners.
    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// Executes operations against the system under test.
///
/// Any error is fatal to the run: the engine never retries.
///
/// # Example
/// ```rust
/// use pacebench::{BoxError, Client, Operation, Outcome};
///
/// struct Echo;
///
/// impl Client<u64> for Echo {
///     async fn execute(&self, op: &Operation<u64>) -> Result<Outcome, BoxError> {
///         Ok(Outcome::new(1, op.payload))
///     }
/// }
/// ```
pub trait Client<P>: Send + Sync + 'static {
    fn execute(
        &self,
        operation: &Operation<P>,
    ) -> impl Future<Output = Result<Outcome, BoxError>> + Send;
}

impl<F> OperationFactory for F
where
    F: Fn(u64) -> u64 + Send + Sync + 'static,
{
    type Payload = u64;

    fn create(&self, index: u64) -> u64 {
        self(index)
    }
}

/// Adapts a closure returning any payload type into an [`OperationFactory`].
///
/// ```rust
/// use pacebench::{FnFactory, OperationFactory};
///
/// let keys = FnFactory::new(|i: u64| format!("key-{i}"));
/// assert_eq!(keys.create(7), "key-7");
/// ```
pub struct FnFactory<F, P> {
    f: F,
    _payload: PhantomData<fn() -> P>,
}

impl<F, P> FnFactory<F, P>
where
    F: Fn(u64) -> P,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _payload: PhantomData,
        }
    }
}

impl<F, P> OperationFactory for FnFactory<F, P>
where
    F: Fn(u64) -> P + Send + Sync + 'static,
    P: Send + Sync + 'static,
{
    type Payload = P;

    fn create(&self, index: u64) -> P {
        (self.f)(index)
    }

    fn describe(&self) -> String {
        std::any::type_name::<F>().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_accounting_uses_intended_and_dispatch_starts() {
        let base = Instant::now();
        let at = |ms| base + Duration::from_millis(ms);

        let mut op = Operation::new(0, at(1000), ());
        assert_eq!(op.response_time(), None);

        op.dispatched_at = Some(at(1005));
        op.completed_at = Some(at(1012));
        assert_eq!(op.response_time(), Some(Duration::from_millis(12)));
        assert_eq!(op.service_time(), Some(Duration::from_millis(7)));
    }

    #[test]
    fn closures_act_as_factories() {
        let factory = |i: u64| i * 2;
        assert_eq!(factory.create(21), 42);
    }

    #[test]
    fn wrapped_closures_build_any_payload() {
        let factory = FnFactory::new(|i: u64| (i, vec![0u8; i as usize]));
        let (index, row) = factory.create(3);
        assert_eq!(index, 3);
        assert_eq!(row.len(), 3);
    }
}
