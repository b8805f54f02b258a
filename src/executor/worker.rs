use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use tokio::time::Instant;

use crate::{
    BoxError,
    error::{Error, Result},
    metrics::CancelHandle,
    operation::{Client, Operation, OperationFactory},
    pacer::Pacer,
    timer::Timer,
    work::WorkManager,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Init,
    Running,
    Done,
    Failed,
}

/// What a worker hands back when its loop ends.
#[derive(Debug)]
pub struct WorkerReport {
    pub worker: usize,
    pub state: WorkerState,
    pub completed: u64,
    /// Set when `state` is [`WorkerState::Failed`].
    pub error: Option<Error>,
}

/// One load-generating loop with its own pacer and timer.
///
/// The loop asks the [`WorkManager`] for an index, waits for the pacer,
/// builds the payload, dispatches it and records its latency. The first client
/// error stops the shared work, cancels the run and ends the loop.
pub struct Worker<F, C>
where
    F: OperationFactory,
    C: Client<F::Payload>,
{
    id: usize,
    state: WorkerState,
    pacer: Pacer,
    timer: Timer,
    work: Arc<WorkManager>,
    factory: Arc<F>,
    client: Arc<C>,
    cancel: CancelHandle,
    completed: u64,
}

impl<F, C> Worker<F, C>
where
    F: OperationFactory,
    C: Client<F::Payload>,
{
    pub fn new(
        id: usize,
        pacer: Pacer,
        timer: Timer,
        work: Arc<WorkManager>,
        factory: Arc<F>,
        client: Arc<C>,
        cancel: CancelHandle,
    ) -> Self {
        Self {
            id,
            state: WorkerState::Init,
            pacer,
            timer,
            work,
            factory,
            client,
            cancel,
            completed: 0,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub async fn run(mut self) -> WorkerReport {
        self.state = WorkerState::Running;
        self.pacer.set_initial_start_time(Instant::now());
        tracing::debug!("Worker {} started.", self.id);

        let mut error = None;
        while let Some(index) = self.work.try_acquire_index() {
            if let Err(e) = self.step(index).await {
                error = Some(e);
                break;
            }
            self.completed += 1;
        }

        self.state = match error {
            None => WorkerState::Done,
            Some(ref e) => {
                tracing::error!("Worker {} failed: {e}", self.id);
                self.work.stop();
                self.cancel.cancel();
                WorkerState::Failed
            }
        };
        self.timer.close();
        tracing::debug!(
            "Worker {} finished after {} operations.",
            self.id,
            self.completed
        );

        WorkerReport {
            worker: self.id,
            state: self.state,
            completed: self.completed,
            error,
        }
    }

    async fn step(&mut self, index: u64) -> Result<()> {
        let intended = self.pacer.expected_start_time();
        self.timer.expected_start(intended)?;
        self.pacer.acquire(1).await;

        let mut op = Operation::new(index, intended, self.factory.create(index));
        let dispatched = Instant::now();
        op.dispatched_at = Some(dispatched);
        self.timer.start(dispatched);

        let outcome = AssertUnwindSafe(self.client.execute(&op))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panic_error(panic)))
            .map_err(|source| Error::Operation {
                worker: self.id,
                index,
                source,
            })?;

        let completed = Instant::now();
        op.completed_at = Some(completed);
        self.timer.stop(completed, outcome)?;
        Ok(())
    }
}

fn panic_error(panic: Box<dyn Any + Send>) -> BoxError {
    let message = match panic.downcast::<String>() {
        Ok(s) => *s,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(s) => s.to_string(),
            Err(_) => "unknown panic".to_string(),
        },
    };
    format!("client panicked: {message}").into()
}
