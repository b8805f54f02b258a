use thiserror::Error;

/// Boxed error returned by [`crate::Client`] implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A single operation failed. The whole run is invalid.
    #[error("worker {worker} failed executing operation {index}: {source}")]
    Operation {
        worker: usize,
        index: u64,
        #[source]
        source: BoxError,
    },

    #[error("run was cancelled")]
    Cancelled,

    #[error("trial with {threads} threads failed: {source}")]
    Trial {
        threads: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("timer backlog full: {capacity} operations pending without completion")]
    TimerBacklog { capacity: usize },

    #[error("operation completed without a registered expected start")]
    TimerUnderflow,

    #[error("histogram: {0}")]
    Histogram(String),

    #[error("histogram log: {0}")]
    HistogramLog(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
