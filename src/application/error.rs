use crate::infrastructure::error::InfraError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("timer already running for task {task_id}")]
    AlreadyRunning { task_id: String },
    #[error("timer for task {task_id} is not running")]
    NotRunning { task_id: String },
    #[error("no active timer for task {task_id}")]
    NoActiveTimer { task_id: String },
    #[error("remote timer {timer_id} not found")]
    TimerNotFound { timer_id: String },
    #[error("timer for task {task_id} has no recorded time")]
    ZeroDuration { task_id: String },
    #[error("{operation} failed after {attempts} attempts: {source}")]
    NetworkRetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: InfraError,
    },
    #[error("task aggregate missing for task {task_id}")]
    TaskAggregateMissing { task_id: String },
    #[error("another action is still in progress for task {task_id}")]
    ActionInProgress { task_id: String },
    #[error("interval of {seconds} seconds is implausible")]
    ImplausibleInterval { seconds: i64 },
    #[error("global timer sync has not been initialized")]
    SyncNotInitialized,
    #[error(transparent)]
    Infra(InfraError),
}

impl From<InfraError> for TimerError {
    fn from(error: InfraError) -> Self {
        match error {
            InfraError::DocumentNotFound(timer_id) => Self::TimerNotFound { timer_id },
            InfraError::TaskAggregateMissing(task_id) => Self::TaskAggregateMissing { task_id },
            other => Self::Infra(other),
        }
    }
}

impl TimerError {
    /// Whether the error came from a remote operation that may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkRetryExhausted { .. })
    }

    /// A missing remote document, either mapped directly or as the last
    /// error of an exhausted retry.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::TimerNotFound { .. }
                | Self::NetworkRetryExhausted {
                    source: InfraError::DocumentNotFound(_),
                    ..
                }
        )
    }
}
