use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A single failure recorded for a tracked task.
///
/// `Canceled` is the cancellation-flavored fault a task can be explicitly
/// failed with; a task that is merely canceled carries no fault at all.
#[derive(Debug, Clone, Error)]
pub enum TaskFault {
    #[error("The operation was canceled")]
    Canceled,

    #[error("{0}")]
    Failed(Arc<anyhow::Error>),
}

impl TaskFault {
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        TaskFault::Failed(Arc::new(err.into()))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, TaskFault::Canceled)
    }

    /// Downcast the wrapped error, if any.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        match self {
            TaskFault::Failed(err) => err.downcast_ref::<E>(),
            TaskFault::Canceled => None,
        }
    }

    /// Turn an arbitrary error into faults. An `AggregateError` is flattened
    /// into its inner faults, anything else becomes a single fault.
    pub fn flatten(err: anyhow::Error) -> Vec<TaskFault> {
        match err.downcast::<AggregateError>() {
            Ok(aggregate) => aggregate.into_faults(),
            Err(other) => vec![TaskFault::Failed(Arc::new(other))],
        }
    }
}

/// All faults collected over one task generation.
#[derive(Debug, Clone, Default)]
pub struct AggregateError {
    faults: Vec<TaskFault>,
}

impl AggregateError {
    pub fn new(faults: Vec<TaskFault>) -> Self {
        Self { faults }
    }

    pub fn single(fault: TaskFault) -> Self {
        Self {
            faults: vec![fault],
        }
    }

    pub fn faults(&self) -> &[TaskFault] {
        &self.faults
    }

    pub fn into_faults(self) -> Vec<TaskFault> {
        self.faults
    }

    pub fn len(&self) -> usize {
        self.faults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.faults.iter().map(ToString::to_string).collect()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task fault(s)", self.faults.len())?;
        for fault in &self.faults {
            write!(f, "; {}", fault)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}
