use futures::FutureExt;
use parking_lot::Mutex;
use smartgraph_core::TaskFault;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::warn;

/// Terminal or pending state of a [`Task`].
#[derive(Debug, Clone)]
pub enum TaskStatus {
    Pending,
    Succeeded,
    /// Canceled without a recorded fault.
    Canceled,
    Faulted(TaskFault),
}

impl TaskStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, TaskStatus::Pending)
    }

    /// Success or fault-free cancellation.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Canceled)
    }

    pub fn fault(&self) -> Option<&TaskFault> {
        match self {
            TaskStatus::Faulted(f) => Some(f),
            _ => None,
        }
    }
}

type Continuation = Box<dyn FnOnce(&TaskStatus) + Send>;

struct TaskState {
    inner: Mutex<Completion>,
    notify: Notify,
}

struct Completion {
    status: TaskStatus,
    continuations: Vec<Continuation>,
}

/// Observable handle to a unit of work that completes exactly once.
#[derive(Clone)]
pub struct Task {
    state: Arc<TaskState>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("status", &self.status()).finish()
    }
}

impl Task {
    fn with_status(status: TaskStatus) -> Self {
        Self {
            state: Arc::new(TaskState {
                inner: Mutex::new(Completion {
                    status,
                    continuations: Vec::new(),
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn completed() -> Self {
        Self::with_status(TaskStatus::Succeeded)
    }

    pub fn canceled() -> Self {
        Self::with_status(TaskStatus::Canceled)
    }

    pub fn faulted(fault: TaskFault) -> Self {
        Self::with_status(TaskStatus::Faulted(fault))
    }

    /// Run `fut` on the current tokio runtime. Outside a runtime the task is
    /// returned already faulted.
    pub fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handle = match Handle::try_current() {
            Ok(h) => h,
            Err(e) => {
                warn!("cannot spawn task outside a tokio runtime: {}", e);
                return Self::faulted(TaskFault::failed(e));
            }
        };
        let source = TaskCompletionSource::new();
        let task = source.task();
        handle.spawn(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => source.set_result(),
                Ok(Err(err)) => match err.downcast::<TaskFault>() {
                    Ok(fault) => source.set_fault(fault),
                    Err(err) => source.set_error(err),
                },
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!("spawned task panicked: {}", message);
                    source.set_error(anyhow::anyhow!("task panicked: {message}"))
                }
            };
        });
        task
    }

    pub fn status(&self) -> TaskStatus {
        self.state.inner.lock().status.clone()
    }

    pub fn is_completed(&self) -> bool {
        !self.status().is_pending()
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self.status(), TaskStatus::Faulted(_))
    }

    pub fn ptr_eq(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Register a continuation. Runs inline, right now, when the task has
    /// already completed; otherwise on the thread that completes it.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(&TaskStatus) + Send + 'static,
    {
        let status = {
            let mut inner = self.state.inner.lock();
            if inner.status.is_pending() {
                inner.continuations.push(Box::new(f));
                return;
            }
            inner.status.clone()
        };
        f(&status);
    }

    /// Wait for completion and return the terminal status.
    pub async fn wait(&self) -> TaskStatus {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let status = self.status();
            if !status.is_pending() {
                return status;
            }
            notified.await;
        }
    }

    fn complete(&self, status: TaskStatus) -> bool {
        let continuations = {
            let mut inner = self.state.inner.lock();
            if !inner.status.is_pending() {
                return false;
            }
            inner.status = status.clone();
            std::mem::take(&mut inner.continuations)
        };
        self.state.notify.notify_waiters();
        for c in continuations {
            c(&status);
        }
        true
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Producer side of a [`Task`]. The first completion wins; later ones return
/// `false`.
pub struct TaskCompletionSource {
    task: Task,
}

impl Default for TaskCompletionSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskCompletionSource {
    pub fn new() -> Self {
        Self {
            task: Task::with_status(TaskStatus::Pending),
        }
    }

    pub fn task(&self) -> Task {
        self.task.clone()
    }

    pub fn set_result(&self) -> bool {
        self.task.complete(TaskStatus::Succeeded)
    }

    pub fn set_canceled(&self) -> bool {
        self.task.complete(TaskStatus::Canceled)
    }

    pub fn set_fault(&self, fault: TaskFault) -> bool {
        self.task.complete(TaskStatus::Faulted(fault))
    }

    pub fn set_error(&self, err: impl Into<anyhow::Error>) -> bool {
        self.set_fault(TaskFault::failed(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn panicking_future_faults_the_task() {
        let task = Task::spawn(async {
            if true {
                panic!("worker bug");
            }
            Ok(())
        });
        match task.wait().await {
            TaskStatus::Faulted(fault) => assert!(fault.to_string().contains("worker bug")),
            other => panic!("expected a fault, got {other:?}"),
        }
    }

    #[test]
    fn first_completion_wins() {
        let tcs = TaskCompletionSource::new();
        assert!(tcs.set_result());
        assert!(!tcs.set_error(anyhow::anyhow!("late")));
        assert!(tcs.task().status().is_success());
    }

    #[test]
    fn continuation_runs_once_on_completion() {
        let tcs = TaskCompletionSource::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        tcs.task().on_complete(move |s| {
            assert!(s.fault().is_some());
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tcs.set_error(anyhow::anyhow!("x"));
        tcs.set_result();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn continuation_on_completed_task_runs_inline() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        Task::completed().on_complete(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn spawned_task_reports_error() {
        let task = Task::spawn(async { Err(anyhow::anyhow!("bad")) });
        let status = task.wait().await;
        assert_eq!(status.fault().map(|f| f.to_string()), Some("bad".to_string()));
    }

    #[tokio::test]
    async fn spawned_task_keeps_cancellation_fault() {
        let task = Task::spawn(async { Err(anyhow::Error::new(TaskFault::Canceled)) });
        assert!(matches!(task.wait().await, TaskStatus::Faulted(TaskFault::Canceled)));
    }

    #[test]
    fn spawn_outside_runtime_is_faulted() {
        let task = Task::spawn(async { Ok(()) });
        assert!(task.is_faulted());
    }
}
