//! Generation tracking for dynamically growing sets of tasks.
//!
//! A generation starts when the first pending task is added to an idle
//! sequencer and ends when the last of its tasks completes. Tasks added while
//! the generation is active join it. The generation-complete callback runs
//! exactly once after the last task, and the generation signal resolves only
//! after the callback, carrying every fault collected along the way.

use crate::task::{Task, TaskStatus};
use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use smartgraph_core::{AggregateError, TaskFault};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type GenerationResult = Result<(), AggregateError>;

/// Reusable await point for "the generation drained". Clones of one signal
/// compare equal under `Shared::ptr_eq`.
pub type GenerationSignal = Shared<BoxFuture<'static, GenerationResult>>;

pub type CompletionCallback = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Error)]
pub enum WaitError {
    #[error("Wait was canceled")]
    Canceled,

    #[error(transparent)]
    Faulted(#[from] AggregateError),
}

struct Generation {
    id: u64,
    pending: usize,
    faults: Vec<TaskFault>,
    signal: GenerationSignal,
    resolve: Option<oneshot::Sender<GenerationResult>>,
}

impl Generation {
    fn new(id: u64) -> Self {
        let (tx, rx) = oneshot::channel();
        let signal = async move {
            // A dropped sender means the generation was abandoned with no result.
            rx.await.unwrap_or(Ok(()))
        }
        .boxed()
        .shared();
        Self {
            id,
            pending: 0,
            faults: Vec::new(),
            signal,
            resolve: Some(tx),
        }
    }
}

#[derive(Default)]
struct State {
    next_id: u64,
    current: Option<Generation>,
}

struct Inner {
    state: Mutex<State>,
    callback: RwLock<Option<CompletionCallback>>,
    idle: GenerationSignal,
    completed: AtomicU64,
}

/// Aggregates in-flight tasks into one awaitable generation.
#[derive(Clone)]
pub struct TaskSequencer {
    inner: Arc<Inner>,
}

impl Default for TaskSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSequencer")
            .field("running", &self.is_running())
            .field("completed_generations", &self.completed_generations())
            .finish()
    }
}

impl TaskSequencer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                callback: RwLock::new(None),
                idle: future::ready(Ok(())).boxed().shared(),
                completed: AtomicU64::new(0),
            }),
        }
    }

    /// Install the callback run once per drained generation.
    pub fn on_generation_complete<F, Fut>(&self, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        *self.inner.callback.write() = Some(Arc::new(move || f().boxed()));
    }

    pub fn clear_generation_complete(&self) {
        *self.inner.callback.write() = None;
    }

    /// Track `task` in the current generation.
    ///
    /// Already successful (or fault-free canceled) tasks are handed back
    /// untracked. Already faulted tasks fail fast with their fault, before
    /// being tracked.
    pub fn add_task(&self, task: Task) -> Result<Task, AggregateError> {
        match task.status() {
            TaskStatus::Succeeded | TaskStatus::Canceled => return Ok(task),
            TaskStatus::Faulted(fault) => return Err(AggregateError::single(fault)),
            TaskStatus::Pending => {}
        }

        let generation = {
            let mut state = self.inner.state.lock();
            let needs_new = state
                .current
                .as_ref()
                .map(|g| g.pending == 0)
                .unwrap_or(true);
            if needs_new {
                state.next_id += 1;
                state.current = None;
            }
            let id = state.next_id;
            let g = state.current.get_or_insert_with(|| {
                debug!(generation = id, "task generation started");
                Generation::new(id)
            });
            g.pending += 1;
            g.id
        };

        let inner = self.inner.clone();
        task.on_complete(move |status| Inner::task_finished(&inner, generation, status));
        Ok(task)
    }

    /// Spawn `fut` on the runtime and track it.
    pub fn add_future<F>(&self, fut: F) -> Result<Task, AggregateError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_task(Task::spawn(fut))
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .state
            .lock()
            .current
            .as_ref()
            .map(|g| g.pending > 0)
            .unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .current
            .as_ref()
            .map(|g| g.pending)
            .unwrap_or(0)
    }

    pub fn completed_generations(&self) -> u64 {
        self.inner.completed.load(Ordering::SeqCst)
    }

    /// The current generation's signal, or an already satisfied one when idle.
    pub fn all_done(&self) -> GenerationSignal {
        self.inner
            .state
            .lock()
            .current
            .as_ref()
            .map(|g| g.signal.clone())
            .unwrap_or_else(|| self.inner.idle.clone())
    }

    /// Await the generation while observing `token`. Cancellation only
    /// abandons the wait; tracked tasks keep running.
    pub async fn wait_for_completion(&self, token: &CancellationToken) -> Result<(), WaitError> {
        if token.is_cancelled() {
            return Err(WaitError::Canceled);
        }
        let signal = self.all_done();
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(WaitError::Canceled),
            result = signal => result.map_err(WaitError::Faulted),
        }
    }
}

impl Inner {
    fn task_finished(this: &Arc<Inner>, generation: u64, status: &TaskStatus) {
        let finished = {
            let mut state = this.state.lock();
            let Some(g) = state.current.as_mut().filter(|g| g.id == generation) else {
                warn!(generation, "task finished for a retired generation");
                return;
            };
            g.pending = g.pending.saturating_sub(1);
            if let TaskStatus::Faulted(fault) = status {
                g.faults.push(fault.clone());
            }
            if g.pending == 0 {
                Some((std::mem::take(&mut g.faults), g.resolve.take()))
            } else {
                None
            }
        };

        if let Some((faults, resolve)) = finished {
            let callback = this.callback.read().clone();
            Self::finish(this.clone(), generation, faults, callback, resolve);
        }
    }

    fn finish(
        this: Arc<Inner>,
        generation: u64,
        mut faults: Vec<TaskFault>,
        callback: Option<CompletionCallback>,
        resolve: Option<oneshot::Sender<GenerationResult>>,
    ) {
        let mut work = async move {
            if let Some(cb) = callback {
                if let Err(err) = cb().await {
                    faults.extend(TaskFault::flatten(err));
                }
            }
            let result = if faults.is_empty() {
                Ok(())
            } else {
                Err(AggregateError::new(faults))
            };
            this.retire(generation);
            debug!(generation, faulted = result.is_err(), "task generation drained");
            if let Some(tx) = resolve {
                let _ = tx.send(result);
            }
        }
        .boxed();

        // Synchronous callbacks finish in place; anything that suspends is
        // moved onto the runtime.
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        if let Poll::Pending = work.as_mut().poll(&mut cx) {
            match Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(work);
                }
                Err(_) => futures::executor::block_on(work),
            }
        }
    }

    fn retire(&self, generation: u64) {
        let mut state = self.state.lock();
        let drained = state
            .current
            .as_ref()
            .map(|g| g.id == generation && g.pending == 0)
            .unwrap_or(false);
        if drained {
            state.current = None;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}
