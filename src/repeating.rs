//! Purpose: Pool of workers that run a task's handler a fixed number of times.
//! Exports: `Pool`, `Task`, `TaskError`, `TaskErrors`, `TaskGroup`, `TaskGroupErrors`.
//! Role: Load generation and bulk fan-out against the gateway.
//! Invariants: A task's handler runs at most `repetitions` times with at most
//! `max_parallel` invocations in flight; repetition indices are claimed atomically and
//! are 0-based.
//! Invariants: Once errors exceed `max_errors` the task completes and remaining
//! tickets retire without calling the handler.
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::error::{Error, ErrorKind};

type Handler = Arc<dyn Fn(usize) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send>> + Send + Sync>;

#[derive(Debug)]
pub struct TaskError {
    pub repetition: usize,
    pub error: Error,
}

#[derive(Debug, Default)]
pub struct TaskErrors {
    errors: Vec<TaskError>,
}

impl TaskErrors {
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskError> {
        self.errors.iter()
    }

    /// `Ok` when no repetition failed, else one error listing every failure.
    pub fn into_result(self) -> Result<(), Error> {
        if self.errors.is_empty() {
            return Ok(());
        }
        Err(Error::new(ErrorKind::Internal).with_message(self.to_string()))
    }
}

impl fmt::Display for TaskErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for failure in &self.errors {
            writeln!(f, "{}: {}", failure.repetition, failure.error)?;
        }
        Ok(())
    }
}

struct TaskState {
    repetitions: usize,
    max_parallel: usize,
    max_errors: Option<usize>,
    handler: Handler,
    next_repetition: AtomicUsize,
    completions: AtomicUsize,
    submitted: AtomicBool,
    errors: Mutex<Vec<TaskError>>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl TaskState {
    fn error_count(&self) -> usize {
        self.errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn errored_out(&self) -> bool {
        self.max_errors
            .is_some_and(|max_errors| self.error_count() > max_errors)
    }

    fn complete(&self) {
        let _ = self.done_tx.send(true);
    }
}

/// Handle to a repeating task; clones share the same state.
#[derive(Clone)]
pub struct Task {
    state: Arc<TaskState>,
}

impl Task {
    pub fn new<F, Fut>(repetitions: usize, max_parallel: usize, handler: F) -> Task
    where
        F: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let (done_tx, done_rx) = watch::channel(false);
        let handler: Handler = Arc::new(move |repetition| Box::pin(handler(repetition)));
        Task {
            state: Arc::new(TaskState {
                repetitions,
                max_parallel: max_parallel.max(1),
                max_errors: None,
                handler,
                next_repetition: AtomicUsize::new(0),
                completions: AtomicUsize::new(0),
                submitted: AtomicBool::new(false),
                errors: Mutex::new(Vec::new()),
                done_tx,
                done_rx,
            }),
        }
    }

    /// Completes the task early once more than `max_errors` repetitions failed.
    pub fn with_max_errors(self, max_errors: usize) -> Task {
        match Arc::try_unwrap(self.state) {
            Ok(mut state) => {
                state.max_errors = Some(max_errors);
                Task {
                    state: Arc::new(state),
                }
            }
            Err(state) => Task { state },
        }
    }

    pub fn is_complete(&self) -> bool {
        *self.state.done_rx.borrow()
    }

    /// Waits for completion and returns a copy of every recorded failure.
    pub async fn wait(&self) -> TaskErrors {
        let mut done = self.state.done_rx.clone();
        let _ = done.wait_for(|done| *done).await;
        let errors = self
            .state
            .errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        TaskErrors {
            errors: errors
                .iter()
                .map(|failure| TaskError {
                    repetition: failure.repetition,
                    error: failure.error.detached(),
                })
                .collect(),
        }
    }
}

/// Fixed set of workers fed from one queue of task tickets.
pub struct Pool {
    tickets: mpsc::UnboundedSender<Arc<TaskState>>,
    live: Arc<AtomicUsize>,
    max_tasks: usize,
    shutdown: CancellationToken,
}

impl Pool {
    /// Must be called from within a tokio runtime.
    pub fn new(max_tasks: usize, workers: usize) -> Pool {
        let (tickets, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let live = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        for worker in 0..workers.max(1) {
            tokio::spawn(run_worker(
                worker,
                receiver.clone(),
                tickets.clone(),
                live.clone(),
                shutdown.clone(),
            ));
        }
        Pool {
            tickets,
            live,
            max_tasks,
            shutdown,
        }
    }

    /// Enqueues `max_parallel` tickets for `task`.
    pub fn submit(&self, task: &Task) -> Result<(), Error> {
        let state = &task.state;
        if state.submitted.swap(true, Ordering::AcqRel) {
            return Err(Error::new(ErrorKind::BadRequest).with_message("task was already submitted"));
        }
        if state.repetitions == 0 {
            state.complete();
            return Ok(());
        }
        let tickets = state.max_parallel.min(state.repetitions);
        let reserved = self.live.fetch_add(tickets, Ordering::AcqRel);
        if reserved + tickets > self.max_tasks {
            self.live.fetch_sub(tickets, Ordering::AcqRel);
            return Err(Error::new(ErrorKind::Conflict)
                .with_message("failed to submit task - enlarge the pool max # of tasks"));
        }
        for _ in 0..tickets {
            if self.tickets.send(state.clone()).is_err() {
                return Err(Error::new(ErrorKind::Internal).with_message("pool is shut down"));
            }
        }
        Ok(())
    }

    pub async fn submit_and_wait(&self, task: &Task) -> TaskErrors {
        if let Err(err) = self.submit(task) {
            return TaskErrors {
                errors: vec![TaskError {
                    repetition: 0,
                    error: err,
                }],
            };
        }
        task.wait().await
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_worker(
    worker: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<TaskState>>>>,
    requeue: mpsc::UnboundedSender<Arc<TaskState>>,
    live: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) {
    loop {
        let ticket = tokio::select! {
            ticket = async { receiver.lock().await.recv().await } => ticket,
            _ = shutdown.cancelled() => None,
        };
        let Some(task) = ticket else {
            debug!(worker, "repeating worker stopped");
            return;
        };
        if run_ticket(&task).await {
            if requeue.send(task).is_err() {
                return;
            }
        } else {
            live.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Runs one repetition; returns false when the ticket should retire.
async fn run_ticket(task: &TaskState) -> bool {
    if task.errored_out() {
        return false;
    }
    let repetition = task.next_repetition.fetch_add(1, Ordering::AcqRel);
    if repetition >= task.repetitions {
        return false;
    }
    if let Err(error) = (task.handler)(repetition).await {
        task.errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(TaskError { repetition, error });
    }
    let completions = task.completions.fetch_add(1, Ordering::AcqRel) + 1;
    if completions >= task.repetitions || task.errored_out() {
        task.complete();
    }
    true
}

#[derive(Debug, Default)]
pub struct TaskGroupErrors {
    tasks: Vec<TaskErrors>,
}

impl TaskGroupErrors {
    /// Failed tasks only.
    pub fn failures(&self) -> impl Iterator<Item = &TaskErrors> {
        self.tasks.iter().filter(|errors| !errors.is_empty())
    }

    pub fn into_result(self) -> Result<(), Error> {
        let message: String = self.failures().map(|errors| errors.to_string()).collect();
        if message.is_empty() {
            return Ok(());
        }
        Err(Error::new(ErrorKind::Internal).with_message(message))
    }
}

/// Waits for many tasks and aggregates their failures.
#[derive(Default)]
pub struct TaskGroup {
    tasks: Mutex<Vec<Task>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, task: Task) {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
    }

    pub async fn wait(&self) -> TaskGroupErrors {
        let tasks: Vec<Task> = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let mut errors = TaskGroupErrors::default();
        for task in tasks {
            errors.tasks.push(task.wait().await);
        }
        errors
    }
}
