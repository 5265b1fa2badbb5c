//! Task scheduling.
//!
//! Nodes never spawn threads themselves. They hand closures to an
//! [`Executor`], which is either [`SerialExecutor`] (run inline on the
//! calling thread) or a shared [`ThreadPool`]. Asynchronous work such as a
//! source pulling from its stream is driven by [`spawn_future`], which
//! re-polls the future on the executor whenever it is woken instead of
//! parking a worker.

use crate::error::{ExecError, Result};
use crossbeam_channel::{Receiver, Sender};
use futures::future::BoxFuture;
use futures::task::{waker_ref, ArcWake};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::Context;
use std::thread::JoinHandle;

use super::completion::Completion;

/// A unit of work submitted to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Where node work runs.
pub trait Executor: Send + Sync + fmt::Debug {
    /// Run `task`, either now on this thread or later on another.
    fn spawn(&self, task: Task);

    /// Whether tasks may run concurrently with the caller.
    fn is_parallel(&self) -> bool;

    /// Number of tasks that can run at once.
    fn parallelism(&self) -> usize {
        1
    }
}

/// Runs every task inline, making execution fully deterministic.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialExecutor;

impl Executor for SerialExecutor {
    fn spawn(&self, task: Task) {
        task();
    }

    fn is_parallel(&self) -> bool {
        false
    }
}

static GLOBAL_POOL: OnceLock<Arc<ThreadPool>> = OnceLock::new();

/// Fixed-size pool of worker threads fed through a crossbeam channel.
pub struct ThreadPool {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(ExecError::invalid("ThreadPool requires at least one worker"));
        }
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("acero-worker-{}", index))
                .spawn(move || worker_loop(receiver))?;
            workers.push(handle);
        }
        tracing::debug!(workers = size, "Thread pool started");
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// The process-wide pool, sized to the available parallelism.
    pub fn global() -> Result<Arc<ThreadPool>> {
        if let Some(pool) = GLOBAL_POOL.get() {
            return Ok(pool.clone());
        }
        let size = std::thread::available_parallelism().map_or(4, |n| n.get());
        let pool = Arc::new(ThreadPool::new(size)?);
        Ok(GLOBAL_POOL.get_or_init(|| pool).clone())
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

/// Turn a caught panic into an `Execution` error carrying its message.
pub(crate) fn panic_error(payload: Box<dyn Any + Send>) -> ExecError {
    let message = match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(_) => "unknown panic payload".to_string(),
        },
    };
    ExecError::Execution(format!("task panicked: {}", message))
}

fn worker_loop(receiver: Receiver<Task>) {
    while let Ok(task) = receiver.recv() {
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::error!("Task panicked on worker thread");
        }
    }
}

impl Executor for ThreadPool {
    fn spawn(&self, task: Task) {
        match &self.sender {
            Some(sender) => {
                if sender.send(task).is_err() {
                    tracing::warn!("Thread pool is shut down, dropping task");
                }
            }
            None => tracing::warn!("Thread pool is shut down, dropping task"),
        }
    }

    fn is_parallel(&self) -> bool {
        true
    }

    fn parallelism(&self) -> usize {
        self.workers.len()
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Closing the channel lets every worker drain and exit.
        self.sender.take();
        let current = std::thread::current().id();
        for handle in self.workers.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("Worker thread panicked during shutdown");
            }
        }
    }
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const NOTIFIED: u8 = 2;
const COMPLETE: u8 = 3;

type PanicHandler = Box<dyn FnOnce(ExecError) + Send>;

struct FutureTask {
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    state: AtomicU8,
    executor: Arc<dyn Executor>,
    on_panic: Mutex<Option<PanicHandler>>,
}

impl FutureTask {
    fn schedule(self: Arc<Self>) {
        let executor = self.executor.clone();
        executor.spawn(Box::new(move || self.run()));
    }

    fn run(self: Arc<Self>) {
        loop {
            let mut panicked = None;
            let done = {
                let waker = waker_ref(&self);
                let mut cx = Context::from_waker(&waker);
                let mut slot = self.future.lock();
                match slot.as_mut() {
                    Some(future) => {
                        let polled = catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));
                        let ready = match polled {
                            Ok(poll) => poll.is_ready(),
                            Err(payload) => {
                                panicked = Some(panic_error(payload));
                                true
                            }
                        };
                        if ready {
                            *slot = None;
                        }
                        ready
                    }
                    None => true,
                }
            };
            if done {
                self.state.store(COMPLETE, Ordering::Release);
                if let Some(err) = panicked {
                    tracing::error!(error = %err, "Future panicked while polled");
                    if let Some(handler) = self.on_panic.lock().take() {
                        handler(err);
                    }
                }
                return;
            }
            // A wake that arrived during the poll leaves NOTIFIED behind.
            match self
                .state
                .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(_) => self.state.store(RUNNING, Ordering::Release),
            }
        }
    }
}

impl ArcWake for FutureTask {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let mut current = arc_self.state.load(Ordering::Acquire);
        loop {
            let next = match current {
                IDLE => RUNNING,
                RUNNING => NOTIFIED,
                _ => return,
            };
            match arc_self
                .state
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if current == IDLE {
                        arc_self.clone().schedule();
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// Drive `future` to completion on `executor`.
///
/// The first poll is submitted immediately; with a [`SerialExecutor`] it
/// happens before this function returns. A panic while polling drops the
/// future and is logged.
pub fn spawn_future<F>(executor: Arc<dyn Executor>, future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    spawn(executor, Box::pin(future), None);
}

/// Like [`spawn_future`], but a panic while polling is also handed to
/// `on_panic` so the owner of the future can fail instead of hanging.
pub fn spawn_future_or_else<F, P>(executor: Arc<dyn Executor>, future: F, on_panic: P)
where
    F: Future<Output = ()> + Send + 'static,
    P: FnOnce(ExecError) + Send + 'static,
{
    spawn(executor, Box::pin(future), Some(Box::new(on_panic)));
}

fn spawn(executor: Arc<dyn Executor>, future: BoxFuture<'static, ()>, on_panic: Option<PanicHandler>) {
    let task = Arc::new(FutureTask {
        future: Mutex::new(Some(future)),
        state: AtomicU8::new(RUNNING),
        executor,
        on_panic: Mutex::new(on_panic),
    });
    task.schedule();
}

struct TaskGroupInner {
    executor: Arc<dyn Executor>,
    pending: AtomicUsize,
    ended: AtomicBool,
    failure: Mutex<Option<ExecError>>,
    finished: Completion,
}

/// Tracks a set of spawned tasks and resolves once the group is closed and
/// every task has run. A task that panics fails the group with the first
/// panic message.
#[derive(Clone)]
pub struct TaskGroup {
    inner: Arc<TaskGroupInner>,
}

impl TaskGroup {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            inner: Arc::new(TaskGroupInner {
                executor,
                // One slot is held open until `end` is called.
                pending: AtomicUsize::new(1),
                ended: AtomicBool::new(false),
                failure: Mutex::new(None),
                finished: Completion::new(),
            }),
        }
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        let group = self.clone();
        self.inner.executor.spawn(Box::new(move || {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                let err = panic_error(payload);
                tracing::error!(error = %err, "Task panicked");
                group.inner.failure.lock().get_or_insert(err);
            }
            group.task_done();
        }));
    }

    /// Close the group. Later calls are ignored.
    pub fn end(&self) {
        if !self.inner.ended.swap(true, Ordering::AcqRel) {
            self.task_done();
        }
    }

    pub fn finished(&self) -> &Completion {
        &self.inner.finished
    }

    fn task_done(&self) {
        if self.inner.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let result = match self.inner.failure.lock().take() {
                Some(err) => Err(err),
                None => Ok(()),
            };
            self.inner.finished.mark_finished(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::oneshot;
    use std::time::Duration;

    #[test]
    fn test_serial_executor_runs_inline() {
        let hit = Arc::new(AtomicBool::new(false));
        let flag = hit.clone();
        SerialExecutor.spawn(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(hit.load(Ordering::SeqCst));
        assert!(!SerialExecutor.is_parallel());
    }

    #[test]
    fn test_thread_pool_runs_all_tasks() {
        let pool: Arc<dyn Executor> = Arc::new(ThreadPool::new(4).unwrap());
        let group = TaskGroup::new(pool.clone());
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            group.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        group.end();
        assert_eq!(
            group.finished().wait_timeout(Duration::from_secs(5)),
            Some(Ok(()))
        );
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_eq!(pool.parallelism(), 4);
    }

    #[test]
    fn test_zero_sized_pool_is_invalid() {
        assert!(ThreadPool::new(0).is_err());
    }

    #[test]
    fn test_task_group_waits_for_end() {
        let group = TaskGroup::new(Arc::new(SerialExecutor));
        group.spawn(|| {});
        assert!(!group.finished().is_finished());
        group.end();
        group.end();
        assert!(group.finished().is_finished());
    }

    #[test]
    fn test_spawn_future_resumes_when_woken() {
        let (tx, rx) = oneshot::channel::<u32>();
        let done = Completion::new();
        let signal = done.clone();
        spawn_future(Arc::new(SerialExecutor), async move {
            let value = rx.await.unwrap_or(0);
            assert_eq!(value, 7);
            signal.mark_finished(Ok(()));
        });
        // first poll already happened inline and is parked on the channel
        assert!(!done.is_finished());
        tx.send(7).unwrap();
        assert_eq!(done.wait_timeout(Duration::from_secs(1)), Some(Ok(())));
    }

    #[test]
    fn test_task_group_reports_panic() {
        let pool: Arc<dyn Executor> = Arc::new(ThreadPool::new(2).unwrap());
        let group = TaskGroup::new(pool);
        group.spawn(|| panic!("boom"));
        group.spawn(|| {});
        group.end();
        let result = group.finished().wait_timeout(Duration::from_secs(5)).unwrap();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_panicking_future_runs_handler() {
        for executor in [
            Arc::new(SerialExecutor) as Arc<dyn Executor>,
            Arc::new(ThreadPool::new(2).unwrap()) as Arc<dyn Executor>,
        ] {
            let done = Completion::new();
            let signal = done.clone();
            spawn_future_or_else(
                executor,
                async {
                    panic!("kaput");
                },
                move |err| {
                    signal.mark_finished(Err(err));
                },
            );
            let result = done.wait_timeout(Duration::from_secs(5)).unwrap();
            assert!(result.unwrap_err().to_string().contains("kaput"));
        }
    }

    #[test]
    fn test_panic_error_message() {
        let err = panic_error(Box::new(format!("bad {}", 1)));
        assert_eq!(err.to_string(), "ExecutionError: task panicked: bad 1");
        let err = panic_error(Box::new(7u8));
        assert!(err.to_string().contains("unknown panic payload"));
    }

    #[test]
    fn test_spawn_future_on_pool() {
        let pool: Arc<dyn Executor> = Arc::new(ThreadPool::new(2).unwrap());
        let done = Completion::new();
        let signal = done.clone();
        spawn_future(pool, async move {
            signal.mark_finished(Ok(()));
        });
        assert_eq!(done.wait_timeout(Duration::from_secs(5)), Some(Ok(())));
    }
}
