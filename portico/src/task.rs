//! Cooperative lifecycle primitive for long-running subsystems.
//!
//! A [`TaskRunner`] owns two callables: an optional *start function* and a
//! required *main function*. Calling [`run`](TaskRunner::run) schedules the
//! start phase and then the main phase on the executor; every concurrent
//! observer of the same run — additional `run` calls, [`start`], [`stop`],
//! [`when_started`] — settles with that run's results. Once a run has fully
//! settled, the runner is reusable and the next call begins a fresh run.
//!
//! Stopping is always advisory: [`stop`](TaskRunner::stop) raises a signal
//! that the task observes through its [`RunnerAccess`] handle and the task
//! chooses when to exit.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::{error, fmt};

use tokio::sync::watch;

use crate::BoxError;

type TaskFuture<R> = Pin<Box<dyn Future<Output = Result<R, BoxError>> + Send>>;
type TaskFn<R> = Arc<dyn Fn(RunnerAccess) -> TaskFuture<R> + Send + Sync>;

type StartSlot<S> = Option<Result<Option<S>, RunError>>;
type ResultSlot<T> = Option<Result<T, RunError>>;

/// A reusable, restartable cooperative task.
///
/// `T` is the main function's result type and `S` the start function's;
/// both must be `Clone` because every concurrent observer of a run
/// receives its own copy of the settlement.
pub struct TaskRunner<T = (), S = ()> {
    inner: Arc<Inner<T, S>>,
}

struct Inner<T, S> {
    start_fn: Option<TaskFn<S>>,
    main_fn: TaskFn<T>,
    state: Mutex<RunnerState<T, S>>,
    generation: AtomicU64,
}

struct RunnerState<T, S> {
    phase: Phase,
    run: Option<RunHandle<T, S>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Running,
    Stopping,
}

struct RunHandle<T, S> {
    id: u64,
    stop: watch::Sender<bool>,
    started: watch::Receiver<StartSlot<S>>,
    result: watch::Receiver<ResultSlot<T>>,
}

/// An error from a failed run, cheaply cloneable so that every observer
/// of the run can receive it.
#[derive(Clone)]
pub struct RunError {
    inner: Arc<dyn error::Error + Send + Sync + 'static>,
}

impl RunError {
    fn new(source: BoxError) -> Self {
        Self {
            inner: Arc::from(source),
        }
    }

    fn panicked(which: &'static str) -> Self {
        Self::new(format!("task {which} function panicked").into())
    }
}

impl fmt::Debug for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl error::Error for RunError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&*self.inner)
    }
}

/// The handle passed to a task's start and main functions, exposing
/// stop-signal inspection.
#[derive(Clone, Debug)]
pub struct RunnerAccess {
    stop: watch::Receiver<bool>,
}

impl RunnerAccess {
    /// Whether a stop has been requested for this run.
    ///
    /// Also reports `true` once the run has fully settled.
    pub fn should_stop(&self) -> bool {
        *self.stop.borrow() || self.stop.has_changed().is_err()
    }

    /// Wait until a stop is requested for this run.
    ///
    /// Resolves promptly when the run has already settled.
    pub async fn when_stop_requested(&self) {
        let mut stop = self.stop.clone();
        // A closed channel means the run is over, which counts as stopped.
        let _ = stop.wait_for(|requested| *requested).await;
    }

    /// Race `fut` against the stop signal.
    ///
    /// Returns `Ok(true)` if stop was requested first, `Ok(false)` if
    /// `fut` settled first, and `fut`'s error if it failed. When the run
    /// is not active this promptly returns `Ok(true)` regardless of
    /// `fut`.
    pub async fn race_stop<F, O, E>(&self, fut: F) -> Result<bool, E>
    where
        F: Future<Output = Result<O, E>>,
    {
        tokio::select! {
            biased;
            _ = self.when_stop_requested() => Ok(true),
            result = fut => result.map(|_| false),
        }
    }
}

impl<T, S> Clone for TaskRunner<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, S> fmt::Debug for TaskRunner<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("TaskRunner")
            .field("phase", &state.phase)
            .finish()
    }
}

impl<T, S> TaskRunner<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    /// Create a runner with only a main function.
    ///
    /// The function is not invoked until [`run`](Self::run) or
    /// [`start`](Self::start) is called.
    pub fn new<M, F>(main_fn: M) -> Self
    where
        M: Fn(RunnerAccess) -> F + Send + Sync + 'static,
        F: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        Self::assemble(None, main_fn)
    }

    /// Create a runner with a start function and a main function.
    pub fn with_start<St, G, M, F>(start_fn: St, main_fn: M) -> Self
    where
        St: Fn(RunnerAccess) -> G + Send + Sync + 'static,
        G: Future<Output = Result<S, BoxError>> + Send + 'static,
        M: Fn(RunnerAccess) -> F + Send + Sync + 'static,
        F: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        let start_fn: TaskFn<S> =
            Arc::new(move |access| Box::pin(start_fn(access)) as TaskFuture<S>);
        Self::assemble(Some(start_fn), main_fn)
    }

    fn assemble<M, F>(start_fn: Option<TaskFn<S>>, main_fn: M) -> Self
    where
        M: Fn(RunnerAccess) -> F + Send + Sync + 'static,
        F: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                start_fn,
                main_fn: Arc::new(move |access| Box::pin(main_fn(access)) as TaskFuture<T>),
                state: Mutex::new(RunnerState {
                    phase: Phase::Idle,
                    run: None,
                }),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Begin a run, or join the run already in flight.
    ///
    /// The returned future settles with the main function's result. The
    /// start and main functions run asynchronously relative to the
    /// caller: immediately after this returns, [`is_running`] reports
    /// `true` but [`when_started`] is still unresolved.
    ///
    /// [`is_running`]: Self::is_running
    /// [`when_started`]: Self::when_started
    pub fn run(&self) -> impl Future<Output = Result<T, RunError>> + Send + 'static {
        let (_, result) = self.ensure_run();
        async move {
            settled(result)
                .await
                .unwrap_or_else(|| Err(RunError::panicked("main")))
        }
    }

    /// Begin a run, or join the run already in flight, settling when the
    /// start phase completes.
    ///
    /// Resolves with the start function's result, or `None` when the
    /// runner has no start function. The main phase continues
    /// independently.
    pub fn start(&self) -> impl Future<Output = Result<Option<S>, RunError>> + Send + 'static {
        let (started, _) = self.ensure_run();
        async move {
            settled(started)
                .await
                .unwrap_or_else(|| Err(RunError::panicked("start")))
        }
    }

    /// Request that the current run stop, and wait for it to settle.
    ///
    /// Returns `Ok(None)` promptly when no run is active.
    pub fn stop(&self) -> impl Future<Output = Result<Option<T>, RunError>> + Send + 'static {
        let result = {
            let mut state = self.inner.state.lock().unwrap();
            match &state.run {
                Some(run) => {
                    run.stop.send_replace(true);
                    Some(run.result.clone())
                }
                None => None,
            }
            .map(|result| {
                state.phase = Phase::Stopping;
                result
            })
        };
        async move {
            match result {
                None => Ok(None),
                Some(result) => settled(result)
                    .await
                    .unwrap_or_else(|| Err(RunError::panicked("main")))
                    .map(Some),
            }
        }
    }

    /// Whether a run is active, from the moment `run`/`start` is called
    /// until the main function fully settles.
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().unwrap().run.is_some()
    }

    /// Wait for the current run's start phase to complete.
    ///
    /// Pre-settled to `Ok(None)` when no run is active.
    pub fn when_started(
        &self,
    ) -> impl Future<Output = Result<Option<S>, RunError>> + Send + 'static {
        let started = {
            let state = self.inner.state.lock().unwrap();
            state.run.as_ref().map(|run| run.started.clone())
        };
        async move {
            match started {
                None => Ok(None),
                Some(started) => settled(started)
                    .await
                    .unwrap_or_else(|| Err(RunError::panicked("start"))),
            }
        }
    }

    fn ensure_run(
        &self,
    ) -> (
        watch::Receiver<StartSlot<S>>,
        watch::Receiver<ResultSlot<T>>,
    ) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(run) = &state.run {
            return (run.started.clone(), run.result.clone());
        }

        let id = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (stop_tx, stop_rx) = watch::channel(false);
        let (started_tx, started_rx) = watch::channel(None);
        let (result_tx, result_rx) = watch::channel(None);

        state.phase = Phase::Starting;
        state.run = Some(RunHandle {
            id,
            stop: stop_tx,
            started: started_rx.clone(),
            result: result_rx.clone(),
        });
        drop(state);

        let inner = self.inner.clone();
        tokio::spawn(supervise(
            self.inner.clone(),
            id,
            drive(inner, id, stop_rx, started_tx, result_tx),
        ));

        (started_rx, result_rx)
    }
}

/// Drive one run: start phase, then main phase, then settle.
async fn drive<T, S>(
    inner: Arc<Inner<T, S>>,
    id: u64,
    stop: watch::Receiver<bool>,
    started_tx: watch::Sender<StartSlot<S>>,
    result_tx: watch::Sender<ResultSlot<T>>,
) where
    T: Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    let access = RunnerAccess { stop };

    let start_outcome = match &inner.start_fn {
        Some(start_fn) => (start_fn)(access.clone()).await.map(Some),
        None => Ok(None),
    };

    match start_outcome {
        Err(source) => {
            let err = RunError::new(source);
            let _ = started_tx.send(Some(Err(err.clone())));
            let _ = result_tx.send(Some(Err(err)));
            clear_run(&inner, id);
            return;
        }
        Ok(value) => {
            set_phase(&inner, id, Phase::Running);
            let _ = started_tx.send(Some(Ok(value)));
        }
    }

    let outcome = (inner.main_fn)(access).await.map_err(RunError::new);
    let _ = result_tx.send(Some(outcome));
    clear_run(&inner, id);
}

/// Clean up after a driver that panicked, so the runner stays usable.
async fn supervise<T, S>(
    inner: Arc<Inner<T, S>>,
    id: u64,
    driver: impl Future<Output = ()> + Send + 'static,
) where
    T: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    if tokio::spawn(driver).await.is_err() {
        clear_run(&inner, id);
    }
}

fn clear_run<T, S>(inner: &Inner<T, S>, id: u64) {
    let mut state = inner.state.lock().unwrap();
    if state.run.as_ref().map(|run| run.id) == Some(id) {
        state.run = None;
        state.phase = Phase::Idle;
    }
}

fn set_phase<T, S>(inner: &Inner<T, S>, id: u64, phase: Phase) {
    let mut state = inner.state.lock().unwrap();
    if state.run.as_ref().map(|run| run.id) == Some(id) {
        state.phase = phase;
    }
}

/// Wait for a settlement slot to be filled.
///
/// Returns `None` only when the channel closed without a value, which
/// means the driver task died without settling.
async fn settled<V: Clone>(mut rx: watch::Receiver<Option<V>>) -> Option<V> {
    loop {
        if let Some(value) = rx.borrow_and_update().clone() {
            return Some(value);
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    static_assertions::assert_impl_all!(TaskRunner<usize, ()>: Send, Sync, Clone);
    static_assertions::assert_impl_all!(RunnerAccess: Send, Sync, Clone);

    fn counting_runner(count: Arc<AtomicUsize>) -> TaskRunner<usize> {
        TaskRunner::new(move |_access| {
            let count = count.clone();
            async move { Ok(count.fetch_add(1, Ordering::SeqCst) + 1) }
        })
    }

    #[tokio::test]
    async fn main_is_not_invoked_synchronously() {
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        let runner: TaskRunner<()> = TaskRunner::new(move |_access| {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        });

        let run = runner.run();
        assert!(!invoked.load(Ordering::SeqCst));
        assert!(runner.is_running());

        run.await.unwrap();
        assert!(invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn repeated_run_joins_the_same_run() {
        let count = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let release = gate.clone();
        let calls = count.clone();
        let runner: TaskRunner<usize> = TaskRunner::new(move |_access| {
            let gate = gate.clone();
            let calls = calls.clone();
            async move {
                gate.notified().await;
                Ok(calls.fetch_add(1, Ordering::SeqCst) + 1)
            }
        });

        let first = runner.run();
        let second = runner.run();
        release.notify_waiters();
        // Both observers settle with the single run's value.
        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(second.await.unwrap(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn when_started_settles_before_main_begins() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Notify::new());

        let start_order = order.clone();
        let main_order = order.clone();
        let main_gate = gate.clone();
        let runner: TaskRunner<(), ()> = TaskRunner::with_start(
            move |_access| {
                let order = start_order.clone();
                async move {
                    order.lock().unwrap().push("start");
                    Ok(())
                }
            },
            move |_access| {
                let order = main_order.clone();
                let gate = main_gate.clone();
                async move {
                    gate.notified().await;
                    order.lock().unwrap().push("main");
                    Ok(())
                }
            },
        );

        let run = runner.run();
        runner.when_started().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["start"]);

        gate.notify_waiters();
        run.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["start", "main"]);
    }

    #[tokio::test]
    async fn stop_on_idle_runner_returns_none() {
        let runner = counting_runner(Arc::new(AtomicUsize::new(0)));
        assert!(matches!(runner.stop().await, Ok(None)));
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn failed_start_rejects_both_futures_and_skips_main() {
        let main_ran = Arc::new(AtomicBool::new(false));
        let flag = main_ran.clone();
        let runner: TaskRunner<(), ()> = TaskRunner::with_start(
            |_access| async { Err("boom".into()) },
            move |_access| {
                let flag = flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        let run = runner.run();
        assert!(runner.when_started().await.is_err());
        assert!(run.await.is_err());
        assert!(!main_ran.load(Ordering::SeqCst));
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn stop_signal_reaches_main_and_settles_run() {
        let runner: TaskRunner<&'static str> = TaskRunner::new(|access| async move {
            access.when_stop_requested().await;
            Ok("done")
        });

        runner.start().await.unwrap();
        assert!(runner.is_running());
        assert_eq!(runner.stop().await.unwrap(), Some("done"));
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn settled_run_allows_a_fresh_run() {
        let count = Arc::new(AtomicUsize::new(0));
        let runner = counting_runner(count);
        assert_eq!(runner.run().await.unwrap(), 1);
        assert_eq!(runner.run().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn when_started_is_presettled_between_runs() {
        let runner = counting_runner(Arc::new(AtomicUsize::new(0)));
        assert!(matches!(runner.when_started().await, Ok(None)));
        runner.run().await.unwrap();
        assert!(matches!(runner.when_started().await, Ok(None)));
    }

    #[tokio::test]
    async fn race_stop_lets_a_settled_future_win_while_running() {
        let runner: TaskRunner<()> = TaskRunner::new(|access| async move {
            // The run is active, so the ready future wins.
            let raced = access
                .race_stop(async { Ok::<_, BoxError>(()) })
                .await
                .unwrap();
            assert!(!raced);
            Ok(())
        });
        runner.run().await.unwrap();
    }
}
