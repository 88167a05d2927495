//! Named schedulers for handler execution.
//!
//! A [`Scheduler`] pairs an [`Executor`] with an optional [`TimeoutPolicy`].
//! Each scheduled request carries a [`ScheduleTicket`] whose state moves
//! `Submitted -> Running -> Completing -> Done`; the queued timeout can only
//! win the `Submitted -> Running` transition and the first-byte timeout can
//! only win before `Completing`, so a timed-out request never races a
//! response that is being written.
//!
//! ## Example
//!
//! ```rust,ignore
//! let biz = Scheduler::new("biz", Arc::new(BoundedExecutor::new(BoundedConfig::new("biz", 64))))
//!     .with_policy(TimeoutPolicy::QueuedTimeout(Duration::from_millis(100)));
//! ```

use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::future::{Future, pending};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, info, warn};

/// Name of the scheduler used when nothing else is configured.
pub const BIZ: &str = "biz";

/// Scheduler that runs handlers on the calling task.
pub const IO: &str = "io";

/// Runs scheduled work.
///
/// The task may borrow request state, so executors drive it to completion
/// before returning rather than detaching it.
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    /// Runs the task, or refuses it with [`Error::SchedulerRejected`].
    async fn execute(&self, task: BoxFuture<'_, ()>) -> Result<()>;

    /// Runs owned work on the executor's own threads, from inside a task
    /// started by [`execute`](Executor::execute).
    ///
    /// Executors without threads of their own run it in place. Dropping the
    /// returned future cancels the work.
    async fn offload(&self, work: BoxFuture<'static, ()>) -> Result<()> {
        work.await;
        Ok(())
    }

    fn stats(&self) -> Option<ExecutorStats> {
        None
    }
}

/// Counters of a bounded executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub active: usize,
    pub queued: usize,
    pub completed: u64,
    pub rejected: u64,
}

/// Runs tasks inline on the caller.
#[derive(Debug, Clone)]
pub struct DirectExecutor {
    name: String,
}

impl DirectExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Executor for DirectExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, task: BoxFuture<'_, ()>) -> Result<()> {
        task.await;
        Ok(())
    }
}

/// Bounded executor configuration.
#[derive(Debug, Clone)]
pub struct BoundedConfig {
    pub name: String,
    /// Tasks allowed to run at once.
    pub max_concurrent: usize,
    /// Tasks allowed to wait for a slot; `None` is unbounded.
    pub queue_capacity: Option<usize>,
    /// Threads of the pool runtime; defaults to `max_concurrent` capped at
    /// the available cores.
    pub worker_threads: Option<usize>,
}

impl BoundedConfig {
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        Self {
            name: name.into(),
            max_concurrent: max_concurrent.max(1),
            queue_capacity: None,
            worker_threads: None,
        }
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads.max(1));
        self
    }

    fn pool_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| {
            let cores = std::thread::available_parallelism().map_or(4, |n| n.get());
            self.max_concurrent.min(cores)
        })
    }
}

/// Limits concurrent tasks with a semaphore; extra tasks wait in a bounded
/// queue and are rejected once it is full.
///
/// Offloaded work runs on a dedicated runtime whose threads are named
/// `<name>-worker`, started on first use.
pub struct BoundedExecutor {
    config: BoundedConfig,
    runtime: OnceCell<Runtime>,
    semaphore: Semaphore,
    active: AtomicUsize,
    queued: AtomicUsize,
    completed: AtomicU64,
    rejected: AtomicU64,
}

impl BoundedExecutor {
    pub fn new(config: BoundedConfig) -> Self {
        info!(
            name = %config.name,
            max_concurrent = config.max_concurrent,
            queue_capacity = ?config.queue_capacity,
            "bounded executor initialized"
        );
        Self {
            semaphore: Semaphore::new(config.max_concurrent),
            runtime: OnceCell::new(),
            config,
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &BoundedConfig {
        &self.config
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime.get_or_try_init(|| {
            let threads = self.config.pool_threads();
            let runtime = Builder::new_multi_thread()
                .worker_threads(threads)
                .thread_name(format!("{}-worker", self.config.name))
                .enable_all()
                .build()
                .map_err(|e| {
                    Error::Internal(format!(
                        "executor '{}' failed to start its runtime: {e}",
                        self.config.name
                    ))
                })?;
            debug!(executor = %self.config.name, threads, "executor runtime started");
            Ok(runtime)
        })
    }

    /// Claims a queue slot unless the queue is full.
    fn reserve_queue_slot(&self) -> Option<QueueSlot<'_>> {
        let capacity = self.config.queue_capacity;
        self.queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                capacity.is_none_or(|c| n < c).then_some(n + 1)
            })
            .ok()
            .map(|_| QueueSlot(&self.queued))
    }
}

impl Drop for BoundedExecutor {
    fn drop(&mut self) {
        // Dropping a runtime from async context panics; detach instead.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// A reserved place in the wait queue, released when dropped.
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Aborts a spawned task if its awaiting future is dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Decrements a gauge when dropped, including on cancellation.
struct Gauge<'a>(&'a AtomicUsize);

impl<'a> Gauge<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Gauge<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Executor for BoundedExecutor {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn execute(&self, task: BoxFuture<'_, ()>) -> Result<()> {
        let permit = match self.semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                let Some(_waiting) = self.reserve_queue_slot() else {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    debug!(executor = %self.config.name, "executor queue full, rejecting task");
                    return Err(Error::SchedulerRejected(format!(
                        "executor '{}' is saturated",
                        self.config.name
                    )));
                };
                self.semaphore.acquire().await.map_err(|_| {
                    Error::SchedulerRejected(format!("executor '{}' is closed", self.config.name))
                })?
            }
        };

        let _active = Gauge::enter(&self.active);
        task.await;
        drop(permit);
        self.completed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn offload(&self, work: BoxFuture<'static, ()>) -> Result<()> {
        let mut handle = AbortOnDrop(self.runtime()?.spawn(work));
        (&mut handle.0).await.map_err(|e| {
            if e.is_panic() {
                Error::HandlerInvocation(format!("task on '{}' panicked", self.config.name))
            } else {
                Error::Internal(format!("task on '{}' was cancelled", self.config.name))
            }
        })
    }

    fn stats(&self) -> Option<ExecutorStats> {
        Some(ExecutorStats {
            active: self.active.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        })
    }
}

/// Timeout applied by a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Longest time a task may wait between submission and starting.
    QueuedTimeout(Duration),
    /// Longest time from submission until the response starts being written.
    TimeToFirstByte(Duration),
}

/// Lifecycle of one scheduled request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScheduleState {
    Submitted = 0,
    Running = 1,
    Completing = 2,
    Done = 3,
    Rejected = 4,
    TimedOut = 5,
}

impl ScheduleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ScheduleState::Submitted,
            1 => ScheduleState::Running,
            2 => ScheduleState::Completing,
            3 => ScheduleState::Done,
            4 => ScheduleState::Rejected,
            _ => ScheduleState::TimedOut,
        }
    }
}

/// Shared state of one scheduled request.
pub struct ScheduleTicket {
    state: AtomicU8,
    submitted: Instant,
    scheduler: Arc<str>,
}

impl ScheduleTicket {
    fn new(scheduler: Arc<str>) -> Self {
        Self {
            state: AtomicU8::new(ScheduleState::Submitted as u8),
            submitted: Instant::now(),
            scheduler,
        }
    }

    pub fn state(&self) -> ScheduleState {
        ScheduleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted
    }

    pub fn scheduler(&self) -> &str {
        &self.scheduler
    }

    fn transition(&self, from: ScheduleState, to: ScheduleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Marks the handler as finished and the response about to be written.
    ///
    /// Fails once the first-byte deadline has claimed the request.
    pub fn enter_completing(&self) -> Result<()> {
        if self.transition(ScheduleState::Running, ScheduleState::Completing) {
            Ok(())
        } else {
            Err(Error::FirstByteTimeout(format!(
                "scheduler '{}' timed out before the response started",
                self.scheduler
            )))
        }
    }

    fn time_out(&self) -> bool {
        self.transition(ScheduleState::Submitted, ScheduleState::TimedOut)
            || self.transition(ScheduleState::Running, ScheduleState::TimedOut)
    }
}

impl fmt::Debug for ScheduleTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleTicket")
            .field("scheduler", &self.scheduler)
            .field("state", &self.state())
            .finish()
    }
}

/// A named executor with an optional timeout policy.
pub struct Scheduler {
    name: Arc<str>,
    executor: Arc<dyn Executor>,
    policy: Option<TimeoutPolicy>,
    rejected: AtomicU64,
    timed_out: AtomicU64,
}

impl Scheduler {
    pub fn new(name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        Self {
            name: Arc::from(name.into()),
            executor,
            policy: None,
            rejected: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        }
    }

    pub fn direct(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(name.clone(), Arc::new(DirectExecutor::new(name)))
    }

    pub fn bounded(config: BoundedConfig) -> Self {
        let name = config.name.clone();
        Self::new(name, Arc::new(BoundedExecutor::new(config)))
    }

    pub fn with_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> Option<TimeoutPolicy> {
        self.policy
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub fn rejections(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    /// Runs `task` under this scheduler's executor and timeout policy.
    ///
    /// The task receives its ticket and must call
    /// [`ScheduleTicket::enter_completing`] before writing the response.
    pub async fn schedule<'a, T, F, Fut>(&'a self, task: F) -> Result<T>
    where
        T: Send + 'a,
        F: FnOnce(Arc<ScheduleTicket>) -> Fut + Send + 'a,
        Fut: Future<Output = Result<T>> + Send + 'a,
    {
        let ticket = Arc::new(ScheduleTicket::new(self.name.clone()));
        let mut output: Option<Result<T>> = None;

        let run_ticket = ticket.clone();
        let slot = &mut output;
        let run = async move {
            if !run_ticket.transition(ScheduleState::Submitted, ScheduleState::Running) {
                return;
            }
            let result = task(run_ticket.clone()).await;
            run_ticket.transition(ScheduleState::Completing, ScheduleState::Done);
            *slot = Some(result);
        };

        let queued_limit = match self.policy {
            Some(TimeoutPolicy::QueuedTimeout(limit)) => Some(limit),
            _ => None,
        };
        let first_byte_deadline = match self.policy {
            Some(TimeoutPolicy::TimeToFirstByte(limit)) => Some(ticket.submitted + limit),
            _ => None,
        };

        let queued_watch = async {
            if let Some(limit) = queued_limit {
                sleep(limit).await;
                if ticket.transition(ScheduleState::Submitted, ScheduleState::Rejected) {
                    return;
                }
            }
            pending::<()>().await
        };
        let first_byte_watch = async {
            if let Some(deadline) = first_byte_deadline {
                sleep_until(deadline).await;
                if ticket.time_out() {
                    return;
                }
            }
            pending::<()>().await
        };

        let executed = tokio::select! {
            executed = self.executor.execute(Box::pin(run)) => executed,
            _ = queued_watch => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(scheduler = %self.name, limit = ?queued_limit, "task waited too long in queue");
                return Err(Error::SchedulerRejected(format!(
                    "scheduler '{}' queued timeout exceeded",
                    self.name
                )));
            }
            _ = first_byte_watch => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(scheduler = %self.name, "first byte deadline exceeded");
                return Err(Error::FirstByteTimeout(format!(
                    "scheduler '{}' exceeded its first byte deadline",
                    self.name
                )));
            }
        };

        if let Err(err) = executed {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(scheduler = %self.name, error = %err, "task rejected by executor");
            return Err(err);
        }
        output.unwrap_or_else(|| {
            Err(Error::Internal(format!(
                "scheduler '{}' finished without running the task ({:?})",
                self.name,
                ticket.state()
            )))
        })
    }

    /// Runs owned work on this scheduler's executor threads and returns its
    /// output. Call from inside a [`schedule`](Scheduler::schedule) task so
    /// the timeout policy and concurrency limit still apply.
    pub async fn offload<T, Fut>(&self, work: Fut) -> Result<T>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.executor
            .offload(Box::pin(async move {
                let _ = tx.send(work.await);
            }))
            .await?;
        rx.await.map_err(|_| {
            Error::Internal(format!("scheduler '{}' dropped offloaded work", self.name))
        })?
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("executor", &self.executor.name())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Registry of schedulers by name.
#[derive(Debug, Clone)]
pub struct Schedulers {
    entries: HashMap<String, Arc<Scheduler>>,
    default: String,
}

impl Default for Schedulers {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl Schedulers {
    /// An empty registry whose default is `biz`.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
            default: BIZ.to_string(),
        }
    }

    /// `biz`, a bounded pool sized to twice the available cores, and `io`,
    /// which runs inline.
    pub fn with_defaults() -> Self {
        let cores = std::thread::available_parallelism().map_or(4, |n| n.get());
        let mut schedulers = Self::empty();
        schedulers.register(Scheduler::bounded(
            BoundedConfig::new(BIZ, cores * 2).queue_capacity(1024),
        ));
        schedulers.register(Scheduler::direct(IO));
        schedulers
    }

    /// Adds or replaces a scheduler under its own name.
    pub fn register(&mut self, scheduler: Scheduler) {
        self.entries
            .insert(scheduler.name().to_string(), Arc::new(scheduler));
    }

    pub fn set_default(&mut self, name: impl Into<String>) {
        self.default = name.into();
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Scheduler>> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Picks the scheduler for a route: an explicit override, then the
    /// handler's own choice, then the controller default, then the global
    /// default.
    pub fn resolve(
        &self,
        override_name: Option<&str>,
        method: Option<&str>,
        route_default: Option<&str>,
    ) -> Result<Arc<Scheduler>> {
        let name = override_name
            .or(method)
            .or(route_default)
            .unwrap_or(&self.default);
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Deployment(format!("no scheduler named '{name}'")))
    }
}
