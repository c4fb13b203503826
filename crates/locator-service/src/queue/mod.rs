//! Paced, bounded FIFO dispatch of remote lookups.
//!
//! The remote side is slow and rate limited. All lookups go through one [`DispatchQueue`]
//! which:
//!
//! - holds at most `max_queue_size` waiting lookups and rejects further ones right away,
//! - dispatches in FIFO order with at most `max_concurrent` lookups in flight,
//! - keeps at least `min_interval` between two dispatches,
//! - stops dispatching while the remote side throttles us, see [`RateLimitWindow`].
//!
//! While a rate limit window is active every waiting lookup is rejected with
//! [`ResolveError::RateLimited`] instead of stalling, and new lookups are rejected until the
//! window lapses. Disabling the queue rejects waiting lookups with [`ResolveError::Disabled`].

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::caching::ResolveError;
use crate::config::QueueConfig;
use crate::remote::RemoteLookup;

mod backoff;

pub use backoff::{MAX_BACKOFF, RateLimitWindow, exponential_backoff};

/// The settled outcome of a dispatched lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LookupOutcome {
    /// The remote side answered, `None` meaning it has no value for the key.
    Answered(Option<String>),
    /// The remote side did not answer within the deadline. Its answer will be discarded.
    TimedOut,
}

/// What the queue is currently doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueStatus {
    /// Nothing to dispatch.
    Idle,
    /// A drain task works through the queue.
    Draining,
    /// The remote side throttles us and nothing is dispatched.
    RateLimited,
}

/// A snapshot of the backoff state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffInfo {
    /// Number of throttling signals since the last recovery or clean response.
    pub consecutive_hits: u32,
    /// Time left in the active rate limit window.
    pub reset_in: Option<Duration>,
}

type TaskResult = Result<LookupOutcome, ResolveError>;

struct PendingTask {
    key: String,
    sender: oneshot::Sender<TaskResult>,
    enqueued_at: Instant,
}

impl PendingTask {
    fn settle(self, result: TaskResult) {
        // The receiver is gone if the caller stopped waiting, which is fine.
        self.sender.send(result).ok();
    }
}

struct QueueState {
    tasks: VecDeque<PendingTask>,
    status: QueueStatus,
    last_dispatch: Option<Instant>,
    active: usize,
    window: RateLimitWindow,
    drain_task: Option<JoinHandle<()>>,
    recheck_task: Option<JoinHandle<()>>,
    enabled: bool,
    shut_down: bool,
}

enum DrainStep {
    /// Nothing left to do, the drain task ends.
    Done,
    /// Wait before looking again.
    Wait(Duration),
    /// All dispatch slots are taken.
    Saturated,
    /// Dispatch this task now.
    Dispatch(PendingTask),
}

struct QueueInner {
    config: QueueConfig,
    timeout: Duration,
    remote: Arc<dyn RemoteLookup>,
    state: Mutex<QueueState>,
    slot_released: Notify,
}

/// The queue of lookups waiting to be sent to the remote side.
///
/// Cloning is cheap and yields a handle to the same queue.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<QueueInner>,
}

impl fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("DispatchQueue")
            .field("status", &state.status)
            .field("queued", &state.tasks.len())
            .field("active", &state.active)
            .field("window", &state.window)
            .finish()
    }
}

impl DispatchQueue {
    /// Creates a queue dispatching to `remote`, giving each lookup `timeout` to answer.
    pub fn new(config: QueueConfig, timeout: Duration, remote: Arc<dyn RemoteLookup>) -> Self {
        let state = QueueState {
            tasks: VecDeque::new(),
            status: QueueStatus::Idle,
            last_dispatch: None,
            active: 0,
            window: RateLimitWindow::default(),
            drain_task: None,
            recheck_task: None,
            enabled: true,
            shut_down: false,
        };

        Self {
            inner: Arc::new(QueueInner {
                config,
                timeout,
                remote,
                state: Mutex::new(state),
                slot_released: Notify::new(),
            }),
        }
    }

    /// Queues a lookup of `key`.
    ///
    /// Fails right away with [`ResolveError::QueueFull`] if the queue is at capacity, with
    /// [`ResolveError::RateLimited`] while a rate limit window is active, with
    /// [`ResolveError::Disabled`] while the queue is disabled and with
    /// [`ResolveError::Cancelled`] after [`shutdown`](Self::shutdown). Otherwise returns a
    /// future that settles once the lookup has been dispatched and answered.
    ///
    /// The returned future owns everything it needs and borrows neither `self` nor `key`.
    pub fn enqueue(
        &self,
        key: &str,
    ) -> Result<impl Future<Output = TaskResult> + Send + 'static + use<>, ResolveError> {
        let mut state = self.inner.state.lock();

        if state.shut_down {
            return Err(ResolveError::Cancelled);
        }
        if !state.enabled {
            metric!(counter("queue.rejected") += 1, "reason" => "disabled");
            return Err(ResolveError::Disabled);
        }
        if let Some(retry_after) = state.window.remaining(Instant::now()) {
            metric!(counter("queue.rejected") += 1, "reason" => "rate_limited");
            return Err(ResolveError::RateLimited { retry_after });
        }
        if state.tasks.len() >= self.inner.config.max_queue_size {
            metric!(counter("queue.rejected") += 1, "reason" => "queue_full");
            tracing::debug!(key, "Dispatch queue is full, rejecting lookup");
            return Err(ResolveError::QueueFull);
        }

        let (sender, receiver) = oneshot::channel();
        state.tasks.push_back(PendingTask {
            key: key.to_owned(),
            sender,
            enqueued_at: Instant::now(),
        });
        metric!(counter("queue.enqueued") += 1);
        metric!(gauge("queue.length") = state.tasks.len() as u64);

        if state.status != QueueStatus::Draining {
            self.inner.start_drain(&mut state);
        }

        Ok(async move {
            receiver
                .await
                .unwrap_or(Err(ResolveError::Cancelled))
        })
    }

    /// Handles a throttling signal of the remote side.
    ///
    /// `reported_reset_at` is the time at which the remote side said it will accept requests
    /// again. Returns the time left in the resulting window.
    pub fn signal_rate_limit(&self, reported_reset_at: Option<SystemTime>) -> Duration {
        self.inner.signal_rate_limit(reported_reset_at)
    }

    pub fn backoff(&self) -> BackoffInfo {
        let state = self.inner.state.lock();
        BackoffInfo {
            consecutive_hits: state.window.consecutive_hits(),
            reset_in: state.window.remaining(Instant::now()),
        }
    }

    /// Switches dispatching on or off.
    ///
    /// Disabling rejects all waiting lookups with [`ResolveError::Disabled`] and every further
    /// [`enqueue`](Self::enqueue) until enabled again. Lookups already in flight run to
    /// completion. Returns the previous setting.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        let (previous, rejected) = {
            let mut state = self.inner.state.lock();
            let previous = std::mem::replace(&mut state.enabled, enabled);
            let rejected = match enabled {
                true => VecDeque::new(),
                false => std::mem::take(&mut state.tasks),
            };
            (previous, rejected)
        };

        if !rejected.is_empty() {
            tracing::debug!(count = rejected.len(), "Rejecting queued lookups, dispatch disabled");
        }
        for task in rejected {
            metric!(counter("queue.rejected") += 1, "reason" => "disabled");
            task.settle(Err(ResolveError::Disabled));
        }
        previous
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.state.lock().enabled
    }

    pub fn status(&self) -> QueueStatus {
        self.inner.state.lock().status
    }

    /// The number of lookups waiting for dispatch.
    pub fn len(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops dispatching and rejects all waiting lookups with [`ResolveError::Cancelled`].
    ///
    /// Lookups already in flight run to completion.
    pub fn shutdown(&self) {
        let tasks = {
            let mut state = self.inner.state.lock();
            state.shut_down = true;
            state.status = QueueStatus::Idle;
            for handle in [state.drain_task.take(), state.recheck_task.take()]
                .into_iter()
                .flatten()
            {
                handle.abort();
            }
            std::mem::take(&mut state.tasks)
        };

        if !tasks.is_empty() {
            tracing::debug!(count = tasks.len(), "Cancelling queued lookups");
        }
        for task in tasks {
            task.settle(Err(ResolveError::Cancelled));
        }
    }
}

impl QueueInner {
    fn start_drain(self: &Arc<Self>, state: &mut QueueState) {
        if let Some(recheck) = state.recheck_task.take() {
            recheck.abort();
        }
        state.status = QueueStatus::Draining;

        let future = Arc::clone(self)
            .drain()
            .bind_hub(Hub::new_from_top(Hub::current()));
        state.drain_task = Some(tokio::spawn(future));
    }

    async fn drain(self: Arc<Self>) {
        loop {
            match self.next_step() {
                DrainStep::Done => return,
                DrainStep::Wait(duration) => tokio::time::sleep(duration).await,
                DrainStep::Saturated => self.slot_released.notified().await,
                DrainStep::Dispatch(task) => {
                    let future = Arc::clone(&self)
                        .dispatch(task)
                        .bind_hub(Hub::new_from_top(Hub::current()));
                    tokio::spawn(future);
                }
            }
        }
    }

    /// Decides what the drain task does next.
    ///
    /// Everything happens under one lock, so the state is never observed half updated.
    fn next_step(self: &Arc<Self>) -> DrainStep {
        let mut state = self.state.lock();
        let now = Instant::now();

        if state.tasks.is_empty() {
            state.status = QueueStatus::Idle;
            state.drain_task = None;
            return DrainStep::Done;
        }

        if let Some(retry_after) = state.window.remaining(now) {
            let rejected = std::mem::take(&mut state.tasks);
            self.enter_rate_limited(&mut state, retry_after);
            drop(state);

            tracing::info!(
                rejected = rejected.len(),
                retry_after = %humantime::format_duration(retry_after),
                "Remote side is throttling, rejecting queued lookups"
            );
            for task in rejected {
                metric!(counter("queue.rejected") += 1, "reason" => "rate_limited");
                task.settle(Err(ResolveError::RateLimited { retry_after }));
            }
            return DrainStep::Done;
        }

        if state.window.recover(now) {
            tracing::info!("Rate limit window lapsed, resuming dispatch");
        }

        if let Some(last_dispatch) = state.last_dispatch {
            let elapsed = now.duration_since(last_dispatch);
            if elapsed < self.config.min_interval {
                return DrainStep::Wait(self.config.min_interval - elapsed);
            }
        }

        if state.active >= self.config.max_concurrent.max(1) {
            return DrainStep::Saturated;
        }

        let Some(task) = state.tasks.pop_front() else {
            return DrainStep::Done;
        };
        state.active += 1;
        state.last_dispatch = Some(now);
        metric!(gauge("queue.length") = state.tasks.len() as u64);
        DrainStep::Dispatch(task)
    }

    fn enter_rate_limited(self: &Arc<Self>, state: &mut QueueState, retry_after: Duration) {
        state.status = QueueStatus::RateLimited;
        state.drain_task = None;

        let delay = retry_after.min(self.config.recheck_cap);
        let future = Arc::clone(self)
            .recheck(delay)
            .bind_hub(Hub::new_from_top(Hub::current()));
        if let Some(previous) = state.recheck_task.replace(tokio::spawn(future)) {
            previous.abort();
        }
    }

    /// Waits for the rate limit window to lapse, in steps of at most `recheck_cap`.
    async fn recheck(self: Arc<Self>, mut delay: Duration) {
        loop {
            tokio::time::sleep(delay).await;
            match self.recheck_step() {
                Some(next) => delay = next,
                None => return,
            }
        }
    }

    fn recheck_step(self: &Arc<Self>) -> Option<Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();

        if let Some(remaining) = state.window.remaining(now) {
            return Some(remaining.min(self.config.recheck_cap));
        }

        state.recheck_task = None;
        if state.window.recover(now) {
            tracing::info!("Rate limit window lapsed");
        }
        if state.tasks.is_empty() {
            state.status = QueueStatus::Idle;
        } else {
            self.start_drain(&mut state);
        }
        None
    }

    async fn dispatch(self: Arc<Self>, task: PendingTask) {
        metric!(timer("queue.wait_duration") = task.enqueued_at.elapsed());
        tracing::debug!(key = %task.key, "Dispatching remote lookup");

        let result = tokio::time::timeout(self.timeout, self.remote.request(&task.key)).await;
        let (status, outcome) = match result {
            Ok(Ok(response)) if response.throttled => {
                let retry_after = self.signal_rate_limit(response.reset_at);
                ("throttled", Err(ResolveError::RateLimited { retry_after }))
            }
            Ok(Ok(response)) => {
                self.state.lock().window.record_success();
                ("answered", Ok(LookupOutcome::Answered(response.value)))
            }
            Ok(Err(error)) => {
                tracing::warn!(
                    key = %task.key,
                    error = &error as &dyn std::error::Error,
                    "Remote lookup failed"
                );
                ("failed", Err(ResolveError::Remote(error.to_string())))
            }
            Err(_elapsed) => {
                tracing::debug!(key = %task.key, "Remote lookup timed out");
                ("timeout", Ok(LookupOutcome::TimedOut))
            }
        };

        metric!(counter("queue.dispatch") += 1, "status" => status);
        task.settle(outcome);

        tokio::time::sleep(self.config.cooldown).await;
        self.state.lock().active -= 1;
        self.slot_released.notify_one();
    }

    fn signal_rate_limit(&self, reported_reset_at: Option<SystemTime>) -> Duration {
        let now = Instant::now();
        // Convert the wall clock time of the remote side into our monotonic clock. Times in the
        // past do not extend the window.
        let reported = reported_reset_at
            .and_then(|reset_at| reset_at.duration_since(SystemTime::now()).ok())
            .map(|remaining| now + remaining.min(MAX_BACKOFF));

        let mut state = self.state.lock();
        let reset_at = state
            .window
            .signal(now, reported, self.config.base_backoff);
        let hits = state.window.consecutive_hits();
        drop(state);

        let retry_after = reset_at.saturating_duration_since(now);
        metric!(counter("queue.rate_limited") += 1);
        tracing::info!(
            consecutive_hits = hits,
            retry_after = %humantime::format_duration(retry_after),
            "Remote side signalled rate limiting"
        );
        retry_after
    }
}
