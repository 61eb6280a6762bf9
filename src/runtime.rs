//! Time and timer ports
//!
//! Session timers (proactive refresh, inactivity watchdog) and retry
//! back-off never touch the wall clock or `tokio::time` directly. They go
//! through [`Clock`] and [`Scheduler`], which have two implementations:
//!
//! - [`SystemClock`] + [`TokioScheduler`] for production
//! - [`ManualClock`] + [`ManualScheduler`] for tests, where time only moves
//!   when the test calls [`ManualScheduler::advance`]
//!
//! # Example
//!
//! ```
//! use anthropic_oauth_session::runtime::{
//!     Clock, ManualClock, ManualScheduler, Scheduler, timer_task,
//! };
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let clock = ManualClock::new(0);
//! let scheduler = ManualScheduler::new(clock.clone());
//! let fired = Arc::new(AtomicBool::new(false));
//!
//! let flag = fired.clone();
//! scheduler.after(
//!     Duration::from_secs(60),
//!     timer_task(move || async move { flag.store(true, Ordering::SeqCst) }),
//! );
//!
//! scheduler.advance(Duration::from_secs(59)).await;
//! assert!(!fired.load(Ordering::SeqCst));
//! scheduler.advance(Duration::from_secs(1)).await;
//! assert!(fired.load(Ordering::SeqCst));
//! assert_eq!(clock.now_millis(), 60_000);
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

/// Source of the current time, in Unix milliseconds
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch
    fn now_millis(&self) -> u64;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64
    }
}

/// Virtual clock that only moves when told to
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock starting at `start_millis`
    #[must_use]
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_millis)),
        }
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Jump to an absolute time
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Deferred unit of work run by a [`Scheduler`]
pub type TimerTask = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Wrap an async closure as a [`TimerTask`]
pub fn timer_task<F, Fut>(f: F) -> TimerTask
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move || f().boxed())
}

/// Handle used to cancel a scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    /// Numeric id of the timer
    #[must_use]
    pub fn id(self) -> u64 {
        self.0
    }
}

/// Timer port
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run `task` once after `delay`
    fn after(&self, delay: Duration, task: TimerTask) -> TimerHandle;

    /// Cancel a pending task; cancelling a fired or unknown handle is a no-op
    fn cancel(&self, handle: TimerHandle);

    /// Suspend the caller for `delay` (retry back-off, rate-limit cooldown)
    async fn sleep(&self, delay: Duration);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`Scheduler`] backed by spawned tokio tasks
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Default)]
pub struct TokioScheduler {
    next_id: AtomicU64,
    timers: Arc<Mutex<HashMap<u64, CancellationToken>>>,
}

impl TokioScheduler {
    /// Create a scheduler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of timers that have not fired or been cancelled
    #[must_use]
    pub fn pending(&self) -> usize {
        lock(&self.timers).len()
    }
}

#[async_trait]
impl Scheduler for TokioScheduler {
    fn after(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = TimerHandle(id);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(timer = id, "No tokio runtime; timer dropped");
            return handle;
        };

        let token = CancellationToken::new();
        lock(&self.timers).insert(id, token.clone());
        let timers = Arc::clone(&self.timers);

        runtime.spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    lock(&timers).remove(&id);
                    task().await;
                }
            }
        });

        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(token) = lock(&self.timers).remove(&handle.0) {
            token.cancel();
        }
    }

    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

#[derive(Default)]
struct ManualState {
    next_id: u64,
    pending: BTreeMap<(u64, u64), TimerTask>,
    slept: Vec<Duration>,
}

/// Virtual-time [`Scheduler`] for deterministic tests
///
/// Tasks run only inside [`advance`](Self::advance) or
/// [`run_due`](Self::run_due), in due-time order. [`Scheduler::sleep`]
/// returns immediately after moving the clock forward and recording the
/// requested delay.
#[derive(Clone)]
pub struct ManualScheduler {
    clock: ManualClock,
    state: Arc<Mutex<ManualState>>,
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("now", &self.clock.now_millis())
            .field("pending", &self.pending())
            .finish()
    }
}

impl ManualScheduler {
    /// Create a scheduler driving `clock`
    #[must_use]
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            state: Arc::new(Mutex::new(ManualState::default())),
        }
    }

    /// The clock this scheduler drives
    #[must_use]
    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Number of pending tasks
    #[must_use]
    pub fn pending(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Delays requested through [`Scheduler::sleep`], in order
    #[must_use]
    pub fn slept(&self) -> Vec<Duration> {
        lock(&self.state).slept.clone()
    }

    /// Sum of all recorded sleeps
    #[must_use]
    pub fn total_slept(&self) -> Duration {
        lock(&self.state).slept.iter().sum()
    }

    /// Move time forward by `by`, running every task that comes due
    pub async fn advance(&self, by: Duration) {
        let target = self.clock.now_millis() + by.as_millis() as u64;
        self.run_until(target).await;
        if self.clock.now_millis() < target {
            self.clock.set(target);
        }
    }

    /// Run tasks that are already due without moving time
    pub async fn run_due(&self) {
        self.run_until(self.clock.now_millis()).await;
    }

    async fn run_until(&self, target: u64) {
        loop {
            let next = {
                let mut state = lock(&self.state);
                let first_due = state.pending.first_key_value().map(|(&(due, _), _)| due);
                match first_due {
                    Some(due) if due <= target => state.pending.pop_first(),
                    _ => None,
                }
            };
            let Some(((due, _), task)) = next else {
                break;
            };
            if self.clock.now_millis() < due {
                self.clock.set(due);
            }
            task().await;
        }
    }
}

#[async_trait]
impl Scheduler for ManualScheduler {
    fn after(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let due = self.clock.now_millis() + delay.as_millis() as u64;
        let mut state = lock(&self.state);
        let id = state.next_id;
        state.next_id += 1;
        state.pending.insert((due, id), task);
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        lock(&self.state)
            .pending
            .retain(|&(_, id), _| id != handle.0);
    }

    async fn sleep(&self, delay: Duration) {
        lock(&self.state).slept.push(delay);
        self.clock.advance(delay);
    }
}
