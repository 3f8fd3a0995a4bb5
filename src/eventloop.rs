// src/eventloop.rs

//! Timers for the engine.
//!
//! The engine never sleeps itself: it asks an injected [`EventLoop`] to
//! deliver a [`TimerEvent`] after a delay, and the event comes back in
//! through the runtime channel like any other input.
//!
//! - [`TokioEventLoop`] spawns a sleeping task per timer.
//! - [`ManualEventLoop`] keeps timers in a list and releases them when the
//!   test advances its clock.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::engine::RuntimeEvent;

/// What a timer asks the engine to do when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// Run (or promote from the queue) a scheduled job run.
    RunJob {
        job: String,
        run_num: u64,
        run_queued: bool,
    },
    /// `max_runtime` elapsed for a job run.
    StopJobRun { job: String, run_num: u64 },
    /// Submit a delayed recovery probe for an action run.
    SubmitRecovery {
        job: String,
        run_num: u64,
        action: String,
    },
    /// Debounced repair of a service.
    RepairService { service: String },
    /// Periodic monitor probe for a service instance.
    MonitorInstance { service: String, instance: u32 },
    /// The monitor probe took too long to answer.
    MonitorHangCheck { service: String, instance: u32 },
}

/// Identifies one pending timer so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// Injected clock and timer service.
pub trait EventLoop: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;

    /// Deliver `event` once `delay` has elapsed.
    fn call_later(&self, delay: Duration, event: TimerEvent) -> TimerHandle;

    /// Cancel a pending timer. Cancelling a fired or unknown timer is a no-op.
    fn cancel(&self, handle: TimerHandle);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Production event loop backed by Tokio timers.
///
/// `call_later` must be invoked from within a Tokio runtime.
pub struct TokioEventLoop {
    tx: mpsc::Sender<RuntimeEvent>,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, AbortHandle>>>,
}

impl fmt::Debug for TokioEventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioEventLoop")
            .field("pending", &lock(&self.pending).len())
            .finish()
    }
}

impl TokioEventLoop {
    pub fn new(tx: mpsc::Sender<RuntimeEvent>) -> Self {
        Self {
            tx,
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl EventLoop for TokioEventLoop {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn call_later(&self, delay: Duration, event: TimerEvent) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tx = self.tx.clone();
        let pending = Arc::clone(&self.pending);

        // Hold the map lock across spawn so a zero-delay timer cannot try to
        // remove itself before it was inserted.
        let mut guard = lock(&self.pending);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            lock(&pending).remove(&id);
            if tx.send(RuntimeEvent::Timer(event)).await.is_err() {
                debug!(timer = id, "runtime channel closed before timer fired");
            }
        });
        guard.insert(id, task.abort_handle());
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(task) = lock(&self.pending).remove(&handle.0) {
            task.abort();
        }
    }
}

#[derive(Debug)]
struct ManualTimer {
    due: DateTime<Utc>,
    id: u64,
    event: TimerEvent,
}

/// Deterministic event loop for tests and dry runs.
#[derive(Debug)]
pub struct ManualEventLoop {
    now: Mutex<DateTime<Utc>>,
    next_id: AtomicU64,
    timers: Mutex<Vec<ManualTimer>>,
}

impl ManualEventLoop {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            next_id: AtomicU64::new(1),
            timers: Mutex::new(Vec::new()),
        }
    }

    /// Move the clock forward and return every timer now due, ordered by due
    /// time then registration order.
    pub fn advance(&self, by: Duration) -> Vec<TimerEvent> {
        let now = {
            let mut now = lock(&self.now);
            *now += to_delta(by);
            *now
        };
        self.take_due(now)
    }

    /// Timers due at the current instant (e.g. zero-delay callbacks).
    pub fn due_now(&self) -> Vec<TimerEvent> {
        let now = *lock(&self.now);
        self.take_due(now)
    }

    fn take_due(&self, now: DateTime<Utc>) -> Vec<TimerEvent> {
        let mut timers = lock(&self.timers);
        let (mut due, rest): (Vec<_>, Vec<_>) = timers.drain(..).partition(|t| t.due <= now);
        *timers = rest;
        due.sort_by_key(|t| (t.due, t.id));
        due.into_iter().map(|t| t.event).collect()
    }

    /// Pending timers with their remaining delay, soonest first.
    pub fn pending(&self) -> Vec<(Duration, TimerEvent)> {
        let now = *lock(&self.now);
        let mut timers: Vec<_> = lock(&self.timers)
            .iter()
            .map(|t| {
                let left = (t.due - now).to_std().unwrap_or(Duration::ZERO);
                (left, t.id, t.event.clone())
            })
            .collect();
        timers.sort_by_key(|(left, id, _)| (*left, *id));
        timers.into_iter().map(|(left, _, e)| (left, e)).collect()
    }

    pub fn set_now(&self, now: DateTime<Utc>) {
        *lock(&self.now) = now;
    }
}

impl EventLoop for ManualEventLoop {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }

    fn call_later(&self, delay: Duration, event: TimerEvent) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let due = *lock(&self.now) + to_delta(delay);
        lock(&self.timers).push(ManualTimer { due, id, event });
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        lock(&self.timers).retain(|t| t.id != handle.0);
    }
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or_else(|_| {
        warn!(?d, "timer delay out of range; clamping to 100 years");
        TimeDelta::days(36_500)
    })
}

/// A timer that can only be pending once at a time.
///
/// `start` is a no-op while a previous start has not fired or been
/// cancelled. The owner calls [`UniqueCallback::fired`] when the event is
/// delivered.
#[derive(Debug, Clone)]
pub struct UniqueCallback {
    delay: Duration,
    event: TimerEvent,
    handle: Option<TimerHandle>,
}

impl UniqueCallback {
    pub fn new(delay: Duration, event: TimerEvent) -> Self {
        Self {
            delay,
            event,
            handle: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Arm the timer. Returns false if it was already pending or the delay
    /// is zero (a zero delay disables the callback).
    pub fn start(&mut self, event_loop: &dyn EventLoop) -> bool {
        if self.handle.is_some() || self.delay.is_zero() {
            return false;
        }
        self.handle = Some(event_loop.call_later(self.delay, self.event.clone()));
        true
    }

    pub fn cancel(&mut self, event_loop: &dyn EventLoop) {
        if let Some(handle) = self.handle.take() {
            event_loop.cancel(handle);
        }
    }

    pub fn fired(&mut self) {
        self.handle = None;
    }

    pub fn is_pending(&self) -> bool {
        self.handle.is_some()
    }
}
