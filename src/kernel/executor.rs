//! Loop driver for cooperative multitasking
//!
//! Single-threaded, run-to-suspension scheduling:
//! - Runnable tasks are resumed in FIFO order of becoming runnable
//! - Suspension points are timed waits, yields and awaits on other tasks
//! - Completion callbacks fire synchronously, before any awaiter resumes
//! - The driver idles on its clock only when nothing is runnable
//! - Wakers are thread-safe and funnel into one queue drained by the driver
//!
//! The loop is passed explicitly: task bodies capture a clone of the
//! `EventLoop` they need. There is no ambient current loop.

use super::clock::{Clock, ManualClock, SystemClock};
use super::config::{ClockKind, LoopConfig};
use super::error::{Error, Result, TimeoutError};
use super::registry::Registry;
use super::task::{
    BoxBody, Join, Schedulable, Task, TaskCell, TaskHandle, TaskId, TaskResult, TaskState,
    panic_message,
};
use super::timer::{TimerKey, TimerQueue};
use super::trace::{DEFAULT_TRACE_CAPACITY, LoopStats, TraceEvent, TraceKind, Tracer};
use futures::FutureExt;
use futures::task::{ArcWake, waker};
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

// ============================================================================
// Wakers
// ============================================================================

/// Task ids signalled by wakers since the driver last looked
#[derive(Default)]
struct WakeQueue {
    woken: Mutex<Vec<TaskId>>,
}

impl WakeQueue {
    fn take(&self) -> Vec<TaskId> {
        std::mem::take(&mut *self.woken.lock())
    }

    fn is_empty(&self) -> bool {
        self.woken.lock().is_empty()
    }
}

struct TaskWaker {
    task: TaskId,
    queue: Arc<WakeQueue>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.queue.woken.lock().push(arc_self.task);
    }
}

// ============================================================================
// Loop state
// ============================================================================

struct Shared {
    registry: RefCell<Registry>,
    timers: RefCell<TimerQueue>,
    wakes: Arc<WakeQueue>,
    clock: Rc<dyn Clock>,
    started: Instant,
    /// Task whose body is executing right now
    current: Cell<Option<TaskId>>,
    /// Set while `run`, `drive` or `tick` is on the stack
    driving: Cell<bool>,
    tracer: RefCell<Tracer>,
}

impl Shared {
    fn record(&self, kind: TraceKind, task: Option<TaskId>) {
        let at = self.clock.now().saturating_duration_since(self.started);
        self.tracer.borrow_mut().record(at, kind, task);
    }
}

/// Resets the re-entrancy flag when driving stops, including by unwinding
struct DriveGuard<'a> {
    driving: &'a Cell<bool>,
}

impl Drop for DriveGuard<'_> {
    fn drop(&mut self) {
        self.driving.set(false);
    }
}

/// Restores the previously running task id when a resume ends, even by unwinding
struct CurrentGuard<'a> {
    current: &'a Cell<Option<TaskId>>,
    previous: Option<TaskId>,
}

impl Drop for CurrentGuard<'_> {
    fn drop(&mut self) {
        self.current.set(self.previous);
    }
}

/// The event loop: task registry, timer queue and driver in one handle
///
/// Cloning is cheap and every clone drives the same loop.
#[derive(Clone)]
pub struct EventLoop {
    shared: Rc<Shared>,
}

impl EventLoop {
    /// A loop on the system clock
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// A loop on a caller-provided clock
    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self::build(Rc::new(clock), DEFAULT_TRACE_CAPACITY)
    }

    pub fn from_config(config: &LoopConfig) -> Self {
        let clock: Rc<dyn Clock> = match config.clock {
            ClockKind::System => Rc::new(SystemClock),
            ClockKind::Manual => Rc::new(ManualClock::new()),
        };
        Self::build(clock, config.trace_capacity)
    }

    fn build(clock: Rc<dyn Clock>, trace_capacity: usize) -> Self {
        let started = clock.now();
        Self {
            shared: Rc::new(Shared {
                registry: RefCell::new(Registry::new()),
                timers: RefCell::new(TimerQueue::new()),
                wakes: Arc::new(WakeQueue::default()),
                clock,
                started,
                current: Cell::new(None),
                driving: Cell::new(false),
                tracer: RefCell::new(Tracer::new(trace_capacity)),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Submission and completion
    // ------------------------------------------------------------------------

    /// Register `work` as a new task. It does not run until the loop is driven.
    pub fn submit<F>(&self, work: F) -> TaskHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.register(move |_| async move { Ok::<_, Error>(work.await) })
    }

    /// Register fallible work; an `Err` becomes the task's `TaskFailure`.
    pub fn submit_fallible<F, T, E>(&self, work: F) -> TaskHandle<T>
    where
        F: Future<Output = std::result::Result<T, E>> + 'static,
        T: 'static,
        E: fmt::Display,
    {
        self.register(move |task| async move {
            work.await.map_err(|err| Error::TaskFailure {
                task,
                reason: err.to_string(),
            })
        })
    }

    fn register<T, B, Fut>(&self, make_body: B) -> TaskHandle<T>
    where
        T: 'static,
        B: FnOnce(TaskId) -> Fut,
        Fut: Future<Output = TaskResult<T>> + 'static,
    {
        let id = self.shared.registry.borrow_mut().allocate_id();
        let body: BoxBody<T> = Box::pin(catch_panics(id, make_body(id)));
        let cell = Rc::new(TaskCell::new(id, TaskState::Created));
        self.shared
            .registry
            .borrow_mut()
            .insert(Rc::new(Task::new(cell.clone(), Some(body))));

        tracing::debug!(task = %id, "submitted");
        self.shared.record(TraceKind::Submitted, Some(id));
        TaskHandle::new(cell)
    }

    /// A body-less task, finished only by [`complete`](Self::complete).
    pub fn promise<T: 'static>(&self) -> TaskHandle<T> {
        let cell = {
            let mut registry = self.shared.registry.borrow_mut();
            let id = registry.allocate_id();
            let cell = Rc::new(TaskCell::new(id, TaskState::Suspended));
            registry.insert(Rc::new(Task::new(cell.clone(), None)));
            cell
        };

        let handle = TaskHandle::new(cell);
        tracing::debug!(task = %handle.id(), "promise created");
        self.shared.record(TraceKind::Submitted, Some(handle.id()));
        handle
    }

    /// Finish a task with an explicit outcome.
    ///
    /// Callbacks fire before this returns. The task's body, if it has one,
    /// is dropped. A second completion is `InvalidState`.
    pub fn complete<T: 'static>(&self, handle: &TaskHandle<T>, outcome: TaskResult<T>) -> Result<()> {
        handle.cell().complete(outcome)?;
        self.finish(handle.id());
        Ok(())
    }

    /// Run `callback` with the task's outcome once it finishes.
    ///
    /// If the task already finished, the callback runs before this returns.
    /// A panicking callback is logged and does not stop the others.
    pub fn attach_callback<T, C>(&self, handle: &TaskHandle<T>, callback: C) -> Result<()>
    where
        T: 'static,
        C: FnOnce(&TaskResult<T>) + 'static,
    {
        handle.cell().attach(Box::new(callback))
    }

    /// Future resolving to a copy of another task's outcome; await it from a
    /// task body.
    pub fn await_result<T: Clone>(&self, handle: &TaskHandle<T>) -> Join<T> {
        handle.join()
    }

    // ------------------------------------------------------------------------
    // Suspension primitives
    // ------------------------------------------------------------------------

    /// Resume `task` after `delay`.
    ///
    /// The task only resumes if it is suspended when the entry comes due.
    pub fn schedule_wake(&self, task: impl Into<TaskId>, delay: Duration) -> Result<TimerKey> {
        let task = task.into();
        match self.shared.registry.borrow().state(task) {
            Some(state) if !state.is_terminal() => {}
            state => return Err(Error::invalid_state(task, "schedule wake for", state)),
        }

        let now = self.shared.clock.now();
        let key = self.shared.timers.borrow_mut().schedule_wake(task, delay, now);
        tracing::trace!(task = %task, ?delay, "wake scheduled");
        self.shared.record(TraceKind::TimerScheduled, Some(task));
        Ok(key)
    }

    /// Suspend the current task for `delay`.
    ///
    /// # Panics
    ///
    /// The returned future panics if polled outside a task body running on
    /// this loop.
    pub fn sleep(&self, delay: Duration) -> Sleep {
        Sleep {
            shared: self.shared.clone(),
            delay,
            timer: None,
            done: false,
        }
    }

    /// Give every other runnable task a turn before continuing.
    pub fn yield_now(&self) -> YieldNow {
        YieldNow { yielded: false }
    }

    /// Fail with `TimeoutError` if `future` does not finish within `delay`.
    pub fn timeout<F: Future>(&self, delay: Duration, future: F) -> Timeout<F> {
        Timeout {
            future,
            sleep: self.sleep(delay),
        }
    }

    /// Move a suspended task to the back of the runnable queue.
    pub fn mark_runnable(&self, task: impl Into<TaskId>) -> Result<bool> {
        self.shared.registry.borrow_mut().mark_runnable(task.into())
    }

    // ------------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------------

    /// Cancel a task.
    ///
    /// A suspended task is cancelled now: its timers are removed, its body
    /// dropped and its callbacks fired with `Cancelled`. A created, runnable
    /// or running task is flagged and cancelled when the driver next reaches
    /// it at a suspension point.
    ///
    /// Returns `Ok(false)` for a task that already finished and
    /// `InvalidState` for an id this loop never issued.
    pub fn cancel(&self, task: impl Into<TaskId>) -> Result<bool> {
        let id = task.into();
        let found = self.shared.registry.borrow().get(id);
        let Some(task) = found else {
            let registry = self.shared.registry.borrow();
            return if registry.is_issued(id) {
                Ok(false)
            } else {
                Err(registry.unknown(id, "cancel"))
            };
        };

        let state = task.header().state();
        match state {
            TaskState::Suspended => {
                tracing::debug!(task = %id, "cancelling suspended task");
                self.abort(task);
                Ok(true)
            }
            TaskState::Created | TaskState::Runnable | TaskState::Running => {
                tracing::debug!(task = %id, "cancel deferred to next suspension point");
                task.header().request_cancel();
                Ok(true)
            }
            TaskState::Completed | TaskState::Failed => Ok(false),
        }
    }

    fn abort(&self, task: Rc<dyn Schedulable>) {
        let id = task.header().id();
        task.header().request_cancel();
        self.shared.timers.borrow_mut().cancel(id);
        if let Err(err) = task.abort() {
            tracing::warn!(task = %id, error = %err, "abort of finished task");
        }
        self.finish(id);
    }

    /// Release a terminal task from the registry and drop its leftovers
    fn finish(&self, id: TaskId) {
        self.shared.timers.borrow_mut().cancel(id);
        let removed = self.shared.registry.borrow_mut().remove(id);
        let Some(task) = removed else {
            return;
        };
        // Body dropped with no loop borrows held; its destructors may touch the loop.
        task.discard();

        let header = task.header();
        let kind = match header.state() {
            TaskState::Completed => TraceKind::Completed,
            TaskState::Failed if header.cancel_requested() => TraceKind::Cancelled,
            _ => TraceKind::Failed,
        };
        tracing::debug!(task = %id, outcome = %kind, "finished");
        self.shared.record(kind, Some(id));
    }

    // ------------------------------------------------------------------------
    // Driving
    // ------------------------------------------------------------------------

    /// Submit `entry`, drive the loop until no work remains, and return the
    /// entry's value or its failure.
    ///
    /// Calling this from inside a task body on the same loop is
    /// `ReentrantRun`.
    pub fn run<F>(&self, entry: F) -> Result<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        if self.shared.driving.get() {
            return Err(Error::ReentrantRun);
        }
        let handle = self.submit(entry);
        self.run_handle(handle)
    }

    /// [`run`](Self::run) for a fallible entry
    pub fn try_run<F, T, E>(&self, entry: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>> + 'static,
        T: 'static,
        E: fmt::Display,
    {
        if self.shared.driving.get() {
            return Err(Error::ReentrantRun);
        }
        let handle = self.submit_fallible(entry);
        self.run_handle(handle)
    }

    fn run_handle<T>(&self, handle: TaskHandle<T>) -> Result<T> {
        match self.drive() {
            Ok(()) => {}
            Err(Error::Stalled { pending }) if handle.is_terminal() => {
                tracing::warn!(task = %handle.id(), pending, "entry finished but other tasks stalled");
            }
            Err(err) => return Err(err),
        }
        // The entry handle never leaves the driver, so its outcome can move
        handle.take_outcome()?
    }

    /// Drive already-submitted work until no task is live and no timer is
    /// pending.
    pub fn drive(&self) -> Result<()> {
        let _guard = self.enter()?;
        loop {
            self.collect_wakes();
            self.fire_due_timers();

            let next = self.shared.registry.borrow_mut().pop_runnable();
            if let Some(task) = next {
                self.resume(task);
                continue;
            }

            let now = self.shared.clock.now();
            let wait = self.shared.timers.borrow_mut().time_until_next(now);
            if let Some(wait) = wait {
                self.idle_for(now, wait);
                continue;
            }

            // Woken from outside a task body since the last collection
            if !self.shared.wakes.is_empty() {
                continue;
            }

            let pending = self.shared.registry.borrow().len();
            if pending == 0 {
                tracing::debug!("event loop drained");
                return Ok(());
            }
            tracing::warn!(pending, "event loop stalled");
            return Err(Error::Stalled { pending });
        }
    }

    /// One non-blocking pass: fire due timers, then resume every task that
    /// was runnable when the pass started. Returns how many were resumed.
    pub fn tick(&self) -> Result<usize> {
        let _guard = self.enter()?;
        self.collect_wakes();
        self.fire_due_timers();

        let batch = self.shared.registry.borrow().runnable_count();
        let mut resumed = 0;
        for _ in 0..batch {
            let next = self.shared.registry.borrow_mut().pop_runnable();
            let Some(task) = next else {
                break;
            };
            self.resume(task);
            resumed += 1;
        }
        Ok(resumed)
    }

    fn enter(&self) -> Result<DriveGuard<'_>> {
        if self.shared.driving.replace(true) {
            return Err(Error::ReentrantRun);
        }
        Ok(DriveGuard {
            driving: &self.shared.driving,
        })
    }

    /// Run one task until it suspends or finishes
    fn resume(&self, task: Rc<dyn Schedulable>) {
        let id = task.header().id();
        if task.header().cancel_requested() {
            tracing::debug!(task = %id, "cancelled before resuming");
            self.abort(task);
            return;
        }

        task.header().set_state(TaskState::Running);
        self.shared.record(TraceKind::Resumed, Some(id));
        tracing::trace!(task = %id, "resume");

        let waker = waker(Arc::new(TaskWaker {
            task: id,
            queue: self.shared.wakes.clone(),
        }));
        let mut cx = Context::from_waker(&waker);

        let poll = {
            let _current = CurrentGuard {
                previous: self.shared.current.replace(Some(id)),
                current: &self.shared.current,
            };
            task.resume(&mut cx)
        };

        let state = task.header().state();
        if poll.is_ready() || state.is_terminal() {
            self.finish(id);
        } else if task.header().cancel_requested() {
            tracing::debug!(task = %id, "cancelled at suspension point");
            self.abort(task);
        } else {
            task.header().set_state(TaskState::Suspended);
            self.shared.record(TraceKind::Suspended, Some(id));
            tracing::trace!(task = %id, "suspended");
        }
    }

    /// Turn waker signals into runnable tasks
    fn collect_wakes(&self) {
        let woken = self.shared.wakes.take();
        if woken.is_empty() {
            return;
        }

        let mut registry = self.shared.registry.borrow_mut();
        for id in woken {
            match registry.mark_runnable(id) {
                Ok(true) => self.shared.record(TraceKind::Woken, Some(id)),
                Ok(false) => {}
                Err(err) => tracing::trace!(task = %id, error = %err, "stale wake ignored"),
            }
        }
    }

    /// Mark the owners of every due timer runnable, earliest first
    fn fire_due_timers(&self) -> usize {
        let now = self.shared.clock.now();
        let mut timers = self.shared.timers.borrow_mut();
        let mut registry = self.shared.registry.borrow_mut();

        let mut fired = 0;
        for entry in timers.due_entries(now) {
            fired += 1;
            self.shared.record(TraceKind::TimerFired, Some(entry.task));
            match registry.mark_runnable(entry.task) {
                Ok(_) => tracing::trace!(task = %entry.task, "timer fired"),
                Err(err) => tracing::trace!(task = %entry.task, error = %err, "timer for finished task"),
            }
        }
        fired
    }

    /// Block on the clock until `deadline`; the only place the loop idles
    fn idle_for(&self, now: Instant, wait: Duration) {
        if wait.is_zero() {
            return;
        }

        tracing::trace!(?wait, "idle");
        let at = now.saturating_duration_since(self.shared.started);
        self.shared.tracer.borrow_mut().record_idle(at, wait);
        self.shared.clock.idle(wait);
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    /// Current time on the loop's clock
    pub fn now(&self) -> Instant {
        self.shared.clock.now()
    }

    /// Task whose body is executing, if any
    pub fn current_task(&self) -> Option<TaskId> {
        self.shared.current.get()
    }

    /// Whether `run`, `drive` or `tick` is on the stack
    pub fn is_running(&self) -> bool {
        self.shared.driving.get()
    }

    /// State of a live task; `None` once it has been released
    pub fn state(&self, task: impl Into<TaskId>) -> Option<TaskState> {
        self.shared.registry.borrow().state(task.into())
    }

    /// Number of live tasks
    pub fn task_count(&self) -> usize {
        self.shared.registry.borrow().len()
    }

    pub fn has_tasks(&self) -> bool {
        !self.shared.registry.borrow().is_empty()
    }

    pub fn pending_timers(&self) -> usize {
        self.shared.timers.borrow().len()
    }

    pub fn stats(&self) -> LoopStats {
        self.shared.tracer.borrow().stats().clone()
    }

    /// Recent scheduling events, oldest first
    pub fn trace_events(&self) -> Vec<TraceEvent> {
        self.shared.tracer.borrow().events().iter().cloned().collect()
    }

    /// Recent scheduling events of one task, oldest first
    pub fn task_trace(&self, task: impl Into<TaskId>) -> Vec<TraceEvent> {
        let tracer = self.shared.tracer.borrow();
        tracer.events_for(task.into()).into_iter().cloned().collect()
    }

    /// Drop recorded events and zero the counters
    pub fn reset_trace(&self) {
        self.shared.tracer.borrow_mut().reset();
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("tasks", &self.task_count())
            .field("timers", &self.pending_timers())
            .field("running", &self.is_running())
            .finish()
    }
}

fn catch_panics<T>(
    task: TaskId,
    body: impl Future<Output = TaskResult<T>>,
) -> impl Future<Output = TaskResult<T>> {
    AssertUnwindSafe(body).catch_unwind().map(move |caught| match caught {
        Ok(outcome) => outcome,
        Err(payload) => Err(Error::TaskFailure {
            task,
            reason: panic_message(payload.as_ref()),
        }),
    })
}

// ============================================================================
// Sleep / Yield / Timeout
// ============================================================================

/// Future returned by [`EventLoop::sleep`]
pub struct Sleep {
    shared: Rc<Shared>,
    delay: Duration,
    timer: Option<(TimerKey, Instant)>,
    done: bool,
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(());
        }

        match this.timer {
            Some((key, deadline)) => {
                let fired = !this.shared.timers.borrow().contains(key);
                if fired || this.shared.clock.now() >= deadline {
                    this.shared.timers.borrow_mut().cancel_key(key);
                    this.timer = None;
                    this.done = true;
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
            None => {
                let Some(task) = this.shared.current.get() else {
                    panic!("`sleep` polled outside of a task running on an EventLoop");
                };
                let now = this.shared.clock.now();
                let key = this
                    .shared
                    .timers
                    .borrow_mut()
                    .schedule_wake(task, this.delay, now);
                this.timer = Some((key, now + this.delay));
                this.shared.record(TraceKind::TimerScheduled, Some(task));
                tracing::trace!(task = %task, delay = ?this.delay, "sleeping");
                Poll::Pending
            }
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some((key, _)) = self.timer.take()
            && let Ok(mut timers) = self.shared.timers.try_borrow_mut()
        {
            timers.cancel_key(key);
        }
    }
}

impl fmt::Debug for Sleep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sleep")
            .field("delay", &self.delay)
            .field("done", &self.done)
            .finish()
    }
}

/// Future returned by [`EventLoop::yield_now`]
#[derive(Debug)]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

pin_project! {
    /// Future returned by [`EventLoop::timeout`]
    ///
    /// Resolves to `Ok(output)` if the inner future finishes before the
    /// delay elapses, `Err(TimeoutError)` otherwise.
    pub struct Timeout<F> {
        #[pin]
        future: F,
        sleep: Sleep,
    }
}

impl<F: Future> Future for Timeout<F> {
    type Output = std::result::Result<F::Output, TimeoutError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(output) = this.future.poll(cx) {
            return Poll::Ready(Ok(output));
        }
        match Pin::new(this.sleep).poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(TimeoutError)),
            Poll::Pending => Poll::Pending,
        }
    }
}
