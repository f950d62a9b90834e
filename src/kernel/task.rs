//! Task abstraction
//!
//! A task is a unit of suspendable work: a boxed future body plus the
//! bookkeeping the scheduler needs around it. The typed half (`TaskCell<T>`)
//! holds the outcome, completion callbacks and awaiting wakers; the erased
//! half (`Schedulable`) is what the registry and driver see.

use super::error::{Error, Result};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Task execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Registered, never resumed
    Created,
    /// Queued for the next driver pass
    Runnable,
    /// Currently executing
    Running,
    /// Parked at a suspension point, waiting for a wake
    Suspended,
    /// Finished with a value
    Completed,
    /// Finished with an error (including cancellation)
    Failed,
}

impl TaskState {
    /// Completed and Failed are terminal; nothing leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Created => "created",
            TaskState::Runnable => "runnable",
            TaskState::Running => "running",
            TaskState::Suspended => "suspended",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of a task: its value, or the reason it failed
pub type TaskResult<T> = Result<T>;

/// Completion callback, invoked once with the task's outcome
pub type Callback<T> = Box<dyn FnOnce(&TaskResult<T>)>;

/// A boxed task body producing the task's outcome
pub(crate) type BoxBody<T> = Pin<Box<dyn Future<Output = TaskResult<T>>>>;

/// State shared by every task regardless of its output type
#[derive(Debug)]
pub(crate) struct Header {
    id: TaskId,
    state: Cell<TaskState>,
    cancel_requested: Cell<bool>,
}

impl Header {
    fn new(id: TaskId, state: TaskState) -> Self {
        Self {
            id,
            state: Cell::new(state),
            cancel_requested: Cell::new(false),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.get()
    }

    /// Move to a non-terminal state. Terminal states are only reached
    /// through `TaskCell::complete`.
    pub(crate) fn set_state(&self, state: TaskState) {
        debug_assert!(!state.is_terminal());
        if !self.state.get().is_terminal() {
            self.state.set(state);
        }
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.set(true);
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel_requested.get()
    }
}

/// Typed per-task storage: outcome, callbacks and awaiting wakers
pub(crate) struct TaskCell<T> {
    header: Header,
    outcome: RefCell<Option<TaskResult<T>>>,
    callbacks: RefCell<Vec<Callback<T>>>,
    joiners: RefCell<Vec<Waker>>,
}

impl<T> TaskCell<T> {
    pub(crate) fn new(id: TaskId, state: TaskState) -> Self {
        Self {
            header: Header::new(id, state),
            outcome: RefCell::new(None),
            callbacks: RefCell::new(Vec::new()),
            joiners: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn header(&self) -> &Header {
        &self.header
    }

    /// Set the outcome and move to Completed or Failed.
    ///
    /// Callbacks run synchronously, in attachment order, before awaiting
    /// tasks are woken. A second call is rejected with `InvalidState`.
    pub(crate) fn complete(&self, outcome: TaskResult<T>) -> Result<()> {
        let state = self.header.state.get();
        if state.is_terminal() {
            return Err(Error::invalid_state(self.header.id, "complete", Some(state)));
        }

        let terminal = if outcome.is_ok() {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        *self.outcome.borrow_mut() = Some(outcome);
        self.header.state.set(terminal);

        // Taken out first: a callback attaching to this same task sees a
        // terminal state and runs immediately instead of being queued.
        let callbacks = std::mem::take(&mut *self.callbacks.borrow_mut());
        if !callbacks.is_empty() {
            let outcome = self.outcome.borrow();
            if let Some(outcome) = outcome.as_ref() {
                for callback in callbacks {
                    self.invoke(callback, outcome);
                }
            }
        }

        let joiners = std::mem::take(&mut *self.joiners.borrow_mut());
        for waker in joiners {
            waker.wake();
        }

        Ok(())
    }

    /// Append a callback, or run it now if the task already finished.
    pub(crate) fn attach(&self, callback: Callback<T>) -> Result<()> {
        let state = self.header.state.get();
        if !state.is_terminal() {
            self.callbacks.borrow_mut().push(callback);
            return Ok(());
        }

        let outcome = self
            .outcome
            .try_borrow()
            .map_err(|_| Error::invalid_state(self.header.id, "attach callback to", Some(state)))?;
        match outcome.as_ref() {
            Some(outcome) => {
                self.invoke(callback, outcome);
                Ok(())
            }
            // Only the driver's own entry task ever gives its outcome away
            None => Err(Error::invalid_state(
                self.header.id,
                "attach callback to",
                Some(state),
            )),
        }
    }

    /// Run one callback. A panic is logged and contained so the remaining
    /// callbacks and awaiters still see the outcome.
    fn invoke(&self, callback: Callback<T>, outcome: &TaskResult<T>) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(outcome))) {
            tracing::error!(
                task = %self.header.id,
                panic = %panic_message(payload.as_ref()),
                "completion callback panicked"
            );
        }
    }

    /// Move the outcome out. Only possible once, after completion; the
    /// driver uses it for the entry task of `run`, which nobody else sees.
    pub(crate) fn take_outcome(&self) -> Result<TaskResult<T>> {
        let state = self.header.state.get();
        if !state.is_terminal() {
            return Err(Error::invalid_state(self.header.id, "take outcome of", Some(state)));
        }
        self.outcome
            .try_borrow_mut()
            .ok()
            .and_then(|mut outcome| outcome.take())
            .ok_or_else(|| Error::invalid_state(self.header.id, "take outcome of", Some(state)))
    }

    /// Copy of the stored outcome, left in place for other readers
    pub(crate) fn outcome(&self) -> Result<TaskResult<T>>
    where
        T: Clone,
    {
        let state = self.header.state.get();
        self.outcome
            .try_borrow()
            .ok()
            .and_then(|outcome| outcome.clone())
            .ok_or_else(|| Error::invalid_state(self.header.id, "read outcome of", Some(state)))
    }

    fn poll_join(&self, cx: &mut Context<'_>) -> Poll<TaskResult<T>>
    where
        T: Clone,
    {
        if self.header.state.get().is_terminal() {
            return Poll::Ready(self.outcome().and_then(|outcome| outcome));
        }

        let mut joiners = self.joiners.borrow_mut();
        if !joiners.iter().any(|w| w.will_wake(cx.waker())) {
            joiners.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {}", msg)
    } else {
        "panicked".to_string()
    }
}

/// What the registry and the driver see of a task
pub(crate) trait Schedulable {
    fn header(&self) -> &Header;

    /// Resume the body once.
    ///
    /// `Ready` means the body produced its outcome and the task has been
    /// completed (callbacks included). A task without a body never becomes
    /// ready this way.
    fn resume(&self, cx: &mut Context<'_>) -> Poll<()>;

    /// Drop the body without completing the task.
    fn discard(&self);

    /// Drop the body and complete the task as cancelled.
    fn abort(&self) -> Result<()>;
}

/// A registered task: typed cell plus its body
pub(crate) struct Task<T> {
    cell: Rc<TaskCell<T>>,
    body: RefCell<Option<BoxBody<T>>>,
}

impl<T: 'static> Task<T> {
    pub(crate) fn new(cell: Rc<TaskCell<T>>, body: Option<BoxBody<T>>) -> Self {
        Self {
            cell,
            body: RefCell::new(body),
        }
    }
}

impl<T: 'static> Schedulable for Task<T> {
    fn header(&self) -> &Header {
        self.cell.header()
    }

    fn resume(&self, cx: &mut Context<'_>) -> Poll<()> {
        // Polled outside the RefCell so the body may touch its own handle.
        let Some(mut body) = self.body.borrow_mut().take() else {
            return Poll::Pending;
        };

        match body.as_mut().poll(cx) {
            Poll::Ready(outcome) => {
                drop(body);
                if let Err(err) = self.cell.complete(outcome) {
                    // Completed from inside its own body; the explicit outcome wins.
                    tracing::debug!(task = %self.cell.header().id(), error = %err, "body outcome discarded");
                }
                Poll::Ready(())
            }
            Poll::Pending => {
                if self.cell.header().state().is_terminal() {
                    drop(body);
                } else {
                    *self.body.borrow_mut() = Some(body);
                }
                Poll::Pending
            }
        }
    }

    fn discard(&self) {
        let body = self.body.borrow_mut().take();
        drop(body);
    }

    fn abort(&self) -> Result<()> {
        self.discard();
        let id = self.cell.header().id();
        self.cell.complete(Err(Error::Cancelled(id)))
    }
}

/// Handle to a submitted task
///
/// Cheap to clone. Used to inspect state, await the outcome, attach
/// callbacks through the loop, or cancel.
pub struct TaskHandle<T> {
    cell: Rc<TaskCell<T>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(cell: Rc<TaskCell<T>>) -> Self {
        Self { cell }
    }

    pub(crate) fn cell(&self) -> &Rc<TaskCell<T>> {
        &self.cell
    }

    pub fn id(&self) -> TaskId {
        self.cell.header().id()
    }

    pub fn state(&self) -> TaskState {
        self.cell.header().state()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Copy of a finished task's outcome.
    ///
    /// The outcome stays stored, so every reader, awaiter and late callback
    /// sees the same value. Fails with `InvalidState` if the task has not
    /// finished.
    pub fn outcome(&self) -> Result<TaskResult<T>>
    where
        T: Clone,
    {
        match self.state() {
            state if state.is_terminal() => self.cell.outcome(),
            state => Err(Error::invalid_state(self.id(), "read outcome of", Some(state))),
        }
    }

    pub(crate) fn take_outcome(&self) -> Result<TaskResult<T>> {
        self.cell.take_outcome()
    }

    /// Future resolving to a copy of the task's outcome once it is terminal.
    ///
    /// Meant to be awaited from inside another task body. Any number of
    /// tasks may join the same handle.
    pub fn join(&self) -> Join<T> {
        Join {
            cell: self.cell.clone(),
        }
    }
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl<T> From<&TaskHandle<T>> for TaskId {
    fn from(handle: &TaskHandle<T>) -> Self {
        handle.id()
    }
}

impl<T: Clone> IntoFuture for TaskHandle<T> {
    type Output = TaskResult<T>;
    type IntoFuture = Join<T>;

    fn into_future(self) -> Join<T> {
        Join { cell: self.cell }
    }
}

/// Future returned by [`TaskHandle::join`]
pub struct Join<T> {
    cell: Rc<TaskCell<T>>,
}

impl<T: Clone> Future for Join<T> {
    type Output = TaskResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.cell.poll_join(cx)
    }
}
