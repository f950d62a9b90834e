//! Task Registry
//!
//! Tracks every live task and the FIFO of runnable ones. Finished tasks are
//! released; their handles keep the outcome alive for whoever holds them.

use super::error::{Error, Result};
use super::task::{Schedulable, TaskId, TaskState};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

#[derive(Default)]
pub struct Registry {
    /// Live tasks, indexed by ID
    tasks: BTreeMap<TaskId, Rc<dyn Schedulable>>,
    /// Tasks waiting for the driver, oldest first
    ready: VecDeque<TaskId>,
    /// Next task ID
    next_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the ID for the next task
    pub(crate) fn allocate_id(&mut self) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Register a task. Created tasks are queued for their first run.
    pub(crate) fn insert(&mut self, task: Rc<dyn Schedulable>) {
        let header = task.header();
        let id = header.id();
        if header.state() == TaskState::Created {
            self.ready.push_back(id);
        }
        self.tasks.insert(id, task);
    }

    /// Make a suspended task runnable.
    ///
    /// Returns `Ok(true)` if the task was queued by this call and
    /// `Ok(false)` if it was already queued or is the one currently running.
    /// Terminal or unknown tasks are `InvalidState`.
    pub fn mark_runnable(&mut self, id: TaskId) -> Result<bool> {
        let Some(task) = self.tasks.get(&id) else {
            return Err(self.unknown(id, "wake"));
        };

        let header = task.header();
        match header.state() {
            TaskState::Suspended => {
                header.set_state(TaskState::Runnable);
                self.ready.push_back(id);
                Ok(true)
            }
            TaskState::Created | TaskState::Runnable | TaskState::Running => Ok(false),
            state @ (TaskState::Completed | TaskState::Failed) => {
                Err(Error::invalid_state(id, "wake", Some(state)))
            }
        }
    }

    /// Pop the oldest runnable task
    pub(crate) fn pop_runnable(&mut self) -> Option<Rc<dyn Schedulable>> {
        while let Some(id) = self.ready.pop_front() {
            // Entries for tasks finished while queued are dropped here
            if let Some(task) = self.tasks.get(&id)
                && matches!(
                    task.header().state(),
                    TaskState::Created | TaskState::Runnable
                )
            {
                return Some(task.clone());
            }
        }
        None
    }

    pub(crate) fn get(&self, id: TaskId) -> Option<Rc<dyn Schedulable>> {
        self.tasks.get(&id).cloned()
    }

    pub(crate) fn remove(&mut self, id: TaskId) -> Option<Rc<dyn Schedulable>> {
        self.tasks.remove(&id)
    }

    /// State of a live task
    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(&id).map(|task| task.header().state())
    }

    /// Whether `id` was ever handed out by this registry
    pub fn is_issued(&self, id: TaskId) -> bool {
        id.0 < self.next_id
    }

    /// Number of live (non-terminal) tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Number of tasks queued for the driver
    pub fn runnable_count(&self) -> usize {
        self.ready.len()
    }

    pub(crate) fn unknown(&self, id: TaskId, op: &'static str) -> Error {
        // Released tasks are known to be finished, but not how.
        Error::invalid_state(id, op, None)
    }
}
