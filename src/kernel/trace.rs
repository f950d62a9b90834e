//! Instrumentation for the loop driver
//!
//! Design:
//! - Ring buffer of recent scheduling events (bounded memory)
//! - Counters for task lifecycle and timer activity
//! - Timestamps are offsets from loop creation, on the loop's own clock
//!
//! Structured logs go through `tracing`; this buffer is for programmatic
//! inspection (tests, debugging views).

use super::task::TaskId;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// Default number of events kept in the buffer
pub const DEFAULT_TRACE_CAPACITY: usize = 1024;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    Submitted,
    Resumed,
    Suspended,
    Woken,
    Completed,
    Failed,
    Cancelled,
    TimerScheduled,
    TimerFired,
    Idle,
}

impl fmt::Display for TraceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TraceKind::Submitted => "SUBMIT",
            TraceKind::Resumed => "RESUME",
            TraceKind::Suspended => "SUSPEND",
            TraceKind::Woken => "WAKE",
            TraceKind::Completed => "DONE",
            TraceKind::Failed => "FAIL",
            TraceKind::Cancelled => "CANCEL",
            TraceKind::TimerScheduled => "TIMER+",
            TraceKind::TimerFired => "TIMER!",
            TraceKind::Idle => "IDLE",
        };
        f.pad(name)
    }
}

/// A single trace event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    /// Offset from loop creation
    pub at: Duration,
    pub kind: TraceKind,
    /// Associated task (none for idle periods)
    pub task: Option<TaskId>,
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:.3?}] {:<7}", self.at, self.kind)?;
        if let Some(task) = self.task {
            write!(f, " {}", task)?;
        }
        Ok(())
    }
}

/// Loop-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub submitted: u64,
    /// Body resumptions
    pub polls: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timers_scheduled: u64,
    pub timers_fired: u64,
    /// Total time spent idling on the clock
    pub idle_time: Duration,
}

impl LoopStats {
    /// Tasks that reached a terminal state
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }
}

/// Event buffer plus counters
#[derive(Debug)]
pub struct Tracer {
    capacity: usize,
    events: VecDeque<TraceEvent>,
    stats: LoopStats,
}

impl Tracer {
    /// A capacity of zero keeps counters but records no events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity.min(DEFAULT_TRACE_CAPACITY)),
            stats: LoopStats::default(),
        }
    }

    /// Record an event and bump the matching counter
    pub fn record(&mut self, at: Duration, kind: TraceKind, task: Option<TaskId>) {
        match kind {
            TraceKind::Submitted => self.stats.submitted += 1,
            TraceKind::Resumed => self.stats.polls += 1,
            TraceKind::Completed => self.stats.completed += 1,
            TraceKind::Failed => self.stats.failed += 1,
            TraceKind::Cancelled => self.stats.cancelled += 1,
            TraceKind::TimerScheduled => self.stats.timers_scheduled += 1,
            TraceKind::TimerFired => self.stats.timers_fired += 1,
            TraceKind::Suspended | TraceKind::Woken | TraceKind::Idle => {}
        }

        if self.capacity == 0 {
            return;
        }
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(TraceEvent { at, kind, task });
    }

    /// Record an idle period starting at `at`
    pub fn record_idle(&mut self, at: Duration, duration: Duration) {
        self.stats.idle_time += duration;
        self.record(at, TraceKind::Idle, None);
    }

    pub fn events(&self) -> &VecDeque<TraceEvent> {
        &self.events
    }

    /// Events for a specific task, oldest first
    pub fn events_for(&self, task: TaskId) -> Vec<&TraceEvent> {
        self.events.iter().filter(|e| e.task == Some(task)).collect()
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    /// Reset everything (events and stats)
    pub fn reset(&mut self) {
        self.clear_events();
        self.stats = LoopStats::default();
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new(DEFAULT_TRACE_CAPACITY)
    }
}
