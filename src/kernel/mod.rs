//! The kernel - task registry, timer queue and the loop that drives them
//!
//! Design:
//! - One thread, one loop, no preemption
//! - A task runs until it suspends on a timer, a yield or another task
//! - Nothing runs while a registry or timer borrow is held
//! - Time comes from a pluggable clock so scheduling is testable
//!
//! The registry, timer queue and trace buffer stay private to the loop:
//!
//! ```compile_fail
//! use cooploop::kernel::TimerQueue;
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
mod registry;
pub mod task;
mod timer;
mod trace;


pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ClockKind, ConfigError, LoopConfig};
pub use error::{Error, Result, TimeoutError};
pub use executor::{EventLoop, Sleep, Timeout, YieldNow};
pub use task::{Callback, Join, TaskHandle, TaskId, TaskResult, TaskState};
pub use timer::TimerKey;
pub use trace::{LoopStats, TraceEvent, TraceKind};
