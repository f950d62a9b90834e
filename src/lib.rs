//! cooploop - a minimal single-threaded cooperative task scheduler
//!
//! Design principles:
//! - Tractable: one thread, one run queue, one timer heap
//! - Deterministic: FIFO among runnable tasks, FIFO among equal deadlines
//! - Explicit: the loop is a value you pass around, never a global
//! - Observable: `tracing` spans the driver, a trace buffer records the rest
//!
//! ```
//! use cooploop::EventLoop;
//! use std::time::Duration;
//!
//! let lp = EventLoop::new();
//! let inner = lp.clone();
//! let answer = lp
//!     .run(async move {
//!         inner.sleep(Duration::from_millis(1)).await;
//!         42
//!     })
//!     .unwrap();
//! assert_eq!(answer, 42);
//! ```

pub mod kernel;

pub use kernel::{
    Clock, ClockKind, ConfigError, Error, EventLoop, LoopConfig, LoopStats, ManualClock, Result,
    SystemClock, TaskHandle, TaskId, TaskResult, TaskState, TimeoutError,
};
