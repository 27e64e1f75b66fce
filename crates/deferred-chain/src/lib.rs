//! Deferred chains: single-resolution values with ordered continuations.
//!
//! A [`DeferredChain`] starts pending, is resolved at most once, and runs
//! each continuation chained onto it exactly once after the value is known.
//! All of that work happens on an explicit [`Scheduler`]:
//! - one FIFO queue, drained one job at a time, run-to-completion
//! - continuations are queued, never run on the stack that triggered them
//! - continuations made ready together fire in registration order
//! - timers and `async` tasks feed the same queue
//!
//! ```
//! use deferred_chain::{DeferredChain, Scheduler};
//!
//! let scheduler = Scheduler::new();
//! let ball = DeferredChain::new(&scheduler);
//! let last = ball
//!     .then(|b: String| format!("step1: {b}"))
//!     .then(|s| format!("{s} -> step2"));
//!
//! ball.resolve("🏀".to_string());
//! scheduler.run_until_idle().unwrap();
//! assert_eq!(last.peek().as_deref(), Some("step1: 🏀 -> step2"));
//! ```

pub mod chain;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod step;
pub mod task;
pub mod timer;

pub use chain::{ChainStatus, DeferredChain};
pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use scheduler::{RunStats, Scheduler, SchedulerRef};
pub use step::Step;
pub use task::{Settled, TaskId};
pub use timer::TimerId;
