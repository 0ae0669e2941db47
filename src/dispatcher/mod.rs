//! Bounded-concurrency job dispatcher.
//!
//! Jobs are opaque async closures. The dispatcher runs at most
//! `concurrency_limit` of them at a time, gives each attempt a deadline,
//! retries failed attempts according to a [`RetryPolicy`], and collects
//! terminal failures until the current epoch drains.
//!
//! - **WaitingQueue / ConcurrencyGate**: FIFO admission under the limit
//! - **JobRunner**: one attempt raced against its timer
//! - **RetryPolicy**: which failures deserve another attempt
//! - **DrainBarrier / ErrorAggregator**: per-epoch completion and failures
//!
//! # Architecture
//!
//! ```text
//!   Dispatcher handles          job tasks        timer tasks
//!   add() / drained()           (settled)        (timed out)
//!          │                        │                 │
//!          └────────────────┬───────┴─────────────────┘
//!                           ▼
//!                  ┌─────────────────┐
//!                  │  DispatchLoop   │  single owner of all state
//!                  ├─────────────────┤
//!                  │ WaitingQueue    │──admit──▶ pending table (≤ limit)
//!                  │ Epoch           │◀─retire── retry in place / record error
//!                  └─────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use jobgate::dispatcher::{Dispatcher, DispatcherConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = DispatcherConfig::new(4)
//!     .with_retry_limit(2)
//!     .with_attempt_timeout(Duration::from_secs(10));
//! let dispatcher = Dispatcher::new(config)?;
//!
//! for path in ["src/lib.rs", "src/main.rs"] {
//!     dispatcher.add(move |token| async move {
//!         token
//!             .run_until_cancelled(tokio::fs::read_to_string(path))
//!             .await??;
//!         Ok(())
//!     })?;
//! }
//!
//! dispatcher.drained().await?;
//! # Ok(())
//! # }
//! ```

mod barrier;
pub mod config;
mod dispatch_loop;
pub mod handle;
pub mod job;
mod queue;
pub mod retry;
mod runner;
pub mod stats;
pub mod token;

pub use config::{ConfigError, DispatcherConfig};
pub use handle::Dispatcher;
pub use job::{Job, JobFuture, JobId};
pub use retry::{NeverRetry, RetryAll, RetryOnTimeout, RetryPolicy};
pub use stats::DispatcherStats;
pub use token::CancelToken;
