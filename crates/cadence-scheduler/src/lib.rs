//! # Cadence Scheduler
//!
//! Daily planning, autonomous outreach and claim-safe message dispatch over
//! a shared task store.
//!
//! ## Architecture
//! ```text
//! SchedulerRuntime (tokio tasks)
//!   ├── cron "0 0 * * *"  → DailyPlanner      → planned_tasks
//!   ├── cron "5 0 * * *"  → AutonomousOutreach → reply_tasks (autonomous)
//!   └── every 60s         → Dispatcher
//!                             ├── claim ≤20 due tasks (skip locked, → executing)
//!                             ├── group by recipient
//!                             ├── merge (Decider) or send verbatim
//!                             ├── Transport.send
//!                             └── complete + one MessageLog, or retry ≤3
//!
//! MessageIntake
//!   ├── log received message
//!   ├── Decider.decide_reply → reply_tasks (user, delayed)
//!   ├── ConflictResolver: autonomous tasks within ±15 min → +30 min
//!   └── Decider.detect_memory → memories
//! ```
//!
//! Storage is SQLite by default; the `postgres` feature adds [`PgStore`].

pub mod conflict;
pub mod context;
pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod generators;
pub mod intake;
pub mod persistence;
#[cfg(feature = "postgres")]
pub mod pg;
pub mod runtime;
pub mod tasks;

#[cfg(test)]
pub(crate) mod test_support;

pub use conflict::{ConflictResolver, Shift};
pub use context::ContextBuilder;
pub use dispatch::{DispatchReport, Dispatcher};
pub use engine::Engine;
pub use generators::{AutonomousOutreach, DailyPlanner, GenerationReport};
pub use intake::{IntakeOutcome, MessageIntake};
pub use persistence::SqliteStore;
#[cfg(feature = "postgres")]
pub use pg::PgStore;
pub use runtime::{Job, JobFn, SchedulerRuntime, Trigger};
pub use tasks::{JobKind, RetryPolicy};
