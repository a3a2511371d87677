//! # ArkBot Scheduler
//!
//! Durable scheduling and delivery core: per-recipient reminders, lifecycle
//! transitions for long-lived entities, and supervised background loops that
//! survive crashes and process restarts.
//!
//! ## Architecture
//! ```text
//! TaskSupervisor (restart with backoff, coordinated shutdown)
//!   ├── reminder loop (tokio interval)
//!   │     └── NotificationScheduler: compute_schedule → prune → tick
//!   │           ├── PreferenceStore (opt-outs)
//!   │           └── Deliverer (webhook / log)
//!   └── lifecycle loop (tokio interval)
//!         └── LifecycleEngine: lock → checkin → complete
//!               └── EntityRepository (SQLite) + EntityLocks
//!
//! StateStore: JSON documents, temp file + fsync + rename
//! ```

pub mod ark;
pub mod dispatch;
pub mod engine;
pub mod lifecycle;
pub mod locks;
pub mod markers;
pub mod persistence;
pub mod reminders;
pub mod store;
pub mod supervisor;

pub use dispatch::{LogDeliverer, WebhookDeliverer};
pub use lifecycle::{LifecycleEngine, SweepReport, Transition, TransitionHandler};
pub use locks::EntityLocks;
pub use markers::{MarkerBook, MarkerKey, MarkerStatus, NotificationMarker};
pub use persistence::SchedulerDb;
pub use reminders::{NotificationScheduler, TickReport};
pub use store::{Document, StateStore};
pub use supervisor::{ShutdownReport, TaskSnapshot, TaskState, TaskSupervisor};
