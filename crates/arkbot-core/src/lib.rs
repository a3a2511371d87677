//! # ArkBot Core
//!
//! Error taxonomy, configuration, shared types, and the collaborator traits
//! the scheduling core is written against.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::ArkConfig;
pub use error::{ArkError, DeliveryError, Result};
pub use traits::{AuditSink, Deliverer, EntityRepository, NoOptOut, PreferenceStore, TargetSource};
pub use types::{
    AuditRecord, LifecycleEntity, NotificationTarget, NotifyPriority, ReminderPayload,
};
