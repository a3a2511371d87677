//! Collaborator seams. The scheduling core only talks to the outside world
//! through these traits; chat, preferences and the relational store plug in here.

use async_trait::async_trait;

use crate::error::{DeliveryError, Result};
use crate::types::{AuditRecord, LifecycleEntity, NotificationTarget, ReminderPayload};

/// Chat-platform messaging layer.
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(
        &self,
        recipient_id: &str,
        payload: &ReminderPayload,
    ) -> std::result::Result<(), DeliveryError>;
}

/// Per-recipient reminder preferences.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn is_opted_out(&self, recipient_id: &str, offset_seconds: i64) -> bool;
}

/// Canonical store of lifecycle entities.
#[async_trait]
pub trait EntityRepository: Send + Sync {
    /// Entities whose status is one of `statuses`.
    async fn load_entities(&self, statuses: &[String]) -> Result<Vec<LifecycleEntity>>;
    /// Fresh canonical copy of one entity.
    async fn load_entity(&self, entity_id: &str) -> Result<Option<LifecycleEntity>>;
    async fn save_entity_status(&self, entity_id: &str, status: &str) -> Result<()>;
}

/// Append-only audit sink.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn audit(&self, record: AuditRecord) -> Result<()>;
}

/// Provides the currently active notification targets (open matches,
/// upcoming events) for each reminder sweep.
#[async_trait]
pub trait TargetSource: Send + Sync {
    async fn active_targets(&self) -> Result<Vec<NotificationTarget>>;
}

/// Preference store that never opts anybody out.
pub struct NoOptOut;

#[async_trait]
impl PreferenceStore for NoOptOut {
    async fn is_opted_out(&self, _recipient_id: &str, _offset_seconds: i64) -> bool {
        false
    }
}
