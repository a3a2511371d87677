//! Ark match wiring: statuses, lifecycle transitions, reminder preferences.
//!
//! A match is `Scheduled` until signup closes, `Locked` until it has been
//! played, then `Completed`. `Cancelled` is only ever set by an admin.

use std::sync::Arc;

use arkbot_core::config::LifecycleConfig;
use arkbot_core::error::Result;
use arkbot_core::traits::{AuditSink, EntityRepository};
use arkbot_core::types::{LifecycleEntity, NotificationTarget};
use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::lifecycle::{Transition, TransitionHandler, override_status};
use crate::locks::EntityLocks;
use crate::reminders::NotificationScheduler;

pub const SCHEDULED: &str = "Scheduled";
pub const LOCKED: &str = "Locked";
pub const COMPLETED: &str = "Completed";
pub const CANCELLED: &str = "Cancelled";

/// Entity time fields.
pub const SIGNUP_CLOSE: &str = "signup_close";
pub const START_TIME: &str = "start_time";

/// Namespace for Ark documents in the state store.
pub const NAMESPACE: &str = "ark";

pub const OFFSET_24H: i64 = -86_400;
pub const OFFSET_CHECKIN_12H: i64 = -43_200;
pub const OFFSET_4H: i64 = -14_400;
pub const OFFSET_1H: i64 = -3_600;
pub const OFFSET_START: i64 = 0;

/// Statuses the lifecycle engine still works on.
pub fn active_statuses() -> Vec<String> {
    vec![SCHEDULED.to_string(), LOCKED.to_string()]
}

/// Per-member reminder opt-outs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderPrefs {
    #[serde(default)]
    pub opt_out_all: bool,
    #[serde(default)]
    pub opt_out_24h: bool,
    #[serde(default)]
    pub opt_out_4h: bool,
    #[serde(default)]
    pub opt_out_1h: bool,
    #[serde(default)]
    pub opt_out_start: bool,
    #[serde(default)]
    pub opt_out_checkin_12h: bool,
}

/// Whether a DM reminder at `offset_seconds` may be sent. Offsets without a
/// dedicated switch are only blocked by `opt_out_all`.
pub fn is_dm_allowed(offset_seconds: i64, prefs: &ReminderPrefs) -> bool {
    if prefs.opt_out_all {
        return false;
    }
    let opted_out = match offset_seconds {
        OFFSET_24H => prefs.opt_out_24h,
        OFFSET_CHECKIN_12H => prefs.opt_out_checkin_12h,
        OFFSET_4H => prefs.opt_out_4h,
        OFFSET_1H => prefs.opt_out_1h,
        OFFSET_START => prefs.opt_out_start,
        _ => false,
    };
    !opted_out
}

/// Whether the match channel gets a post at `offset_seconds`. The check-in
/// reminder goes out by DM only.
pub fn is_channel_reminder(offset_seconds: i64) -> bool {
    matches!(offset_seconds, OFFSET_24H | OFFSET_4H | OFFSET_1H | OFFSET_START)
}

/// Opens check-in for a match (the confirmation message starts accepting
/// check-ins).
#[async_trait]
pub trait CheckinControl: Send + Sync {
    async fn open_checkin(&self, match_id: &str) -> Result<()>;
}

struct OpenCheckin(Arc<dyn CheckinControl>);

#[async_trait]
impl TransitionHandler for OpenCheckin {
    async fn apply(&self, entity: &LifecycleEntity) -> Result<Option<String>> {
        self.0.open_checkin(&entity.id).await?;
        tracing::info!("✅ Check-in opened for match {}", entity.id);
        Ok(None)
    }
}

/// The Ark transition list: `lock`, `checkin`, `complete`. A trigger time
/// that falls outside the representable range never fires.
pub fn transitions(config: &LifecycleConfig, checkin: Arc<dyn CheckinControl>) -> Vec<Transition> {
    let checkin_offset = Duration::try_hours(config.checkin_offset_hours);
    let duration = Duration::try_minutes(config.match_duration_minutes);
    vec![
        Transition::set_status("lock", |m| m.time(SIGNUP_CLOSE), LOCKED),
        Transition::new(
            "checkin",
            move |m: &LifecycleEntity| {
                let offset = checkin_offset?;
                m.time(START_TIME)?.checked_sub_signed(offset)
            },
            OpenCheckin(checkin),
        ),
        Transition::set_status(
            "complete",
            move |m| m.time(START_TIME)?.checked_add_signed(duration?),
            COMPLETED,
        ),
    ]
}

/// Reminder target for a match: offsets count from the start time.
pub fn match_target(
    entity: &LifecycleEntity,
    recipients: Vec<String>,
    alliance: &str,
) -> Option<NotificationTarget> {
    let start = entity.time(START_TIME)?;
    let label = if alliance.is_empty() {
        "Ark".to_string()
    } else {
        format!("Ark ({alliance})")
    };
    Some(NotificationTarget::new(entity.id.clone(), start, recipients).with_label(label))
}

/// Admin cancel: mark the match `Cancelled` under its lock, then drop every
/// pending reminder for it.
pub async fn cancel_match(
    locks: &EntityLocks,
    repo: &dyn EntityRepository,
    audit: &dyn AuditSink,
    reminders: &Mutex<NotificationScheduler>,
    match_id: &str,
    actor_id: Option<&str>,
) -> Result<usize> {
    override_status(locks, repo, audit, match_id, CANCELLED, actor_id).await?;
    reminders.lock().await.cancel_target(match_id)
}
