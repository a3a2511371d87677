//! Shared domain types exchanged between the scheduling core and its collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Something reminders are computed relative to (an event, an Ark match).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationTarget {
    pub target_id: String,
    /// The moment all offsets are measured from.
    pub reference_time: DateTime<Utc>,
    pub recipients: Vec<String>,
    /// Short human label shown in payloads (match alliance, event name).
    #[serde(default)]
    pub label: String,
}

impl NotificationTarget {
    pub fn new(
        target_id: impl Into<String>,
        reference_time: DateTime<Utc>,
        recipients: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            reference_time,
            recipients: recipients.into_iter().map(Into::into).collect(),
            label: String::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Absolute time a reminder at `offset_seconds` falls due, or `None` when
    /// that lies outside the representable range.
    pub fn due_at(&self, offset_seconds: i64) -> Option<DateTime<Utc>> {
        chrono::Duration::try_seconds(offset_seconds)
            .and_then(|delta| self.reference_time.checked_add_signed(delta))
    }
}

/// Recipient ids with this prefix name a chat channel instead of a member.
pub const CHANNEL_PREFIX: &str = "channel:";

pub fn channel_recipient(channel_id: &str) -> String {
    format!("{CHANNEL_PREFIX}{channel_id}")
}

/// The channel id behind a channel recipient, `None` for members.
pub fn channel_id(recipient_id: &str) -> Option<&str> {
    recipient_id.strip_prefix(CHANNEL_PREFIX)
}

/// Delivery urgency, derived from how close the reminder is to the reference time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotifyPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl NotifyPriority {
    pub fn for_offset(offset_seconds: i64) -> Self {
        match offset_seconds {
            0 => Self::Urgent,
            o if o < 0 && o >= -3_600 => Self::High,
            o if o > 0 => Self::Low,
            _ => Self::Normal,
        }
    }
}

/// Human label for an offset: `24h`, `4h`, `1h`, `start`, `checkin_12h`, `+30m`.
pub fn offset_label(offset_seconds: i64) -> String {
    match offset_seconds {
        0 => "start".into(),
        -43_200 => "checkin_12h".into(),
        o if o < 0 && o % 3_600 == 0 => format!("{}h", -o / 3_600),
        o if o < 0 && o % 60 == 0 => format!("{}m", -o / 60),
        o if o < 0 => format!("{}s", -o),
        o if o % 3_600 == 0 => format!("+{}h", o / 3_600),
        o if o % 60 == 0 => format!("+{}m", o / 60),
        o => format!("+{o}s"),
    }
}

/// What the scheduler hands to the messaging layer. Rendering is the
/// messaging layer's concern; this carries only the facts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReminderPayload {
    pub target_id: String,
    pub recipient_id: String,
    pub offset_seconds: i64,
    pub label: String,
    pub reference_time: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub priority: NotifyPriority,
}

impl ReminderPayload {
    pub fn new(target: &NotificationTarget, recipient_id: &str, offset_seconds: i64) -> Self {
        Self {
            target_id: target.target_id.clone(),
            recipient_id: recipient_id.to_string(),
            offset_seconds,
            label: target.label.clone(),
            reference_time: target.reference_time,
            due_at: target
                .due_at(offset_seconds)
                .unwrap_or(target.reference_time),
            priority: NotifyPriority::for_offset(offset_seconds),
        }
    }

    /// Short title, e.g. `Ark reminder (1h)`.
    pub fn title(&self) -> String {
        if self.label.is_empty() {
            format!("Reminder ({})", offset_label(self.offset_seconds))
        } else {
            format!("{} reminder ({})", self.label, offset_label(self.offset_seconds))
        }
    }
}

/// A long-lived entity advanced through an ordered status sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEntity {
    pub id: String,
    pub status: String,
    /// Named wall-clock fields transitions are computed from
    /// (`signup_close`, `start_time`, ...).
    #[serde(default)]
    pub times: BTreeMap<String, DateTime<Utc>>,
}

impl LifecycleEntity {
    pub fn new(id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: status.into(),
            times: BTreeMap::new(),
        }
    }

    pub fn with_time(mut self, name: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.times.insert(name.into(), at);
        self
    }

    pub fn time(&self, name: &str) -> Option<DateTime<Utc>> {
        self.times.get(name).copied()
    }
}

/// Append-only audit entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub action_type: String,
    /// `None` for actions the scheduler takes on its own.
    pub actor_id: Option<String>,
    pub entity_id: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl AuditRecord {
    pub fn system(
        action_type: impl Into<String>,
        entity_id: impl Into<String>,
        occurred_at: DateTime<Utc>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            action_type: action_type.into(),
            actor_id: None,
            entity_id: entity_id.into(),
            occurred_at,
            details,
        }
    }
}

/// Audit action names written by the core.
pub mod audit_actions {
    pub const REMINDER_SENT: &str = "reminder_sent";
    pub const REMINDER_FAILED: &str = "reminder_failed";
    pub const REMINDER_DISCARDED: &str = "reminder_discarded";
    pub const TRANSITION_APPLIED: &str = "transition_applied";
    pub const ENTITY_CANCELLED: &str = "entity_cancelled";
    pub const STATUS_OVERRIDE: &str = "status_override";
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_offset_labels() {
        assert_eq!(offset_label(-86_400), "24h");
        assert_eq!(offset_label(-14_400), "4h");
        assert_eq!(offset_label(-3_600), "1h");
        assert_eq!(offset_label(-43_200), "checkin_12h");
        assert_eq!(offset_label(0), "start");
        assert_eq!(offset_label(-1_800), "30m");
        assert_eq!(offset_label(1_800), "+30m");
        assert_eq!(offset_label(-45), "45s");
    }

    #[test]
    fn test_priority_for_offset() {
        assert_eq!(NotifyPriority::for_offset(0), NotifyPriority::Urgent);
        assert_eq!(NotifyPriority::for_offset(-3_600), NotifyPriority::High);
        assert_eq!(NotifyPriority::for_offset(-86_400), NotifyPriority::Normal);
        assert_eq!(NotifyPriority::for_offset(600), NotifyPriority::Low);
    }

    #[test]
    fn test_payload_due_time() {
        let t = Utc.with_ymd_and_hms(2026, 3, 7, 20, 0, 0).unwrap();
        let target = NotificationTarget::new("match-7", t, ["u1"]).with_label("Ark");
        let payload = ReminderPayload::new(&target, "u1", -3_600);
        assert_eq!(payload.due_at, Utc.with_ymd_and_hms(2026, 3, 7, 19, 0, 0).unwrap());
        assert_eq!(payload.title(), "Ark reminder (1h)");
        assert_eq!(payload.priority, NotifyPriority::High);
    }

    #[test]
    fn test_due_at_out_of_range() {
        let t = Utc.with_ymd_and_hms(2026, 3, 7, 20, 0, 0).unwrap();
        let target = NotificationTarget::new("m", t, ["u1"]);
        assert_eq!(target.due_at(0), Some(t));
        assert_eq!(target.due_at(i64::MAX), None);
        assert_eq!(target.due_at(i64::MIN), None);
    }

    #[test]
    fn test_channel_recipients() {
        let r = channel_recipient("998877");
        assert_eq!(r, "channel:998877");
        assert_eq!(channel_id(&r), Some("998877"));
        assert_eq!(channel_id("12345"), None);
    }

    #[test]
    fn test_entity_times() {
        let t = Utc.with_ymd_and_hms(2026, 3, 7, 20, 0, 0).unwrap();
        let e = LifecycleEntity::new("1", "Scheduled").with_time("start_time", t);
        assert_eq!(e.time("start_time"), Some(t));
        assert_eq!(e.time("signup_close"), None);
    }
}
