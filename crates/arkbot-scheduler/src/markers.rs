//! Typed marker collections.
//!
//! A [`MarkerBook`] holds one status bucket (scheduled, sent or failed) for
//! every target. It persists as `target_id → recipient_id → [offset_seconds]`
//! and is a set in memory, so membership checks never scan lists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Marker status. Sent and Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkerStatus {
    Scheduled,
    Sent,
    Failed,
}

/// Identity of one notification: `(target, recipient, offset)`.
/// Field order gives the processing order within a tick.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MarkerKey {
    pub target_id: String,
    pub recipient_id: String,
    pub offset_seconds: i64,
}

impl MarkerKey {
    pub fn new(target_id: &str, recipient_id: &str, offset_seconds: i64) -> Self {
        Self {
            target_id: target_id.to_string(),
            recipient_id: recipient_id.to_string(),
            offset_seconds,
        }
    }
}

impl std::fmt::Display for MarkerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.target_id, self.recipient_id, self.offset_seconds
        )
    }
}

/// A marker together with its status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMarker {
    #[serde(flatten)]
    pub key: MarkerKey,
    pub status: MarkerStatus,
}

/// One status bucket of markers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkerBook(BTreeMap<String, BTreeMap<String, BTreeSet<i64>>>);

impl MarkerBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &MarkerKey) -> bool {
        self.0
            .get(&key.target_id)
            .and_then(|r| r.get(&key.recipient_id))
            .is_some_and(|offsets| offsets.contains(&key.offset_seconds))
    }

    /// Returns `false` if the marker was already present.
    pub fn insert(&mut self, key: &MarkerKey) -> bool {
        self.0
            .entry(key.target_id.clone())
            .or_default()
            .entry(key.recipient_id.clone())
            .or_default()
            .insert(key.offset_seconds)
    }

    /// Remove one marker, dropping buckets that become empty.
    pub fn remove(&mut self, key: &MarkerKey) -> bool {
        let Some(recipients) = self.0.get_mut(&key.target_id) else {
            return false;
        };
        let Some(offsets) = recipients.get_mut(&key.recipient_id) else {
            return false;
        };
        let removed = offsets.remove(&key.offset_seconds);
        if offsets.is_empty() {
            recipients.remove(&key.recipient_id);
        }
        if recipients.is_empty() {
            self.0.remove(&key.target_id);
        }
        removed
    }

    /// Remove every marker of a target. Returns how many were removed.
    pub fn remove_target(&mut self, target_id: &str) -> usize {
        self.0
            .remove(target_id)
            .map(|recipients| recipients.values().map(BTreeSet::len).sum())
            .unwrap_or(0)
    }

    /// Remove every marker of one recipient within a target.
    pub fn remove_recipient(&mut self, target_id: &str, recipient_id: &str) -> usize {
        let Some(recipients) = self.0.get_mut(target_id) else {
            return 0;
        };
        let removed = recipients.remove(recipient_id).map_or(0, |o| o.len());
        if recipients.is_empty() {
            self.0.remove(target_id);
        }
        removed
    }

    /// Keep only targets for which `keep` returns true.
    pub fn retain_targets(&mut self, mut keep: impl FnMut(&str) -> bool) -> usize {
        let mut removed = 0;
        self.0.retain(|target_id, recipients| {
            if keep(target_id) {
                true
            } else {
                removed += recipients.values().map(BTreeSet::len).sum::<usize>();
                false
            }
        });
        removed
    }

    /// All markers in `(target, recipient, offset)` order.
    pub fn keys(&self) -> impl Iterator<Item = MarkerKey> + '_ {
        self.0.iter().flat_map(|(target_id, recipients)| {
            recipients.iter().flat_map(move |(recipient_id, offsets)| {
                offsets
                    .iter()
                    .map(move |&offset| MarkerKey::new(target_id, recipient_id, offset))
            })
        })
    }

    pub fn target_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0
            .values()
            .flat_map(BTreeMap::values)
            .map(BTreeSet::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One entry of the append-only failure log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub recipient_id: String,
    pub target_id: String,
    pub offset_seconds: i64,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(key: &MarkerKey, reason: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            recipient_id: key.recipient_id.clone(),
            target_id: key.target_id.clone(),
            offset_seconds: key.offset_seconds,
            reason: reason.into(),
            occurred_at,
        }
    }
}
