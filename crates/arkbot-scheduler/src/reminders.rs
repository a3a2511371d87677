//! Notification scheduler: per-recipient reminders at fixed offsets from a
//! target's reference time, deduplicated across restarts by persisted markers.
//!
//! Documents owned by one scheduler (prefixed with its namespace):
//! - `<ns>_scheduled`, `<ns>_sent`, `<ns>_failed`: marker books
//! - `<ns>_targets`: `target_id → NotificationTarget`, so due times survive a restart
//! - `<ns>_failures`: append-only failure log

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use arkbot_core::config::ReminderConfig;
use arkbot_core::error::{ArkError, DeliveryError, Result};
use arkbot_core::traits::{AuditSink, Deliverer, PreferenceStore};
use arkbot_core::types::{AuditRecord, NotificationTarget, ReminderPayload, audit_actions};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::markers::{FailureRecord, MarkerBook, MarkerKey, MarkerStatus, NotificationMarker};
use crate::store::{Document, StateStore};

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub attempted: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped_optout: usize,
    pub discarded_stale: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

impl std::fmt::Display for TickReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "attempted={} sent={} failed={} optout={} stale={}",
            self.attempted, self.sent, self.failed, self.skipped_optout, self.discarded_stale
        )
    }
}

enum Outcome {
    Sent { attempts: u32 },
    Failed { attempts: u32, reason: String },
    /// Cancelled before the next attempt; the marker stays Scheduled.
    Interrupted { attempts: u32 },
}

/// Generic reminder scheduler. One instance per domain (events, Ark matches),
/// distinguished by namespace.
pub struct NotificationScheduler {
    store: StateStore,
    namespace: String,
    config: ReminderConfig,
    deliverer: Arc<dyn Deliverer>,
    prefs: Arc<dyn PreferenceStore>,
    audit: Arc<dyn AuditSink>,
    scheduled: Document<MarkerBook>,
    sent: Document<MarkerBook>,
    failed: Document<MarkerBook>,
    targets: Document<BTreeMap<String, NotificationTarget>>,
}

impl NotificationScheduler {
    /// Load (or start fresh) the marker documents under `namespace`.
    pub fn new(
        store: StateStore,
        namespace: &str,
        config: ReminderConfig,
        deliverer: Arc<dyn Deliverer>,
        prefs: Arc<dyn PreferenceStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let key = |suffix: &str| format!("{namespace}_{suffix}");
        let mut scheduler = Self {
            scheduled: Document::load(&store, &key("scheduled"))?,
            sent: Document::load(&store, &key("sent"))?,
            failed: Document::load(&store, &key("failed"))?,
            targets: Document::load(&store, &key("targets"))?,
            store,
            namespace: namespace.to_string(),
            config,
            deliverer,
            prefs,
            audit,
        };
        scheduler.drop_settled_from_scheduled();
        Ok(scheduler)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn config(&self) -> &ReminderConfig {
        &self.config
    }

    fn failure_log_key(&self) -> String {
        format!("{}_failures", self.namespace)
    }

    /// A crash between saving `sent` and saving `scheduled` can leave a marker
    /// in both. Terminal status wins.
    fn drop_settled_from_scheduled(&mut self) {
        let settled: Vec<MarkerKey> = self
            .scheduled
            .value()
            .keys()
            .filter(|k| self.sent.value().contains(k) || self.failed.value().contains(k))
            .collect();
        if settled.is_empty() {
            return;
        }
        self.scheduled.update(|book| {
            for key in &settled {
                book.remove(key);
            }
        });
        self.flush_logged();
    }

    /// Current status of one marker, if it exists.
    pub fn marker_status(&self, key: &MarkerKey) -> Option<MarkerStatus> {
        if self.sent.value().contains(key) {
            Some(MarkerStatus::Sent)
        } else if self.failed.value().contains(key) {
            Some(MarkerStatus::Failed)
        } else if self.scheduled.value().contains(key) {
            Some(MarkerStatus::Scheduled)
        } else {
            None
        }
    }

    pub fn scheduled(&self) -> &MarkerBook {
        self.scheduled.value()
    }

    pub fn sent(&self) -> &MarkerBook {
        self.sent.value()
    }

    pub fn failed(&self) -> &MarkerBook {
        self.failed.value()
    }

    pub fn target(&self, target_id: &str) -> Option<&NotificationTarget> {
        self.targets.value().get(target_id)
    }

    /// Entries of the persisted failure log.
    pub fn failure_log(&self) -> Result<Vec<FailureRecord>> {
        self.store.load_or_default(&self.failure_log_key())
    }

    /// Create a Scheduled marker for every `(recipient, offset)` of `target` that
    /// has no marker yet and is not opted out. Returns the new markers.
    ///
    /// On a persistence error the in-memory state is rolled back and the error
    /// returned; nothing partial is kept.
    pub async fn compute_schedule(
        &mut self,
        target: &NotificationTarget,
        offsets: &[i64],
    ) -> Result<Vec<NotificationMarker>> {
        let mut recipients: Vec<&str> = target.recipients.iter().map(String::as_str).collect();
        recipients.sort_unstable();
        recipients.dedup();

        let mut created = Vec::new();
        for recipient_id in recipients {
            for &offset in offsets {
                let key = MarkerKey::new(&target.target_id, recipient_id, offset);
                if self.marker_status(&key).is_some() {
                    continue;
                }
                if target.due_at(offset).is_none() {
                    tracing::warn!("⚠️ Offset {offset}s out of range for '{}', skipping", target.target_id);
                    continue;
                }
                if self.prefs.is_opted_out(recipient_id, offset).await {
                    tracing::debug!(
                        target_id = %target.target_id,
                        recipient_id,
                        offset_seconds = offset,
                        "🔕 Recipient opted out, no marker"
                    );
                    continue;
                }
                created.push(key);
            }
        }

        let target_changed = self.targets.value().get(&target.target_id) != Some(target);
        if created.is_empty() && !target_changed {
            return Ok(Vec::new());
        }

        let previous_scheduled = self.scheduled.value().clone();
        let previous_targets = self.targets.value().clone();

        self.targets.update(|t| t.insert(target.target_id.clone(), target.clone()));
        self.scheduled.update(|book| {
            for key in &created {
                book.insert(key);
            }
        });

        if let Err(e) = self.targets.flush().and_then(|_| self.scheduled.flush()) {
            self.targets.update(|t| *t = previous_targets);
            self.scheduled.update(|b| *b = previous_scheduled);
            return Err(e);
        }

        if !created.is_empty() {
            tracing::info!(
                "📅 Scheduled {} reminder(s) for '{}'",
                created.len(),
                target.target_id
            );
        }

        Ok(created
            .into_iter()
            .map(|key| NotificationMarker {
                key,
                status: MarkerStatus::Scheduled,
            })
            .collect())
    }

    /// Deliver every Scheduled marker that is due at `now`. Markers that are
    /// more than the configured grace window late are discarded instead.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        self.tick_cancellable(now, &CancellationToken::new()).await
    }

    /// [`tick`](Self::tick) that stops between markers once `token` is
    /// cancelled. Settled markers are flushed; the rest stay Scheduled.
    pub async fn tick_cancellable(
        &mut self,
        now: DateTime<Utc>,
        token: &CancellationToken,
    ) -> TickReport {
        let grace = self.config.grace_window();
        self.reconcile(now, grace, token).await
    }

    /// Startup pass: reload persisted markers, deliver those missed by at most
    /// `grace_window_seconds`, discard older ones, leave future ones scheduled.
    pub async fn rehydrate(
        &mut self,
        now: DateTime<Utc>,
        grace_window_seconds: i64,
    ) -> Result<TickReport> {
        self.scheduled = Document::load(&self.store, self.scheduled.key())?;
        self.sent = Document::load(&self.store, self.sent.key())?;
        self.failed = Document::load(&self.store, self.failed.key())?;
        self.targets = Document::load(&self.store, self.targets.key())?;
        self.drop_settled_from_scheduled();

        tracing::info!(
            "♻️ Rehydrating '{}': {} scheduled, {} sent, {} failed",
            self.namespace,
            self.scheduled.value().len(),
            self.sent.value().len(),
            self.failed.value().len()
        );

        let grace = Duration::try_seconds(grace_window_seconds.max(0)).unwrap_or(Duration::MAX);
        let report = self.reconcile(now, grace, &CancellationToken::new()).await;
        Ok(report)
    }

    async fn reconcile(
        &mut self,
        now: DateTime<Utc>,
        grace: Duration,
        token: &CancellationToken,
    ) -> TickReport {
        let mut report = TickReport::default();
        let pending: Vec<MarkerKey> = self.scheduled.value().keys().collect();
        let total = pending.len();

        for (index, key) in pending.into_iter().enumerate() {
            if token.is_cancelled() {
                tracing::info!(
                    "⏹️ Reminder pass '{}' interrupted, {} marker(s) left for the next pass",
                    self.namespace,
                    total - index
                );
                break;
            }

            let Some(target) = self.targets.value().get(&key.target_id).cloned() else {
                tracing::warn!("⚠️ Marker {key} has no known target, dropping");
                self.scheduled.update(|b| b.remove(&key));
                continue;
            };

            let Some(due_at) = target.due_at(key.offset_seconds) else {
                tracing::warn!("⚠️ Marker {key} has an out-of-range due time, dropping");
                self.scheduled.update(|b| b.remove(&key));
                continue;
            };
            if due_at > now {
                continue;
            }

            if now - due_at > grace {
                self.discard_stale(&key, due_at, now).await;
                report.discarded_stale += 1;
                continue;
            }

            if self.prefs.is_opted_out(&key.recipient_id, key.offset_seconds).await {
                tracing::debug!("🔕 {key} opted out since scheduling, removing");
                self.scheduled.update(|b| b.remove(&key));
                report.skipped_optout += 1;
                continue;
            }

            report.attempted += 1;
            let payload = ReminderPayload::new(&target, &key.recipient_id, key.offset_seconds);
            match self.deliver_with_retry(&key, &payload, token).await {
                Outcome::Sent { attempts } => {
                    self.mark_sent(&key, attempts, now).await;
                    report.sent += 1;
                }
                Outcome::Failed { attempts, reason } => {
                    self.mark_failed(&key, attempts, &reason, now).await;
                    report.failed += 1;
                }
                Outcome::Interrupted { attempts } => {
                    tracing::info!("⏹️ {key}: stopped after {attempts} attempt(s), stays scheduled");
                }
            }
        }

        self.flush_logged();
        if !report.is_idle() {
            tracing::info!("🔔 Reminder pass '{}': {report}", self.namespace);
        }
        report
    }

    /// An attempt already in flight runs to completion (bounded by the
    /// delivery timeout) so its outcome is recorded; cancellation only
    /// prevents the next one.
    async fn deliver_with_retry(
        &self,
        key: &MarkerKey,
        payload: &ReminderPayload,
        token: &CancellationToken,
    ) -> Outcome {
        let max_attempts = self.config.max_attempts.max(1);
        let timeout = self.config.delivery_timeout();
        let mut last_reason = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 && token.is_cancelled() {
                return Outcome::Interrupted {
                    attempts: attempt - 1,
                };
            }
            let result =
                match tokio::time::timeout(timeout, self.deliverer.deliver(&key.recipient_id, payload))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(DeliveryError::Transient(
                        ArkError::Timeout(format!("delivery after {}s", timeout.as_secs()))
                            .to_string(),
                    )),
                };

            match result {
                Ok(()) => return Outcome::Sent { attempts: attempt },
                Err(DeliveryError::Permanent(reason)) => {
                    tracing::warn!("🚫 {key}: permanent delivery failure: {reason}");
                    return Outcome::Failed {
                        attempts: attempt,
                        reason,
                    };
                }
                Err(DeliveryError::Transient(reason)) => {
                    tracing::warn!(
                        "🔄 {key}: attempt {attempt}/{max_attempts} failed: {reason}"
                    );
                    last_reason = reason;
                }
            }
        }

        Outcome::Failed {
            attempts: max_attempts,
            reason: last_reason,
        }
    }

    async fn mark_sent(&mut self, key: &MarkerKey, attempts: u32, now: DateTime<Utc>) {
        self.sent.update(|b| b.insert(key));
        self.scheduled.update(|b| b.remove(key));
        // Sent first: a crash in between leaves a duplicate entry that loading
        // resolves, never a second delivery.
        if let Err(e) = self.sent.flush() {
            tracing::error!("❌ Reminder {key} delivered but not persisted: {e}");
        }
        tracing::info!("📨 Reminder sent: {key}");
        self.record_audit(
            audit_actions::REMINDER_SENT,
            key,
            now,
            serde_json::json!({ "attempts": attempts }),
        )
        .await;
    }

    async fn mark_failed(&mut self, key: &MarkerKey, attempts: u32, reason: &str, now: DateTime<Utc>) {
        self.failed.update(|b| b.insert(key));
        self.scheduled.update(|b| b.remove(key));
        if let Err(e) = self.failed.flush() {
            tracing::error!("❌ Failed to persist failed marker {key}: {e}");
        }
        if let Err(e) = self
            .store
            .append(&self.failure_log_key(), FailureRecord::new(key, reason, now))
        {
            tracing::error!("❌ Failed to append failure log for {key}: {e}");
        }
        tracing::warn!("❌ Reminder failed after {attempts} attempt(s): {key}: {reason}");
        self.record_audit(
            audit_actions::REMINDER_FAILED,
            key,
            now,
            serde_json::json!({ "attempts": attempts, "reason": reason }),
        )
        .await;
    }

    async fn discard_stale(&mut self, key: &MarkerKey, due_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.failed.update(|b| b.insert(key));
        self.scheduled.update(|b| b.remove(key));
        if let Err(e) = self.failed.flush() {
            tracing::error!("❌ Failed to persist discarded marker {key}: {e}");
        }
        let late_by = (now - due_at).num_seconds();
        tracing::info!("🗑️ Stale reminder discarded ({late_by}s late): {key}");
        self.record_audit(
            audit_actions::REMINDER_DISCARDED,
            key,
            now,
            serde_json::json!({ "reason": "stale", "late_by_seconds": late_by }),
        )
        .await;
    }

    async fn record_audit(
        &self,
        action: &str,
        key: &MarkerKey,
        now: DateTime<Utc>,
        mut details: serde_json::Value,
    ) {
        if let Some(obj) = details.as_object_mut() {
            obj.insert("recipient_id".into(), key.recipient_id.clone().into());
            obj.insert("offset_seconds".into(), key.offset_seconds.into());
        }
        let record = AuditRecord::system(action, &key.target_id, now, details);
        if let Err(e) = self.audit.audit(record).await {
            tracing::warn!("⚠️ Audit write failed for {key}: {e}");
        }
    }

    /// Remove every pending reminder of a target (match cancelled).
    pub fn cancel_target(&mut self, target_id: &str) -> Result<usize> {
        let previous = self.scheduled.value().clone();
        let removed = self.scheduled.update(|b| b.remove_target(target_id));
        if removed == 0 {
            return Ok(0);
        }
        if let Err(e) = self.scheduled.flush() {
            self.scheduled.update(|b| *b = previous);
            return Err(e);
        }
        tracing::info!("🛑 Cancelled {removed} reminder(s) for '{target_id}'");
        Ok(removed)
    }

    /// Remove one recipient's pending reminders for a target (member withdrew).
    pub fn cancel_recipient(&mut self, target_id: &str, recipient_id: &str) -> Result<usize> {
        let previous = self.scheduled.value().clone();
        let removed = self
            .scheduled
            .update(|b| b.remove_recipient(target_id, recipient_id));
        if removed == 0 {
            return Ok(0);
        }
        if let Err(e) = self.scheduled.flush() {
            self.scheduled.update(|b| *b = previous);
            return Err(e);
        }
        tracing::info!("🛑 Cancelled {removed} reminder(s) for {recipient_id} on '{target_id}'");
        Ok(removed)
    }

    /// Drop all markers of targets that are no longer active or whose reference
    /// time is older than the retention window. Returns how many markers went.
    pub fn prune(&mut self, now: DateTime<Utc>, active_target_ids: &HashSet<String>) -> Result<usize> {
        let cutoff = now
            .checked_sub_signed(self.config.retention())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let targets = self.targets.value();
        let keep = |target_id: &str| {
            active_target_ids.contains(target_id)
                && targets
                    .get(target_id)
                    .is_none_or(|t| t.reference_time >= cutoff)
        };

        let mut doomed: HashSet<String> = HashSet::new();
        for book in [self.scheduled.value(), self.sent.value(), self.failed.value()] {
            doomed.extend(book.target_ids().filter(|id| !keep(*id)).map(String::from));
        }
        doomed.extend(targets.keys().filter(|id| !keep(id.as_str())).cloned());
        if doomed.is_empty() {
            return Ok(0);
        }

        let mut removed = 0;
        for doc in [&mut self.scheduled, &mut self.sent, &mut self.failed] {
            removed += doc.update(|b| b.retain_targets(|id| !doomed.contains(id)));
        }
        self.targets.update(|t| t.retain(|id, _| !doomed.contains(id)));
        self.flush_all()?;

        tracing::info!(
            "🧹 Pruned {} target(s), {removed} marker(s) from '{}'",
            doomed.len(),
            self.namespace
        );
        Ok(removed)
    }

    fn flush_all(&mut self) -> Result<()> {
        self.sent.flush()?;
        self.failed.flush()?;
        self.scheduled.flush()?;
        self.targets.flush()
    }

    fn flush_logged(&mut self) {
        if let Err(e) = self.flush_all() {
            tracing::error!("❌ Failed to persist reminder state '{}': {e}", self.namespace);
        }
    }
}
