//! Ark match end to end over the SQLite store: reminders, lifecycle
//! transitions, admin cancel.

use std::sync::{Arc, Mutex as StdMutex};

use arkbot_core::config::{LifecycleConfig, ReminderConfig};
use arkbot_core::error::DeliveryError;
use arkbot_core::traits::Deliverer;
use arkbot_core::types::{LifecycleEntity, ReminderPayload, audit_actions};
use arkbot_scheduler::ark::{self, ReminderPrefs};
use arkbot_scheduler::engine::sweep_reminders;
use arkbot_scheduler::{
    EntityLocks, LifecycleEngine, MarkerKey, MarkerStatus, NotificationScheduler, SchedulerDb,
    StateStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Recorder(StdMutex<Vec<(String, i64)>>);

#[async_trait]
impl Deliverer for Recorder {
    async fn deliver(
        &self,
        recipient_id: &str,
        payload: &ReminderPayload,
    ) -> std::result::Result<(), DeliveryError> {
        self.0
            .lock()
            .unwrap()
            .push((recipient_id.to_string(), payload.offset_seconds));
        Ok(())
    }
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 2, 19, 0, 0).unwrap()
}

struct Harness {
    _dir: tempfile::TempDir,
    store: StateStore,
    db: Arc<SchedulerDb>,
    locks: EntityLocks,
    deliverer: Arc<Recorder>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(&dir.path().join("state")).unwrap();
        let db = Arc::new(SchedulerDb::open(&dir.path().join("arkbot.db")).unwrap());
        Self {
            _dir: dir,
            store,
            db,
            locks: EntityLocks::new(),
            deliverer: Arc::new(Recorder::default()),
        }
    }

    fn add_match(&self, id: &str, signup_close: DateTime<Utc>, members: &[&str]) {
        let entity = LifecycleEntity::new(id, ark::SCHEDULED)
            .with_time(ark::SIGNUP_CLOSE, signup_close)
            .with_time(ark::START_TIME, start());
        self.db.upsert_entity(&entity, "K98").unwrap();
        let members: Vec<String> = members.iter().map(|m| m.to_string()).collect();
        self.db.set_roster(id, &members).unwrap();
    }

    fn reminders(&self) -> NotificationScheduler {
        NotificationScheduler::new(
            self.store.clone(),
            ark::NAMESPACE,
            ReminderConfig::default(),
            self.deliverer.clone(),
            self.db.clone(),
            self.db.clone(),
        )
        .unwrap()
    }

    fn lifecycle(&self) -> LifecycleEngine {
        LifecycleEngine::new(
            &self.store,
            ark::NAMESPACE,
            ark::transitions(&LifecycleConfig::default(), self.db.clone()),
            ark::active_statuses(),
            self.db.clone(),
            self.db.clone(),
            self.locks.clone(),
        )
        .unwrap()
    }

    fn status(&self, id: &str) -> String {
        self.db.get_entity(id).unwrap().unwrap().status
    }
}

#[tokio::test]
async fn test_lock_and_checkin_applied_in_one_sweep() {
    let h = Harness::new();
    // Signup closed a day before start; check-in opens 12h before start.
    h.add_match("7", start() - Duration::hours(24), &["A"]);
    let mut engine = h.lifecycle();

    let now = start() - Duration::hours(1);
    let report = engine.tick(now).await.unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(h.status("7"), ark::LOCKED);
    assert!(h.db.is_checkin_open("7").unwrap());

    // Threshold order: lock before checkin (newest audit first).
    let transitions: Vec<String> = h
        .db
        .recent_audit(10)
        .unwrap()
        .into_iter()
        .filter(|r| r.action_type == audit_actions::TRANSITION_APPLIED)
        .map(|r| r.details["transition"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(transitions, vec!["checkin".to_string(), "lock".to_string()]);

    let again = engine.tick(now).await.unwrap();
    assert_eq!(again.applied, 0);

    // A restarted engine reads the applied set back and stays idle.
    let mut restarted = h.lifecycle();
    assert_eq!(restarted.tick(now).await.unwrap().applied, 0);

    let done = restarted.tick(start() + Duration::minutes(91)).await.unwrap();
    assert_eq!(done.applied, 1);
    assert_eq!(h.status("7"), ark::COMPLETED);
}

#[tokio::test]
async fn test_reminders_follow_roster_and_prefs() {
    let h = Harness::new();
    h.add_match("7", start() - Duration::hours(24), &["A", "B"]);
    h.db
        .set_prefs(
            "A",
            &ReminderPrefs {
                opt_out_1h: true,
                ..Default::default()
            },
        )
        .unwrap();

    let mut reminders = h.reminders();
    let offsets = [ark::OFFSET_1H, ark::OFFSET_START];

    let token = CancellationToken::new();
    let report = sweep_reminders(
        &mut reminders,
        h.db.as_ref(),
        &offsets,
        start() - Duration::hours(2),
        &token,
    )
    .await
    .unwrap();
    assert!(report.is_idle());
    assert_eq!(reminders.marker_status(&MarkerKey::new("7", "A", ark::OFFSET_1H)), None);
    assert_eq!(
        reminders.marker_status(&MarkerKey::new("7", "A", ark::OFFSET_START)),
        Some(MarkerStatus::Scheduled)
    );
    assert_eq!(reminders.scheduled().len(), 3);

    let report = sweep_reminders(
        &mut reminders,
        h.db.as_ref(),
        &offsets,
        start() - Duration::hours(1),
        &token,
    )
    .await
    .unwrap();
    assert_eq!(report.sent, 1);

    let report = sweep_reminders(&mut reminders, h.db.as_ref(), &offsets, start(), &token)
        .await
        .unwrap();
    assert_eq!(report.sent, 2);

    let mut delivered = h.deliverer.0.lock().unwrap().clone();
    delivered.sort();
    assert_eq!(
        delivered,
        vec![
            ("A".to_string(), ark::OFFSET_START),
            ("B".to_string(), ark::OFFSET_1H),
            ("B".to_string(), ark::OFFSET_START),
        ]
    );
}

#[tokio::test]
async fn test_cancel_match_drops_reminders_and_transitions() {
    let h = Harness::new();
    h.add_match("9", start() - Duration::hours(24), &["A", "B"]);

    let reminders = Mutex::new(h.reminders());
    {
        let mut sched = reminders.lock().await;
        sweep_reminders(
            &mut sched,
            h.db.as_ref(),
            &[ark::OFFSET_1H, ark::OFFSET_START],
            start() - Duration::hours(3),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(sched.scheduled().len(), 4);
    }

    let removed = ark::cancel_match(
        &h.locks,
        h.db.as_ref(),
        h.db.as_ref(),
        &reminders,
        "9",
        Some("admin-1"),
    )
    .await
    .unwrap();
    assert_eq!(removed, 4);
    assert_eq!(h.status("9"), ark::CANCELLED);

    let cancel = h
        .db
        .recent_audit(1)
        .unwrap()
        .pop()
        .unwrap();
    assert_eq!(cancel.action_type, audit_actions::ENTITY_CANCELLED);
    assert_eq!(cancel.actor_id.as_deref(), Some("admin-1"));

    // Cancelled is terminal: no transition fires, no reminder goes out.
    let mut engine = h.lifecycle();
    let report = engine.tick(start() + Duration::hours(3)).await.unwrap();
    assert_eq!(report.applied, 0);
    assert_eq!(h.status("9"), ark::CANCELLED);

    let mut sched = reminders.lock().await;
    let report = sweep_reminders(
        &mut sched,
        h.db.as_ref(),
        &[ark::OFFSET_1H, ark::OFFSET_START],
        start(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(report.sent, 0);
    assert!(h.deliverer.0.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_channel_gets_match_wide_reminders_only() {
    let h = Harness::new();
    h.add_match("7", start() - Duration::hours(24), &["A"]);
    h.db.set_channel("7", Some("555")).unwrap();

    let mut reminders = h.reminders();
    let offsets = [ark::OFFSET_CHECKIN_12H, ark::OFFSET_1H];
    let token = CancellationToken::new();
    for now in [start() - Duration::hours(12), start() - Duration::hours(1)] {
        sweep_reminders(&mut reminders, h.db.as_ref(), &offsets, now, &token)
            .await
            .unwrap();
    }

    let mut delivered = h.deliverer.0.lock().unwrap().clone();
    delivered.sort();
    assert_eq!(
        delivered,
        vec![
            ("A".to_string(), ark::OFFSET_CHECKIN_12H),
            ("A".to_string(), ark::OFFSET_1H),
            ("channel:555".to_string(), ark::OFFSET_1H),
        ]
    );
    assert_eq!(
        reminders.marker_status(&MarkerKey::new("7", "channel:555", ark::OFFSET_CHECKIN_12H)),
        None
    );
}
