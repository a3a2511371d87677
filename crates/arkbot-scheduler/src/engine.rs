//! Scheduler loops: the bodies the supervisor runs.
//! Uses tokio::interval for ticking; each loop exits promptly on cancellation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use arkbot_core::error::Result;
use arkbot_core::traits::TargetSource;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::{LifecycleEngine, SweepReport};
use crate::reminders::{NotificationScheduler, TickReport};

/// One reminder sweep: schedule markers for every active target, prune targets
/// that went away, then deliver whatever is due.
///
/// Stops between markers once `token` is cancelled. Only a corrupt document
/// is returned as an error; everything else is logged.
pub async fn sweep_reminders(
    scheduler: &mut NotificationScheduler,
    source: &dyn TargetSource,
    offsets: &[i64],
    now: DateTime<Utc>,
    token: &CancellationToken,
) -> Result<TickReport> {
    if token.is_cancelled() {
        return Ok(TickReport::default());
    }
    match source.active_targets().await {
        Ok(targets) => {
            let active: HashSet<String> = targets.iter().map(|t| t.target_id.clone()).collect();
            for target in &targets {
                if let Err(e) = scheduler.compute_schedule(target, offsets).await {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    tracing::error!(target_id = %target.target_id, "❌ Failed to schedule reminders: {e}");
                }
            }
            if let Err(e) = scheduler.prune(now, &active) {
                tracing::warn!("⚠️ Reminder prune failed: {e}");
            }
        }
        Err(e) => {
            // Keep delivering what is already scheduled; skip pruning so a
            // flaky source cannot wipe markers.
            tracing::warn!("⚠️ Could not load notification targets: {e}");
        }
    }
    Ok(scheduler.tick_cancellable(now, token).await)
}

/// Reminder loop: sweep every `interval` until cancelled.
pub async fn run_reminder_loop(
    scheduler: Arc<Mutex<NotificationScheduler>>,
    source: Arc<dyn TargetSource>,
    offsets: Vec<i64>,
    interval: Duration,
    token: CancellationToken,
) -> Result<()> {
    tracing::info!("⏰ Reminder loop started (check every {}s)", interval.as_secs());
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let mut sched = scheduler.lock().await;
        sweep_reminders(&mut sched, source.as_ref(), &offsets, Utc::now(), &token).await?;
    }

    tracing::info!("⏹️ Reminder loop stopped");
    Ok(())
}

/// Lifecycle loop: one engine sweep every `interval` until cancelled.
pub async fn run_lifecycle_loop(
    engine: Arc<Mutex<LifecycleEngine>>,
    interval: Duration,
    token: CancellationToken,
) -> Result<()> {
    tracing::info!("⏰ Lifecycle loop started (check every {}s)", interval.as_secs());
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let result: Result<SweepReport> = engine
            .lock()
            .await
            .tick_cancellable(Utc::now(), &token)
            .await;
        match result {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => tracing::error!("❌ Lifecycle sweep failed: {e}"),
        }
    }

    tracing::info!("⏹️ Lifecycle loop stopped");
    Ok(())
}

/// Supervisor factory for [`run_reminder_loop`].
pub fn reminder_task(
    scheduler: Arc<Mutex<NotificationScheduler>>,
    source: Arc<dyn TargetSource>,
    offsets: Vec<i64>,
    interval: Duration,
) -> impl Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static {
    move |token| {
        run_reminder_loop(
            scheduler.clone(),
            source.clone(),
            offsets.clone(),
            interval,
            token,
        )
        .boxed()
    }
}

/// Supervisor factory for [`run_lifecycle_loop`].
pub fn lifecycle_task(
    engine: Arc<Mutex<LifecycleEngine>>,
    interval: Duration,
) -> impl Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static {
    move |token| run_lifecycle_loop(engine.clone(), interval, token).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arkbot_core::error::{ArkError, DeliveryError};
    use arkbot_core::traits::{AuditSink, Deliverer, NoOptOut};
    use arkbot_core::types::{AuditRecord, NotificationTarget, ReminderPayload};
    use arkbot_core::ArkConfig;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex as StdMutex;

    use crate::store::StateStore;

    struct Targets(StdMutex<Option<Vec<NotificationTarget>>>);

    #[async_trait]
    impl TargetSource for Targets {
        async fn active_targets(&self) -> Result<Vec<NotificationTarget>> {
            self.0
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| ArkError::database("offline"))
        }
    }

    struct Ok200;

    #[async_trait]
    impl Deliverer for Ok200 {
        async fn deliver(
            &self,
            _recipient_id: &str,
            _payload: &ReminderPayload,
        ) -> std::result::Result<(), DeliveryError> {
            Ok(())
        }
    }

    struct Discard;

    #[async_trait]
    impl AuditSink for Discard {
        async fn audit(&self, _record: AuditRecord) -> Result<()> {
            Ok(())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 7, 20, 0, 0).unwrap()
    }

    fn scheduler(dir: &tempfile::TempDir) -> NotificationScheduler {
        NotificationScheduler::new(
            StateStore::open(dir.path()).unwrap(),
            "ark",
            ArkConfig::default().reminders,
            Arc::new(Ok200),
            Arc::new(NoOptOut),
            Arc::new(Discard),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_sweep_schedules_and_delivers() {
        let dir = tempfile::tempdir().unwrap();
        let mut sched = scheduler(&dir);
        let source = Targets(StdMutex::new(Some(vec![NotificationTarget::new(
            "m1",
            t0(),
            ["a", "b"],
        )])));

        let report = sweep_reminders(
            &mut sched,
            &source,
            &[-3600, 0],
            t0() - chrono::Duration::hours(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(sched.scheduled().len(), 2);
    }

    #[tokio::test]
    async fn test_source_outage_keeps_markers() {
        let dir = tempfile::tempdir().unwrap();
        let mut sched = scheduler(&dir);
        let source = Targets(StdMutex::new(Some(vec![NotificationTarget::new(
            "m1",
            t0(),
            ["a"],
        )])));
        let token = CancellationToken::new();
        sweep_reminders(&mut sched, &source, &[0], t0() - chrono::Duration::hours(2), &token)
            .await
            .unwrap();

        *source.0.lock().unwrap() = None;
        let report = sweep_reminders(&mut sched, &source, &[0], t0(), &token)
            .await
            .unwrap();
        assert_eq!(report.sent, 1);
    }

    #[tokio::test]
    async fn test_cancelled_sweep_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut sched = scheduler(&dir);
        let source = Targets(StdMutex::new(Some(vec![NotificationTarget::new(
            "m1",
            t0(),
            ["a"],
        )])));
        let token = CancellationToken::new();
        token.cancel();

        let report = sweep_reminders(&mut sched, &source, &[0], t0(), &token)
            .await
            .unwrap();
        assert!(report.is_idle());
        assert!(sched.scheduled().is_empty());
        assert!(sched.sent().is_empty());
    }

    #[tokio::test]
    async fn test_loop_exits_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let sched = Arc::new(Mutex::new(scheduler(&dir)));
        let source: Arc<dyn TargetSource> = Arc::new(Targets(StdMutex::new(Some(Vec::new()))));
        let token = CancellationToken::new();

        let handle = tokio::spawn(run_reminder_loop(
            sched,
            source,
            vec![0],
            Duration::from_millis(10),
            token.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
