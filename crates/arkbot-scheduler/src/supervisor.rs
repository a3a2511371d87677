//! Task supervisor: owns named background loops, restarts crashed ones with
//! capped exponential backoff, and coordinates shutdown.
//!
//! Every registered unit gets a child [`CancellationToken`]; units must watch
//! it at each suspension point. A unit that returns an error or panics is
//! rebuilt from its factory after a backoff delay. A unit that returns `Ok`
//! without being cancelled is considered finished and is not restarted.
//! A unit that stays up for the healthy-reset period has its restart count
//! cleared while it keeps running.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arkbot_core::config::SupervisorConfig;
use arkbot_core::error::{ArkError, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Builds a fresh instance of a supervised loop.
pub type TaskFactory = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Starting,
    Running,
    Restarting,
    Stopped,
}

/// Point-in-time view of one supervised task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub name: String,
    pub state: TaskState,
    pub restart_count: u32,
    pub last_error: Option<String>,
}

/// Which units exited on their own and which had to be aborted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub graceful: Vec<String>,
    pub forced: Vec<String>,
}

#[derive(Debug)]
struct TaskStatus {
    state: TaskState,
    restart_count: u32,
    last_error: Option<String>,
}

type SharedStatus = Arc<Mutex<TaskStatus>>;

fn with_status<R>(status: &SharedStatus, f: impl FnOnce(&mut TaskStatus) -> R) -> R {
    let mut guard = status.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut guard)
}

struct TaskEntry {
    name: String,
    factory: TaskFactory,
    status: SharedStatus,
    handle: Option<JoinHandle<()>>,
}

/// Delay before restart number `restart_count` (1-based):
/// `base * 2^(restart_count - 1)`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, restart_count: u32) -> Duration {
    let exp = restart_count.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exp).min(max)
}

/// Restart count after a crash, given how long the unit had been running.
/// A long healthy run wipes the history before counting this crash.
pub fn restart_count_after(previous: u32, ran_for: Duration, healthy_reset: Duration) -> u32 {
    let base = if ran_for >= healthy_reset { 0 } else { previous };
    base.saturating_add(1)
}

pub struct TaskSupervisor {
    config: SupervisorConfig,
    tasks: Vec<TaskEntry>,
    token: CancellationToken,
    started: bool,
    stopped: bool,
}

impl TaskSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            tasks: Vec::new(),
            token: CancellationToken::new(),
            started: false,
            stopped: false,
        }
    }

    /// Root cancellation token; cancelled by [`TaskSupervisor::stop_all`].
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Register a named unit. Names are unique. Units registered after
    /// `start_all` are launched immediately.
    pub fn register<F>(&mut self, name: &str, factory: F) -> Result<()>
    where
        F: Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        if self.tasks.iter().any(|t| t.name == name) {
            return Err(ArkError::DuplicateTask(name.to_string()));
        }
        if self.stopped {
            return Err(ArkError::Other(format!(
                "supervisor stopped, cannot register '{name}'"
            )));
        }
        let mut entry = TaskEntry {
            name: name.to_string(),
            factory: Arc::new(factory),
            status: Arc::new(Mutex::new(TaskStatus {
                state: TaskState::Starting,
                restart_count: 0,
                last_error: None,
            })),
            handle: None,
        };
        if self.started {
            entry.handle = Some(self.launch(&entry));
        }
        tracing::debug!("📋 Registered task '{name}'");
        self.tasks.push(entry);
        Ok(())
    }

    /// Launch every registered unit. Calling it again is a no-op.
    pub fn start_all(&mut self) {
        if self.started || self.stopped {
            return;
        }
        self.started = true;
        for idx in 0..self.tasks.len() {
            let handle = self.launch(&self.tasks[idx]);
            self.tasks[idx].handle = Some(handle);
        }
        tracing::info!("🚀 Supervisor started {} task(s)", self.tasks.len());
    }

    fn launch(&self, entry: &TaskEntry) -> JoinHandle<()> {
        tokio::spawn(supervise(
            entry.name.clone(),
            entry.factory.clone(),
            entry.status.clone(),
            self.token.clone(),
            self.config.clone(),
        ))
    }

    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        self.tasks
            .iter()
            .map(|t| {
                with_status(&t.status, |s| TaskSnapshot {
                    name: t.name.clone(),
                    state: s.state,
                    restart_count: s.restart_count,
                    last_error: s.last_error.clone(),
                })
            })
            .collect()
    }

    /// Cancel every unit and wait up to `timeout` for them to exit. Units still
    /// running at the deadline are aborted. Safe to call more than once.
    pub async fn stop_all(&mut self, timeout: Duration) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if self.stopped {
            return report;
        }
        self.stopped = true;
        self.token.cancel();
        tracing::info!("🛑 Stopping {} task(s)", self.tasks.len());

        let deadline = Instant::now() + timeout;
        for entry in &mut self.tasks {
            let Some(mut handle) = entry.handle.take() else {
                with_status(&entry.status, |s| s.state = TaskState::Stopped);
                continue;
            };
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(_) => report.graceful.push(entry.name.clone()),
                Err(_) => {
                    tracing::warn!("⚠️ Task '{}' ignored cancellation, aborting", entry.name);
                    handle.abort();
                    let _ = handle.await;
                    report.forced.push(entry.name.clone());
                }
            }
            with_status(&entry.status, |s| s.state = TaskState::Stopped);
        }

        tracing::info!(
            "✅ Supervisor stopped ({} graceful, {} forced)",
            report.graceful.len(),
            report.forced.len()
        );
        report
    }
}

async fn supervise(
    name: String,
    factory: TaskFactory,
    status: SharedStatus,
    token: CancellationToken,
    config: SupervisorConfig,
) {
    loop {
        if token.is_cancelled() {
            break;
        }
        with_status(&status, |s| s.state = TaskState::Running);
        let started = Instant::now();
        let run = AssertUnwindSafe(factory(token.child_token())).catch_unwind();
        tokio::pin!(run);
        let outcome = tokio::select! {
            outcome = &mut run => outcome,
            _ = tokio::time::sleep(config.healthy_reset()) => {
                let previous = with_status(&status, |s| std::mem::take(&mut s.restart_count));
                if previous > 0 {
                    tracing::info!(task = %name, "💚 Task healthy, restart count reset (was {previous})");
                }
                run.await
            }
        };

        if token.is_cancelled() {
            break;
        }

        let error = match outcome {
            Ok(Ok(())) => {
                tracing::info!(task = %name, "🏁 Task finished");
                break;
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };

        let restart_count = with_status(&status, |s| {
            s.restart_count =
                restart_count_after(s.restart_count, started.elapsed(), config.healthy_reset());
            s.last_error = Some(error.clone());
            s.state = TaskState::Restarting;
            s.restart_count
        });
        let delay = backoff_delay(config.base_delay(), config.max_delay(), restart_count);
        tracing::error!(
            task = %name,
            restart_count,
            "💥 Task crashed: {error}; restarting in {}ms",
            delay.as_millis()
        );

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        with_status(&status, |s| s.state = TaskState::Starting);
    }
    with_status(&status, |s| s.state = TaskState::Stopped);
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            base_delay_ms: 10,
            max_delay_ms: 40,
            healthy_reset_secs: 600,
            shutdown_timeout_secs: 1,
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        let delays: Vec<u64> = (1..=8)
            .map(|n| backoff_delay(base, max, n).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(backoff_delay(base, max, u32::MAX), max);
    }

    #[test]
    fn test_restart_count_resets_after_healthy_run() {
        let healthy = Duration::from_secs(600);
        assert_eq!(restart_count_after(0, Duration::from_secs(1), healthy), 1);
        assert_eq!(restart_count_after(5, Duration::from_secs(1), healthy), 6);
        assert_eq!(restart_count_after(5, Duration::from_secs(600), healthy), 1);
    }

    #[tokio::test]
    async fn test_failing_unit_is_restarted_with_backoff() {
        let starts: Arc<Mutex<Vec<Instant>>> = Arc::default();
        let mut sup = TaskSupervisor::new(fast_config());
        let recorded = starts.clone();
        sup.register("flaky", move |_token| {
            let recorded = recorded.clone();
            async move {
                recorded.lock().unwrap().push(Instant::now());
                Err(ArkError::Other("boom".into()))
            }
            .boxed()
        })
        .unwrap();
        sup.start_all();

        wait_for(|| starts.lock().unwrap().len() >= 5).await;
        let snap = sup.snapshot();
        assert!(snap[0].restart_count >= 4);
        assert_eq!(snap[0].last_error.as_deref(), Some("boom"));

        let report = sup.stop_all(Duration::from_secs(1)).await;
        assert_eq!(report.graceful, vec!["flaky".to_string()]);

        let starts = starts.lock().unwrap();
        let cfg = fast_config();
        for (i, pair) in starts.windows(2).take(4).enumerate() {
            let gap = pair[1] - pair[0];
            let expected = backoff_delay(cfg.base_delay(), cfg.max_delay(), i as u32 + 1);
            assert!(gap >= expected, "restart {} came after {gap:?}", i + 1);
        }
    }

    #[tokio::test]
    async fn test_panic_counts_as_crash() {
        let runs = Arc::new(AtomicU32::new(0));
        let mut sup = TaskSupervisor::new(fast_config());
        let counter = runs.clone();
        sup.register("panicky", move |token| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run explodes");
                }
                token.cancelled().await;
                Ok(())
            }
            .boxed()
        })
        .unwrap();
        sup.start_all();

        wait_for(|| runs.load(Ordering::SeqCst) >= 2).await;
        let snap = sup.snapshot();
        assert_eq!(snap[0].restart_count, 1);
        assert!(snap[0].last_error.as_deref().unwrap().contains("first run explodes"));
        sup.stop_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let mut sup = TaskSupervisor::new(fast_config());
        sup.register("reminders", |_| async { Ok(()) }.boxed()).unwrap();
        let err = sup.register("reminders", |_| async { Ok(()) }.boxed());
        assert!(matches!(err, Err(ArkError::DuplicateTask(_))));
    }

    #[tokio::test]
    async fn test_stop_all_aborts_stubborn_units_and_is_idempotent() {
        let mut sup = TaskSupervisor::new(fast_config());
        sup.register("polite", |token| {
            async move {
                token.cancelled().await;
                Ok(())
            }
            .boxed()
        })
        .unwrap();
        sup.register("stubborn", |_token| {
            async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            .boxed()
        })
        .unwrap();
        sup.start_all();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = sup.stop_all(Duration::from_millis(100)).await;
        assert_eq!(report.graceful, vec!["polite".to_string()]);
        assert_eq!(report.forced, vec!["stubborn".to_string()]);
        assert!(sup.snapshot().iter().all(|t| t.state == TaskState::Stopped));

        let again = sup.stop_all(Duration::from_millis(100)).await;
        assert_eq!(again, ShutdownReport::default());
    }

    #[tokio::test]
    async fn test_clean_exit_is_not_restarted() {
        let runs = Arc::new(AtomicU32::new(0));
        let mut sup = TaskSupervisor::new(fast_config());
        let counter = runs.clone();
        sup.register("oneshot", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        })
        .unwrap();
        sup.start_all();

        wait_for(|| sup.snapshot()[0].state == TaskState::Stopped).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        sup.stop_all(Duration::from_millis(100)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_count_clears_while_unit_stays_up() {
        let runs = Arc::new(AtomicU32::new(0));
        let mut sup = TaskSupervisor::new(SupervisorConfig {
            healthy_reset_secs: 1,
            ..fast_config()
        });
        let counter = runs.clone();
        sup.register("recovering", move |token| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(ArkError::Other("boom".into()));
                }
                token.cancelled().await;
                Ok(())
            }
            .boxed()
        })
        .unwrap();
        sup.start_all();

        wait_for(|| runs.load(Ordering::SeqCst) >= 3).await;
        assert_eq!(sup.snapshot()[0].restart_count, 2);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let snap = sup.snapshot();
        assert_eq!(snap[0].restart_count, 0);
        assert_eq!(snap[0].state, TaskState::Running);
        assert_eq!(snap[0].last_error.as_deref(), Some("boom"));

        let report = sup.stop_all(Duration::from_secs(1)).await;
        assert_eq!(report.graceful, vec!["recovering".to_string()]);
    }
}
