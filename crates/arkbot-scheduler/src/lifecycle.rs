//! Lifecycle transition engine: advances long-lived entities through an
//! ordered status sequence at wall-clock thresholds.
//!
//! Each transition is applied at most once per entity. What has been applied
//! is tracked in a persisted `<ns>_applied` document (`entity_id → [name]`),
//! never inferred from the current status, so two thresholds crossed between
//! sweeps are both applied, in threshold order.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use arkbot_core::error::{ArkError, Result};
use arkbot_core::traits::{AuditSink, EntityRepository};
use arkbot_core::types::{AuditRecord, LifecycleEntity, audit_actions};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::locks::EntityLocks;
use crate::store::{Document, StateStore};

/// Computes when a transition fires for an entity. `None` means never
/// (the entity lacks the field it is computed from).
pub type TriggerFn = Arc<dyn Fn(&LifecycleEntity) -> Option<DateTime<Utc>> + Send + Sync>;

/// Performs one transition's side effects.
#[async_trait]
pub trait TransitionHandler: Send + Sync {
    /// Returns the entity's new status, or `None` if the status is unchanged.
    async fn apply(&self, entity: &LifecycleEntity) -> Result<Option<String>>;
}

/// Handler that only moves the entity to a fixed status.
pub struct SetStatus(pub String);

#[async_trait]
impl TransitionHandler for SetStatus {
    async fn apply(&self, _entity: &LifecycleEntity) -> Result<Option<String>> {
        Ok(Some(self.0.clone()))
    }
}

/// A named transition definition.
#[derive(Clone)]
pub struct Transition {
    pub name: String,
    trigger: TriggerFn,
    handler: Arc<dyn TransitionHandler>,
}

impl Transition {
    pub fn new<F, H>(name: impl Into<String>, trigger: F, handler: H) -> Self
    where
        F: Fn(&LifecycleEntity) -> Option<DateTime<Utc>> + Send + Sync + 'static,
        H: TransitionHandler + 'static,
    {
        Self {
            name: name.into(),
            trigger: Arc::new(trigger),
            handler: Arc::new(handler),
        }
    }

    /// Transition that just sets `status` when `trigger` passes.
    pub fn set_status<F>(name: impl Into<String>, trigger: F, status: impl Into<String>) -> Self
    where
        F: Fn(&LifecycleEntity) -> Option<DateTime<Utc>> + Send + Sync + 'static,
    {
        Self::new(name, trigger, SetStatus(status.into()))
    }

    pub fn trigger_time(&self, entity: &LifecycleEntity) -> Option<DateTime<Utc>> {
        (self.trigger)(entity)
    }
}

impl std::fmt::Debug for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transition").field("name", &self.name).finish()
    }
}

/// Counters for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub entities: usize,
    pub applied: usize,
    pub failed: usize,
}

/// Applied-transitions document: `entity_id → {transition_name}`.
type AppliedSet = BTreeMap<String, BTreeSet<String>>;

pub struct LifecycleEngine {
    namespace: String,
    transitions: Vec<Transition>,
    /// Statuses still eligible for transitions; everything else is terminal.
    active_statuses: Vec<String>,
    repo: Arc<dyn EntityRepository>,
    audit: Arc<dyn AuditSink>,
    locks: EntityLocks,
    applied: Document<AppliedSet>,
    cache: BTreeMap<String, LifecycleEntity>,
}

impl LifecycleEngine {
    pub fn new(
        store: &StateStore,
        namespace: &str,
        transitions: Vec<Transition>,
        active_statuses: Vec<String>,
        repo: Arc<dyn EntityRepository>,
        audit: Arc<dyn AuditSink>,
        locks: EntityLocks,
    ) -> Result<Self> {
        let applied = Document::load(store, &format!("{namespace}_applied"))?;
        Ok(Self {
            namespace: namespace.to_string(),
            transitions,
            active_statuses,
            repo,
            audit,
            locks,
            applied,
            cache: BTreeMap::new(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn locks(&self) -> &EntityLocks {
        &self.locks
    }

    pub fn is_applied(&self, entity_id: &str, transition: &str) -> bool {
        self.applied
            .value()
            .get(entity_id)
            .is_some_and(|names| names.contains(transition))
    }

    pub fn applied_for(&self, entity_id: &str) -> Vec<String> {
        self.applied
            .value()
            .get(entity_id)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Last known projection of an entity.
    pub fn entity(&self, entity_id: &str) -> Option<&LifecycleEntity> {
        self.cache.get(entity_id)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    fn is_active(&self, status: &str) -> bool {
        self.active_statuses.iter().any(|s| s == status)
    }

    /// Reload the cached projection from the repository.
    pub async fn refresh(&mut self) -> Result<usize> {
        let entities = self.repo.load_entities(&self.active_statuses).await?;
        self.cache = entities.into_iter().map(|e| (e.id.clone(), e)).collect();
        Ok(self.cache.len())
    }

    /// Due, not-yet-applied transitions of `entity`, in threshold order
    /// (definition order breaks ties).
    fn due_transitions(&self, entity: &LifecycleEntity, now: DateTime<Utc>) -> Vec<usize> {
        let mut due: Vec<(DateTime<Utc>, usize)> = self
            .transitions
            .iter()
            .enumerate()
            .filter(|(_, t)| !self.is_applied(&entity.id, &t.name))
            .filter_map(|(idx, t)| t.trigger_time(entity).map(|at| (at, idx)))
            .filter(|(at, _)| *at <= now)
            .collect();
        due.sort();
        due.into_iter().map(|(_, idx)| idx).collect()
    }

    /// One sweep over all non-terminal entities.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<SweepReport> {
        self.tick_cancellable(now, &CancellationToken::new()).await
    }

    /// [`tick`](Self::tick) that stops between entities once `token` is cancelled.
    pub async fn tick_cancellable(
        &mut self,
        now: DateTime<Utc>,
        token: &CancellationToken,
    ) -> Result<SweepReport> {
        self.refresh().await?;
        let mut report = SweepReport {
            entities: self.cache.len(),
            ..Default::default()
        };

        let ids: Vec<String> = self.cache.keys().cloned().collect();
        for entity_id in &ids {
            if token.is_cancelled() {
                tracing::info!("⏹️ Lifecycle sweep '{}' interrupted", self.namespace);
                break;
            }
            let Some(entity) = self.cache.get(entity_id).cloned() else {
                continue;
            };
            if self.due_transitions(&entity, now).is_empty() {
                continue;
            }

            let _guard = self.locks.acquire(entity_id).await;
            // Re-read under the lock; an admin may have changed it meanwhile.
            let mut current = match self.repo.load_entity(entity_id).await {
                Ok(Some(e)) => e,
                Ok(None) => {
                    self.cache.remove(entity_id);
                    continue;
                }
                Err(e) => {
                    tracing::error!(entity_id = %entity_id, "❌ Failed to reload entity: {e}");
                    report.failed += 1;
                    continue;
                }
            };
            if !self.is_active(&current.status) {
                tracing::debug!(entity_id = %entity_id, status = %current.status, "⏭️ Entity left active statuses");
                self.cache.remove(entity_id);
                continue;
            }

            for idx in self.due_transitions(&current, now) {
                let transition = self.transitions[idx].clone();
                match self.apply_one(&transition, &mut current, now).await {
                    Ok(()) => report.applied += 1,
                    Err(e) => {
                        tracing::error!(
                            entity_id = %entity_id,
                            transition = %transition.name,
                            "❌ Transition failed: {e}"
                        );
                        report.failed += 1;
                        break;
                    }
                }
            }
            self.cache.insert(entity_id.clone(), current);
        }

        self.prune_applied();
        self.locks.purge_idle();

        if report.applied > 0 || report.failed > 0 {
            tracing::info!(
                "🔁 Lifecycle sweep '{}': {} entities, {} applied, {} failed",
                self.namespace,
                report.entities,
                report.applied,
                report.failed
            );
        }
        Ok(report)
    }

    async fn apply_one(
        &mut self,
        transition: &Transition,
        entity: &mut LifecycleEntity,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let from = entity.status.clone();
        let new_status = transition
            .handler
            .apply(entity)
            .await
            .map_err(|e| match e {
                ArkError::TransitionApply { .. } => e,
                other => ArkError::transition(&entity.id, &transition.name, other.to_string()),
            })?;

        if let Some(status) = new_status.as_ref().filter(|s| **s != from) {
            self.repo
                .save_entity_status(&entity.id, status)
                .await
                .map_err(|e| ArkError::transition(&entity.id, &transition.name, e.to_string()))?;
            entity.status = status.clone();
        }

        self.applied.update(|applied| {
            applied
                .entry(entity.id.clone())
                .or_default()
                .insert(transition.name.clone())
        });
        if let Err(e) = self.applied.flush() {
            tracing::error!(
                entity_id = %entity.id,
                transition = %transition.name,
                "❌ Applied-transitions document not persisted: {e}"
            );
        }

        tracing::info!(
            "➡️ {} '{}': {} → {}",
            transition.name,
            entity.id,
            from,
            entity.status
        );

        let record = AuditRecord::system(
            audit_actions::TRANSITION_APPLIED,
            &entity.id,
            now,
            serde_json::json!({
                "transition": transition.name,
                "from": from,
                "to": entity.status,
            }),
        );
        if let Err(e) = self.audit.audit(record).await {
            tracing::warn!(entity_id = %entity.id, "⚠️ Audit write failed: {e}");
        }
        Ok(())
    }

    /// Forget applied sets of entities that are no longer loaded (terminal or deleted).
    fn prune_applied(&mut self) {
        let live: HashSet<&String> = self.cache.keys().collect();
        let stale: Vec<String> = self
            .applied
            .value()
            .keys()
            .filter(|id| !live.contains(id))
            .cloned()
            .collect();
        if stale.is_empty() {
            return;
        }
        self.applied.update(|applied| {
            for id in &stale {
                applied.remove(id);
            }
        });
        if let Err(e) = self.applied.flush() {
            tracing::warn!("⚠️ Failed to prune applied transitions: {e}");
        }
    }
}

/// Change an entity's status from outside the engine (admin override).
/// Holds the entity lock so it never races an automatic transition.
pub async fn override_status(
    locks: &EntityLocks,
    repo: &dyn EntityRepository,
    audit: &dyn AuditSink,
    entity_id: &str,
    status: &str,
    actor_id: Option<&str>,
) -> Result<()> {
    let _guard = locks.acquire(entity_id).await;
    let entity = repo
        .load_entity(entity_id)
        .await?
        .ok_or_else(|| ArkError::Other(format!("entity {entity_id} not found")))?;
    repo.save_entity_status(entity_id, status).await?;

    tracing::info!("🛠️ Status override '{}': {} → {}", entity_id, entity.status, status);
    let action = if status == "Cancelled" {
        audit_actions::ENTITY_CANCELLED
    } else {
        audit_actions::STATUS_OVERRIDE
    };
    let mut record = AuditRecord::system(
        action,
        entity_id,
        Utc::now(),
        serde_json::json!({ "from": entity.status, "to": status }),
    );
    record.actor_id = actor_id.map(String::from);
    audit.audit(record).await
}
