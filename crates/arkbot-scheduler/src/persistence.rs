//! SQLite-backed relational store for lifecycle entities, rosters, reminder
//! preferences and the audit log. Canonical entity status lives here; the
//! scheduler only keeps projections and markers.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use arkbot_core::error::{ArkError, Result};
use arkbot_core::traits::{AuditSink, EntityRepository, PreferenceStore, TargetSource};
use arkbot_core::types::{self, AuditRecord, LifecycleEntity, NotificationTarget};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use crate::ark::{self, CheckinControl, ReminderPrefs};

pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

impl SchedulerDb {
    /// Open or create the database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| ArkError::database(format!("DB open: {e}")))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| ArkError::database(format!("DB open: {e}")))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ArkError::database("connection lock poisoned"))
    }

    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            -- Entities driven by the lifecycle engine (Ark matches)
            CREATE TABLE IF NOT EXISTS lifecycle_entities (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                label TEXT NOT NULL DEFAULT '',
                times TEXT NOT NULL DEFAULT '{}',   -- JSON: {signup_close: ..., start_time: ...}
                checkin_open INTEGER NOT NULL DEFAULT 0,
                channel_id TEXT,                    -- confirmation channel, if any
                updated_at TEXT NOT NULL
            );

            -- Members signed up per entity
            CREATE TABLE IF NOT EXISTS roster (
                entity_id TEXT NOT NULL REFERENCES lifecycle_entities(id) ON DELETE CASCADE,
                member_id TEXT NOT NULL,
                PRIMARY KEY (entity_id, member_id)
            );

            -- Per-member reminder opt-outs (JSON)
            CREATE TABLE IF NOT EXISTS reminder_prefs (
                member_id TEXT PRIMARY KEY,
                prefs TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Append-only audit trail
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                action_type TEXT NOT NULL,
                actor_id TEXT,
                entity_id TEXT NOT NULL,
                details TEXT,
                occurred_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_log(entity_id);
            ",
            )
            .map_err(|e| ArkError::database(format!("Migration: {e}")))?;

        // Columns added after the first release (fails harmlessly if present)
        let _ = self.conn()?.execute(
            "ALTER TABLE lifecycle_entities ADD COLUMN channel_id TEXT",
            [],
        );
        Ok(())
    }

    /// Insert or replace an entity (status, label and time fields).
    pub fn upsert_entity(&self, entity: &LifecycleEntity, label: &str) -> Result<()> {
        let times = serde_json::to_string(&entity.times)?;
        self.conn()?
            .execute(
                "INSERT INTO lifecycle_entities (id, status, label, times, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status, label = excluded.label,
                    times = excluded.times, updated_at = excluded.updated_at",
                params![entity.id, entity.status, label, times, Utc::now().to_rfc3339()],
            )
            .map_err(|e| ArkError::database(format!("Upsert entity: {e}")))?;
        Ok(())
    }

    pub fn get_entity(&self, entity_id: &str) -> Result<Option<LifecycleEntity>> {
        let row = self
            .conn()?
            .query_row(
                "SELECT id, status, times FROM lifecycle_entities WHERE id = ?1",
                [entity_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
            )
            .optional()
            .map_err(|e| ArkError::database(format!("Get entity: {e}")))?;
        row.map(|(id, status, times)| entity_from_row(id, status, &times))
            .transpose()
    }

    pub fn entity_label(&self, entity_id: &str) -> Result<String> {
        let label = self
            .conn()?
            .query_row(
                "SELECT label FROM lifecycle_entities WHERE id = ?1",
                [entity_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|e| ArkError::database(format!("Get label: {e}")))?;
        Ok(label.unwrap_or_default())
    }

    /// Set or clear the channel that gets match-wide reminder posts.
    pub fn set_channel(&self, entity_id: &str, channel_id: Option<&str>) -> Result<()> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE lifecycle_entities SET channel_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![channel_id, Utc::now().to_rfc3339(), entity_id],
            )
            .map_err(|e| ArkError::database(format!("Save channel: {e}")))?;
        if changed == 0 {
            return Err(ArkError::database(format!("entity {entity_id} not found")));
        }
        Ok(())
    }

    pub fn channel(&self, entity_id: &str) -> Result<Option<String>> {
        let channel = self
            .conn()?
            .query_row(
                "SELECT channel_id FROM lifecycle_entities WHERE id = ?1",
                [entity_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map_err(|e| ArkError::database(format!("Get channel: {e}")))?;
        Ok(channel.flatten().filter(|c| !c.is_empty()))
    }

    fn entities_with_status(&self, statuses: &[String]) -> Result<Vec<LifecycleEntity>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(",");
        let sql = format!(
            "SELECT id, status, times FROM lifecycle_entities WHERE status IN ({placeholders}) ORDER BY id"
        );
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| ArkError::database(format!("Prepare: {e}")))?;
        let rows = stmt
            .query_map(params_from_iter(statuses.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })
            .map_err(|e| ArkError::database(format!("Load entities: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ArkError::database(format!("Load entities: {e}")))?;

        rows.into_iter()
            .map(|(id, status, times)| entity_from_row(id, status, &times))
            .collect()
    }

    fn set_status(&self, entity_id: &str, status: &str) -> Result<()> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE lifecycle_entities SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status, Utc::now().to_rfc3339(), entity_id],
            )
            .map_err(|e| ArkError::database(format!("Save status: {e}")))?;
        if changed == 0 {
            return Err(ArkError::database(format!("entity {entity_id} not found")));
        }
        Ok(())
    }

    /// Replace an entity's roster.
    pub fn set_roster(&self, entity_id: &str, members: &[String]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| ArkError::database(format!("Begin: {e}")))?;
        tx.execute("DELETE FROM roster WHERE entity_id = ?1", [entity_id])
            .map_err(|e| ArkError::database(format!("Clear roster: {e}")))?;
        for member in members {
            tx.execute(
                "INSERT OR IGNORE INTO roster (entity_id, member_id) VALUES (?1, ?2)",
                params![entity_id, member],
            )
            .map_err(|e| ArkError::database(format!("Insert roster: {e}")))?;
        }
        tx.commit()
            .map_err(|e| ArkError::database(format!("Commit roster: {e}")))?;
        Ok(())
    }

    pub fn roster(&self, entity_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT member_id FROM roster WHERE entity_id = ?1 ORDER BY member_id")
            .map_err(|e| ArkError::database(format!("Prepare: {e}")))?;
        let members = stmt
            .query_map([entity_id], |row| row.get::<_, String>(0))
            .map_err(|e| ArkError::database(format!("Roster: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ArkError::database(format!("Roster: {e}")))?;
        Ok(members)
    }

    pub fn set_prefs(&self, member_id: &str, prefs: &ReminderPrefs) -> Result<()> {
        let json = serde_json::to_string(prefs)?;
        self.conn()?
            .execute(
                "INSERT INTO reminder_prefs (member_id, prefs, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(member_id) DO UPDATE SET prefs = excluded.prefs, updated_at = excluded.updated_at",
                params![member_id, json, Utc::now().to_rfc3339()],
            )
            .map_err(|e| ArkError::database(format!("Save prefs: {e}")))?;
        Ok(())
    }

    /// A member's preferences; defaults (everything allowed) when unset.
    pub fn prefs(&self, member_id: &str) -> Result<ReminderPrefs> {
        let json = self
            .conn()?
            .query_row(
                "SELECT prefs FROM reminder_prefs WHERE member_id = ?1",
                [member_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|e| ArkError::database(format!("Load prefs: {e}")))?;
        match json {
            Some(j) => Ok(serde_json::from_str(&j)?),
            None => Ok(ReminderPrefs::default()),
        }
    }

    pub fn is_checkin_open(&self, entity_id: &str) -> Result<bool> {
        let open = self
            .conn()?
            .query_row(
                "SELECT checkin_open FROM lifecycle_entities WHERE id = ?1",
                [entity_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(|e| ArkError::database(format!("Check-in state: {e}")))?;
        Ok(open.unwrap_or(0) != 0)
    }

    pub fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        let details = serde_json::to_string(&record.details)?;
        self.conn()?
            .execute(
                "INSERT INTO audit_log (action_type, actor_id, entity_id, details, occurred_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.action_type,
                    record.actor_id,
                    record.entity_id,
                    details,
                    record.occurred_at.to_rfc3339()
                ],
            )
            .map_err(|e| ArkError::database(format!("Audit: {e}")))?;
        Ok(())
    }

    /// Most recent audit entries first.
    pub fn recent_audit(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT action_type, actor_id, entity_id, details, occurred_at
                 FROM audit_log ORDER BY id DESC LIMIT ?1",
            )
            .map_err(|e| ArkError::database(format!("Prepare: {e}")))?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(|e| ArkError::database(format!("Recent audit: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ArkError::database(format!("Recent audit: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|(action_type, actor_id, entity_id, details, occurred_at)| AuditRecord {
                action_type,
                actor_id,
                entity_id,
                occurred_at: DateTime::parse_from_rfc3339(&occurred_at)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                details: details
                    .and_then(|d| serde_json::from_str(&d).ok())
                    .unwrap_or_default(),
            })
            .collect())
    }
}

fn entity_from_row(id: String, status: String, times: &str) -> Result<LifecycleEntity> {
    let times: BTreeMap<String, DateTime<Utc>> = serde_json::from_str(times)
        .map_err(|e| ArkError::database(format!("entity {id} has bad times: {e}")))?;
    Ok(LifecycleEntity { id, status, times })
}

#[async_trait]
impl EntityRepository for SchedulerDb {
    async fn load_entities(&self, statuses: &[String]) -> Result<Vec<LifecycleEntity>> {
        self.entities_with_status(statuses)
    }

    async fn load_entity(&self, entity_id: &str) -> Result<Option<LifecycleEntity>> {
        self.get_entity(entity_id)
    }

    async fn save_entity_status(&self, entity_id: &str, status: &str) -> Result<()> {
        self.set_status(entity_id, status)
    }
}

#[async_trait]
impl AuditSink for SchedulerDb {
    async fn audit(&self, record: AuditRecord) -> Result<()> {
        self.append_audit(&record)
    }
}

#[async_trait]
impl PreferenceStore for SchedulerDb {
    /// Channel recipients have no preferences; they only get the match-wide
    /// reminders.
    async fn is_opted_out(&self, recipient_id: &str, offset_seconds: i64) -> bool {
        if types::channel_id(recipient_id).is_some() {
            return !ark::is_channel_reminder(offset_seconds);
        }
        match self.prefs(recipient_id) {
            Ok(prefs) => !ark::is_dm_allowed(offset_seconds, &prefs),
            Err(e) => {
                tracing::warn!("⚠️ Could not read reminder prefs for {recipient_id}: {e}");
                false
            }
        }
    }
}

#[async_trait]
impl TargetSource for SchedulerDb {
    /// Every open match with a start time, with its roster as recipients
    /// plus its channel when one is set.
    async fn active_targets(&self) -> Result<Vec<NotificationTarget>> {
        let mut targets = Vec::new();
        for entity in self.entities_with_status(&ark::active_statuses())? {
            let mut roster = self.roster(&entity.id)?;
            if let Some(channel) = self.channel(&entity.id)? {
                roster.push(types::channel_recipient(&channel));
            }
            let label = self.entity_label(&entity.id)?;
            if let Some(target) = ark::match_target(&entity, roster, &label) {
                targets.push(target);
            }
        }
        Ok(targets)
    }
}

#[async_trait]
impl CheckinControl for SchedulerDb {
    async fn open_checkin(&self, match_id: &str) -> Result<()> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE lifecycle_entities SET checkin_open = 1, updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), match_id],
            )
            .map_err(|e| ArkError::database(format!("Open check-in: {e}")))?;
        if changed == 0 {
            return Err(ArkError::database(format!("match {match_id} not found")));
        }
        Ok(())
    }
}
