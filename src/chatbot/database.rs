//! Persistent SQLite database for credentials, quota counters and dispatch outcomes.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{info, warn};

use crate::chatbot::credentials::{Credential, CredentialState, CredentialStore, ModelSlot, StoreError};
use crate::chatbot::ledger::{LedgerError, QuotaCounter, UsageStore, WindowKind};
use crate::chatbot::message::DispatchResult;
use crate::chatbot::outcome::OutcomeRecorder;
use crate::provider::ProviderFamily;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<DatabaseError> for StoreError {
    fn from(e: DatabaseError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<DatabaseError> for LedgerError {
    fn from(e: DatabaseError) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Create a new in-memory database.
    pub fn new() -> Result<Self, DatabaseError> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Open (or create) the database file at `path`.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        let db = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        db.init_schema()?;

        let (credentials, outcomes) = db.get_counts()?;
        info!(
            "Loaded database from {:?} ({} credentials, {} recorded outcomes)",
            path, credentials, outcomes
        );
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                family TEXT NOT NULL,
                api_key TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'enabled',
                priority INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS credential_models (
                credential_id TEXT NOT NULL,
                model TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                quota_limit INTEGER NOT NULL,
                window_kind TEXT NOT NULL,
                throttled_until TEXT,
                PRIMARY KEY (credential_id, model)
            );

            CREATE TABLE IF NOT EXISTS usage (
                credential_id TEXT NOT NULL,
                model TEXT NOT NULL,
                used INTEGER NOT NULL DEFAULT 0,
                quota_limit INTEGER NOT NULL,
                window_kind TEXT NOT NULL,
                window_start TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (credential_id, model)
            );

            CREATE TABLE IF NOT EXISTS dispatch_outcomes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL,
                success INTEGER NOT NULL,
                credential_id TEXT,
                model TEXT,
                latency_ms INTEGER NOT NULL,
                error_kind TEXT,
                fallback_reason TEXT,
                escalate INTEGER NOT NULL,
                attempts TEXT NOT NULL,
                message_ids TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_outcomes_conversation ON dispatch_outcomes(conversation_id);
            CREATE INDEX IF NOT EXISTS idx_outcomes_recorded_at ON dispatch_outcomes(recorded_at);
        "#,
        )?;
        Ok(())
    }

    fn get_counts(&self) -> Result<(usize, usize), DatabaseError> {
        let conn = self.conn();
        let credentials: i64 = conn.query_row("SELECT COUNT(*) FROM credentials", [], |row| row.get(0))?;
        let outcomes: i64 = conn.query_row("SELECT COUNT(*) FROM dispatch_outcomes", [], |row| row.get(0))?;
        Ok((credentials as usize, outcomes as usize))
    }

    // ==================== CREDENTIAL METHODS ====================

    fn load_credentials(&self) -> Result<Vec<Credential>, DatabaseError> {
        let conn = self.conn();

        let mut stmt = conn.prepare(
            "SELECT credential_id, model, enabled, quota_limit, window_kind, throttled_until
             FROM credential_models ORDER BY credential_id, model",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut models: BTreeMap<String, BTreeMap<String, ModelSlot>> = BTreeMap::new();
        for row in rows {
            let (credential_id, model, enabled, limit, window_kind, throttled_until) = row?;
            let window = WindowKind::parse(&window_kind)
                .ok_or_else(|| DatabaseError::Corrupt(format!("window kind '{window_kind}'")))?;
            let slot = ModelSlot {
                enabled,
                limit: limit.max(0) as u64,
                window,
                throttled_until: throttled_until.as_deref().map(parse_timestamp).transpose()?,
                last_used: None,
            };
            models.entry(credential_id).or_default().insert(model, slot);
        }

        let mut stmt = conn.prepare("SELECT id, family, api_key, state, priority FROM credentials ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut credentials = Vec::new();
        for row in rows {
            let (id, family, api_key, state, priority) = row?;
            let family = ProviderFamily::parse(&family)
                .ok_or_else(|| DatabaseError::Corrupt(format!("provider family '{family}'")))?;
            let state = CredentialState::parse(&state)
                .ok_or_else(|| DatabaseError::Corrupt(format!("credential state '{state}'")))?;
            credentials.push(Credential {
                models: models.remove(&id).unwrap_or_default(),
                id,
                family,
                api_key,
                state,
                priority: priority.max(0) as u32,
            });
        }
        Ok(credentials)
    }

    fn store_credential(&self, credential: &Credential) -> Result<(), DatabaseError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO credentials (id, family, api_key, state, priority)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                family = excluded.family,
                api_key = excluded.api_key,
                priority = excluded.priority",
            params![
                credential.id,
                credential.family.as_str(),
                credential.api_key,
                credential.state.as_str(),
                credential.priority as i64
            ],
        )?;

        let existing: Vec<String> = {
            let mut stmt = tx.prepare("SELECT model FROM credential_models WHERE credential_id = ?1")?;
            let rows = stmt.query_map(params![credential.id], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        for model in existing.iter().filter(|m| !credential.models.contains_key(*m)) {
            tx.execute(
                "DELETE FROM credential_models WHERE credential_id = ?1 AND model = ?2",
                params![credential.id, model],
            )?;
        }

        for (model, slot) in &credential.models {
            tx.execute(
                "INSERT INTO credential_models (credential_id, model, enabled, quota_limit, window_kind)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(credential_id, model) DO UPDATE SET
                    enabled = excluded.enabled,
                    quota_limit = excluded.quota_limit,
                    window_kind = excluded.window_kind",
                params![credential.id, model, slot.enabled, slot.limit as i64, slot.window.as_str()],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    // ==================== USAGE METHODS ====================

    fn load_counter(&self, credential_id: &str, model: &str) -> Result<Option<QuotaCounter>, DatabaseError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT used, quota_limit, window_start, window_kind, version
                 FROM usage WHERE credential_id = ?1 AND model = ?2",
                params![credential_id, model],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((used, limit, window_start, window_kind, version)) = row else {
            return Ok(None);
        };
        Ok(Some(QuotaCounter {
            used: used.max(0) as u64,
            limit: limit.max(0) as u64,
            window_start: parse_timestamp(&window_start)?,
            window_kind: WindowKind::parse(&window_kind)
                .ok_or_else(|| DatabaseError::Corrupt(format!("window kind '{window_kind}'")))?,
            version: version.max(0) as u64,
        }))
    }

    // ==================== OUTCOME METHODS ====================

    fn insert_outcome(&self, result: &DispatchResult) -> Result<(), DatabaseError> {
        let attempts = serde_json::to_string(&result.attempts)
            .map_err(|e| DatabaseError::Corrupt(format!("attempts: {e}")))?;
        let message_ids = serde_json::to_string(&result.message_ids)
            .map_err(|e| DatabaseError::Corrupt(format!("message ids: {e}")))?;

        let conn = self.conn();
        conn.execute(
            "INSERT INTO dispatch_outcomes
                (conversation_id, success, credential_id, model, latency_ms, error_kind,
                 fallback_reason, escalate, attempts, message_ids, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                result.conversation_id,
                result.success,
                result.used_credential,
                result.used_model,
                result.latency.as_millis() as i64,
                result.error_kind.map(|k| k.as_str()),
                result.fallback.map(|r| r.as_str()),
                result.escalate,
                attempts,
                message_ids,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Number of recorded outcomes.
    #[cfg(test)]
    pub fn outcome_count(&self) -> usize {
        self.get_counts().map(|(_, outcomes)| outcomes).unwrap_or(0)
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Corrupt(format!("timestamp '{s}': {e}")))
}

#[async_trait]
impl CredentialStore for Database {
    async fn list(&self) -> Result<Vec<Credential>, StoreError> {
        Ok(self.load_credentials()?)
    }

    async fn upsert(&self, credential: &Credential) -> Result<(), StoreError> {
        Ok(self.store_credential(credential)?)
    }

    async fn set_state(&self, id: &str, state: CredentialState) -> Result<(), StoreError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE credentials SET state = ?1 WHERE id = ?2",
                params![state.as_str(), id],
            )
            .map_err(DatabaseError::from)?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn set_model_throttle(
        &self,
        id: &str,
        model: &str,
        until: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE credential_models SET throttled_until = ?1 WHERE credential_id = ?2 AND model = ?3",
                params![until.map(|t| t.to_rfc3339()), id, model],
            )
            .map_err(DatabaseError::from)?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("{id}/{model}")));
        }
        Ok(())
    }
}

#[async_trait]
impl UsageStore for Database {
    async fn load(&self, credential_id: &str, model: &str) -> Result<Option<QuotaCounter>, LedgerError> {
        Ok(self.load_counter(credential_id, model)?)
    }

    async fn register(
        &self,
        credential_id: &str,
        model: &str,
        limit: u64,
        window_kind: WindowKind,
        window_start: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        // Bumping the version makes any commit computed against the old limit conflict.
        self.conn()
            .execute(
                "INSERT INTO usage (credential_id, model, used, quota_limit, window_kind, window_start, version)
                 VALUES (?1, ?2, 0, ?3, ?4, ?5, 0)
                 ON CONFLICT(credential_id, model) DO UPDATE SET
                    quota_limit = excluded.quota_limit,
                    window_kind = excluded.window_kind,
                    version = version + 1
                 WHERE quota_limit != excluded.quota_limit OR window_kind != excluded.window_kind",
                params![
                    credential_id,
                    model,
                    limit as i64,
                    window_kind.as_str(),
                    window_start.to_rfc3339()
                ],
            )
            .map_err(DatabaseError::from)?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        credential_id: &str,
        model: &str,
        expected: &QuotaCounter,
        next: &QuotaCounter,
    ) -> Result<(), LedgerError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE usage SET used = ?1, window_start = ?2, version = ?3
                 WHERE credential_id = ?4 AND model = ?5 AND version = ?6",
                params![
                    next.used as i64,
                    next.window_start.to_rfc3339(),
                    next.version as i64,
                    credential_id,
                    model,
                    expected.version as i64
                ],
            )
            .map_err(DatabaseError::from)?;
        if changed == 0 {
            return Err(LedgerError::Conflict {
                credential_id: credential_id.to_string(),
                model: model.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl OutcomeRecorder for Database {
    async fn on_dispatch_completed(&self, result: &DispatchResult) {
        if let Err(e) = self.insert_outcome(result) {
            warn!(conversation = result.conversation_id, "Failed to record dispatch outcome: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatbot::message::{DispatchRequest, FallbackReason, InboundMessage};
    use std::time::Duration;

    fn credential(id: &str, models: &[(&str, u64)]) -> Credential {
        Credential {
            id: id.to_string(),
            family: ProviderFamily::Gemini,
            api_key: format!("key-{id}"),
            state: CredentialState::Enabled,
            priority: 3,
            models: models
                .iter()
                .map(|(m, limit)| (m.to_string(), ModelSlot::new(*limit, WindowKind::Monthly)))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_list_credentials() {
        let db = Database::new().unwrap();
        db.upsert(&credential("c1", &[("flash", 100), ("pro", 5)])).await.unwrap();

        let listed = db.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        let c = &listed[0];
        assert_eq!(c.family, ProviderFamily::Gemini);
        assert_eq!(c.api_key, "key-c1");
        assert_eq!(c.priority, 3);
        assert_eq!(c.models["flash"].limit, 100);
        assert_eq!(c.models["pro"].window, WindowKind::Monthly);
    }

    #[tokio::test]
    async fn test_upsert_preserves_admin_state_and_drops_removed_models() {
        let db = Database::new().unwrap();
        db.upsert(&credential("c1", &[("flash", 100), ("pro", 5)])).await.unwrap();
        db.set_state("c1", CredentialState::Disabled).await.unwrap();

        db.upsert(&credential("c1", &[("flash", 200)])).await.unwrap();

        let c = db.list().await.unwrap().remove(0);
        assert_eq!(c.state, CredentialState::Disabled);
        assert_eq!(c.models.len(), 1);
        assert_eq!(c.models["flash"].limit, 200);
    }

    #[tokio::test]
    async fn test_model_throttle_round_trip() {
        let db = Database::new().unwrap();
        db.upsert(&credential("c1", &[("flash", 100)])).await.unwrap();

        let until = DateTime::parse_from_rfc3339("2026-05-01T00:00:00Z").unwrap().with_timezone(&Utc);
        db.set_model_throttle("c1", "flash", Some(until)).await.unwrap();
        assert_eq!(db.list().await.unwrap()[0].models["flash"].throttled_until, Some(until));

        db.set_model_throttle("c1", "flash", None).await.unwrap();
        assert_eq!(db.list().await.unwrap()[0].models["flash"].throttled_until, None);
    }

    #[tokio::test]
    async fn test_unknown_credential_is_not_found() {
        let db = Database::new().unwrap();
        let err = db.set_state("ghost", CredentialState::Enabled).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_records_outcome() {
        let db = Database::new().unwrap();
        let request = DispatchRequest::from_snapshot(
            42,
            &[InboundMessage {
                id: 1,
                text: "hi".to_string(),
                received_at: Utc::now(),
            }],
        );
        let result = DispatchResult::fallback(request, FallbackReason::Overloaded, "busy", Duration::ZERO);
        db.on_dispatch_completed(&result).await;
        assert_eq!(db.outcome_count(), 1);
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relaydesk.db");
        {
            let db = Database::open(&path).unwrap();
            db.store_credential(&credential("c1", &[("flash", 1)])).unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.load_credentials().unwrap().len(), 1);
    }
}
