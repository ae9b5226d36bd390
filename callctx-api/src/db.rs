//! Database Connection Pool Module
//!
//! PostgreSQL backend for every storage trait, using deadpool-postgres for
//! pooling. Conditional updates carry their precondition in the `WHERE`
//! clause, so a `0 rows` result is the compare-and-set "lost" answer.

use crate::constants::{DEFAULT_DB_POOL_SIZE, DEFAULT_DB_TIMEOUT_SECS};
use crate::error::{ApiError, ApiResult};
use async_trait::async_trait;
use callctx_core::*;
use callctx_storage::{CallSessionStore, PatientDirectory, PatientRecordStore, TranscriptStore};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime, Timeouts};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};

const SCHEMA_SQL: &str = include_str!("../migrations/V1__call_sessions.sql");

const SESSION_COLUMNS: &str = "call_id, carrier_call_id, patient_id, external_conversation_id, \
    context_handle, agent_id, phone_digits, state, context_release, unidentified, degraded, \
    failure_reason, started_at, ended_at, updated_at";

const PATIENT_COLUMNS: &str =
    "patient_id, display_name, phone, preferred_language, medications, lab_results";

const TRANSCRIPT_COLUMNS: &str =
    "transcript_id, call_id, conversation_id, text, ended_at, received_at";

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Wait limit when acquiring a connection
    pub timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "callctx".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            max_size: DEFAULT_DB_POOL_SIZE,
            timeout: Duration::from_secs(DEFAULT_DB_TIMEOUT_SECS),
        }
    }
}

impl DbConfig {
    /// Create a new database configuration from `CALLCTX_DB_*` variables.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("CALLCTX_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("CALLCTX_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5432),
            dbname: std::env::var("CALLCTX_DB_NAME").unwrap_or_else(|_| "callctx".to_string()),
            user: std::env::var("CALLCTX_DB_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("CALLCTX_DB_PASSWORD").unwrap_or_default(),
            max_size: std::env::var("CALLCTX_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_DB_POOL_SIZE),
            timeout: Duration::from_secs(
                std::env::var("CALLCTX_DB_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_DB_TIMEOUT_SECS),
            ),
        }
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> ApiResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig {
            max_size: self.max_size,
            timeouts: Timeouts {
                wait: Some(self.timeout),
                ..Timeouts::default()
            },
            ..PoolConfig::default()
        });

        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| ApiError::database_error(format!("Failed to create pool: {}", e)))
    }
}

// ============================================================================
// DATABASE CLIENT
// ============================================================================

/// Pooled Postgres client implementing the callctx storage traits.
#[derive(Clone)]
pub struct DbClient {
    pool: Pool,
}

fn db_err(err: tokio_postgres::Error) -> CallctxError {
    tracing::error!("Database error: {:?}", err);
    CallctxError::Storage(StorageError::Unavailable {
        reason: "database operation failed".to_string(),
    })
}

fn is_unique_violation(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

fn not_found(entity_type: EntityType, id: impl ToString) -> CallctxError {
    CallctxError::Storage(StorageError::NotFound {
        entity_type,
        id: id.to_string(),
    })
}

fn corrupt(entity_type: EntityType, id: impl ToString, reason: impl ToString) -> CallctxError {
    CallctxError::Storage(StorageError::UpdateFailed {
        entity_type,
        id: id.to_string(),
        reason: reason.to_string(),
    })
}

fn session_from_row(row: &Row) -> CallctxResult<CallSession> {
    let call_id: CallId = row.try_get("call_id").map_err(db_err)?;
    let state: String = row.try_get("state").map_err(db_err)?;
    let release: String = row.try_get("context_release").map_err(db_err)?;
    Ok(CallSession {
        call_id,
        carrier_call_id: row.try_get("carrier_call_id").map_err(db_err)?,
        patient_id: row.try_get("patient_id").map_err(db_err)?,
        external_conversation_id: row.try_get("external_conversation_id").map_err(db_err)?,
        context_handle: row.try_get("context_handle").map_err(db_err)?,
        agent_id: row.try_get("agent_id").map_err(db_err)?,
        phone_digits: row.try_get("phone_digits").map_err(db_err)?,
        state: CallState::from_db_str(&state)
            .map_err(|e| corrupt(EntityType::CallSession, call_id, e))?,
        release: ContextRelease::from_db_str(&release)
            .map_err(|e| corrupt(EntityType::CallSession, call_id, e))?,
        unidentified: row.try_get("unidentified").map_err(db_err)?,
        degraded: row.try_get("degraded").map_err(db_err)?,
        failure_reason: row.try_get("failure_reason").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        ended_at: row.try_get("ended_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn patient_from_row(row: &Row) -> CallctxResult<PatientProfile> {
    let patient_id: PatientId = row.try_get("patient_id").map_err(db_err)?;
    let medications: JsonValue = row.try_get("medications").map_err(db_err)?;
    let lab_results: JsonValue = row.try_get("lab_results").map_err(db_err)?;
    Ok(PatientProfile {
        patient_id,
        display_name: row.try_get("display_name").map_err(db_err)?,
        phone: row.try_get("phone").map_err(db_err)?,
        preferred_language: row.try_get("preferred_language").map_err(db_err)?,
        medications: serde_json::from_value(medications)
            .map_err(|e| corrupt(EntityType::Patient, patient_id, e))?,
        lab_results: serde_json::from_value(lab_results)
            .map_err(|e| corrupt(EntityType::Patient, patient_id, e))?,
    })
}

fn transcript_from_row(row: &Row) -> CallctxResult<TranscriptRecord> {
    Ok(TranscriptRecord {
        transcript_id: row.try_get("transcript_id").map_err(db_err)?,
        call_id: row.try_get("call_id").map_err(db_err)?,
        conversation_id: row.try_get("conversation_id").map_err(db_err)?,
        text: row.try_get("text").map_err(db_err)?,
        ended_at: row.try_get("ended_at").map_err(db_err)?,
        received_at: row.try_get("received_at").map_err(db_err)?,
    })
}

impl DbClient {
    /// Create a new database client with the given pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create a new database client from configuration.
    pub fn from_config(config: &DbConfig) -> ApiResult<Self> {
        let pool = config.create_pool()?;
        Ok(Self::new(pool))
    }

    /// Get the current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    async fn get_conn(&self) -> CallctxResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(|e| {
            tracing::error!("Connection pool error: {:?}", e);
            CallctxError::Storage(StorageError::Unavailable {
                reason: "failed to acquire database connection".to_string(),
            })
        })
    }

    /// Apply the bundled schema. Safe to run on every startup.
    pub async fn migrate(&self) -> ApiResult<()> {
        let conn = self.pool.get().await?;
        conn.batch_execute(SCHEMA_SQL).await?;
        tracing::info!("Database schema applied");
        Ok(())
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> ApiResult<()> {
        let conn = self.pool.get().await?;
        conn.query_one("SELECT 1", &[]).await?;
        Ok(())
    }

    /// Insert or replace a directory entry, e.g. from a sync job.
    pub async fn upsert_patient(&self, profile: &PatientProfile) -> CallctxResult<()> {
        let conn = self.get_conn().await?;
        let digits = normalize_digits(&profile.phone).unwrap_or_else(|| profile.phone.clone());
        let medications = serde_json::to_value(&profile.medications)
            .map_err(|e| corrupt(EntityType::Patient, profile.patient_id, e))?;
        let lab_results = serde_json::to_value(&profile.lab_results)
            .map_err(|e| corrupt(EntityType::Patient, profile.patient_id, e))?;
        conn.execute(
            "INSERT INTO patients (patient_id, display_name, phone, phone_digits, preferred_language, medications, lab_results)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (patient_id) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                phone = EXCLUDED.phone,
                phone_digits = EXCLUDED.phone_digits,
                preferred_language = EXCLUDED.preferred_language,
                medications = EXCLUDED.medications,
                lab_results = EXCLUDED.lab_results",
            &[
                &profile.patient_id,
                &profile.display_name,
                &profile.phone,
                &digits,
                &profile.preferred_language,
                &medications,
                &lab_results,
            ],
        )
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn query_sessions(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> CallctxResult<Vec<CallSession>> {
        let conn = self.get_conn().await?;
        let rows = conn.query(sql, params).await.map_err(db_err)?;
        rows.iter().map(session_from_row).collect()
    }

    async fn query_session(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> CallctxResult<Option<CallSession>> {
        let conn = self.get_conn().await?;
        let row = conn.query_opt(sql, params).await.map_err(db_err)?;
        row.as_ref().map(session_from_row).transpose()
    }

    /// Run an unconditional session update; a missing row is `NotFound`.
    async fn update_session(
        &self,
        call_id: CallId,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> CallctxResult<()> {
        let conn = self.get_conn().await?;
        let updated = conn.execute(sql, params).await.map_err(db_err)?;
        if updated == 0 {
            return Err(not_found(EntityType::CallSession, call_id));
        }
        Ok(())
    }

    /// Interpret a conditional update: `0 rows` is a lost race unless the
    /// session does not exist at all.
    async fn conditional_outcome(&self, call_id: CallId, updated: u64) -> CallctxResult<bool> {
        if updated > 0 {
            return Ok(true);
        }
        match self.get_session(call_id).await? {
            Some(_) => Ok(false),
            None => Err(not_found(EntityType::CallSession, call_id)),
        }
    }
}

// ============================================================================
// CALL SESSIONS
// ============================================================================

#[async_trait]
impl CallSessionStore for DbClient {
    async fn insert_session(&self, session: &CallSession) -> CallctxResult<()> {
        let conn = self.get_conn().await?;
        let sql = format!(
            "INSERT INTO call_sessions ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
            SESSION_COLUMNS
        );
        conn.execute(
            sql.as_str(),
            &[
                &session.call_id,
                &session.carrier_call_id,
                &session.patient_id,
                &session.external_conversation_id,
                &session.context_handle,
                &session.agent_id,
                &session.phone_digits,
                &session.state.as_db_str(),
                &session.release.as_db_str(),
                &session.unidentified,
                &session.degraded,
                &session.failure_reason,
                &session.started_at,
                &session.ended_at,
                &session.updated_at,
            ],
        )
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                CallctxError::Storage(StorageError::InsertFailed {
                    entity_type: EntityType::CallSession,
                    reason: format!("duplicate call id {}", session.call_id),
                })
            } else {
                db_err(e)
            }
        })?;
        Ok(())
    }

    async fn get_session(&self, call_id: CallId) -> CallctxResult<Option<CallSession>> {
        let sql = format!("SELECT {} FROM call_sessions WHERE call_id = $1", SESSION_COLUMNS);
        self.query_session(&sql, &[&call_id]).await
    }

    async fn find_by_carrier_call_id(
        &self,
        carrier_call_id: &str,
    ) -> CallctxResult<Option<CallSession>> {
        let sql = format!(
            "SELECT {} FROM call_sessions WHERE carrier_call_id = $1 ORDER BY started_at DESC LIMIT 1",
            SESSION_COLUMNS
        );
        self.query_session(&sql, &[&carrier_call_id]).await
    }

    async fn find_by_conversation_id(
        &self,
        conversation_id: &str,
    ) -> CallctxResult<Option<CallSession>> {
        let sql = format!(
            "SELECT {} FROM call_sessions WHERE external_conversation_id = $1",
            SESSION_COLUMNS
        );
        self.query_session(&sql, &[&conversation_id]).await
    }

    async fn list_correlation_candidates(
        &self,
        agent_id: Option<&str>,
        limit: usize,
    ) -> CallctxResult<Vec<CallSession>> {
        let sql = format!(
            "SELECT {} FROM call_sessions
             WHERE state IN ('in_progress', 'context_attached')
               AND external_conversation_id IS NULL
               AND ($1::text IS NULL OR agent_id = $1)
             ORDER BY started_at DESC, call_id DESC
             LIMIT $2",
            SESSION_COLUMNS
        );
        let limit = limit as i64;
        self.query_sessions(&sql, &[&agent_id, &limit]).await
    }

    async fn list_stale_open(
        &self,
        cutoff: Timestamp,
        limit: usize,
    ) -> CallctxResult<Vec<CallSession>> {
        let sql = format!(
            "SELECT {} FROM call_sessions
             WHERE state NOT IN ('completed', 'failed') AND started_at < $1
             ORDER BY started_at
             LIMIT $2",
            SESSION_COLUMNS
        );
        let limit = limit as i64;
        self.query_sessions(&sql, &[&cutoff, &limit]).await
    }

    async fn list_release_pending(&self, limit: usize) -> CallctxResult<Vec<CallSession>> {
        let sql = format!(
            "SELECT {} FROM call_sessions
             WHERE state IN ('completed', 'failed')
               AND context_release IN ('held', 'release_failed')
             ORDER BY started_at
             LIMIT $1",
            SESSION_COLUMNS
        );
        let limit = limit as i64;
        self.query_sessions(&sql, &[&limit]).await
    }

    async fn transition_state(
        &self,
        call_id: CallId,
        from: CallState,
        to: CallState,
        failure_reason: Option<&str>,
    ) -> CallctxResult<bool> {
        if !from.can_transition_to(to) {
            return Err(ValidationError::InvalidTransition { from, to }.into());
        }
        let conn = self.get_conn().await?;
        let updated = conn
            .execute(
                "UPDATE call_sessions SET
                    state = $3,
                    failure_reason = COALESCE($4, failure_reason),
                    ended_at = CASE WHEN $5 THEN COALESCE(ended_at, now()) ELSE ended_at END,
                    updated_at = now()
                 WHERE call_id = $1 AND state = $2",
                &[
                    &call_id,
                    &from.as_db_str(),
                    &to.as_db_str(),
                    &failure_reason,
                    &to.is_terminal(),
                ],
            )
            .await
            .map_err(db_err)?;
        drop(conn);
        self.conditional_outcome(call_id, updated).await
    }

    async fn claim_conversation_id(
        &self,
        call_id: CallId,
        conversation_id: &str,
    ) -> CallctxResult<bool> {
        let conn = self.get_conn().await?;
        let result = conn
            .execute(
                "UPDATE call_sessions SET external_conversation_id = $2, updated_at = now()
                 WHERE call_id = $1 AND external_conversation_id IS NULL",
                &[&call_id, &conversation_id],
            )
            .await;
        drop(conn);
        match result {
            Ok(updated) => self.conditional_outcome(call_id, updated).await,
            // Another session already holds this conversation id
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn claim_release(&self, call_id: CallId) -> CallctxResult<bool> {
        let conn = self.get_conn().await?;
        let updated = conn
            .execute(
                "UPDATE call_sessions SET context_release = 'claimed', updated_at = now()
                 WHERE call_id = $1 AND context_release IN ('held', 'release_failed')",
                &[&call_id],
            )
            .await
            .map_err(db_err)?;
        drop(conn);
        self.conditional_outcome(call_id, updated).await
    }

    async fn record_context(&self, call_id: CallId, handle: &SnippetHandle) -> CallctxResult<()> {
        self.update_session(
            call_id,
            "UPDATE call_sessions SET context_handle = $2, context_release = 'held', updated_at = now()
             WHERE call_id = $1",
            &[&call_id, handle],
        )
        .await
    }

    async fn mark_degraded(&self, call_id: CallId) -> CallctxResult<()> {
        self.update_session(
            call_id,
            "UPDATE call_sessions SET degraded = TRUE, updated_at = now() WHERE call_id = $1",
            &[&call_id],
        )
        .await
    }

    async fn mark_ended(&self, call_id: CallId, ended_at: Timestamp) -> CallctxResult<()> {
        self.update_session(
            call_id,
            "UPDATE call_sessions SET ended_at = COALESCE(ended_at, $2), updated_at = now()
             WHERE call_id = $1",
            &[&call_id, &ended_at],
        )
        .await
    }

    async fn finish_release(&self, call_id: CallId, outcome: ContextRelease) -> CallctxResult<()> {
        self.update_session(
            call_id,
            "UPDATE call_sessions SET context_release = $2, updated_at = now() WHERE call_id = $1",
            &[&call_id, &outcome.as_db_str()],
        )
        .await
    }
}

// ============================================================================
// PATIENT DIRECTORY
// ============================================================================

#[async_trait]
impl PatientDirectory for DbClient {
    async fn find_by_phone(&self, variants: &[String]) -> CallctxResult<Option<PatientProfile>> {
        if variants.is_empty() {
            return Ok(None);
        }
        let conn = self.get_conn().await?;
        let sql = format!(
            "SELECT {} FROM patients
             WHERE phone = ANY($1) OR phone_digits = ANY($1)
             ORDER BY patient_id
             LIMIT 1",
            PATIENT_COLUMNS
        );
        let row = conn.query_opt(sql.as_str(), &[&variants]).await.map_err(db_err)?;
        row.as_ref().map(patient_from_row).transpose()
    }

    async fn get_patient(&self, patient_id: PatientId) -> CallctxResult<Option<PatientProfile>> {
        let conn = self.get_conn().await?;
        let sql = format!("SELECT {} FROM patients WHERE patient_id = $1", PATIENT_COLUMNS);
        let row = conn.query_opt(sql.as_str(), &[&patient_id]).await.map_err(db_err)?;
        row.as_ref().map(patient_from_row).transpose()
    }
}

// ============================================================================
// PATIENT RECORDS
// ============================================================================

#[async_trait]
impl PatientRecordStore for DbClient {
    async fn get_record(&self, patient_id: PatientId) -> CallctxResult<Option<PatientRecord>> {
        let conn = self.get_conn().await?;
        let Some(row) = conn
            .query_opt(
                "SELECT focus_areas, updated_at FROM patient_records WHERE patient_id = $1",
                &[&patient_id],
            )
            .await
            .map_err(db_err)?
        else {
            return Ok(None);
        };

        let blocks = conn
            .query(
                "SELECT at, source_call_id, fingerprint, body FROM patient_note_blocks
                 WHERE patient_id = $1 ORDER BY at, block_id",
                &[&patient_id],
            )
            .await
            .map_err(db_err)?;

        let clinical_notes = blocks
            .iter()
            .map(|b| {
                Ok(NoteBlock {
                    at: b.try_get("at").map_err(db_err)?,
                    source_call_id: b.try_get("source_call_id").map_err(db_err)?,
                    fingerprint: b.try_get("fingerprint").map_err(db_err)?,
                    body: b.try_get("body").map_err(db_err)?,
                })
            })
            .collect::<CallctxResult<Vec<_>>>()?;

        Ok(Some(PatientRecord {
            patient_id,
            clinical_notes,
            focus_areas: row.try_get("focus_areas").map_err(db_err)?,
            updated_at: row.try_get("updated_at").map_err(db_err)?,
        }))
    }

    async fn append_note_block(
        &self,
        patient_id: PatientId,
        block: &NoteBlock,
    ) -> CallctxResult<bool> {
        let mut conn = self.get_conn().await?;
        let tx = conn.transaction().await.map_err(db_err)?;

        tx.execute(
            "INSERT INTO patient_records (patient_id, updated_at) VALUES ($1, now())
             ON CONFLICT (patient_id) DO NOTHING",
            &[&patient_id],
        )
        .await
        .map_err(db_err)?;

        let inserted = tx
            .execute(
                "INSERT INTO patient_note_blocks (patient_id, at, source_call_id, fingerprint, body)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (patient_id, fingerprint) DO NOTHING",
                &[
                    &patient_id,
                    &block.at,
                    &block.source_call_id,
                    &block.fingerprint,
                    &block.body,
                ],
            )
            .await
            .map_err(db_err)?;

        if inserted > 0 {
            tx.execute(
                "UPDATE patient_records SET updated_at = now() WHERE patient_id = $1",
                &[&patient_id],
            )
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(inserted > 0)
    }

    async fn add_focus_areas(
        &self,
        patient_id: PatientId,
        tags: &[String],
    ) -> CallctxResult<Vec<String>> {
        let mut conn = self.get_conn().await?;
        let tx = conn.transaction().await.map_err(db_err)?;

        tx.execute(
            "INSERT INTO patient_records (patient_id, updated_at) VALUES ($1, now())
             ON CONFLICT (patient_id) DO NOTHING",
            &[&patient_id],
        )
        .await
        .map_err(db_err)?;

        let row = tx
            .query_one(
                "SELECT focus_areas FROM patient_records WHERE patient_id = $1 FOR UPDATE",
                &[&patient_id],
            )
            .await
            .map_err(db_err)?;
        let existing: Vec<String> = row.try_get("focus_areas").map_err(db_err)?;

        let added = new_focus_areas(&existing, tags);
        if !added.is_empty() {
            tx.execute(
                "UPDATE patient_records SET focus_areas = focus_areas || $2, updated_at = now()
                 WHERE patient_id = $1",
                &[&patient_id, &added],
            )
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(added)
    }
}

// ============================================================================
// TRANSCRIPTS
// ============================================================================

#[async_trait]
impl TranscriptStore for DbClient {
    async fn save_transcript(&self, transcript: &TranscriptRecord) -> CallctxResult<()> {
        let conn = self.get_conn().await?;
        let sql = format!(
            "INSERT INTO transcripts ({}) VALUES ($1, $2, $3, $4, $5, $6)",
            TRANSCRIPT_COLUMNS
        );
        conn.execute(
            sql.as_str(),
            &[
                &transcript.transcript_id,
                &transcript.call_id,
                &transcript.conversation_id,
                &transcript.text,
                &transcript.ended_at,
                &transcript.received_at,
            ],
        )
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                CallctxError::Storage(StorageError::InsertFailed {
                    entity_type: EntityType::Transcript,
                    reason: format!("duplicate transcript id {}", transcript.transcript_id),
                })
            } else {
                db_err(e)
            }
        })?;
        Ok(())
    }

    async fn attribute_transcript(
        &self,
        transcript_id: TranscriptId,
        call_id: CallId,
    ) -> CallctxResult<()> {
        let conn = self.get_conn().await?;
        let updated = conn
            .execute(
                "UPDATE transcripts SET call_id = $2 WHERE transcript_id = $1",
                &[&transcript_id, &call_id],
            )
            .await
            .map_err(db_err)?;
        if updated == 0 {
            return Err(not_found(EntityType::Transcript, transcript_id));
        }
        Ok(())
    }

    async fn get_transcript(
        &self,
        transcript_id: TranscriptId,
    ) -> CallctxResult<Option<TranscriptRecord>> {
        let conn = self.get_conn().await?;
        let sql = format!(
            "SELECT {} FROM transcripts WHERE transcript_id = $1",
            TRANSCRIPT_COLUMNS
        );
        let row = conn.query_opt(sql.as_str(), &[&transcript_id]).await.map_err(db_err)?;
        row.as_ref().map(transcript_from_row).transpose()
    }

    async fn list_transcripts_for_call(
        &self,
        call_id: CallId,
    ) -> CallctxResult<Vec<TranscriptRecord>> {
        let conn = self.get_conn().await?;
        let sql = format!(
            "SELECT {} FROM transcripts WHERE call_id = $1 ORDER BY received_at",
            TRANSCRIPT_COLUMNS
        );
        let rows = conn.query(sql.as_str(), &[&call_id]).await.map_err(db_err)?;
        rows.iter().map(transcript_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.dbname, "callctx");
        assert_eq!(config.max_size, DEFAULT_DB_POOL_SIZE);
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_DB_TIMEOUT_SECS));
    }

    #[test]
    fn test_schema_declares_every_table() {
        for table in [
            "call_sessions",
            "patients",
            "patient_records",
            "patient_note_blocks",
            "transcripts",
        ] {
            assert!(
                SCHEMA_SQL.contains(&format!("CREATE TABLE IF NOT EXISTS {}", table)),
                "missing table {}",
                table
            );
        }
    }

    #[test]
    fn test_session_columns_match_insert_arity() {
        assert_eq!(SESSION_COLUMNS.split(',').count(), 15);
        assert_eq!(TRANSCRIPT_COLUMNS.split(',').count(), 6);
    }

    #[tokio::test]
    async fn test_pool_creation_is_lazy() {
        // deadpool connects on first checkout, so building a pool needs no server
        let client = DbClient::from_config(&DbConfig::default()).unwrap();
        assert_eq!(client.pool_size(), 0);
    }
}
