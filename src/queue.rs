//! SQLite-backed durable job queue.
//!
//! Jobs are rows in the `jobs` table. The row id is the dedup key
//! `{kind}-{documentId}`: enqueueing a job whose key already exists in a
//! live state merges into that row instead of creating a duplicate, so a
//! document never has two index jobs in flight. A key whose previous job
//! reached a terminal state is reset and reused.
//!
//! Claiming is lease-based: a claimed job becomes `active` with a
//! `locked_until` deadline. A worker that dies mid-job leaves the lease to
//! expire, after which the job is claimable again. Failed retryable jobs
//! move to `delayed` with an exponential-backoff `run_at`; the claim query
//! treats a due delayed job like a waiting one.

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::chunk::ChunkOverride;
use crate::config::QueueConfig;
use crate::error::{Error, Result};

/// Job categories. Delete jobs outrank index/reindex jobs so teardown is
/// never starved behind a backlog of ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Index,
    Delete,
    Reindex,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Index => "index",
            JobKind::Delete => "delete",
            JobKind::Reindex => "reindex",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "index" => Some(JobKind::Index),
            "delete" => Some(JobKind::Delete),
            "reindex" => Some(JobKind::Reindex),
            _ => None,
        }
    }

    fn priority(&self) -> i64 {
        match self {
            JobKind::Delete => 10,
            JobKind::Index | JobKind::Reindex => 0,
        }
    }
}

/// Job arguments, serialized into `payload_json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobPayload {
    Index {
        document_id: String,
        #[serde(default)]
        profile_id: Option<String>,
        #[serde(default)]
        chunk_options: Option<ChunkOverride>,
    },
    Delete {
        document_id: String,
    },
    Reindex {
        document_id: String,
        #[serde(default)]
        profile_id: Option<String>,
        #[serde(default)]
        chunk_options: Option<ChunkOverride>,
    },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Index { .. } => JobKind::Index,
            JobPayload::Delete { .. } => JobKind::Delete,
            JobPayload::Reindex { .. } => JobKind::Reindex,
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            JobPayload::Index { document_id, .. }
            | JobPayload::Delete { document_id }
            | JobPayload::Reindex { document_id, .. } => document_id,
        }
    }

    /// Dedup key doubling as the job row id.
    pub fn dedup_key(&self) -> String {
        format!("{}-{}", self.kind().as_str(), self.document_id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "delayed" => Some(JobState::Delayed),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// A job row as read back from the store.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub kind: String,
    pub payload: JobPayload,
    pub state: JobState,
    pub progress: f64,
    pub attempts_made: i64,
    pub max_attempts: i64,
    pub error: Option<String>,
    pub result_json: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub finished_at: Option<i64>,
}

/// Queue handle. Cheap to clone; wraps the shared pool.
#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    config: QueueConfig,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl JobQueue {
    pub fn new(pool: SqlitePool, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Retry delay before attempt number `attempts_made + 1`, in ms.
    /// Doubles per prior attempt, capped.
    pub fn backoff_ms(&self, attempts_made: i64) -> i64 {
        let exp = (attempts_made.max(1) - 1).min(20) as u32;
        let delay = self.config.backoff_base_ms.saturating_mul(1u64 << exp);
        delay.min(self.config.backoff_cap_ms) as i64
    }

    /// Enqueue a job, merging into an existing live job with the same
    /// dedup key. Returns the job id.
    ///
    /// Merge semantics: a live (non-terminal) row keeps its state and
    /// attempt count and only takes the new payload; a terminal row is
    /// reset to a fresh waiting job.
    pub async fn enqueue(&self, payload: &JobPayload) -> Result<String> {
        let id = payload.dedup_key();
        let kind = payload.kind();
        let payload_json = serde_json::to_string(payload)?;
        let now = now_ms();

        let mut tx = self.pool.begin().await?;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT state FROM jobs WHERE id = ?")
                .bind(&id)
                .fetch_optional(&mut *tx)
                .await?;

        match existing.and_then(|(s,)| JobState::parse(&s)) {
            Some(state) if !state.is_terminal() => {
                sqlx::query("UPDATE jobs SET payload_json = ?, updated_at = ? WHERE id = ?")
                    .bind(&payload_json)
                    .bind(now)
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
            }
            _ => {
                sqlx::query(
                    r#"
                    INSERT INTO jobs
                        (id, kind, payload_json, state, progress, attempts_made,
                         max_attempts, priority, run_at, locked_until, error,
                         result_json, created_at, updated_at, finished_at)
                    VALUES (?, ?, ?, 'waiting', 0, 0, ?, ?, ?, NULL, NULL, NULL, ?, ?, NULL)
                    ON CONFLICT(id) DO UPDATE SET
                        kind = excluded.kind,
                        payload_json = excluded.payload_json,
                        state = 'waiting',
                        progress = 0,
                        attempts_made = 0,
                        max_attempts = excluded.max_attempts,
                        priority = excluded.priority,
                        run_at = excluded.run_at,
                        locked_until = NULL,
                        error = NULL,
                        result_json = NULL,
                        updated_at = excluded.updated_at,
                        finished_at = NULL
                    "#,
                )
                .bind(&id)
                .bind(kind.as_str())
                .bind(&payload_json)
                .bind(self.config.max_attempts as i64)
                .bind(kind.priority())
                .bind(now)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(id)
    }

    /// Claim the next runnable job, if any: waiting or delayed with
    /// `run_at` due, or active with an expired lease. Highest priority
    /// first, then oldest. The claimed job becomes active with a fresh
    /// lease and its attempt counter incremented.
    pub async fn claim(&self) -> Result<Option<Job>> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT id FROM jobs
            WHERE (state IN ('waiting', 'delayed') AND run_at <= ?)
               OR (state = 'active' AND locked_until IS NOT NULL AND locked_until <= ?)
            ORDER BY priority DESC, created_at ASC
            LIMIT 1
            "#,
        )
        .bind(now)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let id: String = row.get("id");

        sqlx::query(
            r#"
            UPDATE jobs SET
                state = 'active',
                locked_until = ?,
                attempts_made = attempts_made + 1,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now + self.config.lock_secs * 1000)
        .bind(now)
        .bind(&id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.get(&id).await
    }

    /// Record handler progress (0..=100).
    pub async fn set_progress(&self, id: &str, progress: f64) -> Result<()> {
        sqlx::query("UPDATE jobs SET progress = ?, updated_at = ? WHERE id = ?")
            .bind(progress.clamp(0.0, 100.0))
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark a job completed.
    pub async fn complete(&self, id: &str, result: Option<serde_json::Value>) -> Result<()> {
        let now = now_ms();
        let result_json = result.map(|v| v.to_string());
        sqlx::query(
            r#"
            UPDATE jobs SET
                state = 'completed', progress = 100, locked_until = NULL,
                error = NULL, result_json = ?, updated_at = ?, finished_at = ?
            WHERE id = ?
            "#,
        )
        .bind(result_json)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a job failure. Retryable errors with attempts remaining move
    /// the job to `delayed` with a backoff `run_at`; everything else is a
    /// terminal failure. Returns the resulting state.
    pub async fn fail(&self, id: &str, err: &Error) -> Result<JobState> {
        let now = now_ms();
        let job = self
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("job {}", id)))?;

        let retry = err.is_retryable() && job.attempts_made < job.max_attempts;
        if retry {
            let run_at = now + self.backoff_ms(job.attempts_made);
            sqlx::query(
                r#"
                UPDATE jobs SET
                    state = 'delayed', run_at = ?, locked_until = NULL,
                    error = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(run_at)
            .bind(err.to_string())
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(JobState::Delayed)
        } else {
            sqlx::query(
                r#"
                UPDATE jobs SET
                    state = 'failed', locked_until = NULL,
                    error = ?, updated_at = ?, finished_at = ?
                WHERE id = ?
                "#,
            )
            .bind(err.to_string())
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(JobState::Failed)
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            SELECT id, kind, payload_json, state, progress, attempts_made,
                   max_attempts, error, result_json, created_at, updated_at,
                   finished_at
            FROM jobs WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload_json: String = row.get("payload_json");
        let state_str: String = row.get("state");
        Ok(Some(Job {
            id: row.get("id"),
            kind: row.get("kind"),
            payload: serde_json::from_str(&payload_json)?,
            state: JobState::parse(&state_str)
                .ok_or_else(|| Error::fatal(format!("unknown job state: {}", state_str)))?,
            progress: row.get("progress"),
            attempts_made: row.get("attempts_made"),
            max_attempts: row.get("max_attempts"),
            error: row.get("error"),
            result_json: row.get("result_json"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            finished_at: row.get("finished_at"),
        }))
    }

    /// Number of non-terminal jobs. Used by drain loops in tests and the
    /// one-shot CLI paths.
    pub async fn pending_count(&self) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM jobs WHERE state IN ('waiting', 'active', 'delayed')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }
}
