//! Session checkpointing and resume
//!
//! Batch progress lives in the same SQLite database as the knowledge
//! ledger: one `sessions` row per run plus one `task_records` row per file
//! that reached a terminal state. Resuming a run loads the terminal paths
//! and skips them, so a crash mid-batch costs at most the in-flight tasks.

use chrono::Utc;
use recode_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

/// Lifecycle of a batch session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Completed,
    Aborted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Aborted => "aborted",
        }
    }
}

/// One batch run
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub target_dir: String,
    pub output_dir: String,
    pub quality_goal: String,
    pub status: SessionStatus,
    pub total_files: i64,
    pub processed: i64,
    pub completed: i64,
    pub failed: i64,
    pub skipped: i64,
    pub total_bytes_before: i64,
    pub total_bytes_after: i64,
}

/// Terminal result of one task, as persisted for resume
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub file_path: String,
    pub status: String,
    pub error_message: String,
    pub output_path: String,
    pub original_size: i64,
    pub new_size: i64,
    pub retry_count: i64,
}

/// Persistence for sessions and their per-file task records
#[derive(Clone)]
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Start a new session for a target directory
    pub async fn create_session(
        &self,
        target_dir: &Path,
        output_dir: &Path,
        quality_goal: &str,
        total_files: usize,
    ) -> Result<Session> {
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            target_dir: target_dir.to_string_lossy().into_owned(),
            output_dir: output_dir.to_string_lossy().into_owned(),
            quality_goal: quality_goal.to_string(),
            status: SessionStatus::Running,
            total_files: total_files as i64,
            processed: 0,
            completed: 0,
            failed: 0,
            skipped: 0,
            total_bytes_before: 0,
            total_bytes_after: 0,
        };

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO sessions
                (session_id, target_dir, output_dir, quality_goal,
                 started_at, last_update, status, total_files)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.target_dir)
        .bind(&session.output_dir)
        .bind(&session.quality_goal)
        .bind(&now)
        .bind(&now)
        .bind(session.status.as_str())
        .bind(session.total_files)
        .execute(&self.pool)
        .await
        .map_err(Error::from)?;

        info!(session_id = %session.session_id, total_files, "session created");
        Ok(session)
    }

    /// Most recent unfinished session for the same target directory
    pub async fn find_resumable(&self, target_dir: &Path) -> Result<Option<Session>> {
        let row = sqlx::query(
            r#"
            SELECT session_id, target_dir, output_dir, quality_goal, status,
                   total_files, processed, completed, failed, skipped,
                   total_bytes_before, total_bytes_after
            FROM sessions
            WHERE target_dir = ? AND status = 'running'
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(target_dir.to_string_lossy().into_owned())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)?;

        Ok(row.map(|row| Session {
            session_id: row.get("session_id"),
            target_dir: row.get("target_dir"),
            output_dir: row.get("output_dir"),
            quality_goal: row.get("quality_goal"),
            status: SessionStatus::Running,
            total_files: row.get("total_files"),
            processed: row.get("processed"),
            completed: row.get("completed"),
            failed: row.get("failed"),
            skipped: row.get("skipped"),
            total_bytes_before: row.get("total_bytes_before"),
            total_bytes_after: row.get("total_bytes_after"),
        }))
    }

    /// Paths that already reached a terminal state in this session
    pub async fn terminal_paths(&self, session_id: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query(
            "SELECT file_path FROM task_records WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::from)?;

        Ok(rows.into_iter().map(|r| r.get("file_path")).collect())
    }

    /// Persist one finished task (idempotent per (session, path))
    pub async fn record_task(&self, session_id: &str, task: &TaskRecord) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO task_records
                (session_id, file_path, status, finished_at, error_message,
                 output_path, original_size, new_size, retry_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id, file_path) DO UPDATE SET
                status = excluded.status,
                finished_at = excluded.finished_at,
                error_message = excluded.error_message,
                output_path = excluded.output_path,
                original_size = excluded.original_size,
                new_size = excluded.new_size,
                retry_count = excluded.retry_count
            "#,
        )
        .bind(session_id)
        .bind(&task.file_path)
        .bind(&task.status)
        .bind(&now)
        .bind(&task.error_message)
        .bind(&task.output_path)
        .bind(task.original_size)
        .bind(task.new_size)
        .bind(task.retry_count)
        .execute(&self.pool)
        .await
        .map_err(Error::from)?;

        debug!(session_id, path = %task.file_path, status = %task.status, "task checkpointed");
        Ok(())
    }

    /// Flush the session counters
    pub async fn update_progress(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions SET
                last_update = ?,
                processed = ?, completed = ?, failed = ?, skipped = ?,
                total_bytes_before = ?, total_bytes_after = ?
            WHERE session_id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(session.processed)
        .bind(session.completed)
        .bind(session.failed)
        .bind(session.skipped)
        .bind(session.total_bytes_before)
        .bind(session.total_bytes_after)
        .bind(&session.session_id)
        .execute(&self.pool)
        .await
        .map_err(Error::from)?;
        Ok(())
    }

    /// Close the session with a final status
    pub async fn finish_session(&self, session: &Session, status: SessionStatus) -> Result<()> {
        self.update_progress(session).await?;
        sqlx::query(
            "UPDATE sessions SET status = ?, ended_at = ? WHERE session_id = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(&session.session_id)
        .execute(&self.pool)
        .await
        .map_err(Error::from)?;

        info!(
            session_id = %session.session_id,
            status = status.as_str(),
            completed = session.completed,
            failed = session.failed,
            skipped = session.skipped,
            "session finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recode_common::db::init_database;
    use tempfile::TempDir;

    async fn store() -> (TempDir, CheckpointStore) {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("knowledge.db")).await.unwrap();
        (dir, CheckpointStore::new(pool))
    }

    fn task(path: &str, status: &str) -> TaskRecord {
        TaskRecord {
            file_path: path.to_string(),
            status: status.to_string(),
            error_message: String::new(),
            output_path: String::new(),
            original_size: 100,
            new_size: 40,
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn resume_skips_terminal_paths() {
        let (_dir, store) = store().await;
        let target = Path::new("/library");
        let session = store
            .create_session(target, Path::new("/out"), "balanced", 10)
            .await
            .unwrap();

        for (path, status) in [
            ("/library/a.png", "recorded"),
            ("/library/b.png", "failed"),
            ("/library/c.png", "skipped"),
        ] {
            store.record_task(&session.session_id, &task(path, status)).await.unwrap();
        }

        let resumed = store.find_resumable(target).await.unwrap().unwrap();
        assert_eq!(resumed.session_id, session.session_id);

        let terminal = store.terminal_paths(&resumed.session_id).await.unwrap();
        assert_eq!(terminal.len(), 3);
        assert!(terminal.contains("/library/b.png"));
        assert!(!terminal.contains("/library/d.png"));
    }

    #[tokio::test]
    async fn finished_sessions_are_not_resumable() {
        let (_dir, store) = store().await;
        let target = Path::new("/library");
        let session = store
            .create_session(target, Path::new("/out"), "balanced", 1)
            .await
            .unwrap();
        store
            .finish_session(&session, SessionStatus::Completed)
            .await
            .unwrap();

        assert!(store.find_resumable(target).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn task_record_upsert_keeps_latest_status() {
        let (_dir, store) = store().await;
        let session = store
            .create_session(Path::new("/library"), Path::new("/out"), "lossless", 1)
            .await
            .unwrap();

        store
            .record_task(&session.session_id, &task("/library/a.png", "failed"))
            .await
            .unwrap();
        let mut retried = task("/library/a.png", "recorded");
        retried.retry_count = 2;
        store.record_task(&session.session_id, &retried).await.unwrap();

        let terminal = store.terminal_paths(&session.session_id).await.unwrap();
        assert_eq!(terminal.len(), 1);

        let status: String = sqlx::query_scalar(
            "SELECT status FROM task_records WHERE session_id = ? AND file_path = ?",
        )
        .bind(&session.session_id)
        .bind("/library/a.png")
        .fetch_one(&store.pool)
        .await
        .unwrap();
        assert_eq!(status, "recorded");
    }
}
