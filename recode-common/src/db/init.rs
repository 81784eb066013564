//! Database initialization
//!
//! Creates (or opens) the knowledge database and brings the schema up.
//! Every `create_*_table` function is idempotent, so init can run on every
//! startup. An unreachable database here is fatal by design: the learning
//! loop cannot run without its ledger.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize the database connection pool and schema
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new knowledge database: {}", db_path.display());
    } else {
        info!("Opened knowledge database: {}", db_path.display());
    }

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL allows concurrent readers while one worker commits a record
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create all tables (idempotent, safe to call on every startup)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_conversion_records_table(pool).await?;
    create_prediction_stats_table(pool).await?;
    create_anomaly_cases_table(pool).await?;
    create_format_characteristics_table(pool).await?;
    create_sessions_table(pool).await?;
    create_task_records_table(pool).await?;
    Ok(())
}

/// Append-only ledger of conversion attempts
///
/// One row per (file_path, created_at); rows are never updated. Ratios are
/// stored as fractions in [0,1], sizes in bytes, durations in ms.
pub async fn create_conversion_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversion_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL,
            file_path TEXT NOT NULL,
            file_name TEXT NOT NULL,
            original_format TEXT NOT NULL,
            original_size INTEGER NOT NULL,
            width INTEGER NOT NULL DEFAULT 0,
            height INTEGER NOT NULL DEFAULT 0,
            has_alpha INTEGER NOT NULL DEFAULT 0,
            pix_fmt TEXT NOT NULL DEFAULT '',
            is_animated INTEGER NOT NULL DEFAULT 0,
            frame_count INTEGER NOT NULL DEFAULT 0,
            estimated_quality INTEGER NOT NULL DEFAULT 0,
            predictor_name TEXT NOT NULL DEFAULT '',
            prediction_rule TEXT NOT NULL DEFAULT '',
            prediction_confidence REAL NOT NULL DEFAULT 0,
            prediction_time_ms INTEGER NOT NULL DEFAULT 0,
            predicted_format TEXT NOT NULL DEFAULT '',
            predicted_lossless INTEGER NOT NULL DEFAULT 0,
            predicted_distance REAL NOT NULL DEFAULT 0,
            predicted_effort INTEGER NOT NULL DEFAULT 0,
            predicted_lossless_jpeg INTEGER NOT NULL DEFAULT 0,
            predicted_crf INTEGER NOT NULL DEFAULT 0,
            predicted_speed INTEGER NOT NULL DEFAULT 0,
            predicted_saving_percent REAL NOT NULL DEFAULT 0,
            predicted_output_size INTEGER NOT NULL DEFAULT 0,
            actual_format TEXT NOT NULL DEFAULT '',
            actual_output_size INTEGER NOT NULL DEFAULT 0,
            actual_conversion_time_ms INTEGER NOT NULL DEFAULT 0,
            actual_saving_percent REAL NOT NULL DEFAULT 0,
            actual_saving_bytes INTEGER NOT NULL DEFAULT 0,
            validation_method TEXT NOT NULL DEFAULT '',
            validation_passed INTEGER NOT NULL DEFAULT 0,
            pixel_diff_percent REAL NOT NULL DEFAULT 0,
            psnr_value REAL NOT NULL DEFAULT 0,
            ssim_value REAL NOT NULL DEFAULT 0,
            prediction_error_percent REAL NOT NULL DEFAULT 0,
            was_explored INTEGER NOT NULL DEFAULT 0,
            app_version TEXT NOT NULL DEFAULT '',
            host_os TEXT NOT NULL DEFAULT '',
            UNIQUE(file_path, created_at)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_format
         ON conversion_records(original_format, actual_format)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_predictor
         ON conversion_records(predictor_name, prediction_rule, original_format)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Aggregates derived from conversion_records; always reproducible by replay
pub async fn create_prediction_stats_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS prediction_stats (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            predictor_name TEXT NOT NULL,
            prediction_rule TEXT NOT NULL,
            original_format TEXT NOT NULL,
            stats_from TEXT,
            stats_to TEXT,
            total_conversions INTEGER NOT NULL DEFAULT 0,
            successful_conversions INTEGER NOT NULL DEFAULT 0,
            avg_prediction_error_percent REAL NOT NULL DEFAULT 0,
            avg_predicted_saving REAL NOT NULL DEFAULT 0,
            avg_actual_saving REAL NOT NULL DEFAULT 0,
            perfect_quality_count INTEGER NOT NULL DEFAULT 0,
            good_quality_count INTEGER NOT NULL DEFAULT 0,
            avg_conversion_time_ms INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(predictor_name, prediction_rule, original_format)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Lazily derived anomaly flags referencing conversion_records
///
/// One row per (record, anomaly type), so re-running detection over the
/// same history never accumulates duplicates.
pub async fn create_anomaly_cases_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS anomaly_cases (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversion_record_id INTEGER NOT NULL REFERENCES conversion_records(id),
            anomaly_type TEXT NOT NULL,
            anomaly_severity TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            detected_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            resolved INTEGER NOT NULL DEFAULT 0,
            resolution_note TEXT NOT NULL DEFAULT '',
            UNIQUE(conversion_record_id, anomaly_type)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Per-(format, pix_fmt, size bucket) rollup of the best observed target
pub async fn create_format_characteristics_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS format_characteristics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            original_format TEXT NOT NULL,
            pix_fmt TEXT NOT NULL DEFAULT '',
            size_range TEXT NOT NULL,
            sample_count INTEGER NOT NULL DEFAULT 0,
            best_target_format TEXT NOT NULL DEFAULT '',
            best_avg_saving REAL NOT NULL DEFAULT 0,
            best_success_rate REAL NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(original_format, pix_fmt, size_range)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// One row per batch run, updated as the run progresses
pub async fn create_sessions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            session_id TEXT PRIMARY KEY,
            target_dir TEXT NOT NULL,
            output_dir TEXT NOT NULL DEFAULT '',
            quality_goal TEXT NOT NULL DEFAULT '',
            started_at TEXT NOT NULL,
            last_update TEXT NOT NULL,
            ended_at TEXT,
            status TEXT NOT NULL,
            total_files INTEGER NOT NULL DEFAULT 0,
            processed INTEGER NOT NULL DEFAULT 0,
            completed INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            skipped INTEGER NOT NULL DEFAULT 0,
            total_bytes_before INTEGER NOT NULL DEFAULT 0,
            total_bytes_after INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Resumable task list: terminal statuses keyed by absolute path
pub async fn create_task_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL REFERENCES sessions(session_id),
            file_path TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            error_message TEXT NOT NULL DEFAULT '',
            output_path TEXT NOT NULL DEFAULT '',
            original_size INTEGER NOT NULL DEFAULT 0,
            new_size INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0,
            UNIQUE(session_id, file_path)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn init_creates_schema_idempotently() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("knowledge.db");

        let pool = init_database(&path).await.unwrap();
        // Second pass over an existing database must not fail
        create_schema(&pool).await.unwrap();

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM conversion_records")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 0);
    }
}
