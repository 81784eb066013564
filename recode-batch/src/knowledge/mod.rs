//! Knowledge store: the durable ledger of conversion attempts
//!
//! Writes are append-only into `conversion_records`; every aggregate
//! (`prediction_stats`, `format_characteristics`, anomaly cases) is derived
//! from those records and reproducible by replay. SQLite serializes
//! concurrent writes, so callers need no extra locking around saves.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};

pub mod query;
pub mod tuner;
pub mod types;

pub use query::RecordQuery;
pub use tuner::{PredictionTuner, TunedParams, TunerError};
pub use types::{
    size_range_bucket, AnomalyCase, AnomalySeverity, AnomalyType, ConversionRecord,
    FormatCharacteristics, PredictionStats, RecordBuilder,
};

/// Knowledge store errors
#[derive(Debug, Error)]
pub enum KnowledgeError {
    /// A record with this (path, timestamp) key already exists
    #[error("Duplicate record for {path} at {created_at}")]
    Duplicate { path: String, created_at: String },

    /// Underlying database failure
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Summary across all recorded conversions
#[derive(Debug, Clone, Default)]
pub struct StatsSummary {
    pub total_conversions: i64,
    pub avg_saving_percent: f64,
    pub quality_pass_rate: f64,
    pub avg_prediction_error: f64,
}

/// Durable ledger plus derived aggregate statistics
#[derive(Clone)]
pub struct KnowledgeStore {
    pool: SqlitePool,
}

impl KnowledgeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Append one conversion record; duplicates are rejected, never merged
    pub async fn save_record(&self, record: &ConversionRecord) -> Result<i64, KnowledgeError> {
        let result = sqlx::query(
            r#"
            INSERT INTO conversion_records (
                created_at, file_path, file_name, original_format, original_size,
                width, height, has_alpha, pix_fmt, is_animated, frame_count, estimated_quality,
                predictor_name, prediction_rule, prediction_confidence, prediction_time_ms,
                predicted_format, predicted_lossless, predicted_distance, predicted_effort,
                predicted_lossless_jpeg, predicted_crf, predicted_speed,
                predicted_saving_percent, predicted_output_size,
                actual_format, actual_output_size, actual_conversion_time_ms,
                actual_saving_percent, actual_saving_bytes,
                validation_method, validation_passed, pixel_diff_percent, psnr_value, ssim_value,
                prediction_error_percent, was_explored,
                app_version, host_os
            ) VALUES (
                ?, ?, ?, ?, ?,
                ?, ?, ?, ?, ?, ?, ?,
                ?, ?, ?, ?,
                ?, ?, ?, ?,
                ?, ?, ?,
                ?, ?,
                ?, ?, ?,
                ?, ?,
                ?, ?, ?, ?, ?,
                ?, ?,
                ?, ?
            )
            "#,
        )
        .bind(record.created_at.to_rfc3339())
        .bind(&record.file_path)
        .bind(&record.file_name)
        .bind(&record.original_format)
        .bind(record.original_size)
        .bind(record.width)
        .bind(record.height)
        .bind(record.has_alpha)
        .bind(&record.pix_fmt)
        .bind(record.is_animated)
        .bind(record.frame_count)
        .bind(record.estimated_quality)
        .bind(&record.predictor_name)
        .bind(&record.prediction_rule)
        .bind(record.prediction_confidence)
        .bind(record.prediction_time_ms)
        .bind(&record.predicted_format)
        .bind(record.predicted_lossless)
        .bind(record.predicted_distance)
        .bind(record.predicted_effort)
        .bind(record.predicted_lossless_jpeg)
        .bind(record.predicted_crf)
        .bind(record.predicted_speed)
        .bind(record.predicted_saving_percent)
        .bind(record.predicted_output_size)
        .bind(&record.actual_format)
        .bind(record.actual_output_size)
        .bind(record.actual_conversion_time_ms)
        .bind(record.actual_saving_percent)
        .bind(record.actual_saving_bytes)
        .bind(&record.validation_method)
        .bind(record.validation_passed)
        .bind(record.pixel_diff_percent)
        .bind(record.psnr_value)
        .bind(record.ssim_value)
        .bind(record.prediction_error_percent)
        .bind(record.was_explored)
        .bind(&record.app_version)
        .bind(&record.host_os)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => {
                let id = done.last_insert_rowid();
                debug!(
                    id,
                    file = %record.file_name,
                    rule = %record.prediction_rule,
                    "conversion record saved"
                );
                Ok(id)
            }
            Err(e) => {
                if e.as_database_error()
                    .map(|d| d.is_unique_violation())
                    .unwrap_or(false)
                {
                    Err(KnowledgeError::Duplicate {
                        path: record.file_path.clone(),
                        created_at: record.created_at.to_rfc3339(),
                    })
                } else {
                    Err(KnowledgeError::Database(e))
                }
            }
        }
    }

    /// Recompute the aggregate row for one (predictor, rule, format)
    ///
    /// Idempotent: rerunning against the same records yields the same row.
    pub async fn aggregate_stats(
        &self,
        predictor: &str,
        rule: &str,
        format: &str,
    ) -> Result<(), KnowledgeError> {
        sqlx::query(
            r#"
            INSERT INTO prediction_stats (
                predictor_name, prediction_rule, original_format,
                stats_from, stats_to,
                total_conversions, successful_conversions,
                avg_prediction_error_percent,
                avg_predicted_saving, avg_actual_saving,
                perfect_quality_count, good_quality_count,
                avg_conversion_time_ms,
                updated_at
            )
            SELECT
                ?, ?, ?,
                MIN(created_at), MAX(created_at),
                COUNT(*),
                SUM(CASE WHEN validation_passed = 1 THEN 1 ELSE 0 END),
                AVG(prediction_error_percent),
                AVG(predicted_saving_percent), AVG(actual_saving_percent),
                SUM(CASE WHEN pixel_diff_percent = 0 THEN 1 ELSE 0 END),
                SUM(CASE WHEN psnr_value > 40 OR ssim_value > 0.95 THEN 1 ELSE 0 END),
                CAST(AVG(actual_conversion_time_ms) AS INTEGER),
                CURRENT_TIMESTAMP
            FROM conversion_records
            WHERE predictor_name = ? AND prediction_rule = ? AND original_format = ?
            HAVING COUNT(*) > 0
            ON CONFLICT(predictor_name, prediction_rule, original_format) DO UPDATE SET
                stats_from = excluded.stats_from,
                stats_to = excluded.stats_to,
                total_conversions = excluded.total_conversions,
                successful_conversions = excluded.successful_conversions,
                avg_prediction_error_percent = excluded.avg_prediction_error_percent,
                avg_predicted_saving = excluded.avg_predicted_saving,
                avg_actual_saving = excluded.avg_actual_saving,
                perfect_quality_count = excluded.perfect_quality_count,
                good_quality_count = excluded.good_quality_count,
                avg_conversion_time_ms = excluded.avg_conversion_time_ms,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(predictor)
        .bind(rule)
        .bind(format)
        .bind(predictor)
        .bind(rule)
        .bind(format)
        .execute(&self.pool)
        .await?;

        debug!(predictor, rule, format, "prediction stats aggregated");
        Ok(())
    }

    /// Read one aggregate row, if it exists
    pub async fn prediction_stats(
        &self,
        predictor: &str,
        rule: &str,
        format: &str,
    ) -> Result<Option<PredictionStats>, KnowledgeError> {
        let row = sqlx::query(
            r#"
            SELECT id, predictor_name, prediction_rule, original_format,
                   stats_from, stats_to,
                   total_conversions, successful_conversions,
                   avg_prediction_error_percent,
                   avg_predicted_saving, avg_actual_saving,
                   perfect_quality_count, good_quality_count,
                   avg_conversion_time_ms
            FROM prediction_stats
            WHERE predictor_name = ? AND prediction_rule = ? AND original_format = ?
            "#,
        )
        .bind(predictor)
        .bind(rule)
        .bind(format)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| PredictionStats {
            id: row.get("id"),
            predictor_name: row.get("predictor_name"),
            prediction_rule: row.get("prediction_rule"),
            original_format: row.get("original_format"),
            stats_from: parse_timestamp(row.get::<Option<String>, _>("stats_from")),
            stats_to: parse_timestamp(row.get::<Option<String>, _>("stats_to")),
            total_conversions: row.get("total_conversions"),
            successful_conversions: row.get("successful_conversions"),
            avg_prediction_error_percent: row.get("avg_prediction_error_percent"),
            avg_predicted_saving: row.get("avg_predicted_saving"),
            avg_actual_saving: row.get("avg_actual_saving"),
            perfect_quality_count: row.get("perfect_quality_count"),
            good_quality_count: row.get("good_quality_count"),
            avg_conversion_time_ms: row.get("avg_conversion_time_ms"),
        }))
    }

    /// Scan recent records for anomalies and classify them
    ///
    /// Rules: prediction error > 30%, failed validation, negative saving.
    /// Validation failures are high severity, the rest medium.
    pub async fn detect_anomalies(&self) -> Result<Vec<AnomalyCase>, KnowledgeError> {
        let rows = sqlx::query(
            r#"
            SELECT id, file_name, prediction_error_percent, validation_passed,
                   actual_saving_percent
            FROM conversion_records
            WHERE (prediction_error_percent > 0.3)
               OR (validation_passed = 0)
               OR (actual_saving_percent < 0)
            ORDER BY created_at DESC
            LIMIT 50
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut anomalies = Vec::with_capacity(rows.len());
        for row in rows {
            let record_id: i64 = row.get("id");
            let pred_error: f64 = row.get("prediction_error_percent");
            let passed: bool = row.get("validation_passed");
            let saving: f64 = row.get("actual_saving_percent");

            let anomaly_type = if !passed {
                AnomalyType::QualityValidationFailed
            } else if pred_error > 0.3 {
                AnomalyType::LargePredictionError
            } else {
                AnomalyType::FileSizeIncreased
            };

            let description = match anomaly_type {
                AnomalyType::QualityValidationFailed => "quality validation failed".to_string(),
                AnomalyType::LargePredictionError => {
                    format!("prediction error {:.1}%", pred_error * 100.0)
                }
                AnomalyType::FileSizeIncreased => {
                    format!("file grew by {:.1}%", -saving * 100.0)
                }
            };

            anomalies.push(AnomalyCase {
                conversion_record_id: record_id,
                anomaly_type,
                severity: anomaly_type.severity(),
                description,
            });
        }

        Ok(anomalies)
    }

    /// Persist detected anomalies for later triage
    ///
    /// Detection re-reads recent history on every run, so a case already on
    /// file for the same record and type is left untouched.
    pub async fn save_anomalies(&self, cases: &[AnomalyCase]) -> Result<(), KnowledgeError> {
        for case in cases {
            sqlx::query(
                r#"
                INSERT INTO anomaly_cases
                    (conversion_record_id, anomaly_type, anomaly_severity, description)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(conversion_record_id, anomaly_type) DO NOTHING
                "#,
            )
            .bind(case.conversion_record_id)
            .bind(case.anomaly_type.as_str())
            .bind(case.severity.as_str())
            .bind(&case.description)
            .execute(&self.pool)
            .await?;
        }
        if !cases.is_empty() {
            info!(count = cases.len(), "anomaly cases recorded");
        }
        Ok(())
    }

    /// Overall summary for the final report
    pub async fn stats_summary(&self) -> Result<StatsSummary, KnowledgeError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COALESCE(AVG(actual_saving_percent), 0) AS avg_saving,
                   COALESCE(100.0 * SUM(CASE WHEN validation_passed = 1 THEN 1 ELSE 0 END)
                       / NULLIF(COUNT(*), 0), 0) AS pass_rate,
                   COALESCE(AVG(prediction_error_percent), 0) AS avg_error
            FROM conversion_records
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StatsSummary {
            total_conversions: row.get("total"),
            avg_saving_percent: row.get::<f64, _>("avg_saving") * 100.0,
            quality_pass_rate: row.get("pass_rate"),
            avg_prediction_error: row.get::<f64, _>("avg_error") * 100.0,
        })
    }

    /// Number of records for a (source, target) format pair
    pub async fn sample_count(
        &self,
        source_format: &str,
        target_format: &str,
    ) -> Result<i64, KnowledgeError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM conversion_records
             WHERE original_format = ? AND actual_format = ?",
        )
        .bind(source_format)
        .bind(target_format)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Refresh format_characteristics from the full record history
    ///
    /// For each (format, pix_fmt, size bucket) the best target is the one
    /// with the highest average saving among validated conversions.
    pub async fn refresh_format_characteristics(&self) -> Result<(), KnowledgeError> {
        let rows = sqlx::query(
            r#"
            SELECT original_format, pix_fmt,
                   CASE
                       WHEN original_size < 102400 THEN 'small'
                       WHEN original_size < 10485760 THEN 'medium'
                       ELSE 'large'
                   END AS size_range,
                   actual_format,
                   COUNT(*) AS sample_count,
                   AVG(actual_saving_percent) AS avg_saving,
                   1.0 * SUM(CASE WHEN validation_passed = 1 THEN 1 ELSE 0 END) / COUNT(*)
                       AS success_rate
            FROM conversion_records
            WHERE actual_format != ''
            GROUP BY original_format, pix_fmt, size_range, actual_format
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        // Keep the best target per (format, pix_fmt, bucket)
        let mut best: std::collections::HashMap<(String, String, String), FormatCharacteristics> =
            std::collections::HashMap::new();
        for row in rows {
            let entry = FormatCharacteristics {
                original_format: row.get("original_format"),
                pix_fmt: row.get("pix_fmt"),
                size_range: row.get("size_range"),
                sample_count: row.get("sample_count"),
                best_target_format: row.get("actual_format"),
                best_avg_saving: row.get("avg_saving"),
                best_success_rate: row.get("success_rate"),
            };
            let key = (
                entry.original_format.clone(),
                entry.pix_fmt.clone(),
                entry.size_range.clone(),
            );
            match best.get(&key) {
                Some(current) if current.best_avg_saving >= entry.best_avg_saving => {}
                _ => {
                    best.insert(key, entry);
                }
            }
        }

        for fc in best.values() {
            sqlx::query(
                r#"
                INSERT INTO format_characteristics
                    (original_format, pix_fmt, size_range, sample_count,
                     best_target_format, best_avg_saving, best_success_rate, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
                ON CONFLICT(original_format, pix_fmt, size_range) DO UPDATE SET
                    sample_count = excluded.sample_count,
                    best_target_format = excluded.best_target_format,
                    best_avg_saving = excluded.best_avg_saving,
                    best_success_rate = excluded.best_success_rate,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&fc.original_format)
            .bind(&fc.pix_fmt)
            .bind(&fc.size_range)
            .bind(fc.sample_count)
            .bind(&fc.best_target_format)
            .bind(fc.best_avg_saving)
            .bind(fc.best_success_rate)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }
}

/// Map a full conversion_records row to a [`ConversionRecord`]
pub(crate) fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> ConversionRecord {
    ConversionRecord {
        id: row.get("id"),
        created_at: parse_timestamp(row.get::<Option<String>, _>("created_at"))
            .unwrap_or_else(Utc::now),
        file_path: row.get("file_path"),
        file_name: row.get("file_name"),
        original_format: row.get("original_format"),
        original_size: row.get("original_size"),
        width: row.get("width"),
        height: row.get("height"),
        has_alpha: row.get("has_alpha"),
        pix_fmt: row.get("pix_fmt"),
        is_animated: row.get("is_animated"),
        frame_count: row.get("frame_count"),
        estimated_quality: row.get("estimated_quality"),
        predictor_name: row.get("predictor_name"),
        prediction_rule: row.get("prediction_rule"),
        prediction_confidence: row.get("prediction_confidence"),
        prediction_time_ms: row.get("prediction_time_ms"),
        predicted_format: row.get("predicted_format"),
        predicted_lossless: row.get("predicted_lossless"),
        predicted_distance: row.get("predicted_distance"),
        predicted_effort: row.get("predicted_effort"),
        predicted_lossless_jpeg: row.get("predicted_lossless_jpeg"),
        predicted_crf: row.get("predicted_crf"),
        predicted_speed: row.get("predicted_speed"),
        predicted_saving_percent: row.get("predicted_saving_percent"),
        predicted_output_size: row.get("predicted_output_size"),
        actual_format: row.get("actual_format"),
        actual_output_size: row.get("actual_output_size"),
        actual_conversion_time_ms: row.get("actual_conversion_time_ms"),
        actual_saving_percent: row.get("actual_saving_percent"),
        actual_saving_bytes: row.get("actual_saving_bytes"),
        validation_method: row.get("validation_method"),
        validation_passed: row.get("validation_passed"),
        pixel_diff_percent: row.get("pixel_diff_percent"),
        psnr_value: row.get("psnr_value"),
        ssim_value: row.get("ssim_value"),
        prediction_error_percent: row.get("prediction_error_percent"),
        was_explored: row.get("was_explored"),
        app_version: row.get("app_version"),
        host_os: row.get("host_os"),
    }
}

fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
