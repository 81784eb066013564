//! Prediction tuner
//!
//! Turns knowledge-store aggregates into parameter recommendations with a
//! calibrated confidence. Both step functions below are pure functions of
//! sample count, so every tuning decision is reproducible from the store
//! contents alone.

use super::{KnowledgeError, KnowledgeStore};
use crate::types::QualityGoal;
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// Tuner errors and signals
#[derive(Debug, Error)]
pub enum TunerError {
    /// No matching history; caller falls back to static defaults
    #[error("No historical data for {source_format} -> {target_format}")]
    InsufficientData {
        source_format: String,
        target_format: String,
    },

    /// Underlying store failure
    #[error(transparent)]
    Store(#[from] KnowledgeError),
}

/// Tuned recommendation for one (source, target, goal) triple
#[derive(Debug, Clone)]
pub struct TunedParams {
    pub source_format: String,
    pub target_format: String,
    pub quality_goal: QualityGoal,

    /// Historical mean saving fraction for validated conversions
    pub optimal_saving: f64,
    pub optimal_effort: i32,
    pub optimal_crf: i32,
    pub optimal_speed: i32,

    /// Confidence in the recommendation, driven by sample count
    pub confidence: f64,
    pub sample_count: i64,
    pub avg_error: f64,
    pub computed_at: DateTime<Utc>,
}

struct CachedTuning {
    params: TunedParams,
    cached_at: Instant,
    hit_count: u64,
}

/// Cache occupancy and hit totals, for diagnostics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub total_hits: u64,
}

/// Rollup of one observed (source, target) pair
#[derive(Debug, Clone)]
pub struct FormatCombination {
    pub source_format: String,
    pub target_format: String,
    pub sample_count: i64,
    pub avg_saving: f64,
    pub success_count: i64,
    pub success_rate: f64,
}

/// Derives recommended parameters from conversion history
pub struct PredictionTuner {
    store: KnowledgeStore,
    cache: Mutex<HashMap<(String, String, QualityGoal), CachedTuning>>,
    cache_ttl: Duration,
}

impl PredictionTuner {
    pub fn new(store: KnowledgeStore, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
            cache_ttl,
        }
    }

    /// Confidence as a step function of sample count
    ///
    /// Deliberately conservative on small samples so sparse history never
    /// looks trustworthy.
    pub fn confidence(sample_count: i64) -> f64 {
        match sample_count {
            n if n < 5 => 0.50,
            n if n < 10 => 0.60,
            n if n < 20 => 0.70,
            n if n < 50 => 0.80,
            n if n < 100 => 0.85,
            n if n < 200 => 0.90,
            _ => 0.95,
        }
    }

    /// Minimum confidence required to skip exploration
    ///
    /// Rises with sample count: well-explored paths get stricter while
    /// sparse paths explore readily.
    pub fn confidence_threshold(sample_count: i64) -> f64 {
        match sample_count {
            n if n < 10 => 0.60,
            n if n < 50 => 0.75,
            n if n < 200 => 0.85,
            _ => 0.90,
        }
    }

    /// Recommended parameters for one (source, target, goal) triple
    ///
    /// Cached per triple with a bounded TTL; zero matching samples yield
    /// [`TunerError::InsufficientData`].
    pub async fn tuned_params(
        &self,
        source_format: &str,
        target_format: &str,
        quality_goal: QualityGoal,
    ) -> Result<TunedParams, TunerError> {
        let key = (
            source_format.to_string(),
            target_format.to_string(),
            quality_goal,
        );

        if let Some(params) = self.cached(&key) {
            return Ok(params);
        }

        let params = self
            .compute_optimal_params(source_format, target_format, quality_goal)
            .await?;

        self.cache
            .lock()
            .expect("tuning cache poisoned")
            .insert(
                key,
                CachedTuning {
                    params: params.clone(),
                    cached_at: Instant::now(),
                    hit_count: 0,
                },
            );

        Ok(params)
    }

    async fn compute_optimal_params(
        &self,
        source_format: &str,
        target_format: &str,
        quality_goal: QualityGoal,
    ) -> Result<TunedParams, TunerError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS sample_count,
                   COALESCE(AVG(actual_saving_percent), 0) AS avg_saving,
                   COALESCE(AVG(prediction_error_percent), 0) AS avg_error,
                   COALESCE(AVG(predicted_effort), 0) AS avg_effort,
                   COALESCE(AVG(predicted_crf), 0) AS avg_crf,
                   COALESCE(AVG(predicted_speed), 0) AS avg_speed
            FROM conversion_records
            WHERE original_format = ?
              AND actual_format = ?
              AND validation_passed = 1
            "#,
        )
        .bind(source_format)
        .bind(target_format)
        .fetch_one(self.store.pool())
        .await
        .map_err(KnowledgeError::from)?;

        let sample_count: i64 = row.get("sample_count");
        if sample_count == 0 {
            return Err(TunerError::InsufficientData {
                source_format: source_format.to_string(),
                target_format: target_format.to_string(),
            });
        }

        let confidence = Self::confidence(sample_count);
        let params = TunedParams {
            source_format: source_format.to_string(),
            target_format: target_format.to_string(),
            quality_goal,
            optimal_saving: row.get("avg_saving"),
            optimal_effort: row.get::<f64, _>("avg_effort").round() as i32,
            optimal_crf: row.get::<f64, _>("avg_crf").round() as i32,
            optimal_speed: row.get::<f64, _>("avg_speed").round() as i32,
            confidence,
            sample_count,
            avg_error: row.get("avg_error"),
            computed_at: Utc::now(),
        };

        info!(
            source = source_format,
            target = target_format,
            samples = sample_count,
            saving_pct = params.optimal_saving * 100.0,
            confidence,
            "tuned parameters computed"
        );

        Ok(params)
    }

    /// True when the confidence is below the threshold for the observed
    /// sample count; a failed sample-count query also suggests exploring
    pub async fn suggest_exploration(
        &self,
        source_format: &str,
        target_format: &str,
        confidence: f64,
    ) -> bool {
        let sample_count = match self.store.sample_count(source_format, target_format).await {
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "sample count query failed, suggesting exploration");
                return true;
            }
        };

        confidence < Self::confidence_threshold(sample_count)
    }

    fn cached(&self, key: &(String, String, QualityGoal)) -> Option<TunedParams> {
        let mut cache = self.cache.lock().expect("tuning cache poisoned");
        let entry = cache.get_mut(key)?;
        if entry.cached_at.elapsed() > self.cache_ttl {
            return None;
        }
        entry.hit_count += 1;
        debug!(
            source = %key.0,
            target = %key.1,
            hits = entry.hit_count,
            "using cached tuning"
        );
        Some(entry.params.clone())
    }

    /// Drop every cached tuning
    pub fn clear_cache(&self) {
        self.cache.lock().expect("tuning cache poisoned").clear();
        info!("tuning cache cleared");
    }

    pub fn cache_stats(&self) -> CacheStats {
        let cache = self.cache.lock().expect("tuning cache poisoned");
        CacheStats {
            entries: cache.len(),
            total_hits: cache.values().map(|c| c.hit_count).sum(),
        }
    }

    /// All (source, target) pairs with more than 5 samples
    pub async fn format_combinations(&self) -> Result<Vec<FormatCombination>, TunerError> {
        let rows = sqlx::query(
            r#"
            SELECT original_format, actual_format,
                   COUNT(*) AS sample_count,
                   AVG(actual_saving_percent) AS avg_saving,
                   SUM(CASE WHEN validation_passed = 1 THEN 1 ELSE 0 END) AS success_count
            FROM conversion_records
            WHERE actual_format != ''
            GROUP BY original_format, actual_format
            HAVING COUNT(*) > 5
            ORDER BY COUNT(*) DESC
            "#,
        )
        .fetch_all(self.store.pool())
        .await
        .map_err(KnowledgeError::from)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let sample_count: i64 = row.get("sample_count");
                let success_count: i64 = row.get("success_count");
                FormatCombination {
                    source_format: row.get("original_format"),
                    target_format: row.get("actual_format"),
                    sample_count,
                    avg_saving: row.get("avg_saving"),
                    success_count,
                    success_rate: success_count as f64 / sample_count as f64,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Documented breakpoints: 5, 10, 20, 50, 100, 200
    #[test]
    fn confidence_steps_match_table() {
        let table = [
            (0, 0.50),
            (4, 0.50),
            (5, 0.60),
            (9, 0.60),
            (10, 0.70),
            (19, 0.70),
            (20, 0.80),
            (49, 0.80),
            (50, 0.85),
            (99, 0.85),
            (100, 0.90),
            (199, 0.90),
            (200, 0.95),
            (10_000, 0.95),
        ];
        for (n, expected) in table {
            assert_eq!(PredictionTuner::confidence(n), expected, "n = {}", n);
        }
    }

    #[test]
    fn threshold_steps_match_table() {
        let table = [
            (0, 0.60),
            (9, 0.60),
            (10, 0.75),
            (49, 0.75),
            (50, 0.85),
            (199, 0.85),
            (200, 0.90),
            (10_000, 0.90),
        ];
        for (n, expected) in table {
            assert_eq!(
                PredictionTuner::confidence_threshold(n),
                expected,
                "n = {}",
                n
            );
        }
    }

    #[test]
    fn both_step_functions_are_non_decreasing() {
        let mut last_conf = 0.0;
        let mut last_thresh = 0.0;
        for n in 0..500 {
            let conf = PredictionTuner::confidence(n);
            let thresh = PredictionTuner::confidence_threshold(n);
            assert!(conf >= last_conf, "confidence dipped at n = {}", n);
            assert!(thresh >= last_thresh, "threshold dipped at n = {}", n);
            last_conf = conf;
            last_thresh = thresh;
        }
    }
}
