//! Knowledge store row types
//!
//! `ConversionRecord` is the append-only fact every other aggregate is
//! derived from. Records are assembled incrementally across pipeline states
//! via [`RecordBuilder`] and never mutated after `save_record`.

use crate::types::{ConversionParams, MediaFeatures, Prediction};
use chrono::{DateTime, Utc};

/// One conversion attempt: input, prediction, outcome, validation
#[derive(Debug, Clone, Default)]
pub struct ConversionRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,

    // File identity
    pub file_path: String,
    pub file_name: String,
    pub original_format: String,
    pub original_size: i64,

    // Source characterization
    pub width: i32,
    pub height: i32,
    pub has_alpha: bool,
    pub pix_fmt: String,
    pub is_animated: bool,
    pub frame_count: i32,
    pub estimated_quality: i32,

    // Prediction
    pub predictor_name: String,
    pub prediction_rule: String,
    pub prediction_confidence: f64,
    pub prediction_time_ms: i64,
    pub predicted_format: String,
    pub predicted_lossless: bool,
    pub predicted_distance: f64,
    pub predicted_effort: i32,
    pub predicted_lossless_jpeg: bool,
    pub predicted_crf: i32,
    pub predicted_speed: i32,
    pub predicted_saving_percent: f64,
    pub predicted_output_size: i64,

    // Actual outcome
    pub actual_format: String,
    pub actual_output_size: i64,
    pub actual_conversion_time_ms: i64,
    pub actual_saving_percent: f64,
    pub actual_saving_bytes: i64,

    // Validation
    pub validation_method: String,
    pub validation_passed: bool,
    pub pixel_diff_percent: f64,
    pub psnr_value: f64,
    pub ssim_value: f64,

    // Derived
    pub prediction_error_percent: f64,
    /// Observability only; no prediction path consumes this
    pub was_explored: bool,

    // Environment metadata
    pub app_version: String,
    pub host_os: String,
}

impl ConversionRecord {
    pub fn builder() -> RecordBuilder {
        RecordBuilder::new()
    }
}

/// Incremental builder for [`ConversionRecord`]
///
/// The pipeline fills sections in as the task advances: features at
/// characterize time, prediction before converting, outcome and validation
/// after. Saving fraction and prediction error are derived here so every
/// caller computes them the same way.
#[derive(Debug, Default)]
pub struct RecordBuilder {
    record: ConversionRecord,
}

impl RecordBuilder {
    pub fn new() -> Self {
        Self {
            record: ConversionRecord {
                created_at: Utc::now(),
                app_version: env!("CARGO_PKG_VERSION").to_string(),
                host_os: std::env::consts::OS.to_string(),
                ..ConversionRecord::default()
            },
        }
    }

    pub fn features(mut self, features: &MediaFeatures) -> Self {
        let r = &mut self.record;
        r.file_path = features.path.to_string_lossy().into_owned();
        r.file_name = features.file_name();
        r.original_format = features.format.clone();
        r.original_size = features.file_size;
        r.width = features.width;
        r.height = features.height;
        r.has_alpha = features.has_alpha;
        r.pix_fmt = features.pix_fmt.clone();
        r.is_animated = features.is_animated;
        r.frame_count = features.frame_count;
        r.estimated_quality = features.estimated_quality;
        self
    }

    pub fn prediction(mut self, prediction: &Prediction) -> Self {
        let r = &mut self.record;
        r.predictor_name = prediction.predictor_name.clone();
        r.prediction_rule = prediction.rule_name.clone();
        r.prediction_confidence = prediction.confidence;
        r.prediction_time_ms = prediction.prediction_time_ms;
        r.predicted_saving_percent = prediction.expected_saving;
        r.predicted_output_size = prediction.expected_size_bytes;
        r.was_explored = prediction.was_explored;

        let p: &ConversionParams = &prediction.params;
        r.predicted_format = p.target_format.clone();
        r.predicted_lossless = p.lossless;
        r.predicted_distance = p.distance;
        r.predicted_effort = p.effort;
        r.predicted_lossless_jpeg = p.lossless_jpeg;
        r.predicted_crf = p.crf;
        r.predicted_speed = p.speed;
        self
    }

    /// Record the actual conversion outcome and derive saving + error
    pub fn actual_result(mut self, format: &str, output_size: i64, elapsed_ms: i64) -> Self {
        let r = &mut self.record;
        r.actual_format = format.to_string();
        r.actual_output_size = output_size;
        r.actual_conversion_time_ms = elapsed_ms;

        if r.original_size > 0 {
            r.actual_saving_bytes = r.original_size - output_size;
            r.actual_saving_percent = r.actual_saving_bytes as f64 / r.original_size as f64;
        }

        if r.predicted_output_size > 0 && r.actual_output_size > 0 {
            let error_bytes = r.actual_output_size - r.predicted_output_size;
            r.prediction_error_percent =
                (error_bytes as f64 / r.actual_output_size as f64).abs();
        }
        self
    }

    pub fn validation(
        mut self,
        method: &str,
        passed: bool,
        pixel_diff: f64,
        psnr: f64,
        ssim: f64,
    ) -> Self {
        let r = &mut self.record;
        r.validation_method = method.to_string();
        r.validation_passed = passed;
        r.pixel_diff_percent = pixel_diff;
        r.psnr_value = psnr;
        r.ssim_value = ssim;
        self
    }

    pub fn build(self) -> ConversionRecord {
        self.record
    }
}

/// Aggregate per (predictor, rule, source format), derived by upsert
#[derive(Debug, Clone, Default)]
pub struct PredictionStats {
    pub id: i64,
    pub predictor_name: String,
    pub prediction_rule: String,
    pub original_format: String,
    pub stats_from: Option<DateTime<Utc>>,
    pub stats_to: Option<DateTime<Utc>>,
    pub total_conversions: i64,
    pub successful_conversions: i64,
    pub avg_prediction_error_percent: f64,
    pub avg_predicted_saving: f64,
    pub avg_actual_saving: f64,
    pub perfect_quality_count: i64,
    pub good_quality_count: i64,
    pub avg_conversion_time_ms: i64,
}

/// How bad an anomaly is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalySeverity {
    Medium,
    High,
}

impl AnomalySeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalySeverity::Medium => "medium",
            AnomalySeverity::High => "high",
        }
    }
}

/// Classified anomaly kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyType {
    /// Prediction error above 30%
    LargePredictionError,
    /// Output failed the quality check
    QualityValidationFailed,
    /// Output larger than the input
    FileSizeIncreased,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyType::LargePredictionError => "large_prediction_error",
            AnomalyType::QualityValidationFailed => "quality_validation_failed",
            AnomalyType::FileSizeIncreased => "file_size_increased",
        }
    }

    pub fn severity(&self) -> AnomalySeverity {
        match self {
            AnomalyType::QualityValidationFailed => AnomalySeverity::High,
            _ => AnomalySeverity::Medium,
        }
    }
}

/// One flagged record
#[derive(Debug, Clone)]
pub struct AnomalyCase {
    pub conversion_record_id: i64,
    pub anomaly_type: AnomalyType,
    pub severity: AnomalySeverity,
    pub description: String,
}

/// Best observed target per (format, pix_fmt, size bucket)
#[derive(Debug, Clone, Default)]
pub struct FormatCharacteristics {
    pub original_format: String,
    pub pix_fmt: String,
    pub size_range: String,
    pub sample_count: i64,
    pub best_target_format: String,
    pub best_avg_saving: f64,
    pub best_success_rate: f64,
}

/// Bucket a file size into the ranges used by format_characteristics
pub fn size_range_bucket(size: i64) -> &'static str {
    match size {
        s if s < 100 * 1024 => "small",
        s if s < 10 * 1024 * 1024 => "medium",
        _ => "large",
    }
}
