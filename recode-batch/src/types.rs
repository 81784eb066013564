//! Shared domain types for the batch engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Characterization of one source file, supplied by the external probe
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaFeatures {
    pub path: PathBuf,
    /// Container/codec name, lowercase ("png", "jpeg", "gif", "mp4", ...)
    pub format: String,
    pub file_size: i64,
    pub width: i32,
    pub height: i32,
    pub has_alpha: bool,
    pub pix_fmt: String,
    pub is_animated: bool,
    pub frame_count: i32,
    /// Estimated pre-conversion quality score (0-100, 0 = unknown)
    pub estimated_quality: i32,
}

impl MediaFeatures {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// What the batch is optimizing for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityGoal {
    /// Bit-exact or visually lossless output only
    Lossless,
    /// Best size at acceptable quality
    Balanced,
    /// Smallest output the validator will still pass
    MaxSaving,
}

impl QualityGoal {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityGoal::Lossless => "lossless",
            QualityGoal::Balanced => "balanced",
            QualityGoal::MaxSaving => "max_saving",
        }
    }
}

impl std::str::FromStr for QualityGoal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lossless" => Ok(QualityGoal::Lossless),
            "balanced" => Ok(QualityGoal::Balanced),
            "max_saving" => Ok(QualityGoal::MaxSaving),
            other => Err(format!("unknown quality goal: {}", other)),
        }
    }
}

/// Encoder parameters chosen for one conversion attempt
///
/// Distance/effort drive JXL, crf/speed drive AVIF; irrelevant knobs stay
/// at their zero defaults and are recorded as such.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversionParams {
    pub target_format: String,
    pub lossless: bool,
    /// JXL distance; 0 = mathematically lossless
    pub distance: f64,
    /// JXL effort, 1-9
    pub effort: i32,
    /// Losslessly repackage JPEG streams instead of re-encoding
    pub lossless_jpeg: bool,
    /// AVIF quality, 0-63 (lower = better)
    pub crf: i32,
    /// AVIF encoder speed, 0-10
    pub speed: i32,
}

impl ConversionParams {
    /// Static per-format defaults used when the tuner has no history
    pub fn static_default(source_format: &str) -> Self {
        match source_format {
            // PNG is always losslessly re-encoded to JXL
            "png" => Self {
                target_format: "jxl".into(),
                lossless: true,
                distance: 0.0,
                effort: 7,
                ..Self::default()
            },
            // JPEG golden rule: lossless repackaging, perfectly reversible
            "jpeg" | "jpg" => Self {
                target_format: "jxl".into(),
                lossless: true,
                lossless_jpeg: true,
                distance: 0.0,
                effort: 7,
                ..Self::default()
            },
            "gif" => Self {
                target_format: "avif".into(),
                crf: 28,
                speed: 6,
                ..Self::default()
            },
            "mp4" | "mov" | "webm" => Self {
                target_format: "avif".into(),
                crf: 30,
                speed: 7,
                ..Self::default()
            },
            _ => Self {
                target_format: "jxl".into(),
                lossless: true,
                distance: 0.0,
                effort: 5,
                ..Self::default()
            },
        }
    }

    /// Short rule label recorded with each prediction
    pub fn rule_label(&self) -> String {
        match self.target_format.as_str() {
            "jxl" if self.lossless_jpeg => "jxl_lossless_jpeg".to_string(),
            "jxl" => format!("jxl_d{:.1}_e{}", self.distance, self.effort),
            "avif" => format!("avif_crf{}_s{}", self.crf, self.speed),
            other => other.to_string(),
        }
    }
}

/// Prediction produced for one task before conversion starts
#[derive(Debug, Clone)]
pub struct Prediction {
    pub predictor_name: String,
    pub rule_name: String,
    pub confidence: f64,
    pub params: ConversionParams,
    /// Expected saving as a fraction of the original size
    pub expected_saving: f64,
    pub expected_size_bytes: i64,
    pub prediction_time_ms: i64,
    /// Set when the parameters came from an exploration decision
    pub was_explored: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpeg_defaults_repackage_losslessly() {
        let params = ConversionParams::static_default("jpeg");
        assert!(params.lossless_jpeg);
        assert!(params.lossless);
        assert_eq!(params.target_format, "jxl");
        assert_eq!(params.rule_label(), "jxl_lossless_jpeg");
    }

    #[test]
    fn png_defaults_are_lossless_jxl() {
        let params = ConversionParams::static_default("png");
        assert_eq!(params.target_format, "jxl");
        assert!(params.lossless);
        assert_eq!(params.distance, 0.0);
        assert_eq!(params.rule_label(), "jxl_d0.0_e7");
    }

    #[test]
    fn quality_goal_round_trips() {
        for goal in [QualityGoal::Lossless, QualityGoal::Balanced, QualityGoal::MaxSaving] {
            let parsed: QualityGoal = goal.as_str().parse().unwrap();
            assert_eq!(parsed, goal);
        }
        assert!("fast".parse::<QualityGoal>().is_err());
    }
}
