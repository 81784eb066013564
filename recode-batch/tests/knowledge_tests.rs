//! Knowledge store and tuner behavior against a real SQLite database

use recode_batch::knowledge::{
    AnomalySeverity, AnomalyType, ConversionRecord, KnowledgeStore, PredictionTuner, TunerError,
};
use recode_batch::types::{ConversionParams, MediaFeatures, Prediction, QualityGoal};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

async fn store() -> (TempDir, KnowledgeStore) {
    let dir = TempDir::new().unwrap();
    let pool = recode_common::db::init_database(&dir.path().join("knowledge.db"))
        .await
        .unwrap();
    (dir, KnowledgeStore::new(pool))
}

fn record(index: usize, saving: f64, passed: bool) -> ConversionRecord {
    let features = MediaFeatures {
        path: PathBuf::from(format!("/library/img_{:03}.png", index)),
        format: "png".to_string(),
        file_size: 1000,
        width: 800,
        height: 600,
        pix_fmt: "rgb24".to_string(),
        frame_count: 1,
        ..MediaFeatures::default()
    };
    let prediction = Prediction {
        predictor_name: "tuned".to_string(),
        rule_name: "jxl_d0.0_e7".to_string(),
        confidence: 0.8,
        params: ConversionParams::static_default("png"),
        expected_saving: saving,
        expected_size_bytes: (1000.0 * (1.0 - saving)) as i64,
        prediction_time_ms: 1,
        was_explored: false,
    };
    let output_size = (1000.0 * (1.0 - saving)) as i64;
    ConversionRecord::builder()
        .features(&features)
        .prediction(&prediction)
        .actual_result("jxl", output_size, 30)
        .validation(
            "pixel_diff",
            passed,
            if passed { 0.0 } else { 0.3 },
            if passed { 60.0 } else { 20.0 },
            if passed { 1.0 } else { 0.7 },
        )
        .build()
}

#[tokio::test]
async fn aggregation_is_idempotent() {
    let (_dir, store) = store().await;
    for i in 0..3 {
        store.save_record(&record(i, 0.4, true)).await.unwrap();
    }

    store
        .aggregate_stats("tuned", "jxl_d0.0_e7", "png")
        .await
        .unwrap();
    let first = store
        .prediction_stats("tuned", "jxl_d0.0_e7", "png")
        .await
        .unwrap()
        .unwrap();

    // replaying the same aggregation must not change or duplicate the row
    store
        .aggregate_stats("tuned", "jxl_d0.0_e7", "png")
        .await
        .unwrap();
    let second = store
        .prediction_stats("tuned", "jxl_d0.0_e7", "png")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.total_conversions, 3);
    assert_eq!(second.successful_conversions, 3);
    assert!((second.avg_actual_saving - 0.4).abs() < 1e-9);
}

#[tokio::test]
async fn duplicate_record_is_rejected() {
    let (_dir, store) = store().await;
    let r = record(0, 0.4, true);
    store.save_record(&r).await.unwrap();
    let err = store.save_record(&r).await.unwrap_err();
    assert!(matches!(
        err,
        recode_batch::knowledge::KnowledgeError::Duplicate { .. }
    ));
}

#[tokio::test]
async fn fifty_samples_reach_the_exploration_boundary() {
    let (_dir, store) = store().await;
    for i in 0..50 {
        store.save_record(&record(i, 0.4, true)).await.unwrap();
    }

    let tuner = PredictionTuner::new(store.clone(), Duration::from_secs(3600));
    let tuned = tuner
        .tuned_params("png", "jxl", QualityGoal::Balanced)
        .await
        .unwrap();

    assert_eq!(tuned.sample_count, 50);
    assert_eq!(tuned.confidence, 0.85);
    assert!((tuned.optimal_saving - 0.4).abs() < 1e-9);

    // at 50 samples the threshold is also 0.85, so no exploration
    assert!(!tuner.suggest_exploration("png", "jxl", tuned.confidence).await);
}

#[tokio::test]
async fn empty_history_yields_insufficient_data() {
    let (_dir, store) = store().await;
    let tuner = PredictionTuner::new(store.clone(), Duration::from_secs(3600));

    let err = tuner
        .tuned_params("png", "jxl", QualityGoal::Balanced)
        .await
        .unwrap_err();
    match &err {
        TunerError::InsufficientData {
            source_format,
            target_format,
        } => {
            assert_eq!(source_format, "png");
            assert_eq!(target_format, "jxl");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(err.to_string(), "No historical data for png -> jxl");

    // sparse paths always explore
    assert!(tuner.suggest_exploration("png", "jxl", 0.5).await);
}

#[tokio::test]
async fn exploration_follows_the_threshold_strictly() {
    let (_dir, store) = store().await;
    for i in 0..10 {
        store.save_record(&record(i, 0.4, true)).await.unwrap();
    }
    let tuner = PredictionTuner::new(store.clone(), Duration::from_secs(3600));

    // at 10 samples the threshold is 0.75; only strictly-below explores
    assert!(tuner.suggest_exploration("png", "jxl", 0.74).await);
    assert!(!tuner.suggest_exploration("png", "jxl", 0.75).await);
    assert!(!tuner.suggest_exploration("png", "jxl", 0.76).await);
}

#[tokio::test]
async fn tuning_cache_serves_repeat_lookups() {
    let (_dir, store) = store().await;
    for i in 0..10 {
        store.save_record(&record(i, 0.4, true)).await.unwrap();
    }
    let tuner = PredictionTuner::new(store.clone(), Duration::from_secs(3600));

    tuner
        .tuned_params("png", "jxl", QualityGoal::Balanced)
        .await
        .unwrap();
    tuner
        .tuned_params("png", "jxl", QualityGoal::Balanced)
        .await
        .unwrap();

    let stats = tuner.cache_stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.total_hits, 1);

    tuner.clear_cache();
    assert_eq!(tuner.cache_stats().entries, 0);
}

#[tokio::test]
async fn anomalies_are_classified_by_rule() {
    let (_dir, store) = store().await;

    // clean record: no anomaly
    store.save_record(&record(0, 0.4, true)).await.unwrap();
    // validation failure: high severity
    store.save_record(&record(1, 0.4, false)).await.unwrap();
    // file grew: negative saving, medium severity
    store.save_record(&record(2, -0.2, true)).await.unwrap();

    let anomalies = store.detect_anomalies().await.unwrap();
    assert_eq!(anomalies.len(), 2);

    let failed = anomalies
        .iter()
        .find(|a| a.anomaly_type == AnomalyType::QualityValidationFailed)
        .unwrap();
    assert_eq!(failed.severity, AnomalySeverity::High);

    let grew = anomalies
        .iter()
        .find(|a| a.anomaly_type == AnomalyType::FileSizeIncreased)
        .unwrap();
    assert_eq!(grew.severity, AnomalySeverity::Medium);

    store.save_anomalies(&anomalies).await.unwrap();
}

#[tokio::test]
async fn repeated_anomaly_detection_never_duplicates_cases() {
    let (_dir, store) = store().await;
    store.save_record(&record(0, 0.4, false)).await.unwrap();

    // detection runs after every batch over the same recent history
    for _ in 0..3 {
        let anomalies = store.detect_anomalies().await.unwrap();
        assert_eq!(anomalies.len(), 1);
        store.save_anomalies(&anomalies).await.unwrap();
    }

    let cases: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM anomaly_cases")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(cases, 1);
}

#[tokio::test]
async fn query_filters_compose() {
    let (_dir, store) = store().await;
    for i in 0..5 {
        store
            .save_record(&record(i, 0.1 * (i as f64 + 1.0), i % 2 == 0))
            .await
            .unwrap();
    }

    let validated = store
        .query()
        .format("png")
        .validation_passed(true)
        .fetch()
        .await
        .unwrap();
    assert_eq!(validated.len(), 3);

    let best = store.best_conversions("png", 1).await.unwrap();
    assert_eq!(best.len(), 1);
    assert!((best[0].actual_saving_percent - 0.5).abs() < 1e-9);

    let big_savers = store
        .query()
        .saving_greater_than(0.35)
        .fetch()
        .await
        .unwrap();
    assert_eq!(big_savers.len(), 2);
}

#[tokio::test]
async fn format_characteristics_pick_the_best_target() {
    let (_dir, store) = store().await;
    for i in 0..4 {
        store.save_record(&record(i, 0.4, true)).await.unwrap();
    }
    store.refresh_format_characteristics().await.unwrap();

    let target: String = sqlx::query_scalar(
        "SELECT best_target_format FROM format_characteristics
         WHERE original_format = 'png' AND size_range = 'small'",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(target, "jxl");
}
