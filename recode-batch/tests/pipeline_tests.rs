//! End-to-end coordinator tests with in-process fake tools

use async_trait::async_trait;
use recode_batch::checkpoint::{CheckpointStore, TaskRecord};
use recode_batch::concurrency::ConcurrencyController;
use recode_batch::knowledge::{KnowledgeStore, PredictionTuner};
use recode_batch::monitor::ResourceMonitor;
use recode_batch::pipeline::Coordinator;
use recode_batch::tools::{
    Characterizer, ConvertOutcome, Converter, ToolError, ValidationOutcome, Validator,
};
use recode_batch::types::{ConversionParams, MediaFeatures, QualityGoal};
use recode_common::config::BatchConfig;
use recode_common::db::init_database;
use recode_common::events::EventBus;
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Characterizer that derives features from the file itself
struct ExtensionCharacterizer;

#[async_trait]
impl Characterizer for ExtensionCharacterizer {
    async fn characterize(
        &self,
        path: &Path,
        _cancel: &CancellationToken,
    ) -> Result<MediaFeatures, ToolError> {
        let file_size = tokio::fs::metadata(path).await?.len() as i64;
        let format = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        Ok(MediaFeatures {
            path: path.to_path_buf(),
            format,
            file_size,
            width: 100,
            height: 100,
            pix_fmt: "rgb24".to_string(),
            frame_count: 1,
            ..MediaFeatures::default()
        })
    }
}

/// Converter that writes a half-size output, or fails every call
struct FakeConverter {
    calls: AtomicUsize,
    fail_always: bool,
}

impl FakeConverter {
    fn new(fail_always: bool) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_always,
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Converter for FakeConverter {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        _params: &ConversionParams,
        _cancel: &CancellationToken,
    ) -> Result<ConvertOutcome, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_always {
            return Err(ToolError::Failed {
                tool: "converter",
                status: 1,
                stderr: "synthetic encoder failure".to_string(),
            });
        }
        let input_size = tokio::fs::metadata(input).await?.len();
        let output_size = (input_size / 2).max(1);
        tokio::fs::write(output, vec![0u8; output_size as usize]).await?;
        Ok(ConvertOutcome {
            output_size: output_size as i64,
            elapsed_ms: 5,
        })
    }
}

/// Converter that pulls the plug on the whole batch from inside a task
struct CancellingConverter {
    token: CancellationToken,
}

#[async_trait]
impl Converter for CancellingConverter {
    async fn convert(
        &self,
        _input: &Path,
        _output: &Path,
        _params: &ConversionParams,
        cancel: &CancellationToken,
    ) -> Result<ConvertOutcome, ToolError> {
        self.token.cancel();
        cancel.cancelled().await;
        Err(ToolError::Cancelled)
    }
}

/// Validator with a fixed verdict
struct FixedValidator {
    pass: bool,
}

#[async_trait]
impl Validator for FixedValidator {
    async fn validate(
        &self,
        _original: &Path,
        _converted: &Path,
        _lossless: bool,
        _cancel: &CancellationToken,
    ) -> Result<ValidationOutcome, ToolError> {
        Ok(ValidationOutcome {
            method: "fake".to_string(),
            passed: self.pass,
            pixel_diff_percent: if self.pass { 0.0 } else { 0.4 },
            psnr: if self.pass { 55.0 } else { 20.0 },
            ssim: if self.pass { 0.99 } else { 0.6 },
        })
    }
}

struct Harness {
    _dir: TempDir,
    target_dir: PathBuf,
    pool: sqlx::SqlitePool,
    store: KnowledgeStore,
    checkpoints: CheckpointStore,
    config: BatchConfig,
}

async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let target_dir = dir.path().join("library");
    std::fs::create_dir_all(&target_dir).unwrap();

    let pool = init_database(&dir.path().join("knowledge.db")).await.unwrap();
    let store = KnowledgeStore::new(pool.clone());
    let checkpoints = CheckpointStore::new(pool.clone());

    let config = BatchConfig {
        retry_backoff_ms: 1,
        checkpoint_interval: 1,
        max_concurrency: 4,
        ..BatchConfig::default()
    };

    Harness {
        _dir: dir,
        target_dir,
        pool,
        store,
        checkpoints,
        config,
    }
}

fn coordinator(
    harness: &Harness,
    converter: Arc<dyn Converter>,
    validator_passes: bool,
) -> Arc<Coordinator> {
    let events = EventBus::new(256);
    let monitor = ResourceMonitor::new(Duration::from_secs(60), 0.75, 0.90, events.clone());
    let controller = Arc::new(ConcurrencyController::new(
        harness.config.min_concurrency,
        harness.config.max_concurrency,
        harness.config.memory_threshold,
        Duration::from_secs(60),
        (0.8, 0.1, 0.5),
        monitor,
        events.clone(),
    ));
    let tuner = Arc::new(PredictionTuner::new(
        harness.store.clone(),
        Duration::from_secs(3600),
    ));

    Arc::new(Coordinator::new(
        harness.config.clone(),
        QualityGoal::Balanced,
        harness.target_dir.clone(),
        harness.target_dir.join("converted"),
        harness.store.clone(),
        tuner,
        harness.checkpoints.clone(),
        controller,
        Arc::new(ExtensionCharacterizer),
        converter,
        Arc::new(FixedValidator {
            pass: validator_passes,
        }),
        events,
    ))
}

fn seed_files(target_dir: &Path, count: usize) -> Vec<PathBuf> {
    (0..count)
        .map(|i| {
            let path = target_dir.join(format!("photo_{:02}.png", i));
            std::fs::write(&path, vec![7u8; 1000]).unwrap();
            path
        })
        .collect()
}

#[tokio::test]
async fn happy_path_records_and_converts_everything() {
    let h = harness().await;
    seed_files(&h.target_dir, 3);

    let converter = Arc::new(FakeConverter::new(false));
    let report = coordinator(&h, converter.clone(), true)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.successes.len(), 3);
    assert!(report.failures.is_empty());
    assert_eq!(report.total_saving_bytes(), 3 * 500);

    let records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversion_records")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(records, 3);

    for success in &report.successes {
        assert!(h
            .target_dir
            .join("converted")
            .join(Path::new(&success.file_path).file_stem().unwrap())
            .with_extension("jxl")
            .exists());
    }

    let status: String = sqlx::query_scalar("SELECT status FROM sessions")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(status, "completed");
}

#[tokio::test]
async fn persistent_converter_failure_exhausts_retries_once() {
    let h = harness().await;
    seed_files(&h.target_dir, 1);
    let retry_count = h.config.retry_count;

    let converter = Arc::new(FakeConverter::new(true));
    let report = coordinator(&h, converter.clone(), true)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].retries, retry_count);
    assert_eq!(converter.call_count(), (retry_count + 1) as usize);

    // exactly one knowledge record, marking the parameters as unvalidated
    let rows = sqlx::query("SELECT validation_passed FROM conversion_records")
        .fetch_all(&h.pool)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].get::<bool, _>("validation_passed"));

    let task_retries: i64 = sqlx::query_scalar("SELECT retry_count FROM task_records")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(task_retries, retry_count as i64);
}

#[tokio::test]
async fn failed_validation_is_recorded_but_not_a_success() {
    let h = harness().await;
    seed_files(&h.target_dir, 1);

    let converter = Arc::new(FakeConverter::new(false));
    let report = coordinator(&h, converter.clone(), false)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert!(report.successes.is_empty());
    assert_eq!(report.failures.len(), 1);

    // each attempt converted and was validated, so each left a record
    let rows = sqlx::query("SELECT validation_passed FROM conversion_records")
        .fetch_all(&h.pool)
        .await
        .unwrap();
    assert_eq!(rows.len(), (h.config.retry_count + 1) as usize);
    assert!(rows.iter().all(|r| !r.get::<bool, _>("validation_passed")));

    // the rejected output must not survive
    assert!(!h.target_dir.join("converted/photo_00.jxl").exists());
}

#[tokio::test]
async fn resume_processes_only_unfinished_files() {
    let h = harness().await;
    let files = seed_files(&h.target_dir, 10);

    // simulate a run that crashed after checkpointing 6 files
    let session = h
        .checkpoints
        .create_session(
            &h.target_dir,
            &h.target_dir.join("converted"),
            "balanced",
            10,
        )
        .await
        .unwrap();
    for path in files.iter().take(6) {
        h.checkpoints
            .record_task(
                &session.session_id,
                &TaskRecord {
                    file_path: path.to_string_lossy().into_owned(),
                    status: "recorded".to_string(),
                    error_message: String::new(),
                    output_path: String::new(),
                    original_size: 1000,
                    new_size: 500,
                    retry_count: 0,
                },
            )
            .await
            .unwrap();
    }

    let converter = Arc::new(FakeConverter::new(false));
    let report = coordinator(&h, converter.clone(), true)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.session_id, session.session_id);
    assert_eq!(converter.call_count(), 4);
    assert_eq!(report.successes.len(), 4);
    assert_eq!(report.skips.len(), 6);
    assert!(report
        .skips
        .iter()
        .all(|s| s.reason == "already processed"));
}

#[tokio::test]
async fn existing_output_skips_the_file() {
    let h = harness().await;
    seed_files(&h.target_dir, 2);

    let converted = h.target_dir.join("converted");
    std::fs::create_dir_all(&converted).unwrap();
    std::fs::write(converted.join("photo_00.jxl"), b"already here").unwrap();

    let converter = Arc::new(FakeConverter::new(false));
    let report = coordinator(&h, converter.clone(), true)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.skips.len(), 1);
    assert_eq!(report.skips[0].reason, "output exists");
    assert_eq!(report.successes.len(), 1);
    assert_eq!(converter.call_count(), 1);
}

#[tokio::test]
async fn cancelled_batch_stays_resumable() {
    let h = harness().await;
    seed_files(&h.target_dir, 5);

    let token = CancellationToken::new();
    token.cancel();

    let converter = Arc::new(FakeConverter::new(false));
    let report = coordinator(&h, converter.clone(), true)
        .run(token)
        .await
        .unwrap();

    assert!(report.successes.is_empty());
    assert_eq!(converter.call_count(), 0);

    let status: String = sqlx::query_scalar("SELECT status FROM sessions")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(status, "aborted");
}

#[tokio::test]
async fn midrun_interrupt_is_not_counted_as_failure() {
    let h = harness().await;
    seed_files(&h.target_dir, 3);

    let token = CancellationToken::new();
    let converter = Arc::new(CancellingConverter {
        token: token.clone(),
    });
    let report = coordinator(&h, converter, true)
        .run(token)
        .await
        .unwrap();

    assert!(report.successes.is_empty());
    assert!(report.failures.is_empty());
    assert!(!report.cancelled.is_empty());

    // interrupted tasks leave no checkpoint, so a resumed run retries them
    let tasks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_records")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(tasks, 0);

    let status: String = sqlx::query_scalar("SELECT status FROM sessions")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(status, "aborted");
}
