//! Pipeline coordinator
//!
//! Drives every file through predict -> convert -> validate -> record with
//! a worker pool whose size follows the concurrency controller. The pool
//! never resizes mid-task: the dispatch loop re-reads the target worker
//! count at each task boundary.
//!
//! Retry semantics distinguish the two failure classes. A conversion
//! failure is environmental, so the same parameters are retried. A
//! validation failure is a parameter problem, so the parameters are pushed
//! toward quality before the next attempt. Every completed conversion
//! attempt lands in the knowledge store, validated or not; the store must
//! learn from failures as much as from successes.

use crate::checkpoint::{CheckpointStore, Session, SessionStatus, TaskRecord};
use crate::concurrency::{file_complexity, ConcurrencyController};
use crate::knowledge::{ConversionRecord, KnowledgeStore, PredictionTuner, TunerError};
use crate::report::{BatchReport, TaskFailure, TaskSkip, TaskSuccess};
use crate::tools::{scan_media_files, Characterizer, Converter, ToolError, Validator};
use crate::types::{ConversionParams, MediaFeatures, Prediction, QualityGoal};
use recode_common::config::BatchConfig;
use recode_common::events::{BatchEvent, EventBus};
use recode_common::Result;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod task;

pub use task::{output_path_for, SkipReason, TaskOutcome, TaskState};

/// Orchestrates one batch run over a target directory
pub struct Coordinator {
    config: BatchConfig,
    quality_goal: QualityGoal,
    target_dir: PathBuf,
    output_dir: PathBuf,
    store: KnowledgeStore,
    tuner: Arc<PredictionTuner>,
    checkpoints: CheckpointStore,
    controller: Arc<ConcurrencyController>,
    characterizer: Arc<dyn Characterizer>,
    converter: Arc<dyn Converter>,
    validator: Arc<dyn Validator>,
    events: EventBus,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BatchConfig,
        quality_goal: QualityGoal,
        target_dir: PathBuf,
        output_dir: PathBuf,
        store: KnowledgeStore,
        tuner: Arc<PredictionTuner>,
        checkpoints: CheckpointStore,
        controller: Arc<ConcurrencyController>,
        characterizer: Arc<dyn Characterizer>,
        converter: Arc<dyn Converter>,
        validator: Arc<dyn Validator>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            quality_goal,
            target_dir,
            output_dir,
            store,
            tuner,
            checkpoints,
            controller,
            characterizer,
            converter,
            validator,
            events,
        }
    }

    /// Run the batch to completion (or cancellation)
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<BatchReport> {
        let files = scan_media_files(&self.target_dir);
        info!(count = files.len(), target = %self.target_dir.display(), "scan complete");

        let mut session = match self.checkpoints.find_resumable(&self.target_dir).await? {
            Some(existing) => {
                info!(session_id = %existing.session_id, "resuming interrupted session");
                existing
            }
            None => {
                self.checkpoints
                    .create_session(
                        &self.target_dir,
                        &self.output_dir,
                        self.quality_goal.as_str(),
                        files.len(),
                    )
                    .await?
            }
        };
        let terminal = self.checkpoints.terminal_paths(&session.session_id).await?;

        self.events.publish(BatchEvent::BatchStarted {
            session_id: session.session_id.clone(),
            total_files: files.len(),
            timestamp: chrono::Utc::now(),
        });

        let mut report = BatchReport::new(&session.session_id);
        let mut queue: VecDeque<PathBuf> = files.into();
        let mut workers: JoinSet<TaskOutcome> = JoinSet::new();
        let mut since_flush = 0usize;

        loop {
            while !queue.is_empty()
                && !token.is_cancelled()
                && workers.len() < self.controller.current_workers()
            {
                let path = queue.pop_front().expect("queue checked non-empty");

                if terminal.contains(path.to_string_lossy().as_ref()) {
                    self.absorb(
                        &mut session,
                        &mut report,
                        TaskOutcome::skipped(path, SkipReason::AlreadyProcessed),
                    )
                    .await;
                    continue;
                }

                let format = extension_of(&path);
                if self.config.skip_existing {
                    let target = ConversionParams::static_default(&format).target_format;
                    let mapped =
                        output_path_for(&path, &self.target_dir, &self.output_dir, &target);
                    if mapped.exists() {
                        self.absorb(
                            &mut session,
                            &mut report,
                            TaskOutcome::skipped(path, SkipReason::OutputExists),
                        )
                        .await;
                        continue;
                    }
                }

                // resize the pool target for the class of file coming up
                self.controller
                    .adjust_concurrency("file_complexity", file_complexity(&format));

                let coordinator = self.clone();
                let task_token = token.clone();
                workers.spawn(async move { coordinator.process_file(path, task_token).await });
            }

            let Some(joined) = workers.join_next().await else {
                if queue.is_empty() || token.is_cancelled() {
                    break;
                }
                continue;
            };

            match joined {
                Ok(outcome) => {
                    self.absorb(&mut session, &mut report, outcome).await;
                    since_flush += 1;
                    if since_flush >= self.config.checkpoint_interval.max(1) {
                        self.checkpoints.update_progress(&session).await?;
                        since_flush = 0;
                    }
                }
                Err(e) => warn!(error = %e, "worker panicked"),
            }
        }

        let status = if token.is_cancelled() {
            SessionStatus::Aborted
        } else {
            SessionStatus::Completed
        };
        self.checkpoints.finish_session(&session, status).await?;

        // post-run maintenance over the full ledger
        if let Err(e) = self.store.refresh_format_characteristics().await {
            warn!(error = %e, "format characteristics refresh failed");
        }
        match self.store.detect_anomalies().await {
            Ok(cases) => {
                if let Err(e) = self.store.save_anomalies(&cases).await {
                    warn!(error = %e, "saving anomaly cases failed");
                }
            }
            Err(e) => warn!(error = %e, "anomaly detection failed"),
        }

        self.events.publish(BatchEvent::BatchCompleted {
            session_id: session.session_id.clone(),
            completed: session.completed as usize,
            failed: session.failed as usize,
            skipped: session.skipped as usize,
            timestamp: chrono::Utc::now(),
        });

        Ok(report)
    }

    /// Fold one terminal outcome into the session, checkpoint, and report
    async fn absorb(&self, session: &mut Session, report: &mut BatchReport, outcome: TaskOutcome) {
        let path_str = outcome.path.to_string_lossy().into_owned();

        // a cancelled task is neither failed nor done; it is never
        // checkpointed and a resumed run processes the file again
        if outcome.cancelled {
            report.cancelled.push(path_str.clone());
            self.events.publish(BatchEvent::TaskFinished {
                file_path: path_str,
                status: "cancelled".to_string(),
                saving_bytes: 0,
                retries: outcome.retries,
                timestamp: chrono::Utc::now(),
            });
            return;
        }

        session.processed += 1;

        match outcome.state {
            TaskState::Recorded => {
                session.completed += 1;
                session.total_bytes_before += outcome.original_size;
                session.total_bytes_after += outcome.new_size;
                report.successes.push(TaskSuccess {
                    file_path: path_str.clone(),
                    original_size: outcome.original_size,
                    new_size: outcome.new_size,
                    saving_bytes: outcome.saving_bytes,
                    rule: outcome.rule.clone(),
                    retries: outcome.retries,
                });
            }
            TaskState::Failed => {
                session.failed += 1;
                report.failures.push(TaskFailure {
                    file_path: path_str.clone(),
                    error: outcome.error.clone().unwrap_or_default(),
                    retries: outcome.retries,
                });
            }
            TaskState::Skipped => {
                session.skipped += 1;
                report.skips.push(TaskSkip {
                    file_path: path_str.clone(),
                    reason: outcome
                        .skip_reason
                        .map(|r| r.as_str().to_string())
                        .unwrap_or_default(),
                });
            }
            other => {
                warn!(state = other.as_str(), path = %path_str, "non-terminal outcome ignored");
                return;
            }
        }

        let record = TaskRecord {
            file_path: path_str.clone(),
            status: outcome.state.as_str().to_string(),
            error_message: outcome.error.clone().unwrap_or_default(),
            output_path: outcome
                .output_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
            original_size: outcome.original_size,
            new_size: outcome.new_size,
            retry_count: outcome.retries as i64,
        };
        if let Err(e) = self.checkpoints.record_task(&session.session_id, &record).await {
            warn!(error = %e, path = %path_str, "task checkpoint failed");
        }

        if outcome.state != TaskState::Skipped {
            self.controller
                .record_outcome(outcome.state == TaskState::Recorded);
        }

        self.events.publish(BatchEvent::TaskFinished {
            file_path: path_str,
            status: outcome.state.as_str().to_string(),
            saving_bytes: outcome.saving_bytes,
            retries: outcome.retries,
            timestamp: chrono::Utc::now(),
        });
    }

    /// Drive one file to a terminal state
    async fn process_file(&self, path: PathBuf, token: CancellationToken) -> TaskOutcome {
        let features = match self.characterizer.characterize(&path, &token).await {
            Ok(f) => f,
            Err(ToolError::Cancelled) => return TaskOutcome::cancelled(path, 0),
            Err(e) => return TaskOutcome::failed(path, 0, e.to_string()),
        };

        let mut prediction = self.predict(&features).await;
        let output = output_path_for(
            &path,
            &self.target_dir,
            &self.output_dir,
            &prediction.params.target_format,
        );
        if let Some(parent) = output.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return TaskOutcome::failed(path, 0, e.to_string());
            }
        }

        let max_retries = self.config.retry_count;
        let mut retries: u32 = 0;
        // every loop path either returns or assigns this before the break
        let mut last_error;
        let mut records_saved = 0u32;

        loop {
            if token.is_cancelled() {
                return TaskOutcome::cancelled(path, retries);
            }

            match self
                .converter
                .convert(&path, &output, &prediction.params, &token)
                .await
            {
                Err(ToolError::Cancelled) => return TaskOutcome::cancelled(path, retries),
                Err(e) => {
                    // environmental failure: the same parameters get retried
                    last_error = e.to_string();
                    debug!(path = %path.display(), error = %last_error, "conversion failed");
                }
                Ok(converted) => {
                    match self
                        .validator
                        .validate(&path, &output, prediction.params.lossless, &token)
                        .await
                    {
                        Err(ToolError::Cancelled) => {
                            let _ = tokio::fs::remove_file(&output).await;
                            return TaskOutcome::cancelled(path, retries);
                        }
                        Err(e) => {
                            last_error = e.to_string();
                            let _ = tokio::fs::remove_file(&output).await;
                        }
                        Ok(validation) => {
                            let record = ConversionRecord::builder()
                                .features(&features)
                                .prediction(&prediction)
                                .actual_result(
                                    &prediction.params.target_format,
                                    converted.output_size,
                                    converted.elapsed_ms,
                                )
                                .validation(
                                    &validation.method,
                                    validation.passed,
                                    validation.pixel_diff_percent,
                                    validation.psnr.min(99.99),
                                    validation.ssim,
                                )
                                .build();
                            match self.store.save_record(&record).await {
                                Ok(_) => {
                                    records_saved += 1;
                                    if let Err(e) = self
                                        .store
                                        .aggregate_stats(
                                            &record.predictor_name,
                                            &record.prediction_rule,
                                            &record.original_format,
                                        )
                                        .await
                                    {
                                        warn!(error = %e, "stats aggregation failed");
                                    }
                                }
                                Err(e) => warn!(error = %e, "record save failed"),
                            }

                            if validation.passed {
                                return TaskOutcome {
                                    path,
                                    state: TaskState::Recorded,
                                    retries,
                                    error: None,
                                    skip_reason: None,
                                    output_path: Some(output),
                                    original_size: features.file_size,
                                    new_size: converted.output_size,
                                    saving_bytes: features.file_size - converted.output_size,
                                    rule: prediction.rule_name.clone(),
                                    cancelled: false,
                                };
                            }

                            // parameter problem: discard the output and push
                            // the parameters toward quality for the retry
                            let _ = tokio::fs::remove_file(&output).await;
                            last_error =
                                format!("quality validation failed ({})", validation.method);
                            explore_params(&mut prediction.params);
                            prediction.rule_name = prediction.params.rule_label();
                            prediction.was_explored = true;
                        }
                    }
                }
            }

            if retries >= max_retries {
                break;
            }
            retries += 1;

            let delay = self.config.retry_backoff() * retries;
            tokio::select! {
                _ = token.cancelled() => return TaskOutcome::cancelled(path, retries),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // a task that never produced a validated attempt still teaches the
        // store one thing: these parameters did not work here
        if records_saved == 0 {
            let record = ConversionRecord::builder()
                .features(&features)
                .prediction(&prediction)
                .validation("none", false, 0.0, 0.0, 0.0)
                .build();
            if let Err(e) = self.store.save_record(&record).await {
                warn!(error = %e, "failure record save failed");
            }
        }

        TaskOutcome::failed(path, retries, last_error)
    }

    /// Choose parameters for one file, preferring tuned history
    async fn predict(&self, features: &MediaFeatures) -> Prediction {
        let started = Instant::now();
        let defaults = ConversionParams::static_default(&features.format);
        let target = defaults.target_format.clone();

        let (mut params, predictor_name, confidence, expected_saving) = match self
            .tuner
            .tuned_params(&features.format, &target, self.quality_goal)
            .await
        {
            Ok(tuned) => {
                let mut params = defaults.clone();
                apply_tuned(&mut params, tuned.optimal_effort, tuned.optimal_crf, tuned.optimal_speed);
                (
                    params,
                    "tuned".to_string(),
                    tuned.confidence,
                    tuned.optimal_saving,
                )
            }
            Err(TunerError::InsufficientData { .. }) => {
                debug!(format = %features.format, "no history, using static defaults");
                (
                    defaults.clone(),
                    "static_default".to_string(),
                    0.5,
                    static_expected_saving(&features.format),
                )
            }
            Err(e) => {
                warn!(error = %e, "tuner unavailable, using static defaults");
                (
                    defaults.clone(),
                    "static_default".to_string(),
                    0.5,
                    static_expected_saving(&features.format),
                )
            }
        };

        let was_explored = self
            .tuner
            .suggest_exploration(&features.format, &target, confidence)
            .await;
        if was_explored {
            explore_params(&mut params);
        }

        let expected_size_bytes =
            (features.file_size as f64 * (1.0 - expected_saving)).max(0.0) as i64;

        Prediction {
            predictor_name,
            rule_name: params.rule_label(),
            confidence,
            params,
            expected_saving,
            expected_size_bytes,
            prediction_time_ms: started.elapsed().as_millis() as i64,
            was_explored,
        }
    }
}

/// Overlay tuned knob averages onto the static defaults
fn apply_tuned(params: &mut ConversionParams, effort: i32, crf: i32, speed: i32) {
    match params.target_format.as_str() {
        "jxl" if !params.lossless_jpeg => {
            if effort > 0 {
                params.effort = effort.clamp(1, 9);
            }
        }
        "avif" => {
            if crf > 0 {
                params.crf = crf.clamp(0, 63);
            }
            if speed > 0 {
                params.speed = speed.clamp(0, 10);
            }
        }
        _ => {}
    }
}

/// Nudge parameters one step toward quality/effort
///
/// Used both for exploration on low-confidence paths and after a failed
/// validation. JPEG repackaging that fails validation falls back to a full
/// lossless re-encode.
fn explore_params(params: &mut ConversionParams) {
    match params.target_format.as_str() {
        "jxl" if params.lossless_jpeg => {
            params.lossless_jpeg = false;
            params.lossless = true;
            params.distance = 0.0;
        }
        "jxl" => {
            params.effort = (params.effort + 1).min(9);
        }
        "avif" => {
            params.crf = (params.crf - 5).max(10);
            params.speed = (params.speed - 1).max(0);
        }
        _ => {}
    }
}

/// Rough per-format saving guesses when no history exists
fn static_expected_saving(format: &str) -> f64 {
    match format {
        "png" => 0.35,
        "jpeg" | "jpg" => 0.20,
        "gif" => 0.50,
        "webp" => 0.15,
        "mp4" | "mov" | "webm" => 0.30,
        _ => 0.30,
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exploration_escalates_jxl_effort() {
        let mut params = ConversionParams::static_default("png");
        explore_params(&mut params);
        assert_eq!(params.effort, 8);
        explore_params(&mut params);
        explore_params(&mut params);
        assert_eq!(params.effort, 9);
    }

    #[test]
    fn failed_jpeg_repack_falls_back_to_reencode() {
        let mut params = ConversionParams::static_default("jpeg");
        assert!(params.lossless_jpeg);
        explore_params(&mut params);
        assert!(!params.lossless_jpeg);
        assert!(params.lossless);
        assert_eq!(params.rule_label(), "jxl_d0.0_e7");
    }

    #[test]
    fn exploration_raises_avif_quality() {
        let mut params = ConversionParams::static_default("gif");
        explore_params(&mut params);
        assert_eq!(params.crf, 23);
        assert_eq!(params.speed, 5);
        for _ in 0..10 {
            explore_params(&mut params);
        }
        assert_eq!(params.crf, 10);
        assert_eq!(params.speed, 0);
    }

    #[test]
    fn tuned_knobs_never_touch_jpeg_repack() {
        let mut params = ConversionParams::static_default("jpeg");
        apply_tuned(&mut params, 3, 20, 4);
        assert_eq!(params.effort, 7);
        assert!(params.lossless_jpeg);
    }
}
