//! Task states and outcomes
//!
//! A task moves Pending -> Predicting -> Converting -> Validating and ends
//! in exactly one terminal state. The terminal state plus the outcome data
//! is what checkpointing, reporting, and the event bus consume.

use std::path::{Path, PathBuf};

/// Lifecycle of one file through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Predicting,
    Converting,
    Validating,
    /// Converted, validated, and written to the knowledge store
    Recorded,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Predicting => "predicting",
            TaskState::Converting => "converting",
            TaskState::Validating => "validating",
            TaskState::Recorded => "recorded",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Recorded | TaskState::Failed | TaskState::Skipped
        )
    }
}

/// Why a task was skipped without running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Terminal in a previous session for the same target
    AlreadyProcessed,
    /// The mapped output file already exists
    OutputExists,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::AlreadyProcessed => "already processed",
            SkipReason::OutputExists => "output exists",
        }
    }
}

/// Terminal result of one task
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub path: PathBuf,
    pub state: TaskState,
    pub retries: u32,
    pub error: Option<String>,
    pub skip_reason: Option<SkipReason>,
    pub output_path: Option<PathBuf>,
    pub original_size: i64,
    pub new_size: i64,
    pub saving_bytes: i64,
    pub rule: String,
    /// Set when the batch was cancelled mid-task; such outcomes are not
    /// checkpointed, so a resumed run processes the file again
    pub cancelled: bool,
}

impl TaskOutcome {
    pub fn skipped(path: PathBuf, reason: SkipReason) -> Self {
        Self {
            path,
            state: TaskState::Skipped,
            retries: 0,
            error: None,
            skip_reason: Some(reason),
            output_path: None,
            original_size: 0,
            new_size: 0,
            saving_bytes: 0,
            rule: String::new(),
            cancelled: false,
        }
    }

    pub fn failed(path: PathBuf, retries: u32, error: String) -> Self {
        Self {
            path,
            state: TaskState::Failed,
            retries,
            error: Some(error),
            skip_reason: None,
            output_path: None,
            original_size: 0,
            new_size: 0,
            saving_bytes: 0,
            rule: String::new(),
            cancelled: false,
        }
    }

    pub fn cancelled(path: PathBuf, retries: u32) -> Self {
        Self {
            cancelled: true,
            ..Self::failed(path, retries, "cancelled".to_string())
        }
    }
}

/// Map a source file to its output location
///
/// The directory structure under the target is mirrored below the output
/// directory, with the extension replaced by the target format. A source
/// outside the target directory (symlinked scans) flattens to its file name.
pub fn output_path_for(
    source: &Path,
    target_dir: &Path,
    output_dir: &Path,
    target_format: &str,
) -> PathBuf {
    let relative = source
        .strip_prefix(target_dir)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| {
            PathBuf::from(source.file_name().unwrap_or_default())
        });
    output_dir.join(relative.with_extension(target_format))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskState::Recorded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Skipped.is_terminal());
        assert!(!TaskState::Converting.is_terminal());
    }

    #[test]
    fn output_path_mirrors_structure() {
        let out = output_path_for(
            Path::new("/library/albums/cover.png"),
            Path::new("/library"),
            Path::new("/converted"),
            "jxl",
        );
        assert_eq!(out, PathBuf::from("/converted/albums/cover.jxl"));
    }

    #[test]
    fn output_path_flattens_foreign_sources() {
        let out = output_path_for(
            Path::new("/elsewhere/pic.gif"),
            Path::new("/library"),
            Path::new("/converted"),
            "avif",
        );
        assert_eq!(out, PathBuf::from("/converted/pic.avif"));
    }
}
