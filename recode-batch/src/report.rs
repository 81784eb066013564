//! Final batch report
//!
//! Accumulated by the coordinator as tasks finish and rendered once at the
//! end of the run. Nothing here is persisted; the durable truth lives in
//! the knowledge database.

use crate::knowledge::StatsSummary;

#[derive(Debug, Clone)]
pub struct TaskSuccess {
    pub file_path: String,
    pub original_size: i64,
    pub new_size: i64,
    pub saving_bytes: i64,
    pub rule: String,
    pub retries: u32,
}

#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub file_path: String,
    /// Last error message after all retries
    pub error: String,
    pub retries: u32,
}

#[derive(Debug, Clone)]
pub struct TaskSkip {
    pub file_path: String,
    pub reason: String,
}

/// Everything the operator sees when the batch ends
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub session_id: String,
    pub successes: Vec<TaskSuccess>,
    pub failures: Vec<TaskFailure>,
    pub skips: Vec<TaskSkip>,
    /// Files interrupted mid-task; a resumed run picks these up again
    pub cancelled: Vec<String>,
}

impl BatchReport {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            ..Self::default()
        }
    }

    pub fn total_saving_bytes(&self) -> i64 {
        self.successes.iter().map(|s| s.saving_bytes).sum()
    }

    pub fn total_original_bytes(&self) -> i64 {
        self.successes.iter().map(|s| s.original_size).sum()
    }

    /// Render the human-readable summary printed at the end of a run
    pub fn render(&self, knowledge: Option<&StatsSummary>) -> String {
        let mut out = String::new();
        let saved = self.total_saving_bytes();
        let before = self.total_original_bytes();
        let pct = if before > 0 {
            100.0 * saved as f64 / before as f64
        } else {
            0.0
        };

        out.push_str(&format!("session {}\n", self.session_id));
        out.push_str(&format!(
            "  converted: {}  failed: {}  skipped: {}\n",
            self.successes.len(),
            self.failures.len(),
            self.skips.len()
        ));
        out.push_str(&format!(
            "  saved {} ({:.1}% of {})\n",
            human_bytes(saved),
            pct,
            human_bytes(before)
        ));

        if !self.cancelled.is_empty() {
            out.push_str(&format!(
                "  interrupted: {} file(s) left for the next run\n",
                self.cancelled.len()
            ));
        }

        if !self.failures.is_empty() {
            out.push_str("  failures:\n");
            for failure in &self.failures {
                out.push_str(&format!(
                    "    {} ({} retries): {}\n",
                    failure.file_path, failure.retries, failure.error
                ));
            }
        }

        if let Some(stats) = knowledge {
            out.push_str(&format!(
                "  knowledge: {} conversions, avg saving {:.1}%, pass rate {:.1}%\n",
                stats.total_conversions, stats.avg_saving_percent, stats.quality_pass_rate
            ));
        }

        out
    }
}

fn human_bytes(bytes: i64) -> String {
    let negative = bytes < 0;
    let mut value = bytes.unsigned_abs() as f64;
    let mut unit = "B";
    for next in ["KiB", "MiB", "GiB", "TiB"] {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    let sign = if negative { "-" } else { "" };
    if unit == "B" {
        format!("{}{:.0} {}", sign, value, unit)
    } else {
        format!("{}{:.1} {}", sign, value, unit)
    }
}
