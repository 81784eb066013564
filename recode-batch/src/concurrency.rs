//! Adaptive concurrency controller
//!
//! Sizes the worker pool from CPU count, per-format file complexity, and
//! live memory pressure. The pool itself never resizes mid-task; workers
//! consult [`ConcurrencyController::current_workers`] at task boundaries.
//!
//! Controller failures never halt the pipeline: on any error the current
//! worker count stays as it is, and a floor of one worker is guaranteed.

use crate::monitor::ResourceMonitor;
use recode_common::events::{BatchEvent, EventBus};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-format processing complexity, 1 (trivial) to 10 (heaviest)
pub fn file_complexity(format: &str) -> u32 {
    match format {
        "jpeg" | "jpg" => 3,
        "png" => 4,
        "webp" => 5,
        "gif" => 6,
        "mov" => 6,
        "heif" | "heic" => 7,
        "mp4" => 7,
        "avif" => 8,
        "jxl" => 9,
        _ => 5,
    }
}

/// Pool lifecycle phase, re-entered on every adjustment tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolPhase {
    Idle,
    Scaling(String),
    Stable,
}

/// What an adaptive rule does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    ReduceConcurrency,
    IncreaseConcurrency,
}

/// One adaptive rule, evaluated in priority order each tick
#[derive(Debug, Clone)]
pub struct AdaptiveRule {
    pub name: &'static str,
    pub action: RuleAction,
    pub threshold: f64,
    pub priority: u32,
    pub enabled: bool,
    pub condition: fn(&PerfSnapshot, f64) -> bool,
}

/// Performance view the rules are evaluated against
#[derive(Debug, Clone, Copy, Default)]
pub struct PerfSnapshot {
    pub memory_usage: f64,
    /// Failure fraction over the rolling outcome window
    pub error_rate: f64,
    /// Completed files per second over the rolling window
    pub throughput: f64,
}

/// Mutable controller state, guarded by one lock
#[derive(Debug)]
pub struct ConcurrencyState {
    pub current: usize,
    pub min: usize,
    pub max: usize,
    pub phase: PoolPhase,
    pub last_reason: String,
    pub last_adjusted: Option<Instant>,
    pub total_adjustments: u64,
    pub adjustment_reasons: HashMap<String, u64>,
    pub peak: usize,
    complexity_history: VecDeque<f64>,
    outcomes: VecDeque<(Instant, bool)>,
}

/// Snapshot of the counters for reporting
#[derive(Debug, Clone)]
pub struct ConcurrencySnapshot {
    pub current: usize,
    pub min: usize,
    pub max: usize,
    pub peak: usize,
    pub total_adjustments: u64,
    pub adjustment_reasons: HashMap<String, u64>,
    /// Mean complexity over the recent file window (0 when idle)
    pub avg_complexity: f64,
}

/// Sizes the worker pool from resource signals and file complexity
pub struct ConcurrencyController {
    state: Mutex<ConcurrencyState>,
    monitor: ResourceMonitor,
    rules: Vec<AdaptiveRule>,
    baseline: usize,
    memory_threshold: f64,
    adjust_interval: Duration,
    events: EventBus,
}

impl ConcurrencyController {
    pub fn new(
        min: usize,
        max: usize,
        memory_threshold: f64,
        adjust_interval: Duration,
        rule_thresholds: (f64, f64, f64),
        monitor: ResourceMonitor,
        events: EventBus,
    ) -> Self {
        let baseline = num_cpus::get().max(1);
        let max = if max == 0 { baseline * 2 } else { max };
        let min = min.max(1).min(max);
        let initial = (baseline / 2).clamp(min, max);

        let (mem_rule, err_rule, tput_rule) = rule_thresholds;
        let rules = vec![
            AdaptiveRule {
                name: "memory_usage",
                action: RuleAction::ReduceConcurrency,
                threshold: mem_rule,
                priority: 1,
                enabled: true,
                condition: |perf, threshold| perf.memory_usage > threshold,
            },
            AdaptiveRule {
                name: "error_rate",
                action: RuleAction::ReduceConcurrency,
                threshold: err_rule,
                priority: 2,
                enabled: true,
                condition: |perf, threshold| perf.error_rate > threshold,
            },
            AdaptiveRule {
                name: "throughput",
                action: RuleAction::IncreaseConcurrency,
                threshold: tput_rule,
                priority: 3,
                enabled: true,
                condition: |perf, threshold| perf.throughput > 0.0 && perf.throughput < threshold,
            },
        ];

        info!(
            baseline,
            min, max, initial, memory_threshold, "concurrency controller initialized"
        );

        Self {
            state: Mutex::new(ConcurrencyState {
                current: initial,
                min,
                max,
                phase: PoolPhase::Idle,
                last_reason: String::new(),
                last_adjusted: None,
                total_adjustments: 0,
                adjustment_reasons: HashMap::new(),
                peak: initial,
                complexity_history: VecDeque::with_capacity(100),
                outcomes: VecDeque::with_capacity(256),
            }),
            monitor,
            rules,
            baseline,
            memory_threshold,
            adjust_interval,
            events,
        }
    }

    /// Current target worker count, read by workers at task boundaries
    pub fn current_workers(&self) -> usize {
        self.state.lock().map(|s| s.current).unwrap_or(1).max(1)
    }

    /// Recompute the target worker count for a file of the given complexity
    pub fn adjust_concurrency(&self, reason: &str, complexity: u32) -> usize {
        let usage = self.monitor.current_usage();
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(_) => return 1,
        };

        state.complexity_history.push_back(complexity as f64);
        if state.complexity_history.len() > 100 {
            state.complexity_history.pop_front();
        }

        let target = Self::optimal_workers(self.baseline, complexity, usage, state.max);
        Self::apply(&mut state, target, reason, &self.events);
        state.current
    }

    /// optimal = cores x complexity factor x memory factor, clamped
    ///
    /// Complexity lowers concurrency linearly; memory pressure above 70%
    /// reduces it further; trivial file classes burst to twice the cores.
    fn optimal_workers(baseline: usize, complexity: u32, memory_usage: f64, max: usize) -> usize {
        let complexity_factor = 1.0 - ((complexity.max(1) - 1) as f64 * 0.1);
        let memory_factor = if memory_usage > 0.7 {
            (1.0 - (memory_usage - 0.7) * 2.0).max(0.0)
        } else {
            1.0
        };

        let mut optimal = (baseline as f64 * complexity_factor * memory_factor) as usize;

        if complexity <= 3 && memory_usage <= 0.7 {
            optimal = (baseline * 2).min(max);
        }

        optimal
    }

    fn apply(state: &mut ConcurrencyState, target: usize, reason: &str, events: &EventBus) {
        let clamped = target.clamp(state.min, state.max).max(1);
        if clamped == state.current {
            state.phase = PoolPhase::Stable;
            return;
        }

        let old = state.current;
        state.phase = PoolPhase::Scaling(reason.to_string());
        state.current = clamped;
        state.total_adjustments += 1;
        *state
            .adjustment_reasons
            .entry(reason.to_string())
            .or_insert(0) += 1;
        state.last_reason = reason.to_string();
        state.last_adjusted = Some(Instant::now());
        if clamped > state.peak {
            state.peak = clamped;
        }

        info!(reason, old_workers = old, new_workers = clamped, "concurrency adjusted");
        events.publish(BatchEvent::ConcurrencyAdjusted {
            reason: reason.to_string(),
            old_workers: old,
            new_workers: clamped,
            timestamp: chrono::Utc::now(),
        });
        state.phase = PoolPhase::Stable;
    }

    /// Feed one task outcome into the rolling performance window
    pub fn record_outcome(&self, success: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.outcomes.push_back((Instant::now(), success));
            while state.outcomes.len() > 256 {
                state.outcomes.pop_front();
            }
        }
    }

    /// Performance over the last 60 seconds of outcomes
    pub fn perf_snapshot(&self) -> PerfSnapshot {
        let memory_usage = self.monitor.current_usage();
        let state = match self.state.lock() {
            Ok(s) => s,
            Err(_) => return PerfSnapshot { memory_usage, ..Default::default() },
        };

        let window = Duration::from_secs(60);
        let now = Instant::now();
        let recent: Vec<bool> = state
            .outcomes
            .iter()
            .filter(|(t, _)| now.duration_since(*t) < window)
            .map(|(_, ok)| *ok)
            .collect();

        if recent.is_empty() {
            return PerfSnapshot { memory_usage, ..Default::default() };
        }

        let failures = recent.iter().filter(|ok| !**ok).count();
        PerfSnapshot {
            memory_usage,
            error_rate: failures as f64 / recent.len() as f64,
            throughput: recent.len() as f64 / window.as_secs_f64(),
        }
    }

    /// Evaluate adaptive rules; only the first matching enabled rule fires
    pub fn evaluate_rules(&self) {
        let perf = self.perf_snapshot();

        let mut rules: Vec<&AdaptiveRule> = self.rules.iter().filter(|r| r.enabled).collect();
        rules.sort_by_key(|r| r.priority);

        for rule in rules {
            if (rule.condition)(&perf, rule.threshold) {
                debug!(rule = rule.name, ?perf, "adaptive rule fired");
                match rule.action {
                    RuleAction::ReduceConcurrency => self.step_down(rule.name),
                    RuleAction::IncreaseConcurrency => self.step_up(rule.name),
                }
                // one adjustment per tick, never two conflicting ones
                break;
            }
        }
    }

    fn step_down(&self, reason: &str) {
        if let Ok(mut state) = self.state.lock() {
            let target = (state.current * 3 / 4).max(state.min);
            Self::apply(&mut state, target, reason, &self.events);
        }
    }

    fn step_up(&self, reason: &str) {
        if let Ok(mut state) = self.state.lock() {
            let target = (state.current + 1).min(state.max);
            Self::apply(&mut state, target, reason, &self.events);
        }
    }

    /// Hook the controller into the memory monitor
    ///
    /// The callback forces a downward adjustment whenever usage exceeds the
    /// controller's memory threshold.
    pub fn attach_to_monitor(self: &Arc<Self>, monitor: &ResourceMonitor) {
        let controller = Arc::downgrade(self);
        let threshold = self.memory_threshold;
        monitor.register_callback(Box::new(move |usage, _available| {
            if usage > threshold {
                if let Some(controller) = controller.upgrade() {
                    controller.step_down("memory_pressure");
                }
            }
        }));
    }

    /// Run the re-scaling tick until cancelled
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let interval_duration = self.adjust_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            // the first tick completes immediately; skip it
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("concurrency controller stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        self.evaluate_rules();
                    }
                }
            }
        })
    }

    pub fn snapshot(&self) -> ConcurrencySnapshot {
        match self.state.lock() {
            Ok(state) => {
                let avg_complexity = if state.complexity_history.is_empty() {
                    0.0
                } else {
                    state.complexity_history.iter().sum::<f64>()
                        / state.complexity_history.len() as f64
                };
                ConcurrencySnapshot {
                    current: state.current,
                    min: state.min,
                    max: state.max,
                    peak: state.peak,
                    total_adjustments: state.total_adjustments,
                    adjustment_reasons: state.adjustment_reasons.clone(),
                    avg_complexity,
                }
            }
            Err(_) => {
                warn!("concurrency state lock poisoned, reporting floor");
                ConcurrencySnapshot {
                    current: 1,
                    min: 1,
                    max: 1,
                    peak: 1,
                    total_adjustments: 0,
                    adjustment_reasons: HashMap::new(),
                    avg_complexity: 0.0,
                }
            }
        }
    }
}
