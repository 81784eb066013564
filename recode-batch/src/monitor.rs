//! System resource monitor
//!
//! Samples memory usage on a fixed interval and feeds the readings to
//! registered callbacks (the concurrency controller hooks in here).
//! Threshold crossings are published as pressure events; a failed sample is
//! logged and skipped, never fatal.

use recode_common::events::{BatchEvent, EventBus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Callback invoked with (usage fraction, available bytes) on every sample
pub type MemoryCallback = Box<dyn Fn(f64, u64) + Send + Sync>;

/// One memory reading
#[derive(Debug, Clone, Copy, Default)]
pub struct MemorySample {
    /// Used fraction of physical memory, in [0,1]
    pub usage: f64,
    pub available_bytes: u64,
    pub total_bytes: u64,
}

struct MonitorInner {
    // f64 bits stored atomically so readers never block the sampler
    current_usage: AtomicU64,
    peak_usage: AtomicU64,
    available_bytes: AtomicU64,
    callbacks: RwLock<Vec<MemoryCallback>>,
    warning_threshold: f64,
    critical_threshold: f64,
    // last sample's zone: 0 = normal, 1 = warning, 2 = critical
    last_zone: AtomicU64,
    events: EventBus,
}

/// Samples system memory and emits pressure signals
#[derive(Clone)]
pub struct ResourceMonitor {
    inner: Arc<MonitorInner>,
    sample_interval: Duration,
}

impl ResourceMonitor {
    pub fn new(
        sample_interval: Duration,
        warning_threshold: f64,
        critical_threshold: f64,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                current_usage: AtomicU64::new(0),
                peak_usage: AtomicU64::new(0),
                available_bytes: AtomicU64::new(u64::MAX),
                callbacks: RwLock::new(Vec::new()),
                warning_threshold,
                critical_threshold,
                last_zone: AtomicU64::new(0),
                events,
            }),
            sample_interval,
        }
    }

    /// Register a callback fired after every sample
    pub fn register_callback(&self, callback: MemoryCallback) {
        self.inner
            .callbacks
            .write()
            .expect("monitor callbacks poisoned")
            .push(callback);
    }

    /// Most recent usage fraction (0.0 before the first sample)
    pub fn current_usage(&self) -> f64 {
        f64::from_bits(self.inner.current_usage.load(Ordering::Relaxed))
    }

    /// Highest usage fraction seen so far
    pub fn peak_usage(&self) -> f64 {
        f64::from_bits(self.inner.peak_usage.load(Ordering::Relaxed))
    }

    pub fn available_bytes(&self) -> u64 {
        self.inner.available_bytes.load(Ordering::Relaxed)
    }

    /// Feed one reading through the monitor
    ///
    /// Public so the sampling loop and simulation tests share one path.
    pub fn record_sample(&self, sample: MemorySample) {
        let inner = &self.inner;
        inner
            .current_usage
            .store(sample.usage.to_bits(), Ordering::Relaxed);
        inner
            .available_bytes
            .store(sample.available_bytes, Ordering::Relaxed);

        let peak = f64::from_bits(inner.peak_usage.load(Ordering::Relaxed));
        if sample.usage > peak {
            inner
                .peak_usage
                .store(sample.usage.to_bits(), Ordering::Relaxed);
        }

        let zone = if sample.usage > inner.critical_threshold {
            2
        } else if sample.usage > inner.warning_threshold {
            1
        } else {
            0
        };
        let last_zone = inner.last_zone.swap(zone, Ordering::Relaxed);
        if zone > last_zone {
            warn!(
                usage = sample.usage,
                critical = zone == 2,
                "memory pressure threshold crossed"
            );
            inner.events.publish(BatchEvent::MemoryPressure {
                usage: sample.usage,
                critical: zone == 2,
                timestamp: chrono::Utc::now(),
            });
        }

        let callbacks = inner.callbacks.read().expect("monitor callbacks poisoned");
        for callback in callbacks.iter() {
            callback(sample.usage, sample.available_bytes);
        }
    }

    /// Run the sampling loop until cancelled
    pub fn spawn(&self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.sample_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("resource monitor stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        match read_system_memory() {
                            Some(sample) => monitor.record_sample(sample),
                            None => debug!("memory sample unavailable on this platform"),
                        }
                    }
                }
            }
        })
    }
}

/// Read current physical memory usage
///
/// Linux reads /proc/meminfo; other platforms report the sample as
/// unavailable and the monitor keeps running without pressure signals.
pub fn read_system_memory() -> Option<MemorySample> {
    #[cfg(target_os = "linux")]
    {
        let content = std::fs::read_to_string("/proc/meminfo").ok()?;
        let mut total_kb: Option<u64> = None;
        let mut available_kb: Option<u64> = None;
        for line in content.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                total_kb = rest.trim().split_whitespace().next()?.parse().ok();
            } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
                available_kb = rest.trim().split_whitespace().next()?.parse().ok();
            }
            if total_kb.is_some() && available_kb.is_some() {
                break;
            }
        }
        let total = total_kb? * 1024;
        let available = available_kb? * 1024;
        if total == 0 {
            return None;
        }
        return Some(MemorySample {
            usage: 1.0 - (available as f64 / total as f64),
            available_bytes: available,
            total_bytes: total,
        });
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
