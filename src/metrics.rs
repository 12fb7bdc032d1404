//! Pipeline instrumentation.
//!
//! Counters for batch-write outcomes and dropped spans, plus a rolling
//! capacity-usage gauge for the span queue. Collectors live in the
//! default prometheus registry; registration failure at first use is a
//! fatal start-up error.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter, register_int_counter_vec,
    Gauge, GaugeVec, HistogramVec, IntCounter, IntCounterVec,
};

use crate::config;

static SPAN_WRITES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "span_batch_writes_total",
        "Outcomes of Cloud Trace batchWrite calls.",
        &["outcome"]
    )
    .unwrap_or_else(|err| config::fatal(&format!("can't register span write counter: {err}")))
});

static SPAN_WRITE_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "span_batch_write_seconds",
        "Latency of Cloud Trace batchWrite calls.",
        &["outcome"]
    )
    .unwrap_or_else(|err| config::fatal(&format!("can't register span write histogram: {err}")))
});

static SPAN_DROPS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "spans_dropped_total",
        "Finished spans dropped because the span queue was full."
    )
    .unwrap_or_else(|err| config::fatal(&format!("can't register span drop counter: {err}")))
});

static QUEUE_USAGE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "span_queue_capacity_usage",
        "Peak fraction of queue capacity in use over the last minute.",
        &["queue"]
    )
    .unwrap_or_else(|err| config::fatal(&format!("can't monitor span queue capacity: {err}")))
});

/// Records the outcome and latency of one `batchWrite` call.
pub(crate) fn span_created(elapsed: Duration, outcome: &str) {
    SPAN_WRITES.with_label_values(&[outcome]).inc();
    SPAN_WRITE_SECONDS
        .with_label_values(&[outcome])
        .observe(elapsed.as_secs_f64());
}

pub(crate) fn span_dropped() {
    SPAN_DROPS.inc();
}

/// Total spans dropped on queue overflow since process start.
pub fn dropped_count() -> u64 {
    SPAN_DROPS.get()
}

const WINDOW_SLOTS: usize = 6;
const SLOT_DUR: Duration = Duration::from_secs(10);

/// Rolling peak-usage tracker for one bounded queue.
///
/// Usage is recorded on every dequeue; the exposed gauge holds the peak
/// `depth / capacity` seen over the last minute (six 10-second buckets).
pub(crate) struct CapacityUsage {
    capacity: f64,
    gauge: Gauge,
    window: Mutex<Window>,
}

struct Window {
    slots: [f64; WINDOW_SLOTS],
    current: usize,
    rolled: Instant,
}

impl CapacityUsage {
    pub(crate) fn new(capacity: usize, queue: &str, prefix: &str) -> CapacityUsage {
        let label = format!("{prefix}{queue}");
        CapacityUsage {
            capacity: capacity.max(1) as f64,
            gauge: QUEUE_USAGE.with_label_values(&[label.as_str()]),
            window: Mutex::new(Window {
                slots: [0.0; WINDOW_SLOTS],
                current: 0,
                rolled: Instant::now(),
            }),
        }
    }

    pub(crate) fn record(&self, depth: usize) {
        let used = depth as f64 / self.capacity;
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        let stale = (window.rolled.elapsed().as_secs() / SLOT_DUR.as_secs()) as usize;
        if stale > 0 {
            for _ in 0..stale.min(WINDOW_SLOTS) {
                window.current = (window.current + 1) % WINDOW_SLOTS;
                let slot = window.current;
                window.slots[slot] = 0.0;
            }
            window.rolled = Instant::now();
        }
        let slot = window.current;
        window.slots[slot] = window.slots[slot].max(used);
        let peak = window.slots.iter().copied().fold(0.0, f64::max);
        self.gauge.set(peak);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_usage_tracks_peak() {
        let usage = CapacityUsage::new(10, "test-queue", "capacity-usage-peak-");
        usage.record(2);
        usage.record(7);
        usage.record(1);
        assert!((usage.gauge.get() - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn capacity_usage_forgets_after_window() {
        let usage = CapacityUsage::new(10, "test-queue", "capacity-usage-window-");
        usage.record(9);
        let Some(past) = Instant::now().checked_sub(Duration::from_secs(70)) else {
            return;
        };
        {
            let mut window = usage.window.lock().unwrap();
            // Pretend more than a minute passed since the last roll.
            window.rolled = past;
        }
        usage.record(1);
        assert!((usage.gauge.get() - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn drop_counter_accumulates() {
        let before = dropped_count();
        span_dropped();
        span_dropped();
        assert!(dropped_count() >= before + 2);
    }
}
