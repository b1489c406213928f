//! Lightweight in-memory execution metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

#[derive(Default)]
struct PlanMetrics {
    total: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    pagination_probes: AtomicU64,
    pagination_skipped: AtomicU64,
    rows_returned: AtomicU64,
    duration_total_ms: AtomicU64,
    duration_max_ms: AtomicU64,
}

static PLAN_METRICS: OnceLock<PlanMetrics> = OnceLock::new();

fn metrics() -> &'static PlanMetrics {
    PLAN_METRICS.get_or_init(PlanMetrics::default)
}

/// Records one finished plan execution.
pub fn record_plan(duration_ms: f64, rows: usize, success: bool) {
    let elapsed = duration_ms.max(0.0) as u64;
    let m = metrics();
    m.total.fetch_add(1, Ordering::Relaxed);
    if success {
        m.rows_returned.fetch_add(rows as u64, Ordering::Relaxed);
    } else {
        m.failed.fetch_add(1, Ordering::Relaxed);
    }
    m.duration_total_ms.fetch_add(elapsed, Ordering::Relaxed);
    m.duration_max_ms.fetch_max(elapsed, Ordering::Relaxed);
}

pub fn record_timeout() {
    metrics().timeouts.fetch_add(1, Ordering::Relaxed);
}

/// A primary-key probe query was issued for pagination.
pub fn record_pagination_probe() {
    metrics().pagination_probes.fetch_add(1, Ordering::Relaxed);
}

/// Pagination was requested but fell back to in-memory windowing.
pub fn record_pagination_skipped() {
    metrics().pagination_skipped.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Serialize)]
pub struct PlanMetricsSnapshot {
    pub total: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub pagination_probes: u64,
    pub pagination_skipped: u64,
    pub rows_returned: u64,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<u64>,
}

pub fn snapshot() -> PlanMetricsSnapshot {
    let m = metrics();
    let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
    let total = load(&m.total);
    let max_ms = load(&m.duration_max_ms);

    PlanMetricsSnapshot {
        total,
        failed: load(&m.failed),
        timeouts: load(&m.timeouts),
        pagination_probes: load(&m.pagination_probes),
        pagination_skipped: load(&m.pagination_skipped),
        rows_returned: load(&m.rows_returned),
        avg_ms: (total > 0).then(|| load(&m.duration_total_ms) as f64 / total as f64),
        max_ms: (max_ms > 0).then_some(max_ms),
    }
}
