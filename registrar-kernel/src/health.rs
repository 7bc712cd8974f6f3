use crate::reconcile::CycleReport;
use crate::store::RegistryStore;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;

#[derive(Debug, Serialize)]
pub struct RegistrarHealth {
    pub uptime_seconds: u64,
    pub registered: usize,
    pub pending: usize,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_cycle_at: Option<OffsetDateTime>,
    pub last_cycle_error: Option<String>,
    pub last_report: Option<CycleReport>,
}

#[derive(Debug, Default)]
struct CycleStats {
    completed: u64,
    failed: u64,
    last_at: Option<OffsetDateTime>,
    last_error: Option<String>,
    last_report: Option<CycleReport>,
}

/// Outcome of the reconciliation cycles, shared with the `/health` handler.
#[derive(Clone)]
pub struct CycleTracker {
    start_time: Instant,
    stats: Arc<Mutex<CycleStats>>,
}

impl CycleTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            stats: Arc::new(Mutex::new(CycleStats::default())),
        }
    }

    pub fn record_success(&self, report: CycleReport) {
        let mut stats = self.stats.lock();
        stats.completed += 1;
        stats.last_at = Some(OffsetDateTime::now_utc());
        stats.last_error = None;
        stats.last_report = Some(report);
    }

    /// A cycle aborted before merging anything, typically the inventory listing failed.
    pub fn record_failure(&self, error: String) {
        let mut stats = self.stats.lock();
        stats.failed += 1;
        stats.last_at = Some(OffsetDateTime::now_utc());
        stats.last_error = Some(error);
    }

    pub fn get_health(&self, store: &RegistryStore) -> RegistrarHealth {
        let stats = self.stats.lock();
        RegistrarHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            registered: store.all_registered().len(),
            pending: store.all_pending().len(),
            cycles_completed: stats.completed,
            cycles_failed: stats.failed,
            last_cycle_at: stats.last_at,
            last_cycle_error: stats.last_error.clone(),
            last_report: stats.last_report.clone(),
        }
    }
}
