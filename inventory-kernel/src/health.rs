use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::reconcile::PassOutcome;
use crate::store::{Store, StoreStats};

/// Last run of one task of one deployment.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub deployment: String,
    pub task: String,
    pub finished_at: String,
    pub elapsed_ms: u64,
    #[serde(flatten)]
    pub outcome: PassOutcome,
}

#[derive(Debug, Serialize)]
pub struct InventoryHealth {
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub datastore: StoreStats,
    pub tasks: Vec<TaskReport>,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    runs: Arc<Mutex<BTreeMap<(String, String), TaskReport>>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            runs: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Remembers the outcome of a run that began at `started`.
    pub fn record(&self, deployment: &str, task: &str, started: Instant, outcome: PassOutcome) {
        let report = TaskReport {
            deployment: deployment.to_string(),
            task: task.to_string(),
            finished_at: OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            outcome,
        };
        self.runs
            .lock()
            .insert((deployment.to_string(), task.to_string()), report);
    }

    pub fn last_run(&self, deployment: &str, task: &str) -> Option<TaskReport> {
        self.runs
            .lock()
            .get(&(deployment.to_string(), task.to_string()))
            .cloned()
    }

    pub fn get_health(&self, store: &Store) -> InventoryHealth {
        InventoryHealth {
            status: "alive",
            uptime_seconds: self.start_time.elapsed().as_secs(),
            datastore: store.stats(),
            tasks: self.runs.lock().values().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_keeps_last_outcome_per_task() {
        let tracker = HealthTracker::new();
        let started = Instant::now();
        tracker.record("lab", "images", started, PassOutcome::Applied { upserted: 3, deleted: 0 });
        tracker.record(
            "lab",
            "images",
            started,
            PassOutcome::Skipped { reason: "unavailable".into() },
        );
        tracker.record("lab", "flavors", started, PassOutcome::Applied { upserted: 1, deleted: 1 });

        let last = tracker.last_run("lab", "images").unwrap();
        assert!(!last.outcome.is_applied());
        assert!(tracker.last_run("lab", "projects").is_none());

        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("h.redb")).unwrap();
        let health = tracker.get_health(&store);
        assert_eq!(health.status, "alive");
        assert_eq!(health.tasks.len(), 2);

        let json = serde_json::to_value(&health.tasks[1]).unwrap();
        assert_eq!(json["task"], "images");
        assert_eq!(json["result"], "skipped");
    }
}
