//! Wiring between the reconciliation engine, the scheduler and the health
//! tracker: what runs at startup, on demand and periodically.

use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::config::{InventoryConfig, PollIntervals};
use crate::health::HealthTracker;
use crate::openstack::RemoteInventory;
use crate::reconcile::{PassOutcome, Reconciler, ResourceKind};
use crate::scheduler::{Every, ScheduleError, Scheduler};

pub const SNAPSHOT_TASK: &str = "snapshot";
pub const CLEANUP_TASK: &str = "cleanup";
/// Deployment label of tasks spanning the whole store.
pub const ALL_DEPLOYMENTS: &str = "*";

pub struct TaskContext<R> {
    pub reconciler: Reconciler<R>,
    pub health: HealthTracker,
    deployments: Vec<String>,
}

impl<R> Clone for TaskContext<R> {
    fn clone(&self) -> Self {
        Self {
            reconciler: self.reconciler.clone(),
            health: self.health.clone(),
            deployments: self.deployments.clone(),
        }
    }
}

impl<R: RemoteInventory> TaskContext<R> {
    pub fn new(reconciler: Reconciler<R>, health: HealthTracker, deployments: Vec<String>) -> Self {
        Self {
            reconciler,
            health,
            deployments,
        }
    }

    pub fn deployments(&self) -> &[String] {
        &self.deployments
    }

    pub async fn run_kind(&self, deployment: &str, kind: ResourceKind) -> PassOutcome {
        let started = Instant::now();
        let outcome = self.reconciler.reconcile(deployment, kind).await;
        self.health
            .record(deployment, kind.as_str(), started, outcome.clone());
        outcome
    }

    pub fn run_snapshot(&self, deployment: &str) -> PassOutcome {
        let started = Instant::now();
        let outcome = match self.reconciler.usage_snapshot(deployment) {
            Ok(snapshot) => {
                debug!(deployment, id = %snapshot.id, "usage snapshot stored");
                PassOutcome::Applied { upserted: 1, deleted: 0 }
            }
            Err(e) => {
                error!(deployment, error = %e, "unable to store usage snapshot");
                PassOutcome::Skipped { reason: e.to_string() }
            }
        };
        self.health
            .record(deployment, SNAPSHOT_TASK, started, outcome.clone());
        outcome
    }

    /// Drops namespaces of deployments no longer configured.
    pub fn run_cleanup(&self) -> Vec<String> {
        let started = Instant::now();
        let dropped = self.reconciler.cleanup_namespaces(&self.deployments);
        self.health.record(
            ALL_DEPLOYMENTS,
            CLEANUP_TASK,
            started,
            PassOutcome::Applied { upserted: 0, deleted: dropped.len() },
        );
        dropped
    }

    /// Every kind in dependency order, then namespace cleanup.
    pub async fn update_deployment(&self, deployment: &str) {
        info!(deployment, "updating deployment");
        let started = Instant::now();
        for kind in ResourceKind::UPDATE_ORDER {
            self.run_kind(deployment, kind).await;
        }
        self.run_cleanup();
        debug!(deployment, elapsed_ms = started.elapsed().as_millis() as u64, "deployment updated");
    }

    /// Startup pass: full update plus the first usage snapshot.
    pub async fn bootstrap(&self, deployment: &str) {
        info!(deployment, "bootstrapping deployment");
        let started = Instant::now();
        for kind in ResourceKind::UPDATE_ORDER {
            self.run_kind(deployment, kind).await;
        }
        self.run_snapshot(deployment);
        self.run_cleanup();
        info!(deployment, elapsed_ms = started.elapsed().as_millis() as u64, "deployment bootstrapped");
    }

    /// Per-kind polls and the daily snapshot for every deployment, plus the
    /// global cleanup.
    pub fn register(&self, scheduler: &mut Scheduler, cfg: &InventoryConfig) -> Result<(), ScheduleError> {
        for deployment in &self.deployments {
            for kind in ResourceKind::UPDATE_ORDER {
                let ctx = self.clone();
                let dep = deployment.clone();
                scheduler.schedule(
                    format!("{deployment}/{kind}"),
                    Every::Interval(poll_interval(&cfg.poll_interval, kind)),
                    move || {
                        let ctx = ctx.clone();
                        let dep = dep.clone();
                        async move {
                            ctx.run_kind(&dep, kind).await;
                        }
                    },
                )?;
            }

            let ctx = self.clone();
            let dep = deployment.clone();
            scheduler.schedule(
                format!("{deployment}/{SNAPSHOT_TASK}"),
                Every::DailyAt {
                    hour: cfg.snapshot_at.hour,
                    minute: cfg.snapshot_at.minute,
                },
                move || {
                    let ctx = ctx.clone();
                    let dep = dep.clone();
                    async move {
                        ctx.run_snapshot(&dep);
                    }
                },
            )?;
        }

        let ctx = self.clone();
        scheduler.schedule(CLEANUP_TASK, Every::Interval(cfg.cleanup_interval), move || {
            let ctx = ctx.clone();
            async move {
                ctx.run_cleanup();
            }
        })?;
        Ok(())
    }
}

pub fn poll_interval(intervals: &PollIntervals, kind: ResourceKind) -> Duration {
    match kind {
        ResourceKind::Projects => intervals.projects,
        ResourceKind::Images => intervals.images,
        ResourceKind::Flavors => intervals.flavors,
        ResourceKind::Aggregates => intervals.aggregates,
        ResourceKind::Hypervisors => intervals.hypervisors,
        ResourceKind::Instances => intervals.instances,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_interval_per_kind() {
        let intervals = PollIntervals::default();
        assert_eq!(poll_interval(&intervals, ResourceKind::Instances), Duration::from_secs(300));
        assert_eq!(poll_interval(&intervals, ResourceKind::Flavors), Duration::from_secs(3600));
    }
}
