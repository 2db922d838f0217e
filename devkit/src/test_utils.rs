/*!
Test harness for the inventory engine

Bundles a temporary store, a fake cloud and a reconciler running on a fixed
clock, so that poll times and snapshot dates are deterministic.
*/

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tempfile::TempDir;
use time::macros::datetime;
use time::OffsetDateTime;

use inventory_kernel::config::{parse_config, InventoryConfig};
use inventory_kernel::health::HealthTracker;
use inventory_kernel::http::AppState;
use inventory_kernel::query::Inventory;
use inventory_kernel::reconcile::Reconciler;
use inventory_kernel::store::Store;
use inventory_kernel::tasks::TaskContext;

use crate::fake_cloud::{CloudData, FakeCloud};

/// Instant every harness reconciler believes it is.
pub const FIXED_NOW: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);

pub fn fixed_clock() -> OffsetDateTime {
    FIXED_NOW
}

/// Routes tracing output through the test writer. Safe to call repeatedly.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

pub struct TestHarness {
    pub cloud: Arc<FakeCloud>,
    pub store: Store,
    pub reconciler: Reconciler<FakeCloud>,
    pub health: HealthTracker,
    /// Deployments passed to the updater of [`TestHarness::app_state`].
    pub triggered: Arc<Mutex<Vec<String>>>,
    dir: TempDir,
}

impl TestHarness {
    pub fn new() -> Result<Self> {
        init_tracing();
        let dir = tempfile::tempdir()?;
        let store = Store::open(dir.path().join("inventory.redb"))?;
        let cloud = Arc::new(FakeCloud::new());
        let reconciler = Reconciler::new(store.clone(), cloud.clone()).with_clock(fixed_clock);

        Ok(Self {
            cloud,
            store,
            reconciler,
            health: HealthTracker::new(),
            triggered: Arc::new(Mutex::new(Vec::new())),
            dir,
        })
    }

    /// Adds (or replaces) a deployment on the fake cloud.
    pub fn with_deployment(self, name: &str, data: CloudData) -> Self {
        self.cloud.set(name, data);
        self
    }

    pub fn inventory(&self, deployment: &str) -> Inventory {
        Inventory::new(&self.store, deployment)
    }

    /// Task wiring for the given configured deployments.
    pub fn tasks(&self, deployments: &[&str]) -> TaskContext<FakeCloud> {
        TaskContext::new(
            self.reconciler.clone(),
            self.health.clone(),
            deployments.iter().map(|d| d.to_string()).collect(),
        )
    }

    /// Full startup pass for one deployment.
    pub async fn bootstrap(&self, deployment: &str) {
        self.tasks(&[deployment]).bootstrap(deployment).await;
    }

    /// Valid configuration registering `deployments`, stored next to the
    /// harness database.
    pub fn config(&self, deployments: &[&str], api_key: Option<&str>) -> Result<InventoryConfig> {
        let mut yaml = format!(
            "listen_on: \"127.0.0.1:0\"\ndatabase: {}\ndeployments:\n",
            self.dir.path().join("inventory.redb").display()
        );
        if deployments.is_empty() {
            yaml = yaml.replace("deployments:\n", "deployments: {}\n");
        }
        for name in deployments {
            yaml.push_str(&format!(
                "  {name}:\n    os_auth_url: http://keystone.invalid:5000/v3\n    os_project_name: admin\n    os_username: admin\n    os_password: secret\n"
            ));
        }
        Ok(parse_config(&yaml, api_key.map(str::to_string))?)
    }

    /// API state whose updater only records the requested deployment.
    pub fn app_state(&self, cfg: InventoryConfig) -> AppState {
        let triggered = self.triggered.clone();
        AppState {
            cfg: Arc::new(cfg),
            store: self.store.clone(),
            health: self.health.clone(),
            updater: Arc::new(move |deployment: String| triggered.lock().push(deployment)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn test_config_registers_deployments() {
        let harness = TestHarness::new().unwrap();
        let cfg = harness.config(&["lab", "prod"], Some("k3y")).unwrap();

        assert_eq!(cfg.deployment_names(), vec!["lab", "prod"]);
        assert_eq!(cfg.api_key.as_deref(), Some("k3y"));
        assert_eq!(cfg.deployments["lab"].os_region_name, "RegionOne");
    }

    #[test]
    fn test_config_without_deployments() {
        let harness = TestHarness::new().unwrap();
        let cfg = harness.config(&[], None).unwrap();
        assert!(cfg.deployment_names().is_empty());
        assert!(cfg.api_key.is_none());
    }

    #[tokio::test]
    async fn test_bootstrap_fills_store() {
        let harness = TestHarness::new()
            .unwrap()
            .with_deployment("lab", fixtures::sample_deployment());
        harness.bootstrap("lab").await;

        let summary = harness.inventory("lab").summary();
        assert_eq!(summary.projects, 2);
        assert_eq!(summary.instances, 3);
        assert!(harness.cloud.calls().contains(&"lab:list_servers".to_string()));
    }
}
