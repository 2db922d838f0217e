/*!
In-memory OpenStack for tests

Implements `RemoteInventory` over plain vectors so the reconciliation
engine can run without any HTTP endpoint. Deployments can be taken down and
individual listings made to fail, and every call is recorded for assertions.
*/

use inventory_kernel::openstack::wire::{
    RemoteAggregate, RemoteFlavor, RemoteHypervisor, RemoteImage, RemoteProject, RemoteServer,
};
use inventory_kernel::openstack::{Connection, RemoteError, RemoteInventory, Service};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Content of one fake deployment.
#[derive(Debug, Clone, Default)]
pub struct CloudData {
    pub projects: Vec<RemoteProject>,
    pub images: Vec<RemoteImage>,
    pub flavors: Vec<RemoteFlavor>,
    pub aggregates: Vec<RemoteAggregate>,
    pub hypervisors: Vec<RemoteHypervisor>,
    pub servers: Vec<RemoteServer>,
}

#[derive(Default)]
struct Deployment {
    data: CloudData,
    down: bool,
    failing: HashSet<&'static str>,
}

#[derive(Default)]
pub struct FakeCloud {
    deployments: Mutex<HashMap<String, Deployment>>,
    calls: Mutex<Vec<String>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole content of a deployment, creating it if needed.
    pub fn set(&self, deployment: &str, data: CloudData) {
        self.deployments
            .lock()
            .entry(deployment.to_string())
            .or_default()
            .data = data;
    }

    /// Edits the content of a deployment in place.
    pub fn update<F: FnOnce(&mut CloudData)>(&self, deployment: &str, f: F) {
        let mut deployments = self.deployments.lock();
        f(&mut deployments.entry(deployment.to_string()).or_default().data);
    }

    /// Makes `connect` fail for this deployment.
    pub fn take_down(&self, deployment: &str) {
        self.deployments
            .lock()
            .entry(deployment.to_string())
            .or_default()
            .down = true;
    }

    pub fn bring_up(&self, deployment: &str) {
        if let Some(d) = self.deployments.lock().get_mut(deployment) {
            d.down = false;
        }
    }

    /// Makes one listing (`"servers"`, `"images"`, ...) answer HTTP 500.
    pub fn fail_listing(&self, deployment: &str, collection: &'static str) {
        self.deployments
            .lock()
            .entry(deployment.to_string())
            .or_default()
            .failing
            .insert(collection);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn listing<T: Clone>(
        &self,
        conn: &Connection,
        collection: &'static str,
        pick: impl FnOnce(&CloudData) -> &Vec<T>,
    ) -> Result<Vec<T>, RemoteError> {
        self.calls
            .lock()
            .push(format!("{}:list_{collection}", conn.deployment));
        let deployments = self.deployments.lock();
        let deployment = deployments
            .get(&conn.deployment)
            .ok_or_else(|| RemoteError::unavailable(&conn.deployment, "unknown deployment"))?;
        if deployment.failing.contains(collection) {
            return Err(RemoteError::Status {
                status: 500,
                url: format!("fake://{}/{collection}", conn.deployment),
            });
        }
        Ok(pick(&deployment.data).clone())
    }
}

impl RemoteInventory for FakeCloud {
    async fn connect(&self, deployment: &str, service: Service) -> Result<Connection, RemoteError> {
        self.calls
            .lock()
            .push(format!("{deployment}:connect_{}", service.catalog_type()));
        match self.deployments.lock().get(deployment) {
            Some(d) if !d.down => Ok(Connection {
                deployment: deployment.to_string(),
                service,
                endpoint: format!("fake://{deployment}/{}", service.catalog_type()),
                token: "fake-token".into(),
            }),
            Some(_) => Err(RemoteError::unavailable(deployment, "authentication failed")),
            None => Err(RemoteError::unavailable(deployment, "deployment not configured")),
        }
    }

    async fn list_projects(&self, conn: &Connection) -> Result<Vec<RemoteProject>, RemoteError> {
        self.listing(conn, "projects", |d| &d.projects)
    }

    async fn list_images(&self, conn: &Connection) -> Result<Vec<RemoteImage>, RemoteError> {
        self.listing(conn, "images", |d| &d.images)
    }

    async fn list_flavors(&self, conn: &Connection) -> Result<Vec<RemoteFlavor>, RemoteError> {
        self.listing(conn, "flavors", |d| &d.flavors)
    }

    async fn list_aggregates(&self, conn: &Connection) -> Result<Vec<RemoteAggregate>, RemoteError> {
        self.listing(conn, "aggregates", |d| &d.aggregates)
    }

    async fn list_hypervisors(&self, conn: &Connection) -> Result<Vec<RemoteHypervisor>, RemoteError> {
        self.listing(conn, "hypervisors", |d| &d.hypervisors)
    }

    async fn list_servers(&self, conn: &Connection) -> Result<Vec<RemoteServer>, RemoteError> {
        self.listing(conn, "servers", |d| &d.servers)
    }
}
