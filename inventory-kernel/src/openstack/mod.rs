/**
 * OPENSTACK - remote resource client
 *
 * ROLE:
 * Authenticated, fully paginated access to the compute and identity
 * services of every configured deployment.
 *
 * HOW IT WORKS:
 * 1. `connect()` returns a `Connection` (endpoint + token) for one service,
 *    reusing, refreshing or creating the deployment's session in the pool
 * 2. `list_*()` follows every "next" link before returning anything
 * 3. Any failure to obtain a session is `RemoteError::Unavailable`
 *
 * The reconciliation engine only sees the `RemoteInventory` trait, so tests
 * can swap the HTTP client for an in-memory cloud.
 */

mod client;
mod pool;
pub mod wire;

pub use client::OpenStackClient;
pub use pool::{ConnectionPool, Session};

use std::future::Future;
use wire::{
    RemoteAggregate, RemoteFlavor, RemoteHypervisor, RemoteImage, RemoteProject, RemoteServer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Compute,
    Identity,
}

impl Service {
    /// Service type as it appears in the catalog.
    pub fn catalog_type(&self) -> &'static str {
        match self {
            Service::Compute => "compute",
            Service::Identity => "identity",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub deployment: String,
    pub service: Service,
    pub endpoint: String,
    pub token: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("deployment {deployment} unavailable: {reason}")]
    Unavailable { deployment: String, reason: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("decode error: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn unavailable(deployment: &str, reason: impl Into<String>) -> Self {
        RemoteError::Unavailable {
            deployment: deployment.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, RemoteError::Unavailable { .. })
    }
}

/// Read-only view of a remote cloud.
pub trait RemoteInventory: Send + Sync + 'static {
    fn connect(
        &self,
        deployment: &str,
        service: Service,
    ) -> impl Future<Output = Result<Connection, RemoteError>> + Send;

    fn list_projects(
        &self,
        conn: &Connection,
    ) -> impl Future<Output = Result<Vec<RemoteProject>, RemoteError>> + Send;

    fn list_images(
        &self,
        conn: &Connection,
    ) -> impl Future<Output = Result<Vec<RemoteImage>, RemoteError>> + Send;

    fn list_flavors(
        &self,
        conn: &Connection,
    ) -> impl Future<Output = Result<Vec<RemoteFlavor>, RemoteError>> + Send;

    fn list_aggregates(
        &self,
        conn: &Connection,
    ) -> impl Future<Output = Result<Vec<RemoteAggregate>, RemoteError>> + Send;

    fn list_hypervisors(
        &self,
        conn: &Connection,
    ) -> impl Future<Output = Result<Vec<RemoteHypervisor>, RemoteError>> + Send;

    /// Servers of every tenant.
    fn list_servers(
        &self,
        conn: &Connection,
    ) -> impl Future<Output = Result<Vec<RemoteServer>, RemoteError>> + Send;
}
