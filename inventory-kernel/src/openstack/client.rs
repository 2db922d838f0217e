use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::pool::{ConnectionPool, Session};
use super::wire::{
    RemoteAggregate, RemoteFlavor, RemoteHypervisor, RemoteImage, RemoteProject, RemoteServer,
};
use super::{Connection, RemoteError, RemoteInventory, Service};
use crate::config::DeploymentConfig;

const USER_AGENT: &str = concat!("inventory-kernel/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP client for Keystone v3 + Nova v2.1.
pub struct OpenStackClient {
    http: reqwest::Client,
    deployments: HashMap<String, DeploymentConfig>,
    pool: ConnectionPool,
}

impl OpenStackClient {
    pub fn new(deployments: HashMap<String, DeploymentConfig>) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            deployments,
            pool: ConnectionPool::new(),
        })
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Password authentication scoped to the configured project.
    async fn authenticate(
        &self,
        deployment: &str,
        cfg: &DeploymentConfig,
    ) -> Result<Session, RemoteError> {
        let url = format!("{}/auth/tokens", identity_base(&cfg.os_auth_url));
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": cfg.os_username,
                            "domain": {"name": cfg.os_domain_name},
                            "password": cfg.os_password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": cfg.os_project_name,
                        "domain": {"name": cfg.os_domain_name},
                    }
                }
            }
        });

        debug!(deployment, url = %url, "authenticating");
        let response = self.http.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(RemoteError::Status {
                status: response.status().as_u16(),
                url,
            });
        }

        let token = response
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Decode("missing X-Subject-Token header".into()))?;
        let payload: Value = response.json().await?;

        let expires_at = payload["token"]["expires_at"]
            .as_str()
            .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok());
        let endpoints = select_endpoints(&payload["token"]["catalog"], &cfg.os_region_name);

        Ok(Session {
            token,
            expires_at,
            endpoints,
        })
    }

    /// GETs `url` and every following page, collecting the `key` arrays.
    async fn collect_pages<T: DeserializeOwned>(
        &self,
        conn: &Connection,
        url: String,
        key: &str,
    ) -> Result<Vec<T>, RemoteError> {
        let mut items = Vec::new();
        let mut next = Some(url);
        let mut pages = 0usize;

        while let Some(url) = next.take() {
            let response = self
                .http
                .get(&url)
                .header("X-Auth-Token", &conn.token)
                .header("Accept", "application/json")
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(self.rejected(conn, response.status().as_u16(), url));
            }
            let body: Value = response.json().await?;
            let Some(page) = body.get(key).and_then(Value::as_array) else {
                return Err(RemoteError::Decode(format!("no `{key}` array in response")));
            };
            for raw in page {
                match serde_json::from_value(raw.clone()) {
                    Ok(item) => items.push(item),
                    Err(e) => warn!(
                        deployment = %conn.deployment,
                        collection = key,
                        error = %e,
                        "skipping undecodable item"
                    ),
                }
            }
            pages += 1;
            next = next_page(&body, key).filter(|candidate| *candidate != url);
        }

        debug!(
            deployment = %conn.deployment,
            collection = key,
            pages,
            count = items.len(),
            "collection fetched"
        );
        Ok(items)
    }

    /// Status error of a listing. A token refused by the service is dropped
    /// from the pool so the next `connect` authenticates again.
    fn rejected(&self, conn: &Connection, status: u16, url: String) -> RemoteError {
        if matches!(status, 401 | 403) && self.pool.evict(&conn.deployment) {
            warn!(deployment = %conn.deployment, status, "token rejected, session evicted");
        }
        RemoteError::Status { status, url }
    }
}

impl RemoteInventory for OpenStackClient {
    async fn connect(&self, deployment: &str, service: Service) -> Result<Connection, RemoteError> {
        let cfg = self
            .deployments
            .get(deployment)
            .ok_or_else(|| RemoteError::unavailable(deployment, "deployment not configured"))?;

        let now = OffsetDateTime::now_utc();
        let session = match self.pool.get(deployment) {
            Some(session) if session.is_fresh(now) => session,
            existing => {
                let reauth = existing.is_some();
                match self.authenticate(deployment, cfg).await {
                    Ok(session) => {
                        if reauth {
                            debug!(deployment, "session reauthenticated");
                        } else {
                            info!(deployment, "session established");
                        }
                        self.pool.put(deployment, session.clone());
                        session
                    }
                    Err(e) => {
                        self.pool.evict(deployment);
                        return Err(RemoteError::unavailable(deployment, e.to_string()));
                    }
                }
            }
        };

        let endpoint = session.endpoints.get(&service).cloned().ok_or_else(|| {
            RemoteError::unavailable(
                deployment,
                format!(
                    "no public {} endpoint in region {}",
                    service.catalog_type(),
                    cfg.os_region_name
                ),
            )
        })?;

        Ok(Connection {
            deployment: deployment.to_string(),
            service,
            endpoint,
            token: session.token,
        })
    }

    async fn list_projects(&self, conn: &Connection) -> Result<Vec<RemoteProject>, RemoteError> {
        let url = format!("{}/projects", identity_base(&conn.endpoint));
        self.collect_pages(conn, url, "projects").await
    }

    async fn list_images(&self, conn: &Connection) -> Result<Vec<RemoteImage>, RemoteError> {
        let url = format!("{}/images/detail", conn.endpoint.trim_end_matches('/'));
        self.collect_pages(conn, url, "images").await
    }

    async fn list_flavors(&self, conn: &Connection) -> Result<Vec<RemoteFlavor>, RemoteError> {
        let url = format!("{}/flavors/detail", conn.endpoint.trim_end_matches('/'));
        self.collect_pages(conn, url, "flavors").await
    }

    async fn list_aggregates(
        &self,
        conn: &Connection,
    ) -> Result<Vec<RemoteAggregate>, RemoteError> {
        let url = format!("{}/os-aggregates", conn.endpoint.trim_end_matches('/'));
        self.collect_pages(conn, url, "aggregates").await
    }

    async fn list_hypervisors(
        &self,
        conn: &Connection,
    ) -> Result<Vec<RemoteHypervisor>, RemoteError> {
        let url = format!("{}/os-hypervisors/detail", conn.endpoint.trim_end_matches('/'));
        self.collect_pages(conn, url, "hypervisors").await
    }

    async fn list_servers(&self, conn: &Connection) -> Result<Vec<RemoteServer>, RemoteError> {
        let url = format!(
            "{}/servers/detail?all_tenants=true",
            conn.endpoint.trim_end_matches('/')
        );
        self.collect_pages(conn, url, "servers").await
    }
}

/// `https://keystone:5000` and `https://keystone:5000/v3/` both become
/// `https://keystone:5000/v3`.
fn identity_base(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    if trimmed.ends_with("/v3") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v3")
    }
}

/// Public endpoints of the wanted region, one per known service type.
fn select_endpoints(catalog: &Value, region: &str) -> HashMap<Service, String> {
    let mut endpoints = HashMap::new();
    let Some(entries) = catalog.as_array() else {
        return endpoints;
    };

    for service in [Service::Compute, Service::Identity] {
        let url = entries
            .iter()
            .filter(|entry| entry["type"].as_str() == Some(service.catalog_type()))
            .filter_map(|entry| entry["endpoints"].as_array())
            .flatten()
            .find(|ep| {
                let in_region = ep["region_id"].as_str() == Some(region)
                    || ep["region"].as_str() == Some(region);
                ep["interface"].as_str() == Some("public") && in_region
            })
            .and_then(|ep| ep["url"].as_str());
        if let Some(url) = url {
            endpoints.insert(service, url.to_string());
        }
    }
    endpoints
}

/// Next page link: `{key}_links` with `rel: next` (compute) or
/// `links.next` (identity).
fn next_page(body: &Value, key: &str) -> Option<String> {
    let compute = body
        .get(format!("{key}_links"))
        .and_then(Value::as_array)
        .and_then(|links| {
            links
                .iter()
                .find(|link| link["rel"].as_str() == Some("next"))
                .and_then(|link| link["href"].as_str())
        });
    let identity = body
        .get("links")
        .and_then(|links| links.get("next"))
        .and_then(Value::as_str);
    compute.or(identity).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session {
            token: "tok".into(),
            expires_at: Some(OffsetDateTime::now_utc() + time::Duration::hours(1)),
            endpoints: HashMap::from([(Service::Compute, "https://nova/v2.1".to_string())]),
        }
    }

    fn conn() -> Connection {
        Connection {
            deployment: "lab".into(),
            service: Service::Compute,
            endpoint: "https://nova/v2.1".into(),
            token: "tok".into(),
        }
    }

    #[test]
    fn test_rejected_token_evicts_session() {
        let client = OpenStackClient::new(HashMap::new()).unwrap();
        client.pool().put("lab", session());

        let err = client.rejected(&conn(), 401, "https://nova/v2.1/servers/detail".into());
        assert!(matches!(err, RemoteError::Status { status: 401, .. }));
        assert!(!client.pool().contains("lab"));

        client.pool().put("lab", session());
        client.rejected(&conn(), 403, "https://nova/v2.1/os-hypervisors/detail".into());
        assert!(!client.pool().contains("lab"));
    }

    #[test]
    fn test_server_error_keeps_session() {
        let client = OpenStackClient::new(HashMap::new()).unwrap();
        client.pool().put("lab", session());

        client.rejected(&conn(), 500, "https://nova/v2.1/flavors/detail".into());
        client.rejected(&conn(), 404, "https://nova/v2.1/os-aggregates".into());
        assert!(client.pool().contains("lab"));
    }

    #[test]
    fn test_identity_base() {
        assert_eq!(identity_base("https://ks:5000"), "https://ks:5000/v3");
        assert_eq!(identity_base("https://ks:5000/"), "https://ks:5000/v3");
        assert_eq!(identity_base("https://ks:5000/v3/"), "https://ks:5000/v3");
    }

    #[test]
    fn test_select_endpoints_filters_interface_and_region() {
        let catalog = json!([
            {"type": "compute", "endpoints": [
                {"interface": "internal", "region_id": "RegionOne", "url": "http://internal:8774/v2.1"},
                {"interface": "public", "region_id": "RegionTwo", "url": "http://two:8774/v2.1"},
                {"interface": "public", "region_id": "RegionOne", "url": "http://one:8774/v2.1"}
            ]},
            {"type": "identity", "endpoints": [
                {"interface": "public", "region": "RegionOne", "url": "http://ks:5000/v3"}
            ]},
            {"type": "image", "endpoints": [
                {"interface": "public", "region_id": "RegionOne", "url": "http://glance:9292"}
            ]}
        ]);

        let endpoints = select_endpoints(&catalog, "RegionOne");
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[&Service::Compute], "http://one:8774/v2.1");
        assert_eq!(endpoints[&Service::Identity], "http://ks:5000/v3");
        assert!(select_endpoints(&catalog, "Nowhere").is_empty());
    }

    #[test]
    fn test_next_page_links() {
        let nova = json!({
            "servers": [],
            "servers_links": [{"rel": "next", "href": "http://nova/servers/detail?marker=x"}]
        });
        assert_eq!(
            next_page(&nova, "servers").as_deref(),
            Some("http://nova/servers/detail?marker=x")
        );

        let keystone = json!({"projects": [], "links": {"self": "http://ks/v3/projects", "next": null}});
        assert_eq!(next_page(&keystone, "projects"), None);

        let keystone = json!({"projects": [], "links": {"next": "http://ks/v3/projects?marker=p"}});
        assert_eq!(
            next_page(&keystone, "projects").as_deref(),
            Some("http://ks/v3/projects?marker=p")
        );

        assert_eq!(next_page(&json!({"flavors": []}), "flavors"), None);
    }
}
