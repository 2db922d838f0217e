use serde::{Deserialize, Deserializer, Serialize};
use std::{collections::HashMap, fmt, str::FromStr, time::Duration};
use tokio::fs;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct InventoryConfig {
    #[serde(default = "default_listen_on")]
    pub listen_on: String,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub logfile: Option<String>,
    /// Required in `x-api-key` on every route but `/v1/status` when set.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub poll_interval: PollIntervals,
    #[serde(default = "default_cleanup", deserialize_with = "human_duration")]
    pub cleanup_interval: Duration,
    #[serde(default = "default_snapshot_at")]
    pub snapshot_at: TimeOfDay,
    #[serde(default)]
    pub deployments: HashMap<String, DeploymentConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollIntervals {
    #[serde(default = "ten_minutes", deserialize_with = "human_duration")]
    pub projects: Duration,
    #[serde(default = "half_hour", deserialize_with = "human_duration")]
    pub images: Duration,
    #[serde(default = "one_hour", deserialize_with = "human_duration")]
    pub flavors: Duration,
    #[serde(default = "one_hour", deserialize_with = "human_duration")]
    pub aggregates: Duration,
    #[serde(default = "ten_minutes", deserialize_with = "human_duration")]
    pub hypervisors: Duration,
    #[serde(default = "five_minutes", deserialize_with = "human_duration")]
    pub instances: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            projects: ten_minutes(),
            images: half_hour(),
            flavors: one_hour(),
            aggregates: one_hour(),
            hypervisors: ten_minutes(),
            instances: five_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub os_auth_url: String,
    pub os_project_name: String,
    pub os_username: String,
    pub os_password: String,
    #[serde(default = "default_domain")]
    pub os_domain_name: String,
    #[serde(default = "default_region")]
    pub os_region_name: String,
}

/// UTC wall-clock time, written `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl FromStr for TimeOfDay {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::Invalid(format!("expected HH:MM, got {s:?}"));
        let (h, m) = s.trim().split_once(':').ok_or_else(invalid)?;
        let hour: u8 = h.parse().map_err(|_| invalid())?;
        let minute: u8 = m.parse().map_err(|_| invalid())?;
        if hour > 23 || minute > 59 {
            return Err(invalid());
        }
        Ok(Self { hour, minute })
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

fn human_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
}

fn default_listen_on() -> String {
    "0.0.0.0:8080".into()
}
fn default_database() -> String {
    "./data/inventory.redb".into()
}
fn default_domain() -> String {
    "Default".into()
}
fn default_region() -> String {
    "RegionOne".into()
}
fn default_snapshot_at() -> TimeOfDay {
    TimeOfDay { hour: 0, minute: 5 }
}
fn default_cleanup() -> Duration {
    Duration::from_secs(24 * 3600)
}
fn five_minutes() -> Duration {
    Duration::from_secs(5 * 60)
}
fn ten_minutes() -> Duration {
    Duration::from_secs(10 * 60)
}
fn half_hour() -> Duration {
    Duration::from_secs(30 * 60)
}
fn one_hour() -> Duration {
    Duration::from_secs(3600)
}

impl InventoryConfig {
    pub fn is_registered(&self, deployment: &str) -> bool {
        self.deployments.contains_key(deployment)
    }

    pub fn deployment_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.deployments.keys().cloned().collect();
        names.sort();
        names
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("poll_interval.projects", self.poll_interval.projects),
            ("poll_interval.images", self.poll_interval.images),
            ("poll_interval.flavors", self.poll_interval.flavors),
            ("poll_interval.aggregates", self.poll_interval.aggregates),
            ("poll_interval.hypervisors", self.poll_interval.hypervisors),
            ("poll_interval.instances", self.poll_interval.instances),
            ("cleanup_interval", self.cleanup_interval),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }

        for (name, dep) in &self.deployments {
            if name.trim().is_empty() || name.contains('/') {
                return Err(ConfigError::Invalid(format!("invalid deployment name {name:?}")));
            }
            let required = [
                ("os_auth_url", &dep.os_auth_url),
                ("os_project_name", &dep.os_project_name),
                ("os_username", &dep.os_username),
            ];
            for (field, value) in required {
                if value.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!("{name}: {field} is empty")));
                }
            }
        }
        Ok(())
    }
}

/// Parses and validates a YAML document. `api_key_env` overrides `api_key`.
pub fn parse_config(txt: &str, api_key_env: Option<String>) -> Result<InventoryConfig, ConfigError> {
    let mut cfg: InventoryConfig = serde_yaml::from_str(txt)?;
    if let Some(key) = api_key_env.filter(|k| !k.trim().is_empty()) {
        cfg.api_key = Some(key);
    }
    cfg.api_key = cfg.api_key.filter(|k| !k.trim().is_empty());
    cfg.validate()?;
    Ok(cfg)
}

/// Reads `INVENTORY_CONFIG` (default `inventory.yaml`).
pub async fn load_config() -> Result<InventoryConfig, ConfigError> {
    let path = std::env::var("INVENTORY_CONFIG").unwrap_or_else(|_| "inventory.yaml".into());
    let txt = fs::read_to_string(&path)
        .await
        .map_err(|source| ConfigError::Read { path: path.clone(), source })?;
    parse_config(&txt, std::env::var("INVENTORY_API_KEY").ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
listen_on: "127.0.0.1:9000"
debug: true
database: /tmp/inv.redb
poll_interval:
  instances: 90s
  flavors: 2h
snapshot_at: "23:30"
deployments:
  lab-1a:
    os_auth_url: https://keystone.lab:5000/v3
    os_project_name: admin
    os_username: inventory
    os_password: secret
"#;

    #[test]
    fn test_parse_with_defaults() {
        let cfg = parse_config(SAMPLE, None).unwrap();
        assert_eq!(cfg.listen_on, "127.0.0.1:9000");
        assert!(cfg.debug);
        assert_eq!(cfg.poll_interval.instances, Duration::from_secs(90));
        assert_eq!(cfg.poll_interval.flavors, Duration::from_secs(7200));
        assert_eq!(cfg.poll_interval.projects, Duration::from_secs(600));
        assert_eq!(cfg.cleanup_interval, Duration::from_secs(86400));
        assert_eq!(cfg.snapshot_at, TimeOfDay { hour: 23, minute: 30 });

        let dep = &cfg.deployments["lab-1a"];
        assert_eq!(dep.os_domain_name, "Default");
        assert_eq!(dep.os_region_name, "RegionOne");
        assert!(cfg.is_registered("lab-1a"));
        assert!(!cfg.is_registered("lab-2b"));
        assert_eq!(cfg.api_key, None);
    }

    #[test]
    fn test_api_key_from_env_wins() {
        let yaml = format!("{SAMPLE}api_key: from-file\n");
        let cfg = parse_config(&yaml, Some("from-env".into())).unwrap();
        assert_eq!(cfg.api_key.as_deref(), Some("from-env"));

        let cfg = parse_config(&yaml, Some("  ".into())).unwrap();
        assert_eq!(cfg.api_key.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(parse_config("snapshot_at: \"25:00\"\n", None).is_err());
        assert!(parse_config("snapshot_at: \"noon\"\n", None).is_err());
        assert!(parse_config("cleanup_interval: soon\n", None).is_err());
        assert!(matches!(
            parse_config("cleanup_interval: 0s\n", None),
            Err(ConfigError::Invalid(_))
        ));
        let missing_url = r#"
deployments:
  lab:
    os_auth_url: ""
    os_project_name: admin
    os_username: u
    os_password: p
"#;
        assert!(matches!(parse_config(missing_url, None), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_empty_mapping_uses_defaults() {
        let cfg = parse_config("{}", None).unwrap();
        assert!(cfg.deployments.is_empty());
        assert_eq!(cfg.database, "./data/inventory.redb");
    }

    #[test]
    fn test_time_of_day_display() {
        assert_eq!("7:05".parse::<TimeOfDay>().unwrap().to_string(), "07:05");
    }
}
