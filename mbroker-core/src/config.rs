//! Deployment policy passed explicitly to the executor and the
//! reconciliation engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::resource::{ResourceKind, SecurityGroupRule};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Security group created in every new tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultSecurityGroup {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rules: Vec<SecurityGroupRule>,
}

/// Polling bounds for asynchronous backend operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollDefaults {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// Instances take longer to boot and resize.
    pub instance_timeout_secs: u64,
    pub deletion_timeout_secs: u64,
}

impl Default for PollDefaults {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            timeout_secs: 600,
            instance_timeout_secs: 1800,
            deletion_timeout_secs: 600,
        }
    }
}

impl PollDefaults {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn instance_timeout(&self) -> Duration {
        Duration::from_secs(self.instance_timeout_secs)
    }

    pub fn deletion_timeout(&self) -> Duration {
        Duration::from_secs(self.deletion_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Concurrent provisioning calls allowed per kind. Kinds not listed are
    /// unthrottled.
    pub max_concurrent_provision: HashMap<ResourceKind, usize>,
    pub throttle_retry_delay_secs: u64,
    pub default_security_groups: Vec<DefaultSecurityGroup>,
    /// Users never synchronised to a peer.
    pub blacklisted_usernames: Vec<String>,
    /// External network new tenants are connected to, if any.
    pub external_network_id: Option<String>,
    pub internal_subnet_cidr: String,
    pub poll: PollDefaults,
    pub worker_count: usize,
    pub reconcile_interval_secs: u64,
    /// Customer each project's quotas roll up to.
    pub project_customers: HashMap<String, String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_provision: HashMap::from([
                (ResourceKind::Instance, 4),
                (ResourceKind::Volume, 4),
                (ResourceKind::Snapshot, 4),
            ]),
            throttle_retry_delay_secs: 30,
            default_security_groups: Vec::new(),
            blacklisted_usernames: Vec::new(),
            external_network_id: None,
            internal_subnet_cidr: "192.168.42.0/24".to_string(),
            poll: PollDefaults::default(),
            worker_count: 4,
            reconcile_interval_secs: 3600,
            project_customers: HashMap::new(),
        }
    }
}

impl BrokerConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn throttle_retry_delay(&self) -> Duration {
        Duration::from_secs(self.throttle_retry_delay_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn is_blacklisted(&self, username: &str) -> bool {
        self.blacklisted_usernames.iter().any(|u| u == username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_from_empty_object() {
        let config = BrokerConfig::from_json("{}").unwrap();
        assert_eq!(config, BrokerConfig::default());
        assert_eq!(config.internal_subnet_cidr, "192.168.42.0/24");
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "max_concurrent_provision": {{"instance": 2}},
                "blacklisted_usernames": ["admin"],
                "external_network_id": "ext-net",
                "poll": {{"interval_secs": 1}},
                "project_customers": {{"project-1": "customer-1"}},
                "default_security_groups": [
                    {{"name": "ssh", "rules": [{{"direction": "ingress", "ethertype": "IPv4",
                      "protocol": "tcp", "from_port": 22, "to_port": 22, "description": ""}}]}}
                ]
            }}"#
        )
        .unwrap();

        let config = BrokerConfig::load(file.path()).unwrap();
        assert_eq!(
            config.max_concurrent_provision.get(&ResourceKind::Instance),
            Some(&2)
        );
        assert!(config.is_blacklisted("admin"));
        assert_eq!(config.poll.interval_secs, 1);
        assert_eq!(config.poll.timeout_secs, 600);
        assert_eq!(
            config.project_customers.get("project-1").map(String::as_str),
            Some("customer-1")
        );
        assert_eq!(config.default_security_groups[0].rules[0].from_port, Some(22));
    }

    #[test]
    fn test_missing_file() {
        let err = BrokerConfig::load("/nonexistent/mbroker.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
