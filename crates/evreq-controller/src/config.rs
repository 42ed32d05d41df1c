//! Controller configuration from the process environment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_LEASE_NAME: &str = "eviction-request-controller";
pub const DEFAULT_LEASE_NAMESPACE: &str = "default";

const ENV_KEYS: [&str; 8] = [
    "KUBECONFIG",
    "EVREQ_WORKERS",
    "EVREQ_RESYNC_INTERVAL_SECS",
    "EVREQ_LEASE_NAME",
    "EVREQ_LEASE_NAMESPACE",
    "EVREQ_LEASE_DURATION_SECS",
    "EVREQ_LEASE_RENEW_DEADLINE_SECS",
    "EVREQ_LEASE_RETRY_PERIOD_SECS",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),
    #[error("invalid {key}='{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("failed to load kubeconfig: {0}")]
    Kubeconfig(String),
}

/// Leased-lock election timings, following the usual Kubernetes controller defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseSettings {
    pub name: String,
    pub namespace: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_LEASE_NAME.to_string(),
            namespace: DEFAULT_LEASE_NAMESPACE.to_string(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

impl LeaseSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.renew_deadline >= self.lease_duration {
            return Err(ConfigError::Invalid {
                key: "EVREQ_LEASE_RENEW_DEADLINE_SECS",
                value: self.renew_deadline.as_secs().to_string(),
                reason: "must be shorter than the lease duration".to_string(),
            });
        }
        if self.retry_period >= self.renew_deadline {
            return Err(ConfigError::Invalid {
                key: "EVREQ_LEASE_RETRY_PERIOD_SECS",
                value: self.retry_period.as_secs().to_string(),
                reason: "must be shorter than the renew deadline".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    pub kubeconfig: PathBuf,
    pub workers: usize,
    pub resync_interval: Duration,
    pub lease: LeaseSettings,
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut envs = HashMap::new();
        for key in ENV_KEYS {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(&envs)
    }

    pub fn from_env_map(envs: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let kubeconfig = envs
            .get("KUBECONFIG")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing("KUBECONFIG"))?;

        let workers = parse_positive(envs, "EVREQ_WORKERS")?
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_WORKERS);
        let resync_interval = parse_positive(envs, "EVREQ_RESYNC_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RESYNC_INTERVAL);

        let defaults = LeaseSettings::default();
        let lease = LeaseSettings {
            name: non_empty(envs, "EVREQ_LEASE_NAME").unwrap_or(defaults.name),
            namespace: non_empty(envs, "EVREQ_LEASE_NAMESPACE").unwrap_or(defaults.namespace),
            lease_duration: parse_positive(envs, "EVREQ_LEASE_DURATION_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease_duration),
            renew_deadline: parse_positive(envs, "EVREQ_LEASE_RENEW_DEADLINE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.renew_deadline),
            retry_period: parse_positive(envs, "EVREQ_LEASE_RETRY_PERIOD_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_period),
        };
        lease.validate()?;

        Ok(Self {
            kubeconfig,
            workers,
            resync_interval,
            lease,
        })
    }

    /// Build a client from the configured kubeconfig file.
    pub async fn client(&self) -> Result<Client, ConfigError> {
        let kubeconfig = Kubeconfig::read_from(&self.kubeconfig).map_err(|e| {
            ConfigError::Kubeconfig(format!("{}: {}", self.kubeconfig.display(), e))
        })?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| ConfigError::Kubeconfig(e.to_string()))?;
        Client::try_from(config).map_err(|e| ConfigError::Kubeconfig(e.to_string()))
    }
}

fn non_empty(envs: &HashMap<String, String>, key: &str) -> Option<String> {
    envs.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_positive(
    envs: &HashMap<String, String>,
    key: &'static str,
) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = non_empty(envs, key) else {
        return Ok(None);
    };
    match raw.parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: "must be greater than zero".to_string(),
        }),
        Ok(value) => Ok(Some(value)),
        Err(e) => Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}
