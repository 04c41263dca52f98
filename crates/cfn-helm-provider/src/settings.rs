//! Process-wide provider settings
//!
//! Loaded once at startup from the YAML file named by `CFN_HELM_CONFIG`, or
//! from defaults, with `CFN_HELM_*` environment overrides applied on top.
//! Handlers only ever read them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ProviderError, Result};

/// Environment variable naming a settings file
pub const CONFIG_ENV: &str = "CFN_HELM_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSettings {
    /// Budget of a reconciliation when the model has no `TimeOut`
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Delay before the orchestrator re-invokes an in-progress handler
    #[serde(with = "humantime_serde")]
    pub callback_delay: Duration,

    /// Shared retry budget: connector polls, invokes and lookup errors (doubled)
    pub retry_count: usize,

    #[serde(with = "humantime_serde")]
    pub connector_create_poll: Duration,

    #[serde(with = "humantime_serde")]
    pub connector_pending_poll: Duration,

    #[serde(with = "humantime_serde")]
    pub invoke_retry_delay: Duration,

    /// Wait before retrying a function update that hit a concurrent one
    #[serde(with = "humantime_serde")]
    pub update_retry_delay: Duration,

    pub connector: ConnectorSettings,

    pub paths: ScratchPaths,

    pub stable_repo_url: String,

    pub helm_binary: String,

    pub aws_binary: String,

    /// Serialized size after which resource summaries stop growing
    pub output_limit: usize,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60 * 60),
            callback_delay: Duration::from_secs(30),
            retry_count: 3,
            connector_create_poll: Duration::from_secs(5),
            connector_pending_poll: Duration::from_secs(8),
            invoke_retry_delay: Duration::from_secs(5),
            update_retry_delay: Duration::from_secs(5),
            connector: ConnectorSettings::default(),
            paths: ScratchPaths::default(),
            stable_repo_url: "https://charts.helm.sh/stable".to_string(),
            helm_binary: "helm".to_string(),
            aws_binary: "aws".to_string(),
            output_limit: 12 * 1024,
        }
    }
}

/// Shape of the connector function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectorSettings {
    /// Deployment package uploaded on create and code updates
    pub artifact_path: PathBuf,
    pub function_prefix: String,
    pub handler: String,
    pub runtime: String,
    pub memory_size: i64,
    /// Function timeout in seconds
    pub timeout: i64,
    pub max_subnets: usize,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            artifact_path: PathBuf::from("k8svpc.zip"),
            function_prefix: "helm-provider-vpc-connector-".to_string(),
            handler: "bootstrap".to_string(),
            runtime: "provided.al2023".to_string(),
            memory_size: 384,
            timeout: 900,
            max_subnets: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScratchPaths {
    pub kubeconfig: PathBuf,
    pub chart: PathBuf,
    pub ca_file: PathBuf,
    pub values: PathBuf,
}

impl Default for ScratchPaths {
    fn default() -> Self {
        Self {
            kubeconfig: PathBuf::from("/tmp/kubeConfig"),
            chart: PathBuf::from("/tmp/chart.tgz"),
            ca_file: PathBuf::from("/tmp/ca.pem"),
            values: PathBuf::from("/tmp/values.json"),
        }
    }
}

impl ProviderSettings {
    /// Load from `CFN_HELM_CONFIG` if set, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut settings = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load_from(Path::new(&path))?,
            None => Self::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Load from a YAML file; missing keys keep their defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ProviderError::Config {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        serde_yaml::from_str(&content).map_err(|e| ProviderError::Config {
            message: format!("invalid settings in {}: {}", path.display(), e),
        })
    }

    /// Apply `CFN_HELM_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CFN_HELM_DEFAULT_TIMEOUT") {
            self.default_timeout = parse_duration("CFN_HELM_DEFAULT_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("CFN_HELM_CALLBACK_DELAY") {
            self.callback_delay = parse_duration("CFN_HELM_CALLBACK_DELAY", &v)?;
        }
        if let Some(v) = lookup("CFN_HELM_RETRY_COUNT") {
            self.retry_count = v.parse().map_err(|e| ProviderError::Config {
                message: format!("CFN_HELM_RETRY_COUNT: {}", e),
            })?;
        }
        if let Some(v) = lookup("CFN_HELM_CONNECTOR_ARTIFACT") {
            self.connector.artifact_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("CFN_HELM_STABLE_REPO_URL") {
            self.stable_repo_url = v;
        }
        if let Some(v) = lookup("CFN_HELM_HELM_BINARY") {
            self.helm_binary = v;
        }
        if let Some(v) = lookup("CFN_HELM_AWS_BINARY") {
            self.aws_binary = v;
        }
        if let Some(v) = lookup("CFN_HELM_SCRATCH_DIR") {
            self.paths = ScratchPaths::under(Path::new(&v));
        }
        Ok(())
    }

    /// Settings with every wait set to zero, for tests
    pub fn without_delays() -> Self {
        Self {
            connector_create_poll: Duration::ZERO,
            connector_pending_poll: Duration::ZERO,
            invoke_retry_delay: Duration::ZERO,
            update_retry_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Callback delay in whole seconds, as the orchestrator expects it
    pub fn callback_delay_seconds(&self) -> i64 {
        self.callback_delay.as_secs() as i64
    }
}

impl ScratchPaths {
    /// Scratch files inside `dir`
    pub fn under(dir: &Path) -> Self {
        Self {
            kubeconfig: dir.join("kubeConfig"),
            chart: dir.join("chart.tgz"),
            ca_file: dir.join("ca.pem"),
            values: dir.join("values.json"),
        }
    }
}

fn parse_duration(key: &str, raw: &str) -> Result<Duration> {
    humantime_serde::re::humantime::parse_duration(raw).map_err(|e| ProviderError::Config {
        message: format!("{}: {}", key, e),
    })
}

/// Region of a request, falling back to the environment
pub fn resolve_region(requested: Option<&str>) -> Option<String> {
    requested
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .or_else(|| std::env::var("AWS_REGION").ok().filter(|r| !r.is_empty()))
        .or_else(|| std::env::var("AWS_DEFAULT_REGION").ok().filter(|r| !r.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = ProviderSettings::default();
        assert_eq!(settings.default_timeout, Duration::from_secs(3600));
        assert_eq!(settings.callback_delay_seconds(), 30);
        assert_eq!(settings.retry_count, 3);
        assert_eq!(settings.connector.memory_size, 384);
        assert_eq!(settings.connector.timeout, 900);
        assert_eq!(settings.output_limit, 12288);
    }

    #[test]
    fn test_load_from_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(
            &path,
            "defaultTimeout: 90m\ncallbackDelay: 10s\nconnector:\n  memorySize: 512\n",
        )
        .unwrap();

        let settings = ProviderSettings::load_from(&path).unwrap();
        assert_eq!(settings.default_timeout, Duration::from_secs(90 * 60));
        assert_eq!(settings.callback_delay, Duration::from_secs(10));
        assert_eq!(settings.connector.memory_size, 512);
        assert_eq!(settings.connector.runtime, "provided.al2023");
        assert_eq!(settings.retry_count, 3);
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("CFN_HELM_DEFAULT_TIMEOUT", "2h"),
            ("CFN_HELM_RETRY_COUNT", "5"),
            ("CFN_HELM_SCRATCH_DIR", "/var/scratch"),
        ]
        .into_iter()
        .collect();

        let mut settings = ProviderSettings::default();
        settings
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(settings.default_timeout, Duration::from_secs(7200));
        assert_eq!(settings.retry_count, 5);
        assert_eq!(settings.paths.kubeconfig, PathBuf::from("/var/scratch/kubeConfig"));
    }

    #[test]
    fn test_invalid_override() {
        let mut settings = ProviderSettings::default();
        let err = settings
            .apply_overrides(|key| (key == "CFN_HELM_CALLBACK_DELAY").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("CFN_HELM_CALLBACK_DELAY"));
    }
}
