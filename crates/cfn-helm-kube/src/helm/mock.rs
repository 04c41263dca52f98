//! In-memory release manager for testing

use async_trait::async_trait;
use cfn_helm_core::{ChartDetails, HelmListData, HelmStatusData, ReleaseConfig, ReleaseStatus, Values};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{ReleaseManager, ReleaseState, filter_releases};
use crate::error::{KubeError, Result};

#[derive(Default)]
struct MockState {
    releases: HashMap<(String, String), HelmStatusData>,
    /// Status given to releases on install and upgrade
    deploy_status: Option<ReleaseStatus>,
    manifest: String,
    /// Operation name -> error message
    failures: HashMap<String, String>,
    calls: Vec<String>,
    values: HashMap<(String, String), Values>,
}

/// Release manager holding releases in memory
#[derive(Clone, Default)]
pub struct MockReleaseManager {
    state: Arc<RwLock<MockState>>,
}

fn key(config: &ReleaseConfig) -> (String, String) {
    (config.namespace.clone(), config.name.clone())
}

fn not_found(config: &ReleaseConfig) -> KubeError {
    KubeError::ReleaseNotFound {
        name: config.name.clone(),
        namespace: config.namespace.clone(),
    }
}

impl MockReleaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an existing release
    pub fn with_release(self, status: HelmStatusData) -> Self {
        {
            let mut state = self.state.write().unwrap();
            state
                .releases
                .insert((status.namespace.clone(), status.name.clone()), status);
        }
        self
    }

    /// Manifest recorded for installed and upgraded releases
    pub fn with_manifest(self, manifest: &str) -> Self {
        self.state.write().unwrap().manifest = manifest.to_string();
        self
    }

    /// Status recorded for installed and upgraded releases, `deployed` by default
    pub fn with_deploy_status(self, status: ReleaseStatus) -> Self {
        self.state.write().unwrap().deploy_status = Some(status);
        self
    }

    /// Make an operation (`install`, `upgrade`, `uninstall`, `status`, `list`) fail
    pub fn with_failure(self, operation: &str, message: &str) -> Self {
        self.state
            .write()
            .unwrap()
            .failures
            .insert(operation.to_string(), message.to_string());
        self
    }

    pub fn release(&self, name: &str, namespace: &str) -> Option<HelmStatusData> {
        self.state
            .read()
            .unwrap()
            .releases
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn set_status(&self, name: &str, namespace: &str, status: ReleaseStatus) {
        if let Some(release) = self
            .state
            .write()
            .unwrap()
            .releases
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            release.status = status;
        }
    }

    /// Values passed to the last install or upgrade of a release
    pub fn values(&self, name: &str, namespace: &str) -> Option<Values> {
        self.state
            .read()
            .unwrap()
            .values
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Operations in call order
    pub fn calls(&self) -> Vec<String> {
        self.state.read().unwrap().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.state
            .read()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.as_str() == operation)
            .count()
    }

    fn record(&self, operation: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        state.calls.push(operation.to_string());
        match state.failures.get(operation) {
            Some(message) => Err(KubeError::Helm {
                command: operation.to_string(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    /// All releases, sorted by namespace then name
    fn entries(&self) -> Vec<HelmListData> {
        let state = self.state.read().unwrap();
        let mut entries: Vec<HelmListData> = state
            .releases
            .values()
            .map(|r| HelmListData {
                release_name: r.name.clone(),
                chart_name: r.chart_name.clone(),
                chart_version: r.chart_version.clone(),
                chart: r.chart.clone(),
                namespace: r.namespace.clone(),
                description: r.description.clone(),
            })
            .collect();
        entries.sort_by(|a, b| (&a.namespace, &a.release_name).cmp(&(&b.namespace, &b.release_name)));
        entries
    }

    fn deploy(&self, config: &ReleaseConfig, chart: &ChartDetails, values: &Values, id: &str) {
        let mut state = self.state.write().unwrap();
        let version = chart.chart_version.clone().unwrap_or_else(|| "1.0.0".to_string());
        let release = HelmStatusData {
            name: config.name.clone(),
            namespace: config.namespace.clone(),
            status: state.deploy_status.clone().unwrap_or(ReleaseStatus::Deployed),
            description: id.to_string(),
            chart: format!("{}-{}", chart.chart_name, version),
            chart_name: chart.chart_name.clone(),
            chart_version: version,
            manifest: state.manifest.clone(),
        };
        state.releases.insert(key(config), release);
        state.values.insert(key(config), values.clone());
    }
}

#[async_trait]
impl ReleaseManager for MockReleaseManager {
    async fn status(&self, config: &ReleaseConfig) -> Result<HelmStatusData> {
        self.record("status")?;
        self.state
            .read()
            .unwrap()
            .releases
            .get(&key(config))
            .cloned()
            .ok_or_else(|| not_found(config))
    }

    async fn install(
        &self,
        config: &ReleaseConfig,
        chart: &ChartDetails,
        values: &Values,
        id: &str,
    ) -> Result<()> {
        match self.verify_release(config, id).await? {
            ReleaseState::Pending => return Ok(()),
            ReleaseState::Found => {
                return Err(KubeError::ReleaseAlreadyExists {
                    name: config.name.clone(),
                    namespace: config.namespace.clone(),
                });
            }
            ReleaseState::NotFound => {}
        }
        self.record("install")?;
        self.deploy(config, chart, values, id);
        Ok(())
    }

    async fn upgrade(
        &self,
        config: &ReleaseConfig,
        chart: &ChartDetails,
        values: &Values,
        id: &str,
    ) -> Result<()> {
        match self.verify_release(config, id).await? {
            ReleaseState::Pending => Ok(()),
            ReleaseState::NotFound => Err(not_found(config)),
            ReleaseState::Found => {
                self.record("upgrade")?;
                self.deploy(config, chart, values, id);
                Ok(())
            }
        }
    }

    async fn uninstall(&self, config: &ReleaseConfig) -> Result<()> {
        self.record("uninstall")?;
        self.state
            .write()
            .unwrap()
            .releases
            .remove(&key(config))
            .map(|_| ())
            .ok_or_else(|| not_found(config))
    }

    async fn list(&self, config: &ReleaseConfig, chart: &ChartDetails) -> Result<Vec<HelmListData>> {
        self.record("list")?;
        let releases = self
            .entries()
            .into_iter()
            .map(|r| HelmListData {
                description: String::new(),
                ..r
            })
            .collect();
        Ok(filter_releases(releases, config, chart))
    }

    async fn list_all(&self) -> Result<Vec<HelmListData>> {
        self.record("list")?;
        Ok(self.entries())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfn_helm_core::ChartKind;

    fn chart() -> ChartDetails {
        ChartDetails {
            chart: "stable/nginx".to_string(),
            chart_name: "nginx".to_string(),
            chart_path: None,
            kind: ChartKind::Remote,
            chart_repo: Some("stable".to_string()),
            chart_version: None,
            chart_repo_url: "https://charts.helm.sh/stable".to_string(),
            chart_username: None,
            chart_password: None,
            skip_tls_verify: false,
            ca_file: None,
        }
    }

    #[tokio::test]
    async fn test_install_then_reinstall() {
        let helm = MockReleaseManager::new();
        let config = ReleaseConfig::new("web", "default");

        helm.install(&config, &chart(), &Values::new(), "id-1").await.unwrap();
        assert_eq!(helm.release("web", "default").unwrap().description, "id-1");

        let err = helm
            .install(&config, &chart(), &Values::new(), "id-1")
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(helm.call_count("install"), 1);
    }

    #[tokio::test]
    async fn test_upgrade_missing_release() {
        let helm = MockReleaseManager::new();
        let err = helm
            .upgrade(&ReleaseConfig::new("web", "default"), &chart(), &Values::new(), "id-1")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(helm.call_count("upgrade"), 0);
    }

    #[tokio::test]
    async fn test_pending_release_is_left_alone() {
        let helm = MockReleaseManager::new().with_deploy_status(ReleaseStatus::PendingInstall);
        let config = ReleaseConfig::new("web", "default");

        helm.install(&config, &chart(), &Values::new(), "id-1").await.unwrap();
        helm.install(&config, &chart(), &Values::new(), "id-1").await.unwrap();
        assert_eq!(helm.call_count("install"), 1);
    }

    #[tokio::test]
    async fn test_uninstall_and_list() {
        let helm = MockReleaseManager::new();
        let config = ReleaseConfig::new("web", "default");
        helm.install(&config, &chart(), &Values::new(), "id-1").await.unwrap();

        assert_eq!(helm.list(&config, &chart()).await.unwrap().len(), 1);
        helm.uninstall(&config).await.unwrap();
        assert!(helm.uninstall(&config).await.unwrap_err().is_not_found());
        assert!(helm.list(&config, &chart()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_all_spans_namespaces() {
        let helm = MockReleaseManager::new();
        let web = ReleaseConfig::new("web", "default");
        let api = ReleaseConfig::new("api", "apps");
        helm.install(&web, &chart(), &Values::new(), "id-web").await.unwrap();
        helm.install(&api, &chart(), &Values::new(), "id-api").await.unwrap();

        let all = helm.list_all().await.unwrap();
        let owners: Vec<_> = all.iter().map(|r| (r.release_name.as_str(), r.description.as_str())).collect();
        assert_eq!(owners, vec![("api", "id-api"), ("web", "id-web")]);

        // chart listings stay scoped and carry no identity
        let scoped = helm.list(&web, &chart()).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert!(scoped[0].description.is_empty());
    }
}
