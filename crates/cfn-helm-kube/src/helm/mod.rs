//! Release management
//!
//! [`ReleaseManager`] is the seam between the handlers and Helm. The
//! production implementation drives the `helm` executable ([`HelmCli`]); tests
//! use [`MockReleaseManager`].

mod cli;
mod fetch;
mod mock;

pub use cli::{HelmCli, HelmPaths};
pub use fetch::{ChartFetcher, download_s3, ecr_registry, parse_s3_url};
pub use mock::MockReleaseManager;

use async_trait::async_trait;
use cfn_helm_core::{ChartDetails, HelmListData, HelmStatusData, ReleaseConfig, ReleaseStatus, Values};

use crate::error::{KubeError, Result};

/// What an existing release means for an install or upgrade carrying `id`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseState {
    /// Deployed and owned by the same resource
    Found,
    NotFound,
    /// An operation is still in flight
    Pending,
}

/// Classify a status lookup against the identity of the caller
pub fn classify_release(
    config: &ReleaseConfig,
    status: Result<HelmStatusData>,
    id: &str,
) -> Result<ReleaseState> {
    let status = match status {
        Ok(status) => status,
        Err(e) if e.is_not_found() => return Ok(ReleaseState::NotFound),
        Err(e) => return Err(e),
    };

    match status.status {
        s if s.is_pending() => {
            tracing::info!(release = %config.name, status = %s, "release is pending");
            Ok(ReleaseState::Pending)
        }
        ReleaseStatus::Deployed if status.description == id => Ok(ReleaseState::Found),
        ReleaseStatus::Deployed => Err(KubeError::ReleaseConflict {
            name: config.name.clone(),
            namespace: config.namespace.clone(),
        }),
        other => Err(KubeError::ReleaseFailed {
            name: config.name.clone(),
            namespace: config.namespace.clone(),
            status: other.to_string(),
        }),
    }
}

/// Helm release operations
#[async_trait]
pub trait ReleaseManager: Send + Sync {
    /// Current status of a release; absent releases are `ReleaseNotFound`
    async fn status(&self, config: &ReleaseConfig) -> Result<HelmStatusData>;

    /// Install a release tagged with `id`
    ///
    /// A deployed release with the same `id` is `ReleaseAlreadyExists` and a
    /// pending one is left alone.
    async fn install(
        &self,
        config: &ReleaseConfig,
        chart: &ChartDetails,
        values: &Values,
        id: &str,
    ) -> Result<()>;

    /// Upgrade a release tagged with `id`; absent releases are `ReleaseNotFound`
    async fn upgrade(
        &self,
        config: &ReleaseConfig,
        chart: &ChartDetails,
        values: &Values,
        id: &str,
    ) -> Result<()>;

    async fn uninstall(&self, config: &ReleaseConfig) -> Result<()>;

    /// Releases of `chart` in the namespace of `config`
    async fn list(&self, config: &ReleaseConfig, chart: &ChartDetails) -> Result<Vec<HelmListData>>;

    /// Every release in the cluster, with its description
    async fn list_all(&self) -> Result<Vec<HelmListData>>;

    async fn verify_release(&self, config: &ReleaseConfig, id: &str) -> Result<ReleaseState> {
        classify_release(config, self.status(config).await, id)
    }
}

/// Keep the releases of one chart (and version, when pinned) in one namespace
pub fn filter_releases(
    releases: Vec<HelmListData>,
    config: &ReleaseConfig,
    chart: &ChartDetails,
) -> Vec<HelmListData> {
    releases
        .into_iter()
        .filter(|r| r.namespace == config.namespace && r.chart_name == chart.chart_name)
        .filter(|r| {
            chart
                .chart_version
                .as_deref()
                .is_none_or(|v| r.chart_version == v)
        })
        .collect()
}
