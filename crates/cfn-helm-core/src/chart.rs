//! Chart reference resolution
//!
//! A chart reference is either a *remote* `repo/name` pair resolved through a
//! chart repository, or a *local* chart addressed by URL (http(s), s3 or oci)
//! that has to be fetched before Helm can use it.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CoreError, Result};
use crate::model::HelmReleaseModel;

static CHART_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z]+").expect("valid regex"));

/// Repository name used when the chart reference has no `repo/` prefix
pub const DEFAULT_REPO: &str = "stable";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChartKind {
    /// Fetched from a URL into a local archive
    Local,
    /// Resolved through a named chart repository
    Remote,
}

/// Resolved chart inputs for an install or upgrade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChartDetails {
    /// What Helm is pointed at: `repo/name` or the local archive path
    pub chart: String,

    pub chart_name: String,

    /// Source URL of a local chart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_path: Option<String>,

    #[serde(rename = "ChartType")]
    pub kind: ChartKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_repo: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_version: Option<String>,

    #[serde(rename = "ChartRepoURL")]
    pub chart_repo_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_password: Option<String>,

    #[serde(rename = "ChartSkipTLSVerify", default)]
    pub skip_tls_verify: bool,

    /// `s3://` location of a CA bundle for the repository
    #[serde(rename = "ChartCAFile", default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,
}

impl ChartDetails {
    /// Resolve the chart reference of a model
    ///
    /// `local_path` is where a local chart archive is stored once fetched.
    pub fn resolve(model: &HelmReleaseModel, local_path: &str, stable_repo_url: &str) -> Result<Self> {
        let reference = model.chart.as_deref().ok_or(CoreError::ChartRequired)?;
        let options = model.repository_options.clone().unwrap_or_default();
        let credentials = options
            .basic_auth()
            .map(|(u, p)| (u.to_string(), p.to_string()));
        if let Some((user, _)) = &credentials {
            tracing::info!(username = %user, "using basic authentication for repository");
        }

        let url = Url::parse(reference)
            .ok()
            .filter(|u| u.host_str().is_some_and(|h| !h.is_empty()) || u.scheme().eq_ignore_ascii_case("oci"));

        let mut details = match url {
            Some(url) => Self {
                chart: local_path.to_string(),
                chart_name: local_chart_name(reference, &url)?,
                chart_path: Some(reference.to_string()),
                kind: ChartKind::Local,
                chart_repo: None,
                chart_version: None,
                chart_repo_url: String::new(),
                chart_username: credentials.as_ref().map(|(u, _)| u.clone()),
                chart_password: credentials.as_ref().map(|(_, p)| p.clone()),
                skip_tls_verify: false,
                ca_file: None,
            },
            None => {
                let (repo, name) = match reference.split_once('/') {
                    Some((repo, name)) => (repo.to_string(), name.to_string()),
                    None => (DEFAULT_REPO.to_string(), reference.to_string()),
                };
                if repo.is_empty() || name.is_empty() {
                    return Err(CoreError::InvalidChart {
                        chart: reference.to_string(),
                        reason: "expected repo/name".to_string(),
                    });
                }

                let ca_file = options.ca_file.as_deref().filter(|ca| !ca.is_empty()).and_then(|ca| {
                    match Url::parse(ca) {
                        Ok(u) if u.scheme().eq_ignore_ascii_case("s3") => Some(ca.to_string()),
                        _ => {
                            tracing::warn!(ca_file = %ca, "unsupported CAFile format, must be an S3 path; ignoring");
                            None
                        }
                    }
                });

                Self {
                    chart: format!("{}/{}", repo, name),
                    chart_name: name,
                    chart_path: None,
                    kind: ChartKind::Remote,
                    chart_repo: Some(repo),
                    chart_version: None,
                    chart_repo_url: String::new(),
                    chart_username: credentials.as_ref().map(|(u, _)| u.clone()),
                    chart_password: credentials.as_ref().map(|(_, p)| p.clone()),
                    skip_tls_verify: options.insecure_skip_tls_verify.unwrap_or(false),
                    ca_file,
                }
            }
        };

        details.chart_version = model.version.clone().filter(|v| !v.is_empty());
        details.chart_repo_url = model
            .repository
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| stable_repo_url.to_string());

        Ok(details)
    }
}

/// Chart name of a URL reference: the first run of letters in its last path segment
fn local_chart_name(reference: &str, url: &Url) -> Result<String> {
    let segment = url
        .path()
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or_default();

    CHART_NAME
        .find(segment)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| CoreError::InvalidChart {
            chart: reference.to_string(),
            reason: "cannot derive a chart name from the URL".to_string(),
        })
}

/// Release name, defaulting to `<chart>-<unix seconds>`
pub fn release_name(name: Option<&str>, chart_name: &str, now_unix: i64) -> String {
    match name {
        Some(n) if !n.is_empty() => n.to_string(),
        _ => format!("{}-{}", chart_name, now_unix),
    }
}

/// Release namespace, defaulting to `default`
pub fn release_namespace(namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => ns.to_string(),
        _ => "default".to_string(),
    }
}
