//! `helm` command line backend

use async_trait::async_trait;
use cfn_helm_core::{
    ChartDetails, ChartKind, HelmListData, HelmStatusData, ReleaseConfig, ReleaseStatus, Values,
};
use futures::future::join_all;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::fetch::{ChartFetcher, download_s3};
use super::{ReleaseManager, ReleaseState, filter_releases};
use crate::error::{KubeError, Result};

/// Run `helm` and return its stdout
pub(super) async fn run_helm(binary: &str, args: Vec<OsString>, stdin: Option<&[u8]>) -> Result<String> {
    let command = args
        .first()
        .map(|a| a.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut cmd = Command::new(binary);
    cmd.args(&args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    tracing::debug!(command = %command, "running helm");
    let mut child = cmd.spawn()?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input).await?;
        drop(pipe);
    }

    let output = child.wait_with_output().await?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(KubeError::Helm {
            command,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Scratch files used by the `helm` backend
#[derive(Debug, Clone)]
pub struct HelmPaths {
    pub kubeconfig: PathBuf,
    /// Where local chart archives are downloaded
    pub chart: PathBuf,
    pub ca_file: PathBuf,
    pub values: PathBuf,
}

#[derive(Deserialize)]
struct StatusOutput {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    info: Option<StatusInfo>,
    #[serde(default)]
    chart: Option<ChartOutput>,
    #[serde(default)]
    manifest: String,
}

#[derive(Deserialize)]
struct StatusInfo {
    #[serde(default)]
    status: String,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct ChartOutput {
    metadata: ChartMetadata,
}

#[derive(Deserialize)]
struct ChartMetadata {
    name: String,
    #[serde(default)]
    version: String,
}

#[derive(Deserialize)]
struct ListEntry {
    name: String,
    namespace: String,
    chart: String,
}

#[derive(Deserialize)]
struct RepoEntry {
    name: String,
    url: String,
}

impl From<StatusOutput> for HelmStatusData {
    fn from(out: StatusOutput) -> Self {
        let (status, description) = out
            .info
            .map(|i| (ReleaseStatus::parse(&i.status), i.description))
            .unwrap_or_default();
        let (chart_name, chart_version) = out
            .chart
            .map(|c| (c.metadata.name, c.metadata.version))
            .unwrap_or_default();

        Self {
            chart: if chart_name.is_empty() {
                String::new()
            } else {
                format!("{}-{}", chart_name, chart_version)
            },
            name: out.name,
            namespace: out.namespace,
            status,
            description,
            chart_name,
            chart_version,
            manifest: out.manifest,
        }
    }
}

/// Split a `name-version` chart label at the last dash followed by a digit
pub fn split_chart_label(label: &str) -> (String, String) {
    let split = label
        .char_indices()
        .filter(|(i, c)| *c == '-' && label[i + 1..].starts_with(|n: char| n.is_ascii_digit()))
        .map(|(i, _)| i)
        .last();

    match split {
        Some(i) => (label[..i].to_string(), label[i + 1..].to_string()),
        None => (label.to_string(), String::new()),
    }
}

fn is_missing_release(err: &KubeError) -> bool {
    matches!(err, KubeError::Helm { message, .. } if message.contains("not found"))
}

/// Release manager driving the `helm` executable
pub struct HelmCli {
    binary: String,
    paths: HelmPaths,
    fetcher: ChartFetcher,
}

impl HelmCli {
    pub fn new(binary: impl Into<String>, paths: HelmPaths, fetcher: ChartFetcher) -> Self {
        Self {
            binary: binary.into(),
            paths,
            fetcher,
        }
    }

    async fn helm(&self, args: Vec<OsString>) -> Result<String> {
        run_helm(&self.binary, args, None).await
    }

    fn cluster_args(&self, namespace: &str) -> Vec<OsString> {
        vec![
            "--kubeconfig".into(),
            self.paths.kubeconfig.clone().into(),
            "--namespace".into(),
            namespace.into(),
        ]
    }

    /// Chart reference plus the flags needed to resolve it
    async fn locate_chart(&self, chart: &ChartDetails) -> Result<Vec<OsString>> {
        let mut args: Vec<OsString> = Vec::new();

        match chart.kind {
            ChartKind::Remote => {
                self.add_repository(chart).await?;
                args.push(chart.chart.clone().into());
                if let Some((username, password)) = credentials(chart) {
                    args.extend(["--username".into(), username.into(), "--password".into(), password.into()]);
                }
                if chart.skip_tls_verify {
                    args.push("--insecure-skip-tls-verify".into());
                }
                if chart.ca_file.is_some() {
                    args.extend(["--ca-file".into(), self.paths.ca_file.clone().into()]);
                }
                if let Some(version) = chart.chart_version.as_deref() {
                    args.extend(["--version".into(), version.into()]);
                }
            }
            ChartKind::Local => {
                let source = chart.chart_path.as_deref().ok_or_else(|| KubeError::ChartFetch {
                    chart: chart.chart_name.clone(),
                    message: "local chart has no source URL".to_string(),
                })?;
                let creds = credentials(chart);
                self.fetcher
                    .fetch(source, creds.map(|c| c.0), creds.map(|c| c.1), &self.paths.chart)
                    .await?;
                args.push(self.paths.chart.clone().into());
            }
        }

        Ok(args)
    }

    async fn add_repository(&self, chart: &ChartDetails) -> Result<()> {
        let repo = chart.chart_repo.as_deref().unwrap_or(cfn_helm_core::chart::DEFAULT_REPO);

        if let Some(ca) = chart.ca_file.as_deref() {
            let bundle = download_s3(self.fetcher.objects(), ca).await?;
            tokio::fs::write(&self.paths.ca_file, bundle).await?;
        }

        let mut args: Vec<OsString> = vec![
            "repo".into(),
            "add".into(),
            repo.into(),
            chart.chart_repo_url.clone().into(),
            "--force-update".into(),
        ];
        if let Some((username, password)) = credentials(chart) {
            args.extend(["--username".into(), username.into(), "--password".into(), password.into()]);
        }
        if chart.skip_tls_verify {
            args.push("--insecure-skip-tls-verify".into());
        }
        if chart.ca_file.is_some() {
            args.extend(["--ca-file".into(), self.paths.ca_file.clone().into()]);
        }

        self.helm(args).await.map_err(|e| KubeError::ChartFetch {
            chart: chart.chart.clone(),
            message: format!(
                "looks like {:?} is not a valid chart repository or cannot be reached: {}",
                chart.chart_repo_url, e
            ),
        })?;
        tracing::info!(repo = %repo, "repository has been added");

        self.refresh_repositories().await;
        Ok(())
    }

    /// Refresh every configured repository index; failures are only logged
    async fn refresh_repositories(&self) {
        let repos: Vec<RepoEntry> = match self
            .helm(vec!["repo".into(), "list".into(), "-o".into(), "json".into()])
            .await
            .and_then(|out| Ok(serde_json::from_str(&out)?))
        {
            Ok(repos) => repos,
            Err(e) => {
                tracing::warn!(error = %e, "unable to list chart repositories");
                return;
            }
        };

        let updates = repos.iter().map(|repo| async move {
            let result = self
                .helm(vec!["repo".into(), "update".into(), repo.name.clone().into()])
                .await;
            (repo, result)
        });

        for (repo, result) in join_all(updates).await {
            match result {
                Ok(_) => tracing::info!(repo = %repo.name, "successfully got an update from the chart repository"),
                Err(e) => tracing::warn!(repo = %repo.name, url = %repo.url, error = %e, "unable to get an update from the chart repository"),
            }
        }
    }

    /// Releases in every namespace, as `helm list` reports them
    async fn list_entries(&self) -> Result<Vec<HelmListData>> {
        let args: Vec<OsString> = vec![
            "list".into(),
            "--all".into(),
            "--all-namespaces".into(),
            "-o".into(),
            "json".into(),
            "--kubeconfig".into(),
            self.paths.kubeconfig.clone().into(),
        ];
        let entries: Vec<ListEntry> = serde_json::from_str(&self.helm(args).await?)?;

        Ok(entries
            .into_iter()
            .map(|entry| {
                let (chart_name, chart_version) = split_chart_label(&entry.chart);
                HelmListData {
                    release_name: entry.name,
                    namespace: entry.namespace,
                    chart_name,
                    chart_version,
                    chart: entry.chart,
                    description: String::new(),
                }
            })
            .collect())
    }

    async fn write_values(&self, values: &Values) -> Result<OsString> {
        tokio::fs::write(&self.paths.values, serde_json::to_vec(values.inner())?).await?;
        Ok(self.paths.values.clone().into())
    }

    async fn deploy(
        &self,
        verb: &str,
        config: &ReleaseConfig,
        chart: &ChartDetails,
        values: &Values,
        id: &str,
    ) -> Result<()> {
        let mut args: Vec<OsString> = vec![verb.into(), config.name.clone().into()];
        args.extend(self.locate_chart(chart).await?);
        args.extend(["--description".into(), id.into(), "--values".into(), self.write_values(values).await?]);
        if verb == "install" {
            args.push("--create-namespace".into());
        }
        args.extend(self.cluster_args(&config.namespace));

        self.helm(args).await?;
        Ok(())
    }
}

fn credentials(chart: &ChartDetails) -> Option<(&str, &str)> {
    chart
        .chart_username
        .as_deref()
        .zip(chart.chart_password.as_deref())
        .filter(|(u, p)| !u.is_empty() && !p.is_empty())
}

#[async_trait]
impl ReleaseManager for HelmCli {
    async fn status(&self, config: &ReleaseConfig) -> Result<HelmStatusData> {
        tracing::info!(release = %config.name, "checking release status");
        let mut args: Vec<OsString> = vec!["status".into(), config.name.clone().into(), "-o".into(), "json".into()];
        args.extend(self.cluster_args(&config.namespace));

        let out = self.helm(args).await.map_err(|e| {
            if is_missing_release(&e) {
                KubeError::ReleaseNotFound {
                    name: config.name.clone(),
                    namespace: config.namespace.clone(),
                }
            } else {
                e
            }
        })?;

        let status: HelmStatusData = serde_json::from_str::<StatusOutput>(&out)?.into();
        tracing::info!(release = %config.name, status = %status.status, "found release");
        Ok(status)
    }

    async fn install(
        &self,
        config: &ReleaseConfig,
        chart: &ChartDetails,
        values: &Values,
        id: &str,
    ) -> Result<()> {
        match self.verify_release(config, id).await? {
            ReleaseState::Pending => {
                tracing::info!(release = %config.name, "release is pending, skipping install");
                return Ok(());
            }
            ReleaseState::Found => {
                return Err(KubeError::ReleaseAlreadyExists {
                    name: config.name.clone(),
                    namespace: config.namespace.clone(),
                });
            }
            ReleaseState::NotFound => {}
        }

        tracing::info!(release = %config.name, namespace = %config.namespace, "installing release");
        self.deploy("install", config, chart, values, id).await?;
        tracing::info!(release = %config.name, "release installed, waiting for resources to stabilize");
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
            ReleaseState::Pending => {
                tracing::info!(release = %config.name, "release is pending, skipping upgrade");
                Ok(())
            }
            ReleaseState::NotFound => Err(KubeError::ReleaseNotFound {
                name: config.name.clone(),
                namespace: config.namespace.clone(),
            }),
            ReleaseState::Found => {
                tracing::info!(release = %config.name, "upgrading release");
                self.deploy("upgrade", config, chart, values, id).await?;
                tracing::info!(release = %config.name, "release upgraded");
                Ok(())
            }
        }
    }

    async fn uninstall(&self, config: &ReleaseConfig) -> Result<()> {
        tracing::info!(release = %config.name, "uninstalling release");
        let mut args: Vec<OsString> = vec!["uninstall".into(), config.name.clone().into()];
        args.extend(self.cluster_args(&config.namespace));

        match self.helm(args).await {
            Ok(_) => {
                tracing::info!(release = %config.name, "release uninstalled");
                Ok(())
            }
            Err(e) if is_missing_release(&e) => Err(KubeError::ReleaseNotFound {
                name: config.name.clone(),
                namespace: config.namespace.clone(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, config: &ReleaseConfig, chart: &ChartDetails) -> Result<Vec<HelmListData>> {
        Ok(filter_releases(self.list_entries().await?, config, chart))
    }

    async fn list_all(&self) -> Result<Vec<HelmListData>> {
        let entries = self.list_entries().await?;
        let configs: Vec<ReleaseConfig> = entries
            .iter()
            .map(|e| ReleaseConfig::new(e.release_name.clone(), e.namespace.clone()))
            .collect();
        let statuses = join_all(configs.iter().map(|config| self.status(config))).await;

        let mut releases = Vec::with_capacity(entries.len());
        for (entry, status) in entries.into_iter().zip(statuses) {
            match status {
                Ok(status) => releases.push(HelmListData {
                    description: status.description,
                    ..entry
                }),
                // uninstalled between the listing and the lookup
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(releases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_chart_label() {
        assert_eq!(
            split_chart_label("nginx-1.2.3"),
            ("nginx".to_string(), "1.2.3".to_string())
        );
        assert_eq!(
            split_chart_label("ingress-nginx-4.0.0-rc1"),
            ("ingress-nginx".to_string(), "4.0.0-rc1".to_string())
        );
        assert_eq!(split_chart_label("nover"), ("nover".to_string(), String::new()));
    }

    #[test]
    fn test_status_output() {
        let out = r#"{
            "name": "web",
            "namespace": "default",
            "info": {"status": "pending-upgrade", "description": "token"},
            "chart": {"metadata": {"name": "nginx", "version": "1.2.3"}},
            "manifest": "---\nkind: Service\n",
            "version": 2
        }"#;
        let status: HelmStatusData = serde_json::from_str::<StatusOutput>(out).unwrap().into();
        assert_eq!(status.status, ReleaseStatus::PendingUpgrade);
        assert_eq!(status.description, "token");
        assert_eq!(status.chart, "nginx-1.2.3");
        assert_eq!(status.chart_name, "nginx");
        assert_eq!(status.manifest, "---\nkind: Service\n");
    }

    #[test]
    fn test_missing_release_detection() {
        let err = KubeError::Helm {
            command: "status".to_string(),
            message: "Error: release: not found".to_string(),
        };
        assert!(is_missing_release(&err));

        let err = KubeError::Helm {
            command: "status".to_string(),
            message: "Error: Kubernetes cluster unreachable".to_string(),
        };
        assert!(!is_missing_release(&err));
    }
}
