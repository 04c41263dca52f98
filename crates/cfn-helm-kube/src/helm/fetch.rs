//! Local chart downloads
//!
//! A local chart is addressed by URL and downloaded to a scratch archive before
//! Helm sees it:
//! - `s3://bucket/key` through the object store, after discovering the bucket region
//! - `oci://host/repo/chart:tag` with `helm pull`, logging in to ECR when the host is one
//! - anything else over HTTP(S), with optional basic auth

use cfn_helm_aws::{ObjectStoreApi, RegistryApi};
use once_cell::sync::Lazy;
use regex::Regex;
use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use url::Url;

use super::cli::run_helm;
use crate::error::{KubeError, Result};

static ECR_HOST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(\d+)\.dkr\.ecr\.([a-z]+-[a-z]+-\d+)\.amazonaws\.com").expect("valid regex")
});

/// Split an `s3://bucket/key` URL
pub fn parse_s3_url(location: &str) -> Result<(String, String)> {
    let url = Url::parse(location).map_err(|e| KubeError::ChartFetch {
        chart: location.to_string(),
        message: e.to_string(),
    })?;
    let bucket = url.host_str().unwrap_or_default().to_string();
    let key = url.path().trim_start_matches('/').to_string();
    if bucket.is_empty() || key.is_empty() {
        return Err(KubeError::ChartFetch {
            chart: location.to_string(),
            message: "expected s3://bucket/key".to_string(),
        });
    }
    Ok((bucket, key))
}

/// Download an `s3://` object, discovering the bucket region first
pub async fn download_s3(objects: &dyn ObjectStoreApi, location: &str) -> Result<Vec<u8>> {
    let (bucket, key) = parse_s3_url(location)?;
    let region = objects.bucket_region(&bucket).await?;
    tracing::debug!(bucket = %bucket, key = %key, region = %region, "downloading object");
    Ok(objects.get_object(&bucket, &key, &region).await?)
}

/// Account and region of an ECR registry host
pub fn ecr_registry(host: &str) -> Option<(String, String)> {
    ECR_HOST
        .captures(host)
        .map(|caps| (caps[1].to_string(), caps[2].to_lowercase()))
}

/// Downloads local charts into a scratch archive
pub struct ChartFetcher {
    objects: Arc<dyn ObjectStoreApi>,
    registry: Arc<dyn RegistryApi>,
    http: reqwest::Client,
    helm: String,
}

impl ChartFetcher {
    pub fn new(
        objects: Arc<dyn ObjectStoreApi>,
        registry: Arc<dyn RegistryApi>,
        helm: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("cfn-helm/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            objects,
            registry,
            http,
            helm: helm.into(),
        })
    }

    pub fn objects(&self) -> &dyn ObjectStoreApi {
        self.objects.as_ref()
    }

    /// Download the chart at `source` to `dest`
    pub async fn fetch(
        &self,
        source: &str,
        username: Option<&str>,
        password: Option<&str>,
        dest: &Path,
    ) -> Result<()> {
        let url = Url::parse(source).map_err(|e| KubeError::ChartFetch {
            chart: source.to_string(),
            message: e.to_string(),
        })?;
        let credentials = username.zip(password).filter(|(u, p)| !u.is_empty() && !p.is_empty());

        match url.scheme().to_ascii_lowercase().as_str() {
            "s3" => {
                let bytes = download_s3(self.objects.as_ref(), source).await?;
                tokio::fs::write(dest, bytes).await?;
            }
            "oci" => self.fetch_oci(&url, credentials, dest).await?,
            _ => self.fetch_http(source, credentials, dest).await?,
        }

        tracing::info!(chart = %source, path = %dest.display(), "downloaded chart");
        Ok(())
    }

    async fn fetch_http(
        &self,
        source: &str,
        credentials: Option<(&str, &str)>,
        dest: &Path,
    ) -> Result<()> {
        let mut request = self.http.get(source);
        if let Some((username, password)) = credentials {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(KubeError::ChartFetch {
                chart: source.to_string(),
                message: format!("got response {}", status.as_u16()),
            });
        }

        let body = response.bytes().await?;
        tokio::fs::write(dest, &body).await?;
        Ok(())
    }

    async fn fetch_oci(
        &self,
        url: &Url,
        credentials: Option<(&str, &str)>,
        dest: &Path,
    ) -> Result<()> {
        let host = match url.port() {
            Some(port) => format!("{}:{}", url.host_str().unwrap_or_default(), port),
            None => url.host_str().unwrap_or_default().to_string(),
        };

        let mut login = credentials.map(|(u, p)| (u.to_string(), p.to_string()));
        if let Some((account, region)) = ecr_registry(&host) {
            let auth = self.registry.authorization(&account, &region).await?;
            login = Some((auth.username, auth.password));
        }

        if let Some((username, password)) = &login {
            let args: Vec<OsString> = vec![
                "registry".into(),
                "login".into(),
                host.clone().into(),
                "--username".into(),
                username.into(),
                "--password-stdin".into(),
            ];
            run_helm(&self.helm, args, Some(password.as_bytes())).await?;
        }

        let scratch = tempfile::tempdir()?;
        let pulled = run_helm(
            &self.helm,
            vec![
                "pull".into(),
                url.as_str().into(),
                "--destination".into(),
                scratch.path().into(),
            ],
            None,
        )
        .await;

        if login.is_some() {
            let logout = vec!["registry".into(), "logout".into(), host.clone().into()];
            if let Err(e) = run_helm(&self.helm, logout, None).await {
                tracing::debug!(registry = %host, error = %e, "registry logout failed");
            }
        }
        pulled?;

        let mut entries = tokio::fs::read_dir(scratch.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().is_some_and(|ext| ext == "tgz") {
                tokio::fs::copy(entry.path(), dest).await?;
                return Ok(());
            }
        }

        Err(KubeError::ChartFetch {
            chart: url.to_string(),
            message: "pull produced no chart archive".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfn_helm_aws::MockAws;
    use wiremock::matchers::{basic_auth, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(aws: MockAws) -> ChartFetcher {
        let aws = Arc::new(aws);
        ChartFetcher::new(aws.clone(), aws, "helm").unwrap()
    }

    #[test]
    fn test_parse_s3_url() {
        assert_eq!(
            parse_s3_url("s3://charts/stable/web-1.0.0.tgz").unwrap(),
            ("charts".to_string(), "stable/web-1.0.0.tgz".to_string())
        );
        assert!(parse_s3_url("s3://charts").is_err());
    }

    #[test]
    fn test_ecr_registry() {
        assert_eq!(
            ecr_registry("123456789012.dkr.ecr.eu-west-1.amazonaws.com"),
            Some(("123456789012".to_string(), "eu-west-1".to_string()))
        );
        assert_eq!(ecr_registry("ghcr.io"), None);
    }

    #[tokio::test]
    async fn test_fetch_from_object_store() {
        let aws = MockAws::new().with_object("charts", "web-1.0.0.tgz", "eu-west-1", b"archive");
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("chart.tgz");

        fetcher(aws)
            .fetch("s3://charts/web-1.0.0.tgz", None, None, &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"archive");
    }

    #[tokio::test]
    async fn test_fetch_over_http_with_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/charts/web-1.0.0.tgz"))
            .and(basic_auth("user", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"archive".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("chart.tgz");
        let url = format!("{}/charts/web-1.0.0.tgz", server.uri());

        fetcher(MockAws::new())
            .fetch(&url, Some("user"), Some("secret"), &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"archive");
    }

    #[tokio::test]
    async fn test_fetch_over_http_rejects_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}/charts/missing.tgz", server.uri());
        let err = fetcher(MockAws::new())
            .fetch(&url, None, None, &dir.path().join("chart.tgz"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("got response 404"));
    }
}
