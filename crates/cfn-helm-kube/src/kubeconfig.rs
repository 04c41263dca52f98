//! Cluster access: kubeconfig rendering and client construction

use cfn_helm_aws::{ClusterApi, IdentityApi, SecretsApi};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::Serialize;
use std::path::Path;

use crate::error::{KubeError, Result};

/// Context name written into generated kubeconfigs
pub const CONTEXT_NAME: &str = "aws";

/// Where the kubeconfig of a release comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KubeconfigSource {
    /// Generated from the description of a managed cluster
    Cluster { name: String, role_arn: Option<String> },
    /// Stored verbatim in a secret
    Secret(String),
    /// Shipped with a connector event
    Inline(Vec<u8>),
}

impl KubeconfigSource {
    /// Pick the source from the release address
    pub fn from_address(
        cluster_id: Option<&str>,
        kube_config: Option<&str>,
        role_arn: Option<&str>,
    ) -> Result<Self> {
        match (cluster_id, kube_config) {
            (Some(_), Some(_)) => Err(KubeError::Kubeconfig(
                "both ClusterID or KubeConfig can not be specified".to_string(),
            )),
            (Some(name), None) => Ok(Self::Cluster {
                name: name.to_string(),
                role_arn: role_arn.map(str::to_string),
            }),
            (None, Some(secret)) => Ok(Self::Secret(secret.to_string())),
            (None, None) => Err(KubeError::Kubeconfig(
                "either ClusterID or KubeConfig must be specified".to_string(),
            )),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct KubeconfigDocument {
    api_version: &'static str,
    kind: &'static str,
    clusters: Vec<NamedEntry<ClusterEntry>>,
    contexts: Vec<NamedEntry<ContextEntry>>,
    users: Vec<NamedEntry<UserEntry>>,
    current_context: String,
}

#[derive(Serialize)]
struct NamedEntry<T> {
    name: String,
    #[serde(flatten)]
    entry: T,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    cluster: ClusterFields,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterFields {
    server: String,
    certificate_authority_data: String,
}

#[derive(Serialize)]
struct ContextEntry {
    context: ContextFields,
}

#[derive(Serialize)]
struct ContextFields {
    cluster: String,
    user: String,
}

#[derive(Serialize)]
struct UserEntry {
    user: UserFields,
}

#[derive(Serialize)]
struct UserFields {
    token: String,
}

/// Render a token-authenticated kubeconfig for one cluster
pub fn render_cluster_kubeconfig(
    cluster: &str,
    server: &str,
    ca_data: &str,
    token: &str,
) -> Result<Vec<u8>> {
    let doc = KubeconfigDocument {
        api_version: "v1",
        kind: "Config",
        clusters: vec![NamedEntry {
            name: cluster.to_string(),
            entry: ClusterEntry {
                cluster: ClusterFields {
                    server: server.to_string(),
                    certificate_authority_data: ca_data.to_string(),
                },
            },
        }],
        contexts: vec![NamedEntry {
            name: CONTEXT_NAME.to_string(),
            entry: ContextEntry {
                context: ContextFields {
                    cluster: cluster.to_string(),
                    user: CONTEXT_NAME.to_string(),
                },
            },
        }],
        users: vec![NamedEntry {
            name: CONTEXT_NAME.to_string(),
            entry: UserEntry {
                user: UserFields {
                    token: token.to_string(),
                },
            },
        }],
        current_context: CONTEXT_NAME.to_string(),
    };

    Ok(serde_yaml::to_string(&doc)?.into_bytes())
}

/// Resolve a kubeconfig source to file contents
pub async fn resolve_kubeconfig(
    source: &KubeconfigSource,
    clusters: &dyn ClusterApi,
    identity: &dyn IdentityApi,
    secrets: &dyn SecretsApi,
) -> Result<Vec<u8>> {
    match source {
        KubeconfigSource::Cluster { name, role_arn } => {
            let cluster = clusters.describe_cluster(name).await?;
            if cluster.status() != "ACTIVE" {
                return Err(KubeError::Kubeconfig(format!(
                    "cluster {} is in {} state",
                    name,
                    cluster.status()
                )));
            }

            let endpoint = cluster.endpoint.as_deref().ok_or_else(|| {
                KubeError::Kubeconfig(format!("cluster {} has no endpoint", name))
            })?;
            let ca_data = cluster
                .certificate_authority
                .as_ref()
                .and_then(|ca| ca.data.as_deref())
                .ok_or_else(|| {
                    KubeError::Kubeconfig(format!("cluster {} has no certificate authority", name))
                })?;

            let token = identity.cluster_token(name, role_arn.as_deref()).await?;
            tracing::debug!(cluster = %name, "generated kubeconfig from cluster");
            render_cluster_kubeconfig(name, endpoint, ca_data, &token)
        }
        KubeconfigSource::Secret(secret_id) => {
            tracing::debug!(secret = %secret_id, "reading kubeconfig from secret");
            Ok(secrets.secret_string(secret_id).await?.into_bytes())
        }
        KubeconfigSource::Inline(bytes) => Ok(bytes.clone()),
    }
}

/// Write a kubeconfig readable only by the current user
pub async fn write_kubeconfig(path: &Path, contents: &[u8]) -> Result<()> {
    tracing::info!(path = %path.display(), "writing kubeconfig file");
    tokio::fs::write(path, contents).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    Ok(())
}

/// Build an API client from a kubeconfig file
pub async fn client_from_file(path: &Path) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|e| KubeError::Kubeconfig(format!("failed to read kubeconfig: {}", e)))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| KubeError::Kubeconfig(format!("invalid kubeconfig: {}", e)))?;

    Ok(Client::try_from(config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfn_helm_aws::{CertificateAuthority, Cluster, MockAws};

    fn active_cluster() -> Cluster {
        Cluster {
            name: "eks".to_string(),
            status: Some("ACTIVE".to_string()),
            endpoint: Some("https://ABC.gr7.us-east-1.eks.amazonaws.com".to_string()),
            certificate_authority: Some(CertificateAuthority {
                data: Some("LS0tLS1CRUdJTg==".to_string()),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_source_selection() {
        assert_eq!(
            KubeconfigSource::from_address(Some("eks"), None, Some("arn:role")).unwrap(),
            KubeconfigSource::Cluster {
                name: "eks".to_string(),
                role_arn: Some("arn:role".to_string())
            }
        );
        assert_eq!(
            KubeconfigSource::from_address(None, Some("arn:secret"), None).unwrap(),
            KubeconfigSource::Secret("arn:secret".to_string())
        );
        assert!(KubeconfigSource::from_address(Some("a"), Some("b"), None).is_err());
        assert!(KubeconfigSource::from_address(None, None, None).is_err());
    }

    #[test]
    fn test_rendered_kubeconfig_parses() {
        let bytes = render_cluster_kubeconfig(
            "eks",
            "https://example.com",
            "LS0tLS1CRUdJTg==",
            "k8s-aws-v1.token",
        )
        .unwrap();

        let parsed: Kubeconfig = serde_yaml::from_slice(&bytes).unwrap();
        assert_eq!(parsed.current_context.as_deref(), Some("aws"));
        assert_eq!(parsed.clusters[0].name, "eks");
        assert_eq!(parsed.contexts[0].name, "aws");
        assert_eq!(parsed.auth_infos[0].name, "aws");
    }

    #[tokio::test]
    async fn test_resolve_from_cluster() {
        let aws = MockAws::new().with_cluster(active_cluster());
        let source = KubeconfigSource::Cluster {
            name: "eks".to_string(),
            role_arn: None,
        };

        let bytes = resolve_kubeconfig(&source, &aws, &aws, &aws).await.unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("server: https://ABC.gr7.us-east-1.eks.amazonaws.com"));
        assert!(text.contains("token: k8s-aws-v1.token-for-eks"));
        assert!(text.contains("current-context: aws"));
    }

    #[tokio::test]
    async fn test_resolve_rejects_inactive_cluster() {
        let mut cluster = active_cluster();
        cluster.status = Some("CREATING".to_string());
        let aws = MockAws::new().with_cluster(cluster);
        let source = KubeconfigSource::Cluster {
            name: "eks".to_string(),
            role_arn: None,
        };

        let err = resolve_kubeconfig(&source, &aws, &aws, &aws).await.unwrap_err();
        assert!(err.to_string().contains("CREATING"));
    }

    #[tokio::test]
    async fn test_resolve_from_secret() {
        let aws = MockAws::new().with_secret("arn:secret", "apiVersion: v1\nkind: Config\n");
        let source = KubeconfigSource::Secret("arn:secret".to_string());

        let bytes = resolve_kubeconfig(&source, &aws, &aws, &aws).await.unwrap();
        assert_eq!(bytes, b"apiVersion: v1\nkind: Config\n");
    }

    #[tokio::test]
    async fn test_write_kubeconfig_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubeConfig");
        write_kubeconfig(&path, b"kind: Config\n").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"kind: Config\n");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
