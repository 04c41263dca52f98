//! Resource models exchanged with CloudFormation
//!
//! Property names follow the resource type schemas (PascalCase). The handler
//! runtime may deliver scalar properties as strings, so numeric and boolean
//! fields accept either form.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Desired state of an `AWSQS::Kubernetes::Helm` resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HelmReleaseModel {
    /// EKS cluster name (mutually exclusive with `kube_config`)
    #[serde(rename = "ClusterID", skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,

    /// Secrets Manager identifier holding a kubeconfig
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kube_config: Option<String>,

    /// Role used to request the cluster token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Chart reference: `repo/name`, `name`, an http(s)/s3 URL or an `oci://` reference
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,

    /// Repository URL for remote charts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository_options: Option<RepositoryOptions>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Flat `--set` style overrides
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<BTreeMap<String, String>>,

    /// Inline values document
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_yaml: Option<String>,

    /// `s3://bucket/key` of a values document applied last
    #[serde(rename = "ValueOverrideURL", skip_serializing_if = "Option::is_none")]
    pub value_override_url: Option<String>,

    /// Release name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Encoded identity token (physical id)
    #[serde(rename = "ID", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Timeout budget in minutes
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "flexible::opt_i64"
    )]
    pub time_out: Option<i64>,

    #[serde(rename = "VPCConfiguration", skip_serializing_if = "Option::is_none")]
    pub vpc_configuration: Option<VpcConfiguration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<BTreeMap<String, serde_json::Value>>,
}

impl HelmReleaseModel {
    /// Network placement, if one is configured and non-empty
    pub fn placement(&self) -> Option<&VpcConfiguration> {
        self.vpc_configuration.as_ref().filter(|v| !v.is_empty())
    }
}

/// Chart repository access options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RepositoryOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// CA bundle location, only `s3://` URLs are honoured
    #[serde(rename = "CAFile", skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,

    #[serde(
        rename = "InsecureSkipTLSVerify",
        skip_serializing_if = "Option::is_none",
        deserialize_with = "flexible::opt_bool"
    )]
    pub insecure_skip_tls_verify: Option<bool>,
}

impl RepositoryOptions {
    /// Username and password, only when both are set and non-empty
    pub fn basic_auth(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u, p)),
            _ => None,
        }
    }
}

/// Security groups and subnets the VPC connector is attached to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VpcConfiguration {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub security_group_ids: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subnet_ids: Vec<String>,
}

impl VpcConfiguration {
    pub fn new(
        security_group_ids: impl IntoIterator<Item = impl Into<String>>,
        subnet_ids: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            security_group_ids: security_group_ids.into_iter().map(Into::into).collect(),
            subnet_ids: subnet_ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.security_group_ids.is_empty() && self.subnet_ids.is_empty()
    }
}

/// Desired state of an `AWSQS::EKS::Cluster` resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EksClusterModel {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources_vpc_config: Option<ResourcesVpcConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes_network_config: Option<KubernetesNetworkConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled_cluster_logging_types: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_config: Option<Vec<EncryptionConfigEntry>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<Tag>>,

    // Read-only attributes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_security_group_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_config_key_arn: Option<String>,

    #[serde(rename = "OIDCIssuerURL", skip_serializing_if = "Option::is_none")]
    pub oidc_issuer_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ResourcesVpcConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subnet_ids: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub security_group_ids: Vec<String>,

    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "flexible::opt_bool"
    )]
    pub endpoint_public_access: Option<bool>,

    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "flexible::opt_bool"
    )]
    pub endpoint_private_access: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_access_cidrs: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct KubernetesNetworkConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_ipv4_cidr: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EncryptionConfigEntry {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<KeyProvider>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct KeyProvider {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_arn: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Deserializers accepting both native JSON scalars and their string forms
mod flexible {
    use serde::{Deserialize, Deserializer, de::Error};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Str(String),
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrString {
        Bool(bool),
        Str(String),
    }

    pub fn opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<IntOrString>::deserialize(deserializer)? {
            None => Ok(None),
            Some(IntOrString::Int(v)) => Ok(Some(v)),
            Some(IntOrString::Str(s)) if s.trim().is_empty() => Ok(None),
            Some(IntOrString::Str(s)) => s.trim().parse().map(Some).map_err(D::Error::custom),
        }
    }

    pub fn opt_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<BoolOrString>::deserialize(deserializer)? {
            None => Ok(None),
            Some(BoolOrString::Bool(v)) => Ok(Some(v)),
            Some(BoolOrString::Str(s)) if s.trim().is_empty() => Ok(None),
            Some(BoolOrString::Str(s)) => s
                .trim()
                .to_ascii_lowercase()
                .parse()
                .map(Some)
                .map_err(D::Error::custom),
        }
    }
}
