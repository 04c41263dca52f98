//! EKS cluster resource handlers
//!
//! Cluster operations are asynchronous on the service side. Create, update
//! and delete issue one call per invocation and then re-invoke at
//! [`Stage::ClusterStabilize`] until the cluster settles.

use cfn_helm_aws::{
    AwsError, Cluster, ClusterApi, CreateClusterRequest, EncryptionConfig, EncryptionProvider,
    KubernetesNetworkConfig as ClusterNetworkConfig, LogSetup, Logging, UpdateClusterConfigRequest,
    VpcConfigRequest,
};
use cfn_helm_core::{
    CallbackContext, EksClusterModel, EncryptionConfigEntry, KeyProvider, KubernetesNetworkConfig,
    ResourcesVpcConfig, Stage, Tag,
};
use cfn_helm_kube::Diagnostics;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{ProviderError, Result};
use crate::event::{HandlerRequest, Outcome, ProgressEvent, Reconciliation};
use crate::settings::ProviderSettings;

type Event = ProgressEvent<EksClusterModel>;

const STATUS_ACTIVE: &str = "ACTIVE";
const STATUS_FAILED: &str = "FAILED";
const STATUS_CREATING: &str = "CREATING";

const OPEN_CIDR: &str = "0.0.0.0/0";

/// Every control plane log type the service knows
const LOG_TYPES: [&str; 5] = ["api", "audit", "authenticator", "controllerManager", "scheduler"];

const NAME_PREFIX: &str = "EKS-";
const NAME_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const NAME_SUFFIX_LEN: usize = 8;

const ALREADY_DESIRED: &str = "Cluster is already at the desired configuration";

/// Handlers of the `AWSQS::EKS::Cluster` resource type
pub struct EksClusterProvider {
    settings: Arc<ProviderSettings>,
    clusters: Arc<dyn ClusterApi>,
}

impl EksClusterProvider {
    pub fn new(settings: Arc<ProviderSettings>, clusters: Arc<dyn ClusterApi>) -> Self {
        Self { settings, clusters }
    }

    pub async fn create(&self, request: &HandlerRequest<EksClusterModel>) -> Event {
        let now = Utc::now();
        let mut model = request.desired_resource_state.clone().unwrap_or_default();
        let (stage, started_at) = CallbackContext::resolve(request.callback_context.as_ref(), now);
        if model.name.is_none() {
            model.name = request.callback_context.as_ref().and_then(|c| c.name.clone());
        }

        let outcome = match stage {
            Stage::Init => self.create_cluster(&mut model).await,
            Stage::ClusterStabilize => self.stabilize(&mut model).await,
            other => Outcome::Failed(ProviderError::InvalidRequest(format!("unhandled stage {}", other))),
        };
        self.render(outcome, Some(model), started_at, now)
    }

    pub async fn read(&self, request: &HandlerRequest<EksClusterModel>) -> Event {
        let model = request.desired_resource_state.clone().unwrap_or_default();
        let Some(name) = model.name.clone() else {
            return ProgressEvent::failed(&ProviderError::NotFound("cluster name is missing".to_string()), None);
        };

        match self.clusters.describe_cluster(&name).await {
            Ok(cluster) => ProgressEvent::success(Some(describe_to_model(&cluster, model))),
            Err(e) => ProgressEvent::failed(&service_error(e), None),
        }
    }

    pub async fn update(&self, request: &HandlerRequest<EksClusterModel>) -> Event {
        let now = Utc::now();
        let model = request.desired_resource_state.clone().unwrap_or_default();
        let (stage, started_at) = CallbackContext::resolve(request.callback_context.as_ref(), now);

        let outcome = match stage {
            Stage::Init | Stage::ClusterStabilize => self.update_cluster(&model).await,
            other => Outcome::Failed(ProviderError::InvalidRequest(format!("unhandled stage {}", other))),
        };
        let model = match outcome {
            Outcome::Complete => self.refresh(model).await,
            _ => model,
        };
        self.render(outcome, Some(model), started_at, now)
    }

    pub async fn delete(&self, request: &HandlerRequest<EksClusterModel>) -> Event {
        let now = Utc::now();
        let model = request.desired_resource_state.clone().unwrap_or_default();
        let (stage, started_at) = CallbackContext::resolve(request.callback_context.as_ref(), now);

        let outcome = match stage {
            Stage::Init | Stage::ClusterStabilize => self.delete_cluster(&model).await,
            other => Outcome::Failed(ProviderError::InvalidRequest(format!("unhandled stage {}", other))),
        };
        let model = (!matches!(outcome, Outcome::Complete)).then_some(model);
        self.render(outcome, model, started_at, now)
    }

    pub async fn list(&self, _request: &HandlerRequest<EksClusterModel>) -> Event {
        match self.clusters.list_clusters().await {
            Ok(names) => ProgressEvent::listed(
                names
                    .into_iter()
                    .map(|name| EksClusterModel {
                        name: Some(name),
                        ..Default::default()
                    })
                    .collect(),
            ),
            Err(e) => ProgressEvent::failed(&service_error(e), None),
        }
    }

    fn render(
        &self,
        outcome: Outcome,
        model: Option<EksClusterModel>,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Event {
        let run = Reconciliation {
            started_at,
            now,
            timeout: self.settings.default_timeout,
            callback_delay_seconds: self.settings.callback_delay_seconds(),
        };
        let name = model.as_ref().and_then(|m| m.name.clone());
        run.render(outcome, model, name, &Diagnostics::new())
    }

    async fn create_cluster(&self, model: &mut EksClusterModel) -> Outcome {
        let name = model.name.get_or_insert_with(generate_name).clone();
        let request = match create_request(&name, model) {
            Ok(request) => request,
            Err(e) => return Outcome::Failed(e),
        };

        tracing::info!(cluster = %name, "creating cluster");
        match self.clusters.create_cluster(&request).await {
            Ok(_) => Outcome::Continue(Stage::ClusterStabilize),
            Err(e) => Outcome::Failed(service_error(e)),
        }
    }

    /// Wait for a created cluster to become active
    async fn stabilize(&self, model: &mut EksClusterModel) -> Outcome {
        let Some(name) = model.name.clone() else {
            return Outcome::Failed(ProviderError::InvalidRequest("cluster name is missing".to_string()));
        };
        let cluster = match self.clusters.describe_cluster(&name).await {
            Ok(cluster) => cluster,
            Err(e) => return Outcome::Failed(service_error(e)),
        };

        match cluster.status() {
            STATUS_ACTIVE => {
                tracing::info!(cluster = %name, "cluster is active");
                *model = describe_to_model(&cluster, std::mem::take(model));
                Outcome::Complete
            }
            STATUS_FAILED => Outcome::Failed(ProviderError::Service(format!(
                "cluster {} failed to stabilize",
                name
            ))),
            status => {
                tracing::info!(cluster = %name, status, "waiting for cluster");
                Outcome::Continue(Stage::ClusterStabilize)
            }
        }
    }

    /// Issue the first outstanding change, if any
    async fn update_cluster(&self, desired: &EksClusterModel) -> Outcome {
        let Some(name) = desired.name.clone() else {
            return Outcome::Failed(ProviderError::InvalidRequest("cluster name is missing".to_string()));
        };
        let cluster = match self.clusters.describe_cluster(&name).await {
            Ok(cluster) => cluster,
            Err(e) => return Outcome::Failed(service_error(e)),
        };
        if cluster.status() != STATUS_ACTIVE {
            tracing::info!(cluster = %name, status = cluster.status(), "waiting for cluster before update");
            return Outcome::Continue(Stage::ClusterStabilize);
        }

        if vpc_changed(desired, &cluster) {
            tracing::info!(cluster = %name, "updating endpoint access");
            let request = UpdateClusterConfigRequest {
                name: name.clone(),
                resources_vpc_config: Some(vpc_update(desired)),
                logging: None,
            };
            match self.clusters.update_cluster_config(&request).await {
                Ok(()) => return Outcome::Continue(Stage::ClusterStabilize),
                Err(e) if e.message().contains(ALREADY_DESIRED) => {
                    tracing::debug!(cluster = %name, "endpoint access already at the desired configuration");
                }
                Err(e) => return update_failure(e),
            }
        }

        if logging_changed(desired, &cluster) {
            tracing::info!(cluster = %name, "updating control plane logging");
            let request = UpdateClusterConfigRequest {
                name: name.clone(),
                resources_vpc_config: None,
                logging: Some(logging(desired_log_types(desired))),
            };
            return match self.clusters.update_cluster_config(&request).await {
                Ok(()) => Outcome::Continue(Stage::ClusterStabilize),
                Err(e) => update_failure(e),
            };
        }

        if let Some(version) = version_change(desired, &cluster) {
            tracing::info!(cluster = %name, version, "updating cluster version");
            return match self.clusters.update_cluster_version(&name, version).await {
                Ok(()) => Outcome::Continue(Stage::ClusterStabilize),
                Err(e) => update_failure(e),
            };
        }

        let tags = changed_tags(desired, &cluster);
        if !tags.is_empty() {
            let Some(arn) = cluster.arn.as_deref() else {
                return Outcome::Failed(ProviderError::Service(format!("cluster {} has no ARN", name)));
            };
            tracing::info!(cluster = %name, count = tags.len(), "tagging cluster");
            return match self.clusters.tag_resource(arn, &tags).await {
                Ok(()) => Outcome::Continue(Stage::ClusterStabilize),
                Err(e) => update_failure(e),
            };
        }

        Outcome::Complete
    }

    /// Desired model with the read-only attributes of the live cluster
    async fn refresh(&self, model: EksClusterModel) -> EksClusterModel {
        let Some(name) = model.name.clone() else {
            return model;
        };
        match self.clusters.describe_cluster(&name).await {
            Ok(cluster) => with_attributes(&cluster, model),
            Err(e) => {
                tracing::warn!(cluster = %name, error = %e, "unable to refresh cluster attributes");
                model
            }
        }
    }

    async fn delete_cluster(&self, model: &EksClusterModel) -> Outcome {
        let Some(name) = model.name.as_deref() else {
            return Outcome::Failed(ProviderError::InvalidRequest("cluster name is missing".to_string()));
        };
        let cluster = match self.clusters.describe_cluster(name).await {
            Ok(cluster) => cluster,
            Err(e) if e.is_not_found() => {
                tracing::info!(cluster = %name, "cluster is gone");
                return Outcome::Complete;
            }
            Err(e) => return Outcome::Failed(service_error(e)),
        };

        if matches!(cluster.status(), STATUS_ACTIVE | STATUS_FAILED | STATUS_CREATING) {
            tracing::info!(cluster = %name, status = cluster.status(), "deleting cluster");
            match self.clusters.delete_cluster(name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => return Outcome::Complete,
                Err(e) if is_delete_blocked(&e) => {
                    tracing::info!(cluster = %name, "cluster busy, retrying delete");
                }
                Err(e) => return Outcome::Failed(service_error(e)),
            }
        }
        Outcome::Continue(Stage::ClusterStabilize)
    }
}

/// `EKS-` followed by random uppercase alphanumerics
pub fn generate_name() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..NAME_SUFFIX_LEN)
        .map(|_| NAME_CHARS[rng.random_range(0..NAME_CHARS.len())] as char)
        .collect();
    format!("{}{}", NAME_PREFIX, suffix)
}

/// Map a service error to the handler error code
pub fn service_error(err: AwsError) -> ProviderError {
    if err.is_not_found() {
        return ProviderError::NotFound(err.message());
    }
    match err.code() {
        Some(code) if code.starts_with("InvalidParameter") || code == "InvalidRequestException" => {
            ProviderError::InvalidRequest(err.message())
        }
        Some("ResourceInUseException") => ProviderError::AlreadyExists(err.message()),
        _ => ProviderError::Service(err.to_string()),
    }
}

fn update_failure(err: AwsError) -> Outcome {
    let message = err.message();
    if message.contains("currently has update") && message.contains("in progress") {
        tracing::info!(error = %message, "update already in progress");
        return Outcome::Continue(Stage::ClusterStabilize);
    }
    Outcome::Failed(service_error(err))
}

fn is_delete_blocked(err: &AwsError) -> bool {
    let message = err.message();
    message.contains("Cannot delete because cluster ") && message.contains(" in progress")
}

fn create_request(name: &str, model: &EksClusterModel) -> Result<CreateClusterRequest> {
    let role_arn = model
        .role_arn
        .clone()
        .ok_or_else(|| ProviderError::InvalidRequest("RoleArn must be specified".to_string()))?;
    let vpc = model.resources_vpc_config.clone().unwrap_or_default();

    let mut tags = BTreeMap::new();
    for tag in model.tags.iter().flatten() {
        tags.insert(tag.key.clone(), tag.value.clone());
    }

    Ok(CreateClusterRequest {
        name: name.to_string(),
        version: model.version.clone(),
        role_arn,
        resources_vpc_config: VpcConfigRequest {
            subnet_ids: vpc.subnet_ids,
            security_group_ids: vpc.security_group_ids,
            endpoint_public_access: Some(vpc.endpoint_public_access.unwrap_or(true)),
            endpoint_private_access: Some(vpc.endpoint_private_access.unwrap_or(false)),
            public_access_cidrs: vpc.public_access_cidrs,
        },
        kubernetes_network_config: model.kubernetes_network_config.as_ref().map(|c| ClusterNetworkConfig {
            service_ipv4_cidr: c.service_ipv4_cidr.clone(),
        }),
        logging: Some(logging(desired_log_types(model))),
        encryption_config: model
            .encryption_config
            .iter()
            .flatten()
            .map(|entry| EncryptionConfig {
                resources: entry.resources.clone(),
                provider: entry.provider.as_ref().map(|p| EncryptionProvider {
                    key_arn: p.key_arn.clone(),
                }),
            })
            .collect(),
        tags,
    })
}

fn desired_log_types(model: &EksClusterModel) -> BTreeSet<String> {
    model
        .enabled_cluster_logging_types
        .iter()
        .flatten()
        .cloned()
        .collect()
}

/// Logging setup enabling exactly `enabled`
fn logging(enabled: BTreeSet<String>) -> Logging {
    let disabled: Vec<String> = LOG_TYPES
        .iter()
        .filter(|t| !enabled.contains(**t))
        .map(|t| t.to_string())
        .collect();

    let mut cluster_logging = Vec::new();
    if !enabled.is_empty() {
        cluster_logging.push(LogSetup {
            types: enabled.into_iter().collect(),
            enabled: true,
        });
    }
    if !disabled.is_empty() {
        cluster_logging.push(LogSetup {
            types: disabled,
            enabled: false,
        });
    }
    Logging { cluster_logging }
}

fn enabled_log_types(cluster: &Cluster) -> BTreeSet<String> {
    cluster
        .logging
        .iter()
        .flat_map(|l| &l.cluster_logging)
        .filter(|setup| setup.enabled)
        .flat_map(|setup| setup.types.iter().cloned())
        .collect()
}

fn logging_changed(desired: &EksClusterModel, cluster: &Cluster) -> bool {
    desired_log_types(desired) != enabled_log_types(cluster)
}

fn desired_cidrs(vpc: &ResourcesVpcConfig) -> BTreeSet<String> {
    match &vpc.public_access_cidrs {
        Some(cidrs) if !cidrs.is_empty() => cidrs.iter().cloned().collect(),
        _ => BTreeSet::from([OPEN_CIDR.to_string()]),
    }
}

fn vpc_changed(desired: &EksClusterModel, cluster: &Cluster) -> bool {
    let want = desired.resources_vpc_config.clone().unwrap_or_default();
    let have = cluster.resources_vpc_config.clone().unwrap_or_default();

    let have_cidrs: BTreeSet<String> = have.public_access_cidrs.iter().cloned().collect();
    want.endpoint_public_access.unwrap_or(true) != have.endpoint_public_access
        || want.endpoint_private_access.unwrap_or(false) != have.endpoint_private_access
        || desired_cidrs(&want) != have_cidrs
}

fn vpc_update(desired: &EksClusterModel) -> VpcConfigRequest {
    let want = desired.resources_vpc_config.clone().unwrap_or_default();
    VpcConfigRequest {
        endpoint_public_access: Some(want.endpoint_public_access.unwrap_or(true)),
        endpoint_private_access: Some(want.endpoint_private_access.unwrap_or(false)),
        public_access_cidrs: Some(desired_cidrs(&want).into_iter().collect()),
        ..Default::default()
    }
}

fn version_change<'a>(desired: &'a EksClusterModel, cluster: &Cluster) -> Option<&'a str> {
    desired
        .version
        .as_deref()
        .filter(|v| cluster.version.as_deref() != Some(*v))
}

/// Desired tags missing from the cluster or carrying another value
fn changed_tags(desired: &EksClusterModel, cluster: &Cluster) -> BTreeMap<String, String> {
    desired
        .tags
        .iter()
        .flatten()
        .filter(|tag| cluster.tags.get(&tag.key) != Some(&tag.value))
        .map(|tag| (tag.key.clone(), tag.value.clone()))
        .collect()
}

/// Model describing `cluster`, keeping the identity fields of `model`
fn describe_to_model(cluster: &Cluster, model: EksClusterModel) -> EksClusterModel {
    let vpc = cluster.resources_vpc_config.clone().unwrap_or_default();
    let cidrs = (vpc.public_access_cidrs != [OPEN_CIDR]).then_some(vpc.public_access_cidrs);
    let enabled: Vec<String> = enabled_log_types(cluster).into_iter().collect();

    let mut tags: Vec<Tag> = cluster
        .tags
        .iter()
        .map(|(key, value)| Tag {
            key: key.clone(),
            value: value.clone(),
        })
        .collect();
    tags.sort();

    let encryption: Vec<EncryptionConfigEntry> = cluster
        .encryption_config
        .iter()
        .map(|c| EncryptionConfigEntry {
            resources: c.resources.clone(),
            provider: c.provider.as_ref().map(|p| KeyProvider {
                key_arn: p.key_arn.clone(),
            }),
        })
        .collect();

    let described = EksClusterModel {
        name: Some(cluster.name.clone()),
        role_arn: cluster.role_arn.clone().or(model.role_arn),
        version: cluster.version.clone(),
        resources_vpc_config: Some(ResourcesVpcConfig {
            subnet_ids: vpc.subnet_ids,
            security_group_ids: vpc.security_group_ids,
            endpoint_public_access: Some(vpc.endpoint_public_access),
            endpoint_private_access: Some(vpc.endpoint_private_access),
            public_access_cidrs: cidrs,
        }),
        kubernetes_network_config: cluster.kubernetes_network_config.as_ref().map(|c| KubernetesNetworkConfig {
            service_ipv4_cidr: c.service_ipv4_cidr.clone(),
        }),
        enabled_cluster_logging_types: (!enabled.is_empty()).then_some(enabled),
        encryption_config: (!encryption.is_empty()).then_some(encryption),
        tags: (!tags.is_empty()).then_some(tags),
        ..Default::default()
    };
    with_attributes(cluster, described)
}

/// Fill the read-only attributes from `cluster`
fn with_attributes(cluster: &Cluster, mut model: EksClusterModel) -> EksClusterModel {
    model.arn = cluster.arn.clone();
    model.endpoint = cluster.endpoint.clone();
    model.certificate_authority_data = cluster.certificate_authority.as_ref().and_then(|c| c.data.clone());
    model.cluster_security_group_id = cluster
        .resources_vpc_config
        .as_ref()
        .and_then(|v| v.cluster_security_group_id.clone());
    model.encryption_config_key_arn = cluster
        .encryption_config
        .iter()
        .find_map(|c| c.provider.as_ref().and_then(|p| p.key_arn.clone()));
    model.oidc_issuer_url = cluster
        .identity
        .as_ref()
        .and_then(|i| i.oidc.as_ref())
        .and_then(|o| o.issuer.clone());
    model
}
