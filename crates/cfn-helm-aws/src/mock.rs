//! In-memory AWS backend for testing
//!
//! Holds functions, clusters, network topology, secrets and objects in
//! memory and counts every call, so handler logic can be exercised without
//! an AWS account.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use crate::api::{
    ClusterApi, FunctionApi, IdentityApi, NetworkApi, ObjectStoreApi, RegistryApi, SecretsApi,
};
use crate::error::{AwsError, Result};
use crate::types::{
    Cluster, CreateClusterRequest, FunctionConfiguration, FunctionSpec, FunctionVpcConfig,
    InvokeOutput, LogSetup, Logging, RegistryCredentials, RouteTable, Subnet,
    UpdateClusterConfigRequest, VpcConfigResponse,
};

type InvokeHandler = Arc<dyn Fn(&str, &[u8]) -> Result<InvokeOutput> + Send + Sync>;

/// Counts of operations performed for testing assertions
#[derive(Debug, Default, Clone)]
pub struct OperationCounts {
    pub function_gets: usize,
    pub function_creates: usize,
    pub function_code_updates: usize,
    pub function_config_updates: usize,
    pub function_deletes: usize,
    pub invokes: usize,
    pub cluster_creates: usize,
    pub cluster_updates: usize,
    pub cluster_deletes: usize,
}

impl OperationCounts {
    /// Calls that change a function
    pub fn function_mutations(&self) -> usize {
        self.function_creates
            + self.function_code_updates
            + self.function_config_updates
            + self.function_deletes
    }
}

#[derive(Default)]
struct MockState {
    functions: HashMap<String, FunctionConfiguration>,
    function_create_state: Option<String>,
    invoke_failures: VecDeque<AwsError>,
    update_failures: VecDeque<AwsError>,
    clusters: HashMap<String, Cluster>,
    cluster_update_failures: VecDeque<AwsError>,
    subnets: Vec<Subnet>,
    route_tables: Vec<RouteTable>,
    caller_arn: String,
    secrets: HashMap<String, String>,
    objects: HashMap<(String, String), Vec<u8>>,
    bucket_regions: HashMap<String, String>,
}

/// In-memory AWS backend
#[derive(Clone)]
pub struct MockAws {
    state: Arc<RwLock<MockState>>,
    invoke_handler: Arc<RwLock<Option<InvokeHandler>>>,
    operations: Arc<RwLock<OperationCounts>>,
}

impl MockAws {
    pub fn new() -> Self {
        let state = MockState {
            caller_arn: "arn:aws:iam::123456789012:role/provider".to_string(),
            ..Default::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
            invoke_handler: Arc::new(RwLock::new(None)),
            operations: Arc::new(RwLock::new(OperationCounts::default())),
        }
    }

    /// Get operation counts for assertions
    pub fn operation_counts(&self) -> OperationCounts {
        self.operations.read().unwrap().clone()
    }

    /// Reset operation counts
    pub fn reset_counts(&self) {
        let mut ops = self.operations.write().unwrap();
        *ops = OperationCounts::default();
    }

    pub fn with_caller_arn(self, arn: &str) -> Self {
        self.state.write().unwrap().caller_arn = arn.to_string();
        self
    }

    pub fn with_cluster(self, cluster: Cluster) -> Self {
        self.state
            .write()
            .unwrap()
            .clusters
            .insert(cluster.name.clone(), cluster);
        self
    }

    pub fn with_subnets(self, subnets: Vec<Subnet>) -> Self {
        self.state.write().unwrap().subnets = subnets;
        self
    }

    pub fn with_route_tables(self, tables: Vec<RouteTable>) -> Self {
        self.state.write().unwrap().route_tables = tables;
        self
    }

    pub fn with_secret(self, id: &str, value: &str) -> Self {
        self.state
            .write()
            .unwrap()
            .secrets
            .insert(id.to_string(), value.to_string());
        self
    }

    pub fn with_object(self, bucket: &str, key: &str, region: &str, body: &[u8]) -> Self {
        {
            let mut state = self.state.write().unwrap();
            state
                .objects
                .insert((bucket.to_string(), key.to_string()), body.to_vec());
            state
                .bucket_regions
                .insert(bucket.to_string(), region.to_string());
        }
        self
    }

    pub fn with_function(self, config: FunctionConfiguration) -> Self {
        self.state
            .write()
            .unwrap()
            .functions
            .insert(config.function_name.clone(), config);
        self
    }

    /// State newly created functions start in (default `Active`)
    pub fn with_function_create_state(self, state: &str) -> Self {
        self.state.write().unwrap().function_create_state = Some(state.to_string());
        self
    }

    /// Answer invokes with `handler`
    pub fn with_invoke_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&str, &[u8]) -> Result<InvokeOutput> + Send + Sync + 'static,
    {
        *self.invoke_handler.write().unwrap() = Some(Arc::new(handler));
        self
    }

    /// Fail the next invokes with these errors, in order
    pub fn fail_invokes(&self, errors: Vec<AwsError>) {
        self.state.write().unwrap().invoke_failures.extend(errors);
    }

    /// Fail the next function updates with these errors, in order
    pub fn fail_function_updates(&self, errors: Vec<AwsError>) {
        self.state.write().unwrap().update_failures.extend(errors);
    }

    /// Fail the next cluster updates with these errors, in order
    pub fn fail_cluster_updates(&self, errors: Vec<AwsError>) {
        self.state
            .write()
            .unwrap()
            .cluster_update_failures
            .extend(errors);
    }

    pub fn function(&self, name: &str) -> Option<FunctionConfiguration> {
        self.state.read().unwrap().functions.get(name).cloned()
    }

    pub fn set_function_state(&self, name: &str, state: &str) {
        if let Some(f) = self.state.write().unwrap().functions.get_mut(name) {
            f.state = Some(state.to_string());
        }
    }

    pub fn cluster(&self, name: &str) -> Option<Cluster> {
        self.state.read().unwrap().clusters.get(name).cloned()
    }

    pub fn set_cluster_status(&self, name: &str, status: &str) {
        if let Some(c) = self.state.write().unwrap().clusters.get_mut(name) {
            c.status = Some(status.to_string());
        }
    }

    pub fn remove_cluster(&self, name: &str) {
        self.state.write().unwrap().clusters.remove(name);
    }

    fn count(&self, f: impl FnOnce(&mut OperationCounts)) {
        let mut ops = self.operations.write().unwrap();
        f(&mut ops);
    }
}

impl Default for MockAws {
    fn default() -> Self {
        Self::new()
    }
}

/// base64 SHA-256 of a deployment package, as the function service reports it
pub fn code_sha256(zip: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(zip))
}

fn not_found(what: &str) -> AwsError {
    AwsError::service("ResourceNotFoundException", format!("{} not found", what))
}

fn apply_spec(config: &mut FunctionConfiguration, spec: &FunctionSpec) {
    config.function_name = spec.function_name.clone();
    config.handler = Some(spec.handler.clone());
    config.memory_size = Some(spec.memory_size);
    config.role = spec.role.clone();
    config.runtime = Some(spec.runtime.clone());
    config.timeout = Some(spec.timeout);
    config.vpc_config = Some(FunctionVpcConfig {
        subnet_ids: spec.vpc_config.subnet_ids.clone(),
        security_group_ids: spec.vpc_config.security_group_ids.clone(),
    });
}

#[async_trait]
impl FunctionApi for MockAws {
    async fn get_function(&self, name: &str) -> Result<FunctionConfiguration> {
        self.count(|ops| ops.function_gets += 1);
        self.state
            .read()
            .unwrap()
            .functions
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(&format!("Function {}", name)))
    }

    async fn create_function(&self, spec: &FunctionSpec, zip: &[u8]) -> Result<FunctionConfiguration> {
        self.count(|ops| ops.function_creates += 1);
        let mut state = self.state.write().unwrap();
        if state.functions.contains_key(&spec.function_name) {
            return Err(AwsError::service(
                "ResourceConflictException",
                format!("Function already exist: {}", spec.function_name),
            ));
        }

        let mut config = FunctionConfiguration {
            state: Some(
                state
                    .function_create_state
                    .clone()
                    .unwrap_or_else(|| "Active".to_string()),
            ),
            code_sha256: code_sha256(zip),
            ..Default::default()
        };
        apply_spec(&mut config, spec);
        state
            .functions
            .insert(spec.function_name.clone(), config.clone());
        Ok(config)
    }

    async fn update_function_code(&self, name: &str, zip: &[u8]) -> Result<()> {
        self.count(|ops| ops.function_code_updates += 1);
        let mut state = self.state.write().unwrap();
        if let Some(err) = state.update_failures.pop_front() {
            return Err(err);
        }
        let config = state
            .functions
            .get_mut(name)
            .ok_or_else(|| not_found(&format!("Function {}", name)))?;
        config.code_sha256 = code_sha256(zip);
        Ok(())
    }

    async fn update_function_configuration(&self, spec: &FunctionSpec) -> Result<()> {
        self.count(|ops| ops.function_config_updates += 1);
        let mut state = self.state.write().unwrap();
        if let Some(err) = state.update_failures.pop_front() {
            return Err(err);
        }
        let config = state
            .functions
            .get_mut(&spec.function_name)
            .ok_or_else(|| not_found(&format!("Function {}", spec.function_name)))?;
        apply_spec(config, spec);
        Ok(())
    }

    async fn delete_function(&self, name: &str) -> Result<()> {
        self.count(|ops| ops.function_deletes += 1);
        self.state
            .write()
            .unwrap()
            .functions
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(&format!("Function {}", name)))
    }

    async fn invoke(&self, name: &str, payload: &[u8]) -> Result<InvokeOutput> {
        self.count(|ops| ops.invokes += 1);
        {
            let mut state = self.state.write().unwrap();
            if let Some(err) = state.invoke_failures.pop_front() {
                return Err(err);
            }
            if !state.functions.contains_key(name) {
                return Err(not_found(&format!("Function {}", name)));
            }
        }

        let handler = self.invoke_handler.read().unwrap().clone();
        match handler {
            Some(handler) => handler(name, payload),
            None => Ok(InvokeOutput {
                status_code: 200,
                function_error: None,
                payload: b"{}".to_vec(),
            }),
        }
    }
}

#[async_trait]
impl ClusterApi for MockAws {
    async fn describe_cluster(&self, name: &str) -> Result<Cluster> {
        self.state
            .read()
            .unwrap()
            .clusters
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(&format!("No cluster found for name: {}.", name)))
    }

    async fn create_cluster(&self, request: &CreateClusterRequest) -> Result<Cluster> {
        self.count(|ops| ops.cluster_creates += 1);
        let mut state = self.state.write().unwrap();
        if state.clusters.contains_key(&request.name) {
            return Err(AwsError::service(
                "ResourceInUseException",
                format!("Cluster already exists with name: {}", request.name),
            ));
        }

        let vpc = &request.resources_vpc_config;
        let cluster = Cluster {
            name: request.name.clone(),
            arn: Some(format!(
                "arn:aws:eks:us-east-1:123456789012:cluster/{}",
                request.name
            )),
            version: Some(request.version.clone().unwrap_or_else(|| "1.31".to_string())),
            role_arn: Some(request.role_arn.clone()),
            status: Some("CREATING".to_string()),
            resources_vpc_config: Some(VpcConfigResponse {
                subnet_ids: vpc.subnet_ids.clone(),
                security_group_ids: vpc.security_group_ids.clone(),
                endpoint_public_access: vpc.endpoint_public_access.unwrap_or(true),
                endpoint_private_access: vpc.endpoint_private_access.unwrap_or(false),
                public_access_cidrs: vpc
                    .public_access_cidrs
                    .clone()
                    .unwrap_or_else(|| vec!["0.0.0.0/0".to_string()]),
                ..Default::default()
            }),
            kubernetes_network_config: request.kubernetes_network_config.clone(),
            logging: request.logging.clone(),
            encryption_config: request.encryption_config.clone(),
            tags: request.tags.clone(),
            ..Default::default()
        };
        state.clusters.insert(cluster.name.clone(), cluster.clone());
        Ok(cluster)
    }

    async fn update_cluster_config(&self, request: &UpdateClusterConfigRequest) -> Result<()> {
        self.count(|ops| ops.cluster_updates += 1);
        let mut state = self.state.write().unwrap();
        if let Some(err) = state.cluster_update_failures.pop_front() {
            return Err(err);
        }
        let cluster = state
            .clusters
            .get_mut(&request.name)
            .ok_or_else(|| not_found(&format!("No cluster found for name: {}.", request.name)))?;

        if let Some(vpc) = &request.resources_vpc_config {
            let current = cluster.resources_vpc_config.get_or_insert_with(Default::default);
            if let Some(public) = vpc.endpoint_public_access {
                current.endpoint_public_access = public;
            }
            if let Some(private) = vpc.endpoint_private_access {
                current.endpoint_private_access = private;
            }
            if let Some(cidrs) = &vpc.public_access_cidrs {
                current.public_access_cidrs = cidrs.clone();
            }
        }
        if let Some(logging) = &request.logging {
            let enabled: Vec<String> = logging
                .cluster_logging
                .iter()
                .filter(|setup| setup.enabled)
                .flat_map(|setup| setup.types.clone())
                .collect();
            cluster.logging = Some(Logging {
                cluster_logging: vec![LogSetup {
                    types: enabled,
                    enabled: true,
                }],
            });
        }
        Ok(())
    }

    async fn update_cluster_version(&self, name: &str, version: &str) -> Result<()> {
        self.count(|ops| ops.cluster_updates += 1);
        let mut state = self.state.write().unwrap();
        if let Some(err) = state.cluster_update_failures.pop_front() {
            return Err(err);
        }
        let cluster = state
            .clusters
            .get_mut(name)
            .ok_or_else(|| not_found(&format!("No cluster found for name: {}.", name)))?;
        cluster.version = Some(version.to_string());
        Ok(())
    }

    async fn tag_resource(&self, arn: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        self.count(|ops| ops.cluster_updates += 1);
        let mut state = self.state.write().unwrap();
        let cluster = state
            .clusters
            .values_mut()
            .find(|c| c.arn.as_deref() == Some(arn))
            .ok_or_else(|| not_found(&format!("Resource {}", arn)))?;
        cluster.tags.extend(tags.clone());
        Ok(())
    }

    async fn delete_cluster(&self, name: &str) -> Result<()> {
        self.count(|ops| ops.cluster_deletes += 1);
        let mut state = self.state.write().unwrap();
        let cluster = state
            .clusters
            .get_mut(name)
            .ok_or_else(|| not_found(&format!("No cluster found for name: {}.", name)))?;
        cluster.status = Some("DELETING".to_string());
        Ok(())
    }

    async fn list_clusters(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.state.read().unwrap().clusters.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl NetworkApi for MockAws {
    async fn describe_subnets(&self, subnet_ids: &[String]) -> Result<Vec<Subnet>> {
        let state = self.state.read().unwrap();
        Ok(state
            .subnets
            .iter()
            .filter(|s| subnet_ids.contains(&s.subnet_id))
            .cloned()
            .collect())
    }

    async fn describe_route_tables(&self, vpc_id: &str) -> Result<Vec<RouteTable>> {
        let state = self.state.read().unwrap();
        let subnets_in_vpc: Vec<&str> = state
            .subnets
            .iter()
            .filter(|s| s.vpc_id == vpc_id)
            .map(|s| s.subnet_id.as_str())
            .collect();

        // Tables without subnet associations belong to every VPC in the fake
        Ok(state
            .route_tables
            .iter()
            .filter(|t| {
                t.associations.iter().all(|a| a.subnet_id.is_none())
                    || t.associations.iter().any(|a| {
                        a.subnet_id
                            .as_deref()
                            .is_some_and(|id| subnets_in_vpc.contains(&id))
                    })
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl IdentityApi for MockAws {
    async fn caller_arn(&self) -> Result<String> {
        Ok(self.state.read().unwrap().caller_arn.clone())
    }

    async fn cluster_token(&self, cluster: &str, _role_arn: Option<&str>) -> Result<String> {
        Ok(format!("k8s-aws-v1.token-for-{}", cluster))
    }
}

#[async_trait]
impl SecretsApi for MockAws {
    async fn secret_string(&self, secret_id: &str) -> Result<String> {
        self.state
            .read()
            .unwrap()
            .secrets
            .get(secret_id)
            .cloned()
            .ok_or_else(|| not_found(&format!("Secret {}", secret_id)))
    }
}

#[async_trait]
impl ObjectStoreApi for MockAws {
    async fn bucket_region(&self, bucket: &str) -> Result<String> {
        self.state
            .read()
            .unwrap()
            .bucket_regions
            .get(bucket)
            .cloned()
            .ok_or_else(|| AwsError::service("NoSuchBucket", format!("{} does not exist", bucket)))
    }

    async fn get_object(&self, bucket: &str, key: &str, _region: &str) -> Result<Vec<u8>> {
        self.state
            .read()
            .unwrap()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| AwsError::service("NoSuchKey", format!("{}/{} does not exist", bucket, key)))
    }
}

#[async_trait]
impl RegistryApi for MockAws {
    async fn authorization(&self, _registry_id: &str, _region: &str) -> Result<RegistryCredentials> {
        Ok(RegistryCredentials {
            username: "AWS".to_string(),
            password: "registry-password".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> FunctionSpec {
        FunctionSpec {
            function_name: name.to_string(),
            handler: "bootstrap".to_string(),
            memory_size: 384,
            role: "arn:aws:iam::1:role/r".to_string(),
            runtime: "provided.al2023".to_string(),
            timeout: 900,
            vpc_config: FunctionVpcConfig {
                subnet_ids: vec!["s-1".to_string()],
                security_group_ids: vec!["sg-1".to_string()],
            },
        }
    }

    #[tokio::test]
    async fn test_function_lifecycle() {
        let aws = MockAws::new();
        let created = aws.create_function(&spec("f"), b"zip").await.unwrap();
        assert_eq!(created.code_sha256, code_sha256(b"zip"));
        assert_eq!(created.state.as_deref(), Some("Active"));

        let err = aws.create_function(&spec("f"), b"zip").await.unwrap_err();
        assert!(err.is_conflict());

        aws.update_function_code("f", b"zip2").await.unwrap();
        assert_eq!(aws.function("f").unwrap().code_sha256, code_sha256(b"zip2"));

        aws.delete_function("f").await.unwrap();
        assert!(aws.get_function("f").await.unwrap_err().is_not_found());

        let counts = aws.operation_counts();
        assert_eq!(counts.function_creates, 2);
        assert_eq!(counts.function_mutations(), 4);
    }

    #[tokio::test]
    async fn test_scripted_invoke_failures() {
        let aws = MockAws::new();
        aws.create_function(&spec("f"), b"zip").await.unwrap();
        aws.fail_invokes(vec![AwsError::service("TooManyRequestsException", "slow down")]);

        assert!(aws.invoke("f", b"{}").await.is_err());
        assert_eq!(aws.invoke("f", b"{}").await.unwrap().status_code, 200);
        assert_eq!(aws.operation_counts().invokes, 2);
    }

    #[tokio::test]
    async fn test_cluster_lifecycle() {
        let aws = MockAws::new();
        let cluster = aws
            .create_cluster(&CreateClusterRequest {
                name: "eks".to_string(),
                role_arn: "arn:aws:iam::1:role/eks".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(cluster.status(), "CREATING");

        aws.set_cluster_status("eks", "ACTIVE");
        aws.update_cluster_version("eks", "1.32").await.unwrap();
        assert_eq!(aws.cluster("eks").unwrap().version.as_deref(), Some("1.32"));
        assert_eq!(aws.list_clusters().await.unwrap(), vec!["eks".to_string()]);

        aws.delete_cluster("eks").await.unwrap();
        assert_eq!(aws.cluster("eks").unwrap().status(), "DELETING");
    }
}
