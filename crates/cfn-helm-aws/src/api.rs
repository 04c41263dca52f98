//! Capability interfaces for the AWS services the providers consume

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{
    Cluster, CreateClusterRequest, FunctionConfiguration, FunctionSpec, InvokeOutput,
    RegistryCredentials, RouteTable, Subnet, UpdateClusterConfigRequest,
};

/// Serverless function lifecycle and invocation
#[async_trait]
pub trait FunctionApi: Send + Sync {
    async fn get_function(&self, name: &str) -> Result<FunctionConfiguration>;

    async fn create_function(&self, spec: &FunctionSpec, zip: &[u8]) -> Result<FunctionConfiguration>;

    async fn update_function_code(&self, name: &str, zip: &[u8]) -> Result<()>;

    async fn update_function_configuration(&self, spec: &FunctionSpec) -> Result<()>;

    async fn delete_function(&self, name: &str) -> Result<()>;

    /// Synchronous request/response invoke
    async fn invoke(&self, name: &str, payload: &[u8]) -> Result<InvokeOutput>;
}

/// Managed Kubernetes clusters
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn describe_cluster(&self, name: &str) -> Result<Cluster>;

    async fn create_cluster(&self, request: &CreateClusterRequest) -> Result<Cluster>;

    async fn update_cluster_config(&self, request: &UpdateClusterConfigRequest) -> Result<()>;

    async fn update_cluster_version(&self, name: &str, version: &str) -> Result<()>;

    async fn tag_resource(&self, arn: &str, tags: &BTreeMap<String, String>) -> Result<()>;

    async fn delete_cluster(&self, name: &str) -> Result<()>;

    async fn list_clusters(&self) -> Result<Vec<String>>;
}

/// Subnet and routing queries
#[async_trait]
pub trait NetworkApi: Send + Sync {
    async fn describe_subnets(&self, subnet_ids: &[String]) -> Result<Vec<Subnet>>;

    /// Route tables of a VPC
    async fn describe_route_tables(&self, vpc_id: &str) -> Result<Vec<RouteTable>>;
}

/// Caller identity and cluster authentication
#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// ARN of the credentials in use
    async fn caller_arn(&self) -> Result<String>;

    /// Bearer token for a cluster, optionally through an assumed role
    async fn cluster_token(&self, cluster: &str, role_arn: Option<&str>) -> Result<String>;
}

#[async_trait]
pub trait SecretsApi: Send + Sync {
    async fn secret_string(&self, secret_id: &str) -> Result<String>;
}

#[async_trait]
pub trait ObjectStoreApi: Send + Sync {
    async fn bucket_region(&self, bucket: &str) -> Result<String>;

    async fn get_object(&self, bucket: &str, key: &str, region: &str) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// Login credentials for a managed registry
    async fn authorization(&self, registry_id: &str, region: &str) -> Result<RegistryCredentials>;
}

/// Every AWS capability, resolved once per process
#[derive(Clone)]
pub struct AwsServices {
    pub functions: Arc<dyn FunctionApi>,
    pub clusters: Arc<dyn ClusterApi>,
    pub network: Arc<dyn NetworkApi>,
    pub identity: Arc<dyn IdentityApi>,
    pub secrets: Arc<dyn SecretsApi>,
    pub objects: Arc<dyn ObjectStoreApi>,
    pub registry: Arc<dyn RegistryApi>,
}

impl AwsServices {
    /// Serve every capability from one backend
    pub fn from_backend<T>(backend: T) -> Self
    where
        T: FunctionApi
            + ClusterApi
            + NetworkApi
            + IdentityApi
            + SecretsApi
            + ObjectStoreApi
            + RegistryApi
            + 'static,
    {
        let backend = Arc::new(backend);
        Self {
            functions: backend.clone(),
            clusters: backend.clone(),
            network: backend.clone(),
            identity: backend.clone(),
            secrets: backend.clone(),
            objects: backend.clone(),
            registry: backend,
        }
    }
}
