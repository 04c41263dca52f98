//! `aws` command line backend
//!
//! Every capability is served by shelling out to the `aws` executable with
//! JSON output. Service errors are recognised from the CLI's
//! `An error occurred (Code) when calling the X operation: message` line.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::process::Stdio;
use tokio::process::Command;

use crate::api::{
    ClusterApi, FunctionApi, IdentityApi, NetworkApi, ObjectStoreApi, RegistryApi, SecretsApi,
};
use crate::error::{AwsError, Result};
use crate::types::{
    Cluster, CreateClusterRequest, FunctionConfiguration, FunctionSpec, InvokeOutput,
    RegistryCredentials, RouteTable, Subnet, UpdateClusterConfigRequest,
};

static SERVICE_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"An error occurred \(([^)]+)\)(?: when calling the \w+ operation)?(?: \([^)]*\))?:? ?(.*)")
        .expect("valid regex")
});

/// AWS backend driving the `aws` executable
#[derive(Debug, Clone)]
pub struct AwsCli {
    binary: String,
    region: Option<String>,
}

impl AwsCli {
    pub fn new(binary: impl Into<String>, region: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            region,
        }
    }

    async fn run(
        &self,
        service: &str,
        operation: &str,
        args: Vec<OsString>,
        region: Option<&str>,
    ) -> Result<Vec<u8>> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(service)
            .arg(operation)
            .args(args)
            .args(["--output", "json"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(region) = region.or(self.region.as_deref()) {
            cmd.args(["--region", region]);
        }

        tracing::debug!(service, operation, "calling aws");
        let output = cmd.output().await?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(parse_error(&format!("{} {}", service, operation), &stderr))
        }
    }

    async fn json<T: DeserializeOwned>(
        &self,
        service: &str,
        operation: &str,
        args: Vec<OsString>,
        region: Option<&str>,
    ) -> Result<T> {
        let stdout = self.run(service, operation, args, region).await?;
        serde_json::from_slice(&stdout).map_err(|e| AwsError::Response {
            operation: format!("{} {}", service, operation),
            message: e.to_string(),
        })
    }
}

/// Map CLI stderr onto an [`AwsError`]
fn parse_error(command: &str, stderr: &str) -> AwsError {
    match SERVICE_ERROR.captures(stderr) {
        Some(caps) => AwsError::Service {
            code: caps[1].to_string(),
            message: caps
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| stderr.trim().to_string()),
        },
        None => AwsError::Command {
            command: command.to_string(),
            message: stderr.trim().to_string(),
        },
    }
}

fn args<I, S>(items: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    items.into_iter().map(Into::into).collect()
}

fn fileb(path: &std::path::Path) -> OsString {
    let mut arg = OsString::from("fileb://");
    arg.push(path);
    arg
}

async fn scratch_file(contents: &[u8]) -> Result<tempfile::NamedTempFile> {
    let file = tempfile::NamedTempFile::new()?;
    tokio::fs::write(file.path(), contents).await?;
    Ok(file)
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetFunctionOutput {
    configuration: FunctionConfiguration,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InvokeMetadata {
    status_code: i64,
    #[serde(default)]
    function_error: Option<String>,
}

#[async_trait]
impl FunctionApi for AwsCli {
    async fn get_function(&self, name: &str) -> Result<FunctionConfiguration> {
        let out: GetFunctionOutput = self
            .json("lambda", "get-function", args(["--function-name", name]), None)
            .await?;
        Ok(out.configuration)
    }

    async fn create_function(&self, spec: &FunctionSpec, zip: &[u8]) -> Result<FunctionConfiguration> {
        let package = scratch_file(zip).await?;
        let mut argv = args(["--cli-input-json".to_string(), serde_json::to_string(spec)?]);
        argv.push("--zip-file".into());
        argv.push(fileb(package.path()));
        self.json("lambda", "create-function", argv, None).await
    }

    async fn update_function_code(&self, name: &str, zip: &[u8]) -> Result<()> {
        let package = scratch_file(zip).await?;
        let mut argv = args(["--function-name", name, "--zip-file"]);
        argv.push(fileb(package.path()));
        self.run("lambda", "update-function-code", argv, None).await?;
        Ok(())
    }

    async fn update_function_configuration(&self, spec: &FunctionSpec) -> Result<()> {
        let argv = args(["--cli-input-json".to_string(), serde_json::to_string(spec)?]);
        self.run("lambda", "update-function-configuration", argv, None)
            .await?;
        Ok(())
    }

    async fn delete_function(&self, name: &str) -> Result<()> {
        self.run("lambda", "delete-function", args(["--function-name", name]), None)
            .await?;
        Ok(())
    }

    async fn invoke(&self, name: &str, payload: &[u8]) -> Result<InvokeOutput> {
        let request = scratch_file(payload).await?;
        let response = tempfile::NamedTempFile::new()?;

        let mut argv = args(["--function-name", name, "--payload"]);
        argv.push(fileb(request.path()));
        argv.push(response.path().as_os_str().to_owned());

        let meta: InvokeMetadata = self.json("lambda", "invoke", argv, None).await?;
        let payload = tokio::fs::read(response.path()).await?;

        Ok(InvokeOutput {
            status_code: meta.status_code,
            function_error: meta.function_error.filter(|e| !e.is_empty()),
            payload,
        })
    }
}

#[derive(Deserialize)]
struct ClusterOutput {
    cluster: Cluster,
}

#[derive(Deserialize)]
struct ListClustersOutput {
    #[serde(default)]
    clusters: Vec<String>,
}

#[async_trait]
impl ClusterApi for AwsCli {
    async fn describe_cluster(&self, name: &str) -> Result<Cluster> {
        let out: ClusterOutput = self
            .json("eks", "describe-cluster", args(["--name", name]), None)
            .await?;
        Ok(out.cluster)
    }

    async fn create_cluster(&self, request: &CreateClusterRequest) -> Result<Cluster> {
        let argv = args(["--cli-input-json".to_string(), serde_json::to_string(request)?]);
        let out: ClusterOutput = self.json("eks", "create-cluster", argv, None).await?;
        Ok(out.cluster)
    }

    async fn update_cluster_config(&self, request: &UpdateClusterConfigRequest) -> Result<()> {
        let argv = args(["--cli-input-json".to_string(), serde_json::to_string(request)?]);
        self.run("eks", "update-cluster-config", argv, None).await?;
        Ok(())
    }

    async fn update_cluster_version(&self, name: &str, version: &str) -> Result<()> {
        let argv = args(["--name", name, "--kubernetes-version", version]);
        self.run("eks", "update-cluster-version", argv, None).await?;
        Ok(())
    }

    async fn tag_resource(&self, arn: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        let argv = args([
            "--resource-arn".to_string(),
            arn.to_string(),
            "--tags".to_string(),
            serde_json::to_string(tags)?,
        ]);
        self.run("eks", "tag-resource", argv, None).await?;
        Ok(())
    }

    async fn delete_cluster(&self, name: &str) -> Result<()> {
        self.run("eks", "delete-cluster", args(["--name", name]), None)
            .await?;
        Ok(())
    }

    async fn list_clusters(&self) -> Result<Vec<String>> {
        let out: ListClustersOutput = self.json("eks", "list-clusters", Vec::new(), None).await?;
        Ok(out.clusters)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SubnetsOutput {
    #[serde(default)]
    subnets: Vec<Subnet>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RouteTablesOutput {
    #[serde(default)]
    route_tables: Vec<RouteTable>,
}

#[async_trait]
impl NetworkApi for AwsCli {
    async fn describe_subnets(&self, subnet_ids: &[String]) -> Result<Vec<Subnet>> {
        let mut argv = args(["--subnet-ids"]);
        argv.extend(subnet_ids.iter().map(OsString::from));
        let out: SubnetsOutput = self.json("ec2", "describe-subnets", argv, None).await?;
        Ok(out.subnets)
    }

    async fn describe_route_tables(&self, vpc_id: &str) -> Result<Vec<RouteTable>> {
        let filter = format!("Name=vpc-id,Values={}", vpc_id);
        let out: RouteTablesOutput = self
            .json("ec2", "describe-route-tables", args(["--filters".to_string(), filter]), None)
            .await?;
        Ok(out.route_tables)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallerIdentity {
    arn: String,
}

#[derive(Deserialize)]
struct ExecCredential {
    status: ExecCredentialStatus,
}

#[derive(Deserialize)]
struct ExecCredentialStatus {
    token: String,
}

#[async_trait]
impl IdentityApi for AwsCli {
    async fn caller_arn(&self) -> Result<String> {
        let out: CallerIdentity = self
            .json("sts", "get-caller-identity", Vec::new(), None)
            .await?;
        Ok(out.arn)
    }

    async fn cluster_token(&self, cluster: &str, role_arn: Option<&str>) -> Result<String> {
        let mut argv = args(["--cluster-name", cluster]);
        if let Some(role) = role_arn {
            argv.extend(args(["--role-arn", role]));
        }
        let out: ExecCredential = self.json("eks", "get-token", argv, None).await?;
        Ok(out.status.token)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecretValue {
    secret_string: Option<String>,
}

#[async_trait]
impl SecretsApi for AwsCli {
    async fn secret_string(&self, secret_id: &str) -> Result<String> {
        let out: SecretValue = self
            .json("secretsmanager", "get-secret-value", args(["--secret-id", secret_id]), None)
            .await?;
        out.secret_string.ok_or_else(|| AwsError::Response {
            operation: "secretsmanager get-secret-value".to_string(),
            message: format!("secret {} has no string value", secret_id),
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BucketLocation {
    location_constraint: Option<String>,
}

#[async_trait]
impl ObjectStoreApi for AwsCli {
    async fn bucket_region(&self, bucket: &str) -> Result<String> {
        let out: BucketLocation = self
            .json("s3api", "get-bucket-location", args(["--bucket", bucket]), None)
            .await?;
        // An empty constraint means the original region
        Ok(out
            .location_constraint
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "us-east-1".to_string()))
    }

    async fn get_object(&self, bucket: &str, key: &str, region: &str) -> Result<Vec<u8>> {
        let target = tempfile::NamedTempFile::new()?;
        let mut argv = args(["--bucket", bucket, "--key", key]);
        argv.push(target.path().as_os_str().to_owned());
        self.run("s3api", "get-object", argv, Some(region)).await?;
        Ok(tokio::fs::read(target.path()).await?)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizationOutput {
    #[serde(default)]
    authorization_data: Vec<AuthorizationData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizationData {
    authorization_token: String,
}

#[async_trait]
impl RegistryApi for AwsCli {
    async fn authorization(&self, registry_id: &str, region: &str) -> Result<RegistryCredentials> {
        let out: AuthorizationOutput = self
            .json(
                "ecr",
                "get-authorization-token",
                args(["--registry-ids", registry_id]),
                Some(region),
            )
            .await?;

        let token = out
            .authorization_data
            .first()
            .map(|d| d.authorization_token.as_str())
            .ok_or_else(|| AwsError::Response {
                operation: "ecr get-authorization-token".to_string(),
                message: "no authorization data returned".to_string(),
            })?;
        decode_authorization(token)
    }
}

/// Split a base64 `user:password` registry token
fn decode_authorization(token: &str) -> Result<RegistryCredentials> {
    let invalid = |message: String| AwsError::Response {
        operation: "ecr get-authorization-token".to_string(),
        message,
    };

    let decoded = STANDARD
        .decode(token)
        .map_err(|e| invalid(e.to_string()))?;
    let decoded = String::from_utf8(decoded).map_err(|e| invalid(e.to_string()))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| invalid("authorization token is not user:password".to_string()))?;

    Ok(RegistryCredentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}
