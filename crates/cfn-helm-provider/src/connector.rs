//! VPC connector lifecycle
//!
//! A connector is a function placed in the subnets of a private cluster so
//! release operations can reach its API server. One connector serves every
//! release sharing a cluster (or kubeconfig) and placement: the name is a
//! hash of both.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cfn_helm_aws::{
    FunctionApi, FunctionConfiguration, FunctionSpec, FunctionState, FunctionVpcConfig, IdentityApi,
};
use cfn_helm_core::VpcConfiguration;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{ProviderError, Result};
use crate::settings::ProviderSettings;

/// Connector name for a target and placement
///
/// Security groups and subnets are sorted first, so the same placement
/// always maps to the same connector.
pub fn connector_name(prefix: &str, target: &str, placement: &VpcConfiguration) -> String {
    let mut groups = placement.security_group_ids.clone();
    groups.sort();
    let mut subnets = placement.subnet_ids.clone();
    subnets.sort();

    let key = format!("{}-{}-{}", target, groups.join("-"), subnets.join("-"));
    format!("{}{}", prefix, hex::encode(Md5::digest(key.as_bytes())))
}

/// IAM role ARN behind the caller identity
///
/// `arn:aws:sts::ACCT:assumed-role/NAME/SESSION` becomes
/// `arn:aws:iam::ACCT:role/NAME`; anything else is returned unchanged.
pub fn role_arn(caller_arn: &str) -> String {
    let parts: Vec<&str> = caller_arn.split(':').collect();
    if parts.len() < 6 || parts[2] != "sts" || !parts[5].starts_with("assumed-role") {
        return caller_arn.to_string();
    }

    let mut segments = caller_arn.split('/');
    let head = segments.next().unwrap_or_default();
    let role = segments.next().unwrap_or_default();
    let head = head
        .replacen("assumed-role", "role", 1)
        .replacen(":sts:", ":iam:", 1);
    format!("{}/{}", head, role)
}

/// base64 SHA-256 of a deployment package
pub fn code_hash(code: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(code))
}

/// Desired connector: function configuration plus deployment package
#[derive(Debug, Clone)]
pub struct ConnectorDescriptor {
    pub spec: FunctionSpec,
    pub code: Vec<u8>,
    pub code_sha256: String,
}

impl ConnectorDescriptor {
    pub fn new(spec: FunctionSpec, code: Vec<u8>) -> Self {
        let code_sha256 = code_hash(&code);
        Self {
            spec,
            code,
            code_sha256,
        }
    }

    /// Describe the connector for `target` (cluster name or kubeconfig secret)
    pub async fn build(
        settings: &ProviderSettings,
        identity: &dyn IdentityApi,
        target: &str,
        placement: &VpcConfiguration,
    ) -> Result<Self> {
        let caller = identity.caller_arn().await.map_err(ProviderError::connector)?;
        let code = tokio::fs::read(&settings.connector.artifact_path)
            .await
            .map_err(|e| {
                ProviderError::Connector(format!(
                    "failed to read connector package {}: {}",
                    settings.connector.artifact_path.display(),
                    e
                ))
            })?;

        let spec = FunctionSpec {
            function_name: connector_name(&settings.connector.function_prefix, target, placement),
            handler: settings.connector.handler.clone(),
            memory_size: settings.connector.memory_size,
            role: role_arn(&caller),
            runtime: settings.connector.runtime.clone(),
            timeout: settings.connector.timeout,
            vpc_config: FunctionVpcConfig {
                subnet_ids: placement.subnet_ids.clone(),
                security_group_ids: placement.security_group_ids.clone(),
            },
        };
        Ok(Self::new(spec, code))
    }

    pub fn name(&self) -> &str {
        &self.spec.function_name
    }
}

fn same_set(a: &[String], b: &[String]) -> bool {
    a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}

/// Whether the observed configuration differs from the desired one
///
/// Security groups and subnets compare as sets.
pub fn needs_update(desired: &FunctionSpec, current: &FunctionConfiguration) -> bool {
    let vpc = current.vpc_config.clone().unwrap_or_default();
    !(desired.function_name == current.function_name
        && current.handler.as_deref() == Some(desired.handler.as_str())
        && current.memory_size == Some(desired.memory_size)
        && desired.role == current.role
        && current.runtime.as_deref() == Some(desired.runtime.as_str())
        && current.timeout == Some(desired.timeout)
        && same_set(&desired.vpc_config.security_group_ids, &vpc.security_group_ids)
        && same_set(&desired.vpc_config.subnet_ids, &vpc.subnet_ids))
}

/// Drives a connector to `Active`
pub struct ConnectorManager<'a> {
    functions: &'a dyn FunctionApi,
    settings: &'a ProviderSettings,
}

impl<'a> ConnectorManager<'a> {
    pub fn new(functions: &'a dyn FunctionApi, settings: &'a ProviderSettings) -> Self {
        Self { functions, settings }
    }

    async fn state(&self, name: &str) -> Result<FunctionState> {
        tracing::debug!(function = %name, "checking connector state");
        match self.functions.get_function(name).await {
            Ok(config) => {
                let state = config.state();
                tracing::info!(function = %name, state = %state, "found connector");
                Ok(state)
            }
            Err(e) if e.is_not_found() => Ok(FunctionState::NotFound),
            Err(e) => Err(ProviderError::connector(e)),
        }
    }

    /// Make sure the connector exists, matches `desired` and is invokable
    ///
    /// Returns `false` when it is still converging; the caller re-invokes
    /// later instead of blocking.
    pub async fn ensure_active(&self, desired: &ConnectorDescriptor) -> Result<bool> {
        let name = desired.name();
        match self.state(name).await? {
            FunctionState::NotFound => {
                tracing::info!(function = %name, "creating connector");
                match self.functions.create_function(&desired.spec, &desired.code).await {
                    Ok(_) => {}
                    Err(e) if e.is_conflict() => {
                        tracing::info!(function = %name, "connector already exists");
                    }
                    Err(e) => return Err(ProviderError::connector(e)),
                }
                self.wait_active(name, self.settings.connector_create_poll).await
            }
            FunctionState::Active => {
                let current = self
                    .functions
                    .get_function(name)
                    .await
                    .map_err(ProviderError::connector)?;
                self.synchronize(desired, &current).await?;
                Ok(true)
            }
            FunctionState::Pending => {
                self.wait_active(name, self.settings.connector_pending_poll).await
            }
            other => Err(ProviderError::Connector(format!(
                "{} not in desired state: {}",
                name, other
            ))),
        }
    }

    async fn wait_active(&self, name: &str, interval: Duration) -> Result<bool> {
        for _ in 0..self.settings.retry_count {
            if self.state(name).await? == FunctionState::Active {
                return Ok(true);
            }
            tokio::time::sleep(interval).await;
        }
        tracing::info!(function = %name, "connector is not active yet");
        Ok(false)
    }

    /// Bring an active connector in line with `desired`
    ///
    /// An update colliding with a concurrent one is retried, at most
    /// `retry_count` times.
    async fn synchronize(
        &self,
        desired: &ConnectorDescriptor,
        current: &FunctionConfiguration,
    ) -> Result<()> {
        let name = desired.name();
        let mut attempt = 0;
        loop {
            match self.apply_updates(desired, current).await {
                Err(e) if e.is_update_in_progress() && attempt < self.settings.retry_count => {
                    attempt += 1;
                    tracing::info!(function = %name, attempt, "connector update in progress, retrying");
                    tokio::time::sleep(self.settings.update_retry_delay).await;
                }
                other => return other.map_err(ProviderError::connector),
            }
        }
    }

    async fn apply_updates(
        &self,
        desired: &ConnectorDescriptor,
        current: &FunctionConfiguration,
    ) -> cfn_helm_aws::Result<()> {
        let name = desired.name();
        tracing::debug!(function = %name, "checking for connector updates");

        if desired.code_sha256 != current.code_sha256 {
            tracing::info!(function = %name, "updating connector code");
            self.functions.update_function_code(name, &desired.code).await?;
        }
        if needs_update(&desired.spec, current) {
            tracing::info!(function = %name, "updating connector configuration");
            self.functions.update_function_configuration(&desired.spec).await?;
        }
        Ok(())
    }

    /// Delete the connector; an absent one is fine
    pub async fn destroy(&self, name: &str) -> Result<()> {
        tracing::info!(function = %name, "deleting connector");
        match self.functions.delete_function(name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(ProviderError::connector(e)),
        }
    }
}
