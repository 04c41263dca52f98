//! Connector side of remote execution
//!
//! The connector function receives the [`Event`] built by a
//! [`RemoteExecutor`](crate::executor::RemoteExecutor), runs it against a
//! [`LocalExecutor`](crate::executor::LocalExecutor) and answers with a
//! [`ConnectorResponse`]. Failures become a [`RemoteError`] whose type keeps
//! the classification the caller maps back.

use cfn_helm_core::{
    Action, ConnectorResponse, Event, IdentityToken, Inputs, ReleaseConfig, ReleaseData, RemoteError,
};
use cfn_helm_kube::Diagnostics;
use std::sync::Arc;

use crate::executor::{ERROR_TYPE_INVALID, ExecError, Executor, LocalBackend};

fn invalid(message: impl Into<String>) -> RemoteError {
    RemoteError::new(ERROR_TYPE_INVALID, message)
}

/// Serves connector events with an in-process executor
pub struct ConnectorEntry {
    backend: Arc<dyn LocalBackend>,
}

impl ConnectorEntry {
    pub fn new(backend: Arc<dyn LocalBackend>) -> Self {
        Self { backend }
    }

    pub async fn handle(&self, event: Event) -> Result<ConnectorResponse, RemoteError> {
        tracing::info!(action = %event.action, "handling connector event");

        let (token, id) = identity(&event)?;
        let kubeconfig = event
            .kubeconfig
            .as_deref()
            .ok_or_else(|| invalid("kubeconfig not provided in the request"))?;
        let executor = self
            .backend
            .connect(kubeconfig)
            .await
            .map_err(|e| e.to_remote())?;

        let config = event
            .inputs
            .as_ref()
            .map(|i| i.config.clone())
            .filter(|c| !c.name.is_empty())
            .unwrap_or_else(|| ReleaseConfig::new(token.name.clone(), token.namespace.clone()));

        let mut response = ConnectorResponse::default();
        let result: Result<(), ExecError> = match event.action {
            Action::InstallRelease => executor.install(require_inputs(&event)?, &id).await,
            Action::UpdateRelease => executor.upgrade(require_inputs(&event)?, &id).await,
            Action::UninstallRelease => executor.uninstall(&config).await,
            Action::CheckRelease => executor
                .status(&config)
                .await
                .map(|status| response.status_data = Some(status)),
            Action::GetPending => {
                let mut diags = Diagnostics::new();
                let pending = executor.pending(require_release(&event)?, &mut diags).await;
                response.last_known_errors = diags.into_vec();
                pending.map(|p| response.pending_resources = p)
            }
            Action::GetResources => executor
                .resources(require_release(&event)?)
                .await
                .map(|resources| response.resources = Some(resources)),
            Action::ListRelease => {
                let listing = match event.inputs.as_ref().filter(|i| i.chart_details.is_some()) {
                    Some(inputs) => executor.list(inputs).await,
                    None => executor.releases().await,
                };
                listing.map(|releases| response.list_data = releases)
            }
        };

        match result {
            Ok(()) => Ok(response),
            Err(e) => {
                tracing::warn!(action = %event.action, error = %e, "connector action failed");
                Err(e.to_remote())
            }
        }
    }
}

/// Identity of the release and its encoded form
fn identity(event: &Event) -> Result<(IdentityToken, String), RemoteError> {
    let encoded = event.model.as_ref().and_then(|m| m.id.clone());
    let token = match (&event.id, encoded.as_deref()) {
        (Some(token), _) => token.clone(),
        (None, Some(id)) => IdentityToken::decode(id).map_err(|e| invalid(e.to_string()))?,
        (None, None) => return Err(invalid("release ID not provided in the request")),
    };
    let id = match encoded {
        Some(id) => id,
        None => token.encode().map_err(|e| invalid(e.to_string()))?,
    };
    Ok((token, id))
}

fn require_inputs(event: &Event) -> Result<&Inputs, RemoteError> {
    event
        .inputs
        .as_ref()
        .ok_or_else(|| invalid("inputs not provided in the request"))
}

fn require_release(event: &Event) -> Result<&ReleaseData, RemoteError> {
    event
        .release_data
        .as_ref()
        .ok_or_else(|| invalid("release data not provided in the request"))
}
