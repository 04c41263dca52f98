//! Helm release resource handlers
//!
//! Each invocation performs one step of the release lifecycle and reports
//! where it stopped through the callback context:
//!
//! ```text
//! Init ──(identity minted)──► Init ──(install/upgrade issued)──► ReleaseStabilize ──► Success
//!   │                                                                  │
//!   └──────────────(connector not Active yet)──► ConnectorStabilize ◄──┘
//! ```
//!
//! Delete runs the same connector gate before uninstalling, then tears the
//! connector down once no other release in the cluster maps to it.

use cfn_helm_aws::AwsServices;
use cfn_helm_core::{
    Action, CallbackContext, ChartDetails, HelmReleaseModel, IdentityToken, Inputs, ReleaseConfig,
    ReleaseData, ReleaseStatus, Stage, Values, release_name, release_namespace,
};
use cfn_helm_kube::{Diagnostics, KubeconfigSource, download_s3, resolve_kubeconfig};
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::connector::{ConnectorDescriptor, ConnectorManager, connector_name};
use crate::error::{ProviderError, Result};
use crate::event::{HandlerRequest, Outcome, ProgressEvent, Reconciliation};
use crate::executor::{ExecError, Executor, HelmBackend, LocalBackend, RemoteExecutor};
use crate::network::detect_placement;
use crate::settings::{ProviderSettings, resolve_region};

type Event = ProgressEvent<HelmReleaseModel>;

/// Handlers of the `AWSQS::Kubernetes::Helm` resource type
pub struct HelmReleaseProvider {
    settings: Arc<ProviderSettings>,
    aws: AwsServices,
    backend: Arc<dyn LocalBackend>,
}

impl HelmReleaseProvider {
    pub fn new(settings: Arc<ProviderSettings>, aws: AwsServices, backend: Arc<dyn LocalBackend>) -> Self {
        Self {
            settings,
            aws,
            backend,
        }
    }

    /// Provider running releases through the `helm` executable
    pub fn with_helm(settings: Arc<ProviderSettings>, aws: AwsServices) -> Self {
        let backend = Arc::new(HelmBackend::new(settings.clone(), aws.clone()));
        Self::new(settings, aws, backend)
    }

    pub async fn create(&self, request: &HandlerRequest<HelmReleaseModel>) -> Event {
        self.apply(request, Action::InstallRelease).await
    }

    pub async fn update(&self, request: &HandlerRequest<HelmReleaseModel>) -> Event {
        self.apply(request, Action::UpdateRelease).await
    }

    /// Describe the release
    ///
    /// Failures to reach the release keep the model; a missing or failed
    /// release drops it.
    pub async fn read(&self, request: &HandlerRequest<HelmReleaseModel>) -> Event {
        let mut model = request.desired_resource_state.clone().unwrap_or_default();
        if let Err(e) = restore_address(&mut model) {
            return ProgressEvent::failed(&e, Some(model));
        }
        if let Err(e) = self.detect(&mut model).await {
            return ProgressEvent::failed(&e, Some(model));
        }

        let executor = match self.executor(&model).await {
            Ok(Some(executor)) => executor,
            Ok(None) => {
                let err = ProviderError::InvalidRequest("vpc connector didn't stabilize in time".to_string());
                return ProgressEvent::failed(&err, Some(model));
            }
            Err(e) => return ProgressEvent::failed(&e, Some(model)),
        };

        match executor.status(&release_config(&model)).await {
            Ok(_) => ProgressEvent::success(Some(model)),
            Err(e) if e.is_not_found() => {
                ProgressEvent::failed(&ProviderError::NotFound(e.to_string()), None)
            }
            Err(e) => ProgressEvent::failed(&e.into_action(), None),
        }
    }

    pub async fn delete(&self, request: &HandlerRequest<HelmReleaseModel>) -> Event {
        let now = Utc::now();
        let mut model = request.desired_resource_state.clone().unwrap_or_default();
        let (stage, started_at) = CallbackContext::resolve(request.callback_context.as_ref(), now);
        let run = self.reconciliation(&model, started_at, now);
        let diags = Diagnostics::new();

        let outcome = match stage {
            Stage::Init | Stage::ConnectorStabilize | Stage::UninstallRelease | Stage::ReleaseStabilize => {
                tracing::info!(stage = %stage, "starting uninstall");
                self.uninstall(&mut model).await
            }
            other => Outcome::Failed(ProviderError::InvalidRequest(format!("unhandled stage {}", other))),
        };

        let model = (!matches!(outcome, Outcome::Complete)).then_some(model);
        let name = model.as_ref().and_then(|m| m.name.clone());
        run.render(outcome, model, name, &diags)
    }

    pub async fn list(&self, _request: &HandlerRequest<HelmReleaseModel>) -> Result<Event> {
        Err(ProviderError::NotImplemented("List"))
    }

    async fn apply(&self, request: &HandlerRequest<HelmReleaseModel>, action: Action) -> Event {
        let now = Utc::now();
        let mut model = request.desired_resource_state.clone().unwrap_or_default();
        let (stage, started_at) = CallbackContext::resolve(request.callback_context.as_ref(), now);
        let run = self.reconciliation(&model, started_at, now);
        let mut diags = Diagnostics::new();

        let outcome = match stage {
            Stage::Init | Stage::ConnectorStabilize => {
                tracing::info!(stage = %stage, action = %action, "starting release operation");
                if model.name.is_none() {
                    model.name = request.callback_context.as_ref().and_then(|c| c.name.clone());
                }
                self.initialize(request.region.as_deref(), &mut model, action, now).await
            }
            Stage::ReleaseStabilize => {
                tracing::info!(stage = %stage, "checking release status");
                self.check_release(&mut model, &mut diags).await
            }
            other => Outcome::Failed(ProviderError::InvalidRequest(format!("unhandled stage {}", other))),
        };

        let model = match &outcome {
            Outcome::Failed(ProviderError::NotFound(_)) => None,
            _ => Some(model),
        };
        let name = model.as_ref().and_then(|m| m.name.clone());
        run.render(outcome, model, name, &diags)
    }

    fn reconciliation(
        &self,
        model: &HelmReleaseModel,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Reconciliation {
        Reconciliation {
            started_at,
            now,
            timeout: Reconciliation::budget(model.time_out, self.settings.default_timeout),
            callback_delay_seconds: self.settings.callback_delay_seconds(),
        }
    }

    /// Derive a placement for private clusters without one
    async fn detect(&self, model: &mut HelmReleaseModel) -> Result<()> {
        if model.placement().is_none() && model.cluster_id.is_some() {
            model.vpc_configuration = detect_placement(
                self.aws.clusters.as_ref(),
                self.aws.network.as_ref(),
                model,
                self.settings.connector.max_subnets,
            )
            .await?;
        }
        Ok(())
    }

    /// Executor for the release, `None` while its connector is still converging
    async fn executor(&self, model: &HelmReleaseModel) -> Result<Option<Box<dyn Executor>>> {
        let source = KubeconfigSource::from_address(
            model.cluster_id.as_deref(),
            model.kube_config.as_deref(),
            model.role_arn.as_deref(),
        )
        .map_err(ProviderError::invalid)?;
        let kubeconfig = resolve_kubeconfig(
            &source,
            self.aws.clusters.as_ref(),
            self.aws.identity.as_ref(),
            self.aws.secrets.as_ref(),
        )
        .await
        .map_err(ProviderError::kube)?;

        let Some(placement) = model.placement() else {
            let local = self
                .backend
                .connect(&kubeconfig)
                .await
                .map_err(ExecError::into_kube)?;
            return Ok(Some(Box::new(local)));
        };

        let desired = ConnectorDescriptor::build(
            &self.settings,
            self.aws.identity.as_ref(),
            connector_target(model),
            placement,
        )
        .await?;
        let manager = ConnectorManager::new(self.aws.functions.as_ref(), &self.settings);
        if !manager.ensure_active(&desired).await? {
            tracing::info!(connector = %desired.name(), "connector is not active yet");
            return Ok(None);
        }

        Ok(Some(Box::new(RemoteExecutor::new(
            self.aws.functions.clone(),
            desired.name(),
            kubeconfig,
            model.clone(),
            &self.settings,
        ))))
    }

    async fn values(&self, model: &HelmReleaseModel) -> Result<Values> {
        let mut values = Values::from_inputs(model.value_yaml.as_deref(), model.values.as_ref())?;
        if let Some(url) = model.value_override_url.as_deref().filter(|u| !u.is_empty()) {
            let body = download_s3(self.aws.objects.as_ref(), url)
                .await
                .map_err(ProviderError::invalid)?;
            let overlay = Values::from_yaml(&String::from_utf8_lossy(&body))?;
            values.merge(&overlay);
        }
        Ok(values)
    }

    async fn initialize(
        &self,
        region: Option<&str>,
        model: &mut HelmReleaseModel,
        action: Action,
        now: DateTime<Utc>,
    ) -> Outcome {
        if let Err(e) = self.detect(model).await {
            return Outcome::Failed(e);
        }

        let chart = match ChartDetails::resolve(
            model,
            &self.settings.paths.chart.to_string_lossy(),
            &self.settings.stable_repo_url,
        ) {
            Ok(chart) => chart,
            Err(e) => return Outcome::Failed(e.into()),
        };
        let name = release_name(model.name.as_deref(), &chart.chart_name, now.timestamp());
        model.name = Some(name.clone());
        let namespace = release_namespace(model.namespace.as_deref());

        let Some(id) = model.id.clone() else {
            return match mint_identity(region, model, &name, &namespace) {
                Ok(id) => {
                    tracing::info!(release = %name, "generated identity token");
                    model.id = Some(id);
                    Outcome::Continue(Stage::Init)
                }
                Err(e) => Outcome::Failed(e),
            };
        };
        let token = match IdentityToken::decode(&id) {
            Ok(token) => token,
            Err(e) => return Outcome::Failed(e.into()),
        };

        let executor = match self.executor(model).await {
            Ok(Some(executor)) => executor,
            Ok(None) => return Outcome::Continue(Stage::ConnectorStabilize),
            Err(e) => return Outcome::Failed(e),
        };
        let values = match self.values(model).await {
            Ok(values) => values,
            Err(e) => return Outcome::Failed(e),
        };

        model.name = Some(token.name.clone());
        let inputs = Inputs {
            config: ReleaseConfig::new(token.name, token.namespace),
            chart_details: Some(chart),
            value_opts: values,
        };

        match action {
            Action::InstallRelease => match executor.install(&inputs, &id).await {
                Ok(()) => Outcome::Continue(Stage::ReleaseStabilize),
                Err(ExecError::AlreadyExists(_)) => {
                    tracing::info!(release = %inputs.config.name, "release already installed");
                    Outcome::Continue(Stage::ReleaseStabilize)
                }
                Err(e) => Outcome::Failed(e.into_action()),
            },
            Action::UpdateRelease => match executor.upgrade(&inputs, &id).await {
                Ok(()) => Outcome::Continue(Stage::ReleaseStabilize),
                Err(ExecError::NotFound(m)) => Outcome::Failed(ProviderError::NotFound(m)),
                Err(e) => Outcome::Failed(e.into_action()),
            },
            other => Outcome::Failed(ProviderError::InvalidRequest(format!("unhandled action {}", other))),
        }
    }

    async fn check_release(&self, model: &mut HelmReleaseModel, diags: &mut Diagnostics) -> Outcome {
        if let Err(e) = self.detect(model).await {
            return Outcome::Failed(e);
        }
        let token = match model.id.as_deref().map(IdentityToken::decode) {
            Some(Ok(token)) => token,
            Some(Err(e)) => return Outcome::Failed(e.into()),
            None => return Outcome::Failed(ProviderError::InvalidRequest("release ID is missing".to_string())),
        };
        let config = ReleaseConfig::new(token.name, token.namespace);

        let executor = match self.executor(model).await {
            Ok(Some(executor)) => executor,
            Ok(None) => return Outcome::Continue(Stage::ConnectorStabilize),
            Err(e) => return Outcome::Failed(e),
        };

        let status = match executor.status(&config).await {
            Ok(status) => status,
            Err(e) => return Outcome::Failed(e.into_action()),
        };

        match status.status {
            ReleaseStatus::Deployed => {
                let release = ReleaseData {
                    name: config.name.clone(),
                    namespace: status.namespace.clone(),
                    chart: status.chart.clone(),
                    manifest: status.manifest.clone(),
                };
                match executor.pending(&release, diags).await {
                    Ok(true) => {
                        tracing::info!(release = %release.name, "release has pending resources");
                        Outcome::Continue(Stage::ReleaseStabilize)
                    }
                    Ok(false) => {
                        tracing::info!(release = %release.name, "release has no pending resources");
                        match executor.resources(&release).await {
                            Ok(resources) => model.resources = Some(resources),
                            Err(e) => tracing::warn!(error = %e, "failed to summarize release resources"),
                        }
                        Outcome::Complete
                    }
                    Err(e) => Outcome::Failed(e.into_kube()),
                }
            }
            s => {
                diags.push(format!("Release {}/{} in {} state", status.namespace, config.name, s));
                if s.is_pending() {
                    Outcome::Continue(Stage::ReleaseStabilize)
                } else {
                    Outcome::Failed(ProviderError::action("release failed"))
                }
            }
        }
    }

    async fn uninstall(&self, model: &mut HelmReleaseModel) -> Outcome {
        if let Err(e) = restore_address(model) {
            return Outcome::Failed(e);
        }
        if let Err(e) = self.detect(model).await {
            return Outcome::Failed(e);
        }

        let executor = match self.executor(model).await {
            Ok(Some(executor)) => executor,
            Ok(None) => return Outcome::Continue(Stage::ConnectorStabilize),
            Err(e) => return Outcome::Failed(e),
        };

        let config = release_config(model);
        match executor.status(&config).await {
            Ok(_) => match executor.uninstall(&config).await {
                Ok(()) => tracing::info!(release = %config.name, "release uninstalled"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Outcome::Failed(e.into_action()),
            },
            Err(e) if e.is_not_found() => {
                tracing::info!(release = %config.name, "release not found, skipping uninstall");
            }
            Err(e) => return Outcome::Failed(e.into_action()),
        }

        if let Some(placement) = model.placement() {
            let name = connector_name(
                &self.settings.connector.function_prefix,
                connector_target(model),
                placement,
            );
            match self.connector_users(executor.as_ref(), &config, &name).await {
                Ok(0) => {
                    let manager = ConnectorManager::new(self.aws.functions.as_ref(), &self.settings);
                    if let Err(e) = manager.destroy(&name).await {
                        return Outcome::Failed(e);
                    }
                }
                Ok(users) => {
                    tracing::info!(connector = %name, releases = users, "connector still serves other releases");
                }
                Err(e) => return Outcome::Failed(e.into_kube()),
            }
        }
        Outcome::Complete
    }

    /// Releases other than `config` whose identity maps to the connector `name`
    async fn connector_users(
        &self,
        executor: &dyn Executor,
        config: &ReleaseConfig,
        name: &str,
    ) -> std::result::Result<usize, ExecError> {
        let prefix = &self.settings.connector.function_prefix;
        let users = executor
            .releases()
            .await?
            .into_iter()
            .filter(|r| r.release_name != config.name || r.namespace != config.namespace)
            .filter_map(|r| IdentityToken::decode(&r.description).ok())
            .filter(|token| {
                token
                    .placement()
                    .is_some_and(|placement| connector_name(prefix, token.target(), placement) == name)
            })
            .count();
        Ok(users)
    }
}

/// Restore the release address recorded in the identity token
fn restore_address(model: &mut HelmReleaseModel) -> Result<()> {
    let id = model
        .id
        .as_deref()
        .ok_or_else(|| ProviderError::InvalidRequest("release ID is missing".to_string()))?;
    let token = IdentityToken::decode(id)?;

    model.name = Some(token.name);
    model.namespace = Some(token.namespace);
    model.cluster_id = token.cluster_id;
    model.kube_config = token.kube_config;
    model.vpc_configuration = token.vpc_configuration;
    Ok(())
}

fn release_config(model: &HelmReleaseModel) -> ReleaseConfig {
    ReleaseConfig::new(
        model.name.clone().unwrap_or_default(),
        release_namespace(model.namespace.as_deref()),
    )
}

/// Cluster name or kubeconfig secret a connector serves
fn connector_target(model: &HelmReleaseModel) -> &str {
    model
        .cluster_id
        .as_deref()
        .or(model.kube_config.as_deref())
        .unwrap_or_default()
}

fn mint_identity(
    region: Option<&str>,
    model: &HelmReleaseModel,
    name: &str,
    namespace: &str,
) -> Result<String> {
    let region = resolve_region(region)
        .ok_or_else(|| ProviderError::InvalidRequest("unable to determine the region".to_string()))?;
    Ok(IdentityToken::generate(model, name, &region, namespace)?.encode()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerErrorCode;
    use crate::event::OperationStatus;
    use crate::executor::FixedBackend;
    use cfn_helm_aws::{CertificateAuthority, Cluster, MockAws, VpcConfigResponse};
    use cfn_helm_kube::{MockObjectFetcher, MockReleaseManager};

    fn public_cluster() -> Cluster {
        Cluster {
            name: "eks".to_string(),
            status: Some("ACTIVE".to_string()),
            endpoint: Some("https://eks.example.com".to_string()),
            certificate_authority: Some(CertificateAuthority {
                data: Some("Y2E=".to_string()),
            }),
            resources_vpc_config: Some(VpcConfigResponse {
                endpoint_public_access: true,
                public_access_cidrs: vec!["0.0.0.0/0".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn provider(aws: MockAws, releases: MockReleaseManager) -> HelmReleaseProvider {
        HelmReleaseProvider::new(
            Arc::new(ProviderSettings::without_delays()),
            AwsServices::from_backend(aws),
            Arc::new(FixedBackend::new(
                Arc::new(releases),
                Arc::new(MockObjectFetcher::new()),
            )),
        )
    }

    fn model() -> HelmReleaseModel {
        HelmReleaseModel {
            cluster_id: Some("eks".to_string()),
            chart: Some("stable/nginx".to_string()),
            name: Some("web".to_string()),
            ..Default::default()
        }
    }

    fn request(model: HelmReleaseModel) -> HandlerRequest<HelmReleaseModel> {
        HandlerRequest::new(model).with_region("us-east-1")
    }

    #[tokio::test]
    async fn test_first_create_mints_identity() {
        let releases = MockReleaseManager::new();
        let handlers = provider(MockAws::new().with_cluster(public_cluster()), releases.clone());

        let event = handlers.create(&request(model())).await;
        assert_eq!(event.status, OperationStatus::InProgress);
        assert_eq!(event.callback_context.as_ref().unwrap().stage(), Stage::Init);
        let id = event.resource_model.unwrap().id.unwrap();
        let token = IdentityToken::decode(&id).unwrap();
        assert_eq!(token.name, "web");
        assert_eq!(token.namespace, "default");
        assert_eq!(token.region, "us-east-1");
        assert!(releases.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unhandled_stage() {
        let handlers = provider(MockAws::new(), MockReleaseManager::new());
        let mut req = request(model());
        req.callback_context = Some(CallbackContext::new("Bogus", Utc::now(), None));

        let event = handlers.create(&req).await;
        assert_eq!(event.error_code, Some(HandlerErrorCode::InvalidRequest));
        assert_eq!(event.message, "unhandled stage Bogus");
    }

    #[tokio::test]
    async fn test_missing_chart_is_invalid() {
        let handlers = provider(MockAws::new().with_cluster(public_cluster()), MockReleaseManager::new());
        let event = handlers
            .create(&request(HelmReleaseModel {
                chart: None,
                ..model()
            }))
            .await;
        assert_eq!(event.error_code, Some(HandlerErrorCode::InvalidRequest));
    }

    #[tokio::test]
    async fn test_failed_release_reports_diagnostic() {
        let releases = MockReleaseManager::new().with_deploy_status(ReleaseStatus::Failed);
        let handlers = provider(MockAws::new().with_cluster(public_cluster()), releases);

        let first = handlers.create(&request(model())).await;
        let installing = handlers
            .create(&request(first.resource_model.clone().unwrap()).resumed(&first))
            .await;
        assert_eq!(
            installing.callback_context.as_ref().unwrap().stage(),
            Stage::ReleaseStabilize
        );

        let checked = handlers
            .create(&request(installing.resource_model.clone().unwrap()).resumed(&installing))
            .await;
        assert_eq!(checked.status, OperationStatus::Failed);
        assert_eq!(checked.error_code, Some(HandlerErrorCode::HelmActionException));
        assert_eq!(checked.message, "release failed");
    }

    #[tokio::test]
    async fn test_read_requires_identity() {
        let handlers = provider(MockAws::new(), MockReleaseManager::new());
        let event = handlers.read(&request(model())).await;
        assert_eq!(event.error_code, Some(HandlerErrorCode::InvalidRequest));
        assert_eq!(event.resource_model.unwrap().name.as_deref(), Some("web"));
    }

    #[tokio::test]
    async fn test_read_missing_release_drops_model() {
        let handlers = provider(MockAws::new().with_cluster(public_cluster()), MockReleaseManager::new());
        let id = IdentityToken::generate(&model(), "web", "us-east-1", "default")
            .unwrap()
            .encode()
            .unwrap();

        let event = handlers
            .read(&request(HelmReleaseModel {
                id: Some(id),
                ..model()
            }))
            .await;
        assert_eq!(event.error_code, Some(HandlerErrorCode::NotFound));
        assert!(event.resource_model.is_none());
    }

    #[tokio::test]
    async fn test_list_is_not_implemented() {
        let handlers = provider(MockAws::new(), MockReleaseManager::new());
        let err = handlers.list(&request(model())).await.unwrap_err();
        assert_eq!(err.to_string(), "not implemented: List");
    }
}
