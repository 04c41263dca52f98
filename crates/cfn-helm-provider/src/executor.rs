//! Release execution strategies
//!
//! The handlers drive a release through the [`Executor`] trait without
//! knowing where the work happens. [`LocalExecutor`] runs Helm and the
//! readiness checks in-process; [`RemoteExecutor`] ships each operation to
//! the VPC connector as an [`Event`]. Both report failures as [`ExecError`],
//! so a release that is missing remotely looks exactly like one missing
//! locally.

use async_trait::async_trait;
use cfn_helm_aws::{AwsServices, FunctionApi};
use cfn_helm_core::{
    Action, ChartDetails, Event, HelmListData, HelmReleaseModel, HelmStatusData, IdentityToken,
    Inputs, ReleaseConfig, ReleaseData, RemoteError,
};
use cfn_helm_kube::{
    ChartFetcher, Diagnostics, HelmCli, HelmPaths, KubeError, LazyKubeFetcher, ManifestInspector,
    ObjectFetcher, ReleaseManager, ResourceInspector, write_kubeconfig,
};
use cfn_helm_core::envelope::{ERROR_TYPE_ALREADY_EXISTS, ERROR_TYPE_NOT_FOUND};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::error::ProviderError;
use crate::invoke::{InvokeError, InvokePolicy, invoke_connector};
use crate::settings::ProviderSettings;

const ERROR_TYPE_ACTION: &str = "HelmActionException";
const ERROR_TYPE_KUBE: &str = "KubeException";
const ERROR_TYPE_CONNECTOR: &str = "LambdaException";
pub(crate) const ERROR_TYPE_INVALID: &str = "InvalidRequest";

/// Failure of an execution strategy
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    /// Helm refused or failed the operation
    #[error("{0}")]
    Release(String),

    /// The cluster could not be reached or queried
    #[error("{0}")]
    Kube(String),

    /// The connector could not be invoked
    #[error("{0}")]
    Connector(String),

    /// The operation was asked for with missing or malformed input
    #[error("{0}")]
    Invalid(String),
}

impl From<KubeError> for ExecError {
    fn from(e: KubeError) -> Self {
        if e.is_not_found() {
            return Self::NotFound(e.to_string());
        }
        if e.is_already_exists() {
            return Self::AlreadyExists(e.to_string());
        }
        match e {
            KubeError::Api(_)
            | KubeError::Kubeconfig(_)
            | KubeError::InvalidManifest(_)
            | KubeError::ResourceLookup => Self::Kube(e.to_string()),
            other => Self::Release(other.to_string()),
        }
    }
}

impl From<InvokeError> for ExecError {
    fn from(e: InvokeError) -> Self {
        match e {
            InvokeError::Remote(remote) => match remote.error_type.as_str() {
                ERROR_TYPE_NOT_FOUND => Self::NotFound(remote.error_message),
                ERROR_TYPE_ALREADY_EXISTS => Self::AlreadyExists(remote.error_message),
                ERROR_TYPE_ACTION => Self::Release(remote.error_message),
                ERROR_TYPE_KUBE => Self::Kube(remote.error_message),
                ERROR_TYPE_CONNECTOR => Self::Connector(remote.error_message),
                ERROR_TYPE_INVALID => Self::Invalid(remote.error_message),
                _ => Self::Release(remote.to_string()),
            },
            other => Self::Connector(other.to_string()),
        }
    }
}

impl ExecError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Error payload returned by the connector for this failure
    pub fn to_remote(&self) -> RemoteError {
        let error_type = match self {
            Self::NotFound(_) => ERROR_TYPE_NOT_FOUND,
            Self::AlreadyExists(_) => ERROR_TYPE_ALREADY_EXISTS,
            Self::Release(_) => ERROR_TYPE_ACTION,
            Self::Kube(_) => ERROR_TYPE_KUBE,
            Self::Connector(_) => ERROR_TYPE_CONNECTOR,
            Self::Invalid(_) => ERROR_TYPE_INVALID,
        };
        RemoteError::new(error_type, self.to_string())
    }

    /// Handler error for a failed release operation
    pub fn into_action(self) -> ProviderError {
        match self {
            Self::Connector(m) => ProviderError::Connector(m),
            Self::Kube(m) => ProviderError::Kube(m),
            Self::Invalid(m) => ProviderError::InvalidRequest(m),
            other => ProviderError::Action(other.to_string()),
        }
    }

    /// Handler error for a failed cluster query
    pub fn into_kube(self) -> ProviderError {
        match self {
            Self::Connector(m) => ProviderError::Connector(m),
            Self::Invalid(m) => ProviderError::InvalidRequest(m),
            other => ProviderError::Kube(other.to_string()),
        }
    }
}

/// Where release operations run
#[async_trait]
pub trait Executor: Send + Sync {
    /// Install a release tagged with the encoded identity `id`
    async fn install(&self, inputs: &Inputs, id: &str) -> Result<(), ExecError>;

    async fn upgrade(&self, inputs: &Inputs, id: &str) -> Result<(), ExecError>;

    async fn uninstall(&self, config: &ReleaseConfig) -> Result<(), ExecError>;

    async fn status(&self, config: &ReleaseConfig) -> Result<HelmStatusData, ExecError>;

    /// Whether the release still has unready objects, recording why in `diags`
    async fn pending(&self, release: &ReleaseData, diags: &mut Diagnostics) -> Result<bool, ExecError>;

    async fn resources(&self, release: &ReleaseData) -> Result<BTreeMap<String, Value>, ExecError>;

    /// Every release in the cluster, each carrying its encoded identity
    async fn releases(&self) -> Result<Vec<HelmListData>, ExecError>;
}

fn require_chart(inputs: &Inputs) -> Result<&ChartDetails, ExecError> {
    inputs
        .chart_details
        .as_ref()
        .ok_or_else(|| ExecError::Invalid("chart details not provided".to_string()))
}

/// Runs releases in this process
pub struct LocalExecutor {
    releases: Arc<dyn ReleaseManager>,
    inspector: Arc<dyn ResourceInspector>,
}

impl LocalExecutor {
    pub fn new(releases: Arc<dyn ReleaseManager>, inspector: Arc<dyn ResourceInspector>) -> Self {
        Self { releases, inspector }
    }

    /// Releases of the chart in `inputs`
    pub async fn list(&self, inputs: &Inputs) -> Result<Vec<HelmListData>, ExecError> {
        let chart = require_chart(inputs)?;
        Ok(self.releases.list(&inputs.config, chart).await?)
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn install(&self, inputs: &Inputs, id: &str) -> Result<(), ExecError> {
        let chart = require_chart(inputs)?;
        self.releases
            .install(&inputs.config, chart, &inputs.value_opts, id)
            .await?;
        Ok(())
    }

    async fn upgrade(&self, inputs: &Inputs, id: &str) -> Result<(), ExecError> {
        let chart = require_chart(inputs)?;
        self.releases
            .upgrade(&inputs.config, chart, &inputs.value_opts, id)
            .await?;
        Ok(())
    }

    async fn uninstall(&self, config: &ReleaseConfig) -> Result<(), ExecError> {
        Ok(self.releases.uninstall(config).await?)
    }

    async fn status(&self, config: &ReleaseConfig) -> Result<HelmStatusData, ExecError> {
        Ok(self.releases.status(config).await?)
    }

    async fn pending(&self, release: &ReleaseData, diags: &mut Diagnostics) -> Result<bool, ExecError> {
        Ok(self.inspector.pending(release, diags).await?)
    }

    async fn resources(&self, release: &ReleaseData) -> Result<BTreeMap<String, Value>, ExecError> {
        Ok(self.inspector.resources(release).await?)
    }

    async fn releases(&self) -> Result<Vec<HelmListData>, ExecError> {
        Ok(self.releases.list_all().await?)
    }
}

/// Runs releases through the VPC connector
pub struct RemoteExecutor {
    functions: Arc<dyn FunctionApi>,
    function_name: String,
    kubeconfig: Vec<u8>,
    model: HelmReleaseModel,
    policy: InvokePolicy,
}

impl RemoteExecutor {
    pub fn new(
        functions: Arc<dyn FunctionApi>,
        function_name: impl Into<String>,
        kubeconfig: Vec<u8>,
        model: HelmReleaseModel,
        settings: &ProviderSettings,
    ) -> Self {
        Self {
            functions,
            function_name: function_name.into(),
            kubeconfig,
            model,
            policy: InvokePolicy {
                attempts: settings.retry_count.max(1),
                delay: settings.invoke_retry_delay,
            },
        }
    }

    fn event(&self, action: Action, model: HelmReleaseModel) -> Event {
        let token = model.id.as_deref().and_then(|id| IdentityToken::decode(id).ok());
        let mut event = Event::new(action)
            .with_kubeconfig(self.kubeconfig.clone())
            .with_model(model);
        if let Some(token) = token {
            event = event.with_id(token);
        }
        event
    }

    async fn send(&self, event: Event) -> Result<cfn_helm_core::ConnectorResponse, ExecError> {
        Ok(invoke_connector(self.functions.as_ref(), &self.function_name, &event, self.policy).await?)
    }

    fn with_id(&self, id: &str) -> HelmReleaseModel {
        HelmReleaseModel {
            id: Some(id.to_string()),
            ..self.model.clone()
        }
    }
}

#[async_trait]
impl Executor for RemoteExecutor {
    async fn install(&self, inputs: &Inputs, id: &str) -> Result<(), ExecError> {
        let event = self
            .event(Action::InstallRelease, self.with_id(id))
            .with_inputs(inputs.clone());
        self.send(event).await.map(|_| ())
    }

    async fn upgrade(&self, inputs: &Inputs, id: &str) -> Result<(), ExecError> {
        let event = self
            .event(Action::UpdateRelease, self.with_id(id))
            .with_inputs(inputs.clone());
        self.send(event).await.map(|_| ())
    }

    async fn uninstall(&self, config: &ReleaseConfig) -> Result<(), ExecError> {
        let event = self
            .event(Action::UninstallRelease, self.model.clone())
            .with_inputs(Inputs {
                config: config.clone(),
                ..Default::default()
            });
        self.send(event).await.map(|_| ())
    }

    async fn status(&self, config: &ReleaseConfig) -> Result<HelmStatusData, ExecError> {
        let event = self
            .event(Action::CheckRelease, self.model.clone())
            .with_inputs(Inputs {
                config: config.clone(),
                ..Default::default()
            });
        self.send(event)
            .await?
            .status_data
            .ok_or_else(|| ExecError::Connector("connector returned no release status".to_string()))
    }

    async fn pending(&self, release: &ReleaseData, diags: &mut Diagnostics) -> Result<bool, ExecError> {
        let event = self
            .event(Action::GetPending, self.model.clone())
            .with_release_data(release.clone());
        let response = self.send(event).await?;
        diags.extend(response.last_known_errors);
        Ok(response.pending_resources)
    }

    async fn resources(&self, release: &ReleaseData) -> Result<BTreeMap<String, Value>, ExecError> {
        let event = self
            .event(Action::GetResources, self.model.clone())
            .with_release_data(release.clone());
        Ok(self.send(event).await?.resources.unwrap_or_default())
    }

    /// A listing without chart details asks the connector for every release
    async fn releases(&self) -> Result<Vec<HelmListData>, ExecError> {
        let event = self.event(Action::ListRelease, self.model.clone());
        Ok(self.send(event).await?.list_data)
    }
}

/// Builds the in-process executor for a kubeconfig
#[async_trait]
pub trait LocalBackend: Send + Sync {
    async fn connect(&self, kubeconfig: &[u8]) -> Result<LocalExecutor, ExecError>;
}

/// Production backend: the `helm` executable and the Kubernetes API
pub struct HelmBackend {
    settings: Arc<ProviderSettings>,
    aws: AwsServices,
}

impl HelmBackend {
    pub fn new(settings: Arc<ProviderSettings>, aws: AwsServices) -> Self {
        Self { settings, aws }
    }
}

#[async_trait]
impl LocalBackend for HelmBackend {
    async fn connect(&self, kubeconfig: &[u8]) -> Result<LocalExecutor, ExecError> {
        let paths = &self.settings.paths;
        write_kubeconfig(&paths.kubeconfig, kubeconfig).await?;

        let fetcher = ChartFetcher::new(
            self.aws.objects.clone(),
            self.aws.registry.clone(),
            self.settings.helm_binary.clone(),
        )?;
        let helm = HelmCli::new(
            self.settings.helm_binary.clone(),
            HelmPaths {
                kubeconfig: paths.kubeconfig.clone(),
                chart: paths.chart.clone(),
                ca_file: paths.ca_file.clone(),
                values: paths.values.clone(),
            },
            fetcher,
        );
        let inspector = ManifestInspector::new(
            Arc::new(LazyKubeFetcher::new(paths.kubeconfig.clone())),
            self.settings.retry_count,
            self.settings.output_limit,
        );

        Ok(LocalExecutor::new(Arc::new(helm), Arc::new(inspector)))
    }
}

/// Backend serving fixed collaborators regardless of the kubeconfig
pub struct FixedBackend {
    releases: Arc<dyn ReleaseManager>,
    fetcher: Arc<dyn ObjectFetcher>,
    retry_count: usize,
    output_limit: usize,
}

impl FixedBackend {
    pub fn new(releases: Arc<dyn ReleaseManager>, fetcher: Arc<dyn ObjectFetcher>) -> Self {
        let defaults = ProviderSettings::default();
        Self {
            releases,
            fetcher,
            retry_count: defaults.retry_count,
            output_limit: defaults.output_limit,
        }
    }
}

#[async_trait]
impl LocalBackend for FixedBackend {
    async fn connect(&self, _kubeconfig: &[u8]) -> Result<LocalExecutor, ExecError> {
        let inspector =
            ManifestInspector::new(self.fetcher.clone(), self.retry_count, self.output_limit);
        Ok(LocalExecutor::new(self.releases.clone(), Arc::new(inspector)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfn_helm_aws::{FunctionSpec, InvokeOutput, MockAws};
    use cfn_helm_core::{ChartKind, ConnectorResponse, ReleaseStatus, Values};
    use cfn_helm_kube::{MockObjectFetcher, MockReleaseManager};
    use std::sync::Mutex;

    fn chart() -> ChartDetails {
        ChartDetails {
            chart: "stable/nginx".to_string(),
            chart_name: "nginx".to_string(),
            chart_path: None,
            kind: ChartKind::Remote,
            chart_repo: Some("stable".to_string()),
            chart_version: None,
            chart_repo_url: "https://charts.helm.sh/stable".to_string(),
            chart_username: None,
            chart_password: None,
            skip_tls_verify: false,
            ca_file: None,
        }
    }

    fn inputs() -> Inputs {
        Inputs {
            config: ReleaseConfig::new("web", "default"),
            chart_details: Some(chart()),
            value_opts: Values::new(),
        }
    }

    #[test]
    fn test_kube_errors_are_classified() {
        let missing: ExecError = KubeError::ReleaseNotFound {
            name: "web".to_string(),
            namespace: "default".to_string(),
        }
        .into();
        assert!(missing.is_not_found());

        let exists: ExecError = KubeError::ReleaseAlreadyExists {
            name: "web".to_string(),
            namespace: "default".to_string(),
        }
        .into();
        assert!(matches!(exists, ExecError::AlreadyExists(_)));

        let lookup: ExecError = KubeError::ResourceLookup.into();
        assert!(matches!(lookup, ExecError::Kube(_)));

        let helm: ExecError = KubeError::Helm {
            command: "install".to_string(),
            message: "boom".to_string(),
        }
        .into();
        assert!(matches!(helm, ExecError::Release(_)));
    }

    #[test]
    fn test_remote_errors_keep_their_classification() {
        let local = ExecError::NotFound("release: not found: default/web".to_string());
        let remote = local.to_remote();
        assert_eq!(remote.error_type, "NotFound");

        let back: ExecError = InvokeError::Remote(remote).into();
        assert!(back.is_not_found());

        let other: ExecError = InvokeError::Remote(RemoteError::new("Runtime.ExitError", "oom")).into();
        assert_eq!(other.to_string(), "[Runtime.ExitError] oom");
        assert!(matches!(other, ExecError::Release(m) if m == "[Runtime.ExitError] oom"));
    }

    #[test]
    fn test_every_classification_survives_the_connector() {
        let errors = [
            ExecError::NotFound("release: not found: default/web".to_string()),
            ExecError::AlreadyExists("release already exists".to_string()),
            ExecError::Release("helm bad".to_string()),
            ExecError::Kube("cluster unreachable".to_string()),
            ExecError::Connector("lambda down".to_string()),
            ExecError::Invalid("chart details not provided".to_string()),
        ];

        for local in errors {
            let back: ExecError = InvokeError::Remote(local.to_remote()).into();
            assert_eq!(back.to_string(), local.to_string());
            assert_eq!(
                std::mem::discriminant(&back),
                std::mem::discriminant(&local),
                "{:?} came back as {:?}",
                local,
                back
            );
        }

        let remote: ExecError =
            InvokeError::Remote(ExecError::Connector("lambda down".to_string()).to_remote()).into();
        assert_eq!(
            remote.into_action().code(),
            crate::error::HandlerErrorCode::LambdaException
        );
    }

    #[test]
    fn test_handler_error_mapping() {
        assert_eq!(
            ExecError::Release("boom".to_string()).into_action().code(),
            crate::error::HandlerErrorCode::HelmActionException
        );
        assert_eq!(
            ExecError::Connector("down".to_string()).into_action().code(),
            crate::error::HandlerErrorCode::LambdaException
        );
        assert_eq!(
            ExecError::Release("boom".to_string()).into_kube().code(),
            crate::error::HandlerErrorCode::KubeException
        );
        assert_eq!(
            ExecError::Invalid("no chart".to_string()).into_action().code(),
            crate::error::HandlerErrorCode::InvalidRequest
        );
    }

    #[tokio::test]
    async fn test_local_executor_drives_release_manager() {
        let releases = MockReleaseManager::new();
        let backend = FixedBackend::new(Arc::new(releases.clone()), Arc::new(MockObjectFetcher::new()));
        let executor = backend.connect(b"").await.unwrap();

        executor.install(&inputs(), "id-1").await.unwrap();
        let status = executor.status(&ReleaseConfig::new("web", "default")).await.unwrap();
        assert_eq!(status.status, ReleaseStatus::Deployed);
        assert_eq!(status.description, "id-1");

        let err = executor.install(&inputs(), "id-1").await.unwrap_err();
        assert!(matches!(err, ExecError::AlreadyExists(_)));

        assert_eq!(executor.list(&inputs()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_local_install_requires_chart() {
        let backend = FixedBackend::new(
            Arc::new(MockReleaseManager::new()),
            Arc::new(MockObjectFetcher::new()),
        );
        let executor = backend.connect(b"").await.unwrap();
        let err = executor
            .install(
                &Inputs {
                    config: ReleaseConfig::new("web", "default"),
                    ..Default::default()
                },
                "id-1",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_remote_executor_ships_events() {
        let seen: Arc<Mutex<Vec<Event>>> = Arc::default();
        let recorder = seen.clone();
        let aws = MockAws::new().with_invoke_handler(move |_, payload| {
            let event: Event = serde_json::from_slice(payload).unwrap();
            let response = match event.action {
                Action::GetPending => ConnectorResponse {
                    pending_resources: true,
                    last_known_errors: vec!["Deployment is not ready: default/web".to_string()],
                    ..Default::default()
                },
                _ => ConnectorResponse::default(),
            };
            recorder.lock().unwrap().push(event);
            Ok(InvokeOutput {
                status_code: 200,
                function_error: None,
                payload: serde_json::to_vec(&response).unwrap(),
            })
        });
        let spec = FunctionSpec {
            function_name: "connector".to_string(),
            ..Default::default()
        };
        aws.create_function(&spec, b"zip").await.unwrap();

        let executor = RemoteExecutor::new(
            Arc::new(aws),
            "connector",
            b"apiVersion: v1".to_vec(),
            HelmReleaseModel::default(),
            &ProviderSettings::without_delays(),
        );

        let id = IdentityToken {
            cluster_id: Some("eks".to_string()),
            region: "us-east-1".to_string(),
            name: "web".to_string(),
            namespace: "default".to_string(),
            ..Default::default()
        }
        .encode()
        .unwrap();
        executor.install(&inputs(), &id).await.unwrap();

        let mut diags = Diagnostics::new();
        let pending = executor
            .pending(
                &ReleaseData {
                    name: "web".to_string(),
                    namespace: "default".to_string(),
                    ..Default::default()
                },
                &mut diags,
            )
            .await
            .unwrap();
        assert!(pending);
        assert_eq!(diags.entries(), ["Deployment is not ready: default/web"]);

        let events = seen.lock().unwrap();
        assert_eq!(events[0].action, Action::InstallRelease);
        assert_eq!(events[0].kubeconfig.as_deref(), Some(&b"apiVersion: v1"[..]));
        assert_eq!(events[0].model.as_ref().unwrap().id.as_deref(), Some(id.as_str()));
        assert_eq!(events[0].id.as_ref().unwrap().name, "web");
        assert_eq!(events[1].action, Action::GetPending);
    }

    #[tokio::test]
    async fn test_remote_status_requires_data() {
        let aws = MockAws::new().with_invoke_handler(|_, _| {
            Ok(InvokeOutput {
                status_code: 200,
                function_error: None,
                payload: b"{}".to_vec(),
            })
        });
        let spec = FunctionSpec {
            function_name: "connector".to_string(),
            ..Default::default()
        };
        aws.create_function(&spec, b"zip").await.unwrap();

        let executor = RemoteExecutor::new(
            Arc::new(aws),
            "connector",
            Vec::new(),
            HelmReleaseModel::default(),
            &ProviderSettings::without_delays(),
        );
        let err = executor
            .status(&ReleaseConfig::new("web", "default"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Connector(_)));
    }
}
