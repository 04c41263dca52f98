//! cfn-helm Provider - CloudFormation resource handlers
//!
//! This crate provides:
//! - **Helm releases**: the staged install, upgrade and uninstall of a release
//!   ([`HelmReleaseProvider`]), run in-process or through a VPC connector
//! - **EKS clusters**: create, update and delete of a cluster
//!   ([`EksClusterProvider`])
//! - **Connector entry point**: the function side of remote execution
//!   ([`ConnectorEntry`]), served by the Lambda runtime loop
//!   ([`ConnectorRuntime`])
//!
//! Every handler returns a [`ProgressEvent`]. Unfinished work is reported as
//! in progress with a callback context the orchestrator replays.

pub mod connector;
pub mod eks;
pub mod error;
pub mod event;
pub mod executor;
pub mod handlers;
pub mod invoke;
pub mod network;
pub mod remote_entry;
pub mod runtime;
pub mod settings;

pub use connector::{ConnectorDescriptor, ConnectorManager, connector_name};
pub use eks::EksClusterProvider;
pub use error::{HandlerErrorCode, ProviderError, Result};
pub use event::{HandlerRequest, OperationStatus, Outcome, ProgressEvent, Reconciliation};
pub use executor::{
    ExecError, Executor, FixedBackend, HelmBackend, LocalBackend, LocalExecutor, RemoteExecutor,
};
pub use handlers::HelmReleaseProvider;
pub use invoke::{InvokeError, InvokePolicy, invoke_connector};
pub use network::detect_placement;
pub use remote_entry::ConnectorEntry;
pub use runtime::ConnectorRuntime;
pub use settings::{ConnectorSettings, ProviderSettings, ScratchPaths, resolve_region};
