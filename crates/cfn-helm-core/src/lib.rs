//! cfn-helm Core - Core types shared by the Helm release and EKS cluster providers
//!
//! This crate provides the foundational types used throughout cfn-helm:
//! - `HelmReleaseModel` / `EksClusterModel`: the resource properties CloudFormation sends
//! - `IdentityToken`: the encoded physical identifier of a release
//! - `Stage` / `CallbackContext`: the re-invocation protocol state
//! - `ChartDetails`: chart reference resolution
//! - `Values`: value overrides with deep merge support
//! - `Event` / `ConnectorResponse`: the VPC connector wire envelope

pub mod chart;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod model;
pub mod release;
pub mod stage;
pub mod values;

pub use chart::{ChartDetails, ChartKind, release_name, release_namespace};
pub use envelope::{Action, ConnectorResponse, Event, Inputs, ReleaseConfig, RemoteError};
pub use error::{CoreError, Result};
pub use identity::IdentityToken;
pub use model::{
    EksClusterModel, EncryptionConfigEntry, HelmReleaseModel, KeyProvider, KubernetesNetworkConfig,
    RepositoryOptions, ResourcesVpcConfig, Tag, VpcConfiguration,
};
pub use release::{HelmListData, HelmStatusData, ReleaseData, ReleaseStatus};
pub use stage::{CallbackContext, Stage};
pub use values::{Values, parse_set_value};
