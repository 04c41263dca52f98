//! Connector invocation envelope
//!
//! When a cluster is only reachable from inside its network, the handler
//! serialises an [`Event`] and invokes the connector function with it. The
//! connector answers with a [`ConnectorResponse`] or, on failure, with a
//! [`RemoteError`] payload.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

use crate::chart::ChartDetails;
use crate::identity::IdentityToken;
use crate::model::HelmReleaseModel;
use crate::release::{HelmListData, HelmStatusData, ReleaseData};
use crate::values::Values;

/// Operation requested from the connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    InstallRelease,
    UpdateRelease,
    CheckRelease,
    GetPending,
    GetResources,
    UninstallRelease,
    ListRelease,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InstallRelease => "InstallRelease",
            Self::UpdateRelease => "UpdateRelease",
            Self::CheckRelease => "CheckRelease",
            Self::GetPending => "GetPending",
            Self::GetResources => "GetResources",
            Self::UninstallRelease => "UninstallRelease",
            Self::ListRelease => "ListRelease",
        };
        f.write_str(s)
    }
}

/// Release address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ReleaseConfig {
    pub name: String,
    pub namespace: String,
}

impl ReleaseConfig {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

/// Processed inputs of an install or upgrade
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Inputs {
    pub config: ReleaseConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart_details: Option<ChartDetails>,

    #[serde(skip_serializing_if = "Values::is_empty")]
    pub value_opts: Values,
}

/// Request sent to the connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Event {
    /// Raw kubeconfig, base64 encoded on the wire
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "kubeconfig_bytes"
    )]
    pub kubeconfig: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Inputs>,

    #[serde(rename = "ID", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<IdentityToken>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<HelmReleaseModel>,

    pub action: Action,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_data: Option<ReleaseData>,
}

impl Event {
    pub fn new(action: Action) -> Self {
        Self {
            kubeconfig: None,
            inputs: None,
            id: None,
            model: None,
            action,
            release_data: None,
        }
    }

    pub fn with_kubeconfig(mut self, kubeconfig: Vec<u8>) -> Self {
        self.kubeconfig = Some(kubeconfig);
        self
    }

    pub fn with_inputs(mut self, inputs: Inputs) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn with_id(mut self, id: IdentityToken) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_model(mut self, model: HelmReleaseModel) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_release_data(mut self, data: ReleaseData) -> Self {
        self.release_data = Some(data);
        self
    }
}

/// Successful connector answer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConnectorResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_data: Option<HelmStatusData>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub list_data: Vec<HelmListData>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<BTreeMap<String, serde_json::Value>>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub pending_resources: bool,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub last_known_errors: Vec<String>,
}

/// Error type of a release that does not exist
pub const ERROR_TYPE_NOT_FOUND: &str = "NotFound";

/// Error type of an install that collided with an existing release
pub const ERROR_TYPE_ALREADY_EXISTS: &str = "ReleaseAlreadyExists";

/// Failure payload returned by the connector runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteError {
    pub error_type: String,
    pub error_message: String,
}

impl RemoteError {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
        }
    }

    /// Parse a function error payload, falling back to the raw text
    pub fn from_payload(payload: &[u8]) -> Self {
        match serde_json::from_slice::<RemoteError>(payload) {
            Ok(err) if !err.error_type.is_empty() || !err.error_message.is_empty() => err,
            _ => Self::new("FunctionError", String::from_utf8_lossy(payload)),
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.error_type, self.error_message)
    }
}

mod kubeconfig_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_str(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
