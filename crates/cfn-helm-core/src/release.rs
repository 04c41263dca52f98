//! Release descriptors exchanged between the release manager and handlers

use serde::{Deserialize, Serialize};

/// Release status, named the way Helm reports it
///
/// Note: This enum is non-exhaustive - new variants may be added in future versions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum ReleaseStatus {
    #[default]
    Unknown,
    Deployed,
    Uninstalled,
    Superseded,
    Failed,
    Uninstalling,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
}

impl ReleaseStatus {
    /// Whether an install, upgrade or rollback is still in flight
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::PendingInstall | Self::PendingUpgrade | Self::PendingRollback
        )
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "deployed" => Self::Deployed,
            "uninstalled" => Self::Uninstalled,
            "superseded" => Self::Superseded,
            "failed" => Self::Failed,
            "uninstalling" => Self::Uninstalling,
            "pending-install" => Self::PendingInstall,
            "pending-upgrade" => Self::PendingUpgrade,
            "pending-rollback" => Self::PendingRollback,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Deployed => "deployed",
            Self::Uninstalled => "uninstalled",
            Self::Superseded => "superseded",
            Self::Failed => "failed",
            Self::Uninstalling => "uninstalling",
            Self::PendingInstall => "pending-install",
            Self::PendingUpgrade => "pending-upgrade",
            Self::PendingRollback => "pending-rollback",
        };
        write!(f, "{}", s)
    }
}

/// Result of a release status query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HelmStatusData {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    pub status: ReleaseStatus,

    /// Release description; installs and upgrades record the identity token here
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub chart_name: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub chart_version: String,

    /// `<name>-<version>`
    #[serde(skip_serializing_if = "String::is_empty")]
    pub chart: String,

    /// Rendered manifest of the current revision
    #[serde(skip_serializing_if = "String::is_empty")]
    pub manifest: String,
}

/// One entry of a release listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HelmListData {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub release_name: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub chart_name: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub chart_version: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub chart: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    /// Identity recorded on the release, filled only by cluster-wide listings
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// The part of a release the readiness and resource queries need
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ReleaseData {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub chart: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub manifest: String,
}

impl From<&HelmStatusData> for ReleaseData {
    fn from(status: &HelmStatusData) -> Self {
        Self {
            name: status.name.clone(),
            chart: status.chart.clone(),
            namespace: status.namespace.clone(),
            manifest: status.manifest.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&ReleaseStatus::PendingUpgrade).unwrap();
        assert_eq!(json, "\"pending-upgrade\"");

        let status: ReleaseStatus = serde_json::from_str("\"deployed\"").unwrap();
        assert_eq!(status, ReleaseStatus::Deployed);
        assert_eq!(ReleaseStatus::parse("pending-rollback"), ReleaseStatus::PendingRollback);
        assert_eq!(ReleaseStatus::parse("whatever"), ReleaseStatus::Unknown);
    }

    #[test]
    fn test_is_pending() {
        assert!(ReleaseStatus::PendingInstall.is_pending());
        assert!(ReleaseStatus::PendingRollback.is_pending());
        assert!(!ReleaseStatus::Deployed.is_pending());
        assert!(!ReleaseStatus::Failed.is_pending());
    }

    #[test]
    fn test_release_data_from_status() {
        let status = HelmStatusData {
            name: "web".to_string(),
            namespace: "default".to_string(),
            status: ReleaseStatus::Deployed,
            chart: "nginx-1.0.0".to_string(),
            manifest: "kind: Service".to_string(),
            ..Default::default()
        };

        let data = ReleaseData::from(&status);
        assert_eq!(data.name, "web");
        assert_eq!(data.chart, "nginx-1.0.0");
        assert_eq!(data.manifest, "kind: Service");
    }

    #[test]
    fn test_status_data_omits_empty_fields() {
        let status = HelmStatusData {
            name: "web".to_string(),
            status: ReleaseStatus::Deployed,
            ..Default::default()
        };
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, r#"{"Name":"web","Status":"deployed"}"#);
    }
}
