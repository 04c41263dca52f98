//! Identity token for Helm release resources
//!
//! The token is the physical identifier handed back to CloudFormation. It is
//! the JSON form of [`IdentityToken`] encoded with the URL-safe base64
//! alphabet without padding, so every later Read/Update/Delete can recover the
//! release address without re-deriving it.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::model::{HelmReleaseModel, VpcConfiguration};

/// Decoded release address
///
/// Field order is part of the encoding and must not change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityToken {
    #[serde(rename = "ClusterID", skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,

    #[serde(rename = "KubeConfig", skip_serializing_if = "Option::is_none")]
    pub kube_config: Option<String>,

    #[serde(rename = "Region", skip_serializing_if = "String::is_empty")]
    pub region: String,

    #[serde(rename = "Name", skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(rename = "Namespace", skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(rename = "VPCConfiguration", skip_serializing_if = "Option::is_none")]
    pub vpc_configuration: Option<VpcConfiguration>,
}

impl IdentityToken {
    /// Build the identity of a release from its model and resolved address
    pub fn generate(
        model: &HelmReleaseModel,
        name: &str,
        region: &str,
        namespace: &str,
    ) -> Result<Self> {
        check_target(model.cluster_id.as_deref(), model.kube_config.as_deref())?;

        if name.is_empty() || namespace.is_empty() || region.is_empty() {
            return Err(CoreError::Identity {
                message: "incorrect values for variable name, namespace, region".to_string(),
            });
        }

        Ok(Self {
            cluster_id: model.cluster_id.clone(),
            kube_config: model.kube_config.clone(),
            region: region.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            vpc_configuration: model.placement().cloned(),
        })
    }

    /// Encode to the opaque token string
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Decode a token produced by [`IdentityToken::encode`]
    pub fn decode(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|e| CoreError::IdentityDecode {
                message: e.to_string(),
            })?;

        let token: Self = serde_json::from_slice(&bytes).map_err(|e| CoreError::IdentityDecode {
            message: e.to_string(),
        })?;
        check_target(token.cluster_id.as_deref(), token.kube_config.as_deref()).map_err(|e| {
            CoreError::IdentityDecode {
                message: e.to_string(),
            }
        })?;
        Ok(token)
    }

    pub fn placement(&self) -> Option<&VpcConfiguration> {
        self.vpc_configuration.as_ref().filter(|v| !v.is_empty())
    }

    /// Cluster name or kubeconfig secret the release lives behind
    pub fn target(&self) -> &str {
        self.cluster_id
            .as_deref()
            .or(self.kube_config.as_deref())
            .unwrap_or_default()
    }
}

/// Exactly one of a cluster and a kubeconfig secret addresses a release
fn check_target(cluster_id: Option<&str>, kube_config: Option<&str>) -> Result<()> {
    match (cluster_id, kube_config) {
        (Some(_), Some(_)) => Err(CoreError::Identity {
            message: "both ClusterID or KubeConfig can not be specified".to_string(),
        }),
        (None, None) => Err(CoreError::Identity {
            message: "either ClusterID or KubeConfig must be specified".to_string(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_model() -> HelmReleaseModel {
        HelmReleaseModel {
            cluster_id: Some("eks".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_encode_is_stable() {
        let token = IdentityToken::generate(&cluster_model(), "web", "us-east-1", "default")
            .unwrap()
            .encode()
            .unwrap();

        insta::assert_snapshot!(token, @"eyJDbHVzdGVySUQiOiJla3MiLCJSZWdpb24iOiJ1cy1lYXN0LTEiLCJOYW1lIjoid2ViIiwiTmFtZXNwYWNlIjoiZGVmYXVsdCJ9");
    }

    #[test]
    fn test_round_trip_with_placement() {
        let model = HelmReleaseModel {
            kube_config: Some("arn:aws:secretsmanager:us-east-1:1:secret:kc".to_string()),
            vpc_configuration: Some(VpcConfiguration::new(["sg-2", "sg-1"], ["subnet-1"])),
            ..Default::default()
        };

        let id = IdentityToken::generate(&model, "db", "eu-west-1", "data").unwrap();
        let token = id.encode().unwrap();
        assert!(!token.contains('='));
        assert!(!token.contains('+'));
        assert!(!token.contains('/'));

        let decoded = IdentityToken::decode(&token).unwrap();
        assert_eq!(decoded, id);
        assert_eq!(decoded.cluster_id, None);
        assert_eq!(
            decoded.placement().unwrap().security_group_ids,
            vec!["sg-2".to_string(), "sg-1".to_string()]
        );
    }

    #[test]
    fn test_empty_placement_is_omitted() {
        let model = HelmReleaseModel {
            cluster_id: Some("eks".to_string()),
            vpc_configuration: Some(VpcConfiguration::default()),
            ..Default::default()
        };

        let id = IdentityToken::generate(&model, "web", "us-east-1", "default").unwrap();
        assert!(id.vpc_configuration.is_none());
    }

    #[test]
    fn test_both_targets_rejected() {
        let model = HelmReleaseModel {
            cluster_id: Some("eks".to_string()),
            kube_config: Some("secret".to_string()),
            ..Default::default()
        };

        let err = IdentityToken::generate(&model, "web", "us-east-1", "default").unwrap_err();
        assert_eq!(
            err.to_string(),
            "both ClusterID or KubeConfig can not be specified"
        );
    }

    #[test]
    fn test_missing_target_rejected() {
        let err = IdentityToken::generate(&HelmReleaseModel::default(), "web", "r", "ns")
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "either ClusterID or KubeConfig must be specified"
        );
    }

    #[test]
    fn test_empty_address_rejected() {
        let err = IdentityToken::generate(&cluster_model(), "web", "", "default").unwrap_err();
        assert_eq!(
            err.to_string(),
            "incorrect values for variable name, namespace, region"
        );
    }

    #[test]
    fn test_decode_invalid_base64() {
        let err = IdentityToken::decode("not base64!").unwrap_err();
        assert!(matches!(err, CoreError::IdentityDecode { .. }));
    }

    #[test]
    fn test_decode_checks_target() {
        let both = URL_SAFE_NO_PAD
            .encode(br#"{"ClusterID":"eks","KubeConfig":"secret","Region":"r","Name":"web","Namespace":"ns"}"#);
        let err = IdentityToken::decode(&both).unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to decode identity token: both ClusterID or KubeConfig can not be specified"
        );

        let neither = URL_SAFE_NO_PAD.encode(br#"{"Region":"r","Name":"web","Namespace":"ns"}"#);
        let err = IdentityToken::decode(&neither).unwrap_err();
        assert!(matches!(err, CoreError::IdentityDecode { .. }));
    }

    #[test]
    fn test_decode_invalid_json() {
        let token = URL_SAFE_NO_PAD.encode(b"[1, 2");
        let err = IdentityToken::decode(&token).unwrap_err();
        assert!(matches!(err, CoreError::IdentityDecode { .. }));
    }
}
