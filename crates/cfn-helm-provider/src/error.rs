//! Error types for cfn-helm-provider
//!
//! Every handler failure ends up as a [`ProviderError`], whose
//! [`code`](ProviderError::code) is the error code reported to the
//! orchestrator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for cfn-helm-provider operations
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Error code attached to a failed progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerErrorCode {
    InvalidRequest,
    NotFound,
    AlreadyExists,
    /// A Helm or release operation failed
    HelmActionException,
    /// Connector create, update, delete or invoke failed
    LambdaException,
    KubeException,
    TimeOut,
    GeneralServiceException,
}

impl std::fmt::Display for HandlerErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidRequest => "InvalidRequest",
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::HelmActionException => "HelmActionException",
            Self::LambdaException => "LambdaException",
            Self::KubeException => "KubeException",
            Self::TimeOut => "TimeOut",
            Self::GeneralServiceException => "GeneralServiceException",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by the resource handlers
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Malformed model, undecodable identity or unresolvable chart
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    /// Release operation failed
    #[error("{0}")]
    Action(String),

    /// Connector lifecycle or transport failure
    #[error("{0}")]
    Connector(String),

    /// Cluster access or cluster API failure
    #[error("{0}")]
    Kube(String),

    #[error("{0}")]
    TimeOut(String),

    /// Any other AWS service failure
    #[error("{0}")]
    Service(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// Settings could not be loaded
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl ProviderError {
    pub fn code(&self) -> HandlerErrorCode {
        match self {
            Self::InvalidRequest(_) | Self::NotImplemented(_) | Self::Config { .. } => {
                HandlerErrorCode::InvalidRequest
            }
            Self::NotFound(_) => HandlerErrorCode::NotFound,
            Self::AlreadyExists(_) => HandlerErrorCode::AlreadyExists,
            Self::Action(_) => HandlerErrorCode::HelmActionException,
            Self::Connector(_) => HandlerErrorCode::LambdaException,
            Self::Kube(_) => HandlerErrorCode::KubeException,
            Self::TimeOut(_) => HandlerErrorCode::TimeOut,
            Self::Service(_) => HandlerErrorCode::GeneralServiceException,
        }
    }

    pub fn invalid(err: impl std::fmt::Display) -> Self {
        Self::InvalidRequest(err.to_string())
    }

    pub fn action(err: impl std::fmt::Display) -> Self {
        Self::Action(err.to_string())
    }

    pub fn connector(err: impl std::fmt::Display) -> Self {
        Self::Connector(err.to_string())
    }

    pub fn kube(err: impl std::fmt::Display) -> Self {
        Self::Kube(err.to_string())
    }
}

impl From<cfn_helm_core::CoreError> for ProviderError {
    fn from(e: cfn_helm_core::CoreError) -> Self {
        Self::InvalidRequest(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(
            ProviderError::action("boom").code(),
            HandlerErrorCode::HelmActionException
        );
        assert_eq!(
            ProviderError::connector("boom").code(),
            HandlerErrorCode::LambdaException
        );
        assert_eq!(
            ProviderError::NotImplemented("List").to_string(),
            "not implemented: List"
        );
        assert_eq!(
            serde_json::to_string(&HandlerErrorCode::TimeOut).unwrap(),
            "\"TimeOut\""
        );
    }

    #[test]
    fn test_core_errors_are_invalid_requests() {
        let err: ProviderError = cfn_helm_core::CoreError::ChartRequired.into();
        assert_eq!(err.code(), HandlerErrorCode::InvalidRequest);
        assert_eq!(err.to_string(), "chart is required");
    }
}
