//! Error types for cfn-helm-kube

use thiserror::Error;

/// Result type for cfn-helm-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors that can occur during Kubernetes and Helm operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// Release not found
    #[error("release: not found: {namespace}/{name}")]
    ReleaseNotFound { name: String, namespace: String },

    /// Release already exists
    #[error("release already exists: {namespace}/{name}")]
    ReleaseAlreadyExists { name: String, namespace: String },

    /// A release with this name belongs to another resource
    #[error("another release exists with the same name but different ID: {namespace}/{name}")]
    ReleaseConflict { name: String, namespace: String },

    /// Release is in a state that cannot be acted upon
    #[error("release {namespace}/{name} is in {status} state")]
    ReleaseFailed {
        name: String,
        namespace: String,
        status: String,
    },

    /// The helm executable reported an error
    #[error("helm {command} failed: {message}")]
    Helm { command: String, message: String },

    /// Chart could not be fetched
    #[error("failed to fetch chart {chart}: {message}")]
    ChartFetch { chart: String, message: String },

    /// Kubeconfig could not be produced
    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Too many manifest objects could not be looked up
    #[error("couldn't get the resources")]
    ResourceLookup,

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// AWS capability error
    #[error(transparent)]
    Aws(#[from] cfn_helm_aws::AwsError),

    /// Core error
    #[error(transparent)]
    Core(#[from] cfn_helm_core::CoreError),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for KubeError {
    fn from(e: serde_json::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for KubeError {
    fn from(e: serde_yaml::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl KubeError {
    /// Check if this is a missing release or a Kubernetes 404 Not Found error
    pub fn is_not_found(&self) -> bool {
        match self {
            KubeError::ReleaseNotFound { .. } => true,
            KubeError::Api(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Check if this is a conflict error (409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, KubeError::Api(kube::Error::Api(resp)) if resp.code == 409)
    }

    /// Check if an install collided with an existing release
    pub fn is_already_exists(&self) -> bool {
        matches!(self, KubeError::ReleaseAlreadyExists { .. })
    }
}
