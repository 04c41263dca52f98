//! Error types for cfn-helm-aws

use thiserror::Error;

/// Result type for cfn-helm-aws operations
pub type Result<T> = std::result::Result<T, AwsError>;

/// Message the function service returns while another update is being applied
pub const UPDATE_IN_PROGRESS: &str =
    "The function could not be updated due to a concurrent update operation.";

/// Error codes worth another invoke attempt
const RETRYABLE_INVOKE_CODES: &[&str] = &[
    "TooManyRequestsException",
    "ServiceException",
    "EC2UnexpectedException",
    "EC2ThrottledException",
    "ResourceConflictException",
    "ResourceNotReadyException",
];

/// Errors returned by the AWS capability layer
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AwsError {
    /// Error reported by an AWS service, with its error code
    #[error("{code}: {message}")]
    Service { code: String, message: String },

    /// The CLI exited unsuccessfully without a recognisable service error
    #[error("aws {command} failed: {message}")]
    Command { command: String, message: String },

    /// Output could not be parsed
    #[error("unexpected response from {operation}: {message}")]
    Response { operation: String, message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for AwsError {
    fn from(e: serde_json::Error) -> Self {
        AwsError::Response {
            operation: "json".to_string(),
            message: e.to_string(),
        }
    }
}

impl AwsError {
    pub fn service(code: impl Into<String>, message: impl Into<String>) -> Self {
        AwsError::Service {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Service error code, if any
    pub fn code(&self) -> Option<&str> {
        match self {
            AwsError::Service { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Message without the error code prefix
    pub fn message(&self) -> String {
        match self {
            AwsError::Service { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Check if the addressed resource does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.code(),
            Some("ResourceNotFoundException" | "NoSuchKey" | "NoSuchBucket" | "NotFound" | "404")
        )
    }

    /// Check if the resource already exists or is being modified
    pub fn is_conflict(&self) -> bool {
        matches!(
            self.code(),
            Some("ResourceConflictException" | "ResourceInUseException")
        )
    }

    /// Check if a failed invoke is transient
    pub fn is_retryable_invoke(&self) -> bool {
        self.code().is_some_and(|c| RETRYABLE_INVOKE_CODES.contains(&c))
    }

    /// Check if a function update collided with a concurrent one
    pub fn is_update_in_progress(&self) -> bool {
        self.message().contains(UPDATE_IN_PROGRESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifiers() {
        let err = AwsError::service("ResourceNotFoundException", "Function not found");
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
        assert_eq!(err.to_string(), "ResourceNotFoundException: Function not found");

        let err = AwsError::service("ResourceConflictException", UPDATE_IN_PROGRESS);
        assert!(err.is_conflict());
        assert!(err.is_update_in_progress());
        assert!(err.is_retryable_invoke());
    }

    #[test]
    fn test_retryable_invoke_codes() {
        for code in RETRYABLE_INVOKE_CODES {
            assert!(AwsError::service(*code, "x").is_retryable_invoke());
        }
        assert!(!AwsError::service("AccessDeniedException", "x").is_retryable_invoke());
        assert!(
            !AwsError::Command {
                command: "lambda invoke".to_string(),
                message: "boom".to_string()
            }
            .is_retryable_invoke()
        );
    }
}
