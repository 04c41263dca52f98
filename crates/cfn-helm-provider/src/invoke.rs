//! Synchronous connector invocation
//!
//! Transient service errors are retried with a fixed delay. A function that
//! ran but failed comes back as a [`RemoteError`], distinct from a transport
//! failure.

use cfn_helm_aws::{AwsError, FunctionApi};
use cfn_helm_core::{ConnectorResponse, Event, RemoteError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InvokeError {
    /// The invoke call itself failed
    #[error(transparent)]
    Transport(#[from] AwsError),

    /// The connector ran and reported a failure
    #[error("{0}")]
    Remote(RemoteError),

    /// The connector answered with something unreadable
    #[error("invalid connector response: {0}")]
    Payload(String),
}

/// Retry policy for invokes
#[derive(Debug, Clone, Copy)]
pub struct InvokePolicy {
    /// Total attempts, including the first
    pub attempts: usize,
    pub delay: Duration,
}

/// Invoke connector `name` with `event`
pub async fn invoke_connector(
    functions: &dyn FunctionApi,
    name: &str,
    event: &Event,
    policy: InvokePolicy,
) -> Result<ConnectorResponse, InvokeError> {
    tracing::info!(function = %name, action = %event.action, "invoking connector");
    let payload = serde_json::to_vec(event).map_err(|e| InvokeError::Payload(e.to_string()))?;

    let mut attempt = 0;
    let output = loop {
        attempt += 1;
        match functions.invoke(name, &payload).await {
            Ok(output) => break output,
            Err(e) if e.is_retryable_invoke() && attempt < policy.attempts => {
                tracing::warn!(function = %name, attempt, error = %e, "transient connector error, retrying");
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => return Err(InvokeError::Transport(e)),
        }
    };

    if let Some(kind) = &output.function_error {
        let remote = RemoteError::from_payload(&output.payload);
        tracing::warn!(function = %name, kind = %kind, error = %remote, "remote execution error");
        return Err(InvokeError::Remote(remote));
    }

    if output.payload.is_empty() {
        return Ok(ConnectorResponse::default());
    }
    serde_json::from_slice(&output.payload).map_err(|e| InvokeError::Payload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfn_helm_aws::{FunctionSpec, InvokeOutput, MockAws};
    use cfn_helm_core::Action;

    const POLICY: InvokePolicy = InvokePolicy {
        attempts: 3,
        delay: Duration::ZERO,
    };

    async fn with_function(aws: MockAws) -> MockAws {
        let spec = FunctionSpec {
            function_name: "connector".to_string(),
            ..Default::default()
        };
        aws.create_function(&spec, b"zip").await.unwrap();
        aws
    }

    #[tokio::test]
    async fn test_response_is_decoded() {
        let aws = with_function(MockAws::new().with_invoke_handler(|_, _| {
            Ok(InvokeOutput {
                status_code: 200,
                function_error: None,
                payload: br#"{"PendingResources": true, "LastKnownErrors": ["Deployment is not ready: default/web"]}"#.to_vec(),
            })
        }))
        .await;

        let response = invoke_connector(&aws, "connector", &Event::new(Action::GetPending), POLICY)
            .await
            .unwrap();
        assert!(response.pending_resources);
        assert_eq!(response.last_known_errors.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let aws = with_function(MockAws::new()).await;
        aws.fail_invokes(vec![
            AwsError::service("TooManyRequestsException", "slow down"),
            AwsError::service("ResourceNotReadyException", "not ready"),
        ]);

        invoke_connector(&aws, "connector", &Event::new(Action::CheckRelease), POLICY)
            .await
            .unwrap();
        assert_eq!(aws.operation_counts().invokes, 3);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let aws = with_function(MockAws::new()).await;
        aws.fail_invokes(
            (0..5)
                .map(|_| AwsError::service("ServiceException", "unavailable"))
                .collect(),
        );

        let err = invoke_connector(&aws, "connector", &Event::new(Action::CheckRelease), POLICY)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Transport(_)));
        assert_eq!(aws.operation_counts().invokes, 3);
    }

    #[tokio::test]
    async fn test_other_errors_are_fatal() {
        let aws = with_function(MockAws::new()).await;
        aws.fail_invokes(vec![AwsError::service("AccessDeniedException", "no")]);

        invoke_connector(&aws, "connector", &Event::new(Action::CheckRelease), POLICY)
            .await
            .unwrap_err();
        assert_eq!(aws.operation_counts().invokes, 1);
    }

    #[tokio::test]
    async fn test_function_error_is_remote() {
        let aws = with_function(MockAws::new().with_invoke_handler(|_, _| {
            Ok(InvokeOutput {
                status_code: 200,
                function_error: Some("Unhandled".to_string()),
                payload: br#"{"errorType": "NotFound", "errorMessage": "release: not found"}"#.to_vec(),
            })
        }))
        .await;

        let err = invoke_connector(&aws, "connector", &Event::new(Action::UpdateRelease), POLICY)
            .await
            .unwrap_err();
        match err {
            InvokeError::Remote(remote) => {
                assert_eq!(remote.error_type, "NotFound");
                assert_eq!(remote.to_string(), "[NotFound] release: not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
