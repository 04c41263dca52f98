//! Progress events returned to the orchestrator
//!
//! A handler decides an [`Outcome`]; [`Reconciliation::render`] turns it
//! into the [`ProgressEvent`] wire shape, replacing any unfinished outcome
//! with a `TimeOut` failure once the budget carried by the callback context
//! is spent.

use cfn_helm_core::{CallbackContext, Stage};
use cfn_helm_kube::Diagnostics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{HandlerErrorCode, ProviderError};

/// One handler invocation as delivered by the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerRequest<M> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_resource_state: Option<M>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_resource_state: Option<M>,

    /// Context returned by the previous invocation of this operation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_context: Option<CallbackContext>,
}

impl<M> HandlerRequest<M> {
    pub fn new(desired: M) -> Self {
        Self {
            region: None,
            desired_resource_state: Some(desired),
            previous_resource_state: None,
            callback_context: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Replay the context of a previous event
    pub fn resumed<P>(mut self, previous: &ProgressEvent<P>) -> Self {
        self.callback_context = previous.callback_context.clone();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Success,
    Failed,
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent<M> {
    pub status: OperationStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<HandlerErrorCode>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_context: Option<CallbackContext>,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub callback_delay_seconds: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_model: Option<M>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_models: Option<Vec<M>>,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

impl<M> ProgressEvent<M> {
    pub fn success(model: Option<M>) -> Self {
        tracing::info!("returning success");
        Self {
            status: OperationStatus::Success,
            error_code: None,
            message: String::new(),
            callback_context: None,
            callback_delay_seconds: 0,
            resource_model: model,
            resource_models: None,
        }
    }

    pub fn failed(error: &ProviderError, model: Option<M>) -> Self {
        tracing::warn!(code = %error.code(), message = %error, "returning failure");
        Self {
            status: OperationStatus::Failed,
            error_code: Some(error.code()),
            message: error.to_string(),
            callback_context: None,
            callback_delay_seconds: 0,
            resource_model: model,
            resource_models: None,
        }
    }

    pub fn in_progress(model: Option<M>, context: CallbackContext, delay_seconds: i64) -> Self {
        let stage = context.stage();
        tracing::info!(stage = %stage, "returning in progress");
        Self {
            status: OperationStatus::InProgress,
            error_code: None,
            message: format!("{} in progress\n", stage),
            callback_context: Some(context),
            callback_delay_seconds: delay_seconds,
            resource_model: model,
            resource_models: None,
        }
    }

    pub fn listed(models: Vec<M>) -> Self {
        Self {
            resource_models: Some(models),
            ..Self::success(None)
        }
    }
}

/// What a handler decided for this invocation
#[derive(Debug)]
pub enum Outcome {
    /// Re-invoke at `Stage`
    Continue(Stage),
    Complete,
    Failed(ProviderError),
}

/// Timing state of one logical operation across its invocations
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub started_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
    pub timeout: Duration,
    pub callback_delay_seconds: i64,
}

impl Reconciliation {
    /// Budget from a `TimeOut` in minutes, falling back to `default`
    pub fn budget(minutes: Option<i64>, default: Duration) -> Duration {
        match minutes {
            Some(m) if m > 0 => Duration::from_secs(m as u64 * 60),
            _ => default,
        }
    }

    pub fn elapsed(&self) -> Duration {
        (self.now - self.started_at).to_std().unwrap_or_default()
    }

    pub fn timed_out(&self) -> bool {
        let elapsed = self.elapsed();
        tracing::debug!(
            elapsed = elapsed.as_secs(),
            timeout = self.timeout.as_secs(),
            "checking timeout"
        );
        elapsed >= self.timeout
    }

    /// Render an outcome
    ///
    /// With a model present, any outcome other than `Complete` becomes a
    /// `TimeOut` failure once the budget is spent. The in-progress context
    /// carries the original start time and `name`.
    pub fn render<M>(
        &self,
        outcome: Outcome,
        model: Option<M>,
        name: Option<String>,
        diagnostics: &Diagnostics,
    ) -> ProgressEvent<M> {
        if model.is_some() && !matches!(outcome, Outcome::Complete) && self.timed_out() {
            return ProgressEvent::failed(&timeout_error(diagnostics), None);
        }

        match outcome {
            Outcome::Complete => ProgressEvent::success(model),
            Outcome::Failed(error) => ProgressEvent::failed(&error, model),
            Outcome::Continue(stage) => ProgressEvent::in_progress(
                model,
                CallbackContext::new(stage.as_str(), self.started_at, name),
                self.callback_delay_seconds,
            ),
        }
    }
}

/// Timeout failure listing the outstanding diagnostics
pub fn timeout_error(diagnostics: &Diagnostics) -> ProviderError {
    ProviderError::TimeOut(format!(
        "resource creation timed out\n, LastKnownErrors: {}",
        diagnostics.entries().join("\n ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn reconciliation(elapsed_minutes: i64) -> Reconciliation {
        let started_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        Reconciliation {
            started_at,
            now: started_at + chrono::Duration::minutes(elapsed_minutes),
            timeout: Duration::from_secs(60 * 60),
            callback_delay_seconds: 30,
        }
    }

    #[test]
    fn test_in_progress_wire_format() {
        let event = reconciliation(1).render(
            Outcome::Continue(Stage::ReleaseStabilize),
            Some(json!({"Name": "web"})),
            Some("web".to_string()),
            &Diagnostics::new(),
        );

        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "status": "IN_PROGRESS",
                "message": "ReleaseStabilize in progress\n",
                "callbackContext": {
                    "Stage": "ReleaseStabilize",
                    "StartTime": "2024-05-01T12:00:00Z",
                    "Name": "web"
                },
                "callbackDelaySeconds": 30,
                "resourceModel": {"Name": "web"}
            })
        );
    }

    #[test]
    fn test_timeout_overrides_unfinished_outcomes() {
        let mut diags = Diagnostics::new();
        diags.push("Deployment is not ready: default/web");
        diags.push("Service does not have load balancer ingress IP address: default/web");

        let event = reconciliation(61).render(
            Outcome::Continue(Stage::ReleaseStabilize),
            Some(json!({})),
            None,
            &diags,
        );
        assert_eq!(event.status, OperationStatus::Failed);
        assert_eq!(event.error_code, Some(HandlerErrorCode::TimeOut));
        assert!(event.resource_model.is_none());
        insta::assert_snapshot!(event.message, @r"
        resource creation timed out
        , LastKnownErrors: Deployment is not ready: default/web
         Service does not have load balancer ingress IP address: default/web
        ");
    }

    #[test]
    fn test_timeout_is_inclusive() {
        assert!(reconciliation(60).timed_out());
        assert!(!reconciliation(59).timed_out());
    }

    #[test]
    fn test_complete_is_never_overridden() {
        let event = reconciliation(500).render(
            Outcome::Complete,
            Some(json!({"Name": "web"})),
            None,
            &Diagnostics::new(),
        );
        assert_eq!(event.status, OperationStatus::Success);
    }

    #[test]
    fn test_failure_without_model_skips_timeout() {
        let event = reconciliation(500).render::<serde_json::Value>(
            Outcome::Failed(ProviderError::NotFound("release: not found".to_string())),
            None,
            None,
            &Diagnostics::new(),
        );
        assert_eq!(event.error_code, Some(HandlerErrorCode::NotFound));
    }

    #[test]
    fn test_request_wire_format() {
        let request: HandlerRequest<serde_json::Value> = serde_json::from_value(json!({
            "region": "eu-west-1",
            "desiredResourceState": {"Chart": "stable/nginx"},
            "callbackContext": {"Stage": "ReleaseStabilize", "StartTime": "2024-05-01T12:00:00Z"}
        }))
        .unwrap();

        assert_eq!(request.region.as_deref(), Some("eu-west-1"));
        assert!(request.previous_resource_state.is_none());
        assert_eq!(
            request.callback_context.unwrap().stage(),
            Stage::ReleaseStabilize
        );
    }

    #[test]
    fn test_budget() {
        let default = Duration::from_secs(3600);
        assert_eq!(Reconciliation::budget(None, default), default);
        assert_eq!(Reconciliation::budget(Some(0), default), default);
        assert_eq!(
            Reconciliation::budget(Some(5), default),
            Duration::from_secs(300)
        );
    }
}
