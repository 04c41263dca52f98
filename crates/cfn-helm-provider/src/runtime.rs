//! Lambda runtime loop of the connector function
//!
//! The connector is deployed on a custom runtime. Its `bootstrap` polls the
//! runtime API for the next invocation, hands the event to a
//! [`ConnectorEntry`] and posts back either the [`ConnectorResponse`] or the
//! [`RemoteError`], which Lambda returns to the caller as a function error.

use cfn_helm_core::{ConnectorResponse, Event, RemoteError};
use reqwest::StatusCode;

use crate::error::{ProviderError, Result};
use crate::executor::ERROR_TYPE_INVALID;
use crate::remote_entry::ConnectorEntry;

const API_VERSION: &str = "2018-06-01";
const REQUEST_ID_HEADER: &str = "Lambda-Runtime-Aws-Request-Id";

/// One invocation pulled from the runtime API
#[derive(Debug)]
struct Invocation {
    request_id: String,
    payload: Vec<u8>,
}

/// Client of the Lambda runtime API serving connector events
pub struct ConnectorRuntime {
    http: reqwest::Client,
    base: String,
    entry: ConnectorEntry,
}

impl ConnectorRuntime {
    /// `api` is the `host:port` found in `AWS_LAMBDA_RUNTIME_API`
    pub fn new(api: &str, entry: ConnectorEntry) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("cfn-helm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ProviderError::connector)?;
        let base = if api.contains("://") {
            format!("{}/{}/runtime", api.trim_end_matches('/'), API_VERSION)
        } else {
            format!("http://{}/{}/runtime", api, API_VERSION)
        };
        Ok(Self { http, base, entry })
    }

    /// Serve invocations until the runtime API fails
    pub async fn run(&self) -> Result<()> {
        tracing::info!(api = %self.base, "connector runtime started");
        loop {
            self.serve_next().await?;
        }
    }

    /// Handle a single invocation
    pub async fn serve_next(&self) -> Result<()> {
        let invocation = self.next().await?;
        let event = match serde_json::from_slice::<Event>(&invocation.payload) {
            Ok(event) => event,
            Err(e) => {
                let err = RemoteError::new(ERROR_TYPE_INVALID, format!("malformed connector event: {}", e));
                return self.post_error(&invocation.request_id, &err).await;
            }
        };

        match self.entry.handle(event).await {
            Ok(response) => self.post_response(&invocation.request_id, &response).await,
            Err(err) => {
                tracing::warn!(request = %invocation.request_id, error = %err, "connector action failed");
                self.post_error(&invocation.request_id, &err).await
            }
        }
    }

    async fn next(&self) -> Result<Invocation> {
        let response = self
            .http
            .get(format!("{}/invocation/next", self.base))
            .send()
            .await
            .map_err(ProviderError::connector)?;
        if response.status() != StatusCode::OK {
            return Err(ProviderError::Connector(format!(
                "runtime API answered {} for the next invocation",
                response.status().as_u16()
            )));
        }

        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Connector("invocation without a request id".to_string()))?;
        let payload = response.bytes().await.map_err(ProviderError::connector)?.to_vec();
        Ok(Invocation { request_id, payload })
    }

    async fn post_response(&self, request_id: &str, response: &ConnectorResponse) -> Result<()> {
        self.post(format!("{}/invocation/{}/response", self.base, request_id), response)
            .await
    }

    async fn post_error(&self, request_id: &str, err: &RemoteError) -> Result<()> {
        self.post(format!("{}/invocation/{}/error", self.base, request_id), err)
            .await
    }

    async fn post<T: serde::Serialize>(&self, url: String, body: &T) -> Result<()> {
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(ProviderError::connector)?;
        if !response.status().is_success() {
            return Err(ProviderError::Connector(format!(
                "runtime API answered {} at {}",
                response.status().as_u16(),
                url
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::FixedBackend;
    use cfn_helm_core::envelope::ERROR_TYPE_NOT_FOUND;
    use cfn_helm_core::{Action, HelmReleaseModel, IdentityToken};
    use cfn_helm_kube::{MockObjectFetcher, MockReleaseManager};
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const NEXT: &str = "/2018-06-01/runtime/invocation/next";

    fn runtime(server: &MockServer) -> ConnectorRuntime {
        let backend = FixedBackend::new(
            Arc::new(MockReleaseManager::new()),
            Arc::new(MockObjectFetcher::new()),
        );
        ConnectorRuntime::new(&server.uri(), ConnectorEntry::new(Arc::new(backend))).unwrap()
    }

    fn check_event() -> Event {
        let model = HelmReleaseModel {
            cluster_id: Some("eks".to_string()),
            ..Default::default()
        };
        let token = IdentityToken::generate(&model, "web", "us-east-1", "default").unwrap();
        Event::new(Action::CheckRelease)
            .with_kubeconfig(b"apiVersion: v1".to_vec())
            .with_id(token)
    }

    async fn queue(server: &MockServer, body: Vec<u8>) {
        Mock::given(method("GET"))
            .and(path(NEXT))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(REQUEST_ID_HEADER, "req-1")
                    .set_body_bytes(body),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn test_base_url_from_host_and_port() {
        let backend = FixedBackend::new(
            Arc::new(MockReleaseManager::new()),
            Arc::new(MockObjectFetcher::new()),
        );
        let runtime = ConnectorRuntime::new("127.0.0.1:9001", ConnectorEntry::new(Arc::new(backend))).unwrap();
        assert_eq!(runtime.base, "http://127.0.0.1:9001/2018-06-01/runtime");
    }

    #[tokio::test]
    async fn test_failed_action_posts_classified_error() {
        let server = MockServer::start().await;
        queue(&server, serde_json::to_vec(&check_event()).unwrap()).await;
        Mock::given(method("POST"))
            .and(path("/2018-06-01/runtime/invocation/req-1/error"))
            .and(body_partial_json(serde_json::json!({"errorType": ERROR_TYPE_NOT_FOUND})))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        runtime(&server).serve_next().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_event_is_invalid() {
        let server = MockServer::start().await;
        queue(&server, b"not json".to_vec()).await;
        Mock::given(method("POST"))
            .and(path("/2018-06-01/runtime/invocation/req-1/error"))
            .and(body_partial_json(serde_json::json!({"errorType": ERROR_TYPE_INVALID})))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        runtime(&server).serve_next().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_request_id_stops_the_loop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(NEXT))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"{}".to_vec()))
            .mount(&server)
            .await;

        let err = runtime(&server).serve_next().await.unwrap_err();
        assert!(matches!(err, ProviderError::Connector(_)));
        assert_eq!(err.to_string(), "invocation without a request id");
    }
}
