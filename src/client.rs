//! The per-deployment inference client seam.
//!
//! The balancer never talks HTTP directly; it goes through the
//! [`ChatClient`] trait so test doubles (and alternative transports) can
//! substitute freely. [`HttpChatClient`] is the default implementation,
//! speaking the Azure OpenAI chat-completions dialect over reqwest.

use crate::config::{DeploymentConfig, normalize_url};
use crate::errors::SwitchboardError;
use crate::models::{
    ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, ChatMessage, StreamOptions,
};
use crate::sse::{SseEventStream, decode_event};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

/// A lazily produced, non-restartable sequence of completion chunks.
pub type ChunkStream =
    Pin<Box<dyn Stream<Item = Result<ChatCompletionChunk, SwitchboardError>> + Send>>;

/// Capability interface of one deployment's underlying inference client.
#[async_trait]
pub trait ChatClient: fmt::Debug + Send + Sync {
    /// Issue a non-streaming completion.
    async fn complete(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletion, SwitchboardError>;

    /// Issue a streaming completion. The returned stream is handed to the
    /// caller unmodified, chunk for chunk.
    async fn complete_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChunkStream, SwitchboardError>;

    /// Issue a minimal request to check whether the deployment is
    /// responsive.
    async fn probe(&self) -> Result<(), SwitchboardError>;
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default `ChatClient` for Azure OpenAI-style endpoints.
pub struct HttpChatClient {
    http: reqwest::Client,
    endpoint: Url,
    api_key: String,
    /// Used as the model of probe requests; Azure scopes the endpoint to
    /// a deployment, so the name doubles as the model identifier.
    deployment_name: String,
}

impl fmt::Debug for HttpChatClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpChatClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("deployment_name", &self.deployment_name)
            .finish()
    }
}

impl HttpChatClient {
    pub fn new(config: &DeploymentConfig) -> Result<Self, SwitchboardError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(classify_transport_error)?;

        let mut endpoint = normalize_url(config.api_base.clone())
            .join("chat/completions")
            .map_err(|e| SwitchboardError::BadRequest {
                status: 0,
                message: format!("invalid api_base: {e}"),
            })?;
        endpoint
            .query_pairs_mut()
            .append_pair("api-version", &config.api_version);

        Ok(Self {
            http,
            endpoint,
            api_key: config.api_key.clone(),
            deployment_name: config.name.clone(),
        })
    }

    fn post(&self, body: &ChatCompletionRequest) -> reqwest::RequestBuilder {
        self.http
            .post(self.endpoint.clone())
            .header("api-key", &self.api_key)
            .json(body)
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn complete(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletion, SwitchboardError> {
        trace!(endpoint = %self.endpoint, "sending completion request");
        let response = self
            .post(request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| SwitchboardError::InvalidResponse(e.to_string()))
    }

    async fn complete_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChunkStream, SwitchboardError> {
        // Force the streaming flags so the final chunk carries usage and
        // the counters can be reconciled.
        let mut request = request.clone();
        request.stream = true;
        request.stream_options = Some(StreamOptions {
            include_usage: true,
        });

        trace!(endpoint = %self.endpoint, "sending streaming completion request");
        let response = self
            .post(&request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let response = check_status(response).await?;
        let events = SseEventStream::new(Box::pin(response.bytes_stream()));
        let chunks = events.filter_map(|event| async move {
            match event.and_then(|bytes| decode_event(&bytes)) {
                Ok(Some(chunk)) => Some(Ok(chunk)),
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            }
        });

        Ok(Box::pin(chunks))
    }

    async fn probe(&self) -> Result<(), SwitchboardError> {
        let request = ChatCompletionRequest::builder()
            .model(self.deployment_name.clone())
            .messages(vec![ChatMessage::user("ping")])
            .max_tokens(1)
            .build();

        debug!(endpoint = %self.endpoint, "probing deployment");
        let response = self
            .post(&request)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(classify_transport_error)?;

        check_status(response).await.map(|_| ())
    }
}

/// Classify a non-2xx response into the error taxonomy, consuming the
/// body for the message.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SwitchboardError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok());
    let message = response.text().await.unwrap_or_default();

    Err(classify_status(status.as_u16(), retry_after, message))
}

pub(crate) fn classify_status(
    status: u16,
    retry_after: Option<u64>,
    message: String,
) -> SwitchboardError {
    match status {
        429 => SwitchboardError::RateLimited { retry_after },
        401 | 403 => SwitchboardError::Unauthorized { status, message },
        400..=499 => SwitchboardError::BadRequest { status, message },
        _ => SwitchboardError::TransientUpstream {
            status: Some(status),
            message,
        },
    }
}

fn classify_transport_error(e: reqwest::Error) -> SwitchboardError {
    let status = e.status().map(|s| s.as_u16());
    SwitchboardError::TransientUpstream {
        status,
        message: if e.is_timeout() {
            "request timed out".to_string()
        } else {
            e.to_string()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(500)]
    #[case(502)]
    #[case(503)]
    fn server_errors_classify_as_transient(#[case] status: u16) {
        assert!(matches!(
            classify_status(status, None, String::new()),
            SwitchboardError::TransientUpstream { status: Some(s), .. } if s == status
        ));
    }

    #[rstest]
    #[case(401)]
    #[case(403)]
    fn auth_errors_classify_as_unauthorized(#[case] status: u16) {
        assert!(matches!(
            classify_status(status, None, String::new()),
            SwitchboardError::Unauthorized { status: s, .. } if s == status
        ));
    }

    #[rstest]
    #[case(400)]
    #[case(404)]
    #[case(422)]
    fn client_errors_classify_as_bad_request(#[case] status: u16) {
        assert!(matches!(
            classify_status(status, None, String::new()),
            SwitchboardError::BadRequest { status: s, .. } if s == status
        ));
    }

    #[test]
    fn rate_limit_keeps_retry_after() {
        assert!(matches!(
            classify_status(429, Some(30), String::new()),
            SwitchboardError::RateLimited {
                retry_after: Some(30)
            }
        ));
    }

    #[test]
    fn endpoint_preserves_api_base_path() {
        let config = DeploymentConfig::builder()
            .name("east".to_string())
            .api_base("https://east.example.com/openai/deployments/gpt-4o".parse().unwrap())
            .api_key("sk-test".to_string())
            .build();

        let client = HttpChatClient::new(&config).unwrap();
        assert!(
            client
                .endpoint
                .as_str()
                .starts_with("https://east.example.com/openai/deployments/gpt-4o/chat/completions")
        );
        assert!(client.endpoint.as_str().contains("api-version=2024-10-21"));
    }
}
