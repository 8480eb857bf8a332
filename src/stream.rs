//! Pass-through wrapper for streamed completions.
//!
//! The wrapper forwards every chunk untouched while keeping the
//! deployment's books: the request stays in flight until the stream is
//! exhausted or dropped, the final usage chunk reconciles the token
//! estimate, and a mid-stream failure cools the deployment down before
//! the error reaches the caller.

use crate::client::ChunkStream;
use crate::deployment::{DeploymentClient, InFlightGuard};
use crate::errors::SwitchboardError;
use crate::models::ChatCompletionChunk;
use crate::telemetry;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::Instant;

pub struct CompletionStream {
    inner: ChunkStream,
    deployment: Arc<DeploymentClient>,
    model: String,
    /// Preflight token estimate, replaced once the usage chunk arrives.
    estimate: u64,
    reconciled: bool,
    started_at: Instant,
    saw_first_chunk: bool,
    failed: bool,
    finished: bool,
    _guard: InFlightGuard,
}

impl std::fmt::Debug for CompletionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionStream")
            .field("deployment", &self.deployment.name())
            .field("model", &self.model)
            .finish()
    }
}

impl CompletionStream {
    pub(crate) fn new(
        inner: ChunkStream,
        deployment: Arc<DeploymentClient>,
        model: String,
        estimate: u64,
        guard: InFlightGuard,
    ) -> Self {
        Self {
            inner,
            deployment,
            model,
            estimate,
            reconciled: false,
            started_at: Instant::now(),
            saw_first_chunk: false,
            failed: false,
            finished: false,
            _guard: guard,
        }
    }

    /// The deployment serving this stream.
    pub fn deployment_name(&self) -> &str {
        self.deployment.name()
    }
}

impl Stream for CompletionStream {
    type Item = Result<ChatCompletionChunk, SwitchboardError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if !this.saw_first_chunk {
                    this.saw_first_chunk = true;
                    telemetry::record_duration(
                        this.deployment.name(),
                        &this.model,
                        telemetry::Phase::Ttfb,
                        this.started_at.elapsed(),
                    );
                }
                // Only the final chunk carries usage.
                if let Some(usage) = &chunk.usage
                    && !this.reconciled
                {
                    this.reconciled = true;
                    this.deployment
                        .reconcile_tokens(this.estimate, usage.total_tokens);
                    telemetry::record_tokens(this.deployment.name(), &this.model, usage);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                if !this.failed {
                    this.failed = true;
                    if e.is_deployment_fault() {
                        this.deployment.cooldown(None);
                    }
                    telemetry::record_request(this.deployment.name(), &this.model, false);
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if !this.finished {
                    this.finished = true;
                    if !this.failed {
                        telemetry::record_request(this.deployment.name(), &this.model, true);
                        telemetry::record_duration(
                            this.deployment.name(),
                            &this.model,
                            telemetry::Phase::Total,
                            this.started_at.elapsed(),
                        );
                    }
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatChoice, ChatDelta, Usage};
    use crate::test_utils::{stub_deployment, test_config};
    use futures_util::StreamExt;

    fn test_deployment(tpm: u64) -> Arc<DeploymentClient> {
        stub_deployment(test_config("east", tpm, 0))
    }

    fn content_chunk(text: &str) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: Some("c-1".into()),
            model: None,
            choices: vec![ChatChoice {
                index: 0,
                message: None,
                delta: Some(ChatDelta {
                    role: None,
                    content: Some(text.to_string()),
                }),
                finish_reason: None,
            }],
            usage: None,
            extra: Default::default(),
        }
    }

    fn usage_chunk(total: u64) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: Some("c-1".into()),
            model: None,
            choices: vec![],
            usage: Some(Usage {
                prompt_tokens: total / 2,
                completion_tokens: total - total / 2,
                total_tokens: total,
                prompt_tokens_details: None,
            }),
            extra: Default::default(),
        }
    }

    fn wrap(
        deployment: &Arc<DeploymentClient>,
        items: Vec<Result<ChatCompletionChunk, SwitchboardError>>,
        estimate: u64,
    ) -> CompletionStream {
        let inner: ChunkStream = Box::pin(futures_util::stream::iter(items));
        let guard = InFlightGuard::acquire(Arc::clone(deployment));
        CompletionStream::new(
            inner,
            Arc::clone(deployment),
            "gpt-4o".to_string(),
            estimate,
            guard,
        )
    }

    #[tokio::test]
    async fn chunks_pass_through_in_order() {
        let deployment = test_deployment(0);
        let stream = wrap(
            &deployment,
            vec![
                Ok(content_chunk("Hel")),
                Ok(content_chunk("lo")),
                Ok(usage_chunk(10)),
            ],
            0,
        );

        let collected: Vec<_> = stream.map(|r| r.unwrap()).collect().await;
        let text: String = collected
            .iter()
            .flat_map(|c| c.choices.iter())
            .filter_map(|c| c.delta.as_ref()?.content.clone())
            .collect();
        assert_eq!(text, "Hello");
    }

    #[tokio::test]
    async fn usage_chunk_reconciles_the_estimate() {
        let deployment = test_deployment(1000);
        // Simulate what create_stream does before handing over the stream.
        deployment.reconcile_tokens(0, 40); // seed counter at 40 (the estimate)
        let stream = wrap(&deployment, vec![Ok(usage_chunk(100))], 40);

        let _: Vec<_> = stream.collect().await;
        assert_eq!(deployment.snapshot().tpm_used, 100);
    }

    #[tokio::test]
    async fn mid_stream_error_cools_the_deployment() {
        let deployment = test_deployment(0);
        let stream = wrap(
            &deployment,
            vec![
                Ok(content_chunk("partial")),
                Err(SwitchboardError::Stream("connection reset".into())),
            ],
            0,
        );

        let results: Vec<_> = stream.collect().await;
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(!deployment.is_healthy());
    }

    #[tokio::test]
    async fn in_flight_released_when_stream_is_dropped() {
        let deployment = test_deployment(0);
        let stream = wrap(&deployment, vec![Ok(content_chunk("x"))], 0);
        assert_eq!(deployment.snapshot().in_flight, 1);
        drop(stream);
        assert_eq!(deployment.snapshot().in_flight, 0);
    }
}
