use std::time::Duration;

use eventsource_stream::EventStreamError;
use futures::StreamExt;
use reqwest::header::{ACCEPT, HeaderValue};
use snafu::{ResultExt, ensure};
use tokio::sync::oneshot;

use super::sse::event_frames;
use super::transport::{
    BoxFuture, BuildClientSnafu, FrameSender, FrameTransport, HttpSnafu, MissingEndpointSnafu,
    TransportError, TransportHandle, TransportRequest, TransportResult, TransportWorker,
    transport_channel,
};

const STREAM_PATH: &str = "/chat/stream";
const CANCEL_PATH: &str = "/chat/cancel";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTransportConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub connect_timeout: Duration,
}

impl HttpTransportConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.trim().is_empty());
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint.trim_end_matches('/'))
    }
}

/// Streams assistant frames from `POST {endpoint}/chat/stream` as server-sent events.
pub struct HttpFrameTransport {
    config: HttpTransportConfig,
    client: reqwest::Client,
}

impl HttpFrameTransport {
    pub fn new(config: HttpTransportConfig) -> TransportResult<Self> {
        ensure!(
            !config.endpoint.trim().is_empty(),
            MissingEndpointSnafu {
                stage: "http-transport-new",
            }
        );

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context(BuildClientSnafu {
                stage: "build-client",
            })?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &HttpTransportConfig {
        &self.config
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.config.api_key.as_deref() {
            Some(api_key) => builder.bearer_auth(api_key),
            None => builder,
        }
    }

    async fn open_response(
        client: reqwest::Client,
        request: reqwest::RequestBuilder,
    ) -> TransportResult<reqwest::Response> {
        let request = request.build().context(HttpSnafu {
            stage: "build-stream-request",
        })?;
        let response = client.execute(request).await.context(HttpSnafu {
            stage: "send-stream-request",
        })?;
        ensure_success(response, "stream-response-status").await
    }

    async fn run_stream_worker(
        client: reqwest::Client,
        request: reqwest::RequestBuilder,
        sender: FrameSender,
        mut abort_rx: oneshot::Receiver<()>,
    ) {
        let response = tokio::select! {
            biased;
            _ = &mut abort_rx => {
                tracing::debug!("stream aborted before the server answered");
                sender.fail(TransportError::Aborted { stage: "open-stream" });
                sender.close();
                return;
            }
            response = Self::open_response(client, request) => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(error = %error, "failed to open chat stream");
                sender.fail(error);
                sender.close();
                return;
            }
        };

        let mut frames = std::pin::pin!(event_frames(response.bytes_stream()));

        loop {
            tokio::select! {
                biased;
                _ = &mut abort_rx => {
                    tracing::debug!("chat stream aborted");
                    sender.fail(TransportError::Aborted { stage: "read-stream" });
                    break;
                }
                frame = frames.next() => {
                    match frame {
                        Some(Ok(frame)) => {
                            if !sender.frame(frame) {
                                return;
                            }
                        }
                        Some(Err(EventStreamError::Transport(source))) => {
                            tracing::warn!(error = %source, "chat stream emitted an error chunk");
                            sender.fail(TransportError::Http {
                                stage: "read-stream-chunk",
                                source,
                            });
                            break;
                        }
                        Some(Err(error)) => {
                            tracing::warn!(error = %error, "chat stream is not a valid event stream");
                            sender.fail(TransportError::Disconnected {
                                stage: "parse-event-stream",
                                details: error.to_string(),
                            });
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        sender.close();
    }
}

async fn ensure_success(
    response: reqwest::Response,
    stage: &'static str,
) -> TransportResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Status {
        stage,
        status: status.as_u16(),
        body,
    })
}

impl FrameTransport for HttpFrameTransport {
    fn name(&self) -> &str {
        "http-sse"
    }

    fn open(&self, request: TransportRequest) -> TransportResult<TransportHandle> {
        let builder = self
            .authorize(self.client.post(self.config.url(STREAM_PATH)))
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
            .json(&request);

        let (sender, stream, abort_rx) = transport_channel();
        let worker: TransportWorker = Box::pin(Self::run_stream_worker(
            self.client.clone(),
            builder,
            sender,
            abort_rx,
        ));

        Ok(TransportHandle { stream, worker })
    }

    fn cancel_remote<'a>(&'a self, stream_id: &'a str) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            let response = self
                .authorize(self.client.post(self.config.url(CANCEL_PATH)))
                .json(&serde_json::json!({ "stream_id": stream_id }))
                .send()
                .await
                .context(HttpSnafu {
                    stage: "send-cancel-request",
                })?;
            ensure_success(response, "cancel-response-status").await?;
            tracing::debug!(stream_id, "server-side generation cancelled");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransportEvent;

    #[test]
    fn urls_join_without_double_slashes() {
        let config = HttpTransportConfig::new("https://chat.example.com/api/");
        assert_eq!(
            config.url(STREAM_PATH),
            "https://chat.example.com/api/chat/stream"
        );
        assert_eq!(
            config.url(CANCEL_PATH),
            "https://chat.example.com/api/chat/cancel"
        );
    }

    #[test]
    fn blank_api_keys_are_dropped() {
        let config = HttpTransportConfig::new("http://localhost").with_api_key(Some("  ".into()));
        assert_eq!(config.api_key, None);
    }

    #[test]
    fn empty_endpoint_is_rejected() {
        let error = HttpFrameTransport::new(HttpTransportConfig::new(" "))
            .err()
            .expect("blank endpoint must fail");
        assert!(matches!(error, TransportError::MissingEndpoint { .. }));
    }

    #[tokio::test]
    async fn aborting_before_the_response_reports_abort_then_close() {
        // Port 9 is discard; the abort wins the biased select before any connect completes.
        let transport = HttpFrameTransport::new(HttpTransportConfig::new("http://127.0.0.1:9"))
            .expect("transport builds");
        let TransportHandle { mut stream, worker } = transport
            .open(TransportRequest::new("Hello", "tmp-1"))
            .expect("open succeeds");

        assert!(stream.abort());
        worker.await;

        match stream.recv().await {
            Some(TransportEvent::Failed(error)) => assert!(error.is_abort()),
            other => panic!("expected abort failure, got {other:?}"),
        }
        assert!(matches!(stream.recv().await, Some(TransportEvent::Closed)));
    }
}
