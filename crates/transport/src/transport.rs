use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

/// Body of one send; ids are plain strings on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportRequest {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub client_message_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub file_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
}

impl TransportRequest {
    pub fn new(message: impl Into<String>, client_message_id: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            conversation_id: None,
            client_message_id: client_message_id.into(),
            file_ids: Vec::new(),
            reply_to_message_id: None,
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_file_ids(mut self, file_ids: Vec<String>) -> Self {
        self.file_ids = file_ids;
        self
    }

    pub fn with_reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to_message_id = Some(message_id.into());
        self
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type TransportWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("stream was aborted on `{stage}`"))]
    Aborted { stage: &'static str },
    #[snafu(display("transport endpoint is not configured"))]
    MissingEndpoint { stage: &'static str },
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("http request failed on `{stage}`: {source}"))]
    Http {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("server returned status {status} on `{stage}`: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("stream disconnected on `{stage}`: {details}"))]
    Disconnected {
        stage: &'static str,
        details: String,
    },
}

impl TransportError {
    /// True when the stream stopped because someone asked it to.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

/// Everything a transport reports back, in delivery order.
#[derive(Debug)]
pub enum TransportEvent {
    Frame(String),
    Failed(TransportError),
    /// Always the last event of a stream, including after an abort or failure.
    Closed,
}

/// Abort signal for one stream. Firing or dropping it stops frame delivery.
#[derive(Debug)]
pub struct AbortHandle {
    abort_tx: oneshot::Sender<()>,
}

impl AbortHandle {
    pub fn abort(self) -> bool {
        self.abort_tx.send(()).is_ok()
    }
}

pub struct TransportStream {
    events: mpsc::UnboundedReceiver<TransportEvent>,
    abort_tx: Option<oneshot::Sender<()>>,
}

pub struct TransportHandle {
    pub stream: TransportStream,
    pub worker: TransportWorker,
}

impl TransportStream {
    fn new(
        events: mpsc::UnboundedReceiver<TransportEvent>,
        abort_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            events,
            abort_tx: Some(abort_tx),
        }
    }

    /// Next event, or `None` once the producer is gone.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TransportEvent> {
        self.events.try_recv().ok()
    }

    /// Hands abort ownership to someone else; the stream no longer aborts on drop.
    pub fn take_abort_handle(&mut self) -> Option<AbortHandle> {
        self.abort_tx.take().map(|abort_tx| AbortHandle { abort_tx })
    }

    pub fn abort(&mut self) -> bool {
        self.abort_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for TransportStream {
    fn drop(&mut self) {
        if let Some(abort_tx) = self.abort_tx.take() {
            let _ = abort_tx.send(());
        }
    }
}

/// Producer half handed to a transport worker.
#[derive(Debug, Clone)]
pub struct FrameSender {
    event_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl FrameSender {
    /// Returns false once the consumer has gone away.
    pub fn frame(&self, frame: impl Into<String>) -> bool {
        self.event_tx
            .send(TransportEvent::Frame(frame.into()))
            .is_ok()
    }

    pub fn fail(&self, error: TransportError) -> bool {
        self.event_tx.send(TransportEvent::Failed(error)).is_ok()
    }

    pub fn close(&self) -> bool {
        self.event_tx.send(TransportEvent::Closed).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.event_tx.is_closed()
    }
}

pub trait FrameTransport: Send + Sync {
    fn name(&self) -> &str;
    /// Prepares a stream; nothing is sent until the returned worker is polled.
    fn open(&self, request: TransportRequest) -> TransportResult<TransportHandle>;
    /// Asks the server to stop generating for a stream it identified earlier.
    fn cancel_remote<'a>(&'a self, stream_id: &'a str) -> BoxFuture<'a, TransportResult<()>>;
}

pub fn transport_channel() -> (FrameSender, TransportStream, oneshot::Receiver<()>) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (abort_tx, abort_rx) = oneshot::channel();
    (
        FrameSender { event_tx },
        TransportStream::new(event_rx, abort_tx),
        abort_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_send_order() {
        let (sender, mut stream, _abort_rx) = transport_channel();
        assert!(sender.frame("one"));
        assert!(sender.frame("two"));
        assert!(sender.close());

        assert!(matches!(stream.recv().await, Some(TransportEvent::Frame(frame)) if frame == "one"));
        assert!(matches!(stream.recv().await, Some(TransportEvent::Frame(frame)) if frame == "two"));
        assert!(matches!(stream.recv().await, Some(TransportEvent::Closed)));
    }

    #[tokio::test]
    async fn dropping_the_stream_signals_abort() {
        let (_sender, stream, abort_rx) = transport_channel();
        drop(stream);
        assert!(abort_rx.await.is_ok());
    }

    #[tokio::test]
    async fn taken_abort_handle_fires_once() {
        let (_sender, mut stream, abort_rx) = transport_channel();
        let handle = stream.take_abort_handle().expect("abort handle available");
        assert!(stream.take_abort_handle().is_none());
        assert!(!stream.abort());

        assert!(handle.abort());
        assert!(abort_rx.await.is_ok());
    }

    #[test]
    fn request_omits_empty_optional_fields() {
        let body = serde_json::to_value(TransportRequest::new("Hello", "tmp-1")).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"message": "Hello", "client_message_id": "tmp-1"})
        );

        let body = serde_json::to_value(
            TransportRequest::new("Hi", "tmp-2")
                .with_conversation("conv-9")
                .with_file_ids(vec!["f-1".to_string()]),
        )
        .unwrap();
        assert_eq!(body["conversation_id"], "conv-9");
        assert_eq!(body["file_ids"][0], "f-1");
    }
}
