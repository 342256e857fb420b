use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parley_storage::{ConversationId, MessageRecord, SqliteStorage};
use parley_transport::{
    BoxFuture, FrameTransport, TransportError, TransportHandle, TransportRequest,
    TransportResult, TransportWorker, transport_channel,
};

use super::accumulator::LoadingIndicator;
use super::cache::InMemoryMessageCache;
use super::coordinator::{CoordinatorDeps, StreamSessionCoordinator};
use super::state::{ChatStateManager, Notifier};
use super::sync_guard::SyncGuard;

#[derive(Debug, Default)]
pub struct ChatSnapshot {
    pub loading: bool,
    pub loading_text: Option<String>,
    pub active_conversation: Option<ConversationId>,
    pub streaming_conversation: Option<ConversationId>,
    pub optimistic_message: Option<MessageRecord>,
    pub drafts: Vec<String>,
    pub loading_texts_seen: Vec<String>,
}

#[derive(Debug, Default)]
pub struct RecordingChatState {
    pub snapshot: Mutex<ChatSnapshot>,
}

impl LoadingIndicator for RecordingChatState {
    fn set_loading(&self, loading: bool) {
        self.snapshot.lock().loading = loading;
    }

    fn set_loading_text(&self, text: Option<String>) {
        let mut snapshot = self.snapshot.lock();
        if let Some(text) = &text {
            snapshot.loading_texts_seen.push(text.clone());
        }
        snapshot.loading_text = text;
    }
}

impl ChatStateManager for RecordingChatState {
    fn set_active_conversation(&self, conversation_id: Option<ConversationId>) {
        self.snapshot.lock().active_conversation = conversation_id;
    }

    fn set_streaming_conversation(&self, conversation_id: Option<ConversationId>) {
        self.snapshot.lock().streaming_conversation = conversation_id;
    }

    fn set_optimistic_message(&self, message: Option<MessageRecord>) {
        self.snapshot.lock().optimistic_message = message;
    }

    fn restore_draft(&self, draft: String) {
        self.snapshot.lock().drafts.push(draft);
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub errors: Mutex<Vec<String>>,
}

impl Notifier for RecordingNotifier {
    fn notify_error(&self, message: &str) {
        self.errors.lock().push(message.to_string());
    }
}

pub enum Step {
    Frame(String),
    Fail(TransportError),
    /// Lets wall-clock time pass between frames.
    Pause(Duration),
    Close,
}

pub fn frame(raw: &str) -> Step {
    Step::Frame(raw.to_string())
}

/// Plays one script per `open`; a script without `Close` stays open until aborted.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    pub opened: Mutex<Vec<TransportRequest>>,
    pub remote_cancels: Mutex<Vec<String>>,
    pub fail_open: Mutex<bool>,
}

impl ScriptedTransport {
    pub fn with_script(script: Vec<Step>) -> Self {
        let transport = Self::default();
        transport.scripts.lock().push_back(script);
        transport
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().len()
    }
}

impl FrameTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    fn open(&self, request: TransportRequest) -> TransportResult<TransportHandle> {
        self.opened.lock().push(request);
        if *self.fail_open.lock() {
            return Err(TransportError::Disconnected {
                stage: "scripted-open",
                details: "connection refused".to_string(),
            });
        }

        let script = self.scripts.lock().pop_front().unwrap_or_default();
        let (sender, stream, abort_rx) = transport_channel();
        let worker: TransportWorker = Box::pin(async move {
            let mut closed = false;
            for step in script {
                match step {
                    Step::Frame(raw) => {
                        sender.frame(raw);
                    }
                    Step::Fail(error) => {
                        sender.fail(error);
                    }
                    Step::Pause(duration) => {
                        tokio::time::sleep(duration).await;
                    }
                    Step::Close => {
                        sender.close();
                        closed = true;
                        break;
                    }
                }
            }

            if !closed {
                let _ = abort_rx.await;
                sender.fail(TransportError::Aborted {
                    stage: "scripted-abort",
                });
                sender.close();
            }
        });

        Ok(TransportHandle { stream, worker })
    }

    fn cancel_remote<'a>(&'a self, stream_id: &'a str) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            self.remote_cancels.lock().push(stream_id.to_string());
            Ok(())
        })
    }
}

pub struct Harness {
    pub store: Arc<SqliteStorage>,
    pub cache: Arc<InMemoryMessageCache>,
    pub state: Arc<RecordingChatState>,
    pub notifier: Arc<RecordingNotifier>,
    pub transport: Arc<ScriptedTransport>,
    pub sync_guard: SyncGuard,
}

impl Harness {
    pub async fn new(transport: ScriptedTransport) -> Self {
        let store = SqliteStorage::open(":memory:")
            .await
            .expect("in-memory sqlite opens");
        Self {
            store: Arc::new(store),
            cache: Arc::new(InMemoryMessageCache::new()),
            state: Arc::new(RecordingChatState::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            transport: Arc::new(transport),
            sync_guard: SyncGuard::new(),
        }
    }

    pub fn coordinator(&self) -> StreamSessionCoordinator {
        StreamSessionCoordinator::new(CoordinatorDeps {
            store: self.store.clone(),
            cache: self.cache.clone(),
            state: self.state.clone(),
            notifier: self.notifier.clone(),
            transport: self.transport.clone(),
            sync_guard: self.sync_guard.clone(),
        })
    }
}
