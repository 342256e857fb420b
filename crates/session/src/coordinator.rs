use std::sync::Arc;

use parley_storage::{
    ConversationId, ConversationPatch, DurableStore, MessageId, MessageRecord,
    unix_timestamp_millis,
};
use parley_transport::{
    FrameTransport, TransportError, TransportEvent, TransportHandle, TransportRequest,
    TransportStream,
};
use tokio::task::JoinHandle;

use super::accumulator::MessageAccumulator;
use super::cache::VolatileCache;
use super::cancellation::{CancellationController, SaveOnStop};
use super::error::SessionError;
use super::events::{DecodedFrame, StreamEvent, decode_frame};
use super::phase::{PhaseRejection, PhaseTransition, SessionPhase};
use super::reconciler::{IdentityReconciler, ReconcileContext, SessionIdentity};
use super::state::{ChatStateManager, Notifier};
use super::sync_guard::{SyncGuard, SyncLease};

/// Collaborators injected into a coordinator.
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub store: Arc<dyn DurableStore>,
    pub cache: Arc<dyn VolatileCache>,
    pub state: Arc<dyn ChatStateManager>,
    pub notifier: Arc<dyn Notifier>,
    pub transport: Arc<dyn FrameTransport>,
    pub sync_guard: SyncGuard,
}

/// One user submission.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SendInput {
    /// `None` starts a brand-new conversation.
    pub conversation_id: Option<ConversationId>,
    pub content: String,
    pub title: Option<String>,
    pub file_ids: Vec<String>,
    pub reply_to_message_id: Option<MessageId>,
}

impl SendInput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn in_conversation(mut self, conversation_id: ConversationId) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

#[derive(Debug)]
pub enum StartOutcome {
    Started,
    /// Another session is active; nothing was created or opened.
    Rejected(PhaseRejection),
    Failed(SessionError),
}

impl StartOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started)
    }
}

struct StreamSession {
    draft: String,
    identity: SessionIdentity,
    accumulator: MessageAccumulator,
    reconciler: IdentityReconciler,
    lease: SyncLease,
    stream: TransportStream,
    worker: JoinHandle<()>,
}

/// Drives one streamed reply at a time from submission to durable record.
pub struct StreamSessionCoordinator {
    deps: CoordinatorDeps,
    phase: SessionPhase,
    cancellation: CancellationController,
    session: Option<StreamSession>,
}

impl StreamSessionCoordinator {
    pub fn new(deps: CoordinatorDeps) -> Self {
        Self {
            deps,
            phase: SessionPhase::Idle,
            cancellation: CancellationController::new(),
            session: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn sync_guard(&self) -> &SyncGuard {
        &self.deps.sync_guard
    }

    /// Conversation of the active session, optimistic until the server names it.
    pub fn active_conversation(&self) -> Option<&ConversationId> {
        self.session
            .as_ref()
            .map(|session| &session.identity.conversation_id)
    }

    /// Text accumulated so far by the active session.
    pub fn accumulated_text(&self) -> Option<&str> {
        self.session
            .as_ref()
            .map(|session| session.accumulator.text())
    }

    pub async fn start(&mut self, input: SendInput) -> StartOutcome {
        // Ignore additional submits while one stream is active.
        let phase = match self.phase.apply(PhaseTransition::Admit) {
            Ok(phase) => phase,
            Err(rejection) => {
                tracing::debug!(phase = ?self.phase, "ignoring submit while a stream is active");
                return StartOutcome::Rejected(rejection);
            }
        };
        self.phase = phase;

        let now = unix_timestamp_millis();
        let (conversation_id, fresh_conversation) = match input.conversation_id.clone() {
            Some(conversation_id) => (conversation_id, false),
            None => (ConversationId::optimistic(), true),
        };
        let lease = self.deps.sync_guard.acquire(conversation_id.clone());

        let mut user = MessageRecord::user_sending(
            MessageId::optimistic(),
            conversation_id.clone(),
            input.content.clone(),
            now,
        );
        user.file_ids = input.file_ids.clone();
        user.reply_to_message_id = input.reply_to_message_id.clone();
        let assistant =
            MessageRecord::assistant_shell(MessageId::optimistic(), conversation_id.clone(), now + 1);

        self.deps.cache.add_or_update_message(&user);
        self.deps.cache.add_or_update_message(&assistant);
        self.deps.state.set_loading(true);

        if fresh_conversation {
            self.deps.state.set_optimistic_message(Some(user.clone()));
        } else {
            if let Err(error) = self.deps.store.put_message(user.clone()).await {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    message_id = %user.id,
                    error = %error,
                    "failed to store optimistic user message"
                );
            }
            self.deps
                .state
                .set_streaming_conversation(Some(conversation_id.clone()));
        }

        self.cancellation
            .set_save_hook(SaveOnStop::new(conversation_id.clone()));

        let mut request = TransportRequest::new(input.content.clone(), user.id.as_str())
            .with_file_ids(input.file_ids.clone());
        if !fresh_conversation {
            request = request.with_conversation(conversation_id.as_str());
        }
        if let Some(reply_to) = &input.reply_to_message_id {
            request = request.with_reply_to(reply_to.as_str());
        }

        let TransportHandle { mut stream, worker } = match self.deps.transport.open(request) {
            Ok(handle) => handle,
            Err(source) => {
                let error = SessionError::TransportOpen {
                    stage: "open-transport",
                    source,
                };
                tracing::error!(
                    transport = self.deps.transport.name(),
                    conversation_id = %conversation_id,
                    error = %error,
                    "failed to open chat stream"
                );
                self.transition(PhaseTransition::Fail);
                self.report_failure(&error, &input.content);
                lease.release();
                self.reset();
                return StartOutcome::Failed(error);
            }
        };

        if let Some(abort) = stream.take_abort_handle() {
            self.cancellation.arm(abort);
        }
        let worker = tokio::spawn(worker);

        let mut identity = SessionIdentity::new(conversation_id, fresh_conversation, user, assistant);
        identity.title = input.title.filter(|title| !title.trim().is_empty());

        tracing::info!(
            transport = self.deps.transport.name(),
            conversation_id = %identity.conversation_id,
            fresh_conversation,
            "chat stream started"
        );

        self.session = Some(StreamSession {
            draft: input.content,
            identity,
            accumulator: MessageAccumulator::new(),
            reconciler: IdentityReconciler::new(),
            lease,
            stream,
            worker,
        });
        self.transition(PhaseTransition::Open);
        StartOutcome::Started
    }

    /// Waits for the next transport event of the active session.
    ///
    /// A producer that vanished without closing is reported as a close.
    pub async fn recv_transport_event(&mut self) -> TransportEvent {
        match self.session.as_mut() {
            Some(session) => session
                .stream
                .recv()
                .await
                .unwrap_or(TransportEvent::Closed),
            None => TransportEvent::Closed,
        }
    }

    /// Handles exactly one transport event. Returns false when no session was active.
    pub async fn process_next_event(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        let event = self.recv_transport_event().await;
        self.handle_transport_event(event).await;
        true
    }

    pub async fn run_until_idle(&mut self) {
        while self.process_next_event().await {}
    }

    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.session.is_none() {
            tracing::debug!(event = ?event, "dropping transport event without an active session");
            return;
        }

        match event {
            TransportEvent::Frame(raw) => self.handle_frame(&raw).await,
            TransportEvent::Failed(error) => self.handle_transport_error(error).await,
            TransportEvent::Closed => self.finalize().await,
        }
    }

    /// Stops the active stream and keeps whatever arrived so far. No-op when idle.
    pub async fn cancel(&mut self) {
        if self.session.is_none() {
            tracing::debug!("cancel requested without an active stream");
            return;
        }

        let hook = self.cancellation.abort();
        self.stop_and_save(hook).await;
    }

    async fn handle_frame(&mut self, raw: &str) {
        match decode_frame(raw) {
            DecodedFrame::Terminal => self.finalize().await,
            DecodedFrame::Malformed(reason) => {
                self.fail(SessionError::MalformedFrame {
                    stage: "decode-frame",
                    reason,
                })
                .await;
            }
            DecodedFrame::ErrorSignal(message) => {
                self.fail(SessionError::ServerSignal {
                    stage: "decode-frame",
                    message,
                })
                .await;
            }
            DecodedFrame::Events(events) => {
                for event in events {
                    if let Err(error) = self.apply_event(event).await {
                        self.deps.state.set_optimistic_message(None);
                        tracing::warn!(
                            stage = error.stage(),
                            error = %error,
                            "identity reconciliation failed; skipping the rest of the frame"
                        );
                        break;
                    }
                }
            }
        }
    }

    async fn apply_event(&mut self, event: StreamEvent) -> Result<(), SessionError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        match &event {
            StreamEvent::StreamIdAssigned(stream_id) => {
                tracing::debug!(stream_id = %stream_id, "server assigned stream id");
                self.cancellation.set_stream_id(stream_id.clone());
            }
            StreamEvent::ConversationAssigned {
                conversation_id,
                user_message_id,
                bot_message_id,
            } => {
                let mut ctx = ReconcileContext {
                    store: self.deps.store.as_ref(),
                    cache: self.deps.cache.as_ref(),
                    state: self.deps.state.as_ref(),
                    cancellation: &mut self.cancellation,
                    lease: &mut session.lease,
                };
                session
                    .reconciler
                    .on_conversation_assigned(
                        &mut ctx,
                        &mut session.identity,
                        conversation_id.clone(),
                        user_message_id.clone(),
                        bot_message_id.clone(),
                    )
                    .await?;
            }
            StreamEvent::MessageIdsAssigned {
                user_message_id,
                bot_message_id,
            } => {
                let mut ctx = ReconcileContext {
                    store: self.deps.store.as_ref(),
                    cache: self.deps.cache.as_ref(),
                    state: self.deps.state.as_ref(),
                    cancellation: &mut self.cancellation,
                    lease: &mut session.lease,
                };
                session
                    .reconciler
                    .on_message_ids_assigned(
                        &mut ctx,
                        &mut session.identity,
                        user_message_id.clone(),
                        bot_message_id.clone(),
                    )
                    .await?;
            }
            StreamEvent::ConversationDescription(description) => {
                session.identity.description = Some(description.clone());
            }
            StreamEvent::CompletionSignal => {
                if let Ok(phase) = self.phase.apply(PhaseTransition::Complete) {
                    self.phase = phase;
                }
                self.deps.state.set_loading(false);
                self.deps.state.set_loading_text(None);
                tracing::debug!(
                    conversation_id = %session.identity.conversation_id,
                    "main response complete; waiting for trailing frames"
                );
            }
            StreamEvent::ResponseDelta(_)
            | StreamEvent::ToolData(_)
            | StreamEvent::ToolOutput { .. }
            | StreamEvent::ImageStatus(_)
            | StreamEvent::SideChannel(_) => {}
        }

        if session.accumulator.apply(&event, self.deps.state.as_ref()) {
            session
                .accumulator
                .snapshot_into(&mut session.identity.assistant);
            self.deps
                .cache
                .add_or_update_message(&session.identity.assistant);
        }

        Ok(())
    }

    async fn handle_transport_error(&mut self, error: TransportError) {
        if error.is_abort() {
            tracing::info!("chat stream aborted; saving partial reply");
            let hook = self.cancellation.take_save_hook();
            self.stop_and_save(hook).await;
            return;
        }

        self.fail(SessionError::TransportStream {
            stage: "read-transport",
            source: error,
        })
        .await;
    }

    /// Close path: one durable write of the finished message, then release.
    async fn finalize(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        self.transition(PhaseTransition::Complete);

        let conversation_id = session.identity.conversation_id.clone();
        if !session.identity.assistant_assigned {
            tracing::warn!(
                conversation_id = %conversation_id,
                accumulated_len = session.accumulator.text().len(),
                "stream closed before the server assigned message ids; keeping the reply in memory only"
            );
            self.teardown(session);
            return;
        }

        let message_id = session.identity.assistant.id.clone();
        match self
            .deps
            .store
            .update_message(&message_id, session.accumulator.final_patch())
            .await
        {
            Ok(record) => {
                self.deps.cache.add_or_update_message(&record);
                session.identity.assistant = record;
            }
            Err(error) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    message_id = %message_id,
                    error = %error,
                    "failed to persist finished assistant message"
                );
            }
        }

        let mut patch = ConversationPatch::touched_at(unix_timestamp_millis());
        patch.description = session.identity.description.clone();
        if let Err(error) = self
            .deps
            .store
            .update_conversation_fields(&conversation_id, patch)
            .await
        {
            tracing::warn!(
                conversation_id = %conversation_id,
                error = %error,
                "failed to bump conversation after stream"
            );
        }

        tracing::info!(
            conversation_id = %conversation_id,
            message_id = %message_id,
            "chat stream finished"
        );
        self.teardown(session);
    }

    /// Cancel path; `hook` is `None` when the save already ran for this session.
    async fn stop_and_save(&mut self, hook: Option<SaveOnStop>) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        self.transition(PhaseTransition::Cancel);

        match hook {
            Some(hook) => self.save_partial(&mut session, &hook).await,
            None => tracing::debug!("save hook already consumed; skipping partial save"),
        }

        if let Some(stream_id) = self.cancellation.stream_id()
            && let Err(error) = self.deps.transport.cancel_remote(stream_id).await
        {
            tracing::warn!(
                stream_id,
                error = %error,
                "failed to cancel server-side generation"
            );
        }

        tracing::info!(
            conversation_id = %session.identity.conversation_id,
            "chat stream cancelled"
        );
        self.teardown(session);
    }

    async fn save_partial(&self, session: &mut StreamSession, hook: &SaveOnStop) {
        let guard = &self.deps.sync_guard;
        guard.mark_pending_save(&hook.conversation_id);

        session
            .accumulator
            .snapshot_into(&mut session.identity.assistant);
        self.deps
            .cache
            .add_or_update_message(&session.identity.assistant);
        self.deps.state.set_loading(false);

        if session.identity.assistant_assigned {
            let message_id = &session.identity.assistant.id;
            match self
                .deps
                .store
                .update_message(message_id, session.accumulator.partial_patch())
                .await
            {
                Ok(record) => {
                    self.deps.cache.add_or_update_message(&record);
                }
                Err(error) => {
                    tracing::warn!(
                        conversation_id = %hook.conversation_id,
                        message_id = %message_id,
                        error = %error,
                        "failed to persist partial reply"
                    );
                }
            }
        } else {
            tracing::warn!(
                conversation_id = %hook.conversation_id,
                "stream cancelled before message ids were assigned; partial reply kept in memory only"
            );
        }

        guard.clear_pending_save(&hook.conversation_id);
    }

    /// Fatal path for everything except aborts.
    async fn fail(&mut self, error: SessionError) {
        let Some(session) = self.session.take() else {
            return;
        };
        self.transition(PhaseTransition::Fail);

        tracing::error!(
            conversation_id = %session.identity.conversation_id,
            stage = error.stage(),
            error = %error,
            "chat stream failed"
        );
        self.report_failure(&error, &session.draft);

        if session.identity.assistant_assigned {
            let message_id = &session.identity.assistant.id;
            if let Err(persist_error) = self
                .deps
                .store
                .update_message(message_id, session.accumulator.partial_patch())
                .await
            {
                tracing::warn!(
                    message_id = %message_id,
                    error = %persist_error,
                    "failed to keep partial reply after stream error"
                );
            }
        }

        self.teardown(session);
    }

    fn report_failure(&self, error: &SessionError, draft: &str) {
        if let Some(message) = error.user_message() {
            self.deps.notifier.notify_error(&message);
        }
        self.deps.state.restore_draft(draft.to_string());
    }

    /// Every exit path ends here; the lease is released only after persistence ran.
    fn teardown(&mut self, session: StreamSession) {
        let StreamSession {
            lease,
            stream,
            worker,
            ..
        } = session;

        drop(stream);
        if !worker.is_finished() {
            tracing::debug!("transport worker still running at teardown; abort signalled");
        }
        lease.release();
        self.reset();
    }

    fn reset(&mut self) {
        self.cancellation.clear();
        self.deps.state.set_loading(false);
        self.deps.state.set_loading_text(None);
        self.deps.state.set_streaming_conversation(None);
        self.deps.state.set_optimistic_message(None);
        self.transition(PhaseTransition::Reset);
    }

    fn transition(&mut self, transition: PhaseTransition) {
        match self.phase.apply(transition) {
            Ok(phase) => self.phase = phase,
            Err(rejection) => {
                tracing::warn!(
                    phase = ?self.phase,
                    transition = ?transition,
                    rejection = ?rejection,
                    "rejected session phase transition"
                );
            }
        }
    }
}
