use parley_storage::ConversationId;
use parley_transport::AbortHandle;

/// Designates what to save when the user stops a stream. Registered once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOnStop {
    pub conversation_id: ConversationId,
}

impl SaveOnStop {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self { conversation_id }
    }
}

/// Owns the transport abort signal, the save hook, and the server stream id.
#[derive(Debug, Default)]
pub struct CancellationController {
    abort: Option<AbortHandle>,
    save_hook: Option<SaveOnStop>,
    stream_id: Option<String>,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_save_hook(&mut self, hook: SaveOnStop) {
        if self.save_hook.is_some() {
            tracing::warn!("replacing a save hook that was never consumed");
        }
        self.save_hook = Some(hook);
    }

    /// Points the registered hook at the server-assigned conversation.
    pub fn retarget_save_hook(&mut self, conversation_id: ConversationId) {
        if let Some(hook) = self.save_hook.as_mut() {
            hook.conversation_id = conversation_id;
        }
    }

    pub fn arm(&mut self, abort: AbortHandle) {
        self.abort = Some(abort);
    }

    pub fn is_armed(&self) -> bool {
        self.abort.is_some()
    }

    /// Signals the transport and yields the save hook. The hook comes out at most once.
    pub fn abort(&mut self) -> Option<SaveOnStop> {
        if let Some(abort) = self.abort.take()
            && !abort.abort()
        {
            tracing::debug!("transport worker had already finished before abort");
        }
        self.save_hook.take()
    }

    /// Takes the hook without signalling, for aborts the transport reported itself.
    pub fn take_save_hook(&mut self) -> Option<SaveOnStop> {
        self.save_hook.take()
    }

    pub fn set_stream_id(&mut self, stream_id: String) {
        self.stream_id = Some(stream_id);
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub fn clear(&mut self) {
        self.abort = None;
        self.save_hook = None;
        self.stream_id = None;
    }
}
