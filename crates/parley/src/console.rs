use std::io::{self, Write};

use parking_lot::Mutex;
use parley_session::{ChatStateManager, InMemoryMessageCache, LoadingIndicator, Notifier, VolatileCache};
use parley_storage::{ConversationId, MessageId, MessageRecord, MessageRole};

/// Message cache that echoes assistant text to a writer as it grows.
pub struct EchoingCache<W> {
    inner: InMemoryMessageCache,
    out: Mutex<EchoState<W>>,
}

struct EchoState<W> {
    writer: W,
    printed: usize,
    /// Set after the first failed write; later output is dropped.
    closed: bool,
}

impl<W: Write> EchoState<W> {
    fn emit(&mut self, text: &str) {
        if self.closed {
            return;
        }
        let result = self
            .writer
            .write_all(text.as_bytes())
            .and_then(|()| self.writer.flush());
        if let Err(error) = result {
            tracing::debug!(error = %error, "stdout closed; no longer echoing the reply");
            self.closed = true;
        }
    }
}

impl<W: Write + Send> EchoingCache<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: InMemoryMessageCache::new(),
            out: Mutex::new(EchoState {
                writer,
                printed: 0,
                closed: false,
            }),
        }
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<MessageRecord> {
        self.inner.messages(conversation_id)
    }

    /// Ends the echoed reply with a newline if anything was printed.
    pub fn finish_line(&self) {
        let mut out = self.out.lock();
        if out.printed > 0 {
            out.emit("\n");
            out.printed = 0;
        }
    }
}

impl<W: Write + Send> VolatileCache for EchoingCache<W> {
    fn add_or_update_message(&self, record: &MessageRecord) {
        self.inner.add_or_update_message(record);
        if record.role != MessageRole::Assistant {
            return;
        }

        let mut out = self.out.lock();
        let content = record.content.as_str();
        // Image generation restarts the text; begin a fresh line.
        if content.len() < out.printed || !content.is_char_boundary(out.printed) {
            out.emit("\n");
            out.printed = 0;
        }
        let start = out.printed;
        if let Some(suffix) = content.get(start..)
            && !suffix.is_empty()
        {
            out.emit(suffix);
            out.printed = content.len();
        }
    }

    fn remove_message(&self, message_id: &MessageId) {
        self.inner.remove_message(message_id);
    }
}

/// Terminal rendering of the chat affordances: captions to stderr, drafts kept for the exit report.
#[derive(Debug, Default)]
pub struct ConsoleChatState {
    restored_draft: Mutex<Option<String>>,
    active_conversation: Mutex<Option<ConversationId>>,
}

impl ConsoleChatState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restored_draft(&self) -> Option<String> {
        self.restored_draft.lock().clone()
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.active_conversation.lock().clone()
    }
}

impl LoadingIndicator for ConsoleChatState {
    fn set_loading(&self, loading: bool) {
        tracing::trace!(loading, "loading indicator changed");
    }

    fn set_loading_text(&self, text: Option<String>) {
        if let Some(text) = text {
            eprintln!("[{text}]");
        }
    }
}

impl ChatStateManager for ConsoleChatState {
    fn set_active_conversation(&self, conversation_id: Option<ConversationId>) {
        if let Some(conversation_id) = conversation_id {
            *self.active_conversation.lock() = Some(conversation_id);
        }
    }

    fn set_streaming_conversation(&self, conversation_id: Option<ConversationId>) {
        if let Some(conversation_id) = conversation_id {
            tracing::debug!(conversation_id = %conversation_id, "streaming into conversation");
        }
    }

    fn set_optimistic_message(&self, message: Option<MessageRecord>) {
        if let Some(message) = message {
            tracing::debug!(message_id = %message.id, "showing optimistic message");
        }
    }

    fn restore_draft(&self, draft: String) {
        *self.restored_draft.lock() = Some(draft);
    }
}

#[derive(Debug, Default)]
pub struct ConsoleNotifier {
    errors: Mutex<Vec<String>>,
}

impl ConsoleNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.lock().is_empty()
    }
}

impl Notifier for ConsoleNotifier {
    fn notify_error(&self, message: &str) {
        eprintln!("error: {message}");
        self.errors.lock().push(message.to_string());
    }
}
