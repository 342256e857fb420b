use parley_storage::{ConversationId, MessageRecord};

use super::accumulator::LoadingIndicator;

/// UI state the coordinator drives. Implementations own rendering; the coordinator only sets values.
pub trait ChatStateManager: LoadingIndicator {
    fn set_active_conversation(&self, conversation_id: Option<ConversationId>);
    /// Sidebar affordance for the conversation that is currently receiving a reply.
    fn set_streaming_conversation(&self, conversation_id: Option<ConversationId>);
    /// Placeholder shown for a brand-new conversation until the server names it.
    fn set_optimistic_message(&self, message: Option<MessageRecord>);
    /// Puts the user's prompt back into the composer after a failed send.
    fn restore_draft(&self, draft: String);
}

pub trait Notifier: Send + Sync {
    fn notify_error(&self, message: &str);
}
