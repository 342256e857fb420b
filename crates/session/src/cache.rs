use std::collections::HashMap;

use parking_lot::RwLock;
use parley_storage::{ConversationId, MessageId, MessageRecord};

/// In-memory store the UI observes. Calls are cheap and never touch disk.
pub trait VolatileCache: Send + Sync {
    fn add_or_update_message(&self, record: &MessageRecord);
    fn remove_message(&self, message_id: &MessageId);
}

/// Messages grouped by conversation, in insertion order.
#[derive(Debug, Default)]
pub struct InMemoryMessageCache {
    messages: RwLock<HashMap<ConversationId, Vec<MessageRecord>>>,
}

impl InMemoryMessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<MessageRecord> {
        self.messages
            .read()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get(&self, message_id: &MessageId) -> Option<MessageRecord> {
        self.messages
            .read()
            .values()
            .flatten()
            .find(|record| &record.id == message_id)
            .cloned()
    }

    pub fn message_count(&self) -> usize {
        self.messages.read().values().map(Vec::len).sum()
    }
}

impl VolatileCache for InMemoryMessageCache {
    fn add_or_update_message(&self, record: &MessageRecord) {
        let mut messages = self.messages.write();

        if let Some(existing) = messages
            .get_mut(&record.conversation_id)
            .and_then(|list| list.iter_mut().find(|entry| entry.id == record.id))
        {
            *existing = record.clone();
            return;
        }

        // The record may have moved from an optimistic conversation key.
        for list in messages.values_mut() {
            list.retain(|entry| entry.id != record.id);
        }
        messages.retain(|_, list| !list.is_empty());
        messages
            .entry(record.conversation_id.clone())
            .or_default()
            .push(record.clone());
    }

    fn remove_message(&self, message_id: &MessageId) {
        let mut messages = self.messages.write();
        for list in messages.values_mut() {
            list.retain(|entry| &entry.id != message_id);
        }
        messages.retain(|_, list| !list.is_empty());
    }
}
