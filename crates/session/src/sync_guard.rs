use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use parley_storage::ConversationId;

#[derive(Debug, Default)]
struct GuardState {
    streaming: HashMap<ConversationId, usize>,
    pending_save: HashMap<ConversationId, usize>,
}

fn increment(counts: &mut HashMap<ConversationId, usize>, conversation_id: &ConversationId) {
    *counts.entry(conversation_id.clone()).or_default() += 1;
}

fn decrement(counts: &mut HashMap<ConversationId, usize>, conversation_id: &ConversationId) {
    if let Some(count) = counts.get_mut(conversation_id) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(conversation_id);
        }
    }
}

/// Conversations a background synchronizer must leave alone.
///
/// The coordinator is the only writer; synchronizers read through [`SyncGuard::should_skip`].
#[derive(Debug, Clone, Default)]
pub struct SyncGuard {
    state: Arc<Mutex<GuardState>>,
}

impl SyncGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the conversation as streaming until the lease is released or dropped.
    pub fn acquire(&self, conversation_id: ConversationId) -> SyncLease {
        increment(&mut self.state.lock().streaming, &conversation_id);
        tracing::debug!(conversation_id = %conversation_id, "sync guard acquired");
        SyncLease {
            guard: self.clone(),
            conversation_id: Some(conversation_id),
        }
    }

    pub fn should_skip(&self, conversation_id: &ConversationId) -> bool {
        let state = self.state.lock();
        state.streaming.contains_key(conversation_id)
            || state.pending_save.contains_key(conversation_id)
    }

    pub fn is_streaming(&self, conversation_id: &ConversationId) -> bool {
        self.state.lock().streaming.contains_key(conversation_id)
    }

    pub fn is_pending_save(&self, conversation_id: &ConversationId) -> bool {
        self.state.lock().pending_save.contains_key(conversation_id)
    }

    pub fn mark_pending_save(&self, conversation_id: &ConversationId) {
        increment(&mut self.state.lock().pending_save, conversation_id);
    }

    pub fn clear_pending_save(&self, conversation_id: &ConversationId) {
        decrement(&mut self.state.lock().pending_save, conversation_id);
    }

    fn release_streaming(&self, conversation_id: &ConversationId) {
        decrement(&mut self.state.lock().streaming, conversation_id);
        tracing::debug!(conversation_id = %conversation_id, "sync guard released");
    }
}

/// Proof that one conversation is marked streaming. Dropping it releases the mark.
#[derive(Debug)]
pub struct SyncLease {
    guard: SyncGuard,
    conversation_id: Option<ConversationId>,
}

impl SyncLease {
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    /// Moves the mark from the optimistic conversation id to the server-assigned one.
    pub fn reassign(&mut self, conversation_id: ConversationId) {
        if self.conversation_id.as_ref() == Some(&conversation_id) {
            return;
        }

        let mut state = self.guard.state.lock();
        if let Some(previous) = self.conversation_id.take() {
            decrement(&mut state.streaming, &previous);
        }
        increment(&mut state.streaming, &conversation_id);
        self.conversation_id = Some(conversation_id);
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(conversation_id) = self.conversation_id.take() {
            self.guard.release_streaming(&conversation_id);
        }
    }
}

impl Drop for SyncLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_blocks_sync_until_released() {
        let guard = SyncGuard::new();
        let conversation_id = ConversationId::new("c-1");

        let lease = guard.acquire(conversation_id.clone());
        assert!(guard.should_skip(&conversation_id));

        lease.release();
        assert!(!guard.should_skip(&conversation_id));
    }

    #[test]
    fn dropping_a_lease_releases_it() {
        let guard = SyncGuard::new();
        let conversation_id = ConversationId::new("c-2");
        {
            let _lease = guard.acquire(conversation_id.clone());
            assert!(guard.is_streaming(&conversation_id));
        }
        assert!(!guard.is_streaming(&conversation_id));
    }

    #[test]
    fn reassign_moves_the_mark() {
        let guard = SyncGuard::new();
        let optimistic = ConversationId::new("tmp-c");
        let assigned = ConversationId::new("c-3");

        let mut lease = guard.acquire(optimistic.clone());
        lease.reassign(assigned.clone());

        assert!(!guard.should_skip(&optimistic));
        assert!(guard.should_skip(&assigned));
        assert_eq!(lease.conversation_id(), Some(&assigned));

        drop(lease);
        assert!(!guard.should_skip(&assigned));
    }

    #[test]
    fn pending_save_is_visible_to_readers() {
        let guard = SyncGuard::new();
        let reader = guard.clone();
        let conversation_id = ConversationId::new("c-4");

        guard.mark_pending_save(&conversation_id);
        assert!(reader.should_skip(&conversation_id));
        assert!(reader.is_pending_save(&conversation_id));

        guard.clear_pending_save(&conversation_id);
        assert!(!reader.should_skip(&conversation_id));
    }
}
