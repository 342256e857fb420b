use parley_storage::{
    ConversationId, ConversationRecord, DEFAULT_CONVERSATION_TITLE, DurableStore, MessageId,
    MessageRecord, MessageStatus, unix_timestamp_millis,
};
use snafu::ResultExt;

use super::cache::VolatileCache;
use super::cancellation::CancellationController;
use super::error::{PersistSnafu, SessionError, SessionResult};
use super::state::ChatStateManager;
use super::sync_guard::SyncLease;

/// Identity half of a stream session: which records the session is writing, under which ids.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub conversation_id: ConversationId,
    /// True until the server names the conversation this session started.
    pub fresh_conversation: bool,
    pub title: Option<String>,
    pub description: Option<String>,
    pub user: MessageRecord,
    pub assistant: MessageRecord,
    /// True once the assistant message has a server id and a durable row.
    pub assistant_assigned: bool,
}

impl SessionIdentity {
    pub fn new(
        conversation_id: ConversationId,
        fresh_conversation: bool,
        user: MessageRecord,
        assistant: MessageRecord,
    ) -> Self {
        Self {
            conversation_id,
            fresh_conversation,
            title: None,
            description: None,
            user,
            assistant,
            assistant_assigned: false,
        }
    }
}

/// Collaborators a reconciliation step may touch.
pub struct ReconcileContext<'a> {
    pub store: &'a dyn DurableStore,
    pub cache: &'a dyn VolatileCache,
    pub state: &'a dyn ChatStateManager,
    pub cancellation: &'a mut CancellationController,
    pub lease: &'a mut SyncLease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    /// Ids were noted but records are written by a later frame.
    Deferred,
    /// The same assignment was seen before; nothing was written.
    Replayed,
}

/// Swaps optimistic ids for server ids, each flow at most once per session.
#[derive(Debug, Default)]
pub struct IdentityReconciler {
    conversation_assigned: bool,
    created_conversation: bool,
    messages_assigned: bool,
    pending_message_ids: Option<(MessageId, MessageId)>,
}

impl IdentityReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages_assigned(&self) -> bool {
        self.messages_assigned
    }

    pub async fn on_conversation_assigned(
        &mut self,
        ctx: &mut ReconcileContext<'_>,
        identity: &mut SessionIdentity,
        conversation_id: ConversationId,
        user_message_id: Option<MessageId>,
        bot_message_id: Option<MessageId>,
    ) -> SessionResult<ReconcileOutcome> {
        if self.conversation_assigned {
            tracing::debug!(conversation_id = %conversation_id, "conversation assignment replayed");
            return Ok(ReconcileOutcome::Replayed);
        }
        self.conversation_assigned = true;

        if !identity.fresh_conversation {
            if conversation_id != identity.conversation_id {
                tracing::warn!(
                    conversation_id = %identity.conversation_id,
                    assigned_conversation_id = %conversation_id,
                    "server named a different conversation for an existing one; keeping ours"
                );
            }
            // Existing conversations keep their id; the frame may still carry message ids.
            return match (user_message_id, bot_message_id) {
                (Some(user_id), Some(bot_id)) => {
                    self.on_message_ids_assigned(ctx, identity, user_id, bot_id)
                        .await
                }
                _ => Ok(ReconcileOutcome::Deferred),
            };
        }

        ensure_conversation(ctx.store, identity, &conversation_id).await?;
        self.created_conversation = true;

        let optimistic_conversation = identity.conversation_id.clone();
        ctx.lease.reassign(conversation_id.clone());
        ctx.cancellation.retarget_save_hook(conversation_id.clone());
        identity.conversation_id = conversation_id.clone();
        identity.fresh_conversation = false;
        identity.user.conversation_id = conversation_id.clone();
        identity.assistant.conversation_id = conversation_id.clone();

        tracing::info!(
            optimistic_conversation_id = %optimistic_conversation,
            conversation_id = %conversation_id,
            "server assigned conversation"
        );

        let message_ids = match (user_message_id, bot_message_id) {
            (Some(user_id), Some(bot_id)) => Some((user_id, bot_id)),
            _ => self.pending_message_ids.take(),
        };

        match message_ids {
            Some((user_id, bot_id)) => {
                self.messages_assigned = true;
                self.persist_pair(ctx, identity, user_id, bot_id).await?;
                Ok(ReconcileOutcome::Applied)
            }
            None => {
                ctx.state.set_active_conversation(Some(conversation_id.clone()));
                ctx.state.set_streaming_conversation(Some(conversation_id));
                Ok(ReconcileOutcome::Deferred)
            }
        }
    }

    pub async fn on_message_ids_assigned(
        &mut self,
        ctx: &mut ReconcileContext<'_>,
        identity: &mut SessionIdentity,
        user_message_id: MessageId,
        bot_message_id: MessageId,
    ) -> SessionResult<ReconcileOutcome> {
        if self.messages_assigned {
            tracing::debug!(
                user_message_id = %user_message_id,
                bot_message_id = %bot_message_id,
                "message id assignment replayed"
            );
            return Ok(ReconcileOutcome::Replayed);
        }

        if identity.fresh_conversation {
            // Nothing can be written before the conversation row exists.
            self.pending_message_ids = Some((user_message_id, bot_message_id));
            return Ok(ReconcileOutcome::Deferred);
        }

        self.messages_assigned = true;
        if self.created_conversation {
            // The optimistic user message of a new conversation was never stored.
            self.persist_pair(ctx, identity, user_message_id, bot_message_id)
                .await?;
        } else {
            self.replace_existing(ctx, identity, user_message_id, bot_message_id)
                .await?;
        }
        Ok(ReconcileOutcome::Applied)
    }

    async fn persist_pair(
        &mut self,
        ctx: &mut ReconcileContext<'_>,
        identity: &mut SessionIdentity,
        user_message_id: MessageId,
        bot_message_id: MessageId,
    ) -> SessionResult<()> {
        let (user, assistant) = assigned_records(identity, user_message_id, bot_message_id);

        ctx.store
            .persist_message_pair(user.clone(), assistant.clone())
            .await
            .context(PersistSnafu {
                stage: "persist-message-pair",
            })?;

        ctx.state.set_optimistic_message(None);
        swap_cached(ctx.cache, identity, &user, &assistant);
        identity.user = user;
        identity.assistant = assistant;
        identity.assistant_assigned = true;

        ctx.state
            .set_active_conversation(Some(identity.conversation_id.clone()));
        ctx.state
            .set_streaming_conversation(Some(identity.conversation_id.clone()));

        tracing::info!(
            conversation_id = %identity.conversation_id,
            user_message_id = %identity.user.id,
            bot_message_id = %identity.assistant.id,
            "persisted message pair under server ids"
        );
        Ok(())
    }

    async fn replace_existing(
        &mut self,
        ctx: &mut ReconcileContext<'_>,
        identity: &mut SessionIdentity,
        user_message_id: MessageId,
        bot_message_id: MessageId,
    ) -> SessionResult<()> {
        let (mut user, mut assistant) =
            assigned_records(identity, user_message_id, bot_message_id);

        match ctx
            .store
            .replace_optimistic_message(&identity.user.id, &user.id)
            .await
        {
            Ok(()) => {
                ctx.store
                    .update_message_status(&user.id, MessageStatus::Sent)
                    .await
                    .context(PersistSnafu {
                        stage: "mark-user-message-sent",
                    })?;
            }
            Err(error) if error.is_not_found() => {
                tracing::debug!(
                    optimistic_id = %identity.user.id,
                    message_id = %user.id,
                    "optimistic user message was never stored; writing it under the server id"
                );
                ctx.store
                    .put_message(user.clone())
                    .await
                    .context(PersistSnafu {
                        stage: "put-user-message",
                    })?;
            }
            Err(source) => {
                return Err(SessionError::Persist {
                    stage: "replace-optimistic-message",
                    source,
                });
            }
        }
        user.status = MessageStatus::Sent;

        let shell = MessageRecord::assistant_shell(
            assistant.id.clone(),
            assistant.conversation_id.clone(),
            assistant.created_at_unix_ms,
        );
        ctx.store
            .put_message(shell)
            .await
            .context(PersistSnafu {
                stage: "put-assistant-shell",
            })?;
        assistant.status = MessageStatus::Sending;

        swap_cached(ctx.cache, identity, &user, &assistant);
        identity.user = user;
        identity.assistant = assistant;
        identity.assistant_assigned = true;

        tracing::info!(
            conversation_id = %identity.conversation_id,
            user_message_id = %identity.user.id,
            bot_message_id = %identity.assistant.id,
            "reconciled optimistic message with server ids"
        );
        Ok(())
    }
}

async fn ensure_conversation(
    store: &dyn DurableStore,
    identity: &SessionIdentity,
    conversation_id: &ConversationId,
) -> SessionResult<()> {
    let existing = store
        .get_conversation(conversation_id)
        .await
        .context(PersistSnafu {
            stage: "load-assigned-conversation",
        })?;
    if existing.is_some() {
        return Ok(());
    }

    let title = identity
        .title
        .clone()
        .unwrap_or_else(|| DEFAULT_CONVERSATION_TITLE.to_string());
    let mut record = ConversationRecord::new(conversation_id.clone(), title, unix_timestamp_millis());
    record.description = identity.description.clone();

    store
        .put_conversation(record)
        .await
        .context(PersistSnafu {
            stage: "create-assigned-conversation",
        })
}

/// Final records under server ids; the assistant always sorts one millisecond after the user.
fn assigned_records(
    identity: &SessionIdentity,
    user_message_id: MessageId,
    bot_message_id: MessageId,
) -> (MessageRecord, MessageRecord) {
    let mut user = identity.user.clone();
    user.id = user_message_id;
    user.conversation_id = identity.conversation_id.clone();
    user.status = MessageStatus::Sent;

    let mut assistant = identity.assistant.clone();
    assistant.id = bot_message_id;
    assistant.conversation_id = identity.conversation_id.clone();
    assistant.created_at_unix_ms = user.created_at_unix_ms + 1;
    assistant.updated_at_unix_ms = assistant.updated_at_unix_ms.max(assistant.created_at_unix_ms);
    assistant.status = MessageStatus::Sending;

    (user, assistant)
}

fn swap_cached(
    cache: &dyn VolatileCache,
    identity: &SessionIdentity,
    user: &MessageRecord,
    assistant: &MessageRecord,
) {
    cache.add_or_update_message(user);
    cache.add_or_update_message(assistant);
    if identity.user.id != user.id {
        cache.remove_message(&identity.user.id);
    }
    if identity.assistant.id != assistant.id {
        cache.remove_message(&identity.assistant.id);
    }
}
