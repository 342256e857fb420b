use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ConversationId, MessageId, OPTIMISTIC_ID_PREFIX};
pub use sqlite::SqliteStorage;
pub use types::{
    ConversationPatch, ConversationRecord, DEFAULT_CONVERSATION_TITLE, MessagePatch,
    MessageRecord, MessageRole, MessageStatus, ToolDataEntry, unix_timestamp_millis,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait ConversationStore: Send + Sync {
    /// Inserts the conversation or overwrites the row with the same id.
    fn put_conversation<'a>(
        &'a self,
        record: ConversationRecord,
    ) -> BoxFuture<'a, StorageResult<()>>;
    fn get_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>>;
    fn update_conversation_fields<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        patch: ConversationPatch,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>>;
}

pub trait MessageStore: Send + Sync {
    /// Inserts the message or overwrites the row with the same id.
    fn put_message<'a>(&'a self, record: MessageRecord) -> BoxFuture<'a, StorageResult<()>>;
    fn get_message<'a>(
        &'a self,
        message_id: &'a MessageId,
    ) -> BoxFuture<'a, StorageResult<Option<MessageRecord>>>;
    fn list_messages<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>>;
    /// Writes a user message and the assistant reply it provoked in one transaction.
    fn persist_message_pair<'a>(
        &'a self,
        user: MessageRecord,
        assistant: MessageRecord,
    ) -> BoxFuture<'a, StorageResult<()>>;
    /// Merges only the fields named by the patch.
    fn update_message<'a>(
        &'a self,
        message_id: &'a MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>>;
    /// Re-keys an optimistic row to its server id without ever leaving both rows behind.
    fn replace_optimistic_message<'a>(
        &'a self,
        optimistic_id: &'a MessageId,
        server_id: &'a MessageId,
    ) -> BoxFuture<'a, StorageResult<()>>;
    fn update_message_status<'a>(
        &'a self,
        message_id: &'a MessageId,
        status: MessageStatus,
    ) -> BoxFuture<'a, StorageResult<()>>;
}

pub trait DurableStore: ConversationStore + MessageStore {}

impl<T> DurableStore for T where T: ConversationStore + MessageStore {}
