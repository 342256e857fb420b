use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, DecodeJsonColumnSnafu, EncodeJsonColumnSnafu,
    InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu,
    SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu, StorageResult,
};
use super::ids::{ConversationId, MessageId};
use super::types::{
    ConversationPatch, ConversationRecord, MessagePatch, MessageRecord, MessageRole,
    MessageStatus, unix_timestamp_millis,
};
use super::{BoxFuture, ConversationStore, MessageStore};

const CONVERSATION_COLUMNS: &str =
    "id, title, description, starred, is_system_generated, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, role, status, content, created_at, updated_at, file_ids, tool_data, image_data, memory_data, follow_up_actions, pinned, reply_to_message_id";

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let mut pool_options = SqlitePoolOptions::new().max_connections(1);
        if database_url.contains(":memory:") {
            // An in-memory database lives exactly as long as its only connection.
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        // Explicit PRAGMA writes make bootstrap behavior deterministic.
        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "sqlite store opened");

        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }
}

impl ConversationStore for SqliteStorage {
    fn put_conversation<'a>(
        &'a self,
        record: ConversationRecord,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO conversations (id, title, description, starred, is_system_generated, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET title = excluded.title, description = excluded.description, starred = excluded.starred, is_system_generated = excluded.is_system_generated, updated_at = excluded.updated_at",
            )
            .bind(record.id.as_str())
            .bind(&record.title)
            .bind(&record.description)
            .bind(record.starred)
            .bind(record.is_system_generated)
            .bind(record.created_at_unix_ms)
            .bind(record.updated_at_unix_ms)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-put",
            })?;

            Ok(())
        })
    }

    fn get_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, ConversationRow>(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?"
            ))
            .bind(conversation_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-get-query",
            })?;

            row.map(conversation_row_to_record).transpose()
        })
    }

    fn update_conversation_fields<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        patch: ConversationPatch,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let updated_at = patch.updated_at_unix_ms.unwrap_or_else(unix_timestamp_millis);
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "conversation-update-begin",
            })?;

            let update_result = sqlx::query(
                "UPDATE conversations SET title = COALESCE(?, title), description = COALESCE(?, description), starred = COALESCE(?, starred), updated_at = ? WHERE id = ?",
            )
            .bind(patch.title)
            .bind(patch.description)
            .bind(patch.starred)
            .bind(updated_at)
            .bind(conversation_id.as_str())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-update-apply",
            })?;

            if update_result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "conversation-update-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }

            let row = sqlx::query_as::<_, ConversationRow>(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?"
            ))
            .bind(conversation_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-update-load",
            })?
            .context(NotFoundSnafu {
                stage: "conversation-update-load-missing",
                entity: "conversation",
                id: conversation_id.to_string(),
            })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "conversation-update-commit",
            })?;

            conversation_row_to_record(row)
        })
    }
}

impl MessageStore for SqliteStorage {
    fn put_message<'a>(&'a self, record: MessageRecord) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut connection = self.pool.acquire().await.context(SqliteQuerySnafu {
                stage: "message-put-acquire",
            })?;
            upsert_message(&mut connection, &record, "message-put").await
        })
    }

    fn get_message<'a>(
        &'a self,
        message_id: &'a MessageId,
    ) -> BoxFuture<'a, StorageResult<Option<MessageRecord>>> {
        Box::pin(async move {
            let mut connection = self.pool.acquire().await.context(SqliteQuerySnafu {
                stage: "message-get-acquire",
            })?;
            load_message(&mut connection, message_id, "message-get-query").await
        })
    }

    fn list_messages<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, MessageRow>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, id ASC"
            ))
            .bind(conversation_id.as_str())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }

    fn persist_message_pair<'a>(
        &'a self,
        user: MessageRecord,
        assistant: MessageRecord,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            if assistant.created_at_unix_ms <= user.created_at_unix_ms {
                return InvariantViolationSnafu {
                    stage: "message-pair-ordering",
                    details: format!(
                        "assistant '{}' must be created after user '{}'",
                        assistant.id, user.id
                    ),
                }
                .fail();
            }

            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-pair-begin",
            })?;

            // Both rows land or neither does, so the UI never reloads half a turn.
            upsert_message(&mut tx, &user, "message-pair-user").await?;
            upsert_message(&mut tx, &assistant, "message-pair-assistant").await?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-pair-commit",
            })?;

            Ok(())
        })
    }

    fn update_message<'a>(
        &'a self,
        message_id: &'a MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let file_ids = patch
                .file_ids
                .as_ref()
                .map(|value| encode_json(value, "file_ids", "message-update-encode"))
                .transpose()?;
            let tool_data = patch
                .tool_data
                .as_ref()
                .map(|value| encode_json(value, "tool_data", "message-update-encode"))
                .transpose()?;
            let image_data = patch
                .image_data
                .as_ref()
                .map(|value| encode_json(value, "image_data", "message-update-encode"))
                .transpose()?;
            let memory_data = patch
                .memory_data
                .as_ref()
                .map(|value| encode_json(value, "memory_data", "message-update-encode"))
                .transpose()?;
            let follow_up_actions = patch
                .follow_up_actions
                .as_ref()
                .map(|value| encode_json(value, "follow_up_actions", "message-update-encode"))
                .transpose()?;

            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-update-begin",
            })?;

            let update_result = sqlx::query(
                "UPDATE messages SET content = COALESCE(?, content), status = COALESCE(?, status), file_ids = COALESCE(?, file_ids), tool_data = COALESCE(?, tool_data), image_data = COALESCE(?, image_data), memory_data = COALESCE(?, memory_data), follow_up_actions = COALESCE(?, follow_up_actions), pinned = COALESCE(?, pinned), updated_at = ? WHERE id = ?",
            )
            .bind(patch.content)
            .bind(patch.status.map(|status| status.as_str()))
            .bind(file_ids)
            .bind(tool_data)
            .bind(image_data)
            .bind(memory_data)
            .bind(follow_up_actions)
            .bind(patch.pinned)
            .bind(unix_timestamp_millis())
            .bind(message_id.as_str())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-update-apply",
            })?;

            if update_result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "message-update-missing",
                    entity: "message",
                    id: message_id.to_string(),
                }
                .fail();
            }

            let record = load_message(&mut tx, message_id, "message-update-load")
                .await?
                .context(NotFoundSnafu {
                    stage: "message-update-load-missing",
                    entity: "message",
                    id: message_id.to_string(),
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-update-commit",
            })?;

            Ok(record)
        })
    }

    fn replace_optimistic_message<'a>(
        &'a self,
        optimistic_id: &'a MessageId,
        server_id: &'a MessageId,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            if optimistic_id == server_id {
                return Ok(());
            }

            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-replace-begin",
            })?;

            let server_row_exists =
                message_exists(&mut tx, server_id, "message-replace-check-server").await?;

            if server_row_exists {
                // A replayed assignment already re-keyed the row; only a stale optimistic copy can remain.
                sqlx::query("DELETE FROM messages WHERE id = ?")
                    .bind(optimistic_id.as_str())
                    .execute(&mut *tx)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "message-replace-drop-stale",
                    })?;
            } else {
                let result = sqlx::query("UPDATE messages SET id = ? WHERE id = ?")
                    .bind(server_id.as_str())
                    .bind(optimistic_id.as_str())
                    .execute(&mut *tx)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "message-replace-rekey",
                    })?;

                if result.rows_affected() == 0 {
                    return NotFoundSnafu {
                        stage: "message-replace-missing",
                        entity: "message",
                        id: optimistic_id.to_string(),
                    }
                    .fail();
                }
            }

            sqlx::query("UPDATE messages SET reply_to_message_id = ? WHERE reply_to_message_id = ?")
                .bind(server_id.as_str())
                .bind(optimistic_id.as_str())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-replace-rekey-replies",
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-replace-commit",
            })?;

            Ok(())
        })
    }

    fn update_message_status<'a>(
        &'a self,
        message_id: &'a MessageId,
        status: MessageStatus,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let result = sqlx::query("UPDATE messages SET status = ?, updated_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(unix_timestamp_millis())
                .bind(message_id.as_str())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-status-apply",
                })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "message-status-missing",
                    entity: "message",
                    id: message_id.to_string(),
                }
                .fail();
            }

            Ok(())
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    title: String,
    description: Option<String>,
    starred: bool,
    is_system_generated: bool,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    role: String,
    status: String,
    content: String,
    created_at: i64,
    updated_at: i64,
    file_ids: String,
    tool_data: String,
    image_data: Option<String>,
    memory_data: Option<String>,
    follow_up_actions: Option<String>,
    pinned: bool,
    reply_to_message_id: Option<String>,
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: ConversationId::parse(&row.id)?,
        title: row.title,
        description: row.description,
        starred: row.starred,
        is_system_generated: row.is_system_generated,
        created_at_unix_ms: row.created_at,
        updated_at_unix_ms: row.updated_at,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        conversation_id: ConversationId::parse(&row.conversation_id)?,
        role: role_from_sql(&row.role)?,
        status: status_from_sql(&row.status)?,
        content: row.content,
        created_at_unix_ms: row.created_at,
        updated_at_unix_ms: row.updated_at,
        file_ids: decode_json(&row.file_ids, "file_ids")?,
        tool_data: decode_json(&row.tool_data, "tool_data")?,
        image_data: row
            .image_data
            .as_deref()
            .map(|raw| decode_json(raw, "image_data"))
            .transpose()?,
        memory_data: row
            .memory_data
            .as_deref()
            .map(|raw| decode_json(raw, "memory_data"))
            .transpose()?,
        follow_up_actions: row
            .follow_up_actions
            .as_deref()
            .map(|raw| decode_json(raw, "follow_up_actions"))
            .transpose()?,
        pinned: row.pinned,
        reply_to_message_id: row
            .reply_to_message_id
            .as_deref()
            .map(MessageId::parse)
            .transpose()?,
    })
}

async fn upsert_message(
    connection: &mut SqliteConnection,
    record: &MessageRecord,
    stage: &'static str,
) -> StorageResult<()> {
    let file_ids = encode_json(&record.file_ids, "file_ids", stage)?;
    let tool_data = encode_json(&record.tool_data, "tool_data", stage)?;
    let image_data = record
        .image_data
        .as_ref()
        .map(|value| encode_json(value, "image_data", stage))
        .transpose()?;
    let memory_data = record
        .memory_data
        .as_ref()
        .map(|value| encode_json(value, "memory_data", stage))
        .transpose()?;
    let follow_up_actions = record
        .follow_up_actions
        .as_ref()
        .map(|value| encode_json(value, "follow_up_actions", stage))
        .transpose()?;

    sqlx::query(
        "INSERT INTO messages (id, conversation_id, role, status, content, created_at, updated_at, file_ids, tool_data, image_data, memory_data, follow_up_actions, pinned, reply_to_message_id) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET conversation_id = excluded.conversation_id, role = excluded.role, status = excluded.status, content = excluded.content, created_at = excluded.created_at, updated_at = excluded.updated_at, file_ids = excluded.file_ids, tool_data = excluded.tool_data, image_data = excluded.image_data, memory_data = excluded.memory_data, follow_up_actions = excluded.follow_up_actions, pinned = excluded.pinned, reply_to_message_id = excluded.reply_to_message_id",
    )
    .bind(record.id.as_str())
    .bind(record.conversation_id.as_str())
    .bind(record.role.as_str())
    .bind(record.status.as_str())
    .bind(&record.content)
    .bind(record.created_at_unix_ms)
    .bind(record.updated_at_unix_ms)
    .bind(file_ids)
    .bind(tool_data)
    .bind(image_data)
    .bind(memory_data)
    .bind(follow_up_actions)
    .bind(record.pinned)
    .bind(record.reply_to_message_id.as_ref().map(MessageId::as_str))
    .execute(&mut *connection)
    .await
    .context(SqliteQuerySnafu { stage })?;

    Ok(())
}

async fn load_message(
    connection: &mut SqliteConnection,
    message_id: &MessageId,
    stage: &'static str,
) -> StorageResult<Option<MessageRecord>> {
    let row = sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
    ))
    .bind(message_id.as_str())
    .fetch_optional(&mut *connection)
    .await
    .context(SqliteQuerySnafu { stage })?;

    row.map(message_row_to_record).transpose()
}

async fn message_exists(
    connection: &mut SqliteConnection,
    message_id: &MessageId,
    stage: &'static str,
) -> StorageResult<bool> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE id = ?")
        .bind(message_id.as_str())
        .fetch_one(&mut *connection)
        .await
        .context(SqliteQuerySnafu { stage })?;

    Ok(count > 0)
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn status_from_sql(raw: &str) -> StorageResult<MessageStatus> {
    match raw {
        "sending" => Ok(MessageStatus::Sending),
        "sent" => Ok(MessageStatus::Sent),
        _ => InvariantViolationSnafu {
            stage: "message-status-from-sql",
            details: format!("unknown message status '{raw}'"),
        }
        .fail(),
    }
}

fn encode_json<T>(value: &T, column: &'static str, stage: &'static str) -> StorageResult<String>
where
    T: Serialize + ?Sized,
{
    serde_json::to_string(value).context(EncodeJsonColumnSnafu { stage, column })
}

fn decode_json<T>(raw: &str, column: &'static str) -> StorageResult<T>
where
    T: DeserializeOwned,
{
    serde_json::from_str(raw).context(DecodeJsonColumnSnafu {
        stage: "message-row-decode-json",
        column,
    })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::StorageError;
    use crate::types::ToolDataEntry;

    async fn open_memory_store() -> SqliteStorage {
        SqliteStorage::open(":memory:")
            .await
            .expect("in-memory sqlite store should open")
    }

    async fn seed_conversation(store: &SqliteStorage, id: &str) -> ConversationId {
        let conversation_id = ConversationId::new(id);
        store
            .put_conversation(ConversationRecord::new(conversation_id.clone(), "Seed", 1_000))
            .await
            .expect("seed conversation");
        conversation_id
    }

    #[tokio::test]
    async fn conversation_round_trips_and_patch_is_partial() {
        let store = open_memory_store().await;
        let conversation_id = seed_conversation(&store, "conv-1").await;

        let updated = store
            .update_conversation_fields(
                &conversation_id,
                ConversationPatch {
                    description: Some("weekend plans".to_string()),
                    updated_at_unix_ms: Some(2_000),
                    ..ConversationPatch::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.title, "Seed");
        assert_eq!(updated.description.as_deref(), Some("weekend plans"));
        assert_eq!(updated.created_at_unix_ms, 1_000);
        assert_eq!(updated.updated_at_unix_ms, 2_000);

        let missing = store
            .update_conversation_fields(&ConversationId::new("nope"), ConversationPatch::default())
            .await
            .unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn message_pair_is_written_together_and_replay_does_not_duplicate() {
        let store = open_memory_store().await;
        let conversation_id = seed_conversation(&store, "conv-1").await;

        let user =
            MessageRecord::user_sending(MessageId::new("u-1"), conversation_id.clone(), "Hello", 5_000);
        let assistant =
            MessageRecord::assistant_shell(MessageId::new("a-1"), conversation_id.clone(), 5_001);

        store
            .persist_message_pair(user.clone(), assistant.clone())
            .await
            .unwrap();
        store.persist_message_pair(user, assistant).await.unwrap();

        let messages = store.list_messages(&conversation_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id.as_str(), "u-1");
        assert_eq!(messages[1].id.as_str(), "a-1");
        assert_eq!(messages[1].created_at_unix_ms, messages[0].created_at_unix_ms + 1);
    }

    #[tokio::test]
    async fn message_pair_rolls_back_when_second_row_fails() {
        let store = open_memory_store().await;
        let conversation_id = seed_conversation(&store, "conv-1").await;

        let user =
            MessageRecord::user_sending(MessageId::new("u-1"), conversation_id.clone(), "Hello", 5_000);
        let orphan =
            MessageRecord::assistant_shell(MessageId::new("a-1"), ConversationId::new("ghost"), 5_001);

        let error = store.persist_message_pair(user, orphan).await.unwrap_err();
        assert!(matches!(error, StorageError::SqliteQuery { .. }));
        assert!(store.list_messages(&conversation_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn message_pair_rejects_inverted_timestamps() {
        let store = open_memory_store().await;
        let conversation_id = seed_conversation(&store, "conv-1").await;

        let user =
            MessageRecord::user_sending(MessageId::new("u-1"), conversation_id.clone(), "Hi", 5_000);
        let assistant =
            MessageRecord::assistant_shell(MessageId::new("a-1"), conversation_id, 5_000);

        let error = store.persist_message_pair(user, assistant).await.unwrap_err();
        assert!(matches!(error, StorageError::InvariantViolation { .. }));
    }

    #[tokio::test]
    async fn replace_optimistic_rekeys_in_place_and_is_idempotent() {
        let store = open_memory_store().await;
        let conversation_id = seed_conversation(&store, "conv-1").await;
        let optimistic = MessageId::new("tmp-1");
        let server = MessageId::new("srv-42");

        store
            .put_message(MessageRecord::user_sending(
                optimistic.clone(),
                conversation_id.clone(),
                "original prompt",
                7_000,
            ))
            .await
            .unwrap();

        store.replace_optimistic_message(&optimistic, &server).await.unwrap();
        store.replace_optimistic_message(&optimistic, &server).await.unwrap();

        assert!(store.get_message(&optimistic).await.unwrap().is_none());
        let messages = store.list_messages(&conversation_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, server);
        assert_eq!(messages[0].content, "original prompt");
        assert_eq!(messages[0].created_at_unix_ms, 7_000);
    }

    #[tokio::test]
    async fn replace_optimistic_reports_missing_rows() {
        let store = open_memory_store().await;
        let error = store
            .replace_optimistic_message(&MessageId::new("tmp-x"), &MessageId::new("srv-x"))
            .await
            .unwrap_err();
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn update_message_merges_without_clobbering_side_channel() {
        let store = open_memory_store().await;
        let conversation_id = seed_conversation(&store, "conv-1").await;
        let message_id = MessageId::new("a-1");

        let mut record =
            MessageRecord::assistant_shell(message_id.clone(), conversation_id.clone(), 9_000);
        record.tool_data.push(ToolDataEntry::new(
            "search",
            json!({"tool_call_id": "call-1", "output": {"hits": 3}}),
        ));
        record.image_data = Some(json!({"url": "https://cdn/img.png"}));
        store.put_message(record).await.unwrap();

        let merged = store
            .update_message(
                &message_id,
                MessagePatch::content_and_status("partial answer", MessageStatus::Sent),
            )
            .await
            .unwrap();

        assert_eq!(merged.content, "partial answer");
        assert_eq!(merged.status, MessageStatus::Sent);
        assert_eq!(merged.tool_data.len(), 1);
        assert_eq!(merged.tool_data[0].tool_call_id(), Some("call-1"));
        assert_eq!(merged.image_data, Some(json!({"url": "https://cdn/img.png"})));
        assert_eq!(merged.created_at_unix_ms, 9_000);
    }

    #[tokio::test]
    async fn status_update_requires_existing_row() {
        let store = open_memory_store().await;
        let conversation_id = seed_conversation(&store, "conv-1").await;
        let message_id = MessageId::new("u-1");
        store
            .put_message(MessageRecord::user_sending(
                message_id.clone(),
                conversation_id,
                "hey",
                1,
            ))
            .await
            .unwrap();

        store
            .update_message_status(&message_id, MessageStatus::Sent)
            .await
            .unwrap();
        let stored = store.get_message(&message_id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);

        let error = store
            .update_message_status(&MessageId::new("missing"), MessageStatus::Sent)
            .await
            .unwrap_err();
        assert!(error.is_not_found());
    }

    #[test]
    fn database_urls_are_normalized() {
        assert_eq!(normalize_database_url(":memory:"), "sqlite::memory:");
        assert_eq!(normalize_database_url("sqlite://a.db"), "sqlite://a.db");
        assert_eq!(normalize_database_url("data/chat.db"), "sqlite://data/chat.db");
    }
}
