use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{ConversationId, MessageId};

/// Default conversation title used when the server assigns a conversation without one.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

/// Storage-local message role, intentionally decoupled from UI-layer role enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Durable delivery status. Only two states are ever written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
        }
    }
}

/// One tool invocation attached to an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDataEntry {
    pub tool_name: String,
    #[serde(default)]
    pub data: Value,
}

impl ToolDataEntry {
    pub fn new(tool_name: impl Into<String>, data: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            data,
        }
    }

    /// Call identifier used to correlate a later output event with this entry.
    pub fn tool_call_id(&self) -> Option<&str> {
        self.data.get("tool_call_id").and_then(Value::as_str)
    }

    /// Caption the tool wants shown while it runs.
    pub fn caption(&self) -> Option<&str> {
        self.data
            .get("message")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|caption| !caption.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub title: String,
    pub description: Option<String>,
    pub starred: bool,
    pub is_system_generated: bool,
    pub created_at_unix_ms: i64,
    pub updated_at_unix_ms: i64,
}

impl ConversationRecord {
    pub fn new(id: ConversationId, title: impl Into<String>, now_unix_ms: i64) -> Self {
        let mut title = title.into();
        if title.trim().is_empty() {
            title = DEFAULT_CONVERSATION_TITLE.to_string();
        }

        Self {
            id,
            title,
            description: None,
            starred: false,
            is_system_generated: false,
            created_at_unix_ms: now_unix_ms,
            updated_at_unix_ms: now_unix_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConversationPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub starred: Option<bool>,
    pub updated_at_unix_ms: Option<i64>,
}

impl ConversationPatch {
    pub fn touched_at(updated_at_unix_ms: i64) -> Self {
        Self {
            updated_at_unix_ms: Some(updated_at_unix_ms),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: MessageRole,
    pub status: MessageStatus,
    pub content: String,
    pub created_at_unix_ms: i64,
    pub updated_at_unix_ms: i64,
    pub file_ids: Vec<String>,
    pub tool_data: Vec<ToolDataEntry>,
    pub image_data: Option<Value>,
    pub memory_data: Option<Value>,
    pub follow_up_actions: Option<Value>,
    pub pinned: bool,
    pub reply_to_message_id: Option<MessageId>,
}

impl MessageRecord {
    pub fn new(
        id: MessageId,
        conversation_id: ConversationId,
        role: MessageRole,
        content: impl Into<String>,
        created_at_unix_ms: i64,
    ) -> Self {
        Self {
            id,
            conversation_id,
            role,
            status: MessageStatus::Sending,
            content: content.into(),
            created_at_unix_ms,
            updated_at_unix_ms: created_at_unix_ms,
            file_ids: Vec::new(),
            tool_data: Vec::new(),
            image_data: None,
            memory_data: None,
            follow_up_actions: None,
            pinned: false,
            reply_to_message_id: None,
        }
    }

    /// Creates a user message awaiting server confirmation.
    pub fn user_sending(
        id: MessageId,
        conversation_id: ConversationId,
        content: impl Into<String>,
        created_at_unix_ms: i64,
    ) -> Self {
        Self::new(id, conversation_id, MessageRole::User, content, created_at_unix_ms)
    }

    /// Creates an empty assistant shell that streamed content is folded into.
    pub fn assistant_shell(
        id: MessageId,
        conversation_id: ConversationId,
        created_at_unix_ms: i64,
    ) -> Self {
        Self::new(
            id,
            conversation_id,
            MessageRole::Assistant,
            String::new(),
            created_at_unix_ms,
        )
    }
}

/// Partial update; `None` fields keep whatever is already stored.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub status: Option<MessageStatus>,
    pub file_ids: Option<Vec<String>>,
    pub tool_data: Option<Vec<ToolDataEntry>>,
    pub image_data: Option<Value>,
    pub memory_data: Option<Value>,
    pub follow_up_actions: Option<Value>,
    pub pinned: Option<bool>,
}

impl MessagePatch {
    pub fn content_and_status(content: impl Into<String>, status: MessageStatus) -> Self {
        Self {
            content: Some(content.into()),
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn apply_to(&self, record: &mut MessageRecord) {
        if let Some(content) = &self.content {
            record.content = content.clone();
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(file_ids) = &self.file_ids {
            record.file_ids = file_ids.clone();
        }
        if let Some(tool_data) = &self.tool_data {
            record.tool_data = tool_data.clone();
        }
        if let Some(image_data) = &self.image_data {
            record.image_data = Some(image_data.clone());
        }
        if let Some(memory_data) = &self.memory_data {
            record.memory_data = Some(memory_data.clone());
        }
        if let Some(follow_up_actions) = &self.follow_up_actions {
            record.follow_up_actions = Some(follow_up_actions.clone());
        }
        if let Some(pinned) = self.pinned {
            record.pinned = pinned;
        }
    }
}

/// Wall-clock milliseconds since the unix epoch; the store's only time unit.
pub fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn blank_titles_fall_back_to_default() {
        let record = ConversationRecord::new(ConversationId::new("c-1"), "  ", 10);
        assert_eq!(record.title, DEFAULT_CONVERSATION_TITLE);
        assert_eq!(record.created_at_unix_ms, record.updated_at_unix_ms);
    }

    #[test]
    fn patch_keeps_fields_it_does_not_name() {
        let mut record = MessageRecord::assistant_shell(
            MessageId::new("m-1"),
            ConversationId::new("c-1"),
            100,
        );
        record.tool_data.push(ToolDataEntry::new("search", json!({"q": "rust"})));
        record.image_data = Some(json!({"url": "https://img"}));

        MessagePatch::content_and_status("partial", MessageStatus::Sent).apply_to(&mut record);

        assert_eq!(record.content, "partial");
        assert_eq!(record.status, MessageStatus::Sent);
        assert_eq!(record.tool_data.len(), 1);
        assert_eq!(record.image_data, Some(json!({"url": "https://img"})));
    }

    #[test]
    fn tool_entry_exposes_call_id_and_caption() {
        let entry = ToolDataEntry::new(
            "web_search",
            json!({"tool_call_id": "call-1", "message": " Searching the web "}),
        );
        assert_eq!(entry.tool_call_id(), Some("call-1"));
        assert_eq!(entry.caption(), Some("Searching the web"));

        let silent = ToolDataEntry::new("noop", json!({"message": ""}));
        assert_eq!(silent.tool_call_id(), None);
        assert_eq!(silent.caption(), None);
    }
}
