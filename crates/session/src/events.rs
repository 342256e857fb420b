use parley_storage::{ConversationId, MessageId, ToolDataEntry};
use serde::Deserialize;
use serde_json::{Map, Value};

/// Literal frame that ends a stream; it is never parsed as JSON.
pub const TERMINAL_SENTINEL: &str = "[DONE]";

const KNOWN_FIELDS: &[&str] = &[
    "response",
    "tool_data",
    "tool_output",
    "conversation_id",
    "conversation_description",
    "user_message_id",
    "bot_message_id",
    "stream_id",
    "main_response_complete",
    "image_data",
    "memory_data",
    "follow_up_actions",
    "file_ids",
    "error",
];

#[derive(Debug, Deserialize)]
struct WireFrame {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    tool_data: Option<WireToolData>,
    #[serde(default)]
    tool_output: Option<WireToolOutput>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    conversation_description: Option<String>,
    #[serde(default)]
    user_message_id: Option<String>,
    #[serde(default)]
    bot_message_id: Option<String>,
    #[serde(default)]
    stream_id: Option<String>,
    #[serde(default)]
    main_response_complete: Option<bool>,
    #[serde(default)]
    image_data: Option<Value>,
    #[serde(default)]
    memory_data: Option<Value>,
    #[serde(default)]
    follow_up_actions: Option<Value>,
    #[serde(default)]
    file_ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct WireToolData {
    #[serde(default)]
    tool_name: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct WireToolOutput {
    #[serde(default)]
    tool_call_id: Option<String>,
    #[serde(default)]
    output: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageStatus {
    Generating,
    Ready(Value),
}

/// Side-channel fields that only overwrite what they carry.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SideChannelUpdate {
    pub memory_data: Option<Value>,
    pub follow_up_actions: Option<Value>,
    pub file_ids: Option<Vec<String>>,
}

impl SideChannelUpdate {
    pub fn is_empty(&self) -> bool {
        self.memory_data.is_none() && self.follow_up_actions.is_none() && self.file_ids.is_none()
    }
}

/// One facet of a decoded frame. A frame may produce several, always in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    StreamIdAssigned(String),
    ConversationAssigned {
        conversation_id: ConversationId,
        user_message_id: Option<MessageId>,
        bot_message_id: Option<MessageId>,
    },
    MessageIdsAssigned {
        user_message_id: MessageId,
        bot_message_id: MessageId,
    },
    ConversationDescription(String),
    ToolData(ToolDataEntry),
    ToolOutput {
        tool_call_id: String,
        output: Value,
    },
    ImageStatus(ImageStatus),
    SideChannel(SideChannelUpdate),
    ResponseDelta(String),
    CompletionSignal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    Terminal,
    Malformed(String),
    ErrorSignal(String),
    Events(Vec<StreamEvent>),
}

impl DecodedFrame {
    /// True for frames after which the session cannot continue.
    pub fn ends_session(&self) -> bool {
        !matches!(self, Self::Events(_))
    }
}

pub fn decode_frame(raw: &str) -> DecodedFrame {
    let trimmed = raw.trim();
    if trimmed == TERMINAL_SENTINEL {
        return DecodedFrame::Terminal;
    }

    let value = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => value,
        Err(error) => return DecodedFrame::Malformed(format!("frame is not json: {error}")),
    };

    let Value::Object(object) = value else {
        return DecodedFrame::Malformed("frame is not a json object".to_string());
    };

    if !KNOWN_FIELDS.iter().any(|field| object.contains_key(*field)) {
        return DecodedFrame::Malformed("frame carries no known fields".to_string());
    }

    if let Some(message) = error_message(&object) {
        return DecodedFrame::ErrorSignal(message);
    }

    let frame = match serde_json::from_value::<WireFrame>(Value::Object(object)) {
        Ok(frame) => frame,
        Err(error) => return DecodedFrame::Malformed(format!("frame has an invalid field: {error}")),
    };

    DecodedFrame::Events(frame_events(frame))
}

fn error_message(object: &Map<String, Value>) -> Option<String> {
    match object.get("error")? {
        Value::Null => None,
        Value::String(message) => Some(message.clone()),
        other => Some(other.to_string()),
    }
}

/// Blank ids are dropped like absent ones.
fn parse_id<T>(
    field: &'static str,
    raw: Option<&str>,
    parse: fn(&str) -> parley_storage::StorageResult<T>,
) -> Option<T> {
    match parse(raw?) {
        Ok(id) => Some(id),
        Err(error) => {
            tracing::debug!(field, error = %error, "ignoring unusable id in frame");
            None
        }
    }
}

fn frame_events(frame: WireFrame) -> Vec<StreamEvent> {
    let mut events = Vec::new();

    if let Some(stream_id) = frame.stream_id.filter(|id| !id.trim().is_empty()) {
        events.push(StreamEvent::StreamIdAssigned(stream_id));
    }

    let user_message_id = parse_id(
        "user_message_id",
        frame.user_message_id.as_deref(),
        MessageId::parse,
    );
    let bot_message_id = parse_id(
        "bot_message_id",
        frame.bot_message_id.as_deref(),
        MessageId::parse,
    );
    let conversation_id = parse_id(
        "conversation_id",
        frame.conversation_id.as_deref(),
        ConversationId::parse,
    );

    match conversation_id {
        Some(conversation_id) => events.push(StreamEvent::ConversationAssigned {
            conversation_id,
            user_message_id,
            bot_message_id,
        }),
        None => {
            if let (Some(user_message_id), Some(bot_message_id)) = (user_message_id, bot_message_id)
            {
                events.push(StreamEvent::MessageIdsAssigned {
                    user_message_id,
                    bot_message_id,
                });
            }
        }
    }

    if let Some(description) = frame.conversation_description {
        events.push(StreamEvent::ConversationDescription(description));
    }

    if let Some(tool_data) = frame.tool_data {
        events.push(StreamEvent::ToolData(ToolDataEntry::new(
            tool_data.tool_name,
            tool_data.data,
        )));
    }

    if let Some(tool_output) = frame.tool_output {
        match tool_output.tool_call_id.filter(|id| !id.trim().is_empty()) {
            Some(tool_call_id) => events.push(StreamEvent::ToolOutput {
                tool_call_id,
                output: tool_output.output,
            }),
            None => tracing::debug!("ignoring tool output without a tool call id"),
        }
    }

    if let Some(image_data) = frame.image_data {
        events.push(StreamEvent::ImageStatus(image_status(image_data)));
    }

    let side_channel = SideChannelUpdate {
        memory_data: frame.memory_data,
        follow_up_actions: frame.follow_up_actions,
        file_ids: frame.file_ids,
    };
    if !side_channel.is_empty() {
        events.push(StreamEvent::SideChannel(side_channel));
    }

    if let Some(delta) = frame.response.filter(|delta| !delta.is_empty()) {
        events.push(StreamEvent::ResponseDelta(delta));
    }

    if frame.main_response_complete == Some(true) {
        events.push(StreamEvent::CompletionSignal);
    }

    events
}

fn image_status(image_data: Value) -> ImageStatus {
    let generating = image_data
        .get("status")
        .and_then(Value::as_str)
        .is_some_and(|status| status == "generating");

    if generating {
        ImageStatus::Generating
    } else {
        ImageStatus::Ready(image_data)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn events(raw: &str) -> Vec<StreamEvent> {
        match decode_frame(raw) {
            DecodedFrame::Events(events) => events,
            other => panic!("expected events, got {other:?}"),
        }
    }

    #[test]
    fn sentinel_is_terminal_even_with_whitespace() {
        assert_eq!(decode_frame("[DONE]"), DecodedFrame::Terminal);
        assert_eq!(decode_frame("  [DONE]\n"), DecodedFrame::Terminal);
        assert!(DecodedFrame::Terminal.ends_session());
    }

    #[test]
    fn unparseable_frames_are_malformed() {
        assert!(matches!(decode_frame("{not json"), DecodedFrame::Malformed(_)));
        assert!(matches!(decode_frame("[1, 2]"), DecodedFrame::Malformed(_)));
        assert!(matches!(decode_frame(r#"{"unrelated": 1}"#), DecodedFrame::Malformed(_)));
        assert!(matches!(decode_frame(r#"{"response": 5}"#), DecodedFrame::Malformed(_)));
    }

    #[test]
    fn blank_ids_are_dropped_without_ending_the_session() {
        assert!(events(r#"{"conversation_id": "  "}"#).is_empty());
        assert!(events(r#"{"stream_id": "", "response": ""}"#).is_empty());
        assert_eq!(
            events(r#"{"conversation_id": "", "user_message_id": "u-1", "bot_message_id": "b-1"}"#),
            vec![StreamEvent::MessageIdsAssigned {
                user_message_id: MessageId::new("u-1"),
                bot_message_id: MessageId::new("b-1"),
            }]
        );
        assert!(
            events(r#"{"user_message_id": " ", "bot_message_id": "b-1", "response": ""}"#)
                .is_empty()
        );
    }

    #[test]
    fn tool_output_without_call_id_is_skipped() {
        assert_eq!(
            events(r#"{"tool_output": {"output": 1}, "response": "still here"}"#),
            vec![StreamEvent::ResponseDelta("still here".to_string())]
        );
        assert!(events(r#"{"tool_output": {"tool_call_id": "", "output": 1}}"#).is_empty());
    }

    #[test]
    fn error_field_wins_over_other_facets() {
        assert_eq!(
            decode_frame(r#"{"error": "quota exceeded", "response": "ignored"}"#),
            DecodedFrame::ErrorSignal("quota exceeded".to_string())
        );
        assert_eq!(
            decode_frame(r#"{"error": {"code": 429}}"#),
            DecodedFrame::ErrorSignal(r#"{"code":429}"#.to_string())
        );
        assert_eq!(
            events(r#"{"error": null, "response": "ok"}"#),
            vec![StreamEvent::ResponseDelta("ok".to_string())]
        );
    }

    #[test]
    fn all_facets_of_one_frame_are_exposed_in_order() {
        let decoded = events(
            r#"{
                "response": "Hi",
                "conversation_description": "Greetings",
                "stream_id": "s-1",
                "main_response_complete": true,
                "follow_up_actions": ["more"]
            }"#,
        );

        assert_eq!(
            decoded,
            vec![
                StreamEvent::StreamIdAssigned("s-1".to_string()),
                StreamEvent::ConversationDescription("Greetings".to_string()),
                StreamEvent::SideChannel(SideChannelUpdate {
                    follow_up_actions: Some(json!(["more"])),
                    ..SideChannelUpdate::default()
                }),
                StreamEvent::ResponseDelta("Hi".to_string()),
                StreamEvent::CompletionSignal,
            ]
        );
    }

    #[test]
    fn message_ids_ride_with_conversation_when_present() {
        let decoded = events(
            r#"{"conversation_id": "c-1", "user_message_id": "u-1", "bot_message_id": "b-1"}"#,
        );
        assert_eq!(
            decoded,
            vec![StreamEvent::ConversationAssigned {
                conversation_id: ConversationId::new("c-1"),
                user_message_id: Some(MessageId::new("u-1")),
                bot_message_id: Some(MessageId::new("b-1")),
            }]
        );

        let decoded = events(r#"{"user_message_id": "u-2", "bot_message_id": "b-2"}"#);
        assert_eq!(
            decoded,
            vec![StreamEvent::MessageIdsAssigned {
                user_message_id: MessageId::new("u-2"),
                bot_message_id: MessageId::new("b-2"),
            }]
        );
    }

    #[test]
    fn lone_message_id_without_conversation_yields_nothing() {
        assert!(events(r#"{"user_message_id": "u-3"}"#).is_empty());
    }

    #[test]
    fn image_data_distinguishes_generating_from_ready() {
        assert_eq!(
            events(r#"{"image_data": {"status": "generating"}}"#),
            vec![StreamEvent::ImageStatus(ImageStatus::Generating)]
        );
        assert_eq!(
            events(r#"{"image_data": {"url": "https://img/1.png"}}"#),
            vec![StreamEvent::ImageStatus(ImageStatus::Ready(
                json!({"url": "https://img/1.png"})
            ))]
        );
    }

    #[test]
    fn tool_frames_decode_into_entries_and_outputs() {
        assert_eq!(
            events(r#"{"tool_data": {"tool_name": "search", "data": {"tool_call_id": "c-1"}}}"#),
            vec![StreamEvent::ToolData(ToolDataEntry::new(
                "search",
                json!({"tool_call_id": "c-1"})
            ))]
        );
        assert_eq!(
            events(r#"{"tool_output": {"tool_call_id": "c-1", "output": [1]}}"#),
            vec![StreamEvent::ToolOutput {
                tool_call_id: "c-1".to_string(),
                output: json!([1]),
            }]
        );
    }
}
