use parley_storage::{MessagePatch, MessageRecord, MessageStatus, ToolDataEntry};
use serde_json::{Value, json};

use super::events::{ImageStatus, SideChannelUpdate, StreamEvent};

/// Loading affordances the accumulator drives but does not own.
pub trait LoadingIndicator: Send + Sync {
    fn set_loading(&self, loading: bool);
    fn set_loading_text(&self, text: Option<String>);
}

/// Everything an assistant message carries besides its text.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SideChannel {
    pub tool_data: Vec<ToolDataEntry>,
    pub image_data: Option<Value>,
    pub memory_data: Option<Value>,
    pub follow_up_actions: Option<Value>,
    pub file_ids: Option<Vec<String>>,
}

impl SideChannel {
    /// Overwrites only the fields the update carries.
    pub fn merge(&mut self, update: SideChannelUpdate) {
        if let Some(memory_data) = update.memory_data {
            self.memory_data = Some(memory_data);
        }
        if let Some(follow_up_actions) = update.follow_up_actions {
            self.follow_up_actions = Some(follow_up_actions);
        }
        if let Some(file_ids) = update.file_ids {
            self.file_ids = Some(file_ids);
        }
    }
}

/// Folds stream events into one growing assistant message.
#[derive(Debug, Clone, Default)]
pub struct MessageAccumulator {
    text: String,
    side_channel: SideChannel,
    image_pending: bool,
}

impl MessageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn side_channel(&self) -> &SideChannel {
        &self.side_channel
    }

    pub fn is_image_pending(&self) -> bool {
        self.image_pending
    }

    /// Applies one event; returns true when the message snapshot changed.
    pub fn apply<I>(&mut self, event: &StreamEvent, indicator: &I) -> bool
    where
        I: LoadingIndicator + ?Sized,
    {
        match event {
            StreamEvent::ResponseDelta(delta) => {
                self.text.push_str(delta);
                true
            }
            StreamEvent::ToolData(entry) => {
                if let Some(caption) = entry.caption() {
                    indicator.set_loading_text(Some(caption.to_string()));
                }
                self.side_channel.tool_data.push(entry.clone());
                true
            }
            StreamEvent::ToolOutput {
                tool_call_id,
                output,
            } => self.attach_tool_output(tool_call_id, output),
            StreamEvent::ImageStatus(ImageStatus::Generating) => {
                self.text.clear();
                self.side_channel.image_data = Some(json!({ "status": "generating" }));
                self.image_pending = true;
                indicator.set_loading(true);
                true
            }
            StreamEvent::ImageStatus(ImageStatus::Ready(image_data)) => {
                self.side_channel.image_data = Some(image_data.clone());
                self.image_pending = false;
                indicator.set_loading(false);
                true
            }
            StreamEvent::SideChannel(update) => {
                self.side_channel.merge(update.clone());
                true
            }
            StreamEvent::StreamIdAssigned(_)
            | StreamEvent::ConversationAssigned { .. }
            | StreamEvent::MessageIdsAssigned { .. }
            | StreamEvent::ConversationDescription(_)
            | StreamEvent::CompletionSignal => false,
        }
    }

    fn attach_tool_output(&mut self, tool_call_id: &str, output: &Value) -> bool {
        let Some(entry) = self
            .side_channel
            .tool_data
            .iter_mut()
            .find(|entry| entry.tool_call_id() == Some(tool_call_id))
        else {
            tracing::debug!(tool_call_id, "tool output has no matching tool entry");
            return false;
        };

        match entry.data.as_object_mut() {
            Some(data) => {
                data.insert("output".to_string(), output.clone());
                true
            }
            None => false,
        }
    }

    /// Writes text and side channel into a record, leaving identity and timestamps alone.
    pub fn snapshot_into(&self, record: &mut MessageRecord) {
        record.content = self.text.clone();
        record.tool_data = self.side_channel.tool_data.clone();
        if let Some(image_data) = &self.side_channel.image_data {
            record.image_data = Some(image_data.clone());
        }
        if let Some(memory_data) = &self.side_channel.memory_data {
            record.memory_data = Some(memory_data.clone());
        }
        if let Some(follow_up_actions) = &self.side_channel.follow_up_actions {
            record.follow_up_actions = Some(follow_up_actions.clone());
        }
        if let Some(file_ids) = &self.side_channel.file_ids {
            record.file_ids = file_ids.clone();
        }
    }

    /// Patch for the single durable write at the end of a completed stream.
    pub fn final_patch(&self) -> MessagePatch {
        MessagePatch {
            content: Some(self.text.clone()),
            status: Some(MessageStatus::Sent),
            file_ids: self.side_channel.file_ids.clone(),
            tool_data: Some(self.side_channel.tool_data.clone()),
            image_data: self.side_channel.image_data.clone(),
            memory_data: self.side_channel.memory_data.clone(),
            follow_up_actions: self.side_channel.follow_up_actions.clone(),
            pinned: None,
        }
    }

    /// Patch used when a stream stops early: text and status only.
    pub fn partial_patch(&self) -> MessagePatch {
        MessagePatch::content_and_status(self.text.clone(), MessageStatus::Sent)
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use parley_storage::{ConversationId, MessageId};

    use super::*;

    #[derive(Default)]
    struct RecordingIndicator {
        loading: Mutex<Vec<bool>>,
        texts: Mutex<Vec<Option<String>>>,
    }

    impl LoadingIndicator for RecordingIndicator {
        fn set_loading(&self, loading: bool) {
            self.loading.lock().push(loading);
        }

        fn set_loading_text(&self, text: Option<String>) {
            self.texts.lock().push(text);
        }
    }

    fn tool(name: &str, data: Value) -> StreamEvent {
        StreamEvent::ToolData(ToolDataEntry::new(name, data))
    }

    #[test]
    fn deltas_concatenate_in_order() {
        let indicator = RecordingIndicator::default();
        let mut accumulator = MessageAccumulator::new();
        for delta in ["Hi", " ", "there"] {
            accumulator.apply(&StreamEvent::ResponseDelta(delta.to_string()), &indicator);
        }
        assert_eq!(accumulator.text(), "Hi there");
    }

    #[test]
    fn tool_entries_keep_arrival_order_and_outputs_hit_one_match() {
        let indicator = RecordingIndicator::default();
        let mut accumulator = MessageAccumulator::new();
        accumulator.apply(&tool("search", json!({"tool_call_id": "a"})), &indicator);
        accumulator.apply(&tool("fetch", json!({"tool_call_id": "b"})), &indicator);
        accumulator.apply(&tool("note", json!({})), &indicator);

        let changed = accumulator.apply(
            &StreamEvent::ToolOutput {
                tool_call_id: "b".to_string(),
                output: json!({"pages": 2}),
            },
            &indicator,
        );
        assert!(changed);

        let missing = accumulator.apply(
            &StreamEvent::ToolOutput {
                tool_call_id: "zzz".to_string(),
                output: json!(1),
            },
            &indicator,
        );
        assert!(!missing);

        let tool_data = &accumulator.side_channel().tool_data;
        let names = tool_data.iter().map(|entry| entry.tool_name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["search", "fetch", "note"]);
        assert_eq!(tool_data[0].data.get("output"), None);
        assert_eq!(tool_data[1].data["output"], json!({"pages": 2}));
        assert_eq!(tool_data[2].data, json!({}));
    }

    #[test]
    fn tool_captions_surface_as_loading_text() {
        let indicator = RecordingIndicator::default();
        let mut accumulator = MessageAccumulator::new();
        accumulator.apply(&tool("search", json!({"message": "Searching the web"})), &indicator);
        accumulator.apply(&tool("silent", json!({"message": ""})), &indicator);

        assert_eq!(
            *indicator.texts.lock(),
            vec![Some("Searching the web".to_string())]
        );
    }

    #[test]
    fn text_updates_never_clear_side_channel() {
        let indicator = RecordingIndicator::default();
        let mut accumulator = MessageAccumulator::new();
        accumulator.apply(&tool("search", json!({"tool_call_id": "a"})), &indicator);
        accumulator.apply(
            &StreamEvent::ImageStatus(ImageStatus::Ready(json!({"url": "https://img"}))),
            &indicator,
        );
        accumulator.apply(&StreamEvent::ResponseDelta("X".to_string()), &indicator);
        accumulator.apply(
            &StreamEvent::SideChannel(SideChannelUpdate {
                memory_data: Some(json!({"remembered": true})),
                ..SideChannelUpdate::default()
            }),
            &indicator,
        );

        let side_channel = accumulator.side_channel();
        assert_eq!(side_channel.tool_data.len(), 1);
        assert_eq!(side_channel.image_data, Some(json!({"url": "https://img"})));
        assert_eq!(side_channel.memory_data, Some(json!({"remembered": true})));
    }

    #[test]
    fn image_generation_clears_text_then_settles() {
        let indicator = RecordingIndicator::default();
        let mut accumulator = MessageAccumulator::new();
        accumulator.apply(&StreamEvent::ResponseDelta("Drawing".to_string()), &indicator);
        accumulator.apply(&StreamEvent::ImageStatus(ImageStatus::Generating), &indicator);

        assert_eq!(accumulator.text(), "");
        assert!(accumulator.is_image_pending());
        assert_eq!(
            accumulator.side_channel().image_data,
            Some(json!({"status": "generating"}))
        );

        accumulator.apply(
            &StreamEvent::ImageStatus(ImageStatus::Ready(json!({"url": "https://img/2"}))),
            &indicator,
        );
        assert!(!accumulator.is_image_pending());
        assert_eq!(
            accumulator.side_channel().image_data,
            Some(json!({"url": "https://img/2"}))
        );
        assert_eq!(*indicator.loading.lock(), vec![true, false]);
    }

    #[test]
    fn snapshot_keeps_identity_and_timestamps() {
        let indicator = RecordingIndicator::default();
        let mut accumulator = MessageAccumulator::new();
        accumulator.apply(&StreamEvent::ResponseDelta("Hello".to_string()), &indicator);

        let mut record = MessageRecord::assistant_shell(
            MessageId::new("b-1"),
            ConversationId::new("c-1"),
            41,
        );
        record.memory_data = Some(json!({"kept": true}));
        accumulator.snapshot_into(&mut record);

        assert_eq!(record.id.as_str(), "b-1");
        assert_eq!(record.created_at_unix_ms, 41);
        assert_eq!(record.content, "Hello");
        assert_eq!(record.memory_data, Some(json!({"kept": true})));
    }
}
