//! Live 上游消息转换
//!
//! 上游的回答文本可能位于 `serverContent.modelTurn.parts[]`，
//! 也可能是扁平的 `serverContent.parts[]`。先查嵌套形状，
//! 嵌套形状没有文本时再查扁平形状。
//!
//! 完成信号为 `serverContent.turnComplete` 或旧版顶层 `done`，
//! 聚合消息只发送一次。

use super::events::LiveEvent;
use super::traits::ResponseTranslator;
use crate::models::live_model::{text_chunk_message, turn_complete_message};
use serde_json::Value;

/// 是否为上游 setup 确认
pub fn is_setup_ack(message: &Value) -> bool {
    message.get("setupComplete").is_some()
        || message.get("BidiGenerateContentSetupComplete").is_some()
}

/// 是否为完成信号
pub fn is_completion(message: &Value) -> bool {
    let turn_complete = message
        .get("serverContent")
        .and_then(|c| c.get("turnComplete"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let done = message.get("done").and_then(Value::as_bool).unwrap_or(false);
    turn_complete || done
}

fn collect_texts(parts: Option<&Value>) -> Vec<String> {
    parts
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// 提取消息中的文本片段（嵌套优先）
pub fn extract_text_fragments(message: &Value) -> Vec<String> {
    let Some(content) = message.get("serverContent") else {
        return Vec::new();
    };
    let nested = collect_texts(content.get("modelTurn").and_then(|turn| turn.get("parts")));
    if !nested.is_empty() {
        return nested;
    }
    collect_texts(content.get("parts"))
}

/// 去掉完成标记后的转发副本；没有剩余内容时返回 None
fn strip_completion(message: &Value) -> Option<Value> {
    let mut copy = message.clone();
    if !copy.is_object() {
        return Some(copy);
    }
    let object = copy.as_object_mut()?;
    object.remove("done");
    if let Some(content) = object.get_mut("serverContent").and_then(Value::as_object_mut) {
        content.remove("turnComplete");
        if content.is_empty() {
            object.remove("serverContent");
        }
    }
    if object.is_empty() {
        None
    } else {
        Some(copy)
    }
}

/// 单轮对话的上游消息转换器
#[derive(Debug, Default)]
pub struct LiveTurnTranslator {
    buffer: String,
    delivered: bool,
}

impl LiveTurnTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 处理一条上游原始消息
    ///
    /// setup 确认不转发（网关已回复过）；交付之后的消息也不再转发。
    /// 其他消息去掉完成标记后转发，遇到完成信号时追加一次聚合事件，
    /// 客户端因此只会看到一个 turnComplete
    pub fn on_upstream(&mut self, message: &Value) -> Vec<LiveEvent> {
        if is_setup_ack(message) || self.delivered {
            return Vec::new();
        }

        let mut events: Vec<LiveEvent> = strip_completion(message)
            .map(LiveEvent::Forward)
            .into_iter()
            .collect();
        for fragment in extract_text_fragments(message) {
            self.buffer.push_str(&fragment);
        }
        if is_completion(message) {
            if let Some(event) = self.finish(None) {
                events.push(event);
            }
        }
        events
    }

    /// 处理纯文本增量
    pub fn on_text_chunk(&mut self, text: &str) -> Vec<LiveEvent> {
        if self.delivered || text.is_empty() {
            return Vec::new();
        }
        self.buffer.push_str(text);
        vec![LiveEvent::TextDelta {
            text: text.to_string(),
        }]
    }

    /// 产生聚合事件；已交付过则返回 None
    ///
    /// `text` 提供时以其为最终文本，否则使用累积缓冲
    pub fn finish(&mut self, text: Option<String>) -> Option<LiveEvent> {
        if self.delivered {
            return None;
        }
        self.delivered = true;
        if let Some(text) = text {
            self.buffer = text;
        }
        Some(LiveEvent::TurnComplete {
            text: self.buffer.clone(),
        })
    }

    /// 开始新一次上游尝试：未交付时清空缓冲
    pub fn begin_attempt(&mut self) {
        if !self.delivered {
            self.buffer.clear();
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered
    }

    pub fn text(&self) -> &str {
        &self.buffer
    }
}

/// 将事件转换为客户端 JSON 帧
#[derive(Debug, Default)]
pub struct ClientFrameGenerator {
    completed: bool,
}

impl ClientFrameGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResponseTranslator for ClientFrameGenerator {
    type Output = Value;

    fn translate_event(&mut self, event: &LiveEvent) -> Option<Value> {
        match event {
            LiveEvent::Forward(message) => Some(message.clone()),
            LiveEvent::TextDelta { text } => Some(text_chunk_message(text)),
            LiveEvent::TurnComplete { text } => {
                if self.completed {
                    return None;
                }
                self.completed = true;
                Some(turn_complete_message(text))
            }
        }
    }

    fn reset(&mut self) {
        self.completed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn finals(events: &[LiveEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                LiveEvent::TurnComplete { text } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_chunks_then_turn_complete_then_done() {
        let mut translator = LiveTurnTranslator::new();
        let mut events = Vec::new();
        events.extend(translator.on_upstream(&json!({
            "serverContent": {"modelTurn": {"parts": [{"text": "Hello "}]}}
        })));
        events.extend(translator.on_upstream(&json!({
            "serverContent": {"parts": [{"text": "world"}]}
        })));
        events.extend(translator.on_upstream(&json!({
            "serverContent": {"turnComplete": true}
        })));
        events.extend(translator.on_upstream(&json!({"done": true})));

        assert_eq!(finals(&events), vec!["Hello world"]);
        // 只有带内容的消息被转发，完成标记不外泄
        let forwards: Vec<&Value> = events
            .iter()
            .filter_map(|e| match e {
                LiveEvent::Forward(message) => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(forwards.len(), 2);
        assert!(forwards.iter().all(|m| !is_completion(m)));
    }

    #[test]
    fn test_forwarded_copy_drops_completion_flag() {
        let mut translator = LiveTurnTranslator::new();
        let events = translator.on_upstream(&json!({
            "serverContent": {"modelTurn": {"parts": [{"text": "hi"}]}, "turnComplete": true}
        }));
        assert_eq!(events.len(), 2);
        match &events[0] {
            LiveEvent::Forward(message) => {
                assert!(message["serverContent"].get("turnComplete").is_none());
                assert_eq!(message["serverContent"]["modelTurn"]["parts"][0]["text"], "hi");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(translator.on_upstream(&json!({"serverContent": {"parts": [{"text": "late"}]}})).is_empty());
    }

    #[test]
    fn test_nested_shape_wins_over_flat() {
        let message = json!({
            "serverContent": {
                "modelTurn": {"parts": [{"text": "nested"}]},
                "parts": [{"text": "flat"}]
            }
        });
        assert_eq!(extract_text_fragments(&message), vec!["nested"]);

        let message = json!({
            "serverContent": {
                "modelTurn": {"parts": [{"inlineData": {}}]},
                "parts": [{"text": "flat"}]
            }
        });
        assert_eq!(extract_text_fragments(&message), vec!["flat"]);
    }

    #[test]
    fn test_setup_ack_is_not_forwarded() {
        let mut translator = LiveTurnTranslator::new();
        assert!(translator
            .on_upstream(&json!({"setupComplete": {}}))
            .is_empty());
        assert!(translator
            .on_upstream(&json!({"BidiGenerateContentSetupComplete": true}))
            .is_empty());
    }

    #[test]
    fn test_completion_in_same_message_as_text() {
        let mut translator = LiveTurnTranslator::new();
        let events = translator.on_upstream(&json!({
            "serverContent": {"modelTurn": {"parts": [{"text": "one shot"}]}, "turnComplete": true}
        }));
        assert_eq!(finals(&events), vec!["one shot"]);
        assert!(translator.is_delivered());
    }

    #[test]
    fn test_legacy_done_alone_completes() {
        let mut translator = LiveTurnTranslator::new();
        translator.on_upstream(&json!({"serverContent": {"parts": [{"text": "abc"}]}}));
        let events = translator.on_upstream(&json!({"done": true}));
        assert_eq!(finals(&events), vec!["abc"]);
    }

    #[test]
    fn test_text_chunks_and_override() {
        let mut translator = LiveTurnTranslator::new();
        assert_eq!(translator.on_text_chunk("Hel").len(), 1);
        assert!(translator.on_text_chunk("").is_empty());
        translator.on_text_chunk("lo");
        assert_eq!(translator.text(), "Hello");
        assert_eq!(
            translator.finish(Some("Hello!".into())),
            Some(LiveEvent::TurnComplete {
                text: "Hello!".into()
            })
        );
        assert_eq!(translator.finish(None), None);
        assert!(translator.on_text_chunk("late").is_empty());
    }

    #[test]
    fn test_begin_attempt_resets_undelivered_buffer() {
        let mut translator = LiveTurnTranslator::new();
        translator.on_text_chunk("partial from failed attempt");
        translator.begin_attempt();
        assert_eq!(translator.text(), "");
        translator.on_text_chunk("fresh");
        assert_eq!(translator.finish(None), Some(LiveEvent::TurnComplete { text: "fresh".into() }));
    }

    #[test]
    fn test_empty_completion_still_aggregates() {
        let mut translator = LiveTurnTranslator::new();
        let events = translator.on_upstream(&json!({"serverContent": {"turnComplete": true}}));
        assert_eq!(finals(&events), vec![""]);
    }

    #[test]
    fn test_frame_generator() {
        let mut generator = ClientFrameGenerator::new();
        let delta = generator
            .translate_event(&LiveEvent::TextDelta { text: "hi".into() })
            .unwrap();
        assert_eq!(delta["serverContent"]["parts"][0]["text"], "hi");

        let done = LiveEvent::TurnComplete { text: "hi".into() };
        assert!(generator.translate_event(&done).is_some());
        assert!(generator.translate_event(&done).is_none());
        generator.reset();
        assert!(generator.translate_event(&done).is_some());
    }
}
