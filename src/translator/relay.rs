//! 单轮对话的客户端出口
//!
//! 所有帧经同一个 mpsc 通道写出，保证到达顺序；
//! 聚合消息总在该轮所有增量之后发送

use super::events::LiveEvent;
use super::live::{ClientFrameGenerator, LiveTurnTranslator};
use super::traits::ResponseTranslator;
use crate::models::ClientFrame;
use serde_json::Value;
use tokio::sync::mpsc;

/// 单轮对话中继
pub struct TurnRelay {
    translator: LiveTurnTranslator,
    generator: ClientFrameGenerator,
    sink: mpsc::UnboundedSender<ClientFrame>,
    frames_sent: usize,
}

impl TurnRelay {
    pub fn new(sink: mpsc::UnboundedSender<ClientFrame>) -> Self {
        Self {
            translator: LiveTurnTranslator::new(),
            generator: ClientFrameGenerator::new(),
            sink,
            frames_sent: 0,
        }
    }

    fn emit(&mut self, events: Vec<LiveEvent>) {
        for event in events {
            if let Some(frame) = self.generator.translate_event(&event) {
                if self.sink.send(ClientFrame::Json(frame)).is_err() {
                    tracing::debug!("[RELAY] 客户端通道已关闭，丢弃帧");
                    continue;
                }
                self.frames_sent += 1;
            }
        }
    }

    /// 处理上游原始消息，返回本条是否触发了完成
    pub fn upstream_message(&mut self, message: &Value) -> bool {
        let events = self.translator.on_upstream(message);
        let completed = events.iter().any(LiveEvent::is_turn_complete);
        self.emit(events);
        completed
    }

    /// 处理文本增量
    pub fn text_chunk(&mut self, text: &str) {
        let events = self.translator.on_text_chunk(text);
        self.emit(events);
    }

    /// 结束本轮；已交付过时不再发送
    pub fn complete(&mut self, text: Option<String>) -> bool {
        match self.translator.finish(text) {
            Some(event) => {
                self.emit(vec![event]);
                true
            }
            None => false,
        }
    }

    /// 开始新一次上游尝试
    pub fn begin_attempt(&mut self) {
        self.translator.begin_attempt();
    }

    pub fn is_delivered(&self) -> bool {
        self.translator.is_delivered()
    }

    pub fn text(&self) -> &str {
        self.translator.text()
    }

    pub fn frames_sent(&self) -> usize {
        self.frames_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(rx: &mut mpsc::UnboundedReceiver<ClientFrame>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(ClientFrame::Json(value)) = rx.try_recv() {
            frames.push(value);
        }
        frames
    }

    #[test]
    fn test_frames_keep_arrival_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut relay = TurnRelay::new(tx);

        relay.text_chunk("Hello ");
        relay.text_chunk("world");
        assert!(relay.complete(None));
        assert!(!relay.complete(Some("again".into())));

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0]["serverContent"]["parts"][0]["text"], "Hello ");
        assert_eq!(frames[1]["serverContent"]["parts"][0]["text"], "world");
        assert_eq!(
            frames[2]["serverContent"]["modelTurn"]["parts"][0]["text"],
            "Hello world"
        );
        assert_eq!(relay.frames_sent(), 3);
    }

    #[test]
    fn test_upstream_completion_is_reported_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut relay = TurnRelay::new(tx);

        assert!(!relay.upstream_message(&json!({"serverContent": {"parts": [{"text": "x"}]}})));
        assert!(relay.upstream_message(&json!({"serverContent": {"turnComplete": true}})));
        assert!(!relay.upstream_message(&json!({"done": true})));
        assert!(relay.is_delivered());

        let aggregates = drain(&mut rx)
            .into_iter()
            .filter(|f| f["serverContent"]["modelTurn"].is_object())
            .count();
        assert_eq!(aggregates, 1);
    }

    #[test]
    fn test_closed_sink_is_tolerated() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut relay = TurnRelay::new(tx);
        relay.text_chunk("nobody listening");
        assert!(relay.complete(None));
        assert_eq!(relay.frames_sent(), 0);
    }
}
