//! 消息转换层
//!
//! 将上游不同形状的响应统一为 `LiveEvent`，再生成客户端帧。
//!
//! ```text
//! translator/
//! ├── events.rs   # LiveEvent 中间表示
//! ├── traits.rs   # 转换器 trait
//! ├── live.rs     # 上游消息解析 + 客户端帧生成
//! └── relay.rs    # 单轮对话出口（保证顺序与单次聚合）
//! ```

pub mod events;
pub mod live;
pub mod relay;
pub mod traits;

pub use events::LiveEvent;
pub use live::{
    extract_text_fragments, is_completion, is_setup_ack, ClientFrameGenerator,
    LiveTurnTranslator,
};
pub use relay::TurnRelay;
pub use traits::ResponseTranslator;
