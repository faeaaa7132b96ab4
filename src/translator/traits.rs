//! 响应转换器 Trait 定义
//!
//! 将 `LiveEvent` 转换为目标协议的输出帧

use super::events::LiveEvent;

/// 响应转换器 Trait
pub trait ResponseTranslator {
    /// 目标输出类型
    type Output;

    /// 转换单个事件
    ///
    /// 返回 `None` 表示该事件不需要输出
    fn translate_event(&mut self, event: &LiveEvent) -> Option<Self::Output>;

    /// 重置转换器状态
    fn reset(&mut self);
}
