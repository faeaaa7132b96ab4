//! 关闭事件分类与决策表
//!
//! `(CloseClass, setup 是否已确认) -> NextAction`，与传输层无关，可单独测试。
//! 上游只通过人类可读的关闭原因表达失败类型，分类依赖关键词匹配。

use serde::Serialize;

/// WebSocket 关闭码：连接异常断开（未收到关闭帧）
pub const CLOSE_ABNORMAL: u16 = 1006;
/// WebSocket 关闭码：负载无效
pub const CLOSE_INVALID_PAYLOAD: u16 = 1007;
/// WebSocket 关闭码：策略违规
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// 模型不存在
pub const MODEL_NOT_FOUND_KEYWORDS: &[&str] = &["not found"];
/// 无权限
pub const PERMISSION_DENIED_KEYWORDS: &[&str] = &["permission denied"];
/// 资源标识无效
pub const INVALID_RESOURCE_KEYWORDS: &[&str] = &["invalid resource field value", "invalid resource"];
/// 内容信封字段未知
pub const UNKNOWN_FIELD_KEYWORDS: &[&str] = &["unknown name", "cannot find field", "unknown field"];

/// 上游关闭信号
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloseSignal {
    pub code: u16,
    pub reason: String,
    /// 本次连接是否收到过 setup 确认
    pub setup_acknowledged: bool,
    /// 本次连接是否已收到回答文本
    pub received_text: bool,
}

/// 关闭原因类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseClass {
    ModelNotFound,
    PermissionDenied,
    InvalidResource,
    UnknownContentField,
    Other,
}

impl CloseClass {
    /// 按关闭原因分类（大小写不敏感）
    pub fn classify(reason: &str) -> Self {
        let lower = reason.to_lowercase();
        let contains_any = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

        if contains_any(PERMISSION_DENIED_KEYWORDS) {
            CloseClass::PermissionDenied
        } else if contains_any(INVALID_RESOURCE_KEYWORDS) {
            CloseClass::InvalidResource
        } else if contains_any(UNKNOWN_FIELD_KEYWORDS) {
            CloseClass::UnknownContentField
        } else if contains_any(MODEL_NOT_FOUND_KEYWORDS) {
            CloseClass::ModelNotFound
        } else {
            CloseClass::Other
        }
    }

    /// 是否为模型标识层面的拒绝
    pub fn is_model_rejection(&self) -> bool {
        matches!(
            self,
            CloseClass::ModelNotFound | CloseClass::PermissionDenied | CloseClass::InvalidResource
        )
    }
}

/// 下一步动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NextAction {
    /// 已收到回答，视为成功
    Accept,
    /// 换下一个模型名格式，内容格式归零
    AdvanceModelFormat,
    /// 只换内容格式
    AdvanceContentFormat,
    /// 放弃当前模型名，交给编排器
    Escalate,
}

/// 决策表
pub fn decide(class: CloseClass, setup_acknowledged: bool, received_text: bool) -> NextAction {
    if received_text {
        return NextAction::Accept;
    }
    match (class, setup_acknowledged) {
        (c, false) if c.is_model_rejection() => NextAction::AdvanceModelFormat,
        (CloseClass::UnknownContentField, true) => NextAction::AdvanceContentFormat,
        _ => NextAction::Escalate,
    }
}

impl CloseSignal {
    pub fn class(&self) -> CloseClass {
        CloseClass::classify(&self.reason)
    }

    pub fn next_action(&self) -> NextAction {
        decide(self.class(), self.setup_acknowledged, self.received_text)
    }
}
