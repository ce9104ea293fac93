//! Agent 错误类型与对话上的终止错误
//!
//! 与 ErrorClassifier 配合：AgentError 经分类后决定静默结束、重试鉴权，还是把 ChatError 挂到对话上。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;

/// 回合编排过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Recursion depth exceeded ({0})")]
    RecursionDepthExceeded(usize),

    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    /// 已有 Run 在执行时拒绝再次进入
    #[error("Agent is busy")]
    Busy,

    #[error("Undo failed for {tool_call_id}: {reason}")]
    UndoFailed { tool_call_id: String, reason: String },
}

/// 分类后的错误种类（封闭集合）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Aborted,
    PlanLimitExceeded,
    AuthenticationExpired,
    ContextWindowExceeded,
    InsufficientCredits,
    Generic,
}

/// 附着在对话上的终止错误，供 UI 展示
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatError {
    pub kind: ErrorKind,
    pub message: String,
    /// PlanLimitExceeded 的冷却秒数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
}

impl ChatError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cooldown_secs: None,
            plan: None,
        }
    }
}
