//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：complete（非流式，用于标题等辅助调用）、
//! stream_completion（流式文本 + 工具调用，可被取消令牌中断）。

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::llm::{CompletionRequest, CompletionStream, LlmMessage};

/// 后端抛出的类型化错误，由 ErrorClassifier 归类
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Request aborted")]
    Aborted,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// 套餐用量限制（带冷却时间与套餐名）
    #[error("Usage limit reached for plan {plan:?}, retry after {retry_after_secs}s")]
    RateLimited {
        retry_after_secs: u64,
        plan: Option<String>,
    },

    #[error("Context length exceeded: {0}")]
    ContextLengthExceeded(String),

    #[error("Insufficient credits: {0}")]
    InsufficientCredits(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Stream error: {0}")]
    Stream(String),
}

/// LLM 客户端 trait：非流式完成与流式完成（返回事件流）
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成，返回文本
    async fn complete(&self, messages: &[LlmMessage]) -> Result<String, LlmError>;

    /// 流式完成；cancel 触发后流应尽快以 LlmError::Aborted 结束
    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionStream, LlmError>;
}
