//! 错误分类器
//!
//! 纯函数：把后端 / 编排过程中的错误映射为封闭的 ErrorKind 集合，并给出是否可重试与附带数据。
//! 不做任何副作用，重试与状态写入由 TurnOrchestrator 负责。

use std::time::Duration;

use crate::core::{AgentError, ChatError, ErrorKind};
use crate::llm::LlmError;

/// 分类结果附带的数据
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorPayload {
    None,
    PlanLimit {
        cooldown: Duration,
        plan: Option<String>,
    },
    Message(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub payload: ErrorPayload,
}

impl Classification {
    fn new(kind: ErrorKind, payload: ErrorPayload) -> Self {
        Self {
            kind,
            retryable: kind == ErrorKind::AuthenticationExpired,
            payload,
        }
    }

    /// 终止性错误在对话上的展示形式；Aborted 不展示
    pub fn to_chat_error(&self) -> Option<ChatError> {
        let message = match (&self.kind, &self.payload) {
            (ErrorKind::Aborted, _) => return None,
            (ErrorKind::PlanLimitExceeded, ErrorPayload::PlanLimit { cooldown, plan }) => {
                let mut err = ChatError::new(
                    self.kind,
                    format!(
                        "Usage limit reached{}. Try again in {}.",
                        plan.as_deref().map(|p| format!(" for the {p} plan")).unwrap_or_default(),
                        format_cooldown(*cooldown)
                    ),
                );
                err.cooldown_secs = Some(cooldown.as_secs());
                err.plan = plan.clone();
                return Some(err);
            }
            (ErrorKind::PlanLimitExceeded, _) => "Usage limit reached.".to_string(),
            (ErrorKind::AuthenticationExpired, _) => {
                "Authentication expired. Please restart the application and sign in again."
                    .to_string()
            }
            (ErrorKind::ContextWindowExceeded, _) => {
                "This conversation is too long for the model. Please start a new chat.".to_string()
            }
            (ErrorKind::InsufficientCredits, _) => {
                "Insufficient credits. Please top up your account to continue.".to_string()
            }
            (ErrorKind::Generic, ErrorPayload::Message(m)) => m.clone(),
            (ErrorKind::Generic, _) => "Unknown error".to_string(),
        };
        Some(ChatError::new(self.kind, message))
    }
}

fn format_cooldown(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

/// 无状态分类器
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn classify(err: &AgentError) -> Classification {
        match err {
            AgentError::Llm(e) => Self::classify_llm(e),
            AgentError::Cancelled => Classification::new(ErrorKind::Aborted, ErrorPayload::None),
            other => Classification::new(
                ErrorKind::Generic,
                ErrorPayload::Message(describe(other)),
            ),
        }
    }

    pub fn classify_llm(err: &LlmError) -> Classification {
        use ErrorKind::*;
        match err {
            LlmError::Aborted => Classification::new(Aborted, ErrorPayload::None),
            LlmError::Unauthorized(_) => Classification::new(AuthenticationExpired, ErrorPayload::None),
            LlmError::RateLimited {
                retry_after_secs,
                plan,
            } => Classification::new(
                PlanLimitExceeded,
                ErrorPayload::PlanLimit {
                    cooldown: Duration::from_secs(*retry_after_secs),
                    plan: plan.clone(),
                },
            ),
            LlmError::ContextLengthExceeded(_) => {
                Classification::new(ContextWindowExceeded, ErrorPayload::None)
            }
            LlmError::InsufficientCredits(_) => {
                Classification::new(InsufficientCredits, ErrorPayload::None)
            }
            LlmError::Http { status, body } => Self::classify_http(*status, body, err),
            other => Classification::new(Generic, ErrorPayload::Message(describe(other))),
        }
    }

    /// 未被后端类型化的 HTTP 失败：按状态码与正文特征归类
    fn classify_http(status: u16, body: &str, err: &LlmError) -> Classification {
        let lower = body.to_lowercase();
        let kind = if status == 401 || status == 403 {
            ErrorKind::AuthenticationExpired
        } else if status == 402 || lower.contains("insufficient_quota") || lower.contains("credit") {
            ErrorKind::InsufficientCredits
        } else if lower.contains("context_length_exceeded") || lower.contains("maximum context length") {
            ErrorKind::ContextWindowExceeded
        } else if status == 429 && (lower.contains("plan") || lower.contains("usage limit")) {
            return Classification::new(
                ErrorKind::PlanLimitExceeded,
                ErrorPayload::PlanLimit {
                    cooldown: Duration::from_secs(60),
                    plan: None,
                },
            );
        } else {
            ErrorKind::Generic
        };
        let payload = if kind == ErrorKind::Generic {
            ErrorPayload::Message(describe(err))
        } else {
            ErrorPayload::None
        };
        Classification::new(kind, payload)
    }
}

/// 错误及其 source 链拼成一行
fn describe(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(s) = source {
        text.push_str(": ");
        text.push_str(&s.to_string());
        source = s.source();
    }
    text
}
