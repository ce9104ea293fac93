//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按脚本依次返回预设的流式响应或错误；脚本耗尽后回显最后一条 User 消息，便于本地跑通回合流程。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::llm::{
    CompletionRequest, CompletionStream, FinishReason, LlmClient, LlmError, LlmMessage, LlmRole,
    StreamEvent, Usage,
};

/// 一次 stream_completion 调用的脚本
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// 依次吐出事件后结束
    Events(Vec<StreamEvent>),
    /// 吐出事件后挂起，直到取消令牌触发（以 Aborted 结束）
    EventsThenHang(Vec<StreamEvent>),
    /// 建立流时直接失败
    Error(LlmError),
}

impl MockResponse {
    /// 纯文本回复
    pub fn text(text: &str) -> Self {
        Self::Events(vec![
            StreamEvent::TextDelta(text.to_string()),
            StreamEvent::Finish {
                reason: FinishReason::Stop,
                usage: None,
            },
        ])
    }

    /// 一次或多次工具调用：(call_id, tool_name, args)
    pub fn tool_calls(calls: &[(&str, &str, Value)]) -> Self {
        let mut events: Vec<StreamEvent> = calls
            .iter()
            .enumerate()
            .map(|(index, (id, name, args))| StreamEvent::ToolCallDelta {
                index,
                id: Some(id.to_string()),
                name: Some(name.to_string()),
                arguments_delta: args.to_string(),
            })
            .collect();
        events.push(StreamEvent::Finish {
            reason: FinishReason::ToolCalls,
            usage: Some(Usage {
                prompt_tokens: 100,
                completion_tokens: 20,
                total_tokens: 120,
            }),
        });
        Self::Events(events)
    }
}

/// Mock 客户端：脚本驱动，记录调用次数与收到的请求
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<MockResponse>>,
    completions: Mutex<VecDeque<Result<String, LlmError>>>,
    stream_calls: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(responses: impl IntoIterator<Item = MockResponse>) -> Self {
        let client = Self::new();
        client.push_all(responses);
        client
    }

    pub fn push(&self, response: MockResponse) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(response);
        }
    }

    pub fn push_all(&self, responses: impl IntoIterator<Item = MockResponse>) {
        for r in responses {
            self.push(r);
        }
    }

    /// 为 complete() 预设返回值
    pub fn push_completion(&self, result: Result<String, LlmError>) {
        if let Ok(mut c) = self.completions.lock() {
            c.push_back(result);
        }
    }

    /// stream_completion 被调用的次数（含失败）
    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn echo(messages: &[LlmMessage]) -> String {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == LlmRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        format!("Echo from Mock: {}", last_user)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[LlmMessage]) -> Result<String, LlmError> {
        let scripted = self.completions.lock().ok().and_then(|mut c| c.pop_front());
        scripted.unwrap_or_else(|| Ok(Self::echo(messages)))
    }

    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionStream, LlmError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut r) = self.requests.lock() {
            r.push(request.clone());
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        let response = next.unwrap_or_else(|| MockResponse::text(&Self::echo(&request.messages)));

        match response {
            MockResponse::Error(e) => Err(e),
            MockResponse::Events(events) => {
                // 取消后剩余事件一律变成 Aborted
                Ok(Box::pin(stream::iter(events).map(move |ev| {
                    if cancel.is_cancelled() {
                        Err(LlmError::Aborted)
                    } else {
                        Ok(ev)
                    }
                })))
            }
            MockResponse::EventsThenHang(events) => {
                let hang = stream::once(async move {
                    cancel.cancelled().await;
                    Err(LlmError::Aborted)
                });
                Ok(Box::pin(stream::iter(events.into_iter().map(Ok)).chain(hang)))
            }
        }
    }
}
