//! OpenAI 兼容 API 客户端
//!
//! 通过 reqwest 调用任意 OpenAI 兼容端点（可配置 base_url），流式响应按 SSE 逐行解析为 StreamEvent；
//! HTTP 状态码在这里映射为类型化的 LlmError（401 → Unauthorized、402 → InsufficientCredits 等）。

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::LlmTimeoutsSection;
use crate::llm::{
    CompletionRequest, CompletionStream, FinishReason, LlmClient, LlmError, LlmMessage, LlmRole,
    StreamEvent, Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
/// 429 未带 Retry-After 时的默认冷却
const DEFAULT_COOLDOWN_SECS: u64 = 60;

/// OpenAI 兼容客户端：持有 HTTP Client、端点、模型名与 API Key
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    request_timeout: Duration,
    stream_timeout: Duration,
}

impl OpenAiClient {
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        api_key: &str,
        timeouts: &LlmTimeoutsSection,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
            request_timeout: Duration::from_secs(timeouts.request),
            stream_timeout: Duration::from_secs(timeouts.stream),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn to_openai_messages(messages: &[LlmMessage]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| match m.role {
                LlmRole::System => json!({ "role": "system", "content": m.content }),
                LlmRole::User => json!({ "role": "user", "content": m.content }),
                LlmRole::Tool => json!({
                    "role": "tool",
                    "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
                    "content": m.content,
                }),
                LlmRole::Assistant => {
                    let mut msg = json!({ "role": "assistant", "content": m.content });
                    if !m.tool_calls.is_empty() {
                        msg["tool_calls"] = m
                            .tool_calls
                            .iter()
                            .map(|tc| {
                                json!({
                                    "id": tc.id,
                                    "type": "function",
                                    "function": {
                                        "name": tc.name,
                                        "arguments": tc.arguments.to_string(),
                                    }
                                })
                            })
                            .collect();
                    }
                    msg
                }
            })
            .collect()
    }

    fn request_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": Self::to_openai_messages(&request.messages),
            "stream": stream,
        });
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
        }
        body
    }

    /// 发送请求；timeout 只约束到响应头返回为止，不限制之后读取响应体（流式响应可能持续很久）
    async fn post(&self, body: &Value, timeout: Duration) -> Result<reqwest::Response, LlmError> {
        let send = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(body)
            .send();
        let response = tokio::time::timeout(timeout, send)
            .await
            .map_err(|_| LlmError::Network(format!("no response within {}s", timeout.as_secs())))?
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if response.status().is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let text = response.text().await.unwrap_or_default();
        Err(map_status(status, text, retry_after))
    }
}

/// 将非 2xx 响应映射为类型化错误
pub(crate) fn map_status(status: u16, body: String, retry_after: Option<u64>) -> LlmError {
    let lower = body.to_lowercase();
    match status {
        401 | 403 => LlmError::Unauthorized(body),
        402 => LlmError::InsufficientCredits(body),
        429 if lower.contains("insufficient_quota") => LlmError::InsufficientCredits(body),
        429 => LlmError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(DEFAULT_COOLDOWN_SECS),
            plan: serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.pointer("/error/plan").and_then(|p| p.as_str()).map(String::from)),
        },
        400 | 413
            if lower.contains("context_length_exceeded")
                || lower.contains("maximum context length") =>
        {
            LlmError::ContextLengthExceeded(body)
        }
        _ => LlmError::Http { status, body },
    }
}

fn parse_finish_reason(s: &str) -> FinishReason {
    match s {
        "stop" => FinishReason::Stop,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "length" => FinishReason::Length,
        _ => FinishReason::Other,
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>;

/// SSE 解析状态：字节缓冲按行切分，data 行解析为事件
struct SseState {
    bytes: ByteStream,
    buffer: Vec<u8>,
    pending: VecDeque<Result<StreamEvent, LlmError>>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
    finished: bool,
    cancel: CancellationToken,
    /// 两个数据块之间允许的最长间隔
    idle_timeout: Duration,
}

impl SseState {
    fn drain_lines(&mut self) {
        // [DONE] 之后的内容一律忽略
        while !self.finished {
            let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') else {
                break;
            };
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            self.handle_line(&line);
        }
    }

    fn handle_line(&mut self, line: &str) {
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        if data == "[DONE]" {
            self.finish();
            return;
        }
        match serde_json::from_str::<Value>(data) {
            Ok(chunk) => self.handle_chunk(&chunk),
            Err(e) => self
                .pending
                .push_back(Err(LlmError::Stream(format!("invalid SSE chunk: {}", e)))),
        }
    }

    fn handle_chunk(&mut self, chunk: &Value) {
        if let Some(err) = chunk.get("error") {
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown stream error");
            self.pending.push_back(Err(LlmError::Stream(message.to_string())));
            return;
        }
        if let Some(usage) = chunk.get("usage").filter(|u| u.is_object()) {
            let get = |k: &str| usage.get(k).and_then(|v| v.as_u64()).unwrap_or(0);
            self.usage = Some(Usage {
                prompt_tokens: get("prompt_tokens"),
                completion_tokens: get("completion_tokens"),
                total_tokens: get("total_tokens"),
            });
        }
        let Some(choice) = chunk.pointer("/choices/0") else {
            return;
        };
        let delta = &choice["delta"];
        if let Some(reasoning) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
            if !reasoning.is_empty() {
                self.pending
                    .push_back(Ok(StreamEvent::ReasoningDelta(reasoning.to_string())));
            }
        }
        if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
            if !content.is_empty() {
                self.pending
                    .push_back(Ok(StreamEvent::TextDelta(content.to_string())));
            }
        }
        if let Some(calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for (i, tc) in calls.iter().enumerate() {
                self.pending.push_back(Ok(StreamEvent::ToolCallDelta {
                    index: tc.get("index").and_then(|v| v.as_u64()).unwrap_or(i as u64) as usize,
                    id: tc.get("id").and_then(|v| v.as_str()).map(String::from),
                    name: tc
                        .pointer("/function/name")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    arguments_delta: tc
                        .pointer("/function/arguments")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                }));
            }
        }
        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            self.finish_reason = Some(parse_finish_reason(reason));
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.pending.push_back(Ok(StreamEvent::Finish {
            reason: self.finish_reason.unwrap_or(FinishReason::Stop),
            usage: self.usage,
        }));
    }
}

fn sse_stream(bytes: ByteStream, cancel: CancellationToken, idle_timeout: Duration) -> CompletionStream {
    let state = SseState {
        bytes,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finish_reason: None,
        usage: None,
        finished: false,
        cancel,
        idle_timeout,
    };
    Box::pin(stream::unfold(state, |mut st| async move {
        loop {
            // 已缓冲的事件也不再交出
            if st.cancel.is_cancelled() {
                st.pending.clear();
                if st.finished {
                    return None;
                }
                st.finished = true;
                return Some((Err(LlmError::Aborted), st));
            }
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            let next = tokio::select! {
                _ = st.cancel.cancelled() => continue,
                chunk = tokio::time::timeout(st.idle_timeout, st.bytes.next()) => chunk,
            };
            match next {
                Err(_) => {
                    st.finished = true;
                    return Some((
                        Err(LlmError::Stream(format!(
                            "no data for {}s",
                            st.idle_timeout.as_secs()
                        ))),
                        st,
                    ));
                }
                Ok(chunk) => match chunk {
                    Some(Ok(bytes)) => {
                        st.buffer.extend_from_slice(&bytes);
                        st.drain_lines();
                    }
                    Some(Err(e)) => {
                        st.finished = true;
                        return Some((Err(LlmError::Stream(e.to_string())), st));
                    }
                    // 连接结束但没收到 [DONE]，按已收内容收尾
                    None => {
                        st.drain_lines();
                        st.finish();
                    }
                },
            }
        }
    }))
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[LlmMessage]) -> Result<String, LlmError> {
        let request = CompletionRequest {
            messages: messages.to_vec(),
            tools: Vec::new(),
        };
        let body = self.request_body(&request, false);
        let response = self.post(&body, self.request_timeout).await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;
        Ok(value
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionStream, LlmError> {
        let body = self.request_body(request, true);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(LlmError::Aborted),
            r = self.post(&body, self.stream_timeout) => r?,
        };
        tracing::debug!(model = %self.model, "stream opened");
        let bytes: ByteStream = Box::pin(response.bytes_stream().map(|r| r.map(|b| b.to_vec())));
        Ok(sse_stream(bytes, cancel, self.stream_timeout))
    }
}
