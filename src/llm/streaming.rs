//! 流式事件累积器
//!
//! 把 StreamEvent 逐个折叠成 assistant 消息的 parts：推理、正文、工具调用。
//! 编排器每收到一个事件就用 parts() 的结果原地替换共享状态中的消息。

use serde_json::Value;

use crate::chat::{new_id, Part, ToolCallPart, ToolCallState};
use crate::llm::{FinishReason, LlmToolCall, StreamEvent, Usage};

/// 单个工具调用的累积状态
#[derive(Debug, Default, Clone)]
struct ToolCallAccumulator {
    index: usize,
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    /// 参数 JSON；空串视为无参数，非法 JSON 原样保留为字符串交给工具报错
    fn parsed_arguments(&self) -> Value {
        let raw = self.arguments.trim();
        if raw.is_empty() {
            return Value::Object(Default::default());
        }
        serde_json::from_str(raw).unwrap_or_else(|_| Value::String(self.arguments.clone()))
    }
}

#[derive(Debug, Default)]
pub struct StreamAccumulator {
    reasoning: String,
    text: String,
    tool_calls: Vec<ToolCallAccumulator>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta(delta) => self.text.push_str(delta),
            StreamEvent::ReasoningDelta(delta) => self.reasoning.push_str(delta),
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments_delta,
            } => {
                let pos = match self.tool_calls.iter().position(|t| t.index == *index) {
                    Some(pos) => pos,
                    None => {
                        self.tool_calls.push(ToolCallAccumulator {
                            index: *index,
                            ..Default::default()
                        });
                        self.tool_calls.len() - 1
                    }
                };
                let acc = &mut self.tool_calls[pos];
                if let Some(id) = id.as_ref().filter(|s| !s.is_empty()) {
                    acc.id = id.clone();
                }
                if let Some(name) = name.as_ref().filter(|s| !s.is_empty()) {
                    acc.name = name.clone();
                }
                acc.arguments.push_str(arguments_delta);
            }
            StreamEvent::Finish { reason, usage } => {
                self.finish_reason = Some(*reason);
                if usage.is_some() {
                    self.usage = *usage;
                }
                // 后端没给 id 的调用在结束时补一个，保证对话内唯一
                for acc in self.tool_calls.iter_mut().filter(|t| t.id.is_empty()) {
                    acc.id = format!("call_{}", new_id());
                }
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// 当前累积内容对应的消息 parts；结束前工具调用处于 input-streaming
    pub fn parts(&self) -> Vec<Part> {
        let mut parts = Vec::new();
        if !self.reasoning.is_empty() {
            parts.push(Part::Reasoning {
                text: self.reasoning.clone(),
            });
        }
        if !self.text.is_empty() {
            parts.push(Part::text(self.text.clone()));
        }
        let state = if self.is_finished() {
            ToolCallState::InputAvailable
        } else {
            ToolCallState::InputStreaming
        };
        for acc in &self.tool_calls {
            parts.push(Part::ToolCall(ToolCallPart {
                tool_call_id: acc.id.clone(),
                tool_name: acc.name.clone(),
                input: acc.parsed_arguments(),
                state: state.clone(),
            }));
        }
        parts
    }

    /// 流结束后的工具调用提议
    pub fn tool_calls(&self) -> Vec<LlmToolCall> {
        self.tool_calls
            .iter()
            .map(|acc| LlmToolCall {
                id: acc.id.clone(),
                name: acc.name.clone(),
                arguments: acc.parsed_arguments(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delta(index: usize, id: Option<&str>, name: Option<&str>, args: &str) -> StreamEvent {
        StreamEvent::ToolCallDelta {
            index,
            id: id.map(String::from),
            name: name.map(String::from),
            arguments_delta: args.to_string(),
        }
    }

    #[test]
    fn test_tool_call_streams_then_becomes_available() {
        let mut acc = StreamAccumulator::new();
        acc.apply(&StreamEvent::TextDelta("Writing".into()));
        acc.apply(&delta(0, Some("call_1"), Some("write_file"), "{\"path\":"));
        let parts = acc.parts();
        match &parts[1] {
            Part::ToolCall(tc) => assert_eq!(tc.state, ToolCallState::InputStreaming),
            other => panic!("unexpected part {other:?}"),
        }

        acc.apply(&delta(0, None, None, "\"a.txt\"}"));
        acc.apply(&StreamEvent::Finish {
            reason: FinishReason::ToolCalls,
            usage: Some(Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 }),
        });

        let calls = acc.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, json!({"path": "a.txt"}));
        assert_eq!(acc.usage().map(|u| u.total_tokens), Some(15));
        match &acc.parts()[1] {
            Part::ToolCall(tc) => assert_eq!(tc.state, ToolCallState::InputAvailable),
            other => panic!("unexpected part {other:?}"),
        }
    }

    #[test]
    fn test_missing_id_is_filled_on_finish() {
        let mut acc = StreamAccumulator::new();
        acc.apply(&delta(0, None, Some("echo"), ""));
        acc.apply(&StreamEvent::Finish { reason: FinishReason::ToolCalls, usage: None });
        let calls = acc.tool_calls();
        assert!(calls[0].id.starts_with("call_"));
        assert_eq!(calls[0].arguments, json!({}));
    }

    #[test]
    fn test_invalid_json_kept_as_string() {
        let mut acc = StreamAccumulator::new();
        acc.apply(&delta(0, Some("x"), Some("echo"), "{not json"));
        acc.apply(&StreamEvent::Finish { reason: FinishReason::ToolCalls, usage: None });
        assert_eq!(acc.tool_calls()[0].arguments, Value::String("{not json".into()));
    }
}
