//! 对话数据模型：Chat / Message / Part / ToolCallPart
//!
//! 全部可序列化，作为共享状态的一部分被复制到远端 UI；撤销能力不在此处（由 UndoManager 持有）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::ChatError;

pub type ChatId = String;
pub type MessageId = String;

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 工具调用的执行状态
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum ToolCallState {
    /// 模型仍在流式输出参数
    InputStreaming,
    /// 参数完整，等待执行（或等待用户交互）
    InputAvailable,
    OutputAvailable { output: Value },
    OutputError { error_text: String },
}

impl ToolCallState {
    /// 尚未得到结果（流式中或待执行）
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::InputStreaming | Self::InputAvailable)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPart {
    pub tool_call_id: String,
    pub tool_name: String,
    pub input: Value,
    #[serde(flatten)]
    pub state: ToolCallState,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    File {
        media_type: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    ToolCall(ToolCallPart),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_tool_call(&self) -> Option<&ToolCallPart> {
        match self {
            Self::ToolCall(tc) => Some(tc),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub created_at: DateTime<Utc>,
    /// 来源附带的属性（如前端补充的选区、附件来源）
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            attributes: Map::new(),
        }
    }
}

/// 单条消息：assistant 消息在流式期间按 id 原地替换 parts
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: new_id(),
            role,
            parts,
            metadata: MessageMetadata::default(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![Part::text(text)])
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![Part::text(text)])
    }

    /// 所有 Text part 拼接后的文本
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallPart> {
        self.parts.iter().filter_map(Part::as_tool_call)
    }

    pub fn tool_call_mut(&mut self, tool_call_id: &str) -> Option<&mut ToolCallPart> {
        self.parts.iter_mut().find_map(|p| match p {
            Part::ToolCall(tc) if tc.tool_call_id == tool_call_id => Some(tc),
            _ => None,
        })
    }
}

/// 一个对话：消息只追加，撤销时才会截断
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    #[serde(default)]
    pub title: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub error: Option<ChatError>,
    #[serde(default)]
    pub is_working: bool,
    /// 最近一次模型调用报告的上下文 token 数
    #[serde(default)]
    pub context_tokens: u64,
    pub created_at: DateTime<Utc>,
}

impl Chat {
    pub fn new(id: impl Into<ChatId>) -> Self {
        Self {
            id: id.into(),
            title: None,
            messages: Vec::new(),
            error: None,
            is_working: false,
            context_tokens: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// 同 id 消息存在则替换 parts，否则追加；返回 true 表示新追加
    pub fn upsert_message(&mut self, message: Message) -> bool {
        match self.message_mut(&message.id) {
            Some(existing) => {
                existing.parts = message.parts;
                false
            }
            None => {
                self.messages.push(message);
                true
            }
        }
    }

    pub fn last_user_message_index(&self) -> Option<usize> {
        self.messages.iter().rposition(|m| m.role == Role::User)
    }

    /// 历史中仅有一条用户消息且它位于末尾（首次提问）
    pub fn is_first_user_turn(&self) -> bool {
        let user_count = self.messages.iter().filter(|m| m.role == Role::User).count();
        user_count == 1 && self.messages.last().map(|m| m.role) == Some(Role::User)
    }

    /// 将指定消息中所有未完成的工具调用标为失败，返回被改写的 call id
    pub fn fail_pending_tool_calls(&mut self, message_id: &str, error_text: &str) -> Vec<String> {
        let Some(message) = self.message_mut(message_id) else {
            return Vec::new();
        };
        let mut failed = Vec::new();
        for part in message.parts.iter_mut() {
            if let Part::ToolCall(tc) = part {
                if tc.state.is_pending() {
                    tc.state = ToolCallState::OutputError {
                        error_text: error_text.to_string(),
                    };
                    failed.push(tc.tool_call_id.clone());
                }
            }
        }
        failed
    }

    /// 当前历史里出现过的全部 tool call id
    pub fn tool_call_ids(&self) -> std::collections::HashSet<String> {
        self.messages
            .iter()
            .flat_map(|m| m.tool_calls().map(|tc| tc.tool_call_id.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool_part(id: &str, state: ToolCallState) -> Part {
        Part::ToolCall(ToolCallPart {
            tool_call_id: id.to_string(),
            tool_name: "echo".to_string(),
            input: json!({}),
            state,
        })
    }

    #[test]
    fn test_upsert_replaces_parts_by_id() {
        let mut chat = Chat::new("c1");
        let mut msg = Message::assistant("Hel");
        assert!(chat.upsert_message(msg.clone()));
        msg.parts = vec![Part::text("Hello")];
        assert!(!chat.upsert_message(msg.clone()));
        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.messages[0].text_content(), "Hello");
    }

    #[test]
    fn test_fail_pending_leaves_resolved_calls() {
        let mut chat = Chat::new("c1");
        let msg = Message::new(
            Role::Assistant,
            vec![
                tool_part("a", ToolCallState::InputAvailable),
                tool_part(
                    "b",
                    ToolCallState::OutputAvailable { output: json!("ok") },
                ),
                tool_part("c", ToolCallState::InputStreaming),
            ],
        );
        let id = msg.id.clone();
        chat.messages.push(msg);

        let failed = chat.fail_pending_tool_calls(&id, "Aborted by user");
        assert_eq!(failed, vec!["a".to_string(), "c".to_string()]);
        let states: Vec<_> = chat.messages[0].tool_calls().map(|t| t.state.clone()).collect();
        assert!(matches!(states[1], ToolCallState::OutputAvailable { .. }));
        assert!(states.iter().all(|s| !s.is_pending()));
    }

    #[test]
    fn test_first_user_turn_detection() {
        let mut chat = Chat::new("c1");
        chat.messages.push(Message::user("hi"));
        assert!(chat.is_first_user_turn());
        chat.messages.push(Message::assistant("hello"));
        assert!(!chat.is_first_user_turn());
        chat.messages.push(Message::user("again"));
        assert!(!chat.is_first_user_turn());
    }

    #[test]
    fn test_tool_call_part_serializes_flat_state() {
        let part = tool_part("x", ToolCallState::OutputError { error_text: "boom".into() });
        let v = serde_json::to_value(&part).unwrap();
        assert_eq!(v["type"], "tool-call");
        assert_eq!(v["state"], "output-error");
        assert_eq!(v["error_text"], "boom");
    }
}
