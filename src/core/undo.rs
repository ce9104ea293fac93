//! 撤销管理：每个对话一个可逆工具效果栈
//!
//! 回滚到某条用户消息时，按后进先出依次执行其后产生的撤销动作（每个最多执行一次），
//! 遇到不属于该范围的条目即停止，然后把历史截断到目标用户消息为止。

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::chat::{ChatId, Role};
use crate::core::{AgentError, StateStore};
use crate::observability::Telemetry;

pub type UndoFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// 零参数异步撤销动作；FnOnce 保证最多执行一次
pub struct UndoAction(Box<dyn FnOnce() -> UndoFuture + Send>);

impl UndoAction {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self(Box::new(move || Box::pin(f())))
    }

    pub async fn run(self) -> anyhow::Result<()> {
        (self.0)().await
    }
}

impl fmt::Debug for UndoAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UndoAction")
    }
}

#[derive(Debug)]
pub struct UndoEntry {
    pub tool_call_id: String,
    pub action: UndoAction,
}

pub struct UndoManager {
    store: StateStore,
    telemetry: Arc<dyn Telemetry>,
    stacks: Mutex<HashMap<ChatId, Vec<UndoEntry>>>,
}

impl UndoManager {
    pub fn new(store: StateStore, telemetry: Arc<dyn Telemetry>) -> Self {
        Self {
            store,
            telemetry,
            stacks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn push(&self, chat_id: &str, entry: UndoEntry) {
        tracing::debug!(chat_id, tool_call_id = %entry.tool_call_id, "undo entry recorded");
        self.stacks
            .lock()
            .await
            .entry(chat_id.to_string())
            .or_default()
            .push(entry);
    }

    pub async fn len(&self, chat_id: &str) -> usize {
        self.stacks.lock().await.get(chat_id).map_or(0, Vec::len)
    }

    /// 栈内 tool call id，自栈顶向下
    pub async fn pending_ids(&self, chat_id: &str) -> Vec<String> {
        self.stacks
            .lock()
            .await
            .get(chat_id)
            .map(|s| s.iter().rev().map(|e| e.tool_call_id.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn clear(&self, chat_id: &str) {
        self.stacks.lock().await.remove(chat_id);
    }

    /// 回滚到指定用户消息：撤销其后的工具效果并截断历史（保留该用户消息）
    pub async fn undo_until_user_message(
        &self,
        chat_id: &str,
        user_message_id: &str,
    ) -> Result<(), AgentError> {
        let chat = self
            .store
            .chat(chat_id)
            .ok_or_else(|| AgentError::ChatNotFound(chat_id.to_string()))?;
        let index = chat
            .messages
            .iter()
            .position(|m| m.id == user_message_id && m.role == Role::User)
            .ok_or_else(|| AgentError::MessageNotFound(user_message_id.to_string()))?;

        let later_ids: HashSet<String> = chat.messages[index + 1..]
            .iter()
            .flat_map(|m| m.tool_calls().map(|tc| tc.tool_call_id.clone()))
            .collect();

        // 先在锁内弹出，再在锁外依次执行
        let popped = {
            let mut stacks = self.stacks.lock().await;
            let mut popped = Vec::new();
            if let Some(stack) = stacks.get_mut(chat_id) {
                while stack
                    .last()
                    .is_some_and(|top| later_ids.contains(&top.tool_call_id))
                {
                    if let Some(entry) = stack.pop() {
                        popped.push(entry);
                    }
                }
            }
            popped
        };

        for entry in popped {
            let tool_call_id = entry.tool_call_id.clone();
            if let Err(e) = entry.action.run().await {
                let err = AgentError::UndoFailed {
                    tool_call_id: tool_call_id.clone(),
                    reason: format!("{e:#}"),
                };
                tracing::warn!(chat_id, tool_call_id = %tool_call_id, error = %e, "undo action failed");
                self.telemetry.capture_exception(&err);
            } else {
                tracing::info!(chat_id, tool_call_id = %tool_call_id, "undo action applied");
            }
        }

        let remaining = self.store.update(|s| {
            let Some(chat) = s.chat_mut(chat_id) else {
                return HashSet::new();
            };
            if let Some(pos) = chat.messages.iter().position(|m| m.id == user_message_id) {
                chat.messages.truncate(pos + 1);
            }
            chat.error = None;
            chat.tool_call_ids()
        });

        // 历史里已不存在的调用不应再留在栈中
        if let Some(stack) = self.stacks.lock().await.get_mut(chat_id) {
            stack.retain(|e| remaining.contains(&e.tool_call_id));
        }
        Ok(())
    }

    /// 回滚到最近一条用户消息，返回其文本（供调用方放回输入框）；无用户消息时返回 None
    pub async fn undo_until_latest_user_message(
        &self,
        chat_id: &str,
    ) -> Result<Option<String>, AgentError> {
        let chat = self
            .store
            .chat(chat_id)
            .ok_or_else(|| AgentError::ChatNotFound(chat_id.to_string()))?;
        let Some(index) = chat.last_user_message_index() else {
            return Ok(None);
        };
        let message = &chat.messages[index];
        self.undo_until_user_message(chat_id, &message.id).await?;
        Ok(Some(message.text_content()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{Message, Part, ToolCallPart, ToolCallState};
    use crate::observability::NoopTelemetry;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn tool_message(ids: &[&str]) -> Message {
        Message::new(
            Role::Assistant,
            ids.iter()
                .map(|id| {
                    Part::ToolCall(ToolCallPart {
                        tool_call_id: id.to_string(),
                        tool_name: "write_file".into(),
                        input: json!({}),
                        state: ToolCallState::OutputAvailable { output: json!("ok") },
                    })
                })
                .collect(),
        )
    }

    fn recording_entry(id: &str, log: &Arc<StdMutex<Vec<String>>>) -> UndoEntry {
        let log = log.clone();
        let name = id.to_string();
        UndoEntry {
            tool_call_id: id.to_string(),
            action: UndoAction::new(move || async move {
                log.lock().unwrap().push(name);
                Ok(())
            }),
        }
    }

    #[tokio::test]
    async fn test_undo_runs_lifo_and_truncates_history() {
        let store = StateStore::default();
        let first = Message::user("first");
        let second = Message::user("second");
        let second_id = second.id.clone();
        store.update(|s| {
            s.chat_entry("c1").messages = vec![
                first.clone(),
                tool_message(&["a"]),
                second.clone(),
                tool_message(&["b", "c"]),
                tool_message(&["d"]),
            ];
        });

        let undo = UndoManager::new(store.clone(), Arc::new(NoopTelemetry));
        let log = Arc::new(StdMutex::new(Vec::new()));
        for id in ["a", "b", "c", "d"] {
            undo.push("c1", recording_entry(id, &log)).await;
        }

        undo.undo_until_user_message("c1", &second_id).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["d", "c", "b"]);
        let chat = store.chat("c1").unwrap();
        assert_eq!(chat.messages.len(), 3);
        assert_eq!(chat.messages.last().unwrap().id, second_id);
        assert_eq!(undo.pending_ids("c1").await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_undo_stops_at_foreign_entry() {
        let store = StateStore::default();
        let user = Message::user("go");
        let user_id = user.id.clone();
        store.update(|s| {
            s.chat_entry("c1").messages = vec![user.clone(), tool_message(&["x", "y"])];
        });
        let undo = UndoManager::new(store.clone(), Arc::new(NoopTelemetry));
        let log = Arc::new(StdMutex::new(Vec::new()));
        undo.push("c1", recording_entry("x", &log)).await;
        // 不属于本对话历史的条目挡在栈顶
        undo.push("c1", recording_entry("foreign", &log)).await;
        undo.push("c1", recording_entry("y", &log)).await;

        undo.undo_until_user_message("c1", &user_id).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["y"]);
    }

    #[tokio::test]
    async fn test_failed_undo_does_not_stop_rollback() {
        let store = StateStore::default();
        let user = Message::user("go");
        store.update(|s| {
            s.chat_entry("c1").messages = vec![user.clone(), tool_message(&["a", "b"])];
        });
        let undo = UndoManager::new(store.clone(), Arc::new(NoopTelemetry));
        let log = Arc::new(StdMutex::new(Vec::new()));
        undo.push("c1", recording_entry("a", &log)).await;
        undo.push(
            "c1",
            UndoEntry {
                tool_call_id: "b".into(),
                action: UndoAction::new(|| async { Err(anyhow::anyhow!("disk full")) }),
            },
        )
        .await;

        let restored = undo.undo_until_latest_user_message("c1").await.unwrap();
        assert_eq!(restored.as_deref(), Some("go"));
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
        assert_eq!(undo.len("c1").await, 0);
        assert_eq!(store.chat("c1").unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn test_latest_without_user_message_returns_none() {
        let store = StateStore::default();
        store.update(|s| {
            s.chat_entry("c1").messages = vec![Message::system("sys")];
        });
        let undo = UndoManager::new(store, Arc::new(NoopTelemetry));
        assert_eq!(undo.undo_until_latest_user_message("c1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_message_is_an_error() {
        let store = StateStore::default();
        store.update(|s| {
            s.chat_entry("c1");
        });
        let undo = UndoManager::new(store, Arc::new(NoopTelemetry));
        let err = undo.undo_until_user_message("c1", "missing").await.unwrap_err();
        assert!(matches!(err, AgentError::MessageNotFound(_)));
    }
}
