//! 工具执行流水线
//!
//! 执行一轮模型提出的全部工具调用：按名查找 → 带超时/取消执行 → 每个结果一次原子写回
//! 正在进行的 assistant 消息 → 成功且带撤销能力的压入撤销栈。
//! 可以有限并发执行，但结果总是逐个折叠进共享状态。

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::{stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::chat::{Message, ToolCallState};
use crate::core::{StateStore, UndoEntry, UndoManager};
use crate::llm::LlmToolCall;
use crate::tools::{ExecutionOutcome, ToolContext, ToolExecutor, ToolRegistry, ToolResult, ABORTED_BY_USER};

/// 单个调用的处理结局
#[derive(Clone, Debug, PartialEq)]
pub enum ToolCallOutcome {
    Output(Value),
    Error(String),
    /// 需要用户交互，调用仍处于 input-available
    AwaitingUser,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolCallProcessingResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub outcome: ToolCallOutcome,
}

impl ToolCallProcessingResult {
    pub fn requires_user_interaction(&self) -> bool {
        self.outcome == ToolCallOutcome::AwaitingUser
    }
}

/// 一轮执行所需的定位信息
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub chat_id: String,
    /// 结果写回的 assistant 消息
    pub message_id: String,
    pub cancel: CancellationToken,
}

pub struct ToolPipeline {
    executor: ToolExecutor,
    store: StateStore,
    undo: Arc<UndoManager>,
    max_concurrent: usize,
}

impl ToolPipeline {
    pub fn new(
        executor: ToolExecutor,
        store: StateStore,
        undo: Arc<UndoManager>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            executor,
            store,
            undo,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub async fn execute(
        &self,
        proposals: Vec<LlmToolCall>,
        registry: &ToolRegistry,
        history: &[Message],
        ctx: &PipelineContext,
    ) -> Vec<ToolCallProcessingResult> {
        // 已经有结果的调用（如恢复时）不再执行
        let resolved: HashSet<&str> = history
            .iter()
            .flat_map(|m| m.tool_calls())
            .filter(|tc| !tc.state.is_pending())
            .map(|tc| tc.tool_call_id.as_str())
            .collect();
        let calls: Vec<LlmToolCall> = proposals
            .into_iter()
            .filter(|c| !resolved.contains(c.id.as_str()))
            .collect();

        let mut running = stream::iter(calls.into_iter().map(|call| self.run_one(call, registry, ctx)))
            .buffer_unordered(self.max_concurrent);

        let mut results = Vec::new();
        while let Some((call, outcome)) = running.next().await {
            results.push(self.record(ctx, call, outcome).await);
        }
        results
    }

    async fn run_one(
        &self,
        call: LlmToolCall,
        registry: &ToolRegistry,
        ctx: &PipelineContext,
    ) -> (LlmToolCall, ExecutionOutcome) {
        let Some(tool) = registry.get(&call.name) else {
            tracing::warn!(tool = %call.name, tool_call_id = %call.id, "model requested unknown tool");
            let outcome = ExecutionOutcome::Finished(ToolResult::error(format!(
                "Tool not found: {}",
                call.name
            )));
            return (call, outcome);
        };
        let tool_ctx = ToolContext {
            chat_id: ctx.chat_id.clone(),
            tool_call_id: call.id.clone(),
            cancel: ctx.cancel.clone(),
        };
        let outcome = self
            .executor
            .execute(tool, call.arguments.clone(), &tool_ctx)
            .await;
        (call, outcome)
    }

    /// 把一个结果写回共享状态（一次原子更新），必要时压入撤销栈
    async fn record(
        &self,
        ctx: &PipelineContext,
        call: LlmToolCall,
        outcome: ExecutionOutcome,
    ) -> ToolCallProcessingResult {
        let (outcome, undo) = match outcome {
            ExecutionOutcome::Finished(result) if result.requires_user_interaction => {
                (ToolCallOutcome::AwaitingUser, None)
            }
            ExecutionOutcome::Finished(result) if result.success => (
                ToolCallOutcome::Output(result.output.unwrap_or(Value::Null)),
                result.undo,
            ),
            ExecutionOutcome::Finished(result) => (
                ToolCallOutcome::Error(
                    result
                        .error_message
                        .unwrap_or_else(|| "Tool execution failed".to_string()),
                ),
                None,
            ),
            ExecutionOutcome::TimedOut => (
                ToolCallOutcome::Error(format!("Tool timed out: {}", call.name)),
                None,
            ),
            ExecutionOutcome::Cancelled => (ToolCallOutcome::Error(ABORTED_BY_USER.to_string()), None),
        };

        let new_state = match &outcome {
            ToolCallOutcome::Output(output) => Some(ToolCallState::OutputAvailable {
                output: output.clone(),
            }),
            ToolCallOutcome::Error(error_text) => Some(ToolCallState::OutputError {
                error_text: error_text.clone(),
            }),
            ToolCallOutcome::AwaitingUser => None,
        };

        if let Some(state) = new_state {
            let applied = self.store.update(|s| {
                s.chat_mut(&ctx.chat_id)
                    .and_then(|c| c.message_mut(&ctx.message_id))
                    .and_then(|m| m.tool_call_mut(&call.id))
                    .map(|tc| {
                        // 已被中止处理器等提前终结的调用不覆盖
                        if tc.state.is_pending() {
                            tc.state = state;
                            true
                        } else {
                            false
                        }
                    })
                    .unwrap_or(false)
            });
            if !applied {
                tracing::debug!(tool_call_id = %call.id, "tool call already resolved, result not written");
            }
        }

        if let Some(action) = undo {
            self.undo
                .push(
                    &ctx.chat_id,
                    UndoEntry {
                        tool_call_id: call.id.clone(),
                        action,
                    },
                )
                .await;
        }

        ToolCallProcessingResult {
            tool_call_id: call.id,
            tool_name: call.name,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{Part, Role, ToolCallPart};
    use crate::core::UndoAction;
    use crate::observability::NoopTelemetry;
    use crate::tools::{EchoTool, Tool};
    use async_trait::async_trait;
    use serde_json::json;

    struct ReversibleTool;

    #[async_trait]
    impl Tool for ReversibleTool {
        fn name(&self) -> &str {
            "reversible"
        }

        fn description(&self) -> &str {
            "succeeds with an undo action"
        }

        async fn execute(&self, _input: Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult::ok("done").with_undo(UndoAction::new(|| async { Ok(()) }))
        }
    }

    fn setup(calls: &[(&str, &str)]) -> (StateStore, Arc<UndoManager>, PipelineContext) {
        let store = StateStore::default();
        let message = Message::new(
            Role::Assistant,
            calls
                .iter()
                .map(|(id, name)| {
                    Part::ToolCall(ToolCallPart {
                        tool_call_id: id.to_string(),
                        tool_name: name.to_string(),
                        input: json!({"text": "hi"}),
                        state: ToolCallState::InputAvailable,
                    })
                })
                .collect(),
        );
        let ctx = PipelineContext {
            chat_id: "c1".into(),
            message_id: message.id.clone(),
            cancel: CancellationToken::new(),
        };
        store.update(|s| s.chat_entry("c1").messages.push(message));
        let undo = Arc::new(UndoManager::new(store.clone(), Arc::new(NoopTelemetry)));
        (store, undo, ctx)
    }

    fn proposal(id: &str, name: &str) -> LlmToolCall {
        LlmToolCall {
            id: id.into(),
            name: name.into(),
            arguments: json!({"text": "hi"}),
        }
    }

    #[tokio::test]
    async fn test_results_written_and_undo_recorded() {
        let (store, undo, ctx) = setup(&[("a", "echo"), ("b", "reversible"), ("c", "missing")]);
        let pipeline = ToolPipeline::new(ToolExecutor::new(5), store.clone(), undo.clone(), 2);
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(ReversibleTool);

        let history = store.chat("c1").unwrap().messages;
        let results = pipeline
            .execute(
                vec![proposal("a", "echo"), proposal("b", "reversible"), proposal("c", "missing")],
                &registry,
                &history,
                &ctx,
            )
            .await;

        assert_eq!(results.len(), 3);
        let chat = store.chat("c1").unwrap();
        let states: Vec<_> = chat.messages[0].tool_calls().map(|t| t.state.clone()).collect();
        assert_eq!(states[0], ToolCallState::OutputAvailable { output: json!("hi") });
        assert_eq!(states[1], ToolCallState::OutputAvailable { output: json!("done") });
        assert_eq!(
            states[2],
            ToolCallState::OutputError { error_text: "Tool not found: missing".into() }
        );
        assert_eq!(undo.pending_ids("c1").await, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_already_resolved_call_is_skipped() {
        let (store, undo, ctx) = setup(&[("a", "echo")]);
        store.update(|s| {
            let chat = s.chat_mut("c1").unwrap();
            chat.fail_pending_tool_calls(&ctx.message_id, ABORTED_BY_USER);
        });
        let pipeline = ToolPipeline::new(ToolExecutor::new(5), store.clone(), undo, 1);
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);

        let history = store.chat("c1").unwrap().messages;
        let results = pipeline
            .execute(vec![proposal("a", "echo")], &registry, &history, &ctx)
            .await;
        assert!(results.is_empty());
    }
}
