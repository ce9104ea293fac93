//! 回合编排器：主控循环
//!
//! 一次 Run：检查递归上限 → 深度 +1 → （首条用户消息时）后台生成标题 → 组装 prompt →
//! 带鉴权重试的流式调用 → 把每个事件合并进末尾的 assistant 消息 → 交给工具流水线 →
//! 有结果且无需用户交互则进入下一轮，否则结束。
//!
//! 任何内部错误都在这里被分类并落到共享状态上（ChatError + 补全悬空的工具调用），不会向调用方抛出。
//! 另外提供 Command 通道前端（spawn_command_loop），供 REPL / 其他 UI 发送指令。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chat::{Message, Part, Role, ToolCallState};
use crate::core::{
    AgentError, ErrorClassifier, ErrorKind, SessionSupervisor, StateStore, UndoManager,
    WorkingGuard,
};
use crate::llm::{
    AuthAwareClient, CompletionRequest, FinishReason, LlmMessage, LlmRole, LlmToolCall,
    StreamAccumulator, StreamEvent,
};
use crate::observability::Telemetry;
use crate::tools::{PipelineContext, ToolPipeline, ToolRegistry};

const TITLE_PROMPT: &str = "Generate a short title (at most six words) for a conversation that starts with the following message. Reply with the title only.";
const TITLE_MAX_CHARS: usize = 60;

/// 一次 Run 的结局（错误走 Err）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    /// 模型不再提出工具调用
    Completed,
    /// 有工具调用等待用户交互
    AwaitingUser,
}

/// 单次 Run 的上下文；last_message_id 与中止处理器共享
struct RunContext {
    chat_id: String,
    cancel: CancellationToken,
    last_message_id: Arc<Mutex<Option<String>>>,
}

impl RunContext {
    fn set_last_message_id(&self, id: &str) {
        if let Ok(mut slot) = self.last_message_id.lock() {
            *slot = Some(id.to_string());
        }
    }

    fn last_message_id(&self) -> Option<String> {
        self.last_message_id.lock().ok().and_then(|slot| slot.clone())
    }
}

pub struct TurnOrchestrator {
    pub(crate) store: StateStore,
    pub(crate) llm: Arc<AuthAwareClient>,
    pub(crate) registry: ToolRegistry,
    pub(crate) pipeline: ToolPipeline,
    pub(crate) undo: Arc<UndoManager>,
    pub(crate) working: Arc<WorkingGuard>,
    pub(crate) supervisor: SessionSupervisor,
    pub(crate) telemetry: Arc<dyn Telemetry>,
    pub(crate) system_prompt: String,
    pub(crate) max_depth: usize,
    pub(crate) title_generation: bool,
    /// 当前逻辑 Run 已进行的模型调用轮数
    pub(crate) depth: AtomicUsize,
}

impl TurnOrchestrator {
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn undo_manager(&self) -> &Arc<UndoManager> {
        &self.undo
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_working(&self) -> bool {
        self.working.is_working()
    }

    /// 驱动一次 Run。history 只在对话尚不存在时用来建立对话，之后一律以共享状态为准。
    pub async fn run_turn(&self, chat_id: &str, history: Vec<Message>, snippets: &[String]) {
        self.store.update(|s| {
            if s.chat(chat_id).is_none() {
                s.chat_entry(chat_id).messages = history;
            }
        });
        if let Err(e) = self.run(chat_id, snippets).await {
            tracing::warn!(chat_id, error = %e, "run not started");
        }
    }

    /// 追加一条用户消息并开始 Run
    pub async fn submit_user_message(
        &self,
        chat_id: &str,
        text: &str,
        snippets: &[String],
    ) -> Result<(), AgentError> {
        if self.is_working() {
            return Err(AgentError::Busy);
        }
        let message = Message::user(text);
        self.store.update(|s| {
            let chat = s.chat_entry(chat_id);
            chat.error = None;
            chat.messages.push(message);
        });
        self.run(chat_id, snippets).await
    }

    /// 丢弃最近一条用户消息之后的回复（同时撤销其工具效果）并重新生成；不重置递归深度
    pub async fn retry(&self, chat_id: &str, snippets: &[String]) -> Result<(), AgentError> {
        if self.is_working() {
            return Err(AgentError::Busy);
        }
        let chat = self
            .store
            .chat(chat_id)
            .ok_or_else(|| AgentError::ChatNotFound(chat_id.to_string()))?;
        let index = chat
            .last_user_message_index()
            .ok_or_else(|| AgentError::MessageNotFound(format!("no user message in {chat_id}")))?;
        self.undo
            .undo_until_user_message(chat_id, &chat.messages[index].id)
            .await?;
        self.run(chat_id, snippets).await
    }

    /// 提交一个等待用户交互的工具调用的结果；同一消息里不再有待处理调用时从暂停处的深度继续
    pub async fn submit_tool_result(
        &self,
        chat_id: &str,
        tool_call_id: &str,
        output: Value,
    ) -> Result<(), AgentError> {
        if self.is_working() {
            return Err(AgentError::Busy);
        }
        let resolved = self.store.update(|s| -> Result<bool, AgentError> {
            let chat = s
                .chat_mut(chat_id)
                .ok_or_else(|| AgentError::ChatNotFound(chat_id.to_string()))?;
            let message = chat
                .messages
                .iter_mut()
                .find(|m| m.tool_calls().any(|tc| tc.tool_call_id == tool_call_id))
                .ok_or_else(|| AgentError::ToolNotFound(tool_call_id.to_string()))?;
            if let Some(tc) = message.tool_call_mut(tool_call_id) {
                if !tc.state.is_pending() {
                    return Err(AgentError::ToolExecutionFailed(format!(
                        "tool call {tool_call_id} is already resolved"
                    )));
                }
                tc.state = ToolCallState::OutputAvailable { output };
            }
            Ok(message.tool_calls().all(|tc| !tc.state.is_pending()))
        })?;

        if resolved {
            tracing::info!(chat_id, tool_call_id, depth = self.depth(), "resuming run after user input");
            self.run(chat_id, &[]).await
        } else {
            tracing::debug!(chat_id, tool_call_id, "waiting for remaining tool results");
            Ok(())
        }
    }

    /// 用户中止：触发进程级取消并执行当前 Run 的中止处理器
    pub fn abort(&self) -> bool {
        tracing::info!("abort requested");
        self.supervisor.cancel()
    }

    pub async fn undo_until_user_message(
        &self,
        chat_id: &str,
        user_message_id: &str,
    ) -> Result<(), AgentError> {
        if self.is_working() {
            return Err(AgentError::Busy);
        }
        self.undo.undo_until_user_message(chat_id, user_message_id).await
    }

    pub async fn undo_until_latest_user_message(
        &self,
        chat_id: &str,
    ) -> Result<Option<String>, AgentError> {
        if self.is_working() {
            return Err(AgentError::Busy);
        }
        self.undo.undo_until_latest_user_message(chat_id).await
    }

    /// 启动 Run 并处理其结局；只有无法开始时才返回错误
    async fn run(&self, chat_id: &str, snippets: &[String]) -> Result<(), AgentError> {
        if self.store.chat(chat_id).is_none() {
            return Err(AgentError::ChatNotFound(chat_id.to_string()));
        }
        if !self.working.try_start(chat_id) {
            return Err(AgentError::Busy);
        }
        self.llm.reset_retries();

        let run = RunContext {
            chat_id: chat_id.to_string(),
            cancel: self.supervisor.cancel_token(),
            last_message_id: Arc::new(Mutex::new(None)),
        };
        self.install_abort_handler(&run);

        let result = self.run_loop(&run, snippets).await;
        if !run.cancel.is_cancelled() {
            self.supervisor.clear_abort_handler();
        }

        match result {
            Ok(RunEnd::Completed) => {
                self.depth.store(0, Ordering::SeqCst);
                self.working.set_working(chat_id, false);
            }
            Ok(RunEnd::AwaitingUser) => {
                tracing::info!(chat_id, depth = self.depth(), "run paused for user interaction");
                self.working.set_working(chat_id, false);
            }
            Err(e) => self.fail_run(&run, e),
        }
        Ok(())
    }

    /// 中止时：把本次 Run 最后一条消息里所有待处理的工具调用标为失败，清除 working；深度保持不变
    fn install_abort_handler(&self, run: &RunContext) {
        let store = self.store.clone();
        let working = self.working.clone();
        let chat_id = run.chat_id.clone();
        let last_message_id = run.last_message_id.clone();
        self.supervisor.on_abort(Box::new(move || {
            let message_id = last_message_id.lock().ok().and_then(|slot| slot.clone());
            if let Some(message_id) = message_id {
                let failed = store.update(|s| {
                    s.chat_mut(&chat_id)
                        .map(|c| c.fail_pending_tool_calls(&message_id, crate::tools::ABORTED_BY_USER))
                        .unwrap_or_default()
                });
                tracing::info!(chat_id = %chat_id, aborted_tool_calls = failed.len(), "run aborted");
            }
            working.set_working(&chat_id, false);
        }));
    }

    fn fail_run(&self, run: &RunContext, err: AgentError) {
        let classification = ErrorClassifier::classify(&err);
        if classification.kind == ErrorKind::Aborted {
            // 中止处理器之后仍可能写入新的待处理调用，这里再收尾一次（只处理 pending，可重复执行）
            if let Some(message_id) = run.last_message_id() {
                self.store.update(|s| {
                    if let Some(chat) = s.chat_mut(&run.chat_id) {
                        chat.fail_pending_tool_calls(&message_id, crate::tools::ABORTED_BY_USER);
                    }
                });
            }
            tracing::debug!(chat_id = %run.chat_id, "run ended by abort");
            return;
        }

        tracing::error!(chat_id = %run.chat_id, kind = ?classification.kind, error = %err, "run failed");
        self.telemetry.capture_exception(&err);

        let chat_error = classification.to_chat_error();
        let synthetic = chat_error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| err.to_string());
        let message_id = run.last_message_id();
        self.store.update(|s| {
            if let Some(chat) = s.chat_mut(&run.chat_id) {
                if let Some(message_id) = &message_id {
                    chat.fail_pending_tool_calls(message_id, &synthetic);
                }
                chat.error = chat_error;
            }
        });
        self.depth.store(0, Ordering::SeqCst);
        self.working.set_working(&run.chat_id, false);
    }

    async fn run_loop(&self, run: &RunContext, snippets: &[String]) -> Result<RunEnd, AgentError> {
        loop {
            if run.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let depth = self.depth.load(Ordering::SeqCst);
            if depth >= self.max_depth {
                return Err(AgentError::RecursionDepthExceeded(self.max_depth));
            }
            self.depth.store(depth + 1, Ordering::SeqCst);
            tracing::debug!(chat_id = %run.chat_id, depth = depth + 1, "model round");

            let chat = self
                .store
                .chat(&run.chat_id)
                .ok_or_else(|| AgentError::ChatNotFound(run.chat_id.clone()))?;
            if self.title_generation && chat.title.is_none() && chat.is_first_user_turn() {
                if let Some(first) = chat.messages.last() {
                    self.spawn_title_generation(&run.chat_id, first.text_content());
                }
            }

            let request = CompletionRequest {
                messages: build_prompt(&self.system_prompt, snippets, &chat.messages),
                tools: self.registry.schemas(),
            };
            let accumulator = self.stream_round(run, &request).await?;

            let proposals = accumulator.tool_calls();
            if proposals.is_empty() {
                return Ok(RunEnd::Completed);
            }
            let Some(message_id) = run.last_message_id() else {
                return Ok(RunEnd::Completed);
            };

            let history = self
                .store
                .chat(&run.chat_id)
                .map(|c| c.messages)
                .unwrap_or_default();
            let ctx = PipelineContext {
                chat_id: run.chat_id.clone(),
                message_id,
                cancel: run.cancel.clone(),
            };
            let results = self
                .pipeline
                .execute(proposals, &self.registry, &history, &ctx)
                .await;

            if run.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            if results.is_empty() {
                return Ok(RunEnd::Completed);
            }
            if results.iter().any(|r| r.requires_user_interaction()) {
                return Ok(RunEnd::AwaitingUser);
            }
        }
    }

    /// 一轮流式调用：每个事件都原地替换末尾的 assistant 消息
    async fn stream_round(
        &self,
        run: &RunContext,
        request: &CompletionRequest,
    ) -> Result<StreamAccumulator, AgentError> {
        let mut stream = self.llm.invoke(request, run.cancel.clone()).await?;
        let mut message = Message::new(Role::Assistant, Vec::new());
        run.set_last_message_id(&message.id);
        let mut accumulator = StreamAccumulator::new();

        while let Some(event) = stream.next().await {
            // 中止后到达的事件不再写回，避免覆盖已标记失败的工具调用
            if run.cancel.is_cancelled() {
                break;
            }
            let event = event?;
            accumulator.apply(&event);
            self.merge(run, &mut message, &accumulator);
        }
        if run.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        if !accumulator.is_finished() {
            // 连接结束但没有 finish 事件：按已收到的内容收尾
            accumulator.apply(&StreamEvent::Finish {
                reason: FinishReason::Other,
                usage: None,
            });
            self.merge(run, &mut message, &accumulator);
        }

        if let Some(usage) = accumulator.usage() {
            self.store.update(|s| {
                if let Some(chat) = s.chat_mut(&run.chat_id) {
                    chat.context_tokens = usage.total_tokens;
                }
            });
        }
        Ok(accumulator)
    }

    fn merge(&self, run: &RunContext, message: &mut Message, accumulator: &StreamAccumulator) {
        message.parts = accumulator.parts();
        if message.parts.is_empty() {
            return;
        }
        let snapshot = message.clone();
        self.store.update(|s| {
            s.chat_entry(&run.chat_id).upsert_message(snapshot);
        });
    }

    fn spawn_title_generation(&self, chat_id: &str, first_message: String) {
        let llm = self.llm.clone();
        let store = self.store.clone();
        let chat_id = chat_id.to_string();
        tokio::spawn(async move {
            let client = llm.current().await;
            let prompt = [LlmMessage::system(TITLE_PROMPT), LlmMessage::user(first_message)];
            match client.complete(&prompt).await {
                Ok(raw) => {
                    let title = clean_title(&raw);
                    if title.is_empty() {
                        return;
                    }
                    store.update(|s| {
                        if let Some(chat) = s.chat_mut(&chat_id).filter(|c| c.title.is_none()) {
                            chat.title = Some(title);
                        }
                    });
                }
                Err(e) => tracing::debug!(chat_id = %chat_id, error = %e, "title generation failed"),
            }
        });
    }
}

fn clean_title(raw: &str) -> String {
    let line = raw.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let title = line.trim().trim_matches(|c| c == '"' || c == '\'' || c == '#').trim();
    title.chars().take(TITLE_MAX_CHARS).collect()
}

fn tool_output_text(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 组装发给模型的消息：系统提示词 + 辅助片段，然后是转换后的历史
pub(crate) fn build_prompt(system_prompt: &str, snippets: &[String], history: &[Message]) -> Vec<LlmMessage> {
    let mut system = system_prompt.to_string();
    if !snippets.is_empty() {
        system.push_str("\n\n## Context\n");
        for snippet in snippets {
            system.push('\n');
            system.push_str(snippet);
            system.push('\n');
        }
    }

    let mut messages = vec![LlmMessage::system(system)];
    for message in history {
        match message.role {
            Role::System => messages.push(LlmMessage::system(message.text_content())),
            Role::User => {
                let mut content = message.text_content();
                for part in &message.parts {
                    if let Part::File { media_type, url, filename } = part {
                        content.push_str(&format!(
                            "\n[attachment: {} ({}) {}]",
                            filename.as_deref().unwrap_or("file"),
                            media_type,
                            url
                        ));
                    }
                }
                messages.push(LlmMessage::user(content));
            }
            Role::Assistant => {
                // 未得到结果的调用不发给模型，否则后端会要求对应的 tool 消息
                let resolved: Vec<_> = message.tool_calls().filter(|tc| !tc.state.is_pending()).collect();
                let content = message.text_content();
                if content.is_empty() && resolved.is_empty() {
                    continue;
                }
                let mut assistant = LlmMessage::new(LlmRole::Assistant, content);
                assistant.tool_calls = resolved
                    .iter()
                    .map(|tc| LlmToolCall {
                        id: tc.tool_call_id.clone(),
                        name: tc.tool_name.clone(),
                        arguments: tc.input.clone(),
                    })
                    .collect();
                messages.push(assistant);
                for tc in resolved {
                    let content = match &tc.state {
                        ToolCallState::OutputAvailable { output } => tool_output_text(output),
                        ToolCallState::OutputError { error_text } => format!("Error: {error_text}"),
                        _ => continue,
                    };
                    messages.push(LlmMessage::tool_result(&tc.tool_call_id, content));
                }
            }
        }
    }
    messages
}

/// 从 UI 发往编排器的用户命令
#[derive(Debug)]
pub enum Command {
    /// 提交用户输入，开始一次 Run
    Submit(String),
    /// 重新生成最近一次回复
    Retry,
    /// 提交等待用户处理的工具调用结果
    SubmitToolResult { tool_call_id: String, output: Value },
    /// 回滚到最近一条用户消息，回传该消息文本
    Undo(oneshot::Sender<Result<Option<String>, AgentError>>),
    /// 停止当前生成
    Abort,
    /// 中止进行中的 Run 并退出循环
    Quit,
}

/// 在后台消费命令；Run 在独立任务中执行，保证 Abort 能及时送达
pub fn spawn_command_loop(
    orchestrator: Arc<TurnOrchestrator>,
    chat_id: impl Into<String>,
) -> (mpsc::UnboundedSender<Command>, JoinHandle<()>) {
    let chat_id = chat_id.into();
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();

    let handle = tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Submit(text) => {
                    let orchestrator = orchestrator.clone();
                    let chat_id = chat_id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = orchestrator.submit_user_message(&chat_id, &text, &[]).await {
                            tracing::warn!(chat_id = %chat_id, error = %e, "submit rejected");
                        }
                    });
                }
                Command::Retry => {
                    let orchestrator = orchestrator.clone();
                    let chat_id = chat_id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = orchestrator.retry(&chat_id, &[]).await {
                            tracing::warn!(chat_id = %chat_id, error = %e, "retry rejected");
                        }
                    });
                }
                Command::SubmitToolResult { tool_call_id, output } => {
                    let orchestrator = orchestrator.clone();
                    let chat_id = chat_id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = orchestrator
                            .submit_tool_result(&chat_id, &tool_call_id, output)
                            .await
                        {
                            tracing::warn!(chat_id = %chat_id, error = %e, "tool result rejected");
                        }
                    });
                }
                Command::Undo(reply) => {
                    let result = orchestrator.undo_until_latest_user_message(&chat_id).await;
                    let _ = reply.send(result);
                }
                Command::Abort => {
                    orchestrator.abort();
                }
                Command::Quit => {
                    orchestrator.abort();
                    break;
                }
            }
        }
    });

    (cmd_tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ToolCallPart;
    use serde_json::json;

    #[test]
    fn test_prompt_includes_snippets_and_tool_results() {
        let assistant = Message::new(
            Role::Assistant,
            vec![
                Part::text("checking"),
                Part::ToolCall(ToolCallPart {
                    tool_call_id: "t1".into(),
                    tool_name: "echo".into(),
                    input: json!({"text": "hi"}),
                    state: ToolCallState::OutputAvailable { output: json!("hi") },
                }),
                Part::ToolCall(ToolCallPart {
                    tool_call_id: "t2".into(),
                    tool_name: "echo".into(),
                    input: json!({}),
                    state: ToolCallState::OutputError { error_text: "boom".into() },
                }),
            ],
        );
        let history = vec![Message::user("go"), assistant];

        let prompt = build_prompt("sys", &["open file: main.rs".to_string()], &history);
        assert_eq!(prompt.len(), 5);
        assert!(prompt[0].content.contains("open file: main.rs"));
        assert_eq!(prompt[1].role, LlmRole::User);
        assert_eq!(prompt[2].tool_calls.len(), 2);
        assert_eq!(prompt[3].tool_call_id.as_deref(), Some("t1"));
        assert_eq!(prompt[3].content, "hi");
        assert_eq!(prompt[4].content, "Error: boom");
    }

    #[test]
    fn test_pending_tool_calls_are_not_sent() {
        let assistant = Message::new(
            Role::Assistant,
            vec![Part::ToolCall(ToolCallPart {
                tool_call_id: "q".into(),
                tool_name: "ask_user".into(),
                input: json!({}),
                state: ToolCallState::InputAvailable,
            })],
        );
        let prompt = build_prompt("sys", &[], &[Message::user("go"), assistant]);
        assert_eq!(prompt.len(), 2);
    }

    #[test]
    fn test_clean_title() {
        assert_eq!(clean_title("\n\"Fix the build\"\nextra"), "Fix the build");
        assert_eq!(clean_title("   "), "");
    }
}
