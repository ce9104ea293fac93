//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找；
//! 注册表只是「名字 → 能力」的映射，不做任何按名字分支的逻辑。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::UndoAction;
use crate::llm::ToolSchema;

/// 执行时的上下文：所属对话、调用 id、取消令牌（工具可自行选择是否响应）
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub chat_id: String,
    pub tool_call_id: String,
    pub cancel: CancellationToken,
}

/// 单次工具执行结果
#[derive(Default)]
pub struct ToolResult {
    pub success: bool,
    pub output: Option<Value>,
    /// 隐藏的撤销能力，不会写入共享状态
    pub undo: Option<UndoAction>,
    /// 需要用户交互（如审批）才能完成，编排器不会自动进入下一轮
    pub requires_user_interaction: bool,
    pub error_message: Option<String>,
}

impl ToolResult {
    pub fn ok(output: impl Into<Value>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    /// 等待用户处理，结果由外部通过 submit_tool_result 提交
    pub fn awaiting_user() -> Self {
        Self {
            success: true,
            requires_user_interaction: true,
            ..Default::default()
        }
    }

    pub fn with_undo(mut self, undo: UndoAction) -> Self {
        self.undo = Some(undo);
        self
    }
}

impl fmt::Debug for ToolResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolResult")
            .field("success", &self.success)
            .field("output", &self.output)
            .field("has_undo", &self.undo.is_some())
            .field("requires_user_interaction", &self.requires_user_interaction)
            .field("error_message", &self.error_message)
            .finish()
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（input 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 发给模型的工具 schema 列表（按名字排序，保证请求稳定）
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .iter()
            .map(|(name, tool)| ToolSchema {
                name: name.clone(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }
}
