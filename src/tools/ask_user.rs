//! 向用户提问的工具：自身不产出结果，答案由 UI 通过 submit_tool_result 提交

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::{input_schema, Tool, ToolContext, ToolResult};

#[allow(dead_code)]
#[derive(Deserialize, JsonSchema)]
struct AskUserArgs {
    /// 需要用户回答的问题
    question: String,
}

pub struct AskUserTool;

#[async_trait]
impl Tool for AskUserTool {
    fn name(&self) -> &str {
        "ask_user"
    }

    fn description(&self) -> &str {
        "Ask the user a question and wait for the answer. Use when a decision needs human input."
    }

    fn parameters_schema(&self) -> Value {
        input_schema::<AskUserArgs>()
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        if input.get("question").and_then(|v| v.as_str()).is_none() {
            return ToolResult::error("Missing required parameter: question");
        }
        tracing::info!(chat_id = %ctx.chat_id, tool_call_id = %ctx.tool_call_id, "waiting for user answer");
        ToolResult::awaiting_user()
    }
}
