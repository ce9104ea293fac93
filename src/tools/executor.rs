//! 工具执行器
//!
//! 对单次工具调用施加超时并与取消令牌竞速，超时/取消都转为失败结果；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::tools::{Tool, ToolContext, ToolResult};

pub const ABORTED_BY_USER: &str = "Aborted by user";

/// 单次调用的结局
#[derive(Debug)]
pub enum ExecutionOutcome {
    Finished(ToolResult),
    TimedOut,
    Cancelled,
}

pub struct ToolExecutor {
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub async fn execute(
        &self,
        tool: Arc<dyn Tool>,
        input: Value,
        ctx: &ToolContext,
    ) -> ExecutionOutcome {
        let start = Instant::now();
        let args_preview = args_preview(&input);
        let outcome = tokio::select! {
            _ = ctx.cancel.cancelled() => ExecutionOutcome::Cancelled,
            r = timeout(self.timeout, tool.execute(input, ctx)) => match r {
                Ok(result) => ExecutionOutcome::Finished(result),
                Err(_) => ExecutionOutcome::TimedOut,
            },
        };

        let (ok, label) = match &outcome {
            ExecutionOutcome::Finished(r) if r.requires_user_interaction => (true, "awaiting_user"),
            ExecutionOutcome::Finished(r) if r.success => (true, "ok"),
            ExecutionOutcome::Finished(_) => (false, "error"),
            ExecutionOutcome::TimedOut => (false, "timeout"),
            ExecutionOutcome::Cancelled => (false, "cancelled"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool.name(),
            "tool_call_id": ctx.tool_call_id,
            "ok": ok,
            "outcome": label,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit, "tool");
        outcome
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "sleeps"
        }

        async fn execute(&self, _input: Value, _ctx: &ToolContext) -> ToolResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ToolResult::ok("late")
        }
    }

    fn ctx(cancel: CancellationToken) -> ToolContext {
        ToolContext {
            chat_id: "c1".into(),
            tool_call_id: "t1".into(),
            cancel,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let executor = ToolExecutor::new(1);
        let outcome = executor
            .execute(Arc::new(SlowTool), Value::Null, &ctx(CancellationToken::new()))
            .await;
        assert!(matches!(outcome, ExecutionOutcome::TimedOut));
    }

    #[tokio::test]
    async fn test_cancel_wins_over_slow_tool() {
        let executor = ToolExecutor::new(30);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = executor
            .execute(Arc::new(SlowTool), Value::Null, &ctx(cancel))
            .await;
        assert!(matches!(outcome, ExecutionOutcome::Cancelled));
    }
}
