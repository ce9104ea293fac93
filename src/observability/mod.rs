//! 可观测性：日志初始化与遥测接口
//!
//! Telemetry 是「发出即忘」的事件/异常上报口，实现内部失败一律吞掉，不影响回合执行。

use serde_json::Value;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 日志：默认 info，可通过 RUST_LOG 覆盖
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // 重复初始化（测试中常见）时静默忽略
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// 遥测接收端
pub trait Telemetry: Send + Sync {
    fn capture(&self, event: &str, properties: Value);

    fn capture_exception(&self, error: &dyn std::error::Error);
}

/// 以 tracing 事件（target = "telemetry"）记录遥测，默认实现
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn capture(&self, event: &str, properties: Value) {
        tracing::info!(target: "telemetry", event, properties = %properties);
    }

    fn capture_exception(&self, error: &dyn std::error::Error) {
        tracing::warn!(target: "telemetry", error = %error, "exception captured");
    }
}

/// 丢弃所有遥测
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn capture(&self, _event: &str, _properties: Value) {}

    fn capture_exception(&self, _error: &dyn std::error::Error) {}
}
