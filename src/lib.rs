//! Hive - 编码智能体的回合编排核心
//!
//! 模块划分：
//! - **chat**: 对话数据模型（Chat / Message / Part / ToolCallPart）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、共享状态、撤销、working 守卫、会话监管、回合编排
//! - **llm**: 模型客户端抽象与实现（OpenAI 兼容 / Mock）、鉴权重试
//! - **observability**: 日志初始化与遥测
//! - **tools**: 工具注册表、执行器与执行流水线，以及 echo / write_file / ask_user

pub mod chat;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod tools;
