//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）、流式累积、鉴权重试

pub mod auth;
pub mod mock;
pub mod openai;
pub mod streaming;
pub mod traits;
pub mod types;

pub use auth::{AuthAwareClient, ClientFactory, Credentials, EnvTokenProvider, TokenProvider};
pub use mock::{MockLlmClient, MockResponse};
pub use openai::OpenAiClient;
pub use streaming::StreamAccumulator;
pub use traits::{LlmClient, LlmError};
pub use types::{
    CompletionRequest, CompletionStream, FinishReason, LlmMessage, LlmRole, LlmToolCall,
    StreamEvent, ToolSchema, Usage,
};
