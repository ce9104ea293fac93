//! 对话数据模型

pub mod message;

pub use message::{
    new_id, Chat, ChatId, Message, MessageId, MessageMetadata, Part, Role, ToolCallPart,
    ToolCallState,
};
