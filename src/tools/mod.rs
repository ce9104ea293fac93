pub mod ask_user;
pub mod echo;
pub mod executor;
pub mod pipeline;
pub mod registry;
pub mod schema;
pub mod write_file;

pub use ask_user::AskUserTool;
pub use echo::EchoTool;
pub use executor::{ExecutionOutcome, ToolExecutor, ABORTED_BY_USER};
pub use pipeline::{PipelineContext, ToolCallOutcome, ToolCallProcessingResult, ToolPipeline};
pub use registry::{Tool, ToolContext, ToolRegistry, ToolResult};
pub use schema::input_schema;
pub use write_file::WriteFileTool;
