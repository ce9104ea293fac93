//! 核心编排层：错误分类、共享状态、撤销、working 守卫、会话监管、回合编排

pub mod builder;
pub mod classifier;
pub mod error;
pub mod orchestrator;
pub mod session_supervisor;
pub mod state;
pub mod undo;
pub mod working;

pub use builder::{create_orchestrator_builder, OrchestratorBuilder};
pub use classifier::{Classification, ErrorClassifier, ErrorPayload};
pub use error::{AgentError, ChatError, ErrorKind};
pub use orchestrator::{spawn_command_loop, Command, TurnOrchestrator};
pub use session_supervisor::{AbortHandler, SessionSupervisor};
pub use state::{AppState, StateStore};
pub use undo::{UndoAction, UndoEntry, UndoManager};
pub use working::WorkingGuard;
