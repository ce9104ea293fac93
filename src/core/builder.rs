//! 编排器构建器：统一的初始化逻辑
//!
//! 从 AppConfig 组装 TurnOrchestrator：模型客户端（OpenAI 兼容 / Mock）+ 鉴权包装、工具注册表、
//! 撤销管理、working 守卫与会话监管。测试可以用 with_llm / with_token_provider 注入替身。

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::{SessionSupervisor, StateStore, TurnOrchestrator, UndoManager, WorkingGuard};
use crate::llm::{
    AuthAwareClient, ClientFactory, Credentials, EnvTokenProvider, LlmClient, MockLlmClient,
    OpenAiClient, TokenProvider,
};
use crate::observability::{Telemetry, TracingTelemetry};
use crate::tools::{AskUserTool, EchoTool, ToolExecutor, ToolPipeline, ToolRegistry, WriteFileTool};

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are Hive, a coding assistant. Use the available tools to complete the user's task, then summarise what you did.";

pub struct OrchestratorBuilder {
    config: AppConfig,
    workspace: PathBuf,
    system_prompt: Option<String>,
    store: StateStore,
    telemetry: Arc<dyn Telemetry>,
    llm: Option<(Arc<dyn LlmClient>, ClientFactory)>,
    tokens: Option<Arc<dyn TokenProvider>>,
    registry: Option<ToolRegistry>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig, workspace: PathBuf) -> Self {
        Self {
            config,
            workspace,
            system_prompt: None,
            store: StateStore::default(),
            telemetry: Arc::new(TracingTelemetry),
            llm: None,
            tokens: None,
            registry: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = Some(prompt.to_string());
        self
    }

    /// 依次查找配置路径、config/prompts/system.md、../config/prompts/system.md
    pub fn with_system_prompt_from_file(mut self) -> Self {
        let configured = self.config.app.system_prompt_path.clone();
        self.system_prompt = configured
            .into_iter()
            .chain(
                ["config/prompts/system.md", "../config/prompts/system.md"]
                    .into_iter()
                    .map(PathBuf::from),
            )
            .find_map(|p| std::fs::read_to_string(p).ok());
        self
    }

    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = store;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// 注入模型客户端；鉴权刷新后仍复用同一个实例
    pub fn with_llm(mut self, client: Arc<dyn LlmClient>) -> Self {
        let shared = client.clone();
        let factory: ClientFactory = Arc::new(move |_creds: &Credentials| shared.clone());
        self.llm = Some((client, factory));
        self
    }

    pub fn with_token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_tool_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// 默认工具：echo、write_file（限定在工作区内）、ask_user
    pub fn build_tool_registry(&self) -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        tools.register(WriteFileTool::new(&self.workspace));
        tools.register(AskUserTool);
        tools
    }

    /// 根据配置与环境变量选择后端：有 API Key 且 provider 不是 mock 时走 OpenAI 兼容端点
    fn build_llm(&self) -> (Arc<dyn LlmClient>, ClientFactory) {
        let llm_cfg = self.config.llm.clone();
        let key = std::env::var(&llm_cfg.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());

        match key {
            Some(api_key) if llm_cfg.provider.to_lowercase() != "mock" => {
                tracing::info!(model = %llm_cfg.model, "using OpenAI-compatible LLM");
                let factory: ClientFactory = Arc::new(move |creds: &Credentials| {
                    Arc::new(OpenAiClient::new(
                        llm_cfg.base_url.as_deref(),
                        &llm_cfg.model,
                        &creds.api_key,
                        &llm_cfg.timeouts,
                    )) as Arc<dyn LlmClient>
                });
                let client = factory(&Credentials { api_key });
                (client, factory)
            }
            _ => {
                tracing::warn!("no API key set or provider is mock, using Mock LLM");
                let client: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new());
                let shared = client.clone();
                let factory: ClientFactory = Arc::new(move |_creds: &Credentials| shared.clone());
                (client, factory)
            }
        }
    }

    pub fn build(self) -> TurnOrchestrator {
        let (client, factory) = match self.llm.clone() {
            Some(pair) => pair,
            None => self.build_llm(),
        };
        let tokens = self.tokens.clone().unwrap_or_else(|| {
            Arc::new(EnvTokenProvider::new(self.config.llm.api_key_env.clone()))
        });
        let llm = Arc::new(AuthAwareClient::new(
            client,
            factory,
            tokens,
            self.config.llm.max_auth_retries,
            self.telemetry.clone(),
        ));

        let registry = self
            .registry
            .clone()
            .unwrap_or_else(|| self.build_tool_registry());
        let undo = Arc::new(UndoManager::new(self.store.clone(), self.telemetry.clone()));
        let pipeline = ToolPipeline::new(
            ToolExecutor::new(self.config.tools.tool_timeout_secs),
            self.store.clone(),
            undo.clone(),
            self.config.agent.max_concurrent_tools,
        );
        let working = Arc::new(WorkingGuard::new(
            self.store.clone(),
            self.telemetry.clone(),
            self.config.agent.working_timeout(),
        ));

        TurnOrchestrator {
            store: self.store,
            llm,
            registry,
            pipeline,
            undo,
            working,
            supervisor: SessionSupervisor::new(),
            telemetry: self.telemetry,
            system_prompt: self
                .system_prompt
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            max_depth: self.config.agent.max_recursion_depth,
            title_generation: self.config.agent.title_generation,
            depth: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }
}

/// 便捷函数：加载配置、准备工作目录并返回构建器
pub fn create_orchestrator_builder(config_path: Option<PathBuf>) -> anyhow::Result<OrchestratorBuilder> {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let workspace = match config.app.workspace_root.clone() {
        Some(root) => root,
        None => std::env::current_dir()?.join("workspace"),
    };
    std::fs::create_dir_all(&workspace)?;
    let workspace = workspace.canonicalize().unwrap_or(workspace);

    Ok(OrchestratorBuilder::new(config, workspace).with_system_prompt_from_file())
}
