//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__MODEL=gpt-4o`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub agent: AgentSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
}

/// [app] 段：应用名、工作目录、系统提示词路径
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 工具沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    /// 系统提示词文件；未设置时依次查找 config/prompts/system.md 等
    pub system_prompt_path: Option<PathBuf>,
}

/// [agent] 段：回合编排相关上限
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    /// 单次 Run 内最多的模型调用轮数，防止工具调用死循环
    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: usize,
    /// working 标志的看门狗超时（毫秒）
    #[serde(default = "default_working_timeout_ms")]
    pub working_timeout_ms: u64,
    /// 同一轮内工具并发上限（1 表示串行）
    #[serde(default = "default_max_concurrent_tools")]
    pub max_concurrent_tools: usize,
    /// 首条用户消息时是否尝试生成对话标题
    #[serde(default = "default_true")]
    pub title_generation: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_recursion_depth: default_max_recursion_depth(),
            working_timeout_ms: default_working_timeout_ms(),
            max_concurrent_tools: default_max_concurrent_tools(),
            title_generation: true,
        }
    }
}

impl AgentSection {
    pub fn working_timeout(&self) -> Duration {
        Duration::from_millis(self.working_timeout_ms)
    }
}

fn default_max_recursion_depth() -> usize {
    20
}

fn default_working_timeout_ms() -> u64 {
    180_000
}

fn default_max_concurrent_tools() -> usize {
    1
}

fn default_true() -> bool {
    true
}

/// [llm] 段：后端、鉴权重试与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai（任意 OpenAI 兼容端点）/ mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// 鉴权失效时刷新凭证并重试的次数上限
    #[serde(default = "default_max_auth_retries")]
    pub max_auth_retries: u32,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key_env: default_api_key_env(),
            max_auth_retries: default_max_auth_retries(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_max_auth_retries() -> u32 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
    #[serde(default = "default_stream_timeout")]
    pub stream: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
            stream: default_stream_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

fn default_stream_timeout() -> u64 {
    120
}

/// [tools] 段：工具超时
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
