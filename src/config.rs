//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `GENIE__*` 覆盖（双下划线表示嵌套，如 `GENIE__AGENT__MAX_ITERATIONS=12`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::providers::GenerationKind;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub providers: ProvidersSection,
    pub storage: StorageSection,
    pub server: ServerSection,
}

/// [app] 段：应用名与系统提示词
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 决策循环使用的 system prompt 文件；未设置时使用内置提示词
    pub system_prompt_path: Option<PathBuf>,
}

/// [llm] 段：规划 / 决策所用模型
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai（任意 OpenAI 兼容端点）/ mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    pub api_key_env: String,
    /// 单次推理超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_secs: 60,
        }
    }
}

/// [agent] 段：执行循环的边界与历史窗口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 单步模式最大迭代次数
    pub max_iterations: usize,
    /// 检测到多步意图时的最大迭代次数
    pub multi_step_max_iterations: usize,
    /// 单轮整体超时（秒），超时后以已有结果收尾
    pub turn_timeout_secs: u64,
    /// 注入 prompt 的最近消息条数
    pub history_limit: usize,
    /// 每个会话最多保留的消息条数
    pub max_stored_messages: usize,
    /// 消息数超过该值时压缩为摘要
    pub compact_threshold: usize,
    /// 用户点名 Provider 时是否只用该 Provider（不回退）
    pub strict_provider: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            multi_step_max_iterations: 10,
            turn_timeout_secs: 600,
            history_limit: 12,
            max_stored_messages: 200,
            compact_threshold: 60,
            strict_provider: false,
        }
    }
}

/// [providers] 段：生成类超时、默认链路与 HTTP 端点
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvidersSection {
    /// 交互类（翻译、搜索、位置、语音）单次调用超时（秒）
    pub interactive_timeout_secs: u64,
    /// 媒体生成类（图片、视频、音乐）单次调用超时（秒）
    pub media_timeout_secs: u64,
    /// 生成类型 -> Provider 名称顺序，如 `text-to-image = ["gemini", "openai"]`
    pub chains: HashMap<String, Vec<String>>,
    pub endpoints: Vec<ProviderEndpoint>,
}

impl Default for ProvidersSection {
    fn default() -> Self {
        Self {
            interactive_timeout_secs: 45,
            media_timeout_secs: 300,
            chains: HashMap::new(),
            endpoints: Vec::new(),
        }
    }
}

impl ProvidersSection {
    /// 解析 chains 表；无法识别的生成类型记录告警后忽略
    pub fn parsed_chains(&self) -> HashMap<GenerationKind, Vec<String>> {
        let mut out = HashMap::new();
        for (key, names) in &self.chains {
            match GenerationKind::parse(key) {
                Some(kind) => {
                    out.insert(kind, names.iter().map(|n| n.to_lowercase()).collect());
                }
                None => tracing::warn!(kind = %key, "Unknown generation kind in [providers.chains], ignored"),
            }
        }
        out
    }

    pub fn interactive_timeout(&self) -> Duration {
        Duration::from_secs(self.interactive_timeout_secs)
    }

    pub fn media_timeout(&self) -> Duration {
        Duration::from_secs(self.media_timeout_secs)
    }
}

/// [[providers.endpoints]]：JSON-over-HTTP Provider
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEndpoint {
    pub name: String,
    pub base_url: String,
    pub api_key_env: Option<String>,
    /// 支持的生成类型（kebab-case），为空表示全部
    #[serde(default)]
    pub kinds: Vec<String>,
}

/// [storage] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub database_url: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database_url: "sqlite:data/genie.db?mode=rwc".to_string(),
        }
    }
}

/// [server] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    /// 上传文件落盘目录
    pub upload_dir: PathBuf,
    /// 后台生成任务并发上限
    pub max_concurrent_tasks: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            upload_dir: PathBuf::from("data/uploads"),
            max_concurrent_tasks: 4,
        }
    }
}

/// 从 config 目录加载配置，环境变量 GENIE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 GENIE__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("GENIE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
