//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ONCALL__*` 覆盖（双下划线表示嵌套，如 `ONCALL__LLM__PROVIDER=mock`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub llm: LlmSection,
    pub embedding: EmbeddingSection,
    pub session: SessionSection,
    pub rag: RagSection,
    pub tools: ToolsSection,
    pub log: LogSection,
}

/// [server] 段：HTTP 监听地址
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai（任意 OpenAI 兼容端点）/ mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读 OPENAI_API_KEY
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            request_timeout_secs: 60,
        }
    }
}

/// [embedding] 段：向量化模型（与 LLM 共用 OpenAI 兼容端点时可不填 base_url / api_key）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingSection {
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            model: "text-embedding-3-small".to_string(),
            base_url: None,
            api_key: None,
        }
    }
}

/// [session] 段：滑动窗口与会话过期
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// 原样保留的最近消息条数
    pub max_history: usize,
    /// 待摘要消息攒够多少条才触发一次摘要
    pub summary_after: usize,
    pub ttl_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_history: 50,
            summary_after: 20,
            ttl_secs: 30 * 60,
            cleanup_interval_secs: 5 * 60,
        }
    }
}

impl SessionSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

/// [rag] 段：分块、检索条数、启动时索引的知识库目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RagSection {
    pub enabled: bool,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub max_entries: usize,
    pub knowledge_dir: Option<PathBuf>,
}

impl Default for RagSection {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_size: 500,
            chunk_overlap: 50,
            top_k: 5,
            max_entries: 10_000,
            knowledge_dir: None,
        }
    }
}

/// [tools] 段：工具超时与诊断后端地址（未配置地址的工具不注册）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub log_endpoint: Option<String>,
    pub monitor_endpoint: Option<String>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            log_endpoint: None,
            monitor_endpoint: None,
        }
    }
}

/// [log] 段：日志级别与格式（text / json）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
    pub format: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 ONCALL__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ONCALL__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
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
        config::Environment::with_prefix("ONCALL")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
