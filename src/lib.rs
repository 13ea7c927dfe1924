//! OnCall - Rust 运维值班智能体
//!
//! 模块划分：
//! - **agent**: 组合根，对外提供 chat / chat_stream
//! - **api**: HTTP + SSE 接入层（feature = "web"）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、取消传播、优雅关闭
//! - **llm**: LLM 与 Embedding 客户端抽象（OpenAI 兼容 / Mock）
//! - **memory**: 会话存储、滑动窗口摘要记忆、知识检索
//! - **observability**: tracing 日志初始化
//! - **plan**: Planner、Executor 状态机、流式输出格式
//! - **tools**: 工具注册表、带超时的执行器、日志 / 监控 / 告警诊断工具

pub mod agent;
#[cfg(feature = "web")]
pub mod api;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod plan;
pub mod tools;

pub use agent::{build_agent, Agent, ChatRequest, ChatResponse};
pub use crate::core::AgentError;
