//! Agent 组合根
//!
//! 把会话存储、滑动窗口记忆、检索、Planner、Executor、工具注册表组装成两个对外操作：
//! chat（同步返回）与 chat_stream（逐步回调文本块）。所有依赖显式注入，没有全局状态。
//!
//! 一次请求：追加用户消息 → 构建记忆上下文 → 检索知识（尽力而为）→ 生成计划 → 执行计划
//! → 拼接结果 → 追加助手消息。请求失败或被取消时不追加助手消息。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{cancellable, AgentError};
use crate::llm::{create_embedder_from_config, LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::{
    format_context, format_messages, Document, InMemoryVectorStore, KeywordReranker,
    LlmSummarizer, MemoryContext, RagService, Retriever, Role, Session, SessionStore,
    SlidingWindowMemory,
};
use crate::plan::{
    format_error_chunk, format_step_chunk, Executor, Plan, Planner, Step, StepStatus,
};
use crate::tools::{
    AlertQueryTool, HttpLogClient, HttpMonitorClient, LogQueryTool, MonitorMetricsTool,
    ToolExecutor, ToolRegistry,
};

/// 所有步骤都没有产出文本时的回复
pub const FALLBACK_RESPONSE: &str = "已完成处理，但没有可返回的结果。";

fn default_session_id() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "default_session_id")]
    pub session_id: String,
    #[serde(default)]
    pub message: String,
}

impl ChatRequest {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            message: message.into(),
        }
    }

    /// user_id、message 必填；session_id 为空时用 "default"
    pub fn validate(&mut self) -> Result<(), AgentError> {
        if self.user_id.trim().is_empty() {
            return Err(AgentError::InvalidInput("user_id is required".to_string()));
        }
        if self.message.trim().is_empty() {
            return Err(AgentError::InvalidInput("message is required".to_string()));
        }
        if self.session_id.trim().is_empty() {
            self.session_id = default_session_id();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub message: String,
    pub plan: Plan,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Document>,
}

pub struct Agent {
    sessions: Arc<SessionStore>,
    memory: SlidingWindowMemory,
    planner: Arc<Planner>,
    executor: Executor,
    tools: Arc<ToolRegistry>,
    retriever: Option<Arc<dyn Retriever>>,
    top_k: usize,
}

/// 计划执行前的准备结果
struct Prepared {
    session: Arc<Session>,
    plan: Plan,
    sources: Vec<Document>,
}

impl Agent {
    pub fn new(
        sessions: Arc<SessionStore>,
        memory: SlidingWindowMemory,
        planner: Arc<Planner>,
        executor: Executor,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            sessions,
            memory,
            planner,
            executor,
            tools,
            retriever: None,
            top_k: 5,
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>, top_k: usize) -> Self {
        self.retriever = Some(retriever);
        self.top_k = top_k;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// 同步对话：返回拼接后的回复、执行过的计划与检索来源
    pub async fn chat(
        &self,
        req: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, AgentError> {
        let Prepared {
            session,
            mut plan,
            sources,
        } = self.prepare(req, cancel).await?;

        self.executor.execute_plan(&mut plan, cancel).await?;

        let results: Vec<&str> = plan.results().collect();
        let message = if results.is_empty() {
            FALLBACK_RESPONSE.to_string()
        } else {
            results.join("\n\n")
        };

        session.append_message(Role::Assistant, message.clone()).await;
        tracing::info!(user_id = %req.user_id, session_id = %req.session_id, steps = plan.steps.len(), "chat done");
        Ok(ChatResponse {
            message,
            plan,
            sources,
        })
    }

    /// 流式对话：每个步骤进入终态后回调一个文本块。
    /// 出错时若失败步骤已经以 ❌ 文本块报告过，直接返回错误；否则（规划失败、取消于执行前等）补一个 ❌ 文本块
    pub async fn chat_stream(
        &self,
        req: &ChatRequest,
        cancel: &CancellationToken,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> Result<ChatResponse, AgentError> {
        let mut step_failed = false;
        match self.stream_inner(req, cancel, on_chunk, &mut step_failed).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                if !step_failed {
                    on_chunk(&format_error_chunk(&e.to_string()));
                }
                Err(e)
            }
        }
    }

    async fn stream_inner(
        &self,
        req: &ChatRequest,
        cancel: &CancellationToken,
        on_chunk: &mut (dyn FnMut(&str) + Send),
        step_failed: &mut bool,
    ) -> Result<ChatResponse, AgentError> {
        let Prepared {
            session,
            mut plan,
            sources,
        } = self.prepare(req, cancel).await?;

        let mut full = String::new();
        self.executor
            .execute_step_by_step(&mut plan, cancel, &mut |step: &Step, result: &str| {
                *step_failed |= step.status == StepStatus::Failed;
                let chunk = format_step_chunk(step, result);
                on_chunk(&chunk);
                full.push_str(&chunk);
            })
            .await?;

        let message = if full.trim().is_empty() {
            FALLBACK_RESPONSE.to_string()
        } else {
            full.trim_end().to_string()
        };
        session.append_message(Role::Assistant, message.clone()).await;
        Ok(ChatResponse {
            message,
            plan,
            sources,
        })
    }

    async fn prepare(
        &self,
        req: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<Prepared, AgentError> {
        let mut req = req.clone();
        req.validate()?;
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let session = self.sessions.get_or_create(&req.user_id, &req.session_id).await;
        session.append_message(Role::User, req.message.clone()).await;

        let memory = cancellable(cancel, self.memory.build_context(&session)).await?;
        let sources = self.retrieve(&req.message, cancel).await?;
        let context = build_context_text(&memory, &sources, &req.message);

        let plan = self
            .planner
            .create_plan(&req.message, &self.tools.list(), &context, cancel)
            .await?;
        Ok(Prepared {
            session,
            plan,
            sources,
        })
    }

    /// 检索失败只记日志，当作没有额外上下文；取消则上抛
    async fn retrieve(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Document>, AgentError> {
        let Some(retriever) = &self.retriever else {
            return Ok(Vec::new());
        };
        match cancellable(cancel, retriever.retrieve(query, self.top_k)).await? {
            Ok(docs) => Ok(docs),
            Err(e) => {
                tracing::warn!("retrieval failed, continuing without knowledge: {}", e);
                Ok(Vec::new())
            }
        }
    }
}

/// 规划上下文：历史摘要 + 最近对话（不含当前这条提问）+ 相关知识
fn build_context_text(memory: &MemoryContext, sources: &[Document], current: &str) -> String {
    let mut recent = memory.recent.as_slice();
    if let Some((last, rest)) = recent.split_last() {
        if last.role == Role::User && last.content == current {
            recent = rest;
        }
    }

    let mut sections = Vec::new();
    if !memory.summary.is_empty() {
        sections.push(format!("### 历史摘要\n{}", memory.summary));
    }
    if !recent.is_empty() {
        sections.push(format!("### 最近对话\n{}", format_messages(recent).trim_end()));
    }
    if !sources.is_empty() {
        sections.push(format!("### 相关知识\n{}", format_context(sources).trim_end()));
    }
    sections.join("\n\n")
}

/// 按配置选择 LLM 后端：provider = mock 或缺少 API key 时使用 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = cfg
        .llm
        .api_key
        .clone()
        .filter(|k| !k.is_empty())
        .or_else(|| std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()));

    match (provider.as_str(), api_key) {
        ("mock", _) => {
            tracing::info!("Using Mock LLM");
            Arc::new(MockLlmClient)
        }
        (_, Some(key)) => {
            tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
            Arc::new(
                OpenAiClient::new(cfg.llm.base_url.as_deref(), &cfg.llm.model, Some(&key))
                    .with_timeout(Duration::from_secs(cfg.llm.request_timeout_secs.max(1))),
            )
        }
        (_, None) => {
            tracing::warn!("No API key set, using Mock LLM");
            Arc::new(MockLlmClient)
        }
    }
}

/// 注册已配置后端地址的诊断工具
pub fn create_tools_from_config(cfg: &AppConfig) -> Result<Arc<ToolRegistry>, AgentError> {
    let registry = Arc::new(ToolRegistry::new());
    let timeout = Duration::from_secs(cfg.tools.tool_timeout_secs.max(1));

    if let Some(endpoint) = cfg.tools.log_endpoint.as_deref() {
        let client = HttpLogClient::new(endpoint, timeout).map_err(AgentError::ConfigError)?;
        registry.register(LogQueryTool::new(Arc::new(client)));
    }
    if let Some(endpoint) = cfg.tools.monitor_endpoint.as_deref() {
        let client = Arc::new(
            HttpMonitorClient::new(endpoint, timeout).map_err(AgentError::ConfigError)?,
        );
        registry.register(MonitorMetricsTool::new(client.clone()));
        registry.register(AlertQueryTool::new(client));
    }

    if registry.is_empty() {
        tracing::warn!("no diagnostic tool endpoints configured; agent will answer directly");
    }
    Ok(registry)
}

/// 构建检索服务；未启用或没有嵌入 API key 时返回 None。配置了知识库目录时先完成索引
pub async fn create_rag_from_config(cfg: &AppConfig) -> Option<Arc<RagService>> {
    if !cfg.rag.enabled {
        return None;
    }
    let base_url = cfg.embedding.base_url.as_deref().or(cfg.llm.base_url.as_deref());
    let api_key = cfg.embedding.api_key.as_deref().or(cfg.llm.api_key.as_deref());
    let embedder = create_embedder_from_config(base_url, &cfg.embedding.model, api_key)?;

    let rag = RagService::new(embedder, Arc::new(InMemoryVectorStore::new(cfg.rag.max_entries)))
        .with_chunking(cfg.rag.chunk_size, cfg.rag.chunk_overlap)
        .with_reranker(Arc::new(KeywordReranker));

    if let Some(dir) = &cfg.rag.knowledge_dir {
        if let Err(e) = rag.index_dir(dir).await {
            tracing::warn!("knowledge base indexing failed: {}", e);
        }
    }
    Some(Arc::new(rag))
}

/// 从配置组装 Agent。会话过期清理由调用方用 `agent.sessions().start_cleanup(..)` 启动
pub async fn build_agent(cfg: &AppConfig) -> Result<Agent, AgentError> {
    let llm = create_llm_from_config(cfg);
    let tools = create_tools_from_config(cfg)?;

    let planner = Arc::new(Planner::new(llm.clone()));
    let tool_executor = Arc::new(ToolExecutor::new(
        tools.clone(),
        Duration::from_secs(cfg.tools.tool_timeout_secs.max(1)),
    ));
    let executor = Executor::new(tool_executor).with_planner(planner.clone());

    let memory = SlidingWindowMemory::new(cfg.session.max_history, cfg.session.summary_after)
        .with_summarizer(Arc::new(LlmSummarizer::new(llm)));
    let sessions = Arc::new(SessionStore::new(cfg.session.ttl()));

    let mut agent = Agent::new(sessions, memory, planner, executor, tools);
    if let Some(rag) = create_rag_from_config(cfg).await {
        agent = agent.with_retriever(rag, cfg.rag.top_k);
    }
    Ok(agent)
}
