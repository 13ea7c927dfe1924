//! 滑动窗口记忆
//!
//! 最近 max_history 条消息原样保留，更早的消息折叠进会话摘要。
//! 待摘要消息不足 summary_after 条时本轮不摘要，它们留在水位之后，等下一批一起摘要，不会被丢掉。

use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::LlmClient;
use crate::memory::{format_messages, Message, Session};

/// 摘要生成器
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Result<String, String>;
}

/// 用生成服务做摘要
pub struct LlmSummarizer {
    llm: Arc<dyn LlmClient>,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String, String> {
        let prompt = format!(
            "Summarize the following operations conversation in a few sentences. \
             Keep service names, alerts, error messages, findings and decisions; drop small talk.\n\n{}",
            format_messages(messages)
        );
        let summary = self.llm.generate(&prompt).await?;
        let summary = summary.trim();
        if summary.is_empty() {
            return Err("empty summary".to_string());
        }
        Ok(summary.to_string())
    }
}

/// build_context 的结果：摘要 + 原样保留的最近消息
#[derive(Debug, Clone, Default)]
pub struct MemoryContext {
    pub summary: String,
    pub recent: Vec<Message>,
}

/// 滑动窗口记忆管理
pub struct SlidingWindowMemory {
    max_history: usize,
    summary_after: usize,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl SlidingWindowMemory {
    pub fn new(max_history: usize, summary_after: usize) -> Self {
        Self {
            max_history,
            summary_after,
            summarizer: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// 构建上下文。摘要失败不影响结果，只是沿用旧摘要
    pub async fn build_context(&self, session: &Session) -> MemoryContext {
        let (messages, summary, watermark) = session.snapshot().await;

        if messages.len() <= self.max_history {
            return MemoryContext {
                summary,
                recent: messages,
            };
        }

        let split = messages.len() - self.max_history;
        let recent = messages[split..].to_vec();

        let Some(summarizer) = &self.summarizer else {
            return MemoryContext { summary, recent };
        };

        let from = watermark.min(split);
        let pending = &messages[from..split];
        if pending.is_empty() || pending.len() < self.summary_after.max(1) {
            return MemoryContext { summary, recent };
        }

        match summarizer.summarize(pending).await {
            Ok(addition) => {
                let summary = session
                    .extend_summary(from, split, &addition)
                    .await
                    // 另一个请求已折叠同一批：用它写入的结果
                    .unwrap_or(session.summary().await);
                tracing::debug!(folded = pending.len(), "history summarized");
                MemoryContext { summary, recent }
            }
            Err(e) => {
                tracing::warn!("summarization failed, keeping previous summary: {}", e);
                MemoryContext { summary, recent }
            }
        }
    }
}
