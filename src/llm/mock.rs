//! Mock LLM 客户端（无需 API）
//!
//! - MockLlmClient：回显最后一条 User 消息。回显内容不是计划 JSON，规划器会退化为直接回答，便于本地跑通整条链路。
//! - ScriptedLlmClient：按顺序返回预设回复并记录收到的 prompt，测试用。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{LlmClient, TokenStream};
use crate::memory::{Message, Role};

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        // prompt 末尾是用户目标，只回显最后一行
        let line = last_user.lines().last().unwrap_or(last_user).trim();
        Ok(format!("Echo from Mock: {}", line))
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, String> {
        let content = self.complete(messages).await?;
        Ok(Box::pin(stream::iter(vec![Ok(content)])))
    }
}

/// 预设回复用尽后的默认回复：修订时表示无需改动
const SCRIPT_EXHAUSTED_REPLY: &str = r#"{"no_change": true}"#;

/// 脚本化客户端：每次 complete 弹出一条预设回复；用尽后返回默认回复
#[derive(Debug)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// 追加一条失败回复
    pub fn push_error(&self, err: impl Into<String>) {
        self.lock_replies().push_back(Err(err.into()));
    }

    /// 已收到的 prompt（按调用顺序，每次调用的消息内容拼接为一条）
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts().len()
    }

    fn lock_replies(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, String>>> {
        self.replies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let prompt = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.prompts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(prompt);
        let next = self.lock_replies().pop_front();
        next.unwrap_or_else(|| Ok(SCRIPT_EXHAUSTED_REPLY.to_string()))
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, String> {
        let content = self.complete(messages).await?;
        Ok(Box::pin(stream::iter(vec![Ok(content)])))
    }
}
