//! 会话存储
//!
//! 按 (user_id, session_id) 隔离会话：不同用户即使使用相同 session_id 也互不可见。
//! 粗粒度锁只保护 key → Session 映射；消息 / 摘要的修改走每个会话自己的锁，
//! 不同会话之间互不串行。后台定时清理超过 TTL 未活跃的会话。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::memory::{Message, Role};

/// 会话键：用户维度 + 会话维度，两段分开存放，避免拼接字符串产生的碰撞
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.session_id)
    }
}

#[derive(Debug)]
struct SessionState {
    messages: Vec<Message>,
    summary: String,
    /// messages[..summarized_upto] 已折叠进 summary
    summarized_upto: usize,
}

#[derive(Debug, Clone, Copy)]
struct Activity {
    updated_at: DateTime<Utc>,
    last_active: Instant,
}

impl Activity {
    fn now() -> Self {
        Self {
            updated_at: Utc::now(),
            last_active: Instant::now(),
        }
    }
}

/// 单个会话：消息只追加，摘要只追加（显式 set_summary 除外）
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    state: RwLock<SessionState>,
    /// 与消息锁分离：清理任务只读这里，不等待正在写消息的请求
    activity: Mutex<Activity>,
}

impl Session {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let activity = Activity::now();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            created_at: activity.updated_at,
            state: RwLock::new(SessionState {
                messages: Vec::new(),
                summary: String::new(),
                summarized_upto: 0,
            }),
            activity: Mutex::new(activity),
        }
    }

    pub async fn append_message(&self, role: Role, content: impl Into<String>) {
        let mut state = self.state.write().await;
        state.messages.push(Message::new(role, content));
        self.touch();
    }

    /// 全部消息的快照
    pub async fn messages(&self) -> Vec<Message> {
        self.state.read().await.messages.clone()
    }

    /// 最近 n 条消息（不足 n 条时返回全部）
    pub async fn recent_messages(&self, n: usize) -> Vec<Message> {
        let state = self.state.read().await;
        let start = state.messages.len().saturating_sub(n);
        state.messages[start..].to_vec()
    }

    pub async fn message_count(&self) -> usize {
        self.state.read().await.messages.len()
    }

    pub async fn summary(&self) -> String {
        self.state.read().await.summary.clone()
    }

    /// 显式覆盖摘要（唯一会截断摘要的操作）
    pub async fn set_summary(&self, summary: impl Into<String>) {
        self.state.write().await.summary = summary.into();
        self.touch();
    }

    /// 已折叠进摘要的消息条数
    pub async fn summarized_upto(&self) -> usize {
        self.state.read().await.summarized_upto
    }

    /// 消息、摘要、摘要水位的一致快照
    pub async fn snapshot(&self) -> (Vec<Message>, String, usize) {
        let state = self.state.read().await;
        (
            state.messages.clone(),
            state.summary.clone(),
            state.summarized_upto,
        )
    }

    /// 把 messages[from..upto] 的摘要追加到现有摘要后。
    /// 仅当当前水位仍为 from 时生效（并发摘要同一批消息时只保留一份），返回合并后的摘要。
    pub async fn extend_summary(&self, from: usize, upto: usize, addition: &str) -> Option<String> {
        let mut state = self.state.write().await;
        if state.summarized_upto != from || upto > state.messages.len() || upto <= from {
            return None;
        }
        if state.summary.is_empty() {
            state.summary = addition.to_string();
        } else {
            state.summary = format!("{}\n\n{}", state.summary, addition);
        }
        state.summarized_upto = upto;
        Some(state.summary.clone())
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.activity().updated_at
    }

    /// 刷新最后活跃时间
    pub fn touch(&self) {
        *self.activity.lock().unwrap_or_else(PoisonError::into_inner) = Activity::now();
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.activity().last_active.elapsed() > ttl
    }

    fn activity(&self) -> Activity {
        *self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 会话存储：进程内、显式构造后注入 Agent
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionKey, Arc<Session>>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 获取或创建会话。整个查找 + 插入在同一把写锁内完成，并发调用拿到的是同一个 Arc<Session>
    pub async fn get_or_create(&self, user_id: &str, session_id: &str) -> Arc<Session> {
        let key = SessionKey::new(user_id, session_id);
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(&key) {
            session.touch();
            return Arc::clone(session);
        }
        let session = Arc::new(Session::new(session_id, user_id));
        sessions.insert(key.clone(), Arc::clone(&session));
        tracing::debug!(session = %key, "session created");
        session
    }

    pub async fn get(&self, user_id: &str, session_id: &str) -> Option<Arc<Session>> {
        let key = SessionKey::new(user_id, session_id);
        self.sessions.read().await.get(&key).cloned()
    }

    /// 同 get，不存在时返回 SessionNotFound
    pub async fn require(&self, user_id: &str, session_id: &str) -> Result<Arc<Session>, AgentError> {
        self.get(user_id, session_id)
            .await
            .ok_or_else(|| AgentError::SessionNotFound(SessionKey::new(user_id, session_id).to_string()))
    }

    /// 删除会话；不存在时什么也不做
    pub async fn delete(&self, user_id: &str, session_id: &str) {
        let key = SessionKey::new(user_id, session_id);
        if self.sessions.write().await.remove(&key).is_some() {
            tracing::debug!(session = %key, "session deleted");
        }
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// 清理超过 TTL 未活跃的会话，返回清理数量
    pub async fn cleanup_expired(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(self.ttl));
        before - sessions.len()
    }

    /// 启动后台清理任务：按固定间隔清理，token 取消后退出
    pub fn start_cleanup(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            // 首次 tick 立即返回，跳过
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("session cleanup stopped");
                        break;
                    }
                    _ = timer.tick() => {
                        let expired = store.cleanup_expired().await;
                        if expired > 0 {
                            tracing::info!("Cleaned up {} expired sessions", expired);
                        }
                    }
                }
            }
        })
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(30 * 60))
    }
}
