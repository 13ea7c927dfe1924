//! HTTP 接入层（feature = "web"）
//!
//! - POST   /api/chat         同步对话
//! - POST   /api/chat/stream  SSE 流式对话：`data: {"content": ...}`，以 `[DONE]` 或 `{"error": ...}` 结束
//! - DELETE /api/session      删除会话（?user_id=&session_id=）
//! - GET    /api/tools        工具的函数调用 schema
//! - GET    /api/health
//!
//! 客户端断开时流被丢弃，DropGuard 取消对应请求的 CancellationToken，取消会传到 LLM 与工具调用。

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::{stream, Stream};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, ChatRequest};
use crate::core::AgentError;
use crate::plan::StreamEvent;

pub struct AppState {
    pub agent: Arc<Agent>,
}

impl AppState {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/chat", post(api_chat))
        .route("/api/chat/stream", post(api_chat_stream))
        .route("/api/session", delete(api_session_delete))
        .route("/api/tools", get(api_tools))
        .route("/api/health", get(|| async { "OK" }))
        .with_state(state)
}

/// AgentError → HTTP 状态码 + `{"error", "code", "plan"}`。
/// 工具层错误在执行器中已折叠为 PlanFailed，按 500 返回并附带部分执行的计划
pub struct ApiError(AgentError);

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AgentError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AgentError::SessionNotFound(_) | AgentError::ToolNotFound(_) => StatusCode::NOT_FOUND,
            AgentError::LlmError(_) | AgentError::RetrievalFailed(_) => StatusCode::BAD_GATEWAY,
            AgentError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "code": self.0.code(),
            "plan": self.0.partial_plan(),
        });
        (status, Json(body)).into_response()
    }
}

/// POST /api/chat
async fn api_chat(
    State(state): State<Arc<AppState>>,
    Json(mut req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    req.validate()?;
    let cancel = CancellationToken::new();
    // 连接断开时 axum 丢弃 handler future，guard 随之取消请求
    let _guard = cancel.clone().drop_guard();
    let resp = state.agent.chat(&req, &cancel).await?;
    Ok(Json(resp).into_response())
}

/// POST /api/chat/stream
async fn api_chat_stream(
    State(state): State<Arc<AppState>>,
    Json(mut req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    req.validate()?;

    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    let agent = Arc::clone(&state.agent);
    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        let chunk_tx = tx.clone();
        let result = agent
            .chat_stream(&req, &task_cancel, &mut |chunk: &str| {
                let data = StreamEvent::Content {
                    content: chunk.to_string(),
                }
                .to_json();
                let _ = chunk_tx.send(Event::default().data(data));
            })
            .await;
        let last = match result {
            Ok(_) => Event::default().data("[DONE]"),
            Err(e) => {
                tracing::warn!(user_id = %req.user_id, "stream chat failed: {}", e);
                Event::default().data(StreamEvent::Error { error: e.to_string() }.to_json())
            }
        };
        let _ = tx.send(last);
    });

    let guard = cancel.drop_guard();
    let events = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        rx.recv().await.map(|ev| (Ok(ev), (rx, guard)))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    user_id: String,
    #[serde(default)]
    session_id: String,
}

/// DELETE /api/session：幂等
async fn api_session_delete(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SessionQuery>,
) -> Result<StatusCode, ApiError> {
    if q.user_id.trim().is_empty() {
        return Err(AgentError::InvalidInput("user_id is required".to_string()).into());
    }
    let session_id = if q.session_id.is_empty() {
        "default"
    } else {
        q.session_id.as_str()
    };
    state.agent.sessions().delete(&q.user_id, session_id).await;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/tools
async fn api_tools(State(state): State<Arc<AppState>>) -> Json<Vec<serde_json::Value>> {
    Json(state.agent.tools().export_for_model())
}
