//! 日志查询工具：按服务、级别、关键词、时间范围查询日志
//!
//! 后端抽象为 LogClient，默认实现通过 HTTP 调用日志平台的查询接口。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tools::{int_param, str_param, Tool, ToolDefinition, ToolParameter, ToolParams, ToolResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogQueryRequest {
    pub service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub level: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub keyword: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub limit: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub service: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogQueryResponse {
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub total: usize,
}

/// 日志后端
#[async_trait]
pub trait LogClient: Send + Sync {
    async fn query(&self, req: &LogQueryRequest) -> Result<LogQueryResponse, String>;
}

/// 日志平台 HTTP 客户端：POST {endpoint}/api/logs/query
pub struct HttpLogClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpLogClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl LogClient for HttpLogClient {
    async fn query(&self, req: &LogQueryRequest) -> Result<LogQueryResponse, String> {
        let url = format!("{}/api/logs/query", self.endpoint);
        let resp = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("log backend returned {}", resp.status()));
        }
        resp.json::<LogQueryResponse>()
            .await
            .map_err(|e| e.to_string())
    }
}

/// 解析 RFC3339 时间范围；缺省结束时间为当前，缺省开始时间为结束前 1 小时
pub(crate) fn time_range(params: &ToolParams) -> (DateTime<Utc>, DateTime<Utc>) {
    let parse = |name: &str| {
        str_param(params, name)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    };
    let end = parse("end_time").unwrap_or_else(Utc::now);
    let start = parse("start_time").unwrap_or(end - chrono::Duration::hours(1));
    (start, end)
}

pub struct LogQueryTool {
    client: Arc<dyn LogClient>,
}

impl LogQueryTool {
    pub fn new(client: Arc<dyn LogClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for LogQueryTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "log_query".to_string(),
            description: "查询服务日志，支持按服务名、日志级别、关键词和时间范围筛选".to_string(),
            parameters: vec![
                ToolParameter::required("service", "string", "服务名称"),
                ToolParameter::optional("level", "string", "日志级别: debug/info/warn/error"),
                ToolParameter::optional("keyword", "string", "搜索关键词"),
                ToolParameter::optional("start_time", "string", "开始时间 (RFC3339格式)"),
                ToolParameter::optional("end_time", "string", "结束时间 (RFC3339格式)"),
                ToolParameter::optional("limit", "integer", "返回条数限制，默认100"),
            ],
        }
    }

    async fn execute(&self, params: &ToolParams) -> Result<ToolResult, String> {
        let Some(service) = str_param(params, "service") else {
            return Ok(ToolResult::fail("service is required"));
        };
        let (start_time, end_time) = time_range(params);
        let req = LogQueryRequest {
            service: service.to_string(),
            level: str_param(params, "level").unwrap_or_default().to_string(),
            keyword: str_param(params, "keyword").unwrap_or_default().to_string(),
            start_time,
            end_time,
            limit: int_param(params, "limit").filter(|n| *n > 0).unwrap_or(100),
        };

        match self.client.query(&req).await {
            Ok(resp) => Ok(ToolResult::ok(
                serde_json::to_value(resp).map_err(|e| e.to_string())?,
            )),
            Err(e) => Ok(ToolResult::fail(format!("query failed: {}", e))),
        }
    }
}
