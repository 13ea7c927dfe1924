//! 监控与告警查询工具
//!
//! monitor_metrics：服务指标（cpu / memory / qps / latency / error_rate）时间序列；
//! alert_query：告警列表。两者共用 MonitorClient 后端。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tools::log_query::time_range;
use crate::tools::{int_param, str_param, Tool, ToolDefinition, ToolParameter, ToolParams, ToolResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsQueryRequest {
    pub service: String,
    pub metric: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub step: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsQueryResponse {
    pub metric: String,
    #[serde(default)]
    pub points: Vec<MetricPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertsQueryRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub severity: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    pub limit: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub service: String,
    pub name: String,
    pub severity: String,
    pub status: String,
    pub message: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolve_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertsQueryResponse {
    #[serde(default)]
    pub alerts: Vec<Alert>,
    #[serde(default)]
    pub total: usize,
}

/// 监控后端
#[async_trait]
pub trait MonitorClient: Send + Sync {
    async fn query_metrics(&self, req: &MetricsQueryRequest) -> Result<MetricsQueryResponse, String>;

    async fn query_alerts(&self, req: &AlertsQueryRequest) -> Result<AlertsQueryResponse, String>;
}

/// 监控平台 HTTP 客户端：POST {endpoint}/api/metrics/query、{endpoint}/api/alerts/query
pub struct HttpMonitorClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpMonitorClient {
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

    async fn post<Req: Serialize + Sync, Resp: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        req: &Req,
    ) -> Result<Resp, String> {
        let resp = self
            .client
            .post(format!("{}{}", self.endpoint, path))
            .json(req)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("monitor backend returned {}", resp.status()));
        }
        resp.json::<Resp>().await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl MonitorClient for HttpMonitorClient {
    async fn query_metrics(&self, req: &MetricsQueryRequest) -> Result<MetricsQueryResponse, String> {
        self.post("/api/metrics/query", req).await
    }

    async fn query_alerts(&self, req: &AlertsQueryRequest) -> Result<AlertsQueryResponse, String> {
        self.post("/api/alerts/query", req).await
    }
}

fn to_result<T: Serialize>(resp: Result<T, String>) -> Result<ToolResult, String> {
    match resp {
        Ok(data) => Ok(ToolResult::ok(
            serde_json::to_value(data).map_err(|e| e.to_string())?,
        )),
        Err(e) => Ok(ToolResult::fail(format!("query failed: {}", e))),
    }
}

/// 指标查询
pub struct MonitorMetricsTool {
    client: Arc<dyn MonitorClient>,
}

impl MonitorMetricsTool {
    pub fn new(client: Arc<dyn MonitorClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for MonitorMetricsTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "monitor_metrics".to_string(),
            description: "查询服务监控指标，如 CPU、内存、QPS、延迟等".to_string(),
            parameters: vec![
                ToolParameter::required("service", "string", "服务名称"),
                ToolParameter::required("metric", "string", "指标名称: cpu/memory/qps/latency/error_rate"),
                ToolParameter::optional("start_time", "string", "开始时间 (RFC3339格式)"),
                ToolParameter::optional("end_time", "string", "结束时间 (RFC3339格式)"),
                ToolParameter::optional("step", "string", "采样间隔: 1m/5m/1h"),
            ],
        }
    }

    async fn execute(&self, params: &ToolParams) -> Result<ToolResult, String> {
        let Some(service) = str_param(params, "service") else {
            return Ok(ToolResult::fail("service is required"));
        };
        let Some(metric) = str_param(params, "metric") else {
            return Ok(ToolResult::fail("metric is required"));
        };
        let (start_time, end_time) = time_range(params);
        let req = MetricsQueryRequest {
            service: service.to_string(),
            metric: metric.to_string(),
            start_time,
            end_time,
            step: str_param(params, "step").unwrap_or("1m").to_string(),
        };
        to_result(self.client.query_metrics(&req).await)
    }
}

/// 告警查询（参数均可选）
pub struct AlertQueryTool {
    client: Arc<dyn MonitorClient>,
}

impl AlertQueryTool {
    pub fn new(client: Arc<dyn MonitorClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for AlertQueryTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "alert_query".to_string(),
            description: "查询服务告警信息".to_string(),
            parameters: vec![
                ToolParameter::optional("service", "string", "服务名称"),
                ToolParameter::optional("severity", "string", "告警级别: critical/warning/info"),
                ToolParameter::optional("status", "string", "告警状态: firing/resolved"),
                ToolParameter::optional("limit", "integer", "返回条数限制"),
            ],
        }
    }

    async fn execute(&self, params: &ToolParams) -> Result<ToolResult, String> {
        let req = AlertsQueryRequest {
            service: str_param(params, "service").unwrap_or_default().to_string(),
            severity: str_param(params, "severity").unwrap_or_default().to_string(),
            status: str_param(params, "status").unwrap_or_default().to_string(),
            limit: int_param(params, "limit").filter(|n| *n > 0).unwrap_or(50),
        };
        to_result(self.client.query_alerts(&req).await)
    }
}
