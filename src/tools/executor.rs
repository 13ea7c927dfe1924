//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时，execute(tool_name, params, cancel) 在超时内调用 registry.execute，
//! 超时、取消或失败时转为 AgentError（ToolTimeout / Cancelled / ToolExecutionFailed）；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::tools::{ToolParams, ToolRegistry, ToolResult};

/// 工具执行器：对每次调用施加超时与取消
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// 执行指定工具；返回工具自身的 ToolResult（含业务失败），调用层错误转为 AgentError
    pub async fn execute(
        &self,
        tool_name: &str,
        params: &ToolParams,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, AgentError> {
        let start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            r = tokio::time::timeout(self.timeout, self.registry.execute(tool_name, params)) => {
                match r {
                    Ok(inner) => inner,
                    Err(_) => Err(AgentError::ToolTimeout(tool_name.to_string())),
                }
            }
        };

        let outcome = match &result {
            Ok(r) if r.success => "ok",
            Ok(_) => "failed",
            Err(AgentError::Cancelled) => "cancelled",
            Err(AgentError::ToolTimeout(_)) => "timeout",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": outcome == "ok",
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(params),
        });
        tracing::info!(audit = %audit, "tool");

        result
    }
}

fn args_preview(params: &ToolParams) -> String {
    let s = serde_json::Value::Object(params.clone()).to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{Tool, ToolDefinition};
    use async_trait::async_trait;

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "slow".to_string(),
                description: "sleeps".to_string(),
                parameters: vec![],
            }
        }

        async fn execute(&self, _params: &ToolParams) -> Result<ToolResult, String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ToolResult::ok("done"))
        }
    }

    fn executor(timeout: Duration) -> ToolExecutor {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(SlowTool);
        ToolExecutor::new(registry, timeout)
    }

    #[tokio::test]
    async fn test_timeout() {
        let exec = executor(Duration::from_millis(20));
        let err = exec
            .execute("slow", &ToolParams::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolTimeout(_)));
    }

    #[tokio::test]
    async fn test_cancelled() {
        let exec = executor(Duration::from_secs(10));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = exec
            .execute("slow", &ToolParams::new(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let exec = executor(Duration::from_secs(1));
        let err = exec
            .execute("missing", &ToolParams::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TOOL_NOT_FOUND");
    }

    #[test]
    fn test_args_preview_truncates() {
        let mut params = ToolParams::new();
        params.insert("k".into(), serde_json::Value::String("x".repeat(500)));
        assert!(args_preview(&params).ends_with("..."));
    }
}
