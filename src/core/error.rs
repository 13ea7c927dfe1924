//! Agent 错误类型
//!
//! 分类：NotFound（未知工具 / 会话）、InvalidInput、Upstream（LLM / 检索 / 工具调用失败）、
//! ParseFailure（模型输出非结构化，规划阶段本地降级，不向上抛出）、ExecutionFailure（计划步骤失败）。

use thiserror::Error;

use crate::plan::Plan;

/// Agent 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Retrieval failed: {0}")]
    RetrievalFailed(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    /// 计划在某一步失败（fail-fast）；plan 保留已完成步骤的结果，便于诊断
    #[error("Step {step_id} failed: {reason}")]
    PlanFailed {
        step_id: u32,
        reason: String,
        plan: Box<Plan>,
    },

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl AgentError {
    /// 稳定的错误码（HTTP 层返回给调用方）
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            AgentError::ToolNotFound(_) => "TOOL_NOT_FOUND",
            AgentError::InvalidInput(_) => "INVALID_INPUT",
            AgentError::LlmError(_) => "LLM_FAILED",
            AgentError::RetrievalFailed(_) => "RAG_FAILED",
            AgentError::ToolExecutionFailed(_)
            | AgentError::ToolTimeout(_)
            | AgentError::PlanFailed { .. } => "TOOL_EXEC_FAILED",
            AgentError::Cancelled => "CANCELLED",
            AgentError::JsonParseError(_) | AgentError::ConfigError(_) => "INTERNAL_ERROR",
        }
    }

    /// 失败时保留下来的部分执行计划
    pub fn partial_plan(&self) -> Option<&Plan> {
        match self {
            AgentError::PlanFailed { plan, .. } => Some(plan),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(AgentError::ToolNotFound("x".into()).code(), "TOOL_NOT_FOUND");
        assert_eq!(AgentError::LlmError("x".into()).code(), "LLM_FAILED");
        assert_eq!(AgentError::Cancelled.code(), "CANCELLED");
    }

    #[test]
    fn test_partial_plan_only_on_plan_failure() {
        let err = AgentError::PlanFailed {
            step_id: 2,
            reason: "boom".into(),
            plan: Box::new(Plan::new("goal", Vec::new())),
        };
        assert_eq!(err.partial_plan().map(|p| p.goal.as_str()), Some("goal"));
        assert!(AgentError::Cancelled.partial_plan().is_none());
        assert_eq!(err.to_string(), "Step 2 failed: boom");
    }
}
