//! 流式输出：步骤进度格式化为可读文本块，以及 SSE 事件体

use serde::Serialize;

use crate::plan::{Step, StepStatus};

/// 步骤进入终态后的文本块：成功 `✅ 描述\n结果`，失败 `❌ 描述: 错误`
pub fn format_step_chunk(step: &Step, result: &str) -> String {
    match step.status {
        StepStatus::Failed => format!("❌ {}: {}\n", step.description, step.error),
        _ if result.is_empty() || result == step.description => format!("✅ {}\n", step.description),
        _ => format!("✅ {}\n{}\n", step.description, result),
    }
}

/// 请求级失败的文本块
pub fn format_error_chunk(error: &str) -> String {
    format!("❌ {}\n", error)
}

/// SSE data 负载：`{"content": ...}` 或 `{"error": ...}`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StreamEvent {
    Content { content: String },
    Error { error: String },
}

impl StreamEvent {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
