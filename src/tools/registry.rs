//! 工具注册表
//!
//! 所有工具实现 Tool trait（definition / execute），由 ToolRegistry 按名注册与查找，
//! ToolExecutor 在调用时加超时、响应取消并统一转 AgentError。
//! 注册表启动后以读为主，用读写锁保护；同名注册后者覆盖前者。

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::AgentError;

/// 工具参数：name → value
pub type ToolParams = Map<String, Value>;

/// 单个参数的描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

impl ToolParameter {
    pub fn required(name: &str, param_type: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            param_type: param_type.to_string(),
            description: description.to_string(),
            required: true,
        }
    }

    pub fn optional(name: &str, param_type: &str, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }
}

/// 工具定义：名称唯一，参数有序
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
}

impl ToolDefinition {
    /// 函数调用格式：`{type: function, function: {name, description, parameters: {type: object, properties, required}}}`
    pub fn to_function_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for p in &self.parameters {
            properties.insert(
                p.name.clone(),
                serde_json::json!({ "type": p.param_type, "description": p.description }),
            );
            if p.required {
                required.push(Value::String(p.name.clone()));
            }
        }
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }
            }
        })
    }
}

/// 单次执行结果；每次执行新建，不缓存
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl ToolResult {
    pub fn ok(data: impl Into<Value>) -> Self {
        Self {
            success: true,
            data: data.into(),
            error: String::new(),
        }
    }

    /// 业务失败（参数缺失、后端返回错误等），Executor 会据此 fail-fast
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: error.into(),
        }
    }

    /// 结果数据转文本：字符串原样返回，其余序列化为 JSON
    pub fn data_text(&self) -> String {
        match &self.data {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// 工具 trait：定义（供 LLM 理解）+ 异步执行
///
/// 返回 Err 表示调用本身出错（网络等），返回 `ToolResult { success: false }` 表示业务失败。
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn execute(&self, params: &ToolParams) -> Result<ToolResult, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        let replaced = self
            .tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), tool)
            .is_some();
        tracing::debug!(tool = %name, replaced, "tool registered");
    }

    /// 移除工具，返回是否存在
    pub fn unregister(&self, name: &str) -> bool {
        self.tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Tool>, AgentError> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))
    }

    /// 所有工具定义（顺序不保证稳定）
    pub fn list(&self) -> Vec<ToolDefinition> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|t| t.definition())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 解析并调用工具，原样返回工具结果；不加超时与重试
    pub async fn execute(&self, name: &str, params: &ToolParams) -> Result<ToolResult, AgentError> {
        let tool = self.get(name)?;
        tool.execute(params)
            .await
            .map_err(AgentError::ToolExecutionFailed)
    }

    /// 导出为函数调用 schema，每个工具一项，按名称排序
    pub fn export_for_model(&self) -> Vec<Value> {
        let mut defs = self.list();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs.iter().map(ToolDefinition::to_function_schema).collect()
    }

    /// 工具定义的 JSON 文本（调试 / 接口展示）
    pub fn to_json(&self) -> String {
        let mut defs = self.list();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        serde_json::to_string_pretty(&defs).unwrap_or_else(|_| "[]".to_string())
    }
}

/// 取字符串参数；空串视为缺失
pub fn str_param<'a>(params: &'a ToolParams, name: &str) -> Option<&'a str> {
    params
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// 取整数参数，兼容字符串形式的数字
pub fn int_param(params: &ToolParams, name: &str) -> Option<i64> {
    match params.get(name)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
