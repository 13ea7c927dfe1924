//! 计划与步骤
//!
//! 步骤状态只向前推进：pending → running → completed / failed / skipped，完成或失败后不再回到执行中。
//! 计划状态：pending → running → completed / failed。

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped)
    }
}

/// 单个步骤：tool_name 有值为工具步骤，否则为直接回答步骤
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Map::is_empty"
    )]
    pub tool_params: Map<String, Value>,
    #[serde(default, deserialize_with = "lenient_status")]
    pub status: StepStatus,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub result: String,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub error: String,
}

/// 模型常把缺省字段写成 null，按默认值处理
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// 未知或缺失的状态视为 pending
fn lenient_status<'de, D>(deserializer: D) -> Result<StepStatus, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw
        .and_then(|v| v.as_str().map(str::to_lowercase))
        .and_then(|s| serde_json::from_value(Value::String(s)).ok())
        .unwrap_or_default())
}

impl Step {
    /// 直接回答步骤
    pub fn answer(id: u32, description: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
            ..Default::default()
        }
    }

    /// 工具步骤
    pub fn tool(
        id: u32,
        description: impl Into<String>,
        tool_name: impl Into<String>,
        tool_params: Map<String, Value>,
    ) -> Self {
        Self {
            id,
            description: description.into(),
            tool_name: Some(tool_name.into()),
            tool_params,
            ..Default::default()
        }
    }

    pub fn is_tool_step(&self) -> bool {
        self.tool_name.is_some()
    }
}

/// 一次请求的执行计划；由 Planner 生成，请求期间归 Executor 独占
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub status: PlanStatus,
}

impl Plan {
    pub fn new(goal: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            goal: goal.into(),
            steps,
            status: PlanStatus::Pending,
        }
    }

    /// 已完成步骤中非空的结果
    pub fn results(&self) -> impl Iterator<Item = &str> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed && !s.result.is_empty())
            .map(|s| s.result.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_defaults_from_json() {
        let step: Step = serde_json::from_str(r#"{"id":1,"description":"check logs"}"#).unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        assert!(!step.is_tool_step());
        assert!(step.tool_params.is_empty());
    }

    #[test]
    fn test_null_fields_take_defaults() {
        let step: Step = serde_json::from_str(
            r#"{"id":2,"description":"answer","tool_name":null,"tool_params":null,"result":null,"error":null}"#,
        )
        .unwrap();
        assert_eq!(step.id, 2);
        assert!(step.tool_name.is_none());
        assert!(step.tool_params.is_empty());
        assert!(step.result.is_empty());
        assert!(step.error.is_empty());
    }

    #[test]
    fn test_unknown_status_is_pending() {
        let step: Step = serde_json::from_str(r#"{"id":1,"status":"todo"}"#).unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        let step: Step = serde_json::from_str(r#"{"id":1,"status":null}"#).unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        let step: Step = serde_json::from_str(r#"{"id":1,"status":"Skipped"}"#).unwrap();
        assert_eq!(step.status, StepStatus::Skipped);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let plan = Plan::new("g", vec![Step::answer(1, "x")]);
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["steps"][0]["status"], "pending");
        assert!(json["steps"][0].get("tool_name").is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
    }
}
