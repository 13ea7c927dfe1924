//! Planner：生成与修订执行计划
//!
//! create_plan 把工具目录、上下文和用户目标拼成规划 prompt，解析模型回复中的 `{"steps": [...]}`：
//! 先找 ```json 代码块，没有则取第一个 `{` 到最后一个 `}`；仍解析不出时退化为单个直接回答步骤，
//! 描述即模型原文。模型输出格式不对永远不会让请求失败；调用失败则原样上抛。

use std::sync::{Arc, OnceLock};

use regex::Regex;
use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::{cancellable, AgentError};
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::plan::{Plan, Step, StepStatus};
use crate::tools::ToolDefinition;

pub const DEFAULT_SYSTEM_PROMPT: &str = "你是一个专业的运维 AI Agent，负责分析告警、排查故障、执行运维操作。

你的能力包括：
1. 分析用户描述的问题，理解故障现象
2. 制定合理的排查计划
3. 调用工具查询日志、监控指标、告警信息
4. 根据查询结果进行根因分析
5. 给出解决方案和建议

请根据用户的问题，制定执行计划并逐步完成任务。";

/// 计划 JSON 的格式（仅用于生成 Schema 注入 prompt）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct PlanFormat {
    steps: Vec<StepFormat>,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
struct StepFormat {
    /// 从 1 开始的步骤序号
    id: u32,
    /// 步骤描述；不调用工具时即为给用户的回答
    description: String,
    /// 工具名，不调用工具时省略
    tool_name: Option<String>,
    /// 工具参数
    tool_params: Option<std::collections::HashMap<String, Value>>,
}

/// 计划 JSON 的 Schema 字符串
pub fn plan_schema_json() -> String {
    let schema = schema_for!(PlanFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[derive(Deserialize)]
struct StepsReply {
    steps: Vec<Step>,
}

static JSON_BLOCK_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn json_block_re() -> Option<&'static Regex> {
    JSON_BLOCK_RE
        .get_or_init(|| Regex::new(r"(?s)```json\s*(.+?)\s*```").ok())
        .as_ref()
}

/// 从模型回复中取出 JSON 文本：```json 代码块优先，其次第一个 `{` 到最后一个 `}`
pub fn extract_json(text: &str) -> Option<&str> {
    if let Some(caps) = json_block_re().and_then(|re| re.captures(text)) {
        if let Some(m) = caps.get(1) {
            return Some(m.as_str());
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// 解析步骤列表。没有步骤视为解析失败；空 tool_name 归为直接回答；缺失的 id 按位置补齐。
///
/// 模型给出的步骤一律从 pending 开始，只保留显式的 skipped；模型自带的 result / error 丢弃。
/// 新计划与修订计划都经过这里。
pub fn parse_plan_response(text: &str) -> Result<Vec<Step>, AgentError> {
    let json = extract_json(text).unwrap_or(text);
    let reply: StepsReply =
        serde_json::from_str(json).map_err(|e| AgentError::JsonParseError(e.to_string()))?;
    if reply.steps.is_empty() {
        return Err(AgentError::JsonParseError("plan has no steps".to_string()));
    }
    Ok(reply
        .steps
        .into_iter()
        .enumerate()
        .map(|(i, mut step)| {
            if step.id == 0 {
                step.id = i as u32 + 1;
            }
            if step.tool_name.as_deref().map(str::trim).unwrap_or("").is_empty() {
                step.tool_name = None;
            }
            if step.status != StepStatus::Skipped {
                step.status = StepStatus::Pending;
            }
            step.result.clear();
            step.error.clear();
            step
        })
        .collect())
}

/// 修订回复是否为“无需修改”标记
fn is_no_change(text: &str) -> bool {
    extract_json(text)
        .and_then(|json| serde_json::from_str::<Value>(json).ok())
        .and_then(|v| v.get("no_change").and_then(Value::as_bool))
        .unwrap_or(false)
}

/// Planner：只持有 LLM，请求之间无状态
pub struct Planner {
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 生成计划；模型调用失败返回 LlmError，输出无法解析时退化为单步直接回答
    pub async fn create_plan(
        &self,
        goal: &str,
        tools: &[ToolDefinition],
        context: &str,
        cancel: &CancellationToken,
    ) -> Result<Plan, AgentError> {
        let prompt = build_planning_prompt(goal, tools, context);
        tracing::debug!(prompt = %prompt, "planning prompt");
        let messages = [Message::system(DEFAULT_SYSTEM_PROMPT), Message::user(prompt)];

        let reply = cancellable(cancel, self.llm.complete(&messages))
            .await?
            .map_err(AgentError::LlmError)?;

        let steps = match parse_plan_response(&reply) {
            Ok(steps) => steps,
            Err(e) => {
                tracing::debug!("plan parse failed, answering directly: {}", e);
                vec![Step::answer(1, reply)]
            }
        };
        tracing::info!(steps = steps.len(), "plan created");
        Ok(Plan::new(goal, steps))
    }

    /// 询问是否修订剩余计划；Ok(None) 表示不修改
    pub async fn revise_plan(
        &self,
        plan: &Plan,
        latest_result: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<Step>>, AgentError> {
        let plan_json =
            serde_json::to_string(plan).map_err(|e| AgentError::JsonParseError(e.to_string()))?;
        let prompt = format!(
            "根据当前执行结果，判断是否需要修订计划。\n\n## 当前计划\n{}\n\n## 最新执行结果\n{}\n\n\
             如果需要修订计划，请输出新的计划 JSON（只包含尚未执行的后续步骤）。如果不需要修订，输出 {{\"no_change\": true}}。",
            plan_json, latest_result
        );

        let reply = cancellable(cancel, self.llm.generate(&prompt))
            .await?
            .map_err(AgentError::LlmError)?;

        if is_no_change(&reply) {
            return Ok(None);
        }
        parse_plan_response(&reply).map(Some)
    }
}

fn build_planning_prompt(goal: &str, tools: &[ToolDefinition], context: &str) -> String {
    let mut prompt = String::from("## 可用工具\n");
    let mut tools: Vec<&ToolDefinition> = tools.iter().collect();
    tools.sort_by(|a, b| a.name.cmp(&b.name));
    if tools.is_empty() {
        prompt.push_str("（无）\n");
    }
    for tool in tools {
        let params = tool
            .parameters
            .iter()
            .map(|p| {
                let flag = if p.required { ", 必填" } else { "" };
                format!("{} ({}{}): {}", p.name, p.param_type, flag, p.description)
            })
            .collect::<Vec<_>>()
            .join("; ");
        prompt.push_str(&format!("- {}: {}", tool.name, tool.description));
        if !params.is_empty() {
            prompt.push_str(&format!(" 参数: {}", params));
        }
        prompt.push('\n');
    }

    if !context.trim().is_empty() {
        prompt.push_str("\n## 上下文信息\n");
        prompt.push_str(context.trim_end());
        prompt.push('\n');
    }

    prompt.push_str(
        "\n## 输出格式\n请以 JSON 格式输出执行计划:\n```json\n{\n  \"steps\": [\n    {\"id\": 1, \"description\": \"步骤描述\", \"tool_name\": \"工具名\", \"tool_params\": {\"param\": \"value\"}}\n  ]\n}\n```\n\
         如果不需要使用工具，可以省略 tool_name 和 tool_params，直接在 description 中回答用户问题。\n\nJSON Schema:\n",
    );
    prompt.push_str(&plan_schema_json());
    prompt.push_str("\n\n## 用户目标\n");
    prompt.push_str(goal);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::plan::StepStatus;
    use crate::tools::ToolParameter;

    fn planner(llm: Arc<ScriptedLlmClient>) -> Planner {
        Planner::new(llm)
    }

    #[test]
    fn test_extract_json_fenced_block() {
        let text = "Here you go:\n```json\n{\"steps\": []}\n```\nthanks";
        assert_eq!(extract_json(text), Some("{\"steps\": []}"));
    }

    #[test]
    fn test_extract_json_brace_fallback() {
        assert_eq!(extract_json("plan: {\"a\": {\"b\": 1}} end"), Some("{\"a\": {\"b\": 1}}"));
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("} reversed {"), None);
    }

    #[test]
    fn test_parse_normalizes_steps() {
        let steps = parse_plan_response(
            r#"{"steps":[{"description":"query logs","tool_name":"log_query","tool_params":{"service":"api"}},{"description":"answer","tool_name":""}]}"#,
        )
        .unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].id, 1);
        assert_eq!(steps[1].id, 2);
        assert_eq!(steps[0].tool_params["service"], "api");
        assert!(steps[1].tool_name.is_none());
        assert!(steps.iter().all(|s| s.status == StepStatus::Pending));
    }

    #[test]
    fn test_parse_empty_steps_is_error() {
        assert!(parse_plan_response(r#"{"steps": []}"#).is_err());
        assert!(parse_plan_response("not json").is_err());
    }

    #[tokio::test]
    async fn test_create_plan_accepts_null_fields() {
        let reply = r#"{"steps":[{"id":1,"description":"查询 api 日志","tool_name":"log_query","tool_params":{"service":"api"},"result":null},{"id":2,"description":"给出结论","tool_name":null,"tool_params":null,"status":"todo"}]}"#;
        let llm = Arc::new(ScriptedLlmClient::new([reply]));
        let plan = planner(llm)
            .create_plan("api 报错", &[], "", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].tool_name.as_deref(), Some("log_query"));
        assert_eq!(plan.steps[1].description, "给出结论");
        assert!(plan.steps[1].tool_params.is_empty());
        assert_eq!(plan.steps[1].status, StepStatus::Pending);
    }

    #[test]
    fn test_parse_resets_model_supplied_progress() {
        let steps = parse_plan_response(
            r#"{"steps":[
                {"id":1,"description":"a","status":"completed","result":"made up"},
                {"id":2,"description":"b","status":"failed","error":"x"},
                {"id":3,"description":"c","status":"skipped"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(steps[0].status, StepStatus::Pending);
        assert!(steps[0].result.is_empty());
        assert_eq!(steps[1].status, StepStatus::Pending);
        assert!(steps[1].error.is_empty());
        assert_eq!(steps[2].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_create_plan_fallback_to_raw_reply() {
        let llm = Arc::new(ScriptedLlmClient::new(["The service looks healthy."]));
        let plan = planner(llm)
            .create_plan("is api ok?", &[], "", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].description, "The service looks healthy.");
        assert_eq!(plan.steps[0].status, StepStatus::Pending);
        assert!(plan.steps[0].tool_name.is_none());
        assert_eq!(plan.goal, "is api ok?");
    }

    #[tokio::test]
    async fn test_create_plan_prompt_contains_tools_context_goal() {
        let llm = Arc::new(ScriptedLlmClient::new([
            "```json\n{\"steps\":[{\"id\":1,\"description\":\"check\",\"tool_name\":\"log_query\"}]}\n```",
        ]));
        let tools = vec![ToolDefinition {
            name: "log_query".into(),
            description: "query logs".into(),
            parameters: vec![ToolParameter::required("service", "string", "svc")],
        }];
        let plan = planner(llm.clone())
            .create_plan("why 500s?", &tools, "[user]: earlier question", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(plan.steps[0].tool_name.as_deref(), Some("log_query"));

        let prompt = &llm.prompts()[0];
        assert!(prompt.contains("- log_query: query logs"));
        assert!(prompt.contains("service (string, 必填)"));
        assert!(prompt.contains("[user]: earlier question"));
        assert!(prompt.trim_end().ends_with("why 500s?"));
    }

    #[tokio::test]
    async fn test_create_plan_llm_error_propagates() {
        let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()));
        llm.push_error("rate limited");
        let err = planner(llm)
            .create_plan("x", &[], "", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::LlmError(ref m) if m == "rate limited"));
    }

    #[tokio::test]
    async fn test_create_plan_cancelled() {
        let llm = Arc::new(ScriptedLlmClient::new(["{}"]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = planner(llm).create_plan("x", &[], "", &cancel).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[tokio::test]
    async fn test_revise_plan_no_change() {
        let llm = Arc::new(ScriptedLlmClient::new([r#"Looks fine. {"no_change": true}"#]));
        let plan = Plan::new("g", vec![Step::answer(1, "a")]);
        let revised = planner(llm.clone())
            .revise_plan(&plan, "cpu 93%", &CancellationToken::new())
            .await
            .unwrap();
        assert!(revised.is_none());
        assert!(llm.prompts()[0].contains("cpu 93%"));
        assert!(llm.prompts()[0].contains(r#""goal":"g""#));
    }

    #[tokio::test]
    async fn test_revise_plan_new_steps() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"steps":[{"id":1,"description":"check alerts","tool_name":"alert_query"}]}"#,
        ]));
        let plan = Plan::new("g", vec![Step::answer(1, "a")]);
        let revised = planner(llm)
            .revise_plan(&plan, "result", &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(revised[0].tool_name.as_deref(), Some("alert_query"));
    }

    #[test]
    fn test_plan_schema_mentions_steps() {
        assert!(plan_schema_json().contains("steps"));
    }
}
