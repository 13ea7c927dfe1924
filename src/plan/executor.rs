//! 计划执行器：按顺序推进步骤状态机
//!
//! - skipped 步骤直接跳过，不执行也不回调
//! - 工具步骤经 ToolExecutor 调用；调用出错或 success=false 时该步与整个计划标为 failed 并立即返回（fail-fast）
//! - 直接回答步骤无需执行，描述即结果
//! - 工具步骤产生非空结果且后面还有步骤时，询问 Planner 是否修订，修订结果替换当前步骤之后的全部步骤
//! - 取消时当前步骤标为 failed（error = "cancelled"），计划标为 failed，返回 Cancelled

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::plan::{Plan, PlanStatus, Planner, Step, StepStatus};
use crate::tools::ToolExecutor;

pub struct Executor {
    tools: Arc<ToolExecutor>,
    planner: Option<Arc<Planner>>,
}

impl Executor {
    pub fn new(tools: Arc<ToolExecutor>) -> Self {
        Self {
            tools,
            planner: None,
        }
    }

    /// 启用执行中修订
    pub fn with_planner(mut self, planner: Arc<Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// 执行到结束；失败时 plan 保留已完成步骤的结果
    pub async fn execute_plan(
        &self,
        plan: &mut Plan,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        self.run(plan, cancel, &mut |_: &Step, _: &str| {}).await
    }

    /// 与 execute_plan 相同，每个步骤进入终态后回调 (step, 结果文本)
    pub async fn execute_step_by_step(
        &self,
        plan: &mut Plan,
        cancel: &CancellationToken,
        on_step: &mut (dyn FnMut(&Step, &str) + Send),
    ) -> Result<(), AgentError> {
        self.run(plan, cancel, on_step).await
    }

    async fn run(
        &self,
        plan: &mut Plan,
        cancel: &CancellationToken,
        on_step: &mut (dyn FnMut(&Step, &str) + Send),
    ) -> Result<(), AgentError> {
        plan.status = PlanStatus::Running;

        let mut i = 0;
        while i < plan.steps.len() {
            if plan.steps[i].status.is_terminal() {
                i += 1;
                continue;
            }
            if cancel.is_cancelled() {
                return Err(cancel_at(plan, i, on_step));
            }

            let step = &mut plan.steps[i];
            step.status = StepStatus::Running;
            tracing::info!(step_id = step.id, description = %step.description, "executing step");

            let Some(tool_name) = step.tool_name.clone() else {
                step.result = step.description.clone();
                step.status = StepStatus::Completed;
                on_step(step, &step.result);
                i += 1;
                continue;
            };

            let outcome = self.tools.execute(&tool_name, &step.tool_params, cancel).await;
            let result = match outcome {
                Ok(r) if r.success => r.data_text(),
                Ok(r) => {
                    let reason = if r.error.is_empty() {
                        format!("tool {} reported failure", tool_name)
                    } else {
                        r.error
                    };
                    return Err(fail_at(plan, i, reason, on_step));
                }
                Err(AgentError::Cancelled) => return Err(cancel_at(plan, i, on_step)),
                Err(e) => return Err(fail_at(plan, i, e.to_string(), on_step)),
            };

            let step = &mut plan.steps[i];
            step.result = result;
            step.status = StepStatus::Completed;
            on_step(step, &step.result);

            if i + 1 < plan.steps.len() && !plan.steps[i].result.is_empty() {
                if let Some(planner) = &self.planner {
                    let latest = plan.steps[i].result.clone();
                    match planner.revise_plan(plan, &latest, cancel).await {
                        Ok(Some(revised)) => splice_tail(plan, i, revised),
                        Ok(None) => {}
                        Err(AgentError::Cancelled) => {
                            plan.status = PlanStatus::Failed;
                            return Err(AgentError::Cancelled);
                        }
                        Err(e) => tracing::warn!("plan revision failed, keeping plan: {}", e),
                    }
                }
            }
            i += 1;
        }

        plan.status = PlanStatus::Completed;
        Ok(())
    }
}

/// 用修订步骤替换 index 之后的全部步骤，并从 index 所在步骤的 id 之后重新编号。
/// 状态已由 parse_plan_response 归一（pending 或 skipped）
fn splice_tail(plan: &mut Plan, index: usize, revised: Vec<Step>) {
    let base = plan.steps[index].id;
    plan.steps.truncate(index + 1);
    plan.steps.extend(revised.into_iter().enumerate().map(|(n, mut step)| {
        step.id = base + n as u32 + 1;
        step
    }));
    tracing::info!(steps = plan.steps.len(), "plan revised");
}

fn fail_at(
    plan: &mut Plan,
    index: usize,
    reason: String,
    on_step: &mut (dyn FnMut(&Step, &str) + Send),
) -> AgentError {
    let step = &mut plan.steps[index];
    step.status = StepStatus::Failed;
    step.error = reason.clone();
    on_step(step, "");
    let step_id = step.id;
    plan.status = PlanStatus::Failed;
    tracing::warn!(step_id, error = %reason, "step failed");
    AgentError::PlanFailed {
        step_id,
        reason,
        plan: Box::new(plan.clone()),
    }
}

fn cancel_at(
    plan: &mut Plan,
    index: usize,
    on_step: &mut (dyn FnMut(&Step, &str) + Send),
) -> AgentError {
    let step = &mut plan.steps[index];
    step.status = StepStatus::Failed;
    step.error = "cancelled".to_string();
    on_step(step, "");
    plan.status = PlanStatus::Failed;
    AgentError::Cancelled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::tools::{Tool, ToolDefinition, ToolParams, ToolRegistry, ToolResult};
    use async_trait::async_trait;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// 按参数 ok 决定成败，并计数调用次数
    struct FlakyTool {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for FlakyTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "check".to_string(),
                description: "health check".to_string(),
                parameters: vec![],
            }
        }

        async fn execute(&self, params: &ToolParams) -> Result<ToolResult, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match params.get("ok").and_then(|v| v.as_bool()) {
                Some(false) => Ok(ToolResult::fail("service down")),
                _ => Ok(ToolResult::ok(serde_json::json!({"status": "up"}))),
            }
        }
    }

    fn tool_step(id: u32, ok: bool) -> Step {
        let mut params = Map::new();
        params.insert("ok".into(), serde_json::Value::Bool(ok));
        Step::tool(id, format!("check {id}"), "check", params)
    }

    fn executor() -> (Executor, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(ToolRegistry::new());
        registry.register(FlakyTool { calls: calls.clone() });
        let tools = Arc::new(ToolExecutor::new(registry, Duration::from_secs(5)));
        (Executor::new(tools), calls)
    }

    #[tokio::test]
    async fn test_fail_fast() {
        let (exec, calls) = executor();
        let mut plan = Plan::new("g", vec![tool_step(1, true), tool_step(2, false), tool_step(3, true)]);

        let err = exec.execute_plan(&mut plan, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, AgentError::PlanFailed { step_id: 2, .. }));
        assert_eq!(plan.steps[0].status, StepStatus::Completed);
        assert_eq!(plan.steps[0].result, r#"{"status":"up"}"#);
        assert_eq!(plan.steps[1].status, StepStatus::Failed);
        assert_eq!(plan.steps[1].error, "service down");
        assert_eq!(plan.steps[2].status, StepStatus::Pending);
        assert_eq!(plan.status, PlanStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let partial = err.partial_plan().unwrap();
        assert_eq!(partial.steps[0].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_skipped_steps_bypassed() {
        let (exec, calls) = executor();
        let mut skipped = tool_step(1, false);
        skipped.status = StepStatus::Skipped;
        let mut plan = Plan::new("g", vec![skipped, Step::answer(2, "all good")]);

        let mut seen = Vec::new();
        exec.execute_step_by_step(&mut plan, &CancellationToken::new(), &mut |s: &Step, r: &str| {
            seen.push((s.id, r.to_string()))
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(plan.steps[0].status, StepStatus::Skipped);
        assert_eq!(seen, vec![(2, "all good".to_string())]);
        assert_eq!(plan.status, PlanStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_step() {
        let (exec, _) = executor();
        let mut plan = Plan::new("g", vec![Step::tool(1, "x", "missing", Map::new())]);
        let err = exec.execute_plan(&mut plan, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.code(), "TOOL_EXEC_FAILED");
        assert!(plan.steps[0].error.contains("missing"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (exec, calls) = executor();
        let mut plan = Plan::new("g", vec![tool_step(1, true)]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = exec.execute_plan(&mut plan, &cancel).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert_eq!(plan.steps[0].status, StepStatus::Failed);
        assert_eq!(plan.steps[0].error, "cancelled");
        assert_eq!(plan.status, PlanStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_revision_replaces_tail() {
        let (exec, _) = executor();
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"steps":[{"id":7,"description":"escalate to on-call"}]}"#,
        ]));
        let exec = exec.with_planner(Arc::new(Planner::new(llm.clone())));
        let mut plan = Plan::new(
            "g",
            vec![tool_step(1, true), tool_step(2, true), tool_step(3, true)],
        );

        exec.execute_plan(&mut plan, &CancellationToken::new()).await.unwrap();

        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].id, 2);
        assert_eq!(plan.steps[1].description, "escalate to on-call");
        assert_eq!(plan.steps[1].status, StepStatus::Completed);
        // 只在第一步之后问了一次；最后一步是直接回答，不再修订
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_revision_keeps_skipped_steps() {
        let (exec, calls) = executor();
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"steps":[
                {"id":1,"description":"recheck","tool_name":"check","tool_params":{"ok":true},"status":"skipped"},
                {"id":2,"description":"done","status":"completed","result":"made up"}
            ]}"#,
        ]));
        let exec = exec.with_planner(Arc::new(Planner::new(llm)));
        let mut plan = Plan::new("g", vec![tool_step(1, true), tool_step(2, true)]);

        exec.execute_plan(&mut plan, &CancellationToken::new()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(plan.steps[1].status, StepStatus::Skipped);
        // 模型自称 completed 的步骤照常执行，结果来自执行而非模型
        assert_eq!(plan.steps[2].status, StepStatus::Completed);
        assert_eq!(plan.steps[2].result, "done");
        assert!(plan.results().all(|r| r != "made up"));
    }

    #[tokio::test]
    async fn test_revision_failure_ignored() {
        let (exec, _) = executor();
        let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()));
        llm.push_error("llm down");
        let exec = exec.with_planner(Arc::new(Planner::new(llm)));
        let mut plan = Plan::new("g", vec![tool_step(1, true), tool_step(2, true)]);

        exec.execute_plan(&mut plan, &CancellationToken::new()).await.unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(plan.steps.iter().all(|s| s.status == StepStatus::Completed));
    }

    #[tokio::test]
    async fn test_no_revision_without_tail() {
        let (exec, _) = executor();
        let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()));
        let exec = exec.with_planner(Arc::new(Planner::new(llm.clone())));
        let mut plan = Plan::new("g", vec![tool_step(1, true)]);
        exec.execute_plan(&mut plan, &CancellationToken::new()).await.unwrap();
        assert_eq!(llm.call_count(), 0);
    }
}
