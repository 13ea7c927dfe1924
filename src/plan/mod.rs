//! Plan-Execute：计划类型、规划器、执行器、流式输出格式

pub mod events;
pub mod executor;
pub mod planner;
pub mod types;

pub use events::{format_error_chunk, format_step_chunk, StreamEvent};
pub use executor::Executor;
pub use planner::{extract_json, parse_plan_response, plan_schema_json, Planner};
pub use types::{Plan, PlanStatus, Step, StepStatus};
