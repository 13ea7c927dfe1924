//! 工具层：Tool trait、注册表、执行器与运维诊断工具

pub mod executor;
pub mod log_query;
pub mod monitor;
pub mod registry;

pub use executor::ToolExecutor;
pub use log_query::{HttpLogClient, LogClient, LogQueryTool};
pub use monitor::{AlertQueryTool, HttpMonitorClient, MonitorClient, MonitorMetricsTool};
pub use registry::{
    int_param, str_param, Tool, ToolDefinition, ToolParameter, ToolParams, ToolRegistry,
    ToolResult,
};
