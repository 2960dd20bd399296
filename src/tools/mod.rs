//! 工具层：封闭的工具目录、参数校验、执行分派与结果信封

pub mod executor;
pub mod poll;
pub mod registry;
pub mod result;
pub mod schema;

pub use executor::{ToolContext, ToolExecutor, ToolFailure};
pub use poll::Poll;
pub use registry::{
    HistoryDependency, ParamSpec, ParamType, ToolCategory, ToolDefinition, ToolKind, ToolRegistry,
    DEFINITIONS,
};
pub use result::{MediaKind, MediaRef, ToolResult};
pub use schema::{plan_schema_json, tool_call_schema_json};
