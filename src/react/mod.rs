//! 执行引擎：意图规划、决策函数、单步 / 多步执行循环、重试与结果聚合

pub mod aggregator;
pub mod decision;
pub mod events;
pub mod history;
pub mod input;
pub mod loop_;
pub mod multi_step;
pub mod planner;
pub mod retry;

pub use aggregator::{AgentResult, ResultAggregator, ToolCallRecord};
pub use decision::{parse_decision, Decision, DecisionMaker, ToolCall, DEFAULT_SYSTEM_PROMPT};
pub use events::{send_event, AgentEvent};
pub use history::{history_limit_for, inject_history};
pub use input::{ContextMarkers, InboundMedia, NormalizedInput, QuotedMessage};
pub use loop_::{AgentEngine, EngineSettings, ExecuteOptions};
pub use planner::{has_sequencing_language, IntentPlanner, Plan, PlanStep};
pub use retry::{plan_retry, RetryPlan, RetryRequest, RetryTarget};
