//! Genie - 消息渠道生成式助手的 Agent 执行引擎
//!
//! 模块划分：
//! - **agent**: 组件装配与 `route_to_agent`（轮后持久化、偏好、压缩）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、恢复策略、优雅关闭
//! - **db**: SQLite 连接池与存储错误
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 会话历史、lastCommand、长期偏好与摘要
//! - **observability**: tracing 订阅器
//! - **providers**: 生成服务 Provider、失败分类与回退链路
//! - **react**: 意图规划、决策、单步 / 多步执行循环、结果聚合
//! - **tasks**: 任务台账与后台生成执行器
//! - **tools**: 工具定义表、参数校验与执行器
//! - **integrations**: HTTP 任务接口（feature `server`）

pub mod agent;
pub mod config;
pub mod core;
pub mod db;
#[cfg(feature = "server")]
pub mod integrations;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod providers;
pub mod react;
pub mod tasks;
pub mod tools;

pub use agent::{create_agent_components, AgentComponents};
pub use react::{AgentResult, NormalizedInput};
