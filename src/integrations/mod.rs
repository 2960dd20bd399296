//! 对外 HTTP 接口（feature `server`）：异步任务模式的生成接口、文件上传与 Agent 路由

pub mod task_api;
pub mod uploads;

pub use task_api::{router, ApiState};
