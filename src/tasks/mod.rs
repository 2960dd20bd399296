//! 异步任务：台账（状态持久化）与后台生成执行器

pub mod ledger;
pub mod runner;

pub use ledger::{InMemoryTaskLedger, SqliteTaskLedger, TaskData, TaskLedger, TaskStatus};
pub use runner::{GenerationJob, TaskRunner};
