//! 核心层：错误分类、恢复策略、优雅关闭

pub mod error;
pub mod recovery;
pub mod shutdown;

pub use error::{AgentError, RecoveryAction};
pub use recovery::RecoveryEngine;
pub use shutdown::{ShutdownManager, ShutdownReason};
