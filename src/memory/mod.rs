//! 记忆层：对话消息、会话存储（历史 / lastCommand / 长期偏好与摘要）

pub mod conversation;
pub mod last_command;
pub mod store;

pub use conversation::{ConversationMemory, HistoryMessage, Message, Role};
pub use last_command::{sanitize_args, sanitize_result, LastCommand, SanitizedResult, StepTrace};
pub use store::{
    ConversationStore, InMemoryConversationStore, LongTermMemory, SqliteConversationStore,
};
