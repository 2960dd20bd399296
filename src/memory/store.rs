//! 会话存储
//!
//! 每个会话持久化：有上限的消息历史、清洗后的 lastCommand、长期偏好与历史摘要。
//! SQLite 版本与任务台账共用连接池；内存版本用于测试与单实例联调。
//! 调用方可以跳过历史读取（自包含请求），存储不依赖被调用的顺序。

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tokio::sync::RwLock;

use crate::db::StoreError;
use crate::memory::{ConversationMemory, HistoryMessage, LastCommand, Role};

/// 长期记忆：用户偏好（key -> value）与按时间排列的历史摘要
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LongTermMemory {
    pub preferences: BTreeMap<String, String>,
    pub summaries: Vec<String>,
}

impl LongTermMemory {
    pub fn is_empty(&self) -> bool {
        self.preferences.is_empty() && self.summaries.is_empty()
    }

    /// 渲染为注入 prompt 的文本块；为空时返回 None
    pub fn prompt_block(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let mut out = String::new();
        if !self.preferences.is_empty() {
            out.push_str("User preferences:\n");
            for (k, v) in &self.preferences {
                out.push_str(&format!("- {k}: {v}\n"));
            }
        }
        if !self.summaries.is_empty() {
            out.push_str("Earlier conversation summary:\n");
            for s in &self.summaries {
                out.push_str(&format!("- {s}\n"));
            }
        }
        Some(out.trim_end().to_string())
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// 追加一条消息，超出上限时丢弃最旧的
    async fn append_message(&self, conversation_id: &str, message: HistoryMessage) -> Result<(), StoreError>;

    /// 最近 limit 条，按时间正序
    async fn get_recent_history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>, StoreError>;

    async fn get_last_command(&self, conversation_id: &str) -> Result<Option<LastCommand>, StoreError>;

    /// 覆盖写入（last-write-wins）；调用方负责只传入可持久化工具的清洗结果
    async fn save_last_command(&self, conversation_id: &str, command: &LastCommand) -> Result<(), StoreError>;

    async fn get_long_term_memory(&self, conversation_id: &str) -> Result<LongTermMemory, StoreError>;

    async fn set_preference(&self, conversation_id: &str, key: &str, value: &str) -> Result<(), StoreError>;

    async fn add_summary(&self, conversation_id: &str, summary: &str) -> Result<(), StoreError>;

    /// 写入摘要并只保留最近 keep_recent 条消息
    async fn replace_history_with_summary(
        &self,
        conversation_id: &str,
        summary: &str,
        keep_recent: usize,
    ) -> Result<(), StoreError>;

    async fn message_count(&self, conversation_id: &str) -> Result<usize, StoreError>;

    /// 删除会话的全部数据
    async fn clear(&self, conversation_id: &str) -> Result<(), StoreError>;
}

/// SQLite 会话存储
pub struct SqliteConversationStore {
    pool: SqlitePool,
    max_messages: usize,
}

impl SqliteConversationStore {
    pub async fn new(pool: SqlitePool, max_messages: usize) -> Result<Self, StoreError> {
        let store = Self { pool, max_messages };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversation_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversation_messages ON conversation_messages(conversation_id, id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversation_state (
                conversation_id TEXT PRIMARY KEY,
                last_command TEXT,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversation_preferences (
                conversation_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (conversation_id, key)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversation_summaries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                summary TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn trim_messages(&self, conversation_id: &str, keep: usize) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM conversation_messages
             WHERE conversation_id = ?
               AND id NOT IN (
                 SELECT id FROM conversation_messages
                 WHERE conversation_id = ?
                 ORDER BY id DESC
                 LIMIT ?
               )",
        )
        .bind(conversation_id)
        .bind(conversation_id)
        .bind(keep as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn append_message(&self, conversation_id: &str, message: HistoryMessage) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO conversation_messages (conversation_id, role, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.trim_messages(conversation_id, self.max_messages).await
    }

    async fn get_recent_history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT role, content, created_at FROM conversation_messages
             WHERE conversation_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<HistoryMessage> = rows
            .into_iter()
            .map(|row| {
                let role: String = row.get("role");
                let created_at: String = row.get("created_at");
                HistoryMessage {
                    role: Role::parse(&role),
                    content: row.get("content"),
                    timestamp: parse_timestamp(&created_at),
                }
            })
            .collect();
        messages.reverse();
        Ok(messages)
    }

    async fn get_last_command(&self, conversation_id: &str) -> Result<Option<LastCommand>, StoreError> {
        let row = sqlx::query("SELECT last_command FROM conversation_state WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw: Option<String> = row.get("last_command");
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save_last_command(&self, conversation_id: &str, command: &LastCommand) -> Result<(), StoreError> {
        let json = serde_json::to_string(&command.sanitized())?;
        sqlx::query(
            "INSERT INTO conversation_state (conversation_id, last_command, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(conversation_id) DO UPDATE SET last_command = excluded.last_command, updated_at = excluded.updated_at",
        )
        .bind(conversation_id)
        .bind(json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_long_term_memory(&self, conversation_id: &str) -> Result<LongTermMemory, StoreError> {
        let prefs = sqlx::query(
            "SELECT key, value FROM conversation_preferences WHERE conversation_id = ? ORDER BY key",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        let summaries = sqlx::query(
            "SELECT summary FROM conversation_summaries WHERE conversation_id = ? ORDER BY id ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(LongTermMemory {
            preferences: prefs
                .into_iter()
                .map(|r| (r.get::<String, _>("key"), r.get::<String, _>("value")))
                .collect(),
            summaries: summaries.into_iter().map(|r| r.get("summary")).collect(),
        })
    }

    async fn set_preference(&self, conversation_id: &str, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO conversation_preferences (conversation_id, key, value, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(conversation_id, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(conversation_id)
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_summary(&self, conversation_id: &str, summary: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO conversation_summaries (conversation_id, summary, created_at) VALUES (?, ?, ?)",
        )
        .bind(conversation_id)
        .bind(summary)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_history_with_summary(
        &self,
        conversation_id: &str,
        summary: &str,
        keep_recent: usize,
    ) -> Result<(), StoreError> {
        self.add_summary(conversation_id, summary).await?;
        self.trim_messages(conversation_id, keep_recent).await
    }

    async fn message_count(&self, conversation_id: &str) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM conversation_messages WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.get("n");
        Ok(n.max(0) as usize)
    }

    async fn clear(&self, conversation_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "conversation_messages",
            "conversation_state",
            "conversation_preferences",
            "conversation_summaries",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE conversation_id = ?"))
                .bind(conversation_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug)]
struct ConversationState {
    messages: ConversationMemory,
    last_command: Option<LastCommand>,
    long_term: LongTermMemory,
}

/// 内存会话存储（测试与单实例联调）
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<String, ConversationState>>,
    max_messages: usize,
}

impl InMemoryConversationStore {
    pub fn new(max_messages: usize) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            max_messages,
        }
    }

    fn fresh_state(&self) -> ConversationState {
        ConversationState {
            messages: ConversationMemory::new(self.max_messages),
            last_command: None,
            long_term: LongTermMemory::default(),
        }
    }
}

impl Default for InMemoryConversationStore {
    fn default() -> Self {
        Self::new(200)
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn append_message(&self, conversation_id: &str, message: HistoryMessage) -> Result<(), StoreError> {
        let mut map = self.conversations.write().await;
        map.entry(conversation_id.to_string())
            .or_insert_with(|| self.fresh_state())
            .messages
            .push(message);
        Ok(())
    }

    async fn get_recent_history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>, StoreError> {
        let map = self.conversations.read().await;
        Ok(map
            .get(conversation_id)
            .map(|s| s.messages.recent(limit))
            .unwrap_or_default())
    }

    async fn get_last_command(&self, conversation_id: &str) -> Result<Option<LastCommand>, StoreError> {
        let map = self.conversations.read().await;
        Ok(map.get(conversation_id).and_then(|s| s.last_command.clone()))
    }

    async fn save_last_command(&self, conversation_id: &str, command: &LastCommand) -> Result<(), StoreError> {
        let mut map = self.conversations.write().await;
        map.entry(conversation_id.to_string())
            .or_insert_with(|| self.fresh_state())
            .last_command = Some(command.sanitized());
        Ok(())
    }

    async fn get_long_term_memory(&self, conversation_id: &str) -> Result<LongTermMemory, StoreError> {
        let map = self.conversations.read().await;
        Ok(map
            .get(conversation_id)
            .map(|s| s.long_term.clone())
            .unwrap_or_default())
    }

    async fn set_preference(&self, conversation_id: &str, key: &str, value: &str) -> Result<(), StoreError> {
        let mut map = self.conversations.write().await;
        map.entry(conversation_id.to_string())
            .or_insert_with(|| self.fresh_state())
            .long_term
            .preferences
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn add_summary(&self, conversation_id: &str, summary: &str) -> Result<(), StoreError> {
        let mut map = self.conversations.write().await;
        map.entry(conversation_id.to_string())
            .or_insert_with(|| self.fresh_state())
            .long_term
            .summaries
            .push(summary.to_string());
        Ok(())
    }

    async fn replace_history_with_summary(
        &self,
        conversation_id: &str,
        summary: &str,
        keep_recent: usize,
    ) -> Result<(), StoreError> {
        let mut map = self.conversations.write().await;
        let state = map
            .entry(conversation_id.to_string())
            .or_insert_with(|| self.fresh_state());
        state.long_term.summaries.push(summary.to_string());
        state.messages.retain_recent(keep_recent);
        Ok(())
    }

    async fn message_count(&self, conversation_id: &str) -> Result<usize, StoreError> {
        let map = self.conversations.read().await;
        Ok(map.get(conversation_id).map(|s| s.messages.len()).unwrap_or(0))
    }

    async fn clear(&self, conversation_id: &str) -> Result<(), StoreError> {
        self.conversations.write().await.remove(conversation_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_pool;
    use crate::memory::last_command::MAX_TEXT_CHARS;
    use crate::memory::{SanitizedResult, StepTrace};
    use crate::tools::ToolKind;
    use serde_json::json;

    async fn sqlite_store(dir: &tempfile::TempDir, max: usize) -> SqliteConversationStore {
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("conv.db").display());
        let pool = connect_pool(&url).await.unwrap();
        SqliteConversationStore::new(pool, max).await.unwrap()
    }

    fn sample_command() -> LastCommand {
        LastCommand {
            tool: ToolKind::CreateImage,
            arguments: json!({"prompt": "a red bicycle"}),
            result: SanitizedResult {
                success: true,
                media_urls: vec!["https://cdn/x.png".into()],
                text: None,
                provider: Some("gemini".into()),
                error: None,
            },
            prompt: "draw a red bicycle".into(),
            steps: Vec::new(),
            saved_at: Utc::now(),
        }
    }

    async fn exercise(store: &dyn ConversationStore) {
        for i in 0..5 {
            store
                .append_message("c1", HistoryMessage::new(Role::User, format!("m{i}")))
                .await
                .unwrap();
        }
        // 上限 4：最旧的一条被丢弃
        assert_eq!(store.message_count("c1").await.unwrap(), 4);
        let recent = store.get_recent_history("c1", 2).await.unwrap();
        assert_eq!(
            recent.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["m3", "m4"]
        );
        assert!(store.get_recent_history("other", 5).await.unwrap().is_empty());

        assert!(store.get_last_command("c1").await.unwrap().is_none());
        let cmd = sample_command();
        store.save_last_command("c1", &cmd).await.unwrap();
        let loaded = store.get_last_command("c1").await.unwrap().unwrap();
        assert_eq!(loaded.tool, ToolKind::CreateImage);
        assert_eq!(loaded.result, cmd.result);

        store.set_preference("c1", "language", "spanish").await.unwrap();
        store.set_preference("c1", "language", "french").await.unwrap();
        store.replace_history_with_summary("c1", "talked about bikes", 1).await.unwrap();
        let ltm = store.get_long_term_memory("c1").await.unwrap();
        assert_eq!(ltm.preferences.get("language").map(String::as_str), Some("french"));
        assert_eq!(ltm.summaries, vec!["talked about bikes"]);
        assert_eq!(store.message_count("c1").await.unwrap(), 1);
        assert!(ltm.prompt_block().unwrap().contains("language: french"));

        store.clear("c1").await.unwrap();
        assert_eq!(store.message_count("c1").await.unwrap(), 0);
        assert!(store.get_last_command("c1").await.unwrap().is_none());
        assert!(store.get_long_term_memory("c1").await.unwrap().is_empty());
    }

    async fn save_strips_unsanitized_fields(store: &dyn ConversationStore) {
        let mut cmd = sample_command();
        cmd.arguments = json!({
            "prompt": "a red bicycle",
            "history": [{"role": "user", "content": "earlier"}],
            "input_path": "/tmp/upload.png"
        });
        cmd.result.text = Some("x".repeat(2000));
        cmd.steps = vec![StepTrace {
            step_number: 1,
            tool: ToolKind::EditImage,
            arguments: json!({"prompt": "add a hat", "input_path": "/tmp/cat.png"}),
            success: true,
        }];
        store.save_last_command("c2", &cmd).await.unwrap();

        let loaded = store.get_last_command("c2").await.unwrap().unwrap();
        assert_eq!(loaded.arguments, json!({"prompt": "a red bicycle"}));
        assert_eq!(loaded.result.text.as_ref().unwrap().chars().count(), MAX_TEXT_CHARS);
        assert_eq!(loaded.steps[0].arguments, json!({"prompt": "add a hat"}));
    }

    #[tokio::test]
    async fn test_save_last_command_sanitizes_in_both_backends() {
        save_strips_unsanitized_fields(&InMemoryConversationStore::new(4)).await;
        let dir = tempfile::tempdir().unwrap();
        save_strips_unsanitized_fields(&sqlite_store(&dir, 4).await).await;
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryConversationStore::new(4);
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir, 4).await;
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = sqlite_store(&dir, 10).await;
            store
                .append_message("c", HistoryMessage::new(Role::Assistant, "hello"))
                .await
                .unwrap();
            store.save_last_command("c", &sample_command()).await.unwrap();
        }
        let store = sqlite_store(&dir, 10).await;
        let history = store.get_recent_history("c", 10).await.unwrap();
        assert_eq!(history[0].role, Role::Assistant);
        assert!(store.get_last_command("c").await.unwrap().is_some());
    }
}
