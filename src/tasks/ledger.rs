//! 任务台账：异步任务状态（pending / done / failed）
//!
//! 状态只允许 pending -> done | failed 一次。终态写入只作用于 pending 行；
//! 对已终结的行再次写终态是一次记录日志的空操作，所以 complete(R) 之后 get 始终返回 R。
//! 多实例部署时共用同一个 SQLite 库；行不会被删除。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tokio::sync::RwLock;

use crate::db::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "done" => TaskStatus::Done,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskData {
    pub id: String,
    /// 任务类型标签，如 text-to-image、agent-turn
    pub kind: Option<String>,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskData {
    fn pending(id: String, kind: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind: kind.map(String::from),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
pub trait TaskLedger: Send + Sync {
    /// 新建 pending 任务并返回其 id
    async fn create(&self, kind: Option<&str>) -> Result<String, StoreError>;

    /// 确保任务存在且为 pending：缺失则插入，已终结的不回退
    async fn set_pending(&self, task_id: &str) -> Result<(), StoreError>;

    /// 写入 done；返回是否生效
    async fn complete(&self, task_id: &str, result: Value) -> Result<bool, StoreError>;

    /// 写入 failed；返回是否生效
    async fn fail(&self, task_id: &str, error: &str) -> Result<bool, StoreError>;

    /// 未知 id 返回 None
    async fn get(&self, task_id: &str) -> Result<Option<TaskData>, StoreError>;
}

fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// SQLite 任务台账
pub struct SqliteTaskLedger {
    pool: SqlitePool,
}

impl SqliteTaskLedger {
    pub async fn new(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS genie_tasks (
                id TEXT PRIMARY KEY,
                kind TEXT,
                status TEXT NOT NULL,
                result TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_genie_tasks_status ON genie_tasks(status)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// 终态写入：先尝试更新 pending 行；行不存在则直接插入终态行；否则为空操作
    async fn finish(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<String>,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let updated = sqlx::query(
            "UPDATE genie_tasks SET status = ?, result = ?, error = ?, updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(&result)
        .bind(error)
        .bind(&now)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() > 0 {
            return Ok(true);
        }

        let inserted = sqlx::query(
            "INSERT INTO genie_tasks (id, kind, status, result, error, created_at, updated_at)
             VALUES (?, NULL, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(task_id)
        .bind(status.as_str())
        .bind(&result)
        .bind(error)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() > 0 {
            tracing::warn!(task_id = %task_id, status = status.as_str(), "Terminal write for unknown task, row created");
            return Ok(true);
        }

        tracing::warn!(task_id = %task_id, status = status.as_str(), "Task already terminal, write ignored");
        Ok(false)
    }
}

#[async_trait]
impl TaskLedger for SqliteTaskLedger {
    async fn create(&self, kind: Option<&str>) -> Result<String, StoreError> {
        let task = TaskData::pending(new_task_id(), kind);
        sqlx::query(
            "INSERT INTO genie_tasks (id, kind, status, result, error, created_at, updated_at)
             VALUES (?, ?, 'pending', NULL, NULL, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.kind)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        tracing::debug!(task_id = %task.id, kind = ?task.kind, "Task created");
        Ok(task.id)
    }

    async fn set_pending(&self, task_id: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO genie_tasks (id, kind, status, result, error, created_at, updated_at)
             VALUES (?, NULL, 'pending', NULL, NULL, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(task_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete(&self, task_id: &str, result: Value) -> Result<bool, StoreError> {
        let json = serde_json::to_string(&result)?;
        self.finish(task_id, TaskStatus::Done, Some(json), None).await
    }

    async fn fail(&self, task_id: &str, error: &str) -> Result<bool, StoreError> {
        self.finish(task_id, TaskStatus::Failed, None, Some(error)).await
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskData>, StoreError> {
        let row = sqlx::query(
            "SELECT id, kind, status, result, error, created_at, updated_at FROM genie_tasks WHERE id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.get("status");
        let result: Option<String> = row.get("result");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");
        Ok(Some(TaskData {
            id: row.get("id"),
            kind: row.get("kind"),
            status: TaskStatus::parse(&status),
            result: result.map(|r| serde_json::from_str(&r)).transpose()?,
            error: row.get("error"),
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        }))
    }
}

/// 内存任务台账（测试与单实例联调）
#[derive(Default)]
pub struct InMemoryTaskLedger {
    tasks: RwLock<HashMap<String, TaskData>>,
}

impl InMemoryTaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    async fn finish(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<&str>,
    ) -> bool {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .entry(task_id.to_string())
            .or_insert_with(|| TaskData::pending(task_id.to_string(), None));
        if task.status.is_terminal() {
            tracing::warn!(task_id = %task_id, status = status.as_str(), "Task already terminal, write ignored");
            return false;
        }
        task.status = status;
        task.result = result;
        task.error = error.map(String::from);
        task.updated_at = Utc::now();
        true
    }
}

#[async_trait]
impl TaskLedger for InMemoryTaskLedger {
    async fn create(&self, kind: Option<&str>) -> Result<String, StoreError> {
        let task = TaskData::pending(new_task_id(), kind);
        let id = task.id.clone();
        self.tasks.write().await.insert(id.clone(), task);
        Ok(id)
    }

    async fn set_pending(&self, task_id: &str) -> Result<(), StoreError> {
        self.tasks
            .write()
            .await
            .entry(task_id.to_string())
            .or_insert_with(|| TaskData::pending(task_id.to_string(), None));
        Ok(())
    }

    async fn complete(&self, task_id: &str, result: Value) -> Result<bool, StoreError> {
        Ok(self.finish(task_id, TaskStatus::Done, Some(result), None).await)
    }

    async fn fail(&self, task_id: &str, error: &str) -> Result<bool, StoreError> {
        Ok(self.finish(task_id, TaskStatus::Failed, None, Some(error)).await)
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskData>, StoreError> {
        Ok(self.tasks.read().await.get(task_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_pool;
    use serde_json::json;

    async fn exercise(ledger: &dyn TaskLedger) {
        let id = ledger.create(Some("text-to-image")).await.unwrap();
        let task = ledger.get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.kind.as_deref(), Some("text-to-image"));

        let result = json!({"result": "https://cdn/x.png", "text": "a red bicycle"});
        assert!(ledger.complete(&id, result.clone()).await.unwrap());
        // 之后的终态写入与 set_pending 都不会改变结果
        assert!(!ledger.fail(&id, "late failure").await.unwrap());
        assert!(!ledger.complete(&id, json!({"result": "other"})).await.unwrap());
        ledger.set_pending(&id).await.unwrap();

        let task = ledger.get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.result, Some(result));
        assert_eq!(task.error, None);

        assert!(ledger.get("no-such-task").await.unwrap().is_none());

        // set_pending 插入缺失的行
        ledger.set_pending("external-1").await.unwrap();
        assert_eq!(
            ledger.get("external-1").await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
        assert!(ledger.fail("external-1", "provider exploded").await.unwrap());
        let failed = ledger.get("external-1").await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("provider exploded"));
    }

    #[tokio::test]
    async fn test_in_memory_ledger() {
        exercise(&InMemoryTaskLedger::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("tasks.db").display());
        let ledger = SqliteTaskLedger::new(connect_pool(&url).await.unwrap()).await.unwrap();
        exercise(&ledger).await;
    }

    #[tokio::test]
    async fn test_sqlite_ledger_shared_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("tasks.db").display());
        let a = SqliteTaskLedger::new(connect_pool(&url).await.unwrap()).await.unwrap();
        let b = SqliteTaskLedger::new(connect_pool(&url).await.unwrap()).await.unwrap();

        let id = a.create(None).await.unwrap();
        b.complete(&id, json!({"text": "done elsewhere"})).await.unwrap();
        let seen = a.get(&id).await.unwrap().unwrap();
        assert_eq!(seen.status, TaskStatus::Done);
    }
}
