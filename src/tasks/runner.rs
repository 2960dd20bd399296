//! 后台生成任务执行器
//!
//! HTTP 接口收到 /start-task 或上传请求后：台账建 pending 行，立即返回 taskId，
//! 在后台 tokio 任务中经回退链调用 Provider，结束时写入 done / failed。并发由 Semaphore 限制。

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::StoreError;
use crate::providers::{FallbackCoordinator, GenerationKind};
use crate::tasks::TaskLedger;

/// 一个待执行的生成请求
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub kind: GenerationKind,
    pub params: Value,
    /// 用户点名的 Provider
    pub provider: Option<String>,
    /// 完成时写入 `text` 字段的提示词
    pub prompt: Option<String>,
}

pub struct TaskRunner {
    ledger: Arc<dyn TaskLedger>,
    coordinator: Arc<FallbackCoordinator>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl TaskRunner {
    pub fn new(
        ledger: Arc<dyn TaskLedger>,
        coordinator: Arc<FallbackCoordinator>,
        max_concurrent: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ledger,
            coordinator,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            shutdown,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn TaskLedger> {
        &self.ledger
    }

    /// 建台账行并在后台执行；返回 taskId 与后台任务句柄
    pub async fn submit(&self, job: GenerationJob) -> Result<(String, JoinHandle<()>), StoreError> {
        let task_id = self.ledger.create(Some(job.kind.as_str())).await?;
        tracing::info!(task_id = %task_id, kind = %job.kind, provider = ?job.provider, "Generation task admitted");
        let handle = self.spawn(task_id.clone(), job);
        Ok((task_id, handle))
    }

    fn spawn(&self, task_id: String, job: GenerationJob) -> JoinHandle<()> {
        let ledger = Arc::clone(&self.ledger);
        let coordinator = Arc::clone(&self.coordinator);
        let permits = Arc::clone(&self.permits);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let permit = tokio::select! {
                p = permits.acquire_owned() => p,
                _ = shutdown.cancelled() => {
                    record_failure(&*ledger, &task_id, "server is shutting down").await;
                    return;
                }
            };
            let Ok(_permit) = permit else {
                record_failure(&*ledger, &task_id, "task runner closed").await;
                return;
            };

            let outcome = coordinator
                .invoke(job.kind, &job.params, job.provider.as_deref())
                .await;

            match outcome {
                Ok(out) => {
                    let output = out.output;
                    let result = json!({
                        "result": output.media_url.clone().or_else(|| output.text.clone()),
                        "text": job.prompt.clone().or(output.text),
                        "cost": output.cost,
                        "provider": out.provider.clone(),
                        "data": output.data,
                    });
                    match ledger.complete(&task_id, result).await {
                        Ok(_) => tracing::info!(task_id = %task_id, provider = %out.provider, "Generation task done"),
                        Err(e) => tracing::warn!(task_id = %task_id, error = %e, "Failed to record task completion"),
                    }
                }
                Err(e) => record_failure(&*ledger, &task_id, &e.message).await,
            }
        })
    }
}

async fn record_failure(ledger: &dyn TaskLedger, task_id: &str, message: &str) {
    tracing::warn!(task_id = %task_id, error = %message, "Generation task failed");
    if let Err(e) = ledger.fail(task_id, message).await {
        tracing::warn!(task_id = %task_id, error = %e, "Failed to record task failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ProviderError, ProviderOutput, ProviderRegistry, ScriptedProvider};
    use crate::tasks::{InMemoryTaskLedger, TaskStatus};

    fn runner(provider: ScriptedProvider) -> TaskRunner {
        let mut reg = ProviderRegistry::new();
        reg.register(Arc::new(provider));
        let coordinator = FallbackCoordinator::new(Arc::new(reg));
        TaskRunner::new(
            Arc::new(InMemoryTaskLedger::new()),
            Arc::new(coordinator),
            2,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_submit_completes_with_url_and_prompt() {
        let runner = runner(
            ScriptedProvider::new("gemini").then_ok(ProviderOutput::media("https://cdn/bike.png").with_cost(0.02)),
        );
        let (id, handle) = runner
            .submit(GenerationJob {
                kind: GenerationKind::TextToImage,
                params: json!({"prompt": "a red bicycle"}),
                provider: None,
                prompt: Some("a red bicycle".into()),
            })
            .await
            .unwrap();
        handle.await.unwrap();

        let task = runner.ledger().get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        let result = task.result.unwrap();
        assert_eq!(result["result"], "https://cdn/bike.png");
        assert_eq!(result["text"], "a red bicycle");
        assert_eq!(result["provider"], "gemini");
    }

    #[tokio::test]
    async fn test_submit_records_failure() {
        let runner = runner(
            ScriptedProvider::new("gemini").failing_with(ProviderError::PolicyBlocked("unsafe".into())),
        );
        let (id, handle) = runner
            .submit(GenerationJob {
                kind: GenerationKind::TextToImage,
                params: json!({"prompt": "x"}),
                provider: None,
                prompt: None,
            })
            .await
            .unwrap();
        handle.await.unwrap();

        let task = runner.ledger().get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("unsafe"));
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiting_tasks() {
        let mut reg = ProviderRegistry::new();
        reg.register(Arc::new(ScriptedProvider::new("p")));
        let token = CancellationToken::new();
        let runner = TaskRunner::new(
            Arc::new(InMemoryTaskLedger::new()),
            Arc::new(FallbackCoordinator::new(Arc::new(reg))),
            1,
            token.clone(),
        );
        // 占住唯一的许可
        let _held = runner.permits.clone().acquire_owned().await.unwrap();
        let (id, handle) = runner
            .submit(GenerationJob {
                kind: GenerationKind::Search,
                params: json!({"query": "rust"}),
                provider: None,
                prompt: None,
            })
            .await
            .unwrap();
        token.cancel();
        handle.await.unwrap();
        assert_eq!(
            runner.ledger().get(&id).await.unwrap().unwrap().status,
            TaskStatus::Failed
        );
    }
}
