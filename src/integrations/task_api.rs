//! 任务 API：提交即返回 taskId，客户端轮询 /task-status 取结果
//!
//! Provider 回调只做确认，任务状态只由后台执行器写入台账。

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agent::AgentComponents;
use crate::integrations::uploads::{self, UPLOAD_BODY_LIMIT};
use crate::providers::GenerationKind;
use crate::react::{AgentResult, InboundMedia, NormalizedInput, QuotedMessage};
use crate::tasks::{GenerationJob, TaskData};

/// /start-task 接受的生成类型
const START_TASK_KINDS: &[GenerationKind] = &[
    GenerationKind::TextToImage,
    GenerationKind::TextToVideo,
    GenerationKind::TextToMusic,
    GenerationKind::TextToSpeech,
    GenerationKind::Translation,
    GenerationKind::Search,
];

#[derive(Clone)]
pub struct ApiState {
    pub agent: Arc<AgentComponents>,
    pub upload_dir: PathBuf,
}

pub fn router(state: ApiState) -> Router {
    let mut app = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/start-task", post(start_task))
        .route("/task-status/:task_id", get(task_status))
        .route("/agent/route", post(agent_route))
        .route("/:provider/callback", post(provider_callback));
    for rule in uploads::RULES {
        app = app.route(
            rule.route,
            post(move |state: State<ApiState>, multipart: Multipart| {
                uploads::handle_upload(state, rule, multipart)
            }),
        );
    }
    app.layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct StartTaskRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartTaskResponse {
    #[serde(rename = "taskId")]
    pub task_id: String,
}

async fn start_task(
    State(state): State<ApiState>,
    Json(req): Json<StartTaskRequest>,
) -> Result<Json<StartTaskResponse>, (StatusCode, String)> {
    let kind = GenerationKind::parse(&req.kind)
        .filter(|k| START_TASK_KINDS.contains(k))
        .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("unsupported task type '{}'", req.kind)))?;
    let prompt = req.prompt.trim();
    if prompt.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "prompt is required".to_string()));
    }

    let job = GenerationJob {
        kind,
        params: text_params(kind, prompt, req.language.as_deref()),
        provider: req.provider.filter(|p| !p.trim().is_empty()),
        prompt: Some(prompt.to_string()),
    };
    submit(&state, job).await
}

/// 纯文本类生成的参数；同一段文本按能力放进 prompt / text / query
fn text_params(kind: GenerationKind, prompt: &str, language: Option<&str>) -> Value {
    let mut params = json!({ "prompt": prompt });
    match kind {
        GenerationKind::TextToSpeech | GenerationKind::Translation => params["text"] = json!(prompt),
        GenerationKind::Search => params["query"] = json!(prompt),
        _ => {}
    }
    if let Some(lang) = language.filter(|l| !l.trim().is_empty()) {
        params["language"] = json!(lang);
        if kind == GenerationKind::Translation {
            params["target_language"] = json!(lang);
        }
    }
    params
}

pub(crate) async fn submit(
    state: &ApiState,
    job: GenerationJob,
) -> Result<Json<StartTaskResponse>, (StatusCode, String)> {
    let (task_id, _handle) = state
        .agent
        .runner
        .submit(job)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(StartTaskResponse { task_id }))
}

#[derive(Debug, Serialize)]
pub struct TaskStatusResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<TaskData> for TaskStatusResponse {
    fn from(task: TaskData) -> Self {
        let field = |name: &str| {
            task.result
                .as_ref()
                .and_then(|r| r.get(name))
                .filter(|v| !v.is_null())
                .cloned()
        };
        Self {
            status: task.status.as_str(),
            result: field("result"),
            text: field("text"),
            cost: field("cost"),
            error: task.error.clone(),
        }
    }
}

async fn task_status(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatusResponse>, (StatusCode, String)> {
    let task = state
        .agent
        .ledger
        .get(&task_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(match task {
        Some(task) => task.into(),
        None => TaskStatusResponse {
            status: "not_found",
            result: None,
            text: None,
            cost: None,
            error: None,
        },
    }))
}

/// Provider 完成回调：只记录并确认
async fn provider_callback(Path(provider): Path<String>, body: Bytes) -> Json<Value> {
    tracing::info!(provider = %provider, bytes = body.len(), "Provider callback received");
    Json(json!({ "received": true }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRouteRequest {
    pub conversation_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub media: Vec<InboundMedia>,
    #[serde(default)]
    pub quoted: Option<QuotedMessage>,
}

async fn agent_route(
    State(state): State<ApiState>,
    Json(req): Json<AgentRouteRequest>,
) -> Result<Json<AgentResult>, (StatusCode, String)> {
    let conversation_id = req.conversation_id.trim();
    if conversation_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "conversationId is required".to_string()));
    }
    let input = NormalizedInput {
        text: req.text,
        media: req.media,
        quoted: req.quoted,
    };
    if input.text.trim().is_empty() && !input.is_self_contained() {
        return Err((StatusCode::BAD_REQUEST, "empty message".to_string()));
    }
    Ok(Json(state.agent.route_to_agent(&input, conversation_id).await))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_params_per_kind() {
        let p = text_params(GenerationKind::Translation, "hola", Some("en"));
        assert_eq!(p["text"], "hola");
        assert_eq!(p["target_language"], "en");

        let p = text_params(GenerationKind::Search, "rust news", None);
        assert_eq!(p["query"], "rust news");
        assert!(p.get("language").is_none());
    }
}
