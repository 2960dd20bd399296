//! 多部分上传：校验文件类型与大小，落盘后作为后台生成任务提交
//!
//! 字段：`file`（必填）、`prompt`、`provider`、`language`。文件以 uuid 命名保存在 upload_dir，
//! 路径通过参数 `input_path` 传给 Provider（不会进入 lastCommand）。

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    Json,
};
use serde_json::json;
use uuid::Uuid;

use crate::integrations::task_api::{submit, ApiState, StartTaskResponse};
use crate::providers::GenerationKind;
use crate::tasks::GenerationJob;

const KB: usize = 1024;
const MB: usize = 1024 * KB;

/// 请求体上限，略大于最大的单文件限制
pub const UPLOAD_BODY_LIMIT: usize = 101 * MB;

const IMAGE_TYPES: &[&str] = &["image/png", "image/jpeg", "image/webp"];
const VIDEO_TYPES: &[&str] = &["video/mp4", "video/quicktime", "video/webm"];
const AUDIO_TYPES: &[&str] = &["audio/mpeg", "audio/ogg", "audio/wav", "audio/webm", "audio/mp4"];

/// 单个上传路由的校验规则
#[derive(Debug)]
pub struct UploadRule {
    pub route: &'static str,
    pub kind: GenerationKind,
    pub mime_types: &'static [&'static str],
    pub min_bytes: usize,
    pub max_bytes: usize,
    /// 编辑类必须给出修改说明
    pub prompt_required: bool,
}

pub const RULES: &[UploadRule] = &[
    UploadRule {
        route: "/upload-edit",
        kind: GenerationKind::ImageEdit,
        mime_types: IMAGE_TYPES,
        min_bytes: KB,
        max_bytes: 10 * MB,
        prompt_required: true,
    },
    UploadRule {
        route: "/upload-video",
        kind: GenerationKind::ImageToVideo,
        mime_types: IMAGE_TYPES,
        min_bytes: KB,
        max_bytes: 10 * MB,
        prompt_required: false,
    },
    UploadRule {
        route: "/upload-video-edit",
        kind: GenerationKind::VideoEdit,
        mime_types: VIDEO_TYPES,
        min_bytes: 10 * KB,
        max_bytes: 100 * MB,
        prompt_required: true,
    },
    UploadRule {
        route: "/upload-transcribe",
        kind: GenerationKind::Transcription,
        mime_types: AUDIO_TYPES,
        min_bytes: KB,
        max_bytes: 25 * MB,
        prompt_required: false,
    },
    UploadRule {
        route: "/speech-to-song",
        kind: GenerationKind::SpeechToSong,
        mime_types: AUDIO_TYPES,
        min_bytes: KB,
        max_bytes: 25 * MB,
        prompt_required: false,
    },
];

#[derive(Debug, Default)]
struct UploadForm {
    file: Option<(String, Vec<u8>)>,
    prompt: Option<String>,
    provider: Option<String>,
    language: Option<String>,
}

impl UploadRule {
    /// 校验 MIME 与大小，返回面向用户的错误信息
    pub fn check(&self, mime: &str, size: usize) -> Result<(), String> {
        let mime = mime.split(';').next().unwrap_or(mime).trim().to_lowercase();
        if !self.mime_types.contains(&mime.as_str()) {
            return Err(format!(
                "unsupported file type '{mime}', expected one of: {}",
                self.mime_types.join(", ")
            ));
        }
        if size < self.min_bytes {
            return Err(format!("file is too small ({size} bytes, minimum {})", self.min_bytes));
        }
        if size > self.max_bytes {
            return Err(format!("file is too large ({size} bytes, maximum {})", self.max_bytes));
        }
        Ok(())
    }
}

pub async fn handle_upload(
    State(state): State<ApiState>,
    rule: &'static UploadRule,
    multipart: Multipart,
) -> Result<Json<StartTaskResponse>, (StatusCode, String)> {
    let form = read_form(multipart).await?;
    let (mime, bytes) = form
        .file
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "missing 'file' field".to_string()))?;
    rule.check(&mime, bytes.len())
        .map_err(|msg| (StatusCode::BAD_REQUEST, msg))?;
    let prompt = form.prompt.filter(|p| !p.trim().is_empty());
    if rule.prompt_required && prompt.is_none() {
        return Err((StatusCode::BAD_REQUEST, "prompt is required".to_string()));
    }

    let path = state
        .upload_dir
        .join(format!("{}.{}", Uuid::new_v4(), extension_for(&mime)));
    tokio::fs::create_dir_all(&state.upload_dir)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    tracing::info!(route = rule.route, kind = %rule.kind, bytes = bytes.len(), path = %path.display(), "Upload stored");

    let mut params = json!({
        "input_path": path.to_string_lossy(),
        "mime": mime,
    });
    if let Some(p) = &prompt {
        params["prompt"] = json!(p);
    }
    if let Some(lang) = form.language.filter(|l| !l.trim().is_empty()) {
        params["language"] = json!(lang);
    }
    let job = GenerationJob {
        kind: rule.kind,
        params,
        provider: form.provider.filter(|p| !p.trim().is_empty()),
        prompt,
    };
    submit(&state, job).await
}

async fn read_form(mut multipart: Multipart) -> Result<UploadForm, (StatusCode, String)> {
    let bad_request = |e: axum::extract::multipart::MultipartError| (StatusCode::BAD_REQUEST, e.to_string());
    let mut form = UploadForm::default();
    while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let mime = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field.bytes().await.map_err(bad_request)?;
                form.file = Some((mime, bytes.to_vec()));
            }
            "prompt" => form.prompt = Some(field.text().await.map_err(bad_request)?),
            "provider" => form.provider = Some(field.text().await.map_err(bad_request)?),
            "language" => form.language = Some(field.text().await.map_err(bad_request)?),
            other => tracing::debug!(field = %other, "Ignoring unknown multipart field"),
        }
    }
    Ok(form)
}

fn extension_for(mime: &str) -> &'static str {
    match mime.split(';').next().unwrap_or(mime).trim() {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "video/mp4" => "mp4",
        "video/quicktime" => "mov",
        "video/webm" => "webm",
        "audio/mpeg" => "mp3",
        "audio/ogg" => "ogg",
        "audio/wav" => "wav",
        "audio/webm" => "weba",
        "audio/mp4" => "m4a",
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(route: &str) -> &'static UploadRule {
        RULES.iter().find(|r| r.route == route).unwrap()
    }

    #[test]
    fn test_rule_checks() {
        let edit = rule("/upload-edit");
        assert!(edit.check("image/png", 50 * KB).is_ok());
        assert!(edit.check("image/jpeg; charset=binary", 2 * KB).is_ok());
        assert!(edit.check("image/gif", 50 * KB).unwrap_err().contains("unsupported file type"));
        assert!(edit.check("image/png", 100).unwrap_err().contains("too small"));
        assert!(edit.check("image/png", 11 * MB).unwrap_err().contains("too large"));

        let video = rule("/upload-video-edit");
        assert!(video.check("video/mp4", 5 * KB).is_err());
        assert!(video.check("video/webm", 90 * MB).is_ok());

        assert_eq!(rule("/speech-to-song").kind, GenerationKind::SpeechToSong);
        assert!(rule("/upload-transcribe").check("audio/wav", 30 * MB).is_err());
    }

    #[test]
    fn test_extension_for() {
        assert_eq!(extension_for("audio/mpeg"), "mp3");
        assert_eq!(extension_for("video/quicktime"), "mov");
        assert_eq!(extension_for("application/pdf"), "bin");
    }
}
