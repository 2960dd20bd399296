//! 历史注入：按工具的历史依赖决定是否把最近消息注入工具参数
//!
//! 自包含请求（附件 / 引用）与多步计划中的步骤完全跳过历史读取。

use serde_json::{json, Value};

use crate::memory::HistoryMessage;
use crate::react::NormalizedInput;
use crate::tools::{HistoryDependency, ToolKind};

/// 本次工具调用需要的历史条数；None 表示不读取
pub fn history_limit_for(
    kind: ToolKind,
    input: &NormalizedInput,
    multi_step: bool,
    limit: usize,
) -> Option<usize> {
    if multi_step || input.is_self_contained() || limit == 0 {
        return None;
    }
    match kind.history() {
        HistoryDependency::Use => Some(limit),
        HistoryDependency::Ignore => None,
    }
}

/// 写入 args["history"]；调用前已确认工具依赖历史
pub fn inject_history(args: &mut Value, history: &[HistoryMessage]) {
    if history.is_empty() {
        return;
    }
    if let Some(obj) = args.as_object_mut() {
        let entries: Vec<Value> = history
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();
        obj.insert("history".to_string(), Value::Array(entries));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Role;
    use crate::react::QuotedMessage;
    use crate::tools::MediaKind;

    #[test]
    fn test_history_limit_rules() {
        let plain = NormalizedInput::text("say that");
        assert_eq!(history_limit_for(ToolKind::TextToSpeech, &plain, false, 12), Some(12));
        assert_eq!(history_limit_for(ToolKind::CreateImage, &plain, false, 12), None);
        assert_eq!(history_limit_for(ToolKind::TextToSpeech, &plain, true, 12), None);

        let quoted = NormalizedInput::text("say that").with_quoted(QuotedMessage {
            text: Some("bonjour".into()),
            media: None,
        });
        assert_eq!(history_limit_for(ToolKind::TextToSpeech, &quoted, false, 12), None);
        let attached = NormalizedInput::text("translate").with_media(MediaKind::Audio, "https://a");
        assert_eq!(history_limit_for(ToolKind::TranslateText, &attached, false, 12), None);
    }

    #[test]
    fn test_inject_history() {
        let mut args = json!({"text": "that"});
        inject_history(
            &mut args,
            &[HistoryMessage::new(Role::Assistant, "The capital is Lisbon")],
        );
        assert_eq!(args["history"][0]["role"], "assistant");
        assert_eq!(args["history"][0]["content"], "The capital is Lisbon");

        let mut untouched = json!({});
        inject_history(&mut untouched, &[]);
        assert!(untouched.get("history").is_none());
    }
}
