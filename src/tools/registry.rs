//! 工具注册表
//!
//! 工具集合是封闭的：`ToolKind` 枚举加一张静态定义表（名称、分类、参数、历史依赖、关键用法说明）。
//! 决策模型看到的工具目录由这张表生成；每次调度前按表做参数校验。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::AgentError;
use crate::providers::GenerationKind;
use crate::tools::MediaKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    CreateImage,
    EditImage,
    CreateVideo,
    ImageToVideo,
    EditVideo,
    CreateMusic,
    TextToSpeech,
    TranscribeAudio,
    SpeechToSong,
    TranslateText,
    SearchWeb,
    SendLocation,
    CreatePoll,
    GetChatHistory,
    RetryLastCommand,
}

impl ToolKind {
    pub fn name(&self) -> &'static str {
        self.definition().name
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        DEFINITIONS.iter().find(|d| d.name == name).map(|d| d.kind)
    }

    pub fn definition(&self) -> &'static ToolDefinition {
        // DEFINITIONS 覆盖全部变体（见 test_every_kind_has_definition）
        DEFINITIONS
            .iter()
            .find(|d| d.kind == *self)
            .unwrap_or(&DEFINITIONS[0])
    }

    pub fn generation(&self) -> Option<GenerationKind> {
        self.definition().generation
    }

    pub fn is_persistable(&self) -> bool {
        self.definition().persistable
    }

    pub fn history(&self) -> HistoryDependency {
        self.definition().history
    }

    /// 产出媒体的工具：单步模式下成功即结束本轮
    pub fn produces_media(&self) -> bool {
        self.generation()
            .map(|g| g.media_kind().is_some())
            .unwrap_or(false)
    }

    /// 需要作为输入的媒体类型（input_url 参数）
    pub fn input_media(&self) -> Option<MediaKind> {
        match self {
            ToolKind::EditImage | ToolKind::ImageToVideo => Some(MediaKind::Image),
            ToolKind::EditVideo => Some(MediaKind::Video),
            ToolKind::TranscribeAudio | ToolKind::SpeechToSong => Some(MediaKind::Audio),
            _ => None,
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    Image,
    Video,
    Audio,
    Text,
    Search,
    Social,
    Memory,
}

/// 工具调用时是否需要注入最近的对话历史
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryDependency {
    Ignore,
    Use,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
}

impl ParamType {
    fn matches(&self, v: &Value) -> bool {
        match self {
            ParamType::String => v.as_str().map(|s| !s.trim().is_empty()).unwrap_or(false),
            ParamType::Integer => v.is_i64() || v.is_u64(),
            ParamType::Number => v.is_number(),
            ParamType::Boolean => v.is_boolean(),
            ParamType::Array => v.is_array(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: ParamType,
    pub required: bool,
    pub description: &'static str,
}

const fn req(name: &'static str, ty: ParamType, description: &'static str) -> ParamSpec {
    ParamSpec {
        name,
        ty,
        required: true,
        description,
    }
}

const fn opt(name: &'static str, ty: ParamType, description: &'static str) -> ParamSpec {
    ParamSpec {
        name,
        ty,
        required: false,
        description,
    }
}

const PROVIDER: ParamSpec = opt(
    "provider",
    ParamType::String,
    "Provider name, only when the user explicitly named one",
);
const INPUT_URL: ParamSpec = req(
    "input_url",
    ParamType::String,
    "URL of the attached or quoted media (filled in automatically when media is attached)",
);

#[derive(Debug)]
pub struct ToolDefinition {
    pub kind: ToolKind,
    pub name: &'static str,
    pub category: ToolCategory,
    pub description: &'static str,
    pub params: &'static [ParamSpec],
    pub history: HistoryDependency,
    pub critical_note: Option<&'static str>,
    /// false 的工具（只读历史 / 重试本身）永远不会成为 lastCommand
    pub persistable: bool,
    pub generation: Option<GenerationKind>,
}

pub static DEFINITIONS: &[ToolDefinition] = &[
    ToolDefinition {
        kind: ToolKind::CreateImage,
        name: "create_image",
        category: ToolCategory::Image,
        description: "Generate a new image from a text prompt",
        params: &[req("prompt", ParamType::String, "What to draw"), PROVIDER],
        history: HistoryDependency::Ignore,
        critical_note: Some("A single image request is one call, even when it names a provider."),
        persistable: true,
        generation: Some(GenerationKind::TextToImage),
    },
    ToolDefinition {
        kind: ToolKind::EditImage,
        name: "edit_image",
        category: ToolCategory::Image,
        description: "Edit an attached or quoted image according to instructions",
        params: &[req("prompt", ParamType::String, "Edit instructions"), INPUT_URL, PROVIDER],
        history: HistoryDependency::Ignore,
        critical_note: Some("Only when an image is attached or quoted; never invent an input_url."),
        persistable: true,
        generation: Some(GenerationKind::ImageEdit),
    },
    ToolDefinition {
        kind: ToolKind::CreateVideo,
        name: "create_video",
        category: ToolCategory::Video,
        description: "Generate a short video from a text prompt",
        params: &[
            req("prompt", ParamType::String, "Scene description"),
            opt("duration", ParamType::Integer, "Length in seconds"),
            PROVIDER,
        ],
        history: HistoryDependency::Ignore,
        critical_note: None,
        persistable: true,
        generation: Some(GenerationKind::TextToVideo),
    },
    ToolDefinition {
        kind: ToolKind::ImageToVideo,
        name: "image_to_video",
        category: ToolCategory::Video,
        description: "Animate an attached or quoted image into a video",
        params: &[req("prompt", ParamType::String, "Motion description"), INPUT_URL, PROVIDER],
        history: HistoryDependency::Ignore,
        critical_note: Some("Only when an image is attached or quoted."),
        persistable: true,
        generation: Some(GenerationKind::ImageToVideo),
    },
    ToolDefinition {
        kind: ToolKind::EditVideo,
        name: "edit_video",
        category: ToolCategory::Video,
        description: "Edit an attached or quoted video",
        params: &[req("prompt", ParamType::String, "Edit instructions"), INPUT_URL, PROVIDER],
        history: HistoryDependency::Ignore,
        critical_note: Some("Only when a video is attached or quoted."),
        persistable: true,
        generation: Some(GenerationKind::VideoEdit),
    },
    ToolDefinition {
        kind: ToolKind::CreateMusic,
        name: "create_music",
        category: ToolCategory::Audio,
        description: "Compose a song or instrumental track from a description",
        params: &[
            req("prompt", ParamType::String, "Style, mood and lyrics hints"),
            opt("instrumental", ParamType::Boolean, "No vocals"),
            PROVIDER,
        ],
        history: HistoryDependency::Ignore,
        critical_note: None,
        persistable: true,
        generation: Some(GenerationKind::TextToMusic),
    },
    ToolDefinition {
        kind: ToolKind::TextToSpeech,
        name: "text_to_speech",
        category: ToolCategory::Audio,
        description: "Read text aloud as a voice message",
        params: &[
            req("text", ParamType::String, "Text to speak"),
            opt("language", ParamType::String, "Language code"),
            opt("voice", ParamType::String, "Voice name"),
            PROVIDER,
        ],
        history: HistoryDependency::Use,
        critical_note: Some("\"Say that\" refers to the previous assistant message; take the text from history."),
        persistable: true,
        generation: Some(GenerationKind::TextToSpeech),
    },
    ToolDefinition {
        kind: ToolKind::TranscribeAudio,
        name: "transcribe_audio",
        category: ToolCategory::Audio,
        description: "Transcribe an attached or quoted voice note or audio file",
        params: &[INPUT_URL, opt("language", ParamType::String, "Spoken language hint"), PROVIDER],
        history: HistoryDependency::Ignore,
        critical_note: Some("Only when audio is attached or quoted."),
        persistable: true,
        generation: Some(GenerationKind::Transcription),
    },
    ToolDefinition {
        kind: ToolKind::SpeechToSong,
        name: "speech_to_song",
        category: ToolCategory::Audio,
        description: "Turn an attached or quoted voice recording into a song",
        params: &[INPUT_URL, opt("prompt", ParamType::String, "Musical style"), PROVIDER],
        history: HistoryDependency::Ignore,
        critical_note: Some("Only when audio is attached or quoted."),
        persistable: true,
        generation: Some(GenerationKind::SpeechToSong),
    },
    ToolDefinition {
        kind: ToolKind::TranslateText,
        name: "translate_text",
        category: ToolCategory::Text,
        description: "Translate text into another language",
        params: &[
            req("text", ParamType::String, "Text to translate"),
            req("target_language", ParamType::String, "Target language"),
            PROVIDER,
        ],
        history: HistoryDependency::Use,
        critical_note: Some("\"Translate that\" refers to earlier messages; take the text from history."),
        persistable: true,
        generation: Some(GenerationKind::Translation),
    },
    ToolDefinition {
        kind: ToolKind::SearchWeb,
        name: "search_web",
        category: ToolCategory::Search,
        description: "Search the web for current information",
        params: &[req("query", ParamType::String, "Search query"), PROVIDER],
        history: HistoryDependency::Ignore,
        critical_note: None,
        persistable: true,
        generation: Some(GenerationKind::Search),
    },
    ToolDefinition {
        kind: ToolKind::SendLocation,
        name: "send_location",
        category: ToolCategory::Social,
        description: "Find a place and send it as a location pin",
        params: &[req("place", ParamType::String, "Place name or address"), PROVIDER],
        history: HistoryDependency::Ignore,
        critical_note: None,
        persistable: true,
        generation: Some(GenerationKind::Location),
    },
    ToolDefinition {
        kind: ToolKind::CreatePoll,
        name: "create_poll",
        category: ToolCategory::Social,
        description: "Create a poll in the chat",
        params: &[
            req("question", ParamType::String, "Poll question"),
            req("options", ParamType::Array, "2 to 12 distinct answer options"),
            opt("allow_multiple", ParamType::Boolean, "Allow several answers"),
        ],
        history: HistoryDependency::Ignore,
        critical_note: None,
        persistable: true,
        generation: None,
    },
    ToolDefinition {
        kind: ToolKind::GetChatHistory,
        name: "get_chat_history",
        category: ToolCategory::Memory,
        description: "Read the recent messages of this conversation",
        params: &[opt("limit", ParamType::Integer, "How many messages")],
        history: HistoryDependency::Use,
        critical_note: Some("Only for questions about the conversation itself."),
        persistable: false,
        generation: None,
    },
    ToolDefinition {
        kind: ToolKind::RetryLastCommand,
        name: "retry_last_command",
        category: ToolCategory::Memory,
        description: "Run the previous command again, optionally with another provider or only some steps",
        params: &[
            PROVIDER,
            opt("step_numbers", ParamType::Array, "Steps of the previous multi-step request to redo"),
            opt("tools", ParamType::Array, "Tool names of the previous multi-step request to redo"),
        ],
        history: HistoryDependency::Ignore,
        critical_note: Some("Use for \"try again\", \"again with <provider>\", \"redo step 2\"."),
        persistable: false,
        generation: None,
    },
];

/// 工具目录：默认包含全部工具，可收窄为子集
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    tools: Vec<&'static ToolDefinition>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self {
            tools: DEFINITIONS.iter().collect(),
        }
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tools(kinds: &[ToolKind]) -> Self {
        Self {
            tools: kinds.iter().map(|k| k.definition()).collect(),
        }
    }

    /// 按名查找，只返回目录内的工具
    pub fn get(&self, name: &str) -> Option<&'static ToolDefinition> {
        self.tools.iter().copied().find(|d| d.name == name.trim())
    }

    pub fn contains(&self, kind: ToolKind) -> bool {
        self.tools.iter().any(|d| d.kind == kind)
    }

    pub fn tool_names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|d| d.name).collect()
    }

    pub fn definitions(&self) -> &[&'static ToolDefinition] {
        &self.tools
    }

    /// 工具目录的 JSON（拼入 system prompt）
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .tools
            .iter()
            .map(|d| {
                let properties: serde_json::Map<String, Value> = d
                    .params
                    .iter()
                    .map(|p| {
                        (
                            p.name.to_string(),
                            json!({ "type": p.ty, "description": p.description }),
                        )
                    })
                    .collect();
                let required: Vec<&str> = d.params.iter().filter(|p| p.required).map(|p| p.name).collect();
                let mut entry = json!({
                    "name": d.name,
                    "category": d.category,
                    "description": d.description,
                    "history": d.history,
                    "parameters": { "type": "object", "properties": properties, "required": required },
                });
                if let Some(note) = d.critical_note {
                    entry["critical"] = json!(note);
                }
                entry
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }

    /// 规划器用的紧凑目录：每行 `name: description`
    pub fn compact_catalog(&self) -> String {
        self.tools
            .iter()
            .map(|d| format!("- {}: {}", d.name, d.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// 调度前的参数校验：必填参数存在且类型正确（空字符串视为缺失），可选参数若出现也须类型正确
    pub fn validate(&self, kind: ToolKind, args: &Value) -> Result<(), AgentError> {
        let def = kind.definition();
        if !self.contains(kind) {
            return Err(AgentError::UnknownTool(def.name.to_string()));
        }
        let obj = args
            .as_object()
            .ok_or_else(|| AgentError::Validation(format!("{}: arguments must be an object", def.name)))?;

        for p in def.params {
            match obj.get(p.name) {
                None | Some(Value::Null) if p.required => {
                    return Err(AgentError::Validation(format!(
                        "{}: missing required parameter '{}'",
                        def.name, p.name
                    )));
                }
                None | Some(Value::Null) => {}
                Some(v) if !p.ty.matches(v) => {
                    return Err(AgentError::Validation(format!(
                        "{}: parameter '{}' must be a non-empty {:?}",
                        def.name,
                        p.name,
                        p.ty
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}
