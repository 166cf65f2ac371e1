use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/**
 * \brief 已知默认地址的 OpenAI 兼容服务。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedProvider {
    OpenAi,
    DeepSeek,
    OpenRouter,
    Moonshot,
    SiliconFlow,
    Groq,
    Zhipu,
}

impl NamedProvider {
    pub const ALL: [NamedProvider; 7] = [
        NamedProvider::OpenAi,
        NamedProvider::DeepSeek,
        NamedProvider::OpenRouter,
        NamedProvider::Moonshot,
        NamedProvider::SiliconFlow,
        NamedProvider::Groq,
        NamedProvider::Zhipu,
    ];

    pub fn wire_name(self) -> &'static str {
        match self {
            NamedProvider::OpenAi => "openai",
            NamedProvider::DeepSeek => "deepseek",
            NamedProvider::OpenRouter => "openrouter",
            NamedProvider::Moonshot => "moonshot",
            NamedProvider::SiliconFlow => "siliconflow",
            NamedProvider::Groq => "groq",
            NamedProvider::Zhipu => "zhipu",
        }
    }

    /**
     * \brief 服务的默认 API 根地址（已包含版本段）。
     */
    pub fn default_base(self) -> &'static str {
        match self {
            NamedProvider::OpenAi => "https://api.openai.com/v1",
            NamedProvider::DeepSeek => "https://api.deepseek.com/v1",
            NamedProvider::OpenRouter => "https://openrouter.ai/api/v1",
            NamedProvider::Moonshot => "https://api.moonshot.cn/v1",
            NamedProvider::SiliconFlow => "https://api.siliconflow.cn/v1",
            NamedProvider::Groq => "https://api.groq.com/openai/v1",
            NamedProvider::Zhipu => "https://open.bigmodel.cn/api/paas/v4",
        }
    }
}

/**
 * \brief Provider 协议族：两种固定协议、已知 OpenAI 兼容服务、自定义 OpenAI 兼容地址。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ProviderKind {
    /** \brief 多模态固定协议，图片以文件引用内联。 */
    Gemini,
    /** \brief 单端点对话协议，图片为结构化图片块。 */
    Claude,
    Named(NamedProvider),
    /** \brief 路径未知，需要端点探测。 */
    Custom,
}

impl ProviderKind {
    pub fn parse(raw: &str) -> Option<Self> {
        let lowered = raw.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "gemini" | "google" => Some(ProviderKind::Gemini),
            "claude" | "anthropic" => Some(ProviderKind::Claude),
            "custom" | "openai-compatible" | "openai_compatible" => Some(ProviderKind::Custom),
            other => NamedProvider::ALL
                .into_iter()
                .find(|p| p.wire_name() == other)
                .map(ProviderKind::Named),
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::Claude => "claude",
            ProviderKind::Named(named) => named.wire_name(),
            ProviderKind::Custom => "custom",
        }
    }
}

impl TryFrom<String> for ProviderKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ProviderKind::parse(&value).ok_or_else(|| format!("unknown provider kind: {value}"))
    }
}

impl From<ProviderKind> for String {
    fn from(kind: ProviderKind) -> Self {
        kind.wire_name().to_string()
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/**
 * \brief 单次调用的 Provider 配置，由调用方传入，本层不持久化。
 */
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub provider_kind: ProviderKind,
    #[serde(default)]
    pub base_address: Option<String>,
    pub credential: String,
    #[serde(default)]
    pub model_id: String,
}

impl ProviderConfig {
    /**
     * \brief 实际使用的根地址：显式配置优先，其次为已知服务的默认地址。
     */
    pub fn effective_base(&self) -> Option<String> {
        let explicit = self
            .base_address
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        match (explicit, self.provider_kind) {
            (Some(base), _) => Some(base.to_string()),
            (None, ProviderKind::Named(named)) => Some(named.default_base().to_string()),
            (None, ProviderKind::Claude) => Some("https://api.anthropic.com".to_string()),
            (None, ProviderKind::Gemini) => {
                Some("https://generativelanguage.googleapis.com".to_string())
            }
            (None, ProviderKind::Custom) => None,
        }
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("provider_kind", &self.provider_kind)
            .field("base_address", &self.base_address)
            .field("credential", &"<redacted>")
            .field("model_id", &self.model_id)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐，可附带一张图片链接。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /** \brief 角色：system/user/assistant */
    pub role: Role,
    /** \brief 内容 */
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            image_ref: None,
        }
    }
}

/**
 * \brief `<CHANGE_AVATAR>url|emotion|description</CHANGE_AVATAR>` 的三段载荷。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvatarChange {
    pub url: String,
    pub emotion: String,
    pub description: String,
}

/**
 * \brief 从模型输出中抽取的控制标签，缺失的标签保持为空。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedFields {
    pub status: Option<String>,
    pub signature: Option<String>,
    pub location: Option<String>,
    pub nickname: Option<String>,
    pub avatar: Option<String>,
    pub avatar_change: Option<AvatarChange>,
    pub user_remark: Option<String>,
    pub memo: Option<String>,
    pub video_call_requested: bool,
    pub voice_call_requested: bool,
}

/**
 * \brief 单次对话调用的归一化结果，构造后不再修改。
 */
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatInvocationResult {
    pub raw_text: String,
    pub clean_text: String,
    pub message_chunks: Vec<String>,
    pub extracted: ExtractedFields,
}

impl ChatInvocationResult {
    /**
     * \brief 仅当拆分出两段及以上时返回分段，否则调用方直接使用 `clean_text`。
     */
    pub fn multi_chunk(&self) -> Option<&[String]> {
        if self.message_chunks.len() > 1 {
            Some(&self.message_chunks)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub description: String,
}

/**
 * \brief 曲目的收费等级：免费、付费可部分试听、仅限 VIP。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeTier {
    Free,
    Partial,
    Vip,
}

/**
 * \brief 曲目元数据，`candidate_url` 与 `url_expires_at` 总是同时出现。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artist_names: Vec<String>,
    pub fee_tier: FeeTier,
    /** \brief 镜像返回的原始 fee 值 */
    pub fee_code: i64,
    pub has_trial_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_url: Option<String>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub url_expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub track: Track,
    pub playable: bool,
}
