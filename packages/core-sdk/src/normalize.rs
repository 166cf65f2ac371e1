use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{AvatarChange, ChatInvocationResult, ExtractedFields};

/// Explicit chunk delimiter; a line holding only `---` is treated the same.
pub const SPLIT_TOKEN: &str = "---SPLIT---";

/**
 * \brief 模型输出中可携带的控制标签（固定注册表）。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Status,
    Signature,
    Location,
    Nickname,
    Avatar,
    ChangeAvatar,
    UserRemark,
    Memo,
    VideoCall,
    VoiceCall,
}

impl Tag {
    pub const REGISTRY: [Tag; 10] = [
        Tag::Status,
        Tag::Signature,
        Tag::Location,
        Tag::Nickname,
        Tag::Avatar,
        Tag::ChangeAvatar,
        Tag::UserRemark,
        Tag::Memo,
        Tag::VideoCall,
        Tag::VoiceCall,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Tag::Status => "STATUS",
            Tag::Signature => "SIGNATURE",
            Tag::Location => "LOCATION",
            Tag::Nickname => "NICKNAME",
            Tag::Avatar => "AVATAR",
            Tag::ChangeAvatar => "CHANGE_AVATAR",
            Tag::UserRemark => "USER_REMARK",
            Tag::Memo => "MEMO",
            Tag::VideoCall => "VIDEO_CALL",
            Tag::VoiceCall => "VOICE_CALL",
        }
    }

    /** \brief 标记型标签：出现即生效，值可为空。 */
    fn is_marker(self) -> bool {
        matches!(self, Tag::VideoCall | Tag::VoiceCall)
    }

    fn apply(self, fields: &mut ExtractedFields, raw: &str) -> Result<(), String> {
        let value = raw.trim();
        let slot = match self {
            Tag::VideoCall => {
                fields.video_call_requested = true;
                return Ok(());
            }
            Tag::VoiceCall => {
                fields.voice_call_requested = true;
                return Ok(());
            }
            _ if value.is_empty() => return Err("empty value".to_string()),
            Tag::ChangeAvatar => {
                if fields.avatar_change.is_none() {
                    fields.avatar_change = Some(parse_avatar_change(value)?);
                }
                return Ok(());
            }
            Tag::Status => &mut fields.status,
            Tag::Signature => &mut fields.signature,
            Tag::Location => &mut fields.location,
            Tag::Nickname => &mut fields.nickname,
            Tag::Avatar => &mut fields.avatar,
            Tag::UserRemark => &mut fields.user_remark,
            Tag::Memo => &mut fields.memo,
        };
        slot.get_or_insert_with(|| value.to_string());
        Ok(())
    }
}

fn parse_avatar_change(value: &str) -> Result<AvatarChange, String> {
    let parts: Vec<&str> = value.split('|').map(str::trim).collect();
    match parts.as_slice() {
        [url, emotion, description] if !url.is_empty() => Ok(AvatarChange {
            url: url.to_string(),
            emotion: emotion.to_string(),
            description: description.to_string(),
        }),
        _ => Err(format!(
            "expected url|emotion|description, got {} part(s)",
            parts.len()
        )),
    }
}

struct TagPattern {
    tag: Tag,
    paired: Regex,
    stray: Regex,
}

static TAG_PATTERNS: Lazy<Vec<TagPattern>> = Lazy::new(|| {
    Tag::REGISTRY
        .iter()
        .map(|&tag| {
            let name = tag.name();
            TagPattern {
                tag,
                paired: Regex::new(&format!(r"(?is)<{name}>(.*?)</{name}>"))
                    .expect("tag pattern is valid"),
                stray: Regex::new(&format!(r"(?i)</?{name}\s*/?>")).expect("tag pattern is valid"),
            }
        })
        .collect()
});

static DASH_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*---[ \t]*\r?$").expect("dash pattern is valid"));

static BLANK_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n(?:[ \t]*\r?\n){3,}").expect("blank-run pattern is valid"));

/**
 * \brief 抽取并移除控制标签。
 * \details 标签顺序无关、均可缺省；同一标签出现多次时取第一次的值。
 *          格式错误的标签被丢弃并记录日志，不影响整体结果。
 *          嵌套在其他标签值内的标签先被抽取，外层只保留剩余文本。
 */
pub fn extract_tags(raw: &str) -> (ExtractedFields, String) {
    let mut fields = ExtractedFields::default();
    let text = extract_into(&mut fields, raw);
    (fields, text)
}

fn contains_tag(text: &str) -> bool {
    TAG_PATTERNS
        .iter()
        .any(|p| p.paired.is_match(text) || p.stray.is_match(text))
}

fn extract_into(fields: &mut ExtractedFields, raw: &str) -> String {
    let mut text = raw.to_string();

    for pattern in TAG_PATTERNS.iter() {
        for caps in pattern.paired.captures_iter(&text) {
            let mut value = caps.get(1).map_or("", |m| m.as_str()).to_string();
            if contains_tag(&value) {
                value = extract_into(fields, &value);
            }
            if let Err(reason) = pattern.tag.apply(fields, &value) {
                tracing::warn!(
                    target: "murmur.normalize",
                    tag = pattern.tag.name(),
                    "dropping malformed tag: {reason}"
                );
            }
        }
        text = pattern.paired.replace_all(&text, "").into_owned();

        if pattern.stray.is_match(&text) {
            if pattern.tag.is_marker() {
                // `<VIDEO_CALL/>` style markers carry no value
                let _ = pattern.tag.apply(fields, "");
            } else {
                tracing::warn!(
                    target: "murmur.normalize",
                    tag = pattern.tag.name(),
                    "dropping unbalanced tag"
                );
            }
            text = pattern.stray.replace_all(&text, "").into_owned();
        }
    }

    text
}

/**
 * \brief 将正文按分隔符拆分为多条消息。
 * \details 分隔符为 `---SPLIT---` 或仅含 `---` 的行；每段去除首尾空白，
 *          段内连续 3 行以上空行压缩为 1 行，空段丢弃。
 */
pub fn split_chunks(text: &str) -> Vec<String> {
    let unified = DASH_LINE.replace_all(text, SPLIT_TOKEN);
    unified
        .split(SPLIT_TOKEN)
        .map(|chunk| BLANK_RUN.replace_all(chunk.trim(), "\n\n").into_owned())
        .filter(|chunk| !chunk.is_empty())
        .collect()
}

/**
 * \brief 归一化模型原始输出：先抽标签，再拆分消息。
 */
pub fn normalize(raw: &str) -> ChatInvocationResult {
    let (extracted, stripped) = extract_tags(raw);
    let message_chunks = split_chunks(&stripped);
    let clean_text = message_chunks.join("\n\n");
    ChatInvocationResult {
        raw_text: raw.to_string(),
        clean_text,
        message_chunks,
        extracted,
    }
}
