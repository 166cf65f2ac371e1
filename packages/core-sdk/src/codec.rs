use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::models::{ChatMessage, ModelInfo, ProviderKind, Role};

/**
 * \brief 候选端点期望的请求/响应形态。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedShape {
    /** \brief `messages` 数组 + `choices[].message.content` */
    ChatCompletions,
    /** \brief `input` 数组 + `output_text` / `output[].content[]` */
    Responses,
}

/// Top-level fields tried, in order, when the primary envelope is absent.
const FALLBACK_FIELDS: &[&str] = &[
    "response",
    "output_text",
    "text",
    "content",
    "message",
    "output",
    "result",
    "reply",
    "data",
];

/**
 * \brief 将抽象对话请求编码为指定协议的请求体。
 */
pub fn encode(
    kind: ProviderKind,
    shape: ExpectedShape,
    model: &str,
    messages: &[ChatMessage],
    max_tokens: u32,
) -> Value {
    match kind {
        ProviderKind::Claude => encode_claude(model, messages, max_tokens),
        ProviderKind::Gemini => encode_gemini(messages),
        ProviderKind::Named(_) | ProviderKind::Custom => match shape {
            ExpectedShape::ChatCompletions => json!({
                "model": model,
                "messages": messages.iter().map(openai_message).collect::<Vec<_>>(),
                "stream": false,
            }),
            ExpectedShape::Responses => json!({
                "model": model,
                "input": messages.iter().map(responses_item).collect::<Vec<_>>(),
            }),
        },
    }
}

/**
 * \brief 从协议响应中取出模型文本；主形态缺失时依次尝试常见的替代字段。
 */
pub fn decode(kind: ProviderKind, shape: ExpectedShape, body: &Value) -> Result<String, GatewayError> {
    let primary = match kind {
        ProviderKind::Claude => claude_text(body),
        ProviderKind::Gemini => gemini_text(body),
        ProviderKind::Named(_) | ProviderKind::Custom => match shape {
            ExpectedShape::ChatCompletions => openai_text(body),
            ExpectedShape::Responses => responses_text(body),
        },
    };

    let text = primary
        .filter(|t| !t.trim().is_empty())
        .or_else(|| {
            FALLBACK_FIELDS
                .iter()
                .filter_map(|field| body.get(*field))
                .filter_map(text_of)
                .find(|t| !t.trim().is_empty())
        });

    match text {
        Some(text) => Ok(text),
        None => match error_message(body) {
            Some(message) => Err(GatewayError::Upstream {
                status: None,
                message,
            }),
            None => Err(GatewayError::MalformedResponse(format!(
                "no content in {kind} response: {}",
                preview(body)
            ))),
        },
    }
}

/**
 * \brief 解析原始响应字节；非 JSON（例如错误路径返回的 HTML 页面）视为形态不匹配。
 */
pub fn decode_bytes(
    kind: ProviderKind,
    shape: ExpectedShape,
    bytes: &[u8],
) -> Result<String, GatewayError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(GatewayError::MalformedResponse("empty body".to_string()));
    }
    let body: Value = serde_json::from_slice(bytes).map_err(|e| {
        GatewayError::MalformedResponse(format!(
            "body is not JSON ({e}): {}",
            String::from_utf8_lossy(&bytes[..bytes.len().min(120)])
        ))
    })?;
    decode(kind, shape, &body)
}

/**
 * \brief 解析模型列表，兼容 `data[]`、`models[]` 与裸数组。
 */
pub fn decode_models(kind: ProviderKind, body: &Value) -> Result<Vec<ModelInfo>, GatewayError> {
    let items = body
        .get("data")
        .or_else(|| body.get("models"))
        .unwrap_or(body)
        .as_array()
        .ok_or_else(|| {
            GatewayError::MalformedResponse(format!("unexpected models payload: {}", preview(body)))
        })?;

    let models = items
        .iter()
        .filter_map(|item| {
            if let Some(id) = item.as_str() {
                return Some(ModelInfo {
                    id: id.to_string(),
                    name: id.to_string(),
                    description: String::new(),
                });
            }
            let raw_id = item
                .get("id")
                .or_else(|| item.get("name"))
                .and_then(Value::as_str)?;
            let id = match kind {
                ProviderKind::Gemini => raw_id.trim_start_matches("models/"),
                _ => raw_id,
            };
            let name = item
                .get("display_name")
                .or_else(|| item.get("displayName"))
                .and_then(Value::as_str)
                .unwrap_or(id);
            let description = item
                .get("description")
                .or_else(|| item.get("owned_by"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            Some(ModelInfo {
                id: id.to_string(),
                name: name.to_string(),
                description: description.to_string(),
            })
        })
        .collect();
    Ok(models)
}

fn openai_message(msg: &ChatMessage) -> Value {
    let role = role_name(msg.role);
    match &msg.image_ref {
        Some(url) => json!({
            "role": role,
            "content": [
                {"type": "image_url", "image_url": {"url": url}},
                {"type": "text", "text": with_visible_url(&msg.content, url)},
            ]
        }),
        None => json!({"role": role, "content": msg.content}),
    }
}

fn responses_item(msg: &ChatMessage) -> Value {
    let role = role_name(msg.role);
    match &msg.image_ref {
        Some(url) => json!({
            "role": role,
            "content": [
                {"type": "input_image", "image_url": url},
                {"type": "input_text", "text": with_visible_url(&msg.content, url)},
            ]
        }),
        None => json!({"role": role, "content": msg.content}),
    }
}

/// Models that ignore image blocks can still reason about the link.
fn with_visible_url(content: &str, url: &str) -> String {
    if content.trim().is_empty() {
        format!("[图片: {url}]")
    } else {
        format!("{content}\n\n[图片: {url}]")
    }
}

fn encode_claude(model: &str, messages: &[ChatMessage], max_tokens: u32) -> Value {
    let (system_prompt, rest) = hoist_system(messages);
    let items: Vec<Value> = rest
        .iter()
        .map(|msg| {
            let role = if msg.role == Role::Assistant {
                "assistant"
            } else {
                "user"
            };
            let mut blocks = Vec::new();
            if let Some(url) = &msg.image_ref {
                blocks.push(json!({
                    "type": "image",
                    "source": {"type": "url", "url": url}
                }));
            }
            blocks.push(json!({"type": "text", "text": msg.content}));
            json!({"role": role, "content": blocks})
        })
        .collect();

    let mut body = json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": items,
    });
    if let Some(sys) = system_prompt {
        body["system"] = json!(sys);
    }
    body
}

fn encode_gemini(messages: &[ChatMessage]) -> Value {
    let (system_prompt, rest) = hoist_system(messages);
    let contents: Vec<Value> = rest
        .iter()
        .map(|msg| {
            let role = if msg.role == Role::Assistant {
                "model"
            } else {
                "user"
            };
            let mut parts = Vec::new();
            if let Some(url) = &msg.image_ref {
                parts.push(json!({
                    "file_data": {"mime_type": guess_image_mime(url), "file_uri": url}
                }));
            }
            parts.push(json!({"text": msg.content}));
            json!({"role": role, "parts": parts})
        })
        .collect();

    let mut body = json!({ "contents": contents });
    if let Some(sys) = system_prompt {
        body["system_instruction"] = json!({ "parts": [{"text": sys}] });
    }
    body
}

/// Split system messages out; fixed-schema providers take one out-of-band prompt.
fn hoist_system(messages: &[ChatMessage]) -> (Option<String>, Vec<&ChatMessage>) {
    let mut system_parts = Vec::new();
    let mut rest = Vec::new();
    for msg in messages {
        if msg.role == Role::System {
            system_parts.push(msg.content.as_str());
        } else {
            rest.push(msg);
        }
    }
    let system_prompt = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system_prompt, rest)
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn guess_image_mime(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else if path.ends_with(".gif") {
        "image/gif"
    } else {
        "image/jpeg"
    }
}

fn openai_text(v: &Value) -> Option<String> {
    let choice = v.get("choices")?.get(0)?;
    choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(text_of)
        .or_else(|| choice.get("text").and_then(text_of))
}

fn responses_text(v: &Value) -> Option<String> {
    if let Some(text) = v.get("output_text").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    let parts: Vec<String> = v
        .get("output")?
        .as_array()?
        .iter()
        .filter_map(|item| item.get("content"))
        .filter_map(text_of)
        .collect();
    (!parts.is_empty()).then(|| parts.join(""))
}

fn claude_text(v: &Value) -> Option<String> {
    v.get("content").and_then(text_of)
}

fn gemini_text(v: &Value) -> Option<String> {
    let first = v.get("candidates")?.as_array()?.first()?;
    first
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(text_of)
        .or_else(|| first.get("output").and_then(text_of))
}

/// Flatten a string, a `{content|text}` object, or an array of text parts.
fn text_of(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let joined: String = items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(_) => item
                        .get("text")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .or_else(|| item.get("content").and_then(text_of)),
                    _ => None,
                })
                .collect();
            (!joined.is_empty()).then_some(joined)
        }
        Value::Object(_) => v
            .get("content")
            .and_then(text_of)
            .or_else(|| v.get("text").and_then(text_of)),
        _ => None,
    }
}

fn error_message(v: &Value) -> Option<String> {
    let err = v.get("error")?;
    match err {
        Value::String(s) => Some(s.clone()),
        Value::Object(_) => err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(err.to_string())),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn preview(v: &Value) -> String {
    let s = v.to_string();
    match s.char_indices().nth(160) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NamedProvider;

    fn conversation() -> Vec<ChatMessage> {
        vec![
            ChatMessage::new(Role::System, "you are a cat"),
            ChatMessage {
                role: Role::User,
                content: "what is this?".into(),
                image_ref: Some("https://img.example/cat.png".into()),
            },
        ]
    }

    #[test]
    fn claude_hoists_system_and_uses_image_blocks() {
        let body = encode(
            ProviderKind::Claude,
            ExpectedShape::ChatCompletions,
            "claude-3",
            &conversation(),
            512,
        );
        assert_eq!(body["system"], "you are a cat");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["content"][0]["type"], "image");
        assert_eq!(body["max_tokens"], 512);
    }

    #[test]
    fn gemini_uses_system_instruction_and_file_reference() {
        let body = encode(
            ProviderKind::Gemini,
            ExpectedShape::ChatCompletions,
            "gemini-pro",
            &conversation(),
            512,
        );
        assert_eq!(body["system_instruction"]["parts"][0]["text"], "you are a cat");
        let part = &body["contents"][0]["parts"][0]["file_data"];
        assert_eq!(part["mime_type"], "image/png");
        assert_eq!(part["file_uri"], "https://img.example/cat.png");
    }

    #[test]
    fn openai_folds_image_into_two_part_content_with_visible_url() {
        let body = encode(
            ProviderKind::Named(NamedProvider::OpenAi),
            ExpectedShape::ChatCompletions,
            "gpt-4o",
            &conversation(),
            512,
        );
        assert_eq!(body["messages"][0]["role"], "system");
        let content = body["messages"][1]["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], "image_url");
        assert!(content[1]["text"]
            .as_str()
            .unwrap()
            .contains("https://img.example/cat.png"));
    }

    #[test]
    fn decode_accepts_alternative_envelopes() {
        let kind = ProviderKind::Custom;
        let shape = ExpectedShape::ChatCompletions;
        for body in [
            json!({"choices": [{"message": {"content": "hi"}}]}),
            json!({"choices": [{"text": "hi"}]}),
            json!({"response": "hi"}),
            json!({"text": "hi"}),
            json!({"content": [{"type": "text", "text": "hi"}]}),
            json!({"message": {"content": "hi"}}),
            json!({"output": [{"content": [{"text": "hi"}]}]}),
            json!({"result": "hi"}),
        ] {
            assert_eq!(decode(kind, shape, &body).unwrap(), "hi", "body: {body}");
        }
    }

    #[test]
    fn decode_empty_content_is_malformed() {
        let body = json!({"choices": [{"message": {"content": ""}}]});
        let err = decode(ProviderKind::Custom, ExpectedShape::ChatCompletions, &body).unwrap_err();
        assert!(matches!(err, GatewayError::MalformedResponse(_)));
    }

    #[test]
    fn decode_surfaces_error_envelope() {
        let body = json!({"error": {"message": "No available channel for model"}});
        let err = decode(ProviderKind::Custom, ExpectedShape::ChatCompletions, &body).unwrap_err();
        match err {
            GatewayError::Upstream { message, .. } => assert!(message.contains("No available")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_bytes_rejects_html() {
        let err = decode_bytes(
            ProviderKind::Custom,
            ExpectedShape::ChatCompletions,
            b"<html>not found</html>",
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::MalformedResponse(_)));
    }

    #[test]
    fn decode_models_strips_gemini_prefix() {
        let body = json!({"models": [{"name": "models/gemini-1.5", "displayName": "Gemini 1.5", "description": "fast"}]});
        let models = decode_models(ProviderKind::Gemini, &body).unwrap();
        assert_eq!(models[0].id, "gemini-1.5");
        assert_eq!(models[0].name, "Gemini 1.5");
    }
}
