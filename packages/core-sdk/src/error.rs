use std::time::Duration;

use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;

/**
 * \brief 所有候选路径失败后给出的排查方向。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DiscoveryHint {
    /** \brief 全部 404/405，根地址本身大概率有误。 */
    BaseAddressWrong,
    /** \brief 鉴权失败或无可用渠道/余额不足。 */
    CredentialOrBalance,
    /** \brief 全部 5xx 或网络错误。 */
    ServerOutage,
    Unknown,
}

impl DiscoveryHint {
    pub fn advice(self) -> &'static str {
        match self {
            DiscoveryHint::BaseAddressWrong => {
                "所有路径均返回 404，请检查接口地址是否正确（通常应指向 API 根路径，如 https://host/v1）"
            }
            DiscoveryHint::CredentialOrBalance => {
                "服务端拒绝了请求，请检查 API Key 是否有效、账户余额或可用渠道是否充足"
            }
            DiscoveryHint::ServerOutage => "服务端暂时不可用，请稍后重试",
            DiscoveryHint::Unknown => "请检查接口地址、API Key 与模型名称",
        }
    }
}

/**
 * \brief 不可播放的具体原因，调用方据此展示不同文案。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unplayable {
    Vip,
    Unavailable,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("upstream overloaded ({status}) at {url}")]
    Overloaded {
        status: u16,
        retry_after: Duration,
        url: String,
    },

    #[error("all {} candidate paths failed, last error: {last_error}", attempted.len())]
    AllPathsFailed {
        attempted: Vec<String>,
        last_error: String,
        hint: DiscoveryHint,
    },

    #[error("auth failed ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("upstream error: {message}")]
    Upstream { status: Option<u16>, message: String },

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("track {track_id} is not playable: {reason:?}")]
    Unplayable { track_id: String, reason: Unplayable },

    #[error("no music resolver available after {tried} mirrors")]
    NoResolverAvailable { tried: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("record store error: {0}")]
    Store(String),
}

impl GatewayError {
    /// Transient failures the caller may retry after backing off.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Overloaded { .. } | Self::Timeout(_) | Self::Request(_) => true,
            Self::Upstream { status, .. } => status.is_some_and(|s| s >= 500),
            Self::NoResolverAvailable { .. } => true,
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Overloaded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Overloaded { .. } | Self::Timeout(_) | Self::NoResolverAvailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::AllPathsFailed { .. }
            | Self::Upstream { .. }
            | Self::MalformedResponse(_)
            | Self::Request(_) => StatusCode::BAD_GATEWAY,
            Self::Auth { .. } => StatusCode::UNAUTHORIZED,
            Self::Unplayable {
                reason: Unplayable::Vip,
                ..
            } => StatusCode::FORBIDDEN,
            Self::Unplayable {
                reason: Unplayable::Unavailable,
                ..
            } => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Sanitized message safe to hand back to the chat client.
    pub fn user_message(&self) -> String {
        match self {
            Self::Overloaded { retry_after, .. } => format!(
                "服务繁忙，请约 {} 秒后重试",
                retry_after.as_secs().max(1)
            ),
            Self::AllPathsFailed {
                attempted,
                last_error,
                hint,
            } => format!(
                "尝试了 {} 个接口路径均失败（最后错误：{}）。{}",
                attempted.len(),
                tail(last_error, 200),
                hint.advice()
            ),
            Self::Auth { status, .. } => format!("鉴权失败（{status}），请检查 API Key"),
            Self::Upstream { message, .. } => format!("上游服务错误：{}", tail(message, 200)),
            Self::MalformedResponse(_) => "无法解析模型返回的内容".to_string(),
            Self::Timeout(ms) => format!("请求超时（{ms}ms）"),
            Self::Request(_) => "连接上游服务失败".to_string(),
            Self::Unplayable {
                reason: Unplayable::Vip,
                ..
            } => "该歌曲需要 VIP 才能播放".to_string(),
            Self::Unplayable {
                reason: Unplayable::Unavailable,
                ..
            } => "该歌曲暂时无法播放".to_string(),
            Self::NoResolverAvailable { .. } => "音乐服务暂时不可用".to_string(),
            Self::InvalidRequest(msg) => msg.clone(),
            Self::Store(_) => "存储服务异常".to_string(),
        }
    }
}

/// Keep the last `max` chars; upstream errors put the useful part at the end.
fn tail(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let kept: String = text.chars().skip(count - max).collect();
    format!("...{kept}")
}
