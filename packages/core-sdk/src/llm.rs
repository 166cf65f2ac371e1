use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Method, Response};
use serde_json::Value;

use crate::codec::{self, ExpectedShape};
use crate::config::GatewayConfig;
use crate::discovery::{
    merge_url, AttemptOutcome, EndpointDiscovery, CHAT_CANDIDATES, MODEL_CANDIDATES,
};
use crate::error::GatewayError;
use crate::models::{ChatInvocationResult, ChatMessage, ModelInfo, ProviderConfig, ProviderKind};
use crate::normalize;
use crate::retry::RetryPolicy;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

/**
 * \brief 一次成功的模型调用：原始文本与实际命中的端点。
 */
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub url: String,
    /** \brief 命中的路径后缀；固定协议为其唯一端点。 */
    pub path: String,
}

/**
 * \brief 对话调用入口：协议编码、端点探测、重试、响应解码。
 */
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: Client,
    retry: RetryPolicy,
    request_timeout: Duration,
    overload_backoff: Duration,
    max_output_tokens: u32,
}

impl ChatClient {
    pub fn new(http: Client, config: &GatewayConfig) -> Self {
        Self {
            http,
            retry: config.chat_retry.clone(),
            request_timeout: config.request_timeout,
            overload_backoff: config.overload_backoff,
            max_output_tokens: config.max_output_tokens,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /**
     * \brief 完整对话流程：调用模型并归一化输出。
     */
    pub async fn chat(
        &self,
        provider: &ProviderConfig,
        messages: &[ChatMessage],
    ) -> Result<(ChatInvocationResult, Completion), GatewayError> {
        let completion = self.complete(provider, messages).await?;
        let result = normalize::normalize(&completion.text);
        Ok((result, completion))
    }

    /**
     * \brief 非流式调用，返回完整回复文本。
     */
    pub async fn complete(
        &self,
        provider: &ProviderConfig,
        messages: &[ChatMessage],
    ) -> Result<Completion, GatewayError> {
        if messages.is_empty() {
            return Err(GatewayError::InvalidRequest("messages must not be empty".into()));
        }
        if provider.model_id.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("modelId is required".into()));
        }
        let base = self.base_for(provider)?;
        let kind = provider.provider_kind;

        match kind {
            ProviderKind::Custom => {
                let discovery = EndpointDiscovery::new(&base, CHAT_CANDIDATES)?;
                let found = discovery
                    .run(|candidate, url| async move {
                        let body = codec::encode(
                            kind,
                            candidate.shape,
                            &provider.model_id,
                            messages,
                            self.max_output_tokens,
                        );
                        let sent = self.send(Method::POST, &url, provider, Some(&body)).await;
                        self.classify_attempt(sent, |bytes| {
                            codec::decode_bytes(kind, candidate.shape, bytes)
                        })
                        .await
                    })
                    .await?;
                Ok(Completion {
                    text: found.value,
                    url: found.url,
                    path: found.candidate.suffix.to_string(),
                })
            }
            _ => {
                let (url, path) = fixed_chat_endpoint(kind, &base, &provider.model_id)?;
                let body = codec::encode(
                    kind,
                    ExpectedShape::ChatCompletions,
                    &provider.model_id,
                    messages,
                    self.max_output_tokens,
                );
                let sent = self.send(Method::POST, &url, provider, Some(&body)).await;
                let text = self
                    .classify_fixed(sent, |bytes| {
                        codec::decode_bytes(kind, ExpectedShape::ChatCompletions, bytes)
                    })
                    .await?;
                Ok(Completion { text, url, path })
            }
        }
    }

    /**
     * \brief 列出当前 Provider 可用模型列表。
     */
    pub async fn list_models(&self, provider: &ProviderConfig) -> Result<Vec<ModelInfo>, GatewayError> {
        let base = self.base_for(provider)?;
        let kind = provider.provider_kind;
        let decode = move |bytes: &[u8]| -> Result<Vec<ModelInfo>, GatewayError> {
            let v: Value = serde_json::from_slice(bytes)
                .map_err(|e| GatewayError::MalformedResponse(format!("models payload: {e}")))?;
            codec::decode_models(kind, &v)
        };

        match kind {
            ProviderKind::Custom => {
                let discovery = EndpointDiscovery::new(&base, MODEL_CANDIDATES)?;
                let found = discovery
                    .run(|_, url| async move {
                        let sent = self.send(Method::GET, &url, provider, None).await;
                        self.classify_attempt(sent, decode).await
                    })
                    .await?;
                Ok(found.value)
            }
            ProviderKind::Gemini => {
                let url = format!("{}/models", normalize_gemini_base(&base));
                let sent = self.send(Method::GET, &url, provider, None).await;
                self.classify_fixed(sent, decode).await
            }
            ProviderKind::Claude => {
                let url = merge_url(&base, "/v1/models")?;
                let sent = self.send(Method::GET, &url, provider, None).await;
                self.classify_fixed(sent, decode).await
            }
            ProviderKind::Named(_) => {
                let url = merge_url(&base, "/models")?;
                let sent = self.send(Method::GET, &url, provider, None).await;
                self.classify_fixed(sent, decode).await
            }
        }
    }

    fn base_for(&self, provider: &ProviderConfig) -> Result<String, GatewayError> {
        if provider.credential.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("credential is required".into()));
        }
        provider.effective_base().ok_or_else(|| {
            GatewayError::InvalidRequest("baseAddress is required for custom providers".into())
        })
    }

    /// One outbound call with its own timeout, retried in place on overload.
    async fn send(
        &self,
        method: Method,
        url: &str,
        provider: &ProviderConfig,
        body: Option<&Value>,
    ) -> Result<Response, reqwest::Error> {
        self.retry
            .execute(|| {
                let mut req = self
                    .http
                    .request(method.clone(), url)
                    .headers(auth_headers(provider))
                    .timeout(self.request_timeout);
                if let Some(body) = body {
                    req = req.json(body);
                }
                let sent = req.send();
                // the url never leaves this function inside an error
                async move { sent.await.map_err(reqwest::Error::without_url) }
            })
            .await
    }

    fn retry_after(&self, resp: &Response) -> Duration {
        resp.headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(self.overload_backoff)
    }

    /// Discovery-loop classification: only 429/503 stop the loop.
    async fn classify_attempt<T, D>(
        &self,
        sent: Result<Response, reqwest::Error>,
        decode: D,
    ) -> AttemptOutcome<T>
    where
        D: FnOnce(&[u8]) -> Result<T, GatewayError>,
    {
        let resp = match sent {
            Ok(resp) => resp,
            Err(e) => return AttemptOutcome::Unreachable(e.to_string()),
        };
        let status = resp.status().as_u16();
        if matches!(status, 429 | 503) {
            return AttemptOutcome::Overloaded {
                status,
                retry_after: self.retry_after(&resp),
            };
        }
        let bytes = match read_capped(resp).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return AttemptOutcome::Failed {
                    status: Some(status),
                    message: e.to_string(),
                }
            }
        };
        if !(200..300).contains(&status) {
            return AttemptOutcome::Failed {
                status: Some(status),
                message: body_preview(&bytes),
            };
        }
        match decode(&bytes) {
            Ok(value) => AttemptOutcome::Success(value),
            Err(e) => AttemptOutcome::Failed {
                status: None,
                message: e.to_string(),
            },
        }
    }

    /// Fixed-endpoint classification: hard errors surface immediately.
    async fn classify_fixed<T, D>(
        &self,
        sent: Result<Response, reqwest::Error>,
        decode: D,
    ) -> Result<T, GatewayError>
    where
        D: FnOnce(&[u8]) -> Result<T, GatewayError>,
    {
        let resp = sent.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(self.request_timeout.as_millis() as u64)
            } else {
                GatewayError::Request(e)
            }
        })?;
        let status = resp.status().as_u16();
        let url = resp.url().clone();
        if matches!(status, 429 | 503) {
            return Err(GatewayError::Overloaded {
                status,
                retry_after: self.retry_after(&resp),
                url: redact_query(url),
            });
        }
        let bytes = read_capped(resp).await?;
        match status {
            200..=299 => decode(&bytes),
            401 | 403 => Err(GatewayError::Auth {
                status,
                message: body_preview(&bytes),
            }),
            _ => Err(GatewayError::Upstream {
                status: Some(status),
                message: format!("{status}: {}", body_preview(&bytes)),
            }),
        }
    }
}

fn auth_headers(provider: &ProviderConfig) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    match provider.provider_kind {
        ProviderKind::Claude => {
            if let Ok(key) = HeaderValue::from_str(&provider.credential) {
                headers.insert("x-api-key", key);
            }
            headers.insert(
                "anthropic-version",
                HeaderValue::from_static(ANTHROPIC_VERSION),
            );
        }
        ProviderKind::Gemini => {
            if let Ok(key) = HeaderValue::from_str(&provider.credential) {
                headers.insert("x-goog-api-key", key);
            }
        }
        ProviderKind::Named(_) | ProviderKind::Custom => {
            if let Ok(bearer) = HeaderValue::from_str(&format!("Bearer {}", provider.credential)) {
                headers.insert(AUTHORIZATION, bearer);
            }
        }
    }
    headers
}

fn fixed_chat_endpoint(
    kind: ProviderKind,
    base: &str,
    model: &str,
) -> Result<(String, String), GatewayError> {
    match kind {
        ProviderKind::Claude => {
            let path = "/v1/messages";
            Ok((merge_url(base, path)?, path.to_string()))
        }
        ProviderKind::Gemini => {
            let path = format!("/models/{model}:generateContent");
            Ok((format!("{}{}", normalize_gemini_base(base), path), path))
        }
        ProviderKind::Named(_) => {
            let path = "/chat/completions";
            Ok((merge_url(base, path)?, path.to_string()))
        }
        ProviderKind::Custom => Err(GatewayError::InvalidRequest(
            "custom providers have no fixed endpoint".into(),
        )),
    }
}

fn normalize_gemini_base(api_base: &str) -> String {
    let trimmed = api_base.trim_end_matches('/');
    if trimmed.ends_with("/v1")
        || trimmed.ends_with("/v1beta")
        || trimmed.contains("/v1/")
        || trimmed.contains("/v1beta/")
    {
        trimmed.to_string()
    } else {
        format!("{}/v1beta", trimmed)
    }
}

async fn read_capped(resp: Response) -> Result<Vec<u8>, GatewayError> {
    if resp
        .content_length()
        .is_some_and(|len| len as usize > MAX_RESPONSE_BYTES)
    {
        return Err(GatewayError::MalformedResponse(format!(
            "response larger than {MAX_RESPONSE_BYTES} bytes"
        )));
    }
    let bytes = resp.bytes().await.map_err(reqwest::Error::without_url)?;
    if bytes.len() > MAX_RESPONSE_BYTES {
        return Err(GatewayError::MalformedResponse(format!(
            "response larger than {MAX_RESPONSE_BYTES} bytes"
        )));
    }
    Ok(bytes.to_vec())
}

fn body_preview(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    match trimmed.char_indices().nth(300) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Base addresses may carry secrets in their query string.
fn redact_query(mut url: reqwest::Url) -> String {
    url.set_query(None);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiscoveryHint;
    use crate::models::{NamedProvider, Role};
    use mockito::{Matcher, Server};

    fn client() -> ChatClient {
        let config = GatewayConfig::default();
        ChatClient::new(Client::new(), &config).with_retry(RetryPolicy {
            max_retries: 1,
            initial_delay: Duration::from_millis(5),
            retryable_statuses: vec![429],
        })
    }

    fn custom(base: &str) -> ProviderConfig {
        ProviderConfig {
            provider_kind: ProviderKind::Custom,
            base_address: Some(base.to_string()),
            credential: "sk-test".into(),
            model_id: "m1".into(),
        }
    }

    fn hello() -> Vec<ChatMessage> {
        vec![ChatMessage::new(Role::User, "hi")]
    }

    #[tokio::test]
    async fn custom_429_short_circuits_after_in_place_retries() {
        let mut server = Server::new_async().await;
        let first = server
            .mock("POST", "/v1/chat/completions")
            .with_status(429)
            .with_header("retry-after", "7")
            .with_body("slow down")
            .expect(2)
            .create_async()
            .await;
        let second = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":"never"}}]}"#)
            .expect(0)
            .create_async()
            .await;

        let err = client()
            .complete(&custom(&server.url()), &hello())
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn custom_404_falls_through_to_second_path() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":"from path two"}}]}"#)
            .create_async()
            .await;

        let done = client()
            .complete(&custom(&server.url()), &hello())
            .await
            .unwrap();
        assert_eq!(done.text, "from path two");
        assert_eq!(done.path, "/chat/completions");
    }

    #[tokio::test]
    async fn custom_all_404_reports_every_path() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let base = server.url();
        let expected = EndpointDiscovery::new(&base, CHAT_CANDIDATES).unwrap().urls();
        let err = client().complete(&custom(&base), &hello()).await.unwrap_err();
        match err {
            GatewayError::AllPathsFailed {
                attempted, hint, ..
            } => {
                assert_eq!(attempted, expected);
                assert_eq!(hint, DiscoveryHint::BaseAddressWrong);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn custom_empty_content_keeps_searching() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":""}}]}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(r#"{"response":"fallback envelope"}"#)
            .create_async()
            .await;

        let done = client()
            .complete(&custom(&server.url()), &hello())
            .await
            .unwrap();
        assert_eq!(done.text, "fallback envelope");
    }

    #[tokio::test]
    async fn named_provider_auth_failure_is_immediate() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(401)
            .with_body(r#"{"error":{"message":"invalid api key"}}"#)
            .expect(1)
            .create_async()
            .await;

        let provider = ProviderConfig {
            provider_kind: ProviderKind::Named(NamedProvider::OpenAi),
            base_address: Some(format!("{}/v1", server.url())),
            credential: "sk-bad".into(),
            model_id: "gpt-4o".into(),
        };
        let err = client().complete(&provider, &hello()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Auth { status: 401, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn claude_round_trip_hoists_system() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "sk-test")
            .match_body(Matcher::PartialJson(serde_json::json!({"system": "be brief"})))
            .with_status(200)
            .with_body(r#"{"content":[{"type":"text","text":"<STATUS>sleepy</STATUS>ok"}]}"#)
            .create_async()
            .await;

        let provider = ProviderConfig {
            provider_kind: ProviderKind::Claude,
            base_address: Some(server.url()),
            credential: "sk-test".into(),
            model_id: "claude-3-5-sonnet".into(),
        };
        let messages = vec![
            ChatMessage::new(Role::System, "be brief"),
            ChatMessage::new(Role::User, "hello"),
        ];
        let (result, completion) = client().chat(&provider, &messages).await.unwrap();
        assert_eq!(completion.path, "/v1/messages");
        assert_eq!(result.clean_text, "ok");
        assert_eq!(result.extracted.status.as_deref(), Some("sleepy"));
    }

    #[tokio::test]
    async fn custom_model_listing_uses_discovery() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v1/models")
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("GET", "/models")
            .with_status(200)
            .with_body(r#"{"data":[{"id":"qwen-max","owned_by":"acme"}]}"#)
            .create_async()
            .await;

        let models = client().list_models(&custom(&server.url())).await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "qwen-max");
        assert_eq!(models[0].description, "acme");
    }

    fn gemini(base: &str, credential: &str) -> ProviderConfig {
        ProviderConfig {
            provider_kind: ProviderKind::Gemini,
            base_address: Some(base.to_string()),
            credential: credential.into(),
            model_id: "gemini-pro".into(),
        }
    }

    #[tokio::test]
    async fn gemini_key_travels_in_header_not_url() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1beta/models/gemini-pro:generateContent")
            .match_header("x-goog-api-key", "gk-test")
            .with_status(200)
            .with_body(r#"{"candidates":[{"content":{"parts":[{"text":"hey"}]}}]}"#)
            .create_async()
            .await;

        let completion = client()
            .complete(&gemini(&server.url(), "gk-test"), &hello())
            .await
            .unwrap();
        assert_eq!(completion.text, "hey");
        assert!(!completion.url.contains("gk-test"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unreachable_gemini_error_does_not_leak_credential() {
        let provider = gemini("http://127.0.0.1:9", "SECRET-KEY-123");
        let err = client().complete(&provider, &hello()).await.unwrap_err();
        assert!(!err.to_string().contains("SECRET-KEY-123"), "{err}");
        assert!(!format!("{err:?}").contains("SECRET-KEY-123"));
    }

    #[test]
    fn gemini_base_gets_version_segment() {
        assert_eq!(
            normalize_gemini_base("https://generativelanguage.googleapis.com/"),
            "https://generativelanguage.googleapis.com/v1beta"
        );
        assert_eq!(normalize_gemini_base("https://proxy/v1"), "https://proxy/v1");
    }

    #[tokio::test]
    async fn custom_without_base_is_invalid() {
        let provider = ProviderConfig {
            base_address: None,
            ..custom("http://unused")
        };
        let err = client().complete(&provider, &hello()).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }
}
