use std::future::Future;
use std::time::Duration;

use url::Url;

use crate::codec::ExpectedShape;
use crate::error::{DiscoveryHint, GatewayError};

/**
 * \brief 一个候选端点：路径后缀及其期望的协议形态。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub suffix: &'static str,
    pub shape: ExpectedShape,
}

const fn chat(suffix: &'static str) -> Candidate {
    Candidate {
        suffix,
        shape: ExpectedShape::ChatCompletions,
    }
}

/// Chat endpoints tried, in order, for a custom OpenAI-compatible base address.
pub const CHAT_CANDIDATES: &[Candidate] = &[
    chat("/v1/chat/completions"),
    chat("/chat/completions"),
    chat("/api/v1/chat/completions"),
    chat("/openai/v1/chat/completions"),
    Candidate {
        suffix: "/v1/responses",
        shape: ExpectedShape::Responses,
    },
    chat(""),
    chat("/"),
];

pub const MODEL_CANDIDATES: &[Candidate] = &[chat("/v1/models"), chat("/models")];

/**
 * \brief 合并根地址与路径后缀。
 * \details 若后缀开头的若干段与根地址路径末尾重复（如根地址以 `/v1` 结尾、后缀以 `/v1/` 开头），
 *          去掉重叠部分再拼接；空后缀返回根地址本身，`/` 返回带尾斜杠的根地址。查询串保留。
 */
pub fn merge_url(base: &str, suffix: &str) -> Result<String, GatewayError> {
    let mut url = Url::parse(base.trim())
        .map_err(|e| GatewayError::InvalidRequest(format!("invalid base address {base}: {e}")))?;
    if url.cannot_be_a_base() {
        return Err(GatewayError::InvalidRequest(format!(
            "base address is not a hierarchical URL: {base}"
        )));
    }

    let base_segments: Vec<String> = url
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let suffix_segments: Vec<&str> = suffix.split('/').filter(|s| !s.is_empty()).collect();

    let max_overlap = base_segments.len().min(suffix_segments.len());
    let overlap = (1..=max_overlap)
        .rev()
        .find(|&k| {
            base_segments[base_segments.len() - k..]
                .iter()
                .zip(&suffix_segments[..k])
                .all(|(a, b)| a == b)
        })
        .unwrap_or(0);

    let mut segments: Vec<&str> = base_segments.iter().map(String::as_str).collect();
    segments.extend_from_slice(&suffix_segments[overlap..]);

    let mut path = format!("/{}", segments.join("/"));
    if suffix.ends_with('/') && !path.ends_with('/') {
        path.push('/');
    }
    url.set_path(&path);
    Ok(url.to_string())
}

/**
 * \brief 单个候选端点的尝试结果。
 */
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    Success(T),
    /** \brief 429/503：过载信号，不是路径错误，立即停止探测。 */
    Overloaded { status: u16, retry_after: Duration },
    /** \brief 非 2xx、空响应或无法解码：记录后继续下一个候选。 */
    Failed { status: Option<u16>, message: String },
    /** \brief 网络层失败（DNS、超时等），同样继续下一个候选。 */
    Unreachable(String),
}

#[derive(Debug)]
pub struct Discovered<T> {
    pub value: T,
    pub candidate: Candidate,
    pub url: String,
}

#[derive(Debug)]
struct Failure {
    status: Option<u16>,
    unreachable: bool,
    message: String,
}

/**
 * \brief 针对路径未知的 OpenAI 兼容服务，按顺序逐个尝试候选端点。
 */
#[derive(Debug, Clone)]
pub struct EndpointDiscovery {
    attempts: Vec<(Candidate, String)>,
}

impl EndpointDiscovery {
    pub fn new(base: &str, candidates: &[Candidate]) -> Result<Self, GatewayError> {
        let mut attempts: Vec<(Candidate, String)> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let url = merge_url(base, candidate.suffix)?;
            if attempts.iter().any(|(_, seen)| *seen == url) {
                continue;
            }
            attempts.push((*candidate, url));
        }
        Ok(Self { attempts })
    }

    /** \brief 去重后的待尝试地址（按尝试顺序）。 */
    pub fn urls(&self) -> Vec<String> {
        self.attempts.iter().map(|(_, url)| url.clone()).collect()
    }

    /**
     * \brief 顺序尝试候选端点。
     * \details 成功即返回；429/503 立即以可重试错误返回；其余失败记录并继续；
     *          全部失败时返回列出所有已尝试路径的聚合错误。
     */
    pub async fn run<T, F, Fut>(&self, mut try_candidate: F) -> Result<Discovered<T>, GatewayError>
    where
        F: FnMut(Candidate, String) -> Fut,
        Fut: Future<Output = AttemptOutcome<T>>,
    {
        let mut attempted = Vec::with_capacity(self.attempts.len());
        let mut failures: Vec<Failure> = Vec::new();

        for (candidate, url) in &self.attempts {
            tracing::debug!(target: "murmur.discovery", %url, "trying candidate");
            attempted.push(url.clone());

            match try_candidate(*candidate, url.clone()).await {
                AttemptOutcome::Success(value) => {
                    tracing::info!(
                        target: "murmur.discovery",
                        %url,
                        path = candidate.suffix,
                        tried = attempted.len(),
                        "endpoint resolved"
                    );
                    return Ok(Discovered {
                        value,
                        candidate: *candidate,
                        url: url.clone(),
                    });
                }
                AttemptOutcome::Overloaded {
                    status,
                    retry_after,
                } => {
                    tracing::warn!(
                        target: "murmur.discovery",
                        %url,
                        status,
                        "upstream overloaded, not trying further paths"
                    );
                    return Err(GatewayError::Overloaded {
                        status,
                        retry_after,
                        url: url.clone(),
                    });
                }
                AttemptOutcome::Failed { status, message } => {
                    tracing::info!(target: "murmur.discovery", %url, ?status, "candidate failed: {message}");
                    failures.push(Failure {
                        status,
                        unreachable: false,
                        message,
                    });
                }
                AttemptOutcome::Unreachable(message) => {
                    tracing::info!(target: "murmur.discovery", %url, "candidate unreachable: {message}");
                    failures.push(Failure {
                        status: None,
                        unreachable: true,
                        message,
                    });
                }
            }
        }

        let hint = derive_hint(&failures);
        let last_error = failures
            .last()
            .map(|f| match f.status {
                Some(status) => format!("HTTP {status}: {}", f.message),
                None => f.message.clone(),
            })
            .unwrap_or_else(|| "no candidate paths".to_string());
        tracing::error!(
            target: "murmur.discovery",
            tried = attempted.len(),
            ?hint,
            "all candidate paths failed"
        );
        Err(GatewayError::AllPathsFailed {
            attempted,
            last_error,
            hint,
        })
    }
}

const CREDENTIAL_MARKERS: &[&str] = &[
    "no available",
    "credential",
    "api key",
    "api_key",
    "apikey",
    "invalid token",
    "quota",
    "balance",
    "insufficient",
    "unauthorized",
    "余额",
    "令牌",
    "无可用渠道",
];

fn derive_hint(failures: &[Failure]) -> DiscoveryHint {
    if failures.is_empty() {
        return DiscoveryHint::Unknown;
    }
    let credential_issue = failures.iter().any(|f| {
        matches!(f.status, Some(401 | 403)) || {
            let lowered = f.message.to_lowercase();
            CREDENTIAL_MARKERS.iter().any(|m| lowered.contains(m))
        }
    });
    if credential_issue {
        DiscoveryHint::CredentialOrBalance
    } else if failures
        .iter()
        .all(|f| matches!(f.status, Some(404 | 405)))
    {
        DiscoveryHint::BaseAddressWrong
    } else if failures
        .iter()
        .all(|f| f.unreachable || f.status.is_some_and(|s| s >= 500))
    {
        DiscoveryHint::ServerOutage
    } else {
        DiscoveryHint::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn merge_strips_restated_version_segment() {
        assert_eq!(
            merge_url("https://h/api/v1", "/v1/chat/completions").unwrap(),
            "https://h/api/v1/chat/completions"
        );
    }

    #[test]
    fn merge_handles_trailing_slash_and_full_endpoint_bases() {
        assert_eq!(
            merge_url("https://h/api/v1/", "/chat/completions").unwrap(),
            "https://h/api/v1/chat/completions"
        );
        assert_eq!(
            merge_url("https://h/v1/chat/completions", "/v1/chat/completions").unwrap(),
            "https://h/v1/chat/completions"
        );
        assert_eq!(
            merge_url("https://h", "/v1/chat/completions").unwrap(),
            "https://h/v1/chat/completions"
        );
    }

    #[test]
    fn merge_empty_and_root_suffixes() {
        assert_eq!(merge_url("https://h/gw", "").unwrap(), "https://h/gw");
        assert_eq!(merge_url("https://h/gw", "/").unwrap(), "https://h/gw/");
        assert_eq!(
            merge_url("https://h/gw?tenant=a", "/v1/models").unwrap(),
            "https://h/gw/v1/models?tenant=a"
        );
    }

    #[test]
    fn merge_rejects_garbage_base() {
        assert!(matches!(
            merge_url("not a url", "/v1"),
            Err(GatewayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn attempts_skip_candidates_that_merge_to_the_same_url() {
        let discovery = EndpointDiscovery::new("https://h/v1", CHAT_CANDIDATES).unwrap();
        let urls = discovery.urls();
        assert_eq!(urls[0], "https://h/v1/chat/completions");
        let mut deduped = urls.clone();
        deduped.dedup();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), urls.len());
        // "/v1/chat/completions" and "/chat/completions" collapse onto one URL here
        assert!(urls.len() < CHAT_CANDIDATES.len());
    }

    #[tokio::test]
    async fn overload_on_first_path_stops_the_loop() {
        let discovery = EndpointDiscovery::new("https://h", CHAT_CANDIDATES).unwrap();
        let calls = RefCell::new(Vec::new());

        let err = discovery
            .run(|_, url| {
                calls.borrow_mut().push(url);
                async {
                    AttemptOutcome::<String>::Overloaded {
                        status: 429,
                        retry_after: Duration::from_secs(3),
                    }
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.borrow().len(), 1);
        assert!(err.is_retryable());
        assert!(matches!(err, GatewayError::Overloaded { status: 429, .. }));
    }

    #[tokio::test]
    async fn not_found_falls_through_to_next_path() {
        let discovery = EndpointDiscovery::new("https://h", CHAT_CANDIDATES).unwrap();
        let found = discovery
            .run(|candidate, _| async move {
                if candidate.suffix == "/chat/completions" {
                    AttemptOutcome::Success("hello".to_string())
                } else {
                    AttemptOutcome::Failed {
                        status: Some(404),
                        message: "not found".into(),
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(found.value, "hello");
        assert_eq!(found.candidate.suffix, "/chat/completions");
        assert_eq!(found.url, "https://h/chat/completions");
    }

    #[tokio::test]
    async fn exhaustion_lists_every_path_once_in_order() {
        let discovery = EndpointDiscovery::new("https://h/api", CHAT_CANDIDATES).unwrap();
        let expected = discovery.urls();

        let err = discovery
            .run(|_, _| async {
                AttemptOutcome::<String>::Failed {
                    status: Some(404),
                    message: "not found".into(),
                }
            })
            .await
            .unwrap_err();

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

    #[test]
    fn hint_prefers_credential_signals() {
        let failures = vec![
            Failure {
                status: Some(404),
                unreachable: false,
                message: "not found".into(),
            },
            Failure {
                status: Some(500),
                unreachable: false,
                message: "No available channel for model gpt-4o".into(),
            },
        ];
        assert_eq!(derive_hint(&failures), DiscoveryHint::CredentialOrBalance);

        let outage = vec![
            Failure {
                status: None,
                unreachable: true,
                message: "dns error".into(),
            },
            Failure {
                status: Some(502),
                unreachable: false,
                message: "bad gateway".into(),
            },
        ];
        assert_eq!(derive_hint(&outage), DiscoveryHint::ServerOutage);
    }
}
