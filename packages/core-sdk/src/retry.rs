use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/**
 * \brief 指数退避重试策略：`initial_delay * 2^attempt`。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    /** \brief 视为瞬时过载、原地重试的状态码 */
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            retryable_statuses: vec![429],
        }
    }
}

/**
 * \brief 可被重试执行器检查状态码的响应。
 */
pub trait StatusReply: Sized + Send {
    fn status_code(&self) -> u16;

    /** \brief 消费响应体用于诊断日志。 */
    fn into_diagnostic(self) -> impl Future<Output = String> + Send;
}

impl StatusReply for reqwest::Response {
    fn status_code(&self) -> u16 {
        self.status().as_u16()
    }

    async fn into_diagnostic(self) -> String {
        self.text().await.unwrap_or_default()
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor)
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    /**
     * \brief 执行一次出站调用并按策略重试。
     * \details 命中可重试状态码或传输层错误时退避后原样重发；
     *          重试耗尽后返回最后一次响应（由调用方判定成败），或返回最后一次传输错误。
     *          `send` 每次调用都必须构造同一个请求，且自带超时。
     */
    pub async fn execute<F, Fut, R, E>(&self, mut send: F) -> Result<R, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        R: StatusReply,
        E: Display,
    {
        let mut attempt: u32 = 0;
        loop {
            match send().await {
                Ok(reply) => {
                    let status = reply.status_code();
                    if !self.is_retryable_status(status) || attempt >= self.max_retries {
                        return Ok(reply);
                    }
                    let delay = self.backoff(attempt);
                    let body = reply.into_diagnostic().await;
                    tracing::warn!(
                        target: "murmur.retry",
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        status,
                        delay_ms = delay.as_millis() as u64,
                        body = %truncate(&body, 300),
                        "retryable status, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if attempt >= self.max_retries {
                        return Err(err);
                    }
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        target: "murmur.retry",
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "transport error: {err}, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
            attempt += 1;
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
