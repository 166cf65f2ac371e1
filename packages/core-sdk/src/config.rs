use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::music::DEFAULT_FREE_FEE_CODES;
use crate::retry::RetryPolicy;

/**
 * \brief 网关运行配置，启动时从环境变量读取，之后只读。
 */
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub addr: String,
    pub db_path: String,
    pub chat_retry: RetryPolicy,
    /** \brief 单次上游调用超时 */
    pub request_timeout: Duration,
    /** \brief `/chat` 整体软截止时间 */
    pub chat_deadline: Duration,
    /** \brief 上游未给出 Retry-After 时建议的退避 */
    pub overload_backoff: Duration,
    pub max_output_tokens: u32,
    pub music: MusicConfig,
    pub health_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct MusicConfig {
    /** \brief 按优先级排列的镜像地址 */
    pub mirrors: Vec<String>,
    pub search_timeout: Duration,
    pub probe_timeout: Duration,
    pub probe_batch: usize,
    /** \brief 单次校验最多探测的曲目数，与目标数量无关 */
    pub probe_budget: usize,
    pub free_fee_codes: Vec<i64>,
    pub url_safety_buffer: Duration,
    pub url_refresh_window: Duration,
}

impl Default for MusicConfig {
    fn default() -> Self {
        Self {
            mirrors: Vec::new(),
            search_timeout: Duration::from_secs(8),
            probe_timeout: Duration::from_millis(3000),
            probe_batch: 8,
            probe_budget: 40,
            free_fee_codes: DEFAULT_FREE_FEE_CODES.to_vec(),
            url_safety_buffer: Duration::from_secs(120),
            url_refresh_window: Duration::from_secs(60),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8787".to_string(),
            db_path: "murmur.db".to_string(),
            chat_retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(60),
            chat_deadline: Duration::from_secs(180),
            overload_backoff: Duration::from_secs(5),
            max_output_tokens: 2048,
            music: MusicConfig::default(),
            health_timeout: Duration::from_secs(5),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let music_defaults = MusicConfig::default();

        let mirrors = env::var("MURMUR_MUSIC_MIRRORS")
            .map(|raw| split_list(&raw))
            .unwrap_or_default();
        if mirrors.is_empty() {
            tracing::warn!(
                target: "murmur.config",
                "MURMUR_MUSIC_MIRRORS not set, music endpoints unavailable"
            );
        }

        let free_fee_codes = match env::var("MURMUR_FREE_FEE_TIERS") {
            Ok(raw) => {
                let parsed: Vec<i64> = split_list(&raw)
                    .iter()
                    .filter_map(|s| s.parse().ok())
                    .collect();
                if parsed.is_empty() {
                    tracing::warn!(target: "murmur.config", "MURMUR_FREE_FEE_TIERS unparseable, using defaults");
                    music_defaults.free_fee_codes.clone()
                } else {
                    parsed
                }
            }
            Err(_) => music_defaults.free_fee_codes.clone(),
        };

        let retry_statuses = env::var("MURMUR_RETRY_STATUSES")
            .ok()
            .map(|raw| {
                split_list(&raw)
                    .iter()
                    .filter_map(|s| s.parse::<u16>().ok())
                    .collect::<Vec<_>>()
            })
            .filter(|codes| !codes.is_empty())
            .unwrap_or_else(|| defaults.chat_retry.retryable_statuses.clone());

        Self {
            addr: env::var("MURMUR_ADDR").unwrap_or(defaults.addr),
            db_path: env::var("MURMUR_DB").unwrap_or(defaults.db_path),
            chat_retry: RetryPolicy {
                max_retries: env_parse("MURMUR_CHAT_MAX_RETRIES", defaults.chat_retry.max_retries),
                initial_delay: Duration::from_millis(env_parse(
                    "MURMUR_CHAT_INITIAL_DELAY_MS",
                    defaults.chat_retry.initial_delay.as_millis() as u64,
                )),
                retryable_statuses: retry_statuses,
            },
            request_timeout: secs("MURMUR_REQUEST_TIMEOUT_SECS", defaults.request_timeout),
            chat_deadline: secs("MURMUR_CHAT_DEADLINE_SECS", defaults.chat_deadline),
            overload_backoff: secs("MURMUR_OVERLOAD_BACKOFF_SECS", defaults.overload_backoff),
            max_output_tokens: env_parse("MURMUR_MAX_OUTPUT_TOKENS", defaults.max_output_tokens),
            music: MusicConfig {
                mirrors,
                search_timeout: secs(
                    "MURMUR_MUSIC_SEARCH_TIMEOUT_SECS",
                    music_defaults.search_timeout,
                ),
                probe_timeout: Duration::from_millis(env_parse(
                    "MURMUR_PROBE_TIMEOUT_MS",
                    music_defaults.probe_timeout.as_millis() as u64,
                )),
                probe_batch: env_parse("MURMUR_PROBE_BATCH", music_defaults.probe_batch).max(1),
                probe_budget: env_parse("MURMUR_PROBE_BUDGET", music_defaults.probe_budget),
                free_fee_codes,
                url_safety_buffer: secs("MURMUR_URL_SAFETY_SECS", music_defaults.url_safety_buffer),
                url_refresh_window: secs(
                    "MURMUR_URL_REFRESH_SECS",
                    music_defaults.url_refresh_window,
                ),
            },
            health_timeout: secs("MURMUR_HEALTH_TIMEOUT_SECS", defaults.health_timeout),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(target: "murmur.config", "{key}={raw} is not valid, using default");
            default
        }),
        Err(_) => default,
    }
}

fn secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(key, default.as_secs()))
}
